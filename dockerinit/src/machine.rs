// Copyright (c) 2023 Yan Ka, Chiu.
// All rights reserved.
//
// Redistribution and use in source and binary forms, with or without
// modification, are permitted provided that the following conditions
// are met:
// 1. Redistributions of source code must retain the above copyright
//    notice, this list of conditions, and the following disclaimer,
//    without modification, immediately at the beginning of the file.
// 2. The name of the author may not be used to endorse or promote products
//    derived from this software without specific prior written permission.
//
// THIS SOFTWARE IS PROVIDED BY THE AUTHOR AND CONTRIBUTORS ``AS IS'' AND
// ANY EXPRESS OR IMPLIED WARRANTIES, INCLUDING, BUT NOT LIMITED TO, THE
// IMPLIED WARRANTIES OF MERCHANTABILITY AND FITNESS FOR A PARTICULAR PURPOSE
// ARE DISCLAIMED. IN NO EVENT SHALL THE AUTHOR OR CONTRIBUTORS BE LIABLE FOR
// ANY DIRECT, INDIRECT, INCIDENTAL, SPECIAL, EXEMPLARY, OR CONSEQUENTIAL
// DAMAGES (INCLUDING, BUT NOT LIMITED TO, PROCUREMENT OF SUBSTITUTE GOODS
// OR SERVICES; LOSS OF USE, DATA, OR PROFITS; OR BUSINESS INTERRUPTION)
// HOWEVER CAUSED AND ON ANY THEORY OF LIABILITY, WHETHER IN CONTRACT, STRICT
// LIABILITY, OR TORT (INCLUDING NEGLIGENCE OR OTHERWISE) ARISING IN ANY WAY
// OUT OF THE USE OF THIS SOFTWARE, EVEN IF ADVISED OF THE POSSIBILITY OF
// SUCH DAMAGE.

//! Machine containers run a real init as pid 1. The launch splits in two:
//! the parent prepares the console and the container settings and finally
//! execs the init; a re-exec'd helper (`-child`) keeps the control channel
//! alive next to it.

use crate::config::{InitConfig, CONSOLE_FD, RPC_SOCKET_PATH, SOCKET_DIR};
use crate::console::Console;
use crate::error::InitError;
use crate::launch;
use crate::rpc;
use crate::supervisor::{State, Supervisor, RESUME_TIMEOUT_MACHINE};

use anyhow::anyhow;
use linux::term::PtyPair;
use linux::InitCommandExt;
use nix::sys::signal::{kill, SigSet, Signal};
use nix::unistd::{dup2, execve, Pid};
use std::convert::Infallible;
use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::process::Command;
use tracing::{error, info, warn};

/// Pid 1 of the typical machine container: the real init replaces us here.
///
/// Sequence: open the console pty, bind its replica over `/dev/console`,
/// apply the container settings, move our stdio onto the replica, start the
/// `-child` helper with the pty primary on descriptor 3, wait for its
/// SIGUSR1, exec the init.
pub fn run_parent(config: &InitConfig) -> Result<Infallible, InitError> {
    let pty = PtyPair::open().map_err(|err| InitError::Console(std::io::Error::from(err)))?;

    linux::proc::bind_mount(&pty.replica_path, "/dev/console").map_err(|err| {
        InitError::Setup(anyhow!("cannot bind the console to /dev/console: {err}"))
    })?;

    launch::apply_container_settings(config)?;

    for target in 0..3 {
        dup2(pty.replica, target)
            .map_err(|err| InitError::Console(std::io::Error::from(err)))?;
    }

    // block SIGUSR1 before the helper exists so its signal cannot be lost
    let mut sigusr1 = SigSet::empty();
    sigusr1.add(Signal::SIGUSR1);
    sigusr1
        .thread_block()
        .map_err(|err| InitError::Setup(anyhow!("cannot block SIGUSR1: {err}")))?;

    let own_exe = std::env::args_os()
        .next()
        .ok_or_else(|| InitError::Setup(anyhow!("argv[0] is missing")))?;
    let mut helper = Command::new(&own_exe);
    helper.arg("-child").args(&config.raw_args);
    // its own session: a TIOCNOTTY from the init must not signal the helper
    helper.session();
    helper.inherit_fd(pty.primary, CONSOLE_FD);
    // credentials apply to the helper as requested, even though it execs
    // nothing on its own
    if let Some(credential) = launch::resolve_credential(config)? {
        helper.credential(credential.uid, credential.gid);
    }
    helper
        .spawn()
        .map_err(|err| InitError::Spawn("dockerinit -child".to_string(), err))?;

    // the helper raises SIGUSR1 once its channel has completed the handshake
    sigusr1
        .wait()
        .map_err(|err| InitError::Setup(anyhow!("cannot wait for the helper: {err}")))?;
    sigusr1
        .thread_unblock()
        .map_err(|err| InitError::Setup(anyhow!("cannot restore the signal mask: {err}")))?;
    info!("helper is ready, handing pid 1 to {}", config.args[0]);

    let path = launch::resolve_executable(config)?;
    let argv = to_cstrings(config.args.iter().map(String::as_str))?;
    let envp = to_cstrings(config.env.iter().map(String::as_str))?;
    let path = CString::new(path.as_os_str().as_bytes())
        .map_err(|_| InitError::Lookup(config.args[0].clone()))?;
    match execve(&path, &argv, &envp) {
        Err(errno) => Err(InitError::Spawn(
            config.args[0].clone(),
            std::io::Error::from(errno),
        )),
        Ok(never) => match never {},
    }
}

/// The long-running helper beside a machine container's init. Pid 1 is its
/// "process"; the pty primary inherited on descriptor 3 is its console.
pub async fn run_child(config: &InitConfig) -> Result<i32, InitError> {
    let (supervisor, mut gate) = Supervisor::new().map_err(InitError::Channel)?;
    supervisor.publish_process(Pid::from_raw(1));
    supervisor.install_console(Console::Pty {
        primary: CONSOLE_FD,
    });

    let mut service =
        rpcfd::service::Service::bind(RPC_SOCKET_PATH, supervisor.clone())
            .map_err(InitError::Channel)?;
    rpc::register(&mut service);
    tokio::spawn(async move {
        if let Err(err) = service.serve().await {
            error!("control channel failed: {err}");
        }
    });

    // console descriptors can be fetched now
    supervisor.transition(State::ConsoleReady);
    gate.wait(RESUME_TIMEOUT_MACHINE, "Resume()").await?;

    supervisor.transition(State::RunReady);
    gate.wait(RESUME_TIMEOUT_MACHINE, "Resume()").await?;

    if !config.open_stdin {
        supervisor.with_console(|console| console.close_stdin());
    }
    if let Err(err) = linux::proc::detach_mount(SOCKET_DIR) {
        warn!("cannot detach {SOCKET_DIR}: {err}");
    }

    // unblock the parent's exec into the real init
    if let Err(errno) = kill(Pid::from_raw(1), Signal::SIGUSR1) {
        let err = InitError::Setup(anyhow!("cannot signal pid 1: {errno}"));
        return launch::surface_failure(&supervisor, &mut gate, RESUME_TIMEOUT_MACHINE, err).await;
    }
    supervisor.transition(State::Running);
    info!("machine container is running");

    // pid 1 owns the container's lifetime; we only keep serving the channel
    let never: Infallible = std::future::pending().await;
    match never {}
}

fn to_cstrings<'a>(values: impl Iterator<Item = &'a str>) -> Result<Vec<CString>, InitError> {
    values
        .map(|value| {
            CString::new(value.as_bytes())
                .map_err(|_| InitError::Setup(anyhow!("embedded NUL in argument or environment")))
        })
        .collect()
}
