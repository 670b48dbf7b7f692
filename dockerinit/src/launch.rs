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

use crate::config::{InitConfig, RPC_SOCKET_PATH, SOCKET_DIR};
use crate::console::{self, ChildStdio};
use crate::error::InitError;
use crate::reaper;
use crate::rpc;
use crate::supervisor::{ResumeGate, State, Supervisor, RESUME_TIMEOUT_APP};

use anyhow::anyhow;
use linux::user::Credential;
use linux::InitCommandExt;
use nix::unistd::Pid;
use rpcfd::service::Service;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Honor a recorded `PATH` before any lookup, then resolve argv[0]; when that
/// fails and a working directory was given, retry relative to it.
pub fn resolve_executable(config: &InitConfig) -> Result<PathBuf, InitError> {
    if let Some(path) = config.env_value("PATH") {
        std::env::set_var("PATH", path);
    }
    let arg0 = config.args[0].as_str();
    if let Some(found) = search_path(arg0) {
        return Ok(found);
    }
    if let Some(workdir) = &config.workdir {
        let joined = workdir.join(arg0);
        if let Some(found) = search_path(&joined.to_string_lossy()) {
            return Ok(found);
        }
    }
    Err(InitError::Lookup(arg0.to_string()))
}

fn search_path(spec: &str) -> Option<PathBuf> {
    if spec.contains('/') {
        let path = PathBuf::from(spec);
        return is_executable(&path).then_some(path);
    }
    let paths = std::env::var("PATH").unwrap_or_default();
    paths
        .split(':')
        .filter(|dir| !dir.is_empty())
        .map(|dir| Path::new(dir).join(spec))
        .find(|candidate| is_executable(candidate))
}

fn is_executable(path: &Path) -> bool {
    path.metadata()
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

/// Hostname, addresses, routes, device access and the capability mask, in
/// that order, all before the workload exists. Each of these mutates global
/// process or namespace state exactly once.
pub fn apply_container_settings(config: &InitConfig) -> Result<(), InitError> {
    // stale pivot directory some runtimes leave behind
    let _ = std::fs::remove_dir("/.oldroot");

    if let Some(hostname) = config.env_value("HOSTNAME") {
        if !hostname.is_empty() {
            linux::proc::set_hostname(hostname).map_err(|err| {
                InitError::Setup(anyhow!("unable to set hostname {hostname}: {err}"))
            })?;
        }
    }

    if let Some(address) = &config.address {
        let net = |err: linux::net::NetlinkError| {
            InitError::Setup(anyhow!("unable to set up networking: {err}"))
        };
        linux::net::add_address("eth0", address).map_err(net)?;
        linux::net::set_mtu("eth0", config.mtu).map_err(net)?;
        linux::net::link_up("eth0").map_err(net)?;
        linux::net::link_up("lo").map_err(net)?;
    }
    if let Some(gateway) = config.gateway {
        linux::net::add_default_route(gateway).map_err(|err| {
            InitError::Setup(anyhow!("unable to install the default route: {err}"))
        })?;
    }

    if config.privileged {
        linux::cgroup::allow_all_devices()
            .map_err(|err| InitError::Setup(anyhow!("unable to widen device access: {err}")))?;
    } else {
        linux::capability::drop_dangerous()
            .map_err(|err| InitError::Setup(anyhow!("unable to drop capabilities: {err}")))?;
    }
    Ok(())
}

pub fn resolve_credential(config: &InitConfig) -> Result<Option<Credential>, InitError> {
    match &config.user {
        Some(user) => linux::user::lookup(user)
            .map(Some)
            .map_err(|err| InitError::Setup(anyhow!("{err}"))),
        None => Ok(None),
    }
}

/// Everything that can be prepared before the peer attaches: the resolved
/// executable and the console wiring. Failures are deferred so the peer
/// still observes them through the state machine.
fn prepare(config: &InitConfig, supervisor: &Supervisor) -> Result<(PathBuf, ChildStdio), InitError> {
    let path = resolve_executable(config)?;
    let (console, child) = console::wire(config.tty, config.open_stdin)
        .map_err(|err| InitError::Console(std::io::Error::from(err)))?;
    supervisor.install_console(console);
    Ok((path, child))
}

fn start_child(
    config: &InitConfig,
    path: &Path,
    stdio: &ChildStdio,
    credential: Option<Credential>,
) -> Result<Pid, InitError> {
    let mut command = Command::new(path);
    command.args(&config.args[1..]).env_clear();
    for entry in config.env.iter() {
        if let Some((key, value)) = entry.split_once('=') {
            command.env(key, value);
        }
    }
    if let Some(workdir) = &config.workdir {
        command.current_dir(workdir);
    }
    // the workload runs in its own session; with an open-stdin tty the
    // replica becomes that session's controlling terminal
    command.session();
    if let Some(fd) = stdio.controlling {
        command.controlling_tty(fd);
    }
    command.stdio_fds(stdio.stdin, stdio.stdout, stdio.stderr);
    if let Some(credential) = credential {
        command.credential(credential.uid, credential.gid);
    }

    let child = command
        .spawn()
        .map_err(|err| InitError::Spawn(config.args[0].clone(), err))?;
    stdio.close_child_side();
    Ok(Pid::from_raw(child.id() as i32))
}

/// App-container mode: we are pid 1, the workload is our direct child, and
/// its exit code is the container's exit code.
pub async fn run_app(config: &InitConfig) -> Result<i32, InitError> {
    let (supervisor, mut gate) = Supervisor::new().map_err(InitError::Channel)?;

    let prepared = prepare(config, &supervisor);

    let mut service =
        Service::bind(RPC_SOCKET_PATH, supervisor.clone()).map_err(InitError::Channel)?;
    rpc::register(&mut service);
    tokio::spawn(async move {
        if let Err(err) = service.serve().await {
            error!("control channel failed: {err}");
        }
    });

    // the peer grabs console descriptors before anything runs
    gate.wait(RESUME_TIMEOUT_APP, "Resume()").await?;
    if let Err(err) = linux::proc::detach_mount(SOCKET_DIR) {
        warn!("cannot detach {SOCKET_DIR}: {err}");
    }

    let launched = match prepared {
        Ok((path, stdio)) => apply_container_settings(config)
            .and_then(|()| resolve_credential(config))
            .and_then(|credential| start_child(config, &path, &stdio, credential)),
        Err(err) => Err(err),
    };

    let pid = match launched {
        Ok(pid) => pid,
        Err(err) => return surface_failure(&supervisor, &mut gate, RESUME_TIMEOUT_APP, err).await,
    };
    supervisor.publish_process(pid);
    supervisor.transition(State::Running);
    info!("workload started as pid {pid}");
    reaper::spawn(supervisor.clone(), pid)
        .map_err(|err| InitError::Setup(anyhow!("cannot arm the signal handlers: {err}")))?;

    let status = supervisor.state_reached(State::Exited).await;
    // let the peer collect the exit code before we vanish
    gate.wait(RESUME_TIMEOUT_APP, "Resume()").await?;
    Ok(status.exit_code)
}

/// Launch failed: report it through the state machine, give the peer one
/// resume window to acknowledge, and die with the failure sentinel.
pub async fn surface_failure(
    supervisor: &Arc<Supervisor>,
    gate: &mut ResumeGate,
    ack_window: std::time::Duration,
    err: InitError,
) -> Result<i32, InitError> {
    error!("{err}");
    supervisor.fail(err.to_string());
    let _ = gate.wait(ack_window, "Resume()").await;
    supervisor.transition(State::Dead);
    Ok(-1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Mode;
    use std::os::unix::fs::OpenOptionsExt;
    use std::sync::Mutex;

    // resolve_executable installs the recorded PATH into the process
    // environment; tests touching it must not interleave
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn config_with(env: Vec<String>, args: Vec<String>, workdir: Option<PathBuf>) -> InitConfig {
        InitConfig {
            user: None,
            gateway: None,
            address: None,
            workdir,
            privileged: false,
            tty: false,
            open_stdin: false,
            mtu: 1500,
            env,
            args,
            raw_args: vec![],
            mode: Mode::App,
        }
    }

    fn fake_tool(dir: &Path, name: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .mode(0o755)
            .open(&path)
            .unwrap();
        path
    }

    #[test]
    fn resolves_from_recorded_path() {
        let _guard = ENV_LOCK.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let tool = fake_tool(dir.path(), "tool");
        let config = config_with(
            vec![format!("PATH={}", dir.path().display())],
            vec!["tool".to_string()],
            None,
        );
        assert_eq!(resolve_executable(&config).unwrap(), tool);
    }

    #[test]
    fn resolves_relative_to_workdir() {
        let _guard = ENV_LOCK.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        fake_tool(dir.path(), "job");
        let config = config_with(
            vec!["PATH=/nonexistent-path-entry".to_string()],
            vec!["job".to_string()],
            Some(dir.path().to_path_buf()),
        );
        let found = resolve_executable(&config).unwrap();
        assert_eq!(found, dir.path().join("job"));
    }

    #[test]
    fn missing_executable_mentions_lookup() {
        let _guard = ENV_LOCK.lock().unwrap();
        let config = config_with(
            vec!["PATH=/nonexistent-path-entry".to_string()],
            vec!["/does/not/exist".to_string()],
            None,
        );
        let err = resolve_executable(&config).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("lookup"));
        assert!(message.contains("/does/not/exist"));
    }

    #[test]
    fn non_executable_files_are_skipped() {
        let _guard = ENV_LOCK.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data");
        std::fs::write(&path, b"not a program").unwrap();
        let config = config_with(
            vec![format!("PATH={}", dir.path().display())],
            vec!["data".to_string()],
            None,
        );
        assert!(resolve_executable(&config).is_err());
    }
}
