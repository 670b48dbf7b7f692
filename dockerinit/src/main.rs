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

//! The in-container init supervisor. Prepares the environment, launches the
//! workload, brokers its console descriptors to the managing daemon over a
//! Unix-socket RPC, reaps orphans, forwards signals, and reports the exit
//! status back.

mod config;
mod console;
mod error;
mod launch;
mod machine;
mod reaper;
mod rpc;
mod supervisor;

use crate::config::{Cli, InitConfig, Mode};
use crate::error::InitError;

use clap::Parser;
use std::ffi::OsString;
use std::future::Future;
use std::path::Path;
use tracing::error;
use tracing_subscriber::EnvFilter;

fn main() {
    std::process::exit(run());
}

fn run() -> i32 {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let argv: Vec<OsString> = std::env::args_os().collect();
    if argv.len() < 2 {
        eprintln!("You should not invoke dockerinit manually");
        return 1;
    }
    let cli = Cli::parse_from(config::normalize_go_flags(&argv));

    let recorded = match config::load_recorded_env(Path::new(config::ENV_FILE)) {
        Ok(env) => env,
        Err(err) => {
            error!("unable to load environment variables: {err:#}");
            return -1;
        }
    };

    let config = match InitConfig::from_cli(cli, recorded, argv[1..].to_vec()) {
        Ok(config) => config,
        Err(err) => {
            error!("{err:#}");
            return -1;
        }
    };

    match config.mode {
        Mode::MachineParent => {
            // only returns on error: success ends in exec
            let err = match machine::run_parent(&config) {
                Err(err) => err,
                Ok(never) => match never {},
            };
            error!("{err}");
            -1
        }
        Mode::MachineChild => drive(machine::run_child(&config)),
        Mode::App => drive(launch::run_app(&config)),
    }
}

/// Runtime shape: the RPC connection, the accept loop and the state waits
/// are tasks; the mode driver runs on the blocked main thread.
fn drive(future: impl Future<Output = Result<i32, InitError>>) -> i32 {
    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_io()
        .enable_time()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            error!("cannot build the runtime: {err}");
            return -1;
        }
    };
    match runtime.block_on(future) {
        Ok(exit_code) => exit_code,
        Err(err) => {
            error!("{err}");
            -1
        }
    }
}
