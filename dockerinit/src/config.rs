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

use anyhow::Context;
use clap::Parser;
use linux::net::Cidr;
use std::ffi::OsString;
use std::net::Ipv4Addr;
use std::os::fd::RawFd;
use std::path::{Path, PathBuf};

/// Bind-mounted from the host; detached from the namespace after the initial
/// handshake so the workload cannot impersonate the supervisor.
pub const SOCKET_DIR: &str = "/.dockersocket";
pub const RPC_SOCKET_PATH: &str = "/.dockersocket/rpc.sock";

/// Environment recorded by the daemon at container creation.
pub const ENV_FILE: &str = "/.dockerenv";

/// Descriptor number the machine-container parent leaves the pty primary on
/// for the re-exec'd helper.
pub const CONSOLE_FD: RawFd = 3;

/// The daemon drives us with Go-style single-dash long flags; clap wants two
/// dashes. Everything after `--` belongs to the workload and is left alone.
pub fn normalize_go_flags(argv: &[OsString]) -> Vec<OsString> {
    const LONG_FLAGS: [&str; 5] = ["privileged", "tty", "stdin", "mtu", "child"];

    let mut out = Vec::with_capacity(argv.len());
    let mut passthrough = false;
    for (position, arg) in argv.iter().enumerate() {
        if position == 0 || passthrough {
            out.push(arg.clone());
            continue;
        }
        if arg == "--" {
            passthrough = true;
            out.push(arg.clone());
            continue;
        }
        let text = arg.to_string_lossy();
        let mapped = LONG_FLAGS.iter().find_map(|flag| {
            if *text == format!("-{flag}") || text.starts_with(&format!("-{flag}=")) {
                Some(OsString::from(format!("-{text}")))
            } else {
                None
            }
        });
        out.push(mapped.unwrap_or_else(|| arg.clone()));
    }
    out
}

#[derive(Parser, Debug)]
#[command(name = "dockerinit")]
pub struct Cli {
    /// username or uid
    #[arg(short = 'u', value_name = "USER")]
    pub user: Option<String>,
    /// gateway address
    #[arg(short = 'g', value_name = "GATEWAY")]
    pub gateway: Option<String>,
    /// ip address in CIDR form
    #[arg(short = 'i', value_name = "IP/CIDR")]
    pub ip: Option<String>,
    /// initial working directory
    #[arg(short = 'w', value_name = "DIR")]
    pub workdir: Option<String>,
    /// privileged mode
    #[arg(long)]
    pub privileged: bool,
    /// use a pseudo-tty for the console
    #[arg(long)]
    pub tty: bool,
    /// keep stdin open
    #[arg(long = "stdin")]
    pub open_stdin: bool,
    /// interface mtu
    #[arg(long, default_value_t = 1500)]
    pub mtu: u32,
    /// run as the machine-container helper
    #[arg(long)]
    pub child: bool,
    /// the workload command
    #[arg(last = true, required = true)]
    pub args: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    App,
    MachineParent,
    MachineChild,
}

/// Everything the supervisor needs to know, immutable once built.
#[derive(Debug)]
pub struct InitConfig {
    pub user: Option<String>,
    pub gateway: Option<Ipv4Addr>,
    pub address: Option<Cidr>,
    pub workdir: Option<PathBuf>,
    pub privileged: bool,
    pub tty: bool,
    pub open_stdin: bool,
    pub mtu: u32,
    pub env: Vec<String>,
    pub args: Vec<String>,
    /// argv as invoked (without argv[0]); the machine parent re-execs the
    /// helper with these.
    pub raw_args: Vec<OsString>,
    pub mode: Mode,
}

impl InitConfig {
    pub fn from_cli(
        cli: Cli,
        env: Vec<String>,
        raw_args: Vec<OsString>,
    ) -> anyhow::Result<InitConfig> {
        let gateway = match cli.gateway.as_deref().filter(|s| !s.is_empty()) {
            Some(text) => Some(
                text.parse::<Ipv4Addr>()
                    .ok()
                    .with_context(|| format!("{text} is not a valid gateway IP"))?,
            ),
            None => None,
        };
        let address = match cli.ip.as_deref().filter(|s| !s.is_empty()) {
            Some(text) => Some(text.parse::<Cidr>().context("unable to set up networking")?),
            None => None,
        };
        let mode = select_mode(cli.child, &cli.args);
        Ok(InitConfig {
            user: cli.user.filter(|s| !s.is_empty()),
            gateway,
            address,
            workdir: cli
                .workdir
                .filter(|s| !s.is_empty())
                .map(PathBuf::from),
            privileged: cli.privileged,
            tty: cli.tty,
            open_stdin: cli.open_stdin,
            mtu: cli.mtu,
            env,
            args: cli.args,
            raw_args,
            mode,
        })
    }

    /// First match wins, like the environment the workload will see.
    pub fn env_value(&self, key: &str) -> Option<&str> {
        self.env.iter().find_map(|entry| {
            entry
                .split_once('=')
                .filter(|(name, _)| *name == key)
                .map(|(_, value)| value)
        })
    }
}

fn select_mode(child: bool, args: &[String]) -> Mode {
    if child {
        return Mode::MachineChild;
    }
    let arg0 = args.first().map(String::as_str).unwrap_or_default();
    let base = Path::new(arg0)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    if base == "systemd" || arg0 == "/sbin/init" {
        Mode::MachineParent
    } else {
        Mode::App
    }
}

/// Read the recorded environment and append the runtime's `container`
/// variable, mirroring what the creating plugin exported.
pub fn load_recorded_env(path: &Path) -> anyhow::Result<Vec<String>> {
    let content = std::fs::read(path)
        .with_context(|| format!("cannot read {}", path.display()))?;
    let mut env: Vec<String> =
        serde_json::from_slice(&content).context("malformed environment record")?;
    env.push(format!(
        "container={}",
        std::env::var("container").unwrap_or_default()
    ));
    Ok(env)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn os(args: &[&str]) -> Vec<OsString> {
        args.iter().map(OsString::from).collect()
    }

    #[test]
    fn go_flags_gain_a_dash() {
        let normalized = normalize_go_flags(&os(&[
            "dockerinit",
            "-privileged",
            "-mtu=1400",
            "-u",
            "web",
            "--",
            "/bin/sh",
            "-tty",
        ]));
        assert_eq!(
            normalized,
            os(&[
                "dockerinit",
                "--privileged",
                "--mtu=1400",
                "-u",
                "web",
                "--",
                "/bin/sh",
                "-tty", // workload args are never rewritten
            ])
        );
    }

    #[test]
    fn full_invocation_parses() {
        let argv = os(&[
            "dockerinit", "-i", "10.0.0.2/24", "-g", "10.0.0.1", "-mtu", "1400", "-tty", "-stdin",
            "--", "/bin/sh", "-c", "true",
        ]);
        let cli = Cli::parse_from(normalize_go_flags(&argv));
        let cfg = InitConfig::from_cli(cli, vec![], argv[1..].to_vec()).unwrap();
        assert_eq!(cfg.address.unwrap().to_string(), "10.0.0.2/24");
        assert_eq!(cfg.gateway.unwrap().to_string(), "10.0.0.1");
        assert_eq!(cfg.mtu, 1400);
        assert!(cfg.tty && cfg.open_stdin && !cfg.privileged);
        assert_eq!(cfg.args, vec!["/bin/sh", "-c", "true"]);
        assert_eq!(cfg.mode, Mode::App);
    }

    #[test]
    fn refuses_bare_invocation() {
        assert!(Cli::try_parse_from(["dockerinit"]).is_err());
        assert!(Cli::try_parse_from(["dockerinit", "--tty"]).is_err());
    }

    #[test]
    fn mode_selection() {
        assert_eq!(select_mode(true, &["/sbin/init".to_string()]), Mode::MachineChild);
        assert_eq!(select_mode(false, &["/sbin/init".to_string()]), Mode::MachineParent);
        assert_eq!(
            select_mode(false, &["/usr/lib/systemd/systemd".to_string()]),
            Mode::MachineParent
        );
        assert_eq!(select_mode(false, &["/bin/sh".to_string()]), Mode::App);
    }

    #[test]
    fn env_lookup_first_match_wins() {
        let cfg = InitConfig {
            user: None,
            gateway: None,
            address: None,
            workdir: None,
            privileged: false,
            tty: false,
            open_stdin: false,
            mtu: 1500,
            env: vec![
                "PATH=/usr/bin:/bin".to_string(),
                "HOSTNAME=box".to_string(),
                "HOSTNAME=shadowed".to_string(),
                "EMPTY=".to_string(),
            ],
            args: vec!["/bin/true".to_string()],
            raw_args: vec![],
            mode: Mode::App,
        };
        assert_eq!(cfg.env_value("PATH"), Some("/usr/bin:/bin"));
        assert_eq!(cfg.env_value("HOSTNAME"), Some("box"));
        assert_eq!(cfg.env_value("EMPTY"), Some(""));
        assert_eq!(cfg.env_value("MISSING"), None);
    }

    #[test]
    fn recorded_env_is_loaded_and_extended() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".dockerenv");
        std::fs::write(&path, br#"["PATH=/bin","HOSTNAME=box"]"#).unwrap();
        let env = load_recorded_env(&path).unwrap();
        assert_eq!(env[0], "PATH=/bin");
        assert_eq!(env[1], "HOSTNAME=box");
        assert!(env[2].starts_with("container="));

        assert!(load_recorded_env(&dir.path().join("missing")).is_err());
        std::fs::write(&path, b"not json").unwrap();
        assert!(load_recorded_env(&path).is_err());
    }
}
