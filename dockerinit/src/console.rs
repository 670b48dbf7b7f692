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

use linux::term::{close_quietly, PipePair, PtyPair};
use std::os::fd::RawFd;

/// The daemon-facing side of the workload's standard streams. Exactly one
/// shape is active per container; each descriptor has a single owner (this
/// process) until `StdinClose` drops the stdin reference.
#[derive(Debug)]
pub enum Console {
    /// Nothing wired yet.
    Offline,
    /// tty mode: the supervisor keeps the pty primary, the workload runs on
    /// the replica.
    Pty { primary: RawFd },
    /// pipe mode: read ends of the workload's stdout/stderr, and the write
    /// end of its stdin when open-stdin was requested.
    Pipes {
        stdin: Option<RawFd>,
        stdout: RawFd,
        stderr: RawFd,
    },
}

impl Console {
    pub fn pty_primary(&self) -> Option<RawFd> {
        match self {
            Console::Pty { primary } => Some(*primary),
            _ => None,
        }
    }

    pub fn stdin_fd(&self) -> Option<RawFd> {
        match self {
            Console::Pipes { stdin, .. } => *stdin,
            _ => None,
        }
    }

    pub fn stdout_fd(&self) -> Option<RawFd> {
        match self {
            Console::Pipes { stdout, .. } => Some(*stdout),
            _ => None,
        }
    }

    pub fn stderr_fd(&self) -> Option<RawFd> {
        match self {
            Console::Pipes { stderr, .. } => Some(*stderr),
            _ => None,
        }
    }

    /// Drop our stdin reference so the peer can close the workload's stdin
    /// for good. Returns false when there is nothing to drop.
    pub fn close_stdin(&mut self) -> bool {
        match self {
            Console::Pipes { stdin, .. } => match stdin.take() {
                Some(fd) => {
                    close_quietly(fd);
                    true
                }
                None => false,
            },
            _ => false,
        }
    }
}

impl Drop for Console {
    fn drop(&mut self) {
        match self {
            Console::Offline => {}
            Console::Pty { primary } => close_quietly(*primary),
            Console::Pipes {
                stdin,
                stdout,
                stderr,
            } => {
                if let Some(fd) = stdin.take() {
                    close_quietly(fd);
                }
                close_quietly(*stdout);
                close_quietly(*stderr);
            }
        }
    }
}

/// The workload-facing ends produced by [`wire`], consumed by the launch
/// pipeline: dup'd over the child's stdio in pre-exec, closed on our side
/// once the child holds them.
#[derive(Debug)]
pub struct ChildStdio {
    pub stdin: Option<RawFd>,
    pub stdout: Option<RawFd>,
    pub stderr: Option<RawFd>,
    /// Set when the child's new session should adopt the replica as its
    /// controlling terminal (tty mode with open stdin).
    pub controlling: Option<RawFd>,
    close_after_spawn: Vec<RawFd>,
}

impl ChildStdio {
    pub fn close_child_side(&self) {
        for fd in self.close_after_spawn.iter() {
            close_quietly(*fd);
        }
    }
}

/// Open the console endpoints for the requested shape.
pub fn wire(tty: bool, open_stdin: bool) -> nix::Result<(Console, ChildStdio)> {
    if tty {
        let pty = PtyPair::open()?;
        let console = Console::Pty {
            primary: pty.primary,
        };
        let child = ChildStdio {
            stdin: open_stdin.then_some(pty.replica),
            stdout: Some(pty.replica),
            stderr: Some(pty.replica),
            controlling: open_stdin.then_some(pty.replica),
            close_after_spawn: vec![pty.replica],
        };
        Ok((console, child))
    } else {
        let stdout = PipePair::open()?;
        let stderr = PipePair::open()?;
        let stdin = if open_stdin {
            Some(PipePair::open()?)
        } else {
            None
        };
        let console = Console::Pipes {
            stdin: stdin.as_ref().map(|pipe| pipe.write),
            stdout: stdout.read,
            stderr: stderr.read,
        };
        let mut close_after_spawn = vec![stdout.write, stderr.write];
        if let Some(pipe) = &stdin {
            close_after_spawn.push(pipe.read);
        }
        let child = ChildStdio {
            stdin: stdin.as_ref().map(|pipe| pipe.read),
            stdout: Some(stdout.write),
            stderr: Some(stderr.write),
            controlling: None,
            close_after_spawn,
        };
        Ok((console, child))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd::{read, write};

    #[test]
    fn pipe_console_moves_output() {
        let (console, child) = wire(false, true).unwrap();
        assert!(console.pty_primary().is_none());

        // pretend to be the workload writing to stdout
        write(child.stdout.unwrap(), b"out").unwrap();
        let mut buf = [0u8; 3];
        read(console.stdout_fd().unwrap(), &mut buf).unwrap();
        assert_eq!(&buf, b"out");

        // and the daemon feeding stdin
        write(console.stdin_fd().unwrap(), b"in!").unwrap();
        read(child.stdin.unwrap(), &mut buf).unwrap();
        assert_eq!(&buf, b"in!");

        child.close_child_side();
        drop(console);
    }

    #[test]
    fn stdin_close_is_single_shot() {
        let (mut console, child) = wire(false, true).unwrap();
        assert!(console.stdin_fd().is_some());
        assert!(console.close_stdin());
        assert!(console.stdin_fd().is_none());
        assert!(!console.close_stdin());
        child.close_child_side();
    }

    #[test]
    fn pty_console_has_no_pipe_endpoints() {
        let (console, child) = wire(true, false).unwrap();
        assert!(console.pty_primary().is_some());
        assert!(console.stdin_fd().is_none());
        assert!(console.stdout_fd().is_none());
        assert!(console.stderr_fd().is_none());
        assert!(child.stdin.is_none());
        assert!(child.controlling.is_none());
        child.close_child_side();
    }

    #[test]
    fn closed_stdin_stays_closed_but_output_lives_on() {
        let (mut console, child) = wire(false, false).unwrap();
        assert!(console.stdin_fd().is_none());
        assert!(!console.close_stdin());
        assert!(console.stdout_fd().is_some());
        child.close_child_side();
    }
}
