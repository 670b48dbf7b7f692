//! Library for Linux system bits

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

pub mod capability;
pub mod cgroup;
pub mod event;
pub mod net;
pub mod proc;
pub mod term;
pub mod user;

pub use nix;
pub use nix::libc;

use nix::fcntl::{open, OFlag};
use nix::sys::stat::Mode;
use nix::unistd::{close, dup2, setgid, setsid, setuid, Gid, Uid};
use std::os::fd::RawFd;
use std::os::unix::process::CommandExt;
use std::process::Command;

/// Pre-exec wiring for a supervised child. The hooks run in registration
/// order inside the forked child; callers that need a controlling terminal
/// must request the session first.
pub trait InitCommandExt {
    /// Run the child in a new session.
    fn session(&mut self) -> &mut Command;

    /// Make `fd` the controlling terminal of the child's (new) session.
    fn controlling_tty(&mut self, fd: RawFd) -> &mut Command;

    /// Switch the child to the given uid/gid right before exec. gid is
    /// applied first, while the process is still privileged enough to do it.
    fn credential(&mut self, uid: u32, gid: u32) -> &mut Command;

    /// Install the given descriptors over the child's standard streams. A
    /// `None` stdin is pointed at `/dev/null`; `None` stdout/stderr are left
    /// inherited.
    fn stdio_fds(
        &mut self,
        stdin: Option<RawFd>,
        stdout: Option<RawFd>,
        stderr: Option<RawFd>,
    ) -> &mut Command;

    /// Make `fd` visible to the child as descriptor `target`, surviving
    /// exec. dup2 clears close-on-exec on the copy.
    fn inherit_fd(&mut self, fd: RawFd, target: RawFd) -> &mut Command;
}

impl InitCommandExt for Command {
    fn session(&mut self) -> &mut Command {
        unsafe {
            self.pre_exec(|| {
                setsid()?;
                Ok(())
            });
        }
        self
    }

    fn controlling_tty(&mut self, fd: RawFd) -> &mut Command {
        unsafe {
            self.pre_exec(move || {
                if libc::ioctl(fd, libc::TIOCSCTTY, 0) == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }
        self
    }

    fn credential(&mut self, uid: u32, gid: u32) -> &mut Command {
        unsafe {
            self.pre_exec(move || {
                setgid(Gid::from_raw(gid))?;
                setuid(Uid::from_raw(uid))?;
                Ok(())
            });
        }
        self
    }

    fn stdio_fds(
        &mut self,
        stdin: Option<RawFd>,
        stdout: Option<RawFd>,
        stderr: Option<RawFd>,
    ) -> &mut Command {
        unsafe {
            self.pre_exec(move || {
                match stdin {
                    Some(fd) => {
                        dup2(fd, 0)?;
                    }
                    None => {
                        let null = open("/dev/null", OFlag::O_RDONLY, Mode::empty())?;
                        dup2(null, 0)?;
                        close(null)?;
                    }
                }
                if let Some(fd) = stdout {
                    dup2(fd, 1)?;
                }
                if let Some(fd) = stderr {
                    dup2(fd, 2)?;
                }
                Ok(())
            });
        }
        self
    }

    fn inherit_fd(&mut self, fd: RawFd, target: RawFd) -> &mut Command {
        unsafe {
            self.pre_exec(move || {
                dup2(fd, target)?;
                Ok(())
            });
        }
        self
    }
}
