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

use nix::fcntl::{open, OFlag};
use nix::pty::{grantpt, posix_openpt, ptsname_r, unlockpt};
use nix::sys::stat::Mode;
use nix::unistd::{close, pipe2};
use std::os::fd::{IntoRawFd, RawFd};

/// A pseudo-terminal pair. The supervisor holds the primary side; the
/// replica becomes the child's stdio (and, for machine containers, backs
/// `/dev/console` via its path). Both descriptors are close-on-exec; wiring
/// into a child happens through dup2 in pre-exec hooks.
#[derive(Debug)]
pub struct PtyPair {
    pub primary: RawFd,
    pub replica: RawFd,
    pub replica_path: String,
}

impl PtyPair {
    pub fn open() -> nix::Result<PtyPair> {
        let primary = posix_openpt(OFlag::O_RDWR | OFlag::O_NOCTTY | OFlag::O_CLOEXEC)?;
        grantpt(&primary)?;
        unlockpt(&primary)?;
        let replica_path = ptsname_r(&primary)?;
        let replica = open(
            replica_path.as_str(),
            OFlag::O_RDWR | OFlag::O_NOCTTY | OFlag::O_CLOEXEC,
            Mode::empty(),
        )?;
        Ok(PtyPair {
            primary: primary.into_raw_fd(),
            replica,
            replica_path,
        })
    }
}

/// One pipe, close-on-exec on both ends.
#[derive(Debug)]
pub struct PipePair {
    pub read: RawFd,
    pub write: RawFd,
}

impl PipePair {
    pub fn open() -> nix::Result<PipePair> {
        let (read, write) = pipe2(OFlag::O_CLOEXEC)?;
        Ok(PipePair { read, write })
    }
}

/// Close a descriptor, ignoring errors; for fds whose ownership was handed
/// off or that may already be gone.
pub fn close_quietly(fd: RawFd) {
    let _ = close(fd);
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd::{read, write};

    #[test]
    fn pty_pair_opens_and_names_replica() {
        let pty = PtyPair::open().expect("cannot open pty pair");
        assert!(pty.primary >= 0);
        assert!(pty.replica >= 0);
        assert!(pty.replica_path.starts_with("/dev/pts/"));
        close_quietly(pty.primary);
        close_quietly(pty.replica);
    }

    #[test]
    fn pipe_pair_moves_bytes() {
        let pipe = PipePair::open().expect("cannot open pipe");
        write(pipe.write, b"ok").unwrap();
        let mut buf = [0u8; 2];
        read(pipe.read, &mut buf).unwrap();
        assert_eq!(&buf, b"ok");
        close_quietly(pipe.read);
        close_quietly(pipe.write);
    }
}
