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

use nix::errno::Errno;
use nix::mount::{mount, umount2, MntFlags, MsFlags};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{sethostname, Pid};

pub fn set_hostname(hostname: &str) -> nix::Result<()> {
    sethostname(hostname)
}

/// Lazily detach a mount point from this namespace. Descriptors already
/// obtained through it stay usable.
pub fn detach_mount(target: &str) -> nix::Result<()> {
    umount2(target, MntFlags::MNT_DETACH)
}

pub fn bind_mount(source: &str, target: &str) -> nix::Result<()> {
    mount(
        Some(source),
        target,
        None::<&str>,
        MsFlags::MS_BIND,
        None::<&str>,
    )
}

/// One step of a wait-any drain. `Some((pid, code))` reports a process that
/// terminated; `None` means nothing further is reapable right now (no
/// children, or all of them still running).
pub fn reap_one() -> Option<(Pid, i32)> {
    loop {
        match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::Exited(pid, code)) => return Some((pid, normalize_exit_code(code))),
            Ok(WaitStatus::Signaled(pid, signal, _)) => {
                return Some((pid, 128 + signal as i32));
            }
            Ok(WaitStatus::StillAlive) => return None,
            Ok(_) => continue,
            Err(Errno::EINTR) => continue,
            Err(_) => return None,
        }
    }
}

/// Exit codes reported to the peer are never negative; anything below zero
/// collapses to the supervisor's failure sentinel.
pub fn normalize_exit_code(code: i32) -> i32 {
    if code < 0 {
        -1
    } else {
        code
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_code_normalization() {
        assert_eq!(normalize_exit_code(0), 0);
        assert_eq!(normalize_exit_code(137), 137);
        assert_eq!(normalize_exit_code(-3), -1);
    }

    #[test]
    fn reap_one_collects_a_terminated_child() {
        let child = std::process::Command::new("/bin/true")
            .spawn()
            .expect("cannot spawn /bin/true");
        let pid = Pid::from_raw(child.id() as i32);

        let mut reaped = None;
        for _ in 0..200 {
            if let Some(found) = reap_one() {
                reaped = Some(found);
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        assert_eq!(reaped, Some((pid, 0)));
    }
}
