//! eventfd related routines

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

use nix::poll::{poll, PollFd, PollFlags};
use nix::unistd::{close, dup, write};
use std::os::fd::{AsRawFd, RawFd};
use tokio::io::unix::AsyncFd;
use tokio::io::Interest;

/// Single-shot, multi-reader readiness latch backed by a non-blocking
/// eventfd(2). The counter is written once and never drained, so the fd stays
/// readable forever and every past or future waiter observes the release.
///
/// An eventfd rather than an in-process notify so the latch can also be
/// observed synchronously (and survives being inherited across fork).
#[derive(Debug)]
pub struct EventFdNotify {
    fd: RawFd,
}

impl Drop for EventFdNotify {
    fn drop(&mut self) {
        let _ = close(self.fd);
    }
}

impl AsRawFd for EventFdNotify {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl EventFdNotify {
    pub fn new() -> std::io::Result<EventFdNotify> {
        let fd = unsafe { libc::eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK) };
        if fd < 0 {
            return Err(std::io::Error::last_os_error());
        }
        Ok(EventFdNotify { fd })
    }

    /// Release the latch.
    pub fn notify_waiters(&self) {
        let _ = write(self.fd, &1u64.to_ne_bytes());
    }

    /// Wait until the latch has been released.
    pub async fn notified(&self) -> std::io::Result<()> {
        let duplicate = DupFd(dup(self.fd).map_err(std::io::Error::from)?);
        let asyncfd = AsyncFd::with_interest(duplicate, Interest::READABLE)?;
        let _ = asyncfd.readable().await?;
        Ok(())
    }

    /// Non-blocking probe of the latch state.
    pub fn is_notified(&self) -> bool {
        let mut fds = [PollFd::new(self.fd, PollFlags::POLLIN)];
        match poll(&mut fds, 0) {
            Ok(n) if n > 0 => fds[0]
                .revents()
                .map(|flags| flags.contains(PollFlags::POLLIN))
                .unwrap_or(false),
            _ => false,
        }
    }
}

/// Owned duplicate registered with the reactor, closed when the wait ends.
#[derive(Debug)]
struct DupFd(RawFd);

impl AsRawFd for DupFd {
    fn as_raw_fd(&self) -> RawFd {
        self.0
    }
}

impl Drop for DupFd {
    fn drop(&mut self) {
        let _ = close(self.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latch_starts_unset() {
        let latch = EventFdNotify::new().expect("cannot create eventfd");
        assert!(!latch.is_notified());
        latch.notify_waiters();
        assert!(latch.is_notified());
        // never drained: still set
        assert!(latch.is_notified());
    }

    #[tokio::test]
    async fn waiters_before_and_after_release_complete() {
        let latch = std::sync::Arc::new(EventFdNotify::new().expect("cannot create eventfd"));

        let early = {
            let latch = latch.clone();
            tokio::spawn(async move { latch.notified().await })
        };
        tokio::task::yield_now().await;
        latch.notify_waiters();
        early.await.expect("waiter panicked").expect("wait failed");

        // late waiter observes the already-released latch immediately
        latch.notified().await.expect("wait failed");
    }
}
