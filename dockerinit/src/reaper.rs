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

use crate::supervisor::Supervisor;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use signal_hook::consts::*;
use signal_hook::iterator::Signals;
use std::os::raw::c_int;
use std::sync::Arc;
use tracing::debug;

/// Every catchable signal the supervisor relays. SIGCHLD stays ours (it
/// drives reaping); SIGKILL/SIGSTOP and the fatal synchronous faults cannot
/// be handled.
pub const FORWARDED_SIGNALS: &[c_int] = &[
    SIGHUP, SIGINT, SIGQUIT, SIGTRAP, SIGABRT, SIGBUS, SIGUSR1, SIGUSR2, SIGPIPE, SIGALRM,
    SIGTERM, SIGCHLD, SIGCONT, SIGTSTP, SIGTTIN, SIGTTOU, SIGURG, SIGXCPU, SIGXFSZ, SIGVTALRM,
    SIGPROF, SIGWINCH, SIGIO, SIGSYS,
];

/// Arm the handlers, catch up on anything that exited between fork and now,
/// then hand the loop to a dedicated thread: as pid 1 we reap every orphan
/// in the container, and relay everything that is not SIGCHLD to the
/// workload.
pub fn spawn(supervisor: Arc<Supervisor>, child: Pid) -> std::io::Result<()> {
    let mut signals = Signals::new(FORWARDED_SIGNALS)?;
    drain(&supervisor, child);
    std::thread::Builder::new()
        .name("reaper".to_string())
        .spawn(move || {
            for signum in signals.forever() {
                if signum == SIGCHLD {
                    // signals coalesce: one SIGCHLD may cover several exits
                    drain(&supervisor, child);
                } else if let Ok(signal) = Signal::try_from(signum) {
                    let _ = kill(child, signal);
                }
            }
        })?;
    Ok(())
}

fn drain(supervisor: &Supervisor, child: Pid) {
    while let Some((pid, exit_code)) = linux::proc::reap_one() {
        if pid == child {
            debug!("workload exited with {exit_code}");
            supervisor.exited(exit_code);
        } else {
            debug!("reaped orphan {pid}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forwarded_set_covers_the_catchable_signals() {
        assert!(FORWARDED_SIGNALS.contains(&SIGCHLD));
        assert!(FORWARDED_SIGNALS.contains(&SIGTERM));
        assert!(FORWARDED_SIGNALS.contains(&SIGWINCH));
        // unblockable or fatal-synchronous: never registered
        for signum in [SIGKILL, SIGSTOP, SIGILL, SIGFPE, SIGSEGV] {
            assert!(!FORWARDED_SIGNALS.contains(&signum));
        }
    }
}
