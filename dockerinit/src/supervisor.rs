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

use crate::console::Console;

use linux::event::EventFdNotify;
use nix::libc::{EINVAL, EIO, EPIPE, ESRCH, ETIMEDOUT};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use rpcfd::proto::{fault, RpcResult};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tracing::warn;

/// How long the app-mode supervisor waits for each peer `Resume`.
pub const RESUME_TIMEOUT_APP: Duration = Duration::from_secs(1);

/// How long the machine-mode helper waits for each state acknowledgement.
/// Deliberately much longer than app mode: the daemon fetches console
/// descriptors between the acks.
pub const RESUME_TIMEOUT_MACHINE: Duration = Duration::from_secs(10);

/// How long a `Resume` RPC may wait for the supervisor to reach a wait
/// point before reporting that nobody is listening.
const RESUME_PUBLISH_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Debug)]
#[serde(rename_all = "snake_case")]
pub enum State {
    Initial,
    ConsoleReady,
    RunReady,
    Running,
    Exited,
    FailedToStart,
    Dead,
}

impl State {
    /// Position in the monotonic progression; transitions only move up.
    fn rank(self) -> u8 {
        match self {
            State::Initial => 0,
            State::ConsoleReady => 1,
            State::RunReady => 2,
            State::Running => 3,
            State::Exited => 4,
            State::FailedToStart => 5,
            State::Dead => 6,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Status {
    pub state: State,
    pub error: String,
    pub exit_code: i32,
}

/// Peer disconnected while a state-change wait was in flight.
#[derive(Debug, PartialEq, Eq)]
pub struct Canceled;

/// The shared supervisor record: current status, the child process handle,
/// the console endpoints, and the channels the RPC surface synchronizes on.
/// One mutex guards the status; nothing holds it across a suspension point.
pub struct Supervisor {
    status: Mutex<Status>,
    change: watch::Sender<State>,
    cancel: watch::Sender<u64>,
    resume_tx: mpsc::Sender<()>,
    console: Mutex<Console>,
    process: Mutex<Option<Pid>>,
    started: EventFdNotify,
}

/// Receiving half of the resume rendezvous, owned by the mode driver.
pub struct ResumeGate {
    rx: mpsc::Receiver<()>,
}

impl ResumeGate {
    pub async fn wait(
        &mut self,
        deadline: Duration,
        phase: &'static str,
    ) -> Result<(), crate::error::InitError> {
        match timeout(deadline, self.rx.recv()).await {
            Ok(Some(())) => Ok(()),
            _ => Err(crate::error::InitError::ResumeTimeout(phase)),
        }
    }
}

impl Supervisor {
    pub fn new() -> std::io::Result<(Arc<Supervisor>, ResumeGate)> {
        let (resume_tx, resume_rx) = mpsc::channel(1);
        let (change, _) = watch::channel(State::Initial);
        let (cancel, _) = watch::channel(0u64);
        let supervisor = Arc::new(Supervisor {
            status: Mutex::new(Status {
                state: State::Initial,
                error: String::new(),
                exit_code: -1,
            }),
            change,
            cancel,
            resume_tx,
            console: Mutex::new(Console::Offline),
            process: Mutex::new(None),
            started: EventFdNotify::new()?,
        });
        Ok((supervisor, ResumeGate { rx: resume_rx }))
    }

    pub fn status(&self) -> Status {
        self.status.lock().unwrap().clone()
    }

    /// Move to `next`, optionally updating the payload under the same lock.
    /// Backward moves are refused; the progression never revisits a state.
    pub fn transition(&self, next: State) -> bool {
        self.advance(next, |_| {})
    }

    fn advance(&self, next: State, update: impl FnOnce(&mut Status)) -> bool {
        {
            let mut status = self.status.lock().unwrap();
            if next.rank() <= status.state.rank() {
                warn!(
                    "refusing state transition {:?} -> {:?}",
                    status.state, next
                );
                return false;
            }
            status.state = next;
            update(&mut status);
        }
        // single-slot publication: a slow waiter never backs up the sender
        self.change.send_replace(next);
        if matches!(next, State::FailedToStart | State::Dead) {
            // unblock Signal callers waiting on a child that will never come
            self.started.notify_waiters();
        }
        true
    }

    pub fn fail(&self, message: impl AsRef<str>) {
        let message = message.as_ref().to_string();
        self.advance(State::FailedToStart, |status| status.error = message);
    }

    pub fn exited(&self, exit_code: i32) {
        self.advance(State::Exited, |status| status.exit_code = exit_code);
    }

    /// Block until the state differs from `known`, or the peer goes away.
    /// The status mutex is never held while suspended, so `GetState` and
    /// `Signal` stay serviceable during the wait.
    pub async fn wait_for_change(&self, known: State) -> Result<Status, Canceled> {
        let mut change_rx = self.change.subscribe();
        let mut cancel_rx = self.cancel.subscribe();
        loop {
            let current = self.status();
            if current.state != known {
                return Ok(current);
            }
            tokio::select! {
                changed = change_rx.changed() => {
                    if changed.is_err() {
                        return Ok(self.status());
                    }
                }
                _ = cancel_rx.changed() => return Err(Canceled),
            }
        }
    }

    /// Wait (internally) until `target` has been reached.
    pub async fn state_reached(&self, target: State) -> Status {
        let mut change_rx = self.change.subscribe();
        loop {
            let current = self.status();
            if current.state.rank() >= target.rank() {
                return current;
            }
            if change_rx.changed().await.is_err() {
                return self.status();
            }
        }
    }

    /// Peer side of the resume rendezvous. Idempotent while a resume is
    /// still pending; reports an error when no wait point consumes it within
    /// the publication window.
    pub async fn request_resume(&self) -> RpcResult<()> {
        match timeout(RESUME_PUBLISH_TIMEOUT, self.resume_tx.send(())).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => fault(EPIPE, "supervisor is shutting down"),
            Err(_) => fault(ETIMEDOUT, "no supervisor wait point is active"),
        }
    }

    /// Fired by the control channel when the peer disconnects.
    pub fn cancel_waiters(&self) {
        self.cancel.send_modify(|generation| *generation += 1);
    }

    /// Publish the child process handle and release the readiness latch.
    /// Write-once: the handle is final.
    pub fn publish_process(&self, pid: Pid) {
        let mut process = self.process.lock().unwrap();
        if process.is_none() {
            *process = Some(pid);
            self.started.notify_waiters();
        }
    }

    pub fn pid(&self) -> Option<Pid> {
        *self.process.lock().unwrap()
    }

    /// Forward `signum` to the child, blocking until the process handle is
    /// published. Fails if the child never started.
    pub async fn signal(&self, signum: i32) -> RpcResult<()> {
        let signal = match Signal::try_from(signum) {
            Ok(signal) => signal,
            Err(_) => return fault(EINVAL, format!("unknown signal number {signum}")),
        };
        if let Err(err) = self.started.notified().await {
            return fault(EIO, format!("cannot wait for process start: {err}"));
        }
        match self.pid() {
            Some(pid) => match kill(pid, signal) {
                Ok(()) => Ok(()),
                Err(errno) => fault(errno as i32, format!("cannot signal process: {errno}")),
            },
            None => fault(ESRCH, "process never started"),
        }
    }

    pub fn with_console<R>(&self, action: impl FnOnce(&mut Console) -> R) -> R {
        let mut console = self.console.lock().unwrap();
        action(&mut console)
    }

    pub fn install_console(&self, console: Console) {
        *self.console.lock().unwrap() = console;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn transitions_are_monotonic() {
        let (supervisor, _gate) = Supervisor::new().unwrap();
        assert!(supervisor.transition(State::Running));
        assert!(!supervisor.transition(State::Initial));
        assert!(!supervisor.transition(State::Running));
        assert_eq!(supervisor.status().state, State::Running);

        supervisor.exited(0);
        let status = supervisor.status();
        assert_eq!(status.state, State::Exited);
        assert_eq!(status.exit_code, 0);
    }

    #[tokio::test]
    async fn wait_for_change_sees_the_next_state() {
        let (supervisor, _gate) = Supervisor::new().unwrap();
        let waiter = {
            let supervisor = supervisor.clone();
            tokio::spawn(async move { supervisor.wait_for_change(State::Initial).await })
        };
        tokio::task::yield_now().await;
        supervisor.transition(State::Running);
        let status = waiter.await.unwrap().unwrap();
        assert_eq!(status.state, State::Running);
    }

    #[tokio::test]
    async fn wait_for_change_returns_immediately_on_stale_known() {
        let (supervisor, _gate) = Supervisor::new().unwrap();
        supervisor.transition(State::Running);
        let status = supervisor.wait_for_change(State::Initial).await.unwrap();
        assert_eq!(status.state, State::Running);
    }

    #[tokio::test]
    async fn disconnect_cancels_waiters() {
        let (supervisor, _gate) = Supervisor::new().unwrap();
        let waiter = {
            let supervisor = supervisor.clone();
            tokio::spawn(async move { supervisor.wait_for_change(State::Initial).await })
        };
        tokio::task::yield_now().await;
        supervisor.cancel_waiters();
        assert_eq!(waiter.await.unwrap(), Err(Canceled));
    }

    #[tokio::test]
    async fn resume_rendezvous() {
        let (supervisor, mut gate) = Supervisor::new().unwrap();
        supervisor.request_resume().await.unwrap();
        gate.wait(Duration::from_secs(1), "Resume()").await.unwrap();

        // nobody waiting and the slot already consumed: the next resume
        // parks, the one after that reports the timeout
        supervisor.request_resume().await.unwrap();
        let fault = supervisor.request_resume().await.unwrap_err();
        assert_eq!(fault.errno, ETIMEDOUT);
    }

    #[tokio::test]
    async fn resume_gate_times_out() {
        let (_supervisor, mut gate) = Supervisor::new().unwrap();
        let err = gate
            .wait(Duration::from_millis(50), "Resume()")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("timeout waiting for Resume()"));
    }

    #[tokio::test]
    async fn signal_fails_when_the_child_never_started() {
        let (supervisor, _gate) = Supervisor::new().unwrap();
        supervisor.fail("boom");
        let fault = supervisor.signal(15).await.unwrap_err();
        assert_eq!(fault.errno, ESRCH);

        let bad = supervisor.signal(4096).await.unwrap_err();
        assert_eq!(bad.errno, EINVAL);
    }
}
