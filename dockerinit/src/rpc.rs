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

use crate::supervisor::{Canceled, State, Status, Supervisor};

use async_trait::async_trait;
use nix::libc::{ECANCELED, EINVAL, ESRCH};
use rpcfd::packet::codec::json::JsonPacket;
use rpcfd::packet::codec::{Fd as RpcFd, FromPacket, Pid as RpcPid};
use rpcfd::packet::TypedPacket;
use rpcfd::proto::{error_packet, fault, ok_packet, Fault, Response, RpcResult};
use rpcfd::service::{Method, Service, ServiceDelegate, StreamEvent};
use serde::{Deserialize, Serialize};
use std::os::fd::RawFd;
use std::sync::Arc;

#[derive(Serialize, Deserialize, Debug, Default)]
pub struct Empty {}

#[derive(Serialize, Deserialize, Debug)]
pub struct StateReply {
    pub state: State,
    pub error: String,
    pub exit_code: i32,
}

impl From<Status> for StateReply {
    fn from(status: Status) -> StateReply {
        StateReply {
            state: status.state,
            error: status.error,
            exit_code: status.exit_code,
        }
    }
}

#[derive(Serialize, Deserialize, Debug)]
pub struct WaitRequest {
    pub known: State,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct SignalRequest {
    pub signal: i32,
}

/// One `DockerInit.*` method: decode the request, run the body against the
/// shared supervisor record, encode the outcome.
macro_rules! init_method {
    ($handler:ident, $method:literal,
     ($supervisor:ident, $request:ident : $req_ty:ty) -> $reply_ty:ty $body:block) => {
        pub struct $handler;

        #[async_trait]
        impl Method<Supervisor> for $handler {
            fn identifier(&self) -> &'static str {
                $method
            }

            async fn apply(
                &self,
                context: Arc<Supervisor>,
                packet: JsonPacket,
            ) -> TypedPacket<Response> {
                let decoded = <$req_ty as FromPacket>::from_packet_failable(packet, |value| {
                    serde_json::from_value(value.clone())
                });
                let $request: $req_ty = match decoded {
                    Ok(request) => request,
                    Err(err) => {
                        return error_packet(Fault {
                            errno: EINVAL,
                            error: format!("malformed request: {err}"),
                        })
                    }
                };
                let $supervisor = context;
                let outcome: RpcResult<$reply_ty> = async move $body.await;
                match outcome {
                    Ok(value) => ok_packet(value),
                    Err(fault) => error_packet(fault),
                }
            }
        }
    };
}

init_method!(GetState, "DockerInit.GetState", (supervisor, _request: Empty) -> StateReply {
    Ok(StateReply::from(supervisor.status()))
});

init_method!(WaitForStateChange, "DockerInit.WaitForStateChange",
             (supervisor, request: WaitRequest) -> StateReply {
    match supervisor.wait_for_change(request.known).await {
        Ok(status) => Ok(StateReply::from(status)),
        Err(Canceled) => fault(ECANCELED, "canceled"),
    }
});

init_method!(Resume, "DockerInit.Resume", (supervisor, _request: Empty) -> Empty {
    supervisor.request_resume().await.map(|_| Empty {})
});

init_method!(Signal, "DockerInit.Signal", (supervisor, request: SignalRequest) -> Empty {
    supervisor.signal(request.signal).await.map(|_| Empty {})
});

init_method!(GetPid, "DockerInit.GetPid", (supervisor, _request: Empty) -> RpcPid {
    match supervisor.pid() {
        Some(pid) => Ok(RpcPid(pid.as_raw())),
        None => fault(ESRCH, "process has not started"),
    }
});

init_method!(GetPtyMaster, "DockerInit.GetPtyMaster", (supervisor, _request: Empty) -> RpcFd {
    supervisor.with_console(|console| match console.pty_primary() {
        Some(fd) => Ok(RpcFd(fd)),
        None => fault(EINVAL, "ptyMaster is nil"),
    })
});

init_method!(GetStdin, "DockerInit.GetStdin", (supervisor, _request: Empty) -> RpcFd {
    supervisor.with_console(|console| match console.stdin_fd() {
        Some(fd) => Ok(RpcFd(fd)),
        None => fault(EINVAL, "stdin is nil"),
    })
});

init_method!(GetStdout, "DockerInit.GetStdout", (supervisor, _request: Empty) -> RpcFd {
    supervisor.with_console(|console| match console.stdout_fd() {
        Some(fd) => Ok(RpcFd(fd)),
        None => fault(EINVAL, "stdout is nil"),
    })
});

init_method!(GetStderr, "DockerInit.GetStderr", (supervisor, _request: Empty) -> RpcFd {
    supervisor.with_console(|console| match console.stderr_fd() {
        Some(fd) => Ok(RpcFd(fd)),
        None => fault(EINVAL, "stderr is nil"),
    })
});

init_method!(SetStdin, "DockerInit.SetStdin", (_supervisor, request: RpcFd) -> Empty {
    adopt_stdio(0, request)
});

init_method!(SetStdout, "DockerInit.SetStdout", (_supervisor, request: RpcFd) -> Empty {
    adopt_stdio(1, request)
});

init_method!(SetStderr, "DockerInit.SetStderr", (_supervisor, request: RpcFd) -> Empty {
    adopt_stdio(2, request)
});

init_method!(StdinClose, "DockerInit.StdinClose", (supervisor, _request: Empty) -> Empty {
    supervisor.with_console(|console| {
        if console.close_stdin() {
            Ok(Empty {})
        } else {
            fault(EINVAL, "stdin is nil")
        }
    })
});

/// Machine-child variant of the console contract: the peer supplies a
/// descriptor and we make it our own standard stream. The received fd
/// arrived close-on-exec and is dropped once installed.
fn adopt_stdio(target: RawFd, fd: RpcFd) -> RpcResult<Empty> {
    let installed = nix::unistd::dup2(fd.0, target);
    linux::term::close_quietly(fd.0);
    match installed {
        Ok(_) => Ok(Empty {}),
        Err(errno) => fault(EINVAL, format!("cannot adopt descriptor: {errno}")),
    }
}

/// Peer disconnect cancels every blocked `WaitForStateChange`.
struct CancelOnDisconnect;

#[async_trait]
impl ServiceDelegate<Supervisor> for CancelOnDisconnect {
    async fn on_event(&self, context: Arc<Supervisor>, event: StreamEvent) {
        if let StreamEvent::Disconnected = event {
            context.cancel_waiters();
        }
    }
}

pub fn register(service: &mut Service<Supervisor>) {
    service.register(GetState);
    service.register(WaitForStateChange);
    service.register(Resume);
    service.register(Signal);
    service.register(GetPid);
    service.register(GetPtyMaster);
    service.register(GetStdin);
    service.register(GetStdout);
    service.register(GetStderr);
    service.register(SetStdin);
    service.register(SetStdout);
    service.register(SetStderr);
    service.register(StdinClose);
    service.register_delegate(CancelOnDisconnect);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::console;
    use crate::supervisor::Supervisor;
    use nix::unistd::read;
    use rpcfd::proto::call;
    use rpcfd::transport::enable_pid_passing;
    use std::os::unix::net::UnixStream;

    fn start_service(supervisor: Arc<Supervisor>, path: &std::path::Path) {
        let mut service = Service::bind(path, supervisor).expect("cannot bind service");
        register(&mut service);
        tokio::spawn(service.serve());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn full_method_surface_over_the_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rpc.sock");
        let (supervisor, mut gate) = Supervisor::new().unwrap();

        let (console, child) = console::wire(false, true).unwrap();
        supervisor.install_console(console);
        supervisor.publish_process(nix::unistd::Pid::from_raw(
            std::process::id() as i32
        ));
        start_service(supervisor.clone(), &path);

        let client_path = path.clone();
        let client = tokio::task::spawn_blocking(move || {
            let mut stream = UnixStream::connect(&client_path).expect("cannot connect");
            enable_pid_passing(&stream).expect("cannot enable passcred");

            let state: StateReply =
                call(&mut stream, "DockerInit.GetState", Empty {}).unwrap().unwrap();
            assert_eq!(state.state, State::Initial);
            assert_eq!(state.exit_code, -1);

            let _: Empty = call(&mut stream, "DockerInit.Resume", Empty {}).unwrap().unwrap();

            // pipe mode: a pty primary is not applicable
            let pty = call::<_, RpcFd>(&mut stream, "DockerInit.GetPtyMaster", Empty {})
                .unwrap()
                .unwrap_err();
            assert_eq!(pty.error, "ptyMaster is nil");

            // stdout arrives as a live descriptor
            let stdout: RpcFd = call(&mut stream, "DockerInit.GetStdout", Empty {})
                .unwrap()
                .unwrap();

            let pid: RpcPid = call(&mut stream, "DockerInit.GetPid", Empty {})
                .unwrap()
                .unwrap();
            assert_eq!(pid.0, std::process::id() as i32);

            let _: Empty = call(&mut stream, "DockerInit.StdinClose", Empty {})
                .unwrap()
                .unwrap();
            let stdin = call::<_, RpcFd>(&mut stream, "DockerInit.GetStdin", Empty {})
                .unwrap()
                .unwrap_err();
            assert_eq!(stdin.error, "stdin is nil");

            stdout
        })
        .await
        .expect("client panicked");

        // the resume the client sent is waiting in the gate
        gate.wait(std::time::Duration::from_secs(1), "Resume()")
            .await
            .unwrap();

        // the brokered stdout fd is live: workload writes, peer copy reads
        nix::unistd::write(child.stdout.unwrap(), b"hi").unwrap();
        let mut buf = [0u8; 2];
        read(client.0, &mut buf).unwrap();
        assert_eq!(&buf, b"hi");

        child.close_child_side();
    }
}
