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
use crate::packet::codec::json::JsonPacket;
use crate::packet::{Packet, TypedPacket};
use crate::proto::{error_packet, Fault, Request, Response};
use crate::transport::tokio_io::AsyncPacketTransport;
use crate::transport::ChannelError;

use async_trait::async_trait;
use nix::libc::{EIO, ENOENT};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

#[async_trait]
pub trait Method<T: Send + Sync + 'static>: Send + Sync {
    fn identifier(&self) -> &'static str;
    async fn apply(&self, context: Arc<T>, request: JsonPacket) -> TypedPacket<Response>;
}

pub enum StreamEvent {
    Connected,
    Disconnected,
}

/// Connection lifecycle observer. The supervisor registers one to cancel
/// blocked state-change waiters the moment the peer hangs up.
#[async_trait]
pub trait ServiceDelegate<T: Send + Sync + 'static>: Send + Sync {
    async fn on_event(&self, context: Arc<T>, event: StreamEvent);
}

/// Unix-socket RPC server with a single active peer. Connections are served
/// one at a time; the accept loop resumes once the peer disconnects.
///
/// Within a connection each request runs on its own task but responses go out
/// in request order, so a method that suspends (a state-change wait) never
/// stops the reader from noticing EOF.
pub struct Service<T: Send + Sync + 'static> {
    listener: UnixListener,
    context: Arc<T>,
    methods: HashMap<&'static str, Arc<dyn Method<T>>>,
    delegates: Vec<Arc<dyn ServiceDelegate<T>>>,
}

impl<T: Send + Sync + 'static> Service<T> {
    pub fn bind(path: impl AsRef<Path>, context: Arc<T>) -> Result<Service<T>, std::io::Error> {
        // a previous incarnation may have left the socket file behind
        let _ = std::fs::remove_file(path.as_ref());
        let listener = UnixListener::bind(path)?;
        Ok(Service {
            listener,
            context,
            methods: HashMap::new(),
            delegates: Vec::new(),
        })
    }

    pub fn register(&mut self, handler: impl Method<T> + 'static) {
        self.methods.insert(handler.identifier(), Arc::new(handler));
    }

    pub fn register_delegate(&mut self, delegate: impl ServiceDelegate<T> + 'static) {
        self.delegates.push(Arc::new(delegate));
    }

    pub async fn serve(self) -> Result<(), std::io::Error> {
        loop {
            let (stream, _) = self.listener.accept().await?;
            debug!("control channel peer connected");
            for delegate in self.delegates.iter() {
                delegate
                    .on_event(self.context.clone(), StreamEvent::Connected)
                    .await;
            }
            self.serve_stream(stream).await;
            debug!("control channel peer disconnected");
        }
    }

    async fn serve_stream(&self, stream: UnixStream) {
        let stream = &stream;
        let (resp_tx, mut resp_rx) =
            mpsc::channel::<oneshot::Receiver<TypedPacket<Response>>>(64);

        let reader = async move {
            loop {
                let packet = match stream.recv_packet().await {
                    Ok(packet) => packet,
                    Err(ChannelError::Disconnected) => break,
                    Err(err) => {
                        warn!("control channel receive failed: {err}");
                        break;
                    }
                };
                let (method, packet) = match parse_request(packet) {
                    Ok(parsed) => parsed,
                    Err(err) => {
                        warn!("malformed control request: {err}");
                        break;
                    }
                };
                debug!(">>>>> method {method}");
                let handler = self.methods.get(method.as_str()).cloned();
                let context = self.context.clone();
                let (tx, rx) = oneshot::channel();
                if resp_tx.send(rx).await.is_err() {
                    break;
                }
                tokio::spawn(async move {
                    let response = match handler {
                        Some(handler) => handler.apply(context, packet).await,
                        None => error_packet(Fault {
                            errno: ENOENT,
                            error: format!("method {method} not found"),
                        }),
                    };
                    let _ = tx.send(response);
                });
            }
            // Peer is gone: anything suspended on its behalf must unblock now,
            // not when its response would have been written.
            for delegate in self.delegates.iter() {
                delegate
                    .on_event(self.context.clone(), StreamEvent::Disconnected)
                    .await;
            }
        };

        let writer = async move {
            while let Some(rx) = resp_rx.recv().await {
                let response = rx.await.unwrap_or_else(|_| {
                    error_packet(Fault {
                        errno: EIO,
                        error: "method handler failed".to_string(),
                    })
                });
                let packet: Packet = response
                    .map(|data| serde_json::to_vec(&data).unwrap_or_default())
                    .into();
                if let Err(err) = stream.send_packet(&packet).await {
                    warn!("control channel send failed: {err}");
                    break;
                }
            }
        };

        tokio::join!(reader, writer);
    }
}

fn parse_request(packet: Packet) -> serde_json::Result<(String, JsonPacket)> {
    let json_packet = JsonPacket::parse(packet)?;
    let request: TypedPacket<Request> = json_packet.map_failable(serde_json::from_value)?;
    let method = request.data.method.clone();
    Ok((method, request.map(|request| request.value)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::{call, fault, ok_packet, RpcResult};
    use nix::libc::EINVAL;
    use serde::{Deserialize, Serialize};
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Serialize, Deserialize)]
    struct EchoRequest {
        text: String,
    }

    #[derive(Serialize, Deserialize, Debug)]
    struct EchoReply {
        text: String,
    }

    #[derive(Default)]
    struct TestContext {
        disconnected: AtomicBool,
    }

    struct Echo;

    #[async_trait]
    impl Method<TestContext> for Echo {
        fn identifier(&self) -> &'static str {
            "Test.Echo"
        }
        async fn apply(&self, _ctx: Arc<TestContext>, request: JsonPacket) -> TypedPacket<Response> {
            let parsed: RpcResult<EchoRequest> =
                serde_json::from_value(request.data).map_err(|err| Fault {
                    errno: EINVAL,
                    error: err.to_string(),
                });
            match parsed {
                Ok(req) => ok_packet(EchoReply { text: req.text }),
                Err(f) => error_packet(f),
            }
        }
    }

    struct Failing;

    #[async_trait]
    impl Method<TestContext> for Failing {
        fn identifier(&self) -> &'static str {
            "Test.Fail"
        }
        async fn apply(&self, _ctx: Arc<TestContext>, _req: JsonPacket) -> TypedPacket<Response> {
            error_packet(fault::<()>(EINVAL, "stdin is nil").unwrap_err())
        }
    }

    struct Flag;

    #[async_trait]
    impl ServiceDelegate<TestContext> for Flag {
        async fn on_event(&self, context: Arc<TestContext>, event: StreamEvent) {
            if let StreamEvent::Disconnected = event {
                context.disconnected.store(true, Ordering::SeqCst);
            }
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn serves_methods_and_fires_disconnect() {
        let dir = tempfile::tempdir().expect("cannot make tempdir");
        let path = dir.path().join("rpc.sock");
        let context = Arc::new(TestContext::default());

        let mut service = Service::bind(&path, context.clone()).expect("cannot bind");
        service.register(Echo);
        service.register(Failing);
        service.register_delegate(Flag);
        tokio::spawn(service.serve());

        let client_path = path.clone();
        let outcome = tokio::task::spawn_blocking(move || {
            let mut stream = std::os::unix::net::UnixStream::connect(&client_path)
                .expect("cannot connect");
            let echoed: RpcResult<EchoReply> = call(
                &mut stream,
                "Test.Echo",
                EchoRequest {
                    text: "ping".to_string(),
                },
            )
            .expect("transport failure");
            let failed: RpcResult<EchoReply> =
                call(&mut stream, "Test.Fail", serde_json::json!({})).expect("transport failure");
            let missing: RpcResult<EchoReply> =
                call(&mut stream, "Test.Nope", serde_json::json!({})).expect("transport failure");
            (echoed, failed, missing)
        })
        .await
        .expect("client panicked");

        assert_eq!(outcome.0.unwrap().text, "ping");
        let failure = outcome.1.unwrap_err();
        assert_eq!(failure.errno, EINVAL);
        assert_eq!(failure.error, "stdin is nil");
        assert_eq!(outcome.2.unwrap_err().errno, ENOENT);

        // client socket dropped at the end of the closure
        for _ in 0..100 {
            if context.disconnected.load(Ordering::SeqCst) {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(context.disconnected.load(Ordering::SeqCst));
    }
}
