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
use crate::packet::codec::FromPacket;
use crate::packet::{Packet, TypedPacket};
use crate::transport::{ChannelError, PacketTransport};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::os::unix::net::UnixStream;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RpcError {
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("{0}")]
    Channel(#[from] ChannelError),
}

#[derive(Serialize, Deserialize, Debug)]
pub struct Request {
    pub method: String,
    pub value: Value,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct Response {
    pub errno: i32,
    pub value: Value,
}

/// A method failure as seen on the wire: an errno for the kind and a plain
/// string for the operator.
#[derive(Serialize, Deserialize, Error, Debug, Clone, PartialEq, Eq)]
#[error("{error}")]
pub struct Fault {
    pub errno: i32,
    pub error: String,
}

pub type RpcResult<T> = Result<T, Fault>;

pub fn fault<T>(errno: i32, message: impl AsRef<str>) -> RpcResult<T> {
    Err(Fault {
        errno,
        error: message.as_ref().to_string(),
    })
}

pub fn write_request<V: FromPacket>(method: &str, value: V) -> serde_json::Result<Packet> {
    let packet = value.to_packet_failable(|dual| serde_json::to_value(&dual))?;
    Ok(packet
        .map_failable(|value| {
            serde_json::to_vec(&Request {
                method: method.to_string(),
                value,
            })
        })?
        .into())
}

/// Successful reply carrying `value`, with any fd/pid carriers inside it
/// landed in the packet side tables.
pub fn ok_packet<V: FromPacket>(value: V) -> TypedPacket<Response> {
    value
        .to_packet(|dual| serde_json::to_value(&dual).unwrap_or(Value::Null))
        .map(|value| Response { errno: 0, value })
}

/// Error reply. Carries no descriptors by construction, so a failed method
/// can never leak a partial transfer to the peer.
pub fn error_packet(fault: Fault) -> TypedPacket<Response> {
    TypedPacket {
        data: Response {
            errno: fault.errno,
            value: json!({ "error": fault.error }),
        },
        fds: Vec::new(),
        pids: Vec::new(),
    }
}

fn parse_fault(errno: i32, value: &Value) -> Fault {
    let error = value
        .get("error")
        .and_then(Value::as_str)
        .unwrap_or("unknown error")
        .to_string();
    Fault { errno, error }
}

/// One blocking request/response exchange. This is the client the external
/// daemon links against; the supervisor side never calls it outside tests.
pub fn call<Req, Reply>(
    stream: &mut UnixStream,
    method: &str,
    request: Req,
) -> Result<RpcResult<Reply>, RpcError>
where
    Req: FromPacket,
    Reply: FromPacket,
{
    let packet = write_request(method, request)?;
    stream.send_packet(&packet)?;

    let packet = stream.recv_packet()?;
    let json_packet = JsonPacket::parse(packet)?;
    let response: TypedPacket<Response> =
        json_packet.map_failable(|value| serde_json::from_value(value))?;

    if response.data.errno == 0 {
        let reply = Reply::from_packet_failable(
            response.map(|data| data.value),
            |value| serde_json::from_value(value.clone()),
        )?;
        Ok(Ok(reply))
    } else {
        Ok(Err(parse_fault(
            response.data.errno,
            &response.data.value,
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::codec::Fd;

    #[test]
    fn request_framing_round_trip() {
        let packet = write_request("DockerInit.GetState", serde_json::json!({})).unwrap();
        let parsed = JsonPacket::parse(packet).unwrap();
        let request: Request = serde_json::from_value(parsed.data).unwrap();
        assert_eq!(request.method, "DockerInit.GetState");
    }

    #[test]
    fn fd_reply_lands_in_side_table() {
        let reply = ok_packet(Fd(5));
        assert_eq!(reply.data.errno, 0);
        assert_eq!(reply.fds, vec![5]);
    }

    #[test]
    fn error_reply_carries_no_descriptors() {
        let reply = error_packet(Fault {
            errno: nix::libc::EINVAL,
            error: "stdin is nil".to_string(),
        });
        assert!(reply.fds.is_empty());
        assert_eq!(reply.data.errno, nix::libc::EINVAL);
        assert_eq!(
            parse_fault(reply.data.errno, &reply.data.value).error,
            "stdin is nil"
        );
    }
}
