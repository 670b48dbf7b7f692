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
pub mod json;

use crate::packet::TypedPacket;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::os::fd::{AsRawFd, RawFd};

/// Wire form of [`Fd`]: an index into the packet's fd table.
#[derive(Deserialize, Serialize)]
pub struct FdRef(usize);

/// An open file descriptor carried by a packet. The numeric value is only
/// meaningful inside the process currently holding the packet; across the
/// socket the descriptor itself travels as `SCM_RIGHTS` ancillary data.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct Fd(pub RawFd);

impl AsRawFd for Fd {
    fn as_raw_fd(&self) -> RawFd {
        self.0
    }
}

impl FromPacket for Fd {
    type Dual = FdRef;
    fn decode_from_dual(value: Self::Dual, fds: &[RawFd], _pids: &[libc::pid_t]) -> Self {
        Fd(fds[value.0])
    }
    fn encode_to_dual(self, fds: &mut Vec<RawFd>, _pids: &mut Vec<libc::pid_t>) -> Self::Dual {
        let r = FdRef(fds.len());
        fds.push(self.0);
        r
    }
}

/// Wire form of [`Pid`]: an index into the packet's pid table.
#[derive(Deserialize, Serialize)]
pub struct PidRef(usize);

/// A process id carried by a packet. Sent as `SCM_CREDENTIALS` so the kernel
/// rewrites the value into the receiving process's pid namespace.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct Pid(pub libc::pid_t);

impl FromPacket for Pid {
    type Dual = PidRef;
    fn decode_from_dual(value: Self::Dual, _fds: &[RawFd], pids: &[libc::pid_t]) -> Self {
        Pid(pids[value.0])
    }
    fn encode_to_dual(self, _fds: &mut Vec<RawFd>, pids: &mut Vec<libc::pid_t>) -> Self::Dual {
        let r = PidRef(pids.len());
        pids.push(self.0);
        r
    }
}

/// Conversion between a value carrying live kernel objects and its
/// serializable dual, with the objects parked in the packet side tables.
pub trait FromPacket {
    type Dual: Serialize + DeserializeOwned;
    fn decode_from_dual(value: Self::Dual, fds: &[RawFd], pids: &[libc::pid_t]) -> Self;
    fn encode_to_dual(self, fds: &mut Vec<RawFd>, pids: &mut Vec<libc::pid_t>) -> Self::Dual;

    fn from_packet_failable<A, E, F>(packet: TypedPacket<A>, deserialize: F) -> Result<Self, E>
    where
        Self: Sized,
        F: Fn(&A) -> Result<Self::Dual, E>,
    {
        let data = deserialize(&packet.data)?;
        Ok(Self::decode_from_dual(data, &packet.fds, &packet.pids))
    }

    fn to_packet<A, F>(self, serialize: F) -> TypedPacket<A>
    where
        Self: Sized,
        F: Fn(Self::Dual) -> A,
    {
        let mut fds = Vec::new();
        let mut pids = Vec::new();
        let dual = self.encode_to_dual(&mut fds, &mut pids);
        TypedPacket {
            data: serialize(dual),
            fds,
            pids,
        }
    }

    fn to_packet_failable<A, E, F>(self, serialize: F) -> Result<TypedPacket<A>, E>
    where
        Self: Sized,
        F: Fn(Self::Dual) -> Result<A, E>,
    {
        let mut fds = Vec::new();
        let mut pids = Vec::new();
        let dual = self.encode_to_dual(&mut fds, &mut pids);
        Ok(TypedPacket {
            data: serialize(dual)?,
            fds,
            pids,
        })
    }
}

// Every plainly serializable value is its own dual and touches no side table.
impl<T> FromPacket for T
where
    T: Serialize + DeserializeOwned,
{
    type Dual = Self;
    fn decode_from_dual(value: Self::Dual, _fds: &[RawFd], _pids: &[libc::pid_t]) -> Self {
        value
    }
    fn encode_to_dual(self, _fds: &mut Vec<RawFd>, _pids: &mut Vec<libc::pid_t>) -> Self::Dual {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fd_encoding_assigns_table_indices() {
        let mut fds = Vec::new();
        let mut pids = Vec::new();
        let a = Fd(7).encode_to_dual(&mut fds, &mut pids);
        let b = Fd(9).encode_to_dual(&mut fds, &mut pids);
        assert_eq!(a.0, 0);
        assert_eq!(b.0, 1);
        assert_eq!(fds, vec![7, 9]);
        assert!(pids.is_empty());

        let decoded = Fd::decode_from_dual(b, &fds, &pids);
        assert_eq!(decoded, Fd(9));
    }

    #[test]
    fn pid_encoding_uses_pid_table() {
        let mut fds = Vec::new();
        let mut pids = Vec::new();
        let dual = Pid(42).encode_to_dual(&mut fds, &mut pids);
        assert!(fds.is_empty());
        assert_eq!(pids, vec![42]);
        assert_eq!(Pid::decode_from_dual(dual, &fds, &pids), Pid(42));
    }

    #[test]
    fn serde_values_pass_through() {
        let mut fds = Vec::new();
        let mut pids = Vec::new();
        let dual = String::from("hello").encode_to_dual(&mut fds, &mut pids);
        assert!(fds.is_empty() && pids.is_empty());
        assert_eq!(String::decode_from_dual(dual, &fds, &pids), "hello");
    }
}
