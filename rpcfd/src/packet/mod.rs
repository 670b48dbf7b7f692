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
pub mod codec;

use std::os::fd::RawFd;

/// A unit of transfer on the control socket: the serialized payload plus the
/// descriptors and pids that travel out-of-band with it.
#[derive(Debug, Default)]
pub struct Packet {
    pub data: Vec<u8>,
    pub fds: Vec<RawFd>,
    pub pids: Vec<libc::pid_t>,
}

/// A packet whose payload has been decoded into (or not yet encoded from) a
/// typed value. The fd and pid tables are carried through untouched so that
/// carrier values can refer into them by index.
#[derive(Debug)]
pub struct TypedPacket<T> {
    pub data: T,
    pub fds: Vec<RawFd>,
    pub pids: Vec<libc::pid_t>,
}

impl<T> TypedPacket<T> {
    pub fn map<A, F>(self, transform: F) -> TypedPacket<A>
    where
        F: FnOnce(T) -> A,
    {
        TypedPacket {
            data: transform(self.data),
            fds: self.fds,
            pids: self.pids,
        }
    }

    pub fn map_failable<A, E, F>(self, transform: F) -> Result<TypedPacket<A>, E>
    where
        F: FnOnce(T) -> Result<A, E>,
    {
        Ok(TypedPacket {
            data: transform(self.data)?,
            fds: self.fds,
            pids: self.pids,
        })
    }
}

impl From<TypedPacket<Vec<u8>>> for Packet {
    fn from(packet: TypedPacket<Vec<u8>>) -> Packet {
        Packet {
            data: packet.data,
            fds: packet.fds,
            pids: packet.pids,
        }
    }
}

impl Packet {
    pub fn into_typed(self) -> TypedPacket<Vec<u8>> {
        TypedPacket {
            data: self.data,
            fds: self.fds,
            pids: self.pids,
        }
    }
}
