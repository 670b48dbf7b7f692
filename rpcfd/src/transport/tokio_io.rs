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
use crate::packet::Packet;
use crate::transport::{recv_once, send_once, ChannelError};

use std::io::ErrorKind;
use std::os::fd::AsRawFd;
use tokio::io::Interest;
use tokio::net::UnixStream;

/// Packet transport over a tokio socket. Methods take `&self` so one task can
/// keep receiving (and observe the peer hanging up) while another writes
/// responses on the same stream.
#[async_trait::async_trait]
pub trait AsyncPacketTransport {
    async fn send_packet(&self, packet: &Packet) -> Result<(), ChannelError>;
    async fn recv_packet(&self) -> Result<Packet, ChannelError>;
}

#[async_trait::async_trait]
impl AsyncPacketTransport for UnixStream {
    async fn send_packet(&self, packet: &Packet) -> Result<(), ChannelError> {
        super::check_limits(packet)?;
        write_exact(self, &super::encode_header(packet)).await?;
        if packet.data.is_empty() {
            return Ok(());
        }
        let fd = self.as_raw_fd();
        let mut sent = loop {
            self.writable().await?;
            match self.try_io(Interest::WRITABLE, || {
                send_once(fd, &packet.data, &packet.fds, &packet.pids)
                    .map_err(std::io::Error::from)
            }) {
                Ok(len) => break len,
                Err(err) if err.kind() == ErrorKind::WouldBlock => continue,
                Err(err) => return Err(err.into()),
            }
        };
        while sent < packet.data.len() {
            self.writable().await?;
            match self.try_write(&packet.data[sent..]) {
                Ok(len) => sent += len,
                Err(err) if err.kind() == ErrorKind::WouldBlock => continue,
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }

    async fn recv_packet(&self) -> Result<Packet, ChannelError> {
        let mut header = [0u8; super::HEADER_LEN];
        read_exact(self, &mut header).await?;
        let (data_len, _fds_count, pids_count) = super::decode_header(&header)?;

        let mut data = vec![0u8; data_len];
        let mut fds = Vec::new();
        let mut pids = Vec::new();
        if data_len == 0 {
            return Ok(Packet { data, fds, pids });
        }
        let fd = self.as_raw_fd();
        let mut received = loop {
            self.readable().await?;
            match self.try_io(Interest::READABLE, || {
                recv_once(fd, pids_count, &mut data, &mut fds, &mut pids)
            }) {
                Ok(0) => return Err(ChannelError::Disconnected),
                Ok(len) => break len,
                Err(err) if err.kind() == ErrorKind::WouldBlock => continue,
                Err(err) => return Err(super::map_recv_error(err)),
            }
        };
        while received < data_len {
            self.readable().await?;
            match self.try_read(&mut data[received..]) {
                Ok(0) => return Err(ChannelError::Disconnected),
                Ok(len) => received += len,
                Err(err) if err.kind() == ErrorKind::WouldBlock => continue,
                Err(err) => return Err(err.into()),
            }
        }
        Ok(Packet { data, fds, pids })
    }
}

async fn read_exact(stream: &UnixStream, buf: &mut [u8]) -> Result<(), ChannelError> {
    let mut filled = 0;
    while filled < buf.len() {
        stream.readable().await?;
        match stream.try_read(&mut buf[filled..]) {
            Ok(0) => return Err(ChannelError::Disconnected),
            Ok(len) => filled += len,
            Err(err) if err.kind() == ErrorKind::WouldBlock => continue,
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

async fn write_exact(stream: &UnixStream, buf: &[u8]) -> Result<(), ChannelError> {
    let mut sent = 0;
    while sent < buf.len() {
        stream.writable().await?;
        match stream.try_write(&buf[sent..]) {
            Ok(len) => sent += len,
            Err(err) if err.kind() == ErrorKind::WouldBlock => continue,
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}
