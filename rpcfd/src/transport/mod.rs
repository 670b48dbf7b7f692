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

use nix::sys::socket::{
    recvmsg, sendmsg, setsockopt, sockopt, ControlMessage, ControlMessageOwned, MsgFlags,
    UnixCredentials,
};
use std::io::{IoSlice, IoSliceMut, Read, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use thiserror::Error;

pub mod tokio_io;

/// Most descriptors a single packet may carry.
pub const MAX_FDS: usize = 64;

/// Most pids a single packet may carry. `SCM_CREDENTIALS` admits one ucred
/// per message, so the protocol allows exactly one.
pub const MAX_PIDS: usize = 1;

/// Packet header: data length, fd count, pid count, big endian.
const HEADER_LEN: usize = 24;

#[derive(Error, Debug)]
pub enum ChannelError {
    #[error("packet carries more file descriptors than the transport allows")]
    TooManyFds,
    #[error("packet carries more pids than the transport allows")]
    TooManyPids,
    #[error("ancillary data truncated by the kernel")]
    Truncated,
    #[error("peer closed the connection")]
    Disconnected,
    #[error("transport error: {0}")]
    Io(#[from] std::io::Error),
}

/// Send and receive packets over a stream socket, with the fd table attached
/// as `SCM_RIGHTS` and the pid table as `SCM_CREDENTIALS`.
pub trait PacketTransport {
    fn send_packet(&mut self, packet: &Packet) -> Result<(), ChannelError>;
    fn recv_packet(&mut self) -> Result<Packet, ChannelError>;
}

impl PacketTransport for UnixStream {
    fn send_packet(&mut self, packet: &Packet) -> Result<(), ChannelError> {
        check_limits(packet)?;
        self.write_all(&encode_header(packet))?;
        if packet.data.is_empty() {
            return Ok(());
        }
        let mut sent = send_once(self.as_raw_fd(), &packet.data, &packet.fds, &packet.pids)
            .map_err(std::io::Error::from)?;
        while sent < packet.data.len() {
            sent += self.write(&packet.data[sent..])?;
        }
        Ok(())
    }

    fn recv_packet(&mut self) -> Result<Packet, ChannelError> {
        let mut header = [0u8; HEADER_LEN];
        read_header(self, &mut header)?;
        let (data_len, _fds_count, pids_count) = decode_header(&header)?;

        let mut data = vec![0u8; data_len];
        let mut fds = Vec::new();
        let mut pids = Vec::new();
        if data_len == 0 {
            return Ok(Packet { data, fds, pids });
        }
        let mut received = recv_once(self.as_raw_fd(), pids_count, &mut data, &mut fds, &mut pids)
            .map_err(map_recv_error)?;
        if received == 0 {
            return Err(ChannelError::Disconnected);
        }
        while received < data_len {
            let len = self.read(&mut data[received..])?;
            if len == 0 {
                return Err(ChannelError::Disconnected);
            }
            received += len;
        }
        Ok(Packet { data, fds, pids })
    }
}

/// Receiving translated pids requires `SO_PASSCRED` on the socket; without it
/// the kernel will not deliver the credentials message.
pub fn enable_pid_passing<F: AsRawFd>(socket: &F) -> nix::Result<()> {
    setsockopt(socket.as_raw_fd(), sockopt::PassCred, &true)
}

fn check_limits(packet: &Packet) -> Result<(), ChannelError> {
    if packet.fds.len() > MAX_FDS {
        return Err(ChannelError::TooManyFds);
    }
    if packet.pids.len() > MAX_PIDS {
        return Err(ChannelError::TooManyPids);
    }
    Ok(())
}

fn encode_header(packet: &Packet) -> [u8; HEADER_LEN] {
    let mut header = [0u8; HEADER_LEN];
    header[0..8].copy_from_slice(&(packet.data.len() as u64).to_be_bytes());
    header[8..16].copy_from_slice(&(packet.fds.len() as u64).to_be_bytes());
    header[16..24].copy_from_slice(&(packet.pids.len() as u64).to_be_bytes());
    header
}

fn decode_header(header: &[u8; HEADER_LEN]) -> Result<(usize, usize, usize), ChannelError> {
    let data_len = u64::from_be_bytes(header[0..8].try_into().unwrap()) as usize;
    let fds_count = u64::from_be_bytes(header[8..16].try_into().unwrap()) as usize;
    let pids_count = u64::from_be_bytes(header[16..24].try_into().unwrap()) as usize;
    if fds_count > MAX_FDS {
        return Err(ChannelError::TooManyFds);
    }
    if pids_count > MAX_PIDS {
        return Err(ChannelError::TooManyPids);
    }
    Ok((data_len, fds_count, pids_count))
}

fn read_header<R: Read>(reader: &mut R, header: &mut [u8; HEADER_LEN]) -> Result<(), ChannelError> {
    let first = reader.read(&mut header[..])?;
    if first == 0 {
        return Err(ChannelError::Disconnected);
    }
    let mut filled = first;
    while filled < HEADER_LEN {
        let len = reader.read(&mut header[filled..])?;
        if len == 0 {
            return Err(ChannelError::Disconnected);
        }
        filled += len;
    }
    Ok(())
}

/// First segment of a packet: the payload bytes with the ancillary messages
/// riding on them. The kernel attaches the whole fd table to this segment,
/// or fails the call, so a short send never leaks a partial fd transfer.
pub(crate) fn send_once(
    fd: RawFd,
    data: &[u8],
    fds: &[RawFd],
    pids: &[libc::pid_t],
) -> nix::Result<usize> {
    let iov = [IoSlice::new(data)];
    let creds: Vec<UnixCredentials> = pids
        .iter()
        .map(|pid| {
            UnixCredentials::from(libc::ucred {
                pid: *pid,
                uid: nix::unistd::getuid().as_raw(),
                gid: nix::unistd::getgid().as_raw(),
            })
        })
        .collect();

    let mut cmsgs: Vec<ControlMessage> = Vec::new();
    if !fds.is_empty() {
        cmsgs.push(ControlMessage::ScmRights(fds));
    }
    for cred in creds.iter() {
        cmsgs.push(ControlMessage::ScmCredentials(cred));
    }
    sendmsg::<()>(fd, &iov, &cmsgs, MsgFlags::empty(), None)
}

/// Counterpart of [`send_once`]. Received descriptors are installed with
/// close-on-exec so they never leak into a spawned child. When `SO_PASSCRED`
/// is active every message carries a credentials cmsg; only the first
/// `pids_count` of them belong to the packet.
///
/// Returns `Ok(0)` when the peer has hung up; truncated ancillary data is
/// reported as [`std::io::ErrorKind::InvalidData`] so the caller can map it
/// back to [`ChannelError::Truncated`].
pub(crate) fn recv_once(
    fd: RawFd,
    pids_count: usize,
    data: &mut [u8],
    fds: &mut Vec<RawFd>,
    pids: &mut Vec<libc::pid_t>,
) -> std::io::Result<usize> {
    let mut cmsg_buffer = nix::cmsg_space!([RawFd; MAX_FDS], [UnixCredentials; 2]);
    let mut iov = [IoSliceMut::new(data)];
    let msg = recvmsg::<()>(
        fd,
        &mut iov,
        Some(&mut cmsg_buffer),
        MsgFlags::MSG_CMSG_CLOEXEC,
    )
    .map_err(std::io::Error::from)?;
    if msg.flags.contains(MsgFlags::MSG_CTRUNC) {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "ancillary data truncated",
        ));
    }
    let bytes = msg.bytes;
    for cmsg in msg.cmsgs() {
        match cmsg {
            ControlMessageOwned::ScmRights(received) => fds.extend(received),
            ControlMessageOwned::ScmCredentials(creds) => {
                if pids.len() < pids_count {
                    pids.push(creds.pid());
                }
            }
            _ => {}
        }
    }
    Ok(bytes)
}

pub(crate) fn map_recv_error(err: std::io::Error) -> ChannelError {
    if err.kind() == std::io::ErrorKind::InvalidData {
        ChannelError::Truncated
    } else {
        ChannelError::Io(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::FromRawFd;

    #[test]
    fn packet_round_trip_with_fds() {
        let (mut a, mut b) = UnixStream::pair().expect("cannot make socket pair");

        let sender = std::thread::spawn(move || {
            let (c, mut d) = UnixStream::pair().expect("cannot make socket pair");
            let packet = Packet {
                data: vec![1u8, 2, 3, 4, 5],
                fds: vec![c.as_raw_fd()],
                pids: Vec::new(),
            };
            b.send_packet(&packet).expect("fail to send packet");
            d.write_all(b"hello world").expect("fail to write inner");
        });

        let packet = a.recv_packet().expect("fail at receiving packet");
        assert_eq!(packet.data, vec![1u8, 2, 3, 4, 5]);
        assert_eq!(packet.fds.len(), 1);
        assert!(packet.pids.is_empty());

        let mut c = unsafe { UnixStream::from_raw_fd(packet.fds[0]) };
        let mut buf = Vec::new();
        c.read_to_end(&mut buf).expect("cannot read inner pair");
        assert_eq!(buf, b"hello world".to_vec());

        sender.join().expect("cannot join sender");
    }

    #[test]
    fn pid_travels_as_credentials() {
        let (mut a, mut b) = UnixStream::pair().expect("cannot make socket pair");
        enable_pid_passing(&a).expect("cannot enable SO_PASSCRED");

        let own_pid = std::process::id() as libc::pid_t;
        let sender = std::thread::spawn(move || {
            let packet = Packet {
                data: b"{}".to_vec(),
                fds: Vec::new(),
                pids: vec![own_pid],
            };
            b.send_packet(&packet).expect("fail to send packet");
        });

        let packet = a.recv_packet().expect("fail at receiving packet");
        sender.join().expect("cannot join sender");

        // Same pid namespace on both ends, so the value survives unchanged.
        assert_eq!(packet.pids, vec![own_pid]);
    }

    #[test]
    fn disconnect_is_reported() {
        let (mut a, b) = UnixStream::pair().expect("cannot make socket pair");
        drop(b);
        match a.recv_packet() {
            Err(ChannelError::Disconnected) => {}
            other => panic!("expected disconnect, got {other:?}"),
        }
    }

    #[test]
    fn oversized_fd_table_is_refused() {
        let (mut a, _b) = UnixStream::pair().expect("cannot make socket pair");
        let packet = Packet {
            data: b"{}".to_vec(),
            fds: vec![0; MAX_FDS + 1],
            pids: Vec::new(),
        };
        assert!(matches!(
            a.send_packet(&packet),
            Err(ChannelError::TooManyFds)
        ));
    }
}
