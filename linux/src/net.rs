//! Container-side network setup over RTNETLINK
//!
//! The supervisor runs inside the container rootfs where no `ip`/`ifconfig`
//! binary can be assumed, so interface configuration talks to the kernel
//! directly: one request, one ack, per operation.

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

use netlink_packet_core::{
    NetlinkMessage, NetlinkPayload, NLM_F_ACK, NLM_F_CREATE, NLM_F_EXCL, NLM_F_REQUEST,
};
use netlink_packet_route::nlas::address::Nla as AddressNla;
use netlink_packet_route::nlas::link::Nla as LinkNla;
use netlink_packet_route::nlas::route::Nla as RouteNla;
use netlink_packet_route::rtnl::constants::{
    RTM_NEWADDR, RTM_NEWROUTE, RTM_SETLINK, RTN_UNICAST, RTPROT_BOOT, RT_SCOPE_UNIVERSE,
    RT_TABLE_MAIN,
};
use netlink_packet_route::{AddressMessage, LinkMessage, RouteMessage, RtnlMessage, IFF_UP};
use nix::errno::Errno;
use nix::net::if_::if_nametoindex;
use nix::sys::socket::{
    bind, recv, sendto, socket, AddressFamily, MsgFlags, NetlinkAddr, SockFlag, SockProtocol,
    SockType,
};
use nix::unistd::close;
use std::net::Ipv4Addr;
use std::os::fd::RawFd;
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum NetlinkError {
    #[error("no such interface: {0}")]
    NoInterface(String),
    #[error("netlink socket error: {0}")]
    Socket(#[from] nix::Error),
    #[error("cannot decode netlink reply: {0}")]
    Decode(String),
    #[error("kernel refused the request: {0}")]
    Refused(Errno),
}

#[derive(Error, Debug, PartialEq, Eq)]
#[error("invalid address in CIDR form: {0}")]
pub struct InvalidCidr(String);

/// An IPv4 interface address in CIDR form. A bare address is read as a /32.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cidr {
    address: Ipv4Addr,
    prefix: u8,
}

impl Cidr {
    pub fn address(&self) -> Ipv4Addr {
        self.address
    }

    pub fn prefix(&self) -> u8 {
        self.prefix
    }

    pub fn netmask(&self) -> Ipv4Addr {
        let bits = match self.prefix {
            0 => 0u32,
            prefix => u32::MAX << (32 - prefix as u32),
        };
        Ipv4Addr::from(bits)
    }
}

impl std::fmt::Display for Cidr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.address, self.prefix)
    }
}

impl FromStr for Cidr {
    type Err = InvalidCidr;
    fn from_str(s: &str) -> Result<Cidr, InvalidCidr> {
        let err = || InvalidCidr(s.to_string());
        match s.split_once('/') {
            None => Ok(Cidr {
                address: Ipv4Addr::from_str(s).map_err(|_| err())?,
                prefix: 32,
            }),
            Some((address, prefix)) => {
                let address = Ipv4Addr::from_str(address).map_err(|_| err())?;
                let prefix = prefix.parse::<u8>().map_err(|_| err())?;
                if prefix > 32 {
                    return Err(err());
                }
                Ok(Cidr { address, prefix })
            }
        }
    }
}

pub fn interface_index(interface: &str) -> Result<u32, NetlinkError> {
    if_nametoindex(interface)
        .map(|index| index as u32)
        .map_err(|_| NetlinkError::NoInterface(interface.to_string()))
}

/// Assign `cidr` to `interface`.
pub fn add_address(interface: &str, cidr: &Cidr) -> Result<(), NetlinkError> {
    let index = interface_index(interface)?;
    let mut message = AddressMessage::default();
    message.header.family = libc::AF_INET as u8;
    message.header.prefix_len = cidr.prefix();
    message.header.scope = RT_SCOPE_UNIVERSE as u8;
    message.header.index = index;
    let octets = cidr.address().octets().to_vec();
    message.nlas.push(AddressNla::Local(octets.clone()));
    message.nlas.push(AddressNla::Address(octets));
    transact(
        RtnlMessage::NewAddress(message),
        RTM_NEWADDR,
        NLM_F_REQUEST | NLM_F_ACK | NLM_F_CREATE | NLM_F_EXCL,
    )
}

pub fn set_mtu(interface: &str, mtu: u32) -> Result<(), NetlinkError> {
    let index = interface_index(interface)?;
    let mut message = LinkMessage::default();
    message.header.index = index;
    message.nlas.push(LinkNla::Mtu(mtu));
    transact(
        RtnlMessage::SetLink(message),
        RTM_SETLINK,
        NLM_F_REQUEST | NLM_F_ACK,
    )
}

pub fn link_up(interface: &str) -> Result<(), NetlinkError> {
    let index = interface_index(interface)?;
    let mut message = LinkMessage::default();
    message.header.index = index;
    message.header.flags |= IFF_UP;
    message.header.change_mask |= IFF_UP;
    transact(
        RtnlMessage::SetLink(message),
        RTM_SETLINK,
        NLM_F_REQUEST | NLM_F_ACK,
    )
}

/// Install the default route through `gateway` into the main table.
pub fn add_default_route(gateway: Ipv4Addr) -> Result<(), NetlinkError> {
    let mut message = RouteMessage::default();
    message.header.address_family = libc::AF_INET as u8;
    message.header.table = RT_TABLE_MAIN as u8;
    message.header.protocol = RTPROT_BOOT as u8;
    message.header.scope = RT_SCOPE_UNIVERSE as u8;
    message.header.kind = RTN_UNICAST as u8;
    message.nlas.push(RouteNla::Gateway(gateway.octets().to_vec()));
    transact(
        RtnlMessage::NewRoute(message),
        RTM_NEWROUTE,
        NLM_F_REQUEST | NLM_F_ACK | NLM_F_CREATE | NLM_F_EXCL,
    )
}

pub(crate) fn encode(payload: RtnlMessage, message_type: u16, flags: u16) -> Vec<u8> {
    let mut message = NetlinkMessage::from(payload);
    message.header.message_type = message_type;
    message.header.flags = flags;
    message.header.sequence_number = 1;
    message.header.length = message.buffer_len() as u32;
    let mut buffer = vec![0u8; message.buffer_len()];
    message.serialize(&mut buffer);
    buffer
}

fn transact(payload: RtnlMessage, message_type: u16, flags: u16) -> Result<(), NetlinkError> {
    let buffer = encode(payload, message_type, flags);
    let sock = NetlinkSocket::open()?;
    sock.send(&buffer)?;
    sock.recv_ack()
}

struct NetlinkSocket {
    fd: RawFd,
}

impl Drop for NetlinkSocket {
    fn drop(&mut self) {
        let _ = close(self.fd);
    }
}

impl NetlinkSocket {
    fn open() -> nix::Result<NetlinkSocket> {
        let fd = socket(
            AddressFamily::Netlink,
            SockType::Raw,
            SockFlag::SOCK_CLOEXEC,
            SockProtocol::NetlinkRoute,
        )?;
        bind(fd, &NetlinkAddr::new(0, 0))?;
        Ok(NetlinkSocket { fd })
    }

    fn send(&self, buffer: &[u8]) -> nix::Result<()> {
        let kernel = NetlinkAddr::new(0, 0);
        let mut sent = 0;
        while sent < buffer.len() {
            sent += sendto(self.fd, &buffer[sent..], &kernel, MsgFlags::empty())?;
        }
        Ok(())
    }

    fn recv_ack(&self) -> Result<(), NetlinkError> {
        let mut buffer = [0u8; 4096];
        let len = recv(self.fd, &mut buffer, MsgFlags::empty()).map_err(NetlinkError::Socket)?;
        let reply = NetlinkMessage::<RtnlMessage>::deserialize(&buffer[..len])
            .map_err(|err| NetlinkError::Decode(err.to_string()))?;
        match reply.payload {
            NetlinkPayload::Ack(_) => Ok(()),
            NetlinkPayload::Error(err) if err.code == 0 => Ok(()),
            NetlinkPayload::Error(err) => Err(NetlinkError::Refused(Errno::from_i32(-err.code))),
            _ => Err(NetlinkError::Decode("unexpected reply payload".to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cidr_parsing() {
        let cidr: Cidr = "10.0.0.2/24".parse().unwrap();
        assert_eq!(cidr.address(), Ipv4Addr::new(10, 0, 0, 2));
        assert_eq!(cidr.prefix(), 24);
        assert_eq!(cidr.netmask(), Ipv4Addr::new(255, 255, 255, 0));
        assert_eq!(cidr.to_string(), "10.0.0.2/24");

        let bare: Cidr = "192.168.1.1".parse().unwrap();
        assert_eq!(bare.prefix(), 32);

        assert!("10.0.0.2/33".parse::<Cidr>().is_err());
        assert!("not-an-address/8".parse::<Cidr>().is_err());
        assert!("10.0.0.2/abc".parse::<Cidr>().is_err());
    }

    #[test]
    fn netmask_edges() {
        assert_eq!("0.0.0.0/0".parse::<Cidr>().unwrap().netmask(), Ipv4Addr::new(0, 0, 0, 0));
        assert_eq!(
            "1.2.3.4/32".parse::<Cidr>().unwrap().netmask(),
            Ipv4Addr::new(255, 255, 255, 255)
        );
    }

    #[test]
    fn link_up_message_round_trips() {
        let mut link = LinkMessage::default();
        link.header.index = 2;
        link.header.flags |= IFF_UP;
        link.header.change_mask |= IFF_UP;
        let buffer = encode(
            RtnlMessage::SetLink(link),
            RTM_SETLINK,
            NLM_F_REQUEST | NLM_F_ACK,
        );

        let parsed = NetlinkMessage::<RtnlMessage>::deserialize(&buffer).unwrap();
        assert_eq!(parsed.header.message_type, RTM_SETLINK);
        assert_eq!(parsed.header.flags, NLM_F_REQUEST | NLM_F_ACK);
        match parsed.payload {
            NetlinkPayload::InnerMessage(RtnlMessage::SetLink(link)) => {
                assert_eq!(link.header.index, 2);
                assert_eq!(link.header.flags & IFF_UP, IFF_UP);
            }
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[test]
    fn default_route_message_round_trips() {
        let mut route = RouteMessage::default();
        route.header.address_family = libc::AF_INET as u8;
        route.header.table = RT_TABLE_MAIN as u8;
        route.header.protocol = RTPROT_BOOT as u8;
        route.header.scope = RT_SCOPE_UNIVERSE as u8;
        route.header.kind = RTN_UNICAST as u8;
        route
            .nlas
            .push(RouteNla::Gateway(Ipv4Addr::new(10, 0, 0, 1).octets().to_vec()));
        let buffer = encode(
            RtnlMessage::NewRoute(route),
            RTM_NEWROUTE,
            NLM_F_REQUEST | NLM_F_ACK | NLM_F_CREATE | NLM_F_EXCL,
        );

        let parsed = NetlinkMessage::<RtnlMessage>::deserialize(&buffer).unwrap();
        match parsed.payload {
            NetlinkPayload::InnerMessage(RtnlMessage::NewRoute(route)) => {
                assert_eq!(route.header.table, RT_TABLE_MAIN as u8);
                assert_eq!(
                    route.nlas,
                    vec![RouteNla::Gateway(vec![10, 0, 0, 1])]
                );
            }
            other => panic!("unexpected payload: {other:?}"),
        }
    }
}
