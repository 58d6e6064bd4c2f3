//! Kernel routing events for the external FIB manager.
//!
//! The CPS block opens a netlink routing socket at stage 2 and drains one
//! batch of events per worker iteration. Decoded updates go to a
//! `FibSink`; the FIB itself (LPM tables, neighbor caches) lives outside
//! this crate.

use std::net::IpAddr;
use std::os::fd::{AsRawFd, OwnedFd};

use ipnet::IpNet;
use netlink_packet_core::{NetlinkMessage, NetlinkPayload};
use netlink_packet_route::route::{RouteAddress, RouteAttribute, RouteMessage};
use netlink_packet_route::{AddressFamily, RouteNetlinkMessage};
use nix::sys::socket::{
    bind, socket, AddressFamily as NixAddressFamily, MsgFlags, NetlinkAddr, SockFlag, SockProtocol,
    SockType,
};
use tracing::warn;

use crate::error::Result;

/// Multicast group carrying IPv4 route changes.
const RTMGRP_IPV4_ROUTE: u32 = 0x40;
/// Multicast group carrying IPv6 route changes.
const RTMGRP_IPV6_ROUTE: u32 = 0x400;

const RECV_BUF_LEN: usize = 8192;

/// What the data plane should do with packets matching a FIB entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FibAction {
    /// Encapsulate toward the responsible Grantor.
    FwdGrantor,
    /// Forward to a gateway in the front network.
    FwdGatewayFrontNet,
    /// Forward to a gateway in the back network.
    FwdGatewayBackNet,
    /// The destination is a neighbor in the front network.
    FwdNeighborFrontNet,
    /// The destination is a neighbor in the back network.
    FwdNeighborBackNet,
    /// Drop the packet.
    Drop,
}

impl FibAction {
    /// Direction-agnostic neighbor check for call sites that do not care
    /// which network the neighbor sits in.
    pub fn is_neighbor(&self) -> bool {
        matches!(
            self,
            FibAction::FwdNeighborFrontNet | FibAction::FwdNeighborBackNet
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOp {
    Add,
    Remove,
}

/// One decoded kernel routing change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteUpdate {
    pub op: RouteOp,
    pub prefix: IpNet,
    pub gateway: Option<IpAddr>,
    /// Kernel interface index of the egress device, when present.
    pub oif: Option<u32>,
}

/// Consumer of routing updates: the external FIB manager.
pub trait FibSink: Send + Sync {
    fn route_update(&self, update: RouteUpdate);
}

/// The netlink routing socket, open from stage 2 until teardown.
pub struct RouteEventSocket {
    fd: OwnedFd,
}

impl RouteEventSocket {
    /// Open a non-blocking routing socket subscribed to IPv4 and IPv6
    /// route changes.
    pub fn open() -> Result<Self> {
        let fd = socket(
            NixAddressFamily::Netlink,
            SockType::Raw,
            SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
            SockProtocol::NetlinkRoute,
        )?;
        let addr = NetlinkAddr::new(0, RTMGRP_IPV4_ROUTE | RTMGRP_IPV6_ROUTE);
        bind(fd.as_raw_fd(), &addr)?;
        Ok(Self { fd })
    }

    /// Drain one batch of pending events into `sink`.
    ///
    /// Returns the number of updates delivered; an empty socket is not an
    /// error.
    pub fn poll(&self, sink: &dyn FibSink) -> Result<usize> {
        let mut buf = [0u8; RECV_BUF_LEN];
        match nix::sys::socket::recv(self.fd.as_raw_fd(), &mut buf, MsgFlags::MSG_DONTWAIT) {
            Ok(len) => Ok(decode_batch(&buf[..len], sink)),
            Err(nix::errno::Errno::EAGAIN) => Ok(0),
            Err(e) => Err(e.into()),
        }
    }
}

/// Decode every netlink message in one received datagram.
fn decode_batch(mut buf: &[u8], sink: &dyn FibSink) -> usize {
    let mut delivered = 0;
    while buf.len() >= 16 {
        let msg = match NetlinkMessage::<RouteNetlinkMessage>::deserialize(buf) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(error = %e, "failed to parse a routing event");
                break;
            }
        };
        let msg_len = msg.header.length as usize;

        match msg.payload {
            NetlinkPayload::InnerMessage(RouteNetlinkMessage::NewRoute(route)) => {
                if let Some(update) = decode_route(RouteOp::Add, &route) {
                    sink.route_update(update);
                    delivered += 1;
                }
            }
            NetlinkPayload::InnerMessage(RouteNetlinkMessage::DelRoute(route)) => {
                if let Some(update) = decode_route(RouteOp::Remove, &route) {
                    sink.route_update(update);
                    delivered += 1;
                }
            }
            _ => {}
        }

        if msg_len == 0 || msg_len > buf.len() {
            break;
        }
        buf = &buf[msg_len..];
    }
    delivered
}

fn route_addr_to_ip(addr: &RouteAddress) -> Option<IpAddr> {
    match addr {
        RouteAddress::Inet(v4) => Some(IpAddr::V4(*v4)),
        RouteAddress::Inet6(v6) => Some(IpAddr::V6(*v6)),
        _ => None,
    }
}

fn decode_route(op: RouteOp, route: &RouteMessage) -> Option<RouteUpdate> {
    let plen = route.header.destination_prefix_length;

    let mut destination = None;
    let mut gateway = None;
    let mut oif = None;
    for attr in &route.attributes {
        match attr {
            RouteAttribute::Destination(addr) => destination = route_addr_to_ip(addr),
            RouteAttribute::Gateway(addr) => gateway = route_addr_to_ip(addr),
            RouteAttribute::Oif(idx) => oif = Some(*idx),
            _ => {}
        }
    }

    // A default route carries no destination attribute.
    let dest = destination.or(match route.header.address_family {
        AddressFamily::Inet => Some(IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED)),
        AddressFamily::Inet6 => Some(IpAddr::V6(std::net::Ipv6Addr::UNSPECIFIED)),
        _ => None,
    })?;

    let prefix = IpNet::new(dest, plen).ok()?;
    Some(RouteUpdate {
        op,
        prefix,
        gateway,
        oif,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use std::sync::Mutex;

    struct CollectingSink(Mutex<Vec<RouteUpdate>>);

    impl FibSink for CollectingSink {
        fn route_update(&self, update: RouteUpdate) {
            self.0.lock().unwrap().push(update);
        }
    }

    fn serialize(msg: RouteNetlinkMessage) -> Vec<u8> {
        let mut nl = NetlinkMessage::from(msg);
        nl.finalize();
        let mut buf = vec![0u8; nl.buffer_len()];
        nl.serialize(&mut buf);
        buf
    }

    fn sample_route() -> RouteMessage {
        let mut route = RouteMessage::default();
        route.header.address_family = AddressFamily::Inet;
        route.header.destination_prefix_length = 16;
        route
            .attributes
            .push(RouteAttribute::Destination(RouteAddress::Inet(
                Ipv4Addr::new(10, 1, 0, 0),
            )));
        route
            .attributes
            .push(RouteAttribute::Gateway(RouteAddress::Inet(Ipv4Addr::new(
                10, 0, 0, 1,
            ))));
        route.attributes.push(RouteAttribute::Oif(3));
        route
    }

    #[test]
    fn test_decode_new_route() {
        let buf = serialize(RouteNetlinkMessage::NewRoute(sample_route()));
        let sink = CollectingSink(Mutex::new(Vec::new()));
        assert_eq!(decode_batch(&buf, &sink), 1);

        let updates = sink.0.into_inner().unwrap();
        assert_eq!(updates[0].op, RouteOp::Add);
        assert_eq!(updates[0].prefix, "10.1.0.0/16".parse::<IpNet>().unwrap());
        assert_eq!(
            updates[0].gateway,
            Some(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)))
        );
        assert_eq!(updates[0].oif, Some(3));
    }

    #[test]
    fn test_decode_del_route_batch() {
        let mut buf = serialize(RouteNetlinkMessage::NewRoute(sample_route()));
        buf.extend(serialize(RouteNetlinkMessage::DelRoute(sample_route())));

        let sink = CollectingSink(Mutex::new(Vec::new()));
        assert_eq!(decode_batch(&buf, &sink), 2);
        let updates = sink.0.into_inner().unwrap();
        assert_eq!(updates[0].op, RouteOp::Add);
        assert_eq!(updates[1].op, RouteOp::Remove);
    }

    #[test]
    fn test_garbage_stops_batch() {
        let sink = CollectingSink(Mutex::new(Vec::new()));
        assert_eq!(decode_batch(&[0xff; 24], &sink), 0);
    }

    #[test]
    fn test_neighbor_actions() {
        assert!(FibAction::FwdNeighborFrontNet.is_neighbor());
        assert!(FibAction::FwdNeighborBackNet.is_neighbor());
        assert!(!FibAction::FwdGrantor.is_neighbor());
        assert!(!FibAction::Drop.is_neighbor());
    }
}
