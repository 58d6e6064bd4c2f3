//! Protocol packet builders for tests.
//!
//! Uses smoltcp for packet construction, matching the data plane's own
//! builders, except for TCP where a hand-built header is enough (the
//! steering paths never validate TCP checksums).

use std::net::{Ipv4Addr, Ipv6Addr};

use smoltcp::phy::ChecksumCapabilities;
use smoltcp::wire::{
    ArpOperation, ArpPacket, ArpRepr, EthernetAddress, EthernetFrame, EthernetProtocol,
    EthernetRepr, Icmpv6Packet, Icmpv6Repr, IpProtocol, Ipv6Packet, Ipv6Repr, NdiscRepr,
    RawHardwareAddress,
};

use crate::net::addr::{multicast_mac, solicited_node_multicast};

/// Broadcast MAC address.
pub const BROADCAST_MAC: [u8; 6] = [0xff; 6];

/// Build a plain Ethernet frame around a payload.
pub fn eth_frame(dst: [u8; 6], src: [u8; 6], ethertype: u16, payload: &[u8]) -> Vec<u8> {
    let mut frame = vec![0u8; 14 + payload.len()];
    frame[0..6].copy_from_slice(&dst);
    frame[6..12].copy_from_slice(&src);
    frame[12..14].copy_from_slice(&ethertype.to_be_bytes());
    frame[14..].copy_from_slice(payload);
    frame
}

/// An ARP request as the kernel would emit it when resolving `target_ip`.
pub fn arp_request(sender_mac: [u8; 6], sender_ip: Ipv4Addr, target_ip: Ipv4Addr) -> Vec<u8> {
    let eth_repr = EthernetRepr {
        src_addr: EthernetAddress::from_bytes(&sender_mac),
        dst_addr: EthernetAddress::BROADCAST,
        ethertype: EthernetProtocol::Arp,
    };
    let arp_repr = ArpRepr::EthernetIpv4 {
        operation: ArpOperation::Request,
        source_hardware_addr: EthernetAddress::from_bytes(&sender_mac),
        source_protocol_addr: sender_ip,
        target_hardware_addr: EthernetAddress::from_bytes(&[0; 6]),
        target_protocol_addr: target_ip,
    };

    let mut buf = vec![0u8; eth_repr.buffer_len() + arp_repr.buffer_len()];
    let mut frame = EthernetFrame::new_unchecked(&mut buf);
    eth_repr.emit(&mut frame);
    let mut arp = ArpPacket::new_unchecked(frame.payload_mut());
    arp_repr.emit(&mut arp);
    buf
}

/// A neighbor solicitation as the kernel would emit it from `src_ip`
/// (one of the interface's own addresses) when resolving `target`.
pub fn neighbor_solicitation(src_mac: [u8; 6], src_ip: Ipv6Addr, target: Ipv6Addr) -> Vec<u8> {
    let dst_ip = solicited_node_multicast(&target);

    let icmp_repr = Icmpv6Repr::Ndisc(NdiscRepr::NeighborSolicit {
        target_addr: target,
        lladdr: Some(RawHardwareAddress::from_bytes(&src_mac)),
    });
    let ipv6_repr = Ipv6Repr {
        src_addr: src_ip,
        dst_addr: dst_ip,
        next_header: IpProtocol::Icmpv6,
        payload_len: icmp_repr.buffer_len(),
        hop_limit: 255,
    };
    let eth_repr = EthernetRepr {
        src_addr: EthernetAddress::from_bytes(&src_mac),
        dst_addr: EthernetAddress::from_bytes(&multicast_mac(&dst_ip)),
        ethertype: EthernetProtocol::Ipv6,
    };

    let total = eth_repr.buffer_len() + ipv6_repr.buffer_len() + icmp_repr.buffer_len();
    let mut buf = vec![0u8; total];
    let mut frame = EthernetFrame::new_unchecked(&mut buf);
    eth_repr.emit(&mut frame);
    let mut ipv6 = Ipv6Packet::new_unchecked(frame.payload_mut());
    ipv6_repr.emit(&mut ipv6);
    let mut icmp = Icmpv6Packet::new_unchecked(ipv6.payload_mut());
    icmp_repr.emit(&src_ip, &dst_ip, &mut icmp, &ChecksumCapabilities::default());
    buf
}

/// An IPv6/TCP frame (BGP when a port is 179). The TCP checksum is left
/// zero; the steering paths never verify it.
pub fn tcp6_packet(
    dst_mac: [u8; 6],
    src_mac: [u8; 6],
    src_ip: Ipv6Addr,
    dst_ip: Ipv6Addr,
    src_port: u16,
    dst_port: u16,
) -> Vec<u8> {
    let mut l3 = vec![0u8; 40 + 20];
    l3[0] = 0x60;
    l3[4..6].copy_from_slice(&20u16.to_be_bytes()); // payload length
    l3[6] = 6; // TCP
    l3[7] = 64;
    l3[8..24].copy_from_slice(&src_ip.octets());
    l3[24..40].copy_from_slice(&dst_ip.octets());
    l3[40..42].copy_from_slice(&src_port.to_be_bytes());
    l3[42..44].copy_from_slice(&dst_port.to_be_bytes());
    l3[52] = 0x50; // data offset 5
    eth_frame(dst_mac, src_mac, 0x86dd, &l3)
}

/// An IPv4/TCP frame (BGP when a port is 179).
pub fn tcp4_packet(
    dst_mac: [u8; 6],
    src_mac: [u8; 6],
    src_ip: Ipv4Addr,
    dst_ip: Ipv4Addr,
    src_port: u16,
    dst_port: u16,
) -> Vec<u8> {
    let mut l3 = vec![0u8; 20 + 20];
    l3[0] = 0x45;
    l3[2..4].copy_from_slice(&40u16.to_be_bytes());
    l3[8] = 64;
    l3[9] = 6; // TCP
    l3[12..16].copy_from_slice(&src_ip.octets());
    l3[16..20].copy_from_slice(&dst_ip.octets());
    l3[20..22].copy_from_slice(&src_port.to_be_bytes());
    l3[22..24].copy_from_slice(&dst_port.to_be_bytes());
    l3[32] = 0x50;
    eth_frame(dst_mac, src_mac, 0x0800, &l3)
}
