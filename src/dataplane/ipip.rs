//! IP-in-IP encapsulation toward Grantors and back.
//!
//! The outer header carries the packet priority in the DSCP bits so that
//! Grantors can police by priority before decapsulating. Encapsulation
//! consumes the inner Ethernet header: the prepended outer headers overlay
//! it, and the rewritten Ethernet header addresses the nexthop.

use std::net::{Ipv4Addr, Ipv6Addr};

use crate::dataplane::buffer::{PktBuf, OL_TX_IPV4, OL_TX_IP_CKSUM, OL_TX_OUTER_IPV4};
use crate::error::{Error, Result};

/// IP protocol number for IP-in-IP.
pub const IPPROTO_IPIP: u8 = 4;

/// Version 4, IHL 5.
pub const IP_VHL_DEF: u8 = 0x45;
/// Default TTL, from RFC 1340.
pub const IP_DEFTTL: u8 = 64;
/// IPv6 version nibble in the vtc_flow word.
pub const IPV6_DEFAULT_VTC_FLOW: u32 = 0x6000_0000;
/// Hop limit used on outer IPv6 headers.
pub const IPV6_DEFAULT_HOP_LIMITS: u8 = 0xff;

const ETH_HDR_LEN: usize = 14;
const IPV4_HDR_LEN: usize = 20;
const IPV6_HDR_LEN: usize = 40;

const ETHER_TYPE_IPV4: u16 = 0x0800;
const ETHER_TYPE_IPV6: u16 = 0x86dd;

/// The outer flow of a tunnel: Gatekeeper address to Grantor address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpFlow {
    V4 { src: Ipv4Addr, dst: Ipv4Addr },
    V6 { src: Ipv6Addr, dst: Ipv6Addr },
}

impl Default for IpFlow {
    fn default() -> Self {
        IpFlow::V4 {
            src: Ipv4Addr::UNSPECIFIED,
            dst: Ipv4Addr::UNSPECIFIED,
        }
    }
}

/// Addressing of one tunnel hop. Decapsulation fills this in;
/// encapsulation consumes it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TunnelInfo {
    pub flow: IpFlow,
    pub source_mac: [u8; 6],
    pub nexthop_mac: [u8; 6],
}

/// Prepend an outer IP header and rewrite the Ethernet header.
///
/// The packet must start with an Ethernet header. `priority` lands in the
/// outer DSCP bits. Fails (leaving the packet intact) when the headroom
/// cannot hold the outer header.
pub fn encapsulate(pkt: &mut PktBuf, priority: u8, info: &TunnelInfo) -> Result<()> {
    match info.flow {
        IpFlow::V4 { src, dst } => {
            let total_len = pkt.len() + IPV4_HDR_LEN;
            let hdr = pkt.prepend(IPV4_HDR_LEN)?;
            // The prepended region plus the old Ethernet header hold the
            // new Ethernet header and the outer IPv4 header.
            debug_assert!(hdr.len() == IPV4_HDR_LEN);

            let data = pkt.data_mut();
            data[0..6].copy_from_slice(&info.nexthop_mac);
            data[6..12].copy_from_slice(&info.source_mac);
            data[12..14].copy_from_slice(&ETHER_TYPE_IPV4.to_be_bytes());

            let ip = &mut data[ETH_HDR_LEN..ETH_HDR_LEN + IPV4_HDR_LEN];
            ip[0] = IP_VHL_DEF;
            ip[1] = priority << 2;
            let ip_total = (total_len - ETH_HDR_LEN) as u16;
            ip[2..4].copy_from_slice(&ip_total.to_be_bytes());
            ip[4..6].copy_from_slice(&0u16.to_be_bytes()); // id
            ip[6..8].copy_from_slice(&0x4000u16.to_be_bytes()); // DF
            ip[8] = IP_DEFTTL;
            ip[9] = IPPROTO_IPIP;
            // Checksum calculation is offloaded.
            ip[10..12].copy_from_slice(&0u16.to_be_bytes());
            ip[12..16].copy_from_slice(&src.octets());
            ip[16..20].copy_from_slice(&dst.octets());

            pkt.outer_l2_len = ETH_HDR_LEN as u8;
            pkt.outer_l3_len = IPV4_HDR_LEN as u8;
            pkt.ol_flags |= OL_TX_IPV4 | OL_TX_IP_CKSUM | OL_TX_OUTER_IPV4;
        }
        IpFlow::V6 { src, dst } => {
            let total_len = pkt.len() + IPV6_HDR_LEN;
            pkt.prepend(IPV6_HDR_LEN)?;

            let data = pkt.data_mut();
            data[0..6].copy_from_slice(&info.nexthop_mac);
            data[6..12].copy_from_slice(&info.source_mac);
            data[12..14].copy_from_slice(&ETHER_TYPE_IPV6.to_be_bytes());

            let ip = &mut data[ETH_HDR_LEN..ETH_HDR_LEN + IPV6_HDR_LEN];
            let vtc_flow = IPV6_DEFAULT_VTC_FLOW | ((priority as u32) << 22);
            ip[0..4].copy_from_slice(&vtc_flow.to_be_bytes());
            let payload_len = (total_len - ETH_HDR_LEN - IPV6_HDR_LEN) as u16;
            ip[4..6].copy_from_slice(&payload_len.to_be_bytes());
            ip[6] = IPPROTO_IPIP;
            ip[7] = IPV6_DEFAULT_HOP_LIMITS;
            ip[8..24].copy_from_slice(&src.octets());
            ip[24..40].copy_from_slice(&dst.octets());

            pkt.outer_l2_len = ETH_HDR_LEN as u8;
            pkt.outer_l3_len = IPV6_HDR_LEN as u8;
        }
    }
    Ok(())
}

/// Strip the outer Ethernet and IP headers, recovering the priority and,
/// for priorities ≥ 2, the tunnel addressing (carried back to the sender).
pub fn decapsulate(pkt: &mut PktBuf, info: &mut TunnelInfo) -> Result<u8> {
    let data = pkt.data();
    if data.len() < ETH_HDR_LEN {
        return Err(Error::Malformed("short outer Ethernet header"));
    }
    let ethertype = u16::from_be_bytes([data[12], data[13]]);

    let (priority, l4_proto, outer_len) = match ethertype {
        ETHER_TYPE_IPV4 => {
            if data.len() < ETH_HDR_LEN + IPV4_HDR_LEN {
                return Err(Error::Malformed("short outer IPv4 header"));
            }
            let ip = &data[ETH_HDR_LEN..];
            let priority = ip[1] >> 2;
            if priority >= 2 {
                info.flow = IpFlow::V4 {
                    src: Ipv4Addr::new(ip[12], ip[13], ip[14], ip[15]),
                    dst: Ipv4Addr::new(ip[16], ip[17], ip[18], ip[19]),
                };
            }
            (priority, ip[9], ETH_HDR_LEN + IPV4_HDR_LEN)
        }
        ETHER_TYPE_IPV6 => {
            if data.len() < ETH_HDR_LEN + IPV6_HDR_LEN {
                return Err(Error::Malformed("short outer IPv6 header"));
            }
            let ip = &data[ETH_HDR_LEN..];
            let vtc_flow = u32::from_be_bytes([ip[0], ip[1], ip[2], ip[3]]);
            let priority = (((vtc_flow >> 20) & 0xff) >> 2) as u8;
            if priority >= 2 {
                let mut src = [0u8; 16];
                let mut dst = [0u8; 16];
                src.copy_from_slice(&ip[8..24]);
                dst.copy_from_slice(&ip[24..40]);
                info.flow = IpFlow::V6 {
                    src: Ipv6Addr::from(src),
                    dst: Ipv6Addr::from(dst),
                };
            }
            (priority, ip[6], ETH_HDR_LEN + IPV6_HDR_LEN)
        }
        _ => return Err(Error::Malformed("outer ethertype is not IP")),
    };

    if l4_proto != IPPROTO_IPIP {
        return Err(Error::Malformed("outer protocol is not IP-in-IP"));
    }

    if priority >= 2 {
        info.source_mac.copy_from_slice(&data[6..12]);
        info.nexthop_mac.copy_from_slice(&data[0..6]);
    }

    pkt.adj(outer_len)?;
    Ok(priority)
}
