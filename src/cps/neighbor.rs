//! Outstanding neighbor-resolution requests and the replies that answer
//! them.
//!
//! When the kernel stack tries to resolve a neighbor, the CPS worker
//! intercepts the solicitation, records it here, and asks the link-layer
//! resolver to do the actual resolution on the wire. The resolver answers
//! through the mailbox; the worker then synthesizes an ARP reply or ND
//! advertisement the kernel will accept and clears the entry.
//!
//! Entries carry a single staleness bit instead of a timestamp: every
//! scan tick marks live entries stale and evicts the ones already stale,
//! so an entry the kernel stopped soliciting disappears after at most two
//! scan intervals.

use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

use smoltcp::phy::ChecksumCapabilities;
use smoltcp::wire::{
    ArpOperation, ArpPacket, ArpRepr, EthernetAddress, EthernetFrame, EthernetProtocol,
    EthernetRepr, Icmpv6Packet, Icmpv6Repr, IpProtocol, Ipv6Packet, Ipv6Repr,
    NdiscNeighborFlags, NdiscRepr, RawHardwareAddress,
};
use tracing::error;

use crate::dataplane::buffer::{BufferPool, PktBuf};

/// The link-layer resolver (LLS) seam.
///
/// `hold` starts a resolution and keeps it alive; `put` cancels it. `put`
/// is idempotent: a request satisfied by a reply may still be reported
/// stale by the next scan.
pub trait LinkResolver: Send + Sync {
    fn arp_enabled(&self) -> bool {
        true
    }
    fn nd_enabled(&self) -> bool {
        true
    }
    fn hold_arp(&self, ip: Ipv4Addr);
    fn put_arp(&self, ip: Ipv4Addr);
    fn hold_nd(&self, ip: Ipv6Addr);
    fn put_nd(&self, ip: Ipv6Addr);
}

/// A resolver that ignores everything; useful when no LLS block runs.
pub struct NullResolver;

impl LinkResolver for NullResolver {
    fn hold_arp(&self, _ip: Ipv4Addr) {}
    fn put_arp(&self, _ip: Ipv4Addr) {}
    fn hold_nd(&self, _ip: Ipv6Addr) {}
    fn put_nd(&self, _ip: Ipv6Addr) {}
}

struct ArpEntry {
    addr: Ipv4Addr,
    stale: bool,
}

struct NdEntry {
    addr: Ipv6Addr,
    stale: bool,
}

/// Outstanding resolution requests of one interface's CPI.
#[derive(Default)]
pub struct NeighborTracker {
    arp_requests: Vec<ArpEntry>,
    nd_requests: Vec<NdEntry>,
}

impl NeighborTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an outbound ARP solicitation: create the entry if absent and
    /// mark it live either way.
    pub fn note_arp_request(&mut self, addr: Ipv4Addr) {
        match self.arp_requests.iter_mut().find(|e| e.addr == addr) {
            Some(entry) => entry.stale = false,
            None => self.arp_requests.push(ArpEntry { addr, stale: false }),
        }
    }

    /// Record an outbound ND solicitation.
    pub fn note_nd_request(&mut self, addr: Ipv6Addr) {
        match self.nd_requests.iter_mut().find(|e| e.addr == addr) {
            Some(entry) => entry.stale = false,
            None => self.nd_requests.push(NdEntry { addr, stale: false }),
        }
    }

    /// Remove the first entry matching `addr`. Returns whether one existed.
    pub fn remove_arp(&mut self, addr: Ipv4Addr) -> bool {
        match self.arp_requests.iter().position(|e| e.addr == addr) {
            Some(i) => {
                self.arp_requests.remove(i);
                true
            }
            None => false,
        }
    }

    pub fn remove_nd(&mut self, addr: Ipv6Addr) -> bool {
        match self.nd_requests.iter().position(|e| e.addr == addr) {
            Some(i) => {
                self.nd_requests.remove(i);
                true
            }
            None => false,
        }
    }

    /// One staleness pass: evict entries already stale (cancelling their
    /// resolution with the resolver) and mark the rest stale.
    ///
    /// A request satisfied between two scans may get an extra `put`; the
    /// resolver's cancel is idempotent, so this is tolerated silently.
    pub fn scan(&mut self, resolver: &dyn LinkResolver) {
        if resolver.arp_enabled() {
            self.arp_requests.retain_mut(|entry| {
                if entry.stale {
                    resolver.put_arp(entry.addr);
                    false
                } else {
                    entry.stale = true;
                    true
                }
            });
        }
        if resolver.nd_enabled() {
            self.nd_requests.retain_mut(|entry| {
                if entry.stale {
                    resolver.put_nd(entry.addr);
                    false
                } else {
                    entry.stale = true;
                    true
                }
            });
        }
    }

    pub fn has_arp(&self, addr: Ipv4Addr) -> bool {
        self.arp_requests.iter().any(|e| e.addr == addr)
    }

    pub fn has_nd(&self, addr: Ipv6Addr) -> bool {
        self.nd_requests.iter().any(|e| e.addr == addr)
    }

    pub fn arp_len(&self) -> usize {
        self.arp_requests.len()
    }

    pub fn nd_len(&self) -> usize {
        self.nd_requests.len()
    }
}

/// Synthesize the ARP reply the kernel expects for a resolved neighbor.
///
/// The CPI shares the interface's Ethernet address, so the frame is
/// addressed to the interface MAC, with the resolved neighbor as sender.
pub fn build_arp_reply(
    pool: &Arc<BufferPool>,
    iface_name: &str,
    iface_mac: [u8; 6],
    iface_ip4: Ipv4Addr,
    target_ip: Ipv4Addr,
    resolved_mac: [u8; 6],
) -> Option<PktBuf> {
    let Some(mut pkt) = pool.alloc() else {
        error!(iface = iface_name, "could not allocate an ARP reply");
        return None;
    };

    let eth_repr = EthernetRepr {
        src_addr: EthernetAddress::from_bytes(&resolved_mac),
        dst_addr: EthernetAddress::from_bytes(&iface_mac),
        ethertype: EthernetProtocol::Arp,
    };
    let arp_repr = ArpRepr::EthernetIpv4 {
        operation: ArpOperation::Reply,
        source_hardware_addr: EthernetAddress::from_bytes(&resolved_mac),
        source_protocol_addr: target_ip,
        target_hardware_addr: EthernetAddress::from_bytes(&iface_mac),
        target_protocol_addr: iface_ip4,
    };

    let total_len = eth_repr.buffer_len() + arp_repr.buffer_len();
    let area = pkt.write_area();
    let mut frame = EthernetFrame::new_unchecked(&mut area[..total_len]);
    eth_repr.emit(&mut frame);
    let mut arp = ArpPacket::new_unchecked(frame.payload_mut());
    arp_repr.emit(&mut arp);
    pkt.set_len(total_len);

    Some(pkt)
}

/// Synthesize the ND Neighbor Advertisement the kernel expects for a
/// resolved neighbor: Override and Solicited set, the resolved MAC in a
/// target link-layer address option, sent from the resolved address to
/// the interface's link-local address.
pub fn build_nd_advert(
    pool: &Arc<BufferPool>,
    iface_name: &str,
    iface_mac: [u8; 6],
    ll_ip6_addr: Ipv6Addr,
    target_ip: Ipv6Addr,
    resolved_mac: [u8; 6],
) -> Option<PktBuf> {
    let Some(mut pkt) = pool.alloc() else {
        error!(iface = iface_name, "could not allocate an ND advertisement");
        return None;
    };

    let icmp_repr = Icmpv6Repr::Ndisc(NdiscRepr::NeighborAdvert {
        flags: NdiscNeighborFlags::OVERRIDE | NdiscNeighborFlags::SOLICITED,
        target_addr: target_ip,
        lladdr: Some(RawHardwareAddress::from_bytes(&resolved_mac)),
    });
    let ipv6_repr = Ipv6Repr {
        src_addr: target_ip,
        dst_addr: ll_ip6_addr,
        next_header: IpProtocol::Icmpv6,
        payload_len: icmp_repr.buffer_len(),
        hop_limit: 255,
    };
    let eth_repr = EthernetRepr {
        src_addr: EthernetAddress::from_bytes(&resolved_mac),
        dst_addr: EthernetAddress::from_bytes(&iface_mac),
        ethertype: EthernetProtocol::Ipv6,
    };

    let total_len = eth_repr.buffer_len() + ipv6_repr.buffer_len() + icmp_repr.buffer_len();
    let area = pkt.write_area();
    let mut frame = EthernetFrame::new_unchecked(&mut area[..total_len]);
    eth_repr.emit(&mut frame);
    let mut ipv6 = Ipv6Packet::new_unchecked(frame.payload_mut());
    ipv6_repr.emit(&mut ipv6);
    let mut icmp = Icmpv6Packet::new_unchecked(ipv6.payload_mut());
    icmp_repr.emit(
        &target_ip,
        &ll_ip6_addr,
        &mut icmp,
        &ChecksumCapabilities::default(),
    );
    pkt.set_len(total_len);

    Some(pkt)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct RecordingResolver {
        arp_puts: Mutex<Vec<Ipv4Addr>>,
        nd_puts: Mutex<Vec<Ipv6Addr>>,
    }

    impl RecordingResolver {
        fn new() -> Self {
            Self {
                arp_puts: Mutex::new(Vec::new()),
                nd_puts: Mutex::new(Vec::new()),
            }
        }
    }

    impl LinkResolver for RecordingResolver {
        fn hold_arp(&self, _ip: Ipv4Addr) {}
        fn put_arp(&self, ip: Ipv4Addr) {
            self.arp_puts.lock().unwrap().push(ip);
        }
        fn hold_nd(&self, _ip: Ipv6Addr) {}
        fn put_nd(&self, ip: Ipv6Addr) {
            self.nd_puts.lock().unwrap().push(ip);
        }
    }

    #[test]
    fn test_eviction_after_two_scans() {
        let mut tracker = NeighborTracker::new();
        let resolver = RecordingResolver::new();
        let ip = Ipv4Addr::new(192, 0, 2, 100);

        tracker.note_arp_request(ip);
        tracker.scan(&resolver);
        assert!(tracker.has_arp(ip), "present but stale after scan 1");
        assert!(resolver.arp_puts.lock().unwrap().is_empty());

        tracker.scan(&resolver);
        assert!(!tracker.has_arp(ip), "evicted after scan 2");
        assert_eq!(*resolver.arp_puts.lock().unwrap(), vec![ip]);
    }

    #[test]
    fn test_resolicitation_resets_staleness() {
        let mut tracker = NeighborTracker::new();
        let resolver = RecordingResolver::new();
        let ip: Ipv6Addr = "2001:db8::100".parse().unwrap();

        tracker.note_nd_request(ip);
        tracker.scan(&resolver);
        tracker.note_nd_request(ip); // kernel solicited again
        tracker.scan(&resolver);
        assert!(tracker.has_nd(ip), "still live after re-solicitation");
        tracker.scan(&resolver);
        assert!(!tracker.has_nd(ip));
    }

    #[test]
    fn test_remove_first_match_only() {
        let mut tracker = NeighborTracker::new();
        let ip = Ipv4Addr::new(192, 0, 2, 100);
        tracker.note_arp_request(ip);
        tracker.note_arp_request(Ipv4Addr::new(192, 0, 2, 101));
        assert!(tracker.remove_arp(ip));
        assert!(!tracker.remove_arp(ip));
        assert_eq!(tracker.arp_len(), 1);
    }

    #[test]
    fn test_arp_reply_wire_format() {
        let pool = Arc::new(BufferPool::new(4).unwrap());
        let iface_mac = [0x02, 0, 0, 0, 0, 0x01];
        let resolved_mac = [0x02, 0, 0, 0, 0, 0x64];
        let pkt = build_arp_reply(
            &pool,
            "front",
            iface_mac,
            Ipv4Addr::new(192, 0, 2, 1),
            Ipv4Addr::new(192, 0, 2, 100),
            resolved_mac,
        )
        .unwrap();

        let data = pkt.data();
        assert_eq!(&data[0..6], &iface_mac);
        assert_eq!(&data[6..12], &resolved_mac);
        assert_eq!(u16::from_be_bytes([data[12], data[13]]), 0x0806);

        let arp = &data[14..];
        assert_eq!(u16::from_be_bytes([arp[0], arp[1]]), 1); // hrd
        assert_eq!(u16::from_be_bytes([arp[2], arp[3]]), 0x0800); // pro
        assert_eq!(arp[4], 6); // hln
        assert_eq!(arp[5], 4); // pln
        assert_eq!(u16::from_be_bytes([arp[6], arp[7]]), 2); // op
        assert_eq!(&arp[8..14], &resolved_mac); // sha
        assert_eq!(&arp[14..18], &[192, 0, 2, 100]); // sip
        assert_eq!(&arp[18..24], &iface_mac); // tha
        assert_eq!(&arp[24..28], &[192, 0, 2, 1]); // tip
    }

    #[test]
    fn test_nd_advert_wire_format() {
        let pool = Arc::new(BufferPool::new(4).unwrap());
        let iface_mac = [0x02, 0, 0, 0, 0, 0x02];
        let resolved_mac = [0x02, 0, 0, 0, 0, 0xc8];
        let ll: Ipv6Addr = "fe80::ff:fe00:2".parse().unwrap();
        let target: Ipv6Addr = "2001:db8::100".parse().unwrap();

        let pkt = build_nd_advert(&pool, "front", iface_mac, ll, target, resolved_mac).unwrap();
        let data = pkt.data();

        assert_eq!(&data[0..6], &iface_mac);
        assert_eq!(&data[6..12], &resolved_mac);
        assert_eq!(u16::from_be_bytes([data[12], data[13]]), 0x86dd);

        let ip = &data[14..54];
        assert_eq!(ip[0] >> 4, 6);
        assert_eq!(u16::from_be_bytes([ip[4], ip[5]]), 32); // payload len
        assert_eq!(ip[6], 58); // ICMPv6
        assert_eq!(ip[7], 255); // hop limit
        assert_eq!(&ip[8..24], &target.octets());
        assert_eq!(&ip[24..40], &ll.octets());

        let icmp = &data[54..];
        assert_eq!(icmp[0], 136); // Neighbor Advertisement
        assert_eq!(icmp[1], 0); // code
        assert_eq!(icmp[4] >> 4, 0x6); // Override | Solicited
        assert_eq!(&icmp[8..24], &target.octets());
        assert_eq!(icmp[24], 2); // option: target link-layer address
        assert_eq!(icmp[25], 1); // length in units of 8 bytes
        assert_eq!(&icmp[26..32], &resolved_mac);

        // The checksum must verify over the pseudo-header.
        let ipv6 = Ipv6Packet::new_checked(&data[14..]).unwrap();
        let icmp_pkt = Icmpv6Packet::new_checked(ipv6.payload()).unwrap();
        assert!(Icmpv6Repr::parse(
            &ipv6.src_addr(),
            &ipv6.dst_addr(),
            &icmp_pkt,
            &ChecksumCapabilities::default(),
        )
        .is_ok());
    }
}
