//! IPv6 address derivation for Neighbor Discovery.
//!
//! Link-local addresses follow RFC 4291 (EUI-64 from the interface MAC),
//! solicited-node multicast addresses RFC 4291 §2.7.1, and the multicast
//! MAC mapping RFC 2464 §7. Nothing here is hard-coded to an address plan:
//! everything derives from the MAC and the configured unicast addresses,
//! so renumbering stays correct.

use std::net::Ipv6Addr;

/// Link-local IPv6 address for an interface MAC (RFC 4291, EUI-64).
pub fn link_local_from_mac(mac: &[u8; 6]) -> Ipv6Addr {
    let mut octets = [0u8; 16];
    octets[0] = 0xfe;
    octets[1] = 0x80;

    octets[8..11].copy_from_slice(&mac[0..3]);
    octets[11] = 0xff;
    octets[12] = 0xfe;
    octets[13..16].copy_from_slice(&mac[3..6]);

    // Flip the universal/local bit.
    octets[8] ^= 0x02;

    Ipv6Addr::from(octets)
}

/// Solicited-node multicast address covering a unicast address:
/// `ff02::1:ff` followed by the last 24 bits of the unicast address.
pub fn solicited_node_multicast(addr: &Ipv6Addr) -> Ipv6Addr {
    let unicast = addr.octets();
    let mut octets = [0u8; 16];
    octets[0] = 0xff;
    octets[1] = 0x02;
    octets[11] = 0x01;
    octets[12] = 0xff;
    octets[13..16].copy_from_slice(&unicast[13..16]);
    Ipv6Addr::from(octets)
}

/// Ethernet multicast address for an IPv6 multicast destination:
/// `33:33` followed by the last 32 bits of the address.
pub fn multicast_mac(addr: &Ipv6Addr) -> [u8; 6] {
    let octets = addr.octets();
    [0x33, 0x33, octets[12], octets[13], octets[14], octets[15]]
}
