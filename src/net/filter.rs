//! Hardware flow steering: n-tuple and EtherType filters.
//!
//! These direct narrow traffic classes (BGP sessions, ARP) to a specific
//! RX queue before RSS gets a chance to spread them.

use std::net::Ipv4Addr;

use tracing::error;

use crate::error::Result;
use crate::net::dev::EthDev;

/// A 5-tuple steering rule.
///
/// Ports and masks follow the hardware convention: a zero mask ignores the
/// field. `dst_ip` is matched with a full mask when present.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NtupleFilter {
    pub dst_ip: Option<Ipv4Addr>,
    pub src_port: u16,
    pub src_port_mask: u16,
    pub dst_port: u16,
    pub dst_port_mask: u16,
    pub proto: u8,
    pub priority: u8,
    pub queue: u16,
}

impl NtupleFilter {
    /// Whether an Ethernet frame matches this rule. Used by software
    /// device implementations to emulate hardware steering.
    pub fn matches(&self, frame: &[u8]) -> bool {
        if frame.len() < 14 {
            return false;
        }
        let ethertype = u16::from_be_bytes([frame[12], frame[13]]);
        let (proto, l4, dst_ip) = match ethertype {
            0x0800 if frame.len() >= 34 => {
                let ihl = ((frame[14] & 0x0f) as usize) * 4;
                if frame.len() < 14 + ihl + 4 {
                    return false;
                }
                let dst = Ipv4Addr::new(frame[30], frame[31], frame[32], frame[33]);
                (frame[23], 14 + ihl, Some(dst))
            }
            0x86dd if frame.len() >= 54 + 4 => (frame[20], 54, None),
            _ => return false,
        };

        if proto != self.proto {
            return false;
        }
        if let Some(want) = self.dst_ip {
            match dst_ip {
                Some(got) if got == want => {}
                _ => return false,
            }
        }
        let src_port = u16::from_be_bytes([frame[l4], frame[l4 + 1]]);
        let dst_port = u16::from_be_bytes([frame[l4 + 2], frame[l4 + 3]]);
        src_port & self.src_port_mask == self.src_port & self.src_port_mask
            && dst_port & self.dst_port_mask == self.dst_port & self.dst_port_mask
    }
}

/// Install a 5-tuple filter steering matching flows to `queue`.
///
/// When `dst_ip` is set, an IPv4 rule carrying it is installed; unless
/// `ipv4_only`, an address-less rule covering IPv6 is installed as well.
#[allow(clippy::too_many_arguments)]
pub fn ntuple_filter_add(
    dev: &dyn EthDev,
    dst_ip: Option<Ipv4Addr>,
    src_port: u16,
    src_port_mask: u16,
    dst_port: u16,
    dst_port_mask: u16,
    proto: u8,
    queue: u16,
    ipv4_only: bool,
) -> Result<()> {
    if let Some(ip) = dst_ip {
        let filter_v4 = NtupleFilter {
            dst_ip: Some(ip),
            src_port,
            src_port_mask,
            dst_port,
            dst_port_mask,
            proto,
            priority: 1,
            queue,
        };
        if let Err(e) = dev.add_ntuple_filter(&filter_v4) {
            error!(port = dev.name(), error = %e, "could not add IPv4 ntuple filter");
            return Err(e);
        }
    }

    if ipv4_only {
        return Ok(());
    }

    let filter_v6 = NtupleFilter {
        dst_ip: None,
        src_port,
        src_port_mask,
        dst_port,
        dst_port_mask,
        proto,
        priority: 1,
        queue,
    };
    if let Err(e) = dev.add_ntuple_filter(&filter_v6) {
        error!(port = dev.name(), error = %e, "could not add IPv6 ntuple filter");
        return Err(e);
    }
    Ok(())
}

/// Install an EtherType filter steering a whole protocol to `queue`.
pub fn ethertype_filter_add(dev: &dyn EthDev, ether_type: u16, queue: u16) -> Result<()> {
    if let Err(e) = dev.add_ethertype_filter(ether_type, queue) {
        error!(
            port = dev.name(),
            ether_type = format_args!("{ether_type:#06x}"),
            error = %e,
            "could not add EtherType filter"
        );
        return Err(e);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tcp4_frame(dst: [u8; 4], sport: u16, dport: u16) -> Vec<u8> {
        let mut f = vec![0u8; 54];
        f[12..14].copy_from_slice(&0x0800u16.to_be_bytes());
        f[14] = 0x45;
        f[23] = 6; // TCP
        f[30..34].copy_from_slice(&dst);
        f[34..36].copy_from_slice(&sport.to_be_bytes());
        f[36..38].copy_from_slice(&dport.to_be_bytes());
        f
    }

    #[test]
    fn test_ntuple_matches_bgp_dst_port() {
        let filter = NtupleFilter {
            dst_ip: Some(Ipv4Addr::new(192, 0, 2, 1)),
            src_port: 0,
            src_port_mask: 0,
            dst_port: 179,
            dst_port_mask: 0xffff,
            proto: 6,
            priority: 1,
            queue: 2,
        };
        assert!(filter.matches(&tcp4_frame([192, 0, 2, 1], 40000, 179)));
        assert!(!filter.matches(&tcp4_frame([192, 0, 2, 1], 40000, 80)));
        assert!(!filter.matches(&tcp4_frame([192, 0, 2, 9], 40000, 179)));
    }

    #[test]
    fn test_ntuple_ignores_masked_fields() {
        let filter = NtupleFilter {
            dst_ip: None,
            src_port: 179,
            src_port_mask: 0xffff,
            dst_port: 0,
            dst_port_mask: 0,
            proto: 6,
            priority: 1,
            queue: 0,
        };
        assert!(filter.matches(&tcp4_frame([10, 0, 0, 1], 179, 55555)));
        assert!(filter.matches(&tcp4_frame([10, 9, 9, 9], 179, 1)));
    }

    #[test]
    fn test_ethertype_filter_steers() {
        use crate::test_util::SimDev;

        let dev = SimDev::new("p0");
        ethertype_filter_add(&*dev, 0x0806, 3).unwrap();

        let mut arp = vec![0u8; 60];
        arp[12..14].copy_from_slice(&0x0806u16.to_be_bytes());
        assert_eq!(dev.steer(&arp), 3);
        assert_eq!(dev.steer(&tcp4_frame([10, 0, 0, 1], 1, 2)), 0);
    }

    #[test]
    fn test_ntuple_install_v4_only() {
        use crate::test_util::SimDev;

        let dev = SimDev::new("p0");
        ntuple_filter_add(
            &*dev,
            Some(Ipv4Addr::new(192, 0, 2, 1)),
            0,
            0,
            179,
            0xffff,
            6,
            2,
            true,
        )
        .unwrap();
        assert_eq!(dev.ntuple_filters().len(), 1);

        // Without ipv4_only a second, address-less rule is installed.
        ntuple_filter_add(
            &*dev,
            Some(Ipv4Addr::new(192, 0, 2, 1)),
            0,
            0,
            179,
            0xffff,
            6,
            2,
            false,
        )
        .unwrap();
        assert_eq!(dev.ntuple_filters().len(), 3);
    }
}
