//! Static configuration passed in at construction.
//!
//! Gatekeeper's configuration is loaded by an external frontend; this module
//! only models the already-parsed entries the network and CPS blocks consume.

use std::time::Duration;

use ipnet::{Ipv4Net, Ipv6Net};

use crate::error::{Error, Result};
use crate::net::dev::BondingMode;

/// Canonical BGP TCP port.
pub const DEFAULT_BGP_PORT: u16 = 179;

/// Period between scans of the outstanding resolution requests from CPIs.
pub const DEFAULT_SCAN_INTERVAL: Duration = Duration::from_secs(5);

/// Capacity of the CPS request mailbox.
pub const DEFAULT_MAILBOX_ENTRIES: usize = 64;

/// Maximum packets processed per burst.
pub const DEFAULT_PKT_BURST: usize = 32;

/// Upper bound on configurable RX/TX queues per interface.
///
/// Keeping this far below the queue-id sentinel means the monotonic
/// allocation counter can never legally reach it.
pub const MAX_QUEUES_PER_IFACE: u16 = 64;

/// Configuration entry for one Gatekeeper interface.
#[derive(Debug, Clone)]
pub struct IfaceConfig {
    pub name: String,
    /// Identifiers of the underlying ports (PCI addresses). More than one
    /// means the ports are bonded.
    pub ports: Vec<String>,
    pub bonding_mode: BondingMode,
    pub num_rx_queues: u16,
    pub num_tx_queues: u16,
    /// At least one, at most two CIDRs: one IPv4 and/or one IPv6.
    pub cidrs: Vec<String>,
    /// Timeouts for link-layer cache entries (in seconds).
    pub arp_cache_timeout_sec: u32,
    pub nd_cache_timeout_sec: u32,
}

impl IfaceConfig {
    pub fn new(name: impl Into<String>, ports: Vec<String>, cidrs: Vec<String>) -> Self {
        Self {
            name: name.into(),
            ports,
            bonding_mode: BondingMode::None,
            num_rx_queues: 1,
            num_tx_queues: 1,
            cidrs,
            arp_cache_timeout_sec: 7200,
            nd_cache_timeout_sec: 7200,
        }
    }

    pub fn bonding_mode(mut self, mode: BondingMode) -> Self {
        self.bonding_mode = mode;
        self
    }

    pub fn queues(mut self, rx: u16, tx: u16) -> Self {
        self.num_rx_queues = rx;
        self.num_tx_queues = tx;
        self
    }

    /// Parse and validate the configured CIDRs.
    pub fn addrs(&self) -> Result<IfaceAddrs> {
        IfaceAddrs::parse(&self.name, &self.cidrs)
    }

    /// Validate everything that can be checked before stage 1 runs.
    pub fn validate(&self, max_pkt_burst: usize) -> Result<()> {
        if self.ports.is_empty() {
            return Err(Error::Config(format!(
                "interface {} has no ports",
                self.name
            )));
        }
        if self.num_rx_queues == 0 || self.num_tx_queues == 0 {
            return Err(Error::Config(format!(
                "interface {} must have at least one RX and one TX queue",
                self.name
            )));
        }
        if self.num_rx_queues > MAX_QUEUES_PER_IFACE || self.num_tx_queues > MAX_QUEUES_PER_IFACE {
            return Err(Error::Config(format!(
                "interface {} requests more than {} queues",
                self.name, MAX_QUEUES_PER_IFACE
            )));
        }
        if self.bonding_mode == BondingMode::Lacp8023ad && max_pkt_burst < 2 * self.ports.len() {
            // LACPDUs must not be starved out of a burst.
            return Err(Error::Config(format!(
                "interface {} uses 802.3ad but the packet burst ({}) is below twice the slave count ({})",
                self.name,
                max_pkt_burst,
                2 * self.ports.len()
            )));
        }
        self.addrs().map(|_| ())
    }
}

/// Parsed interface addresses: at least one of IPv4/IPv6 must be present.
#[derive(Debug, Clone, Copy)]
pub struct IfaceAddrs {
    pub v4: Option<Ipv4Net>,
    pub v6: Option<Ipv6Net>,
}

impl IfaceAddrs {
    fn parse(iface: &str, cidrs: &[String]) -> Result<Self> {
        if cidrs.is_empty() || cidrs.len() > 2 {
            return Err(Error::Config(format!(
                "interface {iface} needs 1 or 2 addresses (at most one IPv4 and one IPv6), got {}",
                cidrs.len()
            )));
        }

        let mut addrs = IfaceAddrs { v4: None, v6: None };
        for cidr in cidrs {
            if let Ok(net) = cidr.parse::<Ipv4Net>() {
                if addrs.v4.replace(net).is_some() {
                    return Err(Error::Config(format!(
                        "interface {iface} has more than one IPv4 address"
                    )));
                }
            } else if let Ok(net) = cidr.parse::<Ipv6Net>() {
                if addrs.v6.replace(net).is_some() {
                    return Err(Error::Config(format!(
                        "interface {iface} has more than one IPv6 address"
                    )));
                }
            } else {
                return Err(Error::Config(format!(
                    "interface {iface}: {cidr} is not a valid CIDR"
                )));
            }
        }
        Ok(addrs)
    }
}

/// Configuration for the whole network: a front interface and an optional
/// back interface (Grantor deployments run without one).
#[derive(Debug, Clone)]
pub struct NetConfig {
    pub front: IfaceConfig,
    pub back: Option<IfaceConfig>,
    /// Maximum packets per RX/TX burst, shared by all blocks.
    pub max_pkt_burst: usize,
}

impl NetConfig {
    pub fn new(front: IfaceConfig) -> Self {
        Self {
            front,
            back: None,
            max_pkt_burst: DEFAULT_PKT_BURST,
        }
    }

    pub fn back(mut self, back: IfaceConfig) -> Self {
        self.back = Some(back);
        self
    }

    pub fn back_iface_enabled(&self) -> bool {
        self.back.is_some()
    }

    pub fn validate(&self) -> Result<()> {
        self.front.validate(self.max_pkt_burst)?;
        if let Some(back) = &self.back {
            back.validate(self.max_pkt_burst)?;
        }
        Ok(())
    }
}

/// Tunables for the CPS block.
#[derive(Debug, Clone)]
pub struct CpsConfig {
    /// TCP port used to steer BGP traffic.
    pub tcp_port_bgp: u16,
    /// Period between staleness scans of outstanding resolution requests.
    pub scan_interval: Duration,
    /// Capacity of the request mailbox.
    pub mailbox_max_entries: usize,
    /// The lcore the CPS worker is pinned to.
    pub lcore: usize,
}

impl Default for CpsConfig {
    fn default() -> Self {
        Self {
            tcp_port_bgp: DEFAULT_BGP_PORT,
            scan_interval: DEFAULT_SCAN_INTERVAL,
            mailbox_max_entries: DEFAULT_MAILBOX_ENTRIES,
            lcore: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn iface(cidrs: &[&str]) -> IfaceConfig {
        IfaceConfig::new(
            "front",
            vec!["0000:00:08.0".to_string()],
            cidrs.iter().map(|s| s.to_string()).collect(),
        )
    }

    #[test]
    fn test_dual_stack_addrs() {
        let addrs = iface(&["192.0.2.1/24", "2001:db8::1/64"]).addrs().unwrap();
        assert_eq!(addrs.v4.unwrap().addr().octets(), [192, 0, 2, 1]);
        assert_eq!(addrs.v4.unwrap().prefix_len(), 24);
        assert!(addrs.v6.is_some());
    }

    #[test]
    fn test_prefix_length_bounds() {
        assert!(iface(&["192.0.2.1/33"]).addrs().is_err());
        assert!(iface(&["2001:db8::1/129"]).addrs().is_err());
        assert!(iface(&["192.0.2.1/32"]).addrs().is_ok());
        assert!(iface(&["2001:db8::1/128"]).addrs().is_ok());
        assert!(iface(&["2001:db8::1/0"]).addrs().is_ok());
    }

    #[test]
    fn test_addr_count_limits() {
        assert!(iface(&[]).addrs().is_err());
        assert!(iface(&["192.0.2.1/24", "198.51.100.1/24"]).addrs().is_err());
        assert!(iface(&["192.0.2.1/24", "2001:db8::1/64", "2001:db8::2/64"])
            .addrs()
            .is_err());
    }

    #[test]
    fn test_lacp_burst_floor() {
        let cfg = IfaceConfig::new(
            "front",
            vec!["a".into(), "b".into(), "c".into()],
            vec!["192.0.2.1/24".into()],
        )
        .bonding_mode(BondingMode::Lacp8023ad);
        assert!(cfg.validate(4).is_err());
        assert!(cfg.validate(6).is_ok());
    }

    #[test]
    fn test_queue_count_limits() {
        let cfg = iface(&["192.0.2.1/24"]).queues(0, 1);
        assert!(cfg.validate(32).is_err());
        let cfg = iface(&["192.0.2.1/24"]).queues(1, MAX_QUEUES_PER_IFACE + 1);
        assert!(cfg.validate(32).is_err());
        let cfg = iface(&["192.0.2.1/24"]).queues(4, 4);
        assert!(cfg.validate(32).is_ok());
    }
}
