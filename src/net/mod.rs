//! Network model: interfaces, ports, queues, addresses.
//!
//! A Gatekeeper interface is one or more ports, bonded when there are
//! several (or when LACP is requested), carrying an IPv4 and/or IPv6
//! address. Lifecycle is staged: stage 1 configures devices (queue counts
//! must be final by then) and allocates ACL contexts; stage 2 starts the
//! devices and derives the ND addresses; classifiers are built once every
//! block has registered its rules.

pub mod acl;
pub mod addr;
pub mod dev;
pub mod filter;
pub mod queue;
pub mod rss;

use std::collections::HashMap;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tracing::{error, info};

use crate::config::{IfaceConfig, NetConfig};
use crate::dataplane::buffer::{BufferPool, PktPools, POOL_SIZE};
use crate::error::{Error, Result};
use acl::Ipv6Acl;
use dev::{BondedDev, BondingMode, EthDev, PortConf};
use queue::{QueueMap, QueueType};
use rss::RssKey;

/// Interface carries IPv4.
pub const CONFIGURED_IPV4: u8 = 1;
/// Interface carries IPv6.
pub const CONFIGURED_IPV6: u8 = 2;

/// Number of attempts to wait for a link to come up.
const NUM_ATTEMPTS_LINK_GET: usize = 5;

/// Which side of the data plane an interface faces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Front,
    Back,
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Front => write!(f, "front"),
            Side::Back => write!(f, "back"),
        }
    }
}

/// Addresses derived for Neighbor Discovery once the MAC is known.
#[derive(Debug, Clone, Copy)]
pub struct NdAddrs {
    /// Link-local address (RFC 4291 EUI-64 of the interface MAC).
    pub ll_ip6_addr: Ipv6Addr,
    /// Solicited-node multicast covering the global address.
    pub ip6_mc_addr: Ipv6Addr,
    /// Solicited-node multicast covering the link-local address.
    pub ll_ip6_mc_addr: Ipv6Addr,
    /// Ethernet multicast for `ip6_mc_addr`.
    pub eth_mc_addr: [u8; 6],
    /// Ethernet multicast for `ll_ip6_mc_addr`.
    pub ll_eth_mc_addr: [u8; 6],
}

/// One Gatekeeper interface.
pub struct Iface {
    pub name: String,
    /// The underlying ports.
    ports: Vec<Arc<dyn EthDev>>,
    /// The port all further configuration refers to: the bonded
    /// pseudo-port when there is one, otherwise the single port.
    dev: Arc<dyn EthDev>,
    bond: Option<Arc<BondedDev>>,
    bonding_mode: BondingMode,
    pub num_rx_queues: u16,
    pub num_tx_queues: u16,
    rx_queues: QueueMap,
    tx_queues: QueueMap,

    configured_proto: u8,
    pub ip4_addr: Option<Ipv4Addr>,
    pub ip4_mask: Ipv4Addr,
    pub ip4_addr_plen: u8,
    pub ip6_addr: Option<Ipv6Addr>,
    pub ip6_mask: Ipv6Addr,
    pub ip6_addr_plen: u8,

    /// Written once when the interface starts.
    mac: OnceLock<[u8; 6]>,
    nd_addrs: OnceLock<NdAddrs>,

    pub arp_cache_timeout_sec: u32,
    pub nd_cache_timeout_sec: u32,

    /// Per-NUMA IPv6 classifiers.
    pub acl: Ipv6Acl,
}

impl Iface {
    /// Stage-1 initialization: identify ports, configure devices with the
    /// final queue counts, create the bond, allocate ACL contexts.
    pub fn init(
        config: &IfaceConfig,
        port_map: &HashMap<String, Arc<dyn EthDev>>,
        rss_key: &RssKey,
        numa_nodes: usize,
    ) -> Result<Self> {
        let addrs = config.addrs()?;

        let mut ports: Vec<Arc<dyn EthDev>> = Vec::with_capacity(config.ports.len());
        for id in &config.ports {
            let port = port_map.get(id).ok_or_else(|| {
                Error::Config(format!("interface {}: unknown port {id}", config.name))
            })?;
            ports.push(Arc::clone(port));
        }

        let port_conf = PortConf {
            num_rx_queues: config.num_rx_queues,
            num_tx_queues: config.num_tx_queues,
            rss_key: rss_key.key,
        };
        for port in &ports {
            port.configure(&port_conf)?;
        }

        // A bonded pseudo-port exists whenever there are several ports or
        // LACP is requested; it is configured before it is started.
        let bonded = ports.len() > 1 || config.bonding_mode == BondingMode::Lacp8023ad;
        let (dev, bond) = if bonded {
            let bond = BondedDev::create(config.name.clone(), config.bonding_mode, ports.clone())?;
            bond.configure(&port_conf)?;
            (Arc::clone(&bond) as Arc<dyn EthDev>, Some(bond))
        } else {
            (Arc::clone(&ports[0]), None)
        };

        let mut configured_proto = 0;
        if addrs.v4.is_some() {
            configured_proto |= CONFIGURED_IPV4;
        }
        if addrs.v6.is_some() {
            configured_proto |= CONFIGURED_IPV6;
        }

        Ok(Self {
            name: config.name.clone(),
            dev,
            bond,
            bonding_mode: config.bonding_mode,
            num_rx_queues: config.num_rx_queues,
            num_tx_queues: config.num_tx_queues,
            rx_queues: QueueMap::new(config.name.clone(), QueueType::Rx, config.num_rx_queues),
            tx_queues: QueueMap::new(config.name.clone(), QueueType::Tx, config.num_tx_queues),
            configured_proto,
            ip4_addr: addrs.v4.map(|n| n.addr()),
            ip4_mask: addrs.v4.map(|n| n.netmask()).unwrap_or(Ipv4Addr::UNSPECIFIED),
            ip4_addr_plen: addrs.v4.map(|n| n.prefix_len()).unwrap_or(0),
            ip6_addr: addrs.v6.map(|n| n.addr()),
            ip6_mask: addrs.v6.map(|n| n.netmask()).unwrap_or(Ipv6Addr::UNSPECIFIED),
            ip6_addr_plen: addrs.v6.map(|n| n.prefix_len()).unwrap_or(0),
            mac: OnceLock::new(),
            nd_addrs: OnceLock::new(),
            arp_cache_timeout_sec: config.arp_cache_timeout_sec,
            nd_cache_timeout_sec: config.nd_cache_timeout_sec,
            acl: Ipv6Acl::new(config.name.clone(), numa_nodes),
            ports,
        })
    }

    /// Stage-2 start: bring up the underlying ports, then the bond (with a
    /// bounded link wait, because slave activation is asynchronous), read
    /// the MAC, and derive the ND addresses.
    pub fn start(&self) -> Result<()> {
        for port in &self.ports {
            start_port(port.as_ref(), false)?;
        }

        if let Some(bond) = &self.bond {
            start_port(bond.as_ref() as &dyn EthDev, true)?;
        }

        let mac = self.dev.mac_addr();
        let _ = self.mac.set(mac);

        if self.ipv6_configured() {
            self.setup_ipv6_addrs()?;
        }

        info!(iface = %self.name, mode = self.bonding_mode.as_str(), "interface started");
        Ok(())
    }

    fn setup_ipv6_addrs(&self) -> Result<()> {
        let global = self
            .ip6_addr
            .ok_or_else(|| Error::Config(format!("interface {} has no IPv6 address", self.name)))?;
        let mac = self.mac();

        let ll_ip6_addr = addr::link_local_from_mac(&mac);
        let ip6_mc_addr = addr::solicited_node_multicast(&global);
        let ll_ip6_mc_addr = addr::solicited_node_multicast(&ll_ip6_addr);
        let nd = NdAddrs {
            ll_ip6_addr,
            ip6_mc_addr,
            ll_ip6_mc_addr,
            eth_mc_addr: addr::multicast_mac(&ip6_mc_addr),
            ll_eth_mc_addr: addr::multicast_mac(&ll_ip6_mc_addr),
        };
        let _ = self.nd_addrs.set(nd);

        // The device must accept frames sent to both solicited-node
        // multicast MACs.
        self.dev.set_mc_addr_list(&[nd.eth_mc_addr, nd.ll_eth_mc_addr])
    }

    /// Stop and close everything, slaves last.
    pub fn stop(&self) {
        if let Some(bond) = &self.bond {
            bond.stop();
        }
        for port in &self.ports {
            port.stop();
        }
        if let Some(bond) = &self.bond {
            bond.close();
        }
        for port in &self.ports {
            port.close();
        }
        info!(iface = %self.name, "interface stopped");
    }

    /// The device all runtime traffic goes through.
    pub fn dev(&self) -> &Arc<dyn EthDev> {
        &self.dev
    }

    pub fn bonding_mode(&self) -> BondingMode {
        self.bonding_mode
    }

    /// Interface MAC; zeroes before the interface has started.
    pub fn mac(&self) -> [u8; 6] {
        self.mac.get().copied().unwrap_or([0; 6])
    }

    /// ND-derived addresses; only available once started with IPv6.
    pub fn nd_addrs(&self) -> Option<&NdAddrs> {
        self.nd_addrs.get()
    }

    pub fn ipv4_configured(&self) -> bool {
        self.configured_proto & CONFIGURED_IPV4 != 0
    }

    pub fn ipv6_configured(&self) -> bool {
        self.configured_proto & CONFIGURED_IPV6 != 0
    }

    /// Whether `addr` is one of this interface's own IPv6 addresses
    /// (global, link-local, or either solicited-node multicast).
    pub fn owns_ipv6(&self, addr: &Ipv6Addr) -> bool {
        if self.ip6_addr.as_ref() == Some(addr) {
            return true;
        }
        match self.nd_addrs.get() {
            Some(nd) => {
                nd.ll_ip6_addr == *addr || nd.ip6_mc_addr == *addr || nd.ll_ip6_mc_addr == *addr
            }
            None => false,
        }
    }

    /// Queue identifier for a block instance, assigning one on first use.
    ///
    /// A fresh assignment sets the queue up on every underlying port and,
    /// when bonded, on the bond as well.
    pub fn get_queue_id(
        &self,
        ty: QueueType,
        lcore: usize,
        numa_node: usize,
        pool: &Arc<BufferPool>,
    ) -> Result<u16> {
        let map = match ty {
            QueueType::Rx => &self.rx_queues,
            QueueType::Tx => &self.tx_queues,
        };
        map.take(lcore, |queue| {
            for port in &self.ports {
                setup_queue(port.as_ref(), ty, queue, numa_node, pool)?;
            }
            if let Some(bond) = &self.bond {
                setup_queue(bond.as_ref() as &dyn EthDev, ty, queue, numa_node, pool)?;
            }
            Ok(())
        })
    }
}

fn setup_queue(
    dev: &dyn EthDev,
    ty: QueueType,
    queue: u16,
    numa_node: usize,
    pool: &Arc<BufferPool>,
) -> Result<()> {
    match ty {
        QueueType::Rx => dev.setup_rx_queue(queue, numa_node, pool),
        QueueType::Tx => dev.setup_tx_queue(queue, numa_node),
    }
}

/// Start one port, optionally waiting for its link with bounded retries.
fn start_port(dev: &dyn EthDev, wait_for_link: bool) -> Result<()> {
    dev.start()?;

    let mut attempts = 0;
    loop {
        if dev.link_up() {
            return Ok(());
        }
        error!(port = dev.name(), "querying port, and link is down");
        if !wait_for_link || attempts > NUM_ATTEMPTS_LINK_GET {
            error!(port = dev.name(), "giving up on port");
            return Err(Error::LinkDown(dev.name().to_string()));
        }
        attempts += 1;
        std::thread::sleep(Duration::from_secs(1));
    }
}

/// The whole network: front interface, optional back interface, packet
/// pools, and the RSS key shared by all ports.
pub struct Net {
    pub front: Arc<Iface>,
    pub back: Option<Arc<Iface>>,
    pub pools: Arc<PktPools>,
    pub rss_key: RssKey,
    pub numa_nodes: usize,
    pub max_pkt_burst: usize,
}

impl Net {
    /// Stage-1 network initialization.
    pub fn init(
        config: &NetConfig,
        port_map: &HashMap<String, Arc<dyn EthDev>>,
        numa_nodes: usize,
    ) -> Result<Self> {
        config.validate()?;

        let rss_key = RssKey::random();
        let pools = Arc::new(PktPools::new(numa_nodes, POOL_SIZE)?);

        let front = Arc::new(Iface::init(&config.front, port_map, &rss_key, numa_nodes)?);
        let back = match &config.back {
            Some(cfg) => Some(Arc::new(Iface::init(cfg, port_map, &rss_key, numa_nodes)?)),
            None => None,
        };

        Ok(Self {
            front,
            back,
            pools,
            rss_key,
            numa_nodes,
            max_pkt_burst: config.max_pkt_burst,
        })
    }

    pub fn back_iface_enabled(&self) -> bool {
        self.back.is_some()
    }

    pub fn iface(&self, side: Side) -> Option<&Arc<Iface>> {
        match side {
            Side::Front => Some(&self.front),
            Side::Back => self.back.as_ref(),
        }
    }

    /// Stage-2 start of both interfaces.
    pub fn start(&self) -> Result<()> {
        self.front.start()?;
        if let Some(back) = &self.back {
            if let Err(e) = back.start() {
                self.front.stop();
                error!("failed to start the Gatekeeper network");
                return Err(e);
            }
        }
        Ok(())
    }

    /// End of stage 2: build the IPv6 classifiers now that every block has
    /// registered its rules.
    pub fn finalize(&self) -> Result<()> {
        if self.front.ipv6_configured() {
            self.front.acl.build()?;
        }
        if let Some(back) = &self.back {
            if back.ipv6_configured() {
                back.acl.build()?;
            }
        }
        Ok(())
    }

    pub fn stop(&self) {
        if let Some(back) = &self.back {
            back.stop();
        }
        self.front.stop();
    }

    pub fn ipv4_configured(&self) -> bool {
        match &self.back {
            Some(back) => self.front.ipv4_configured() && back.ipv4_configured(),
            None => self.front.ipv4_configured(),
        }
    }

    pub fn ipv6_configured(&self) -> bool {
        match &self.back {
            Some(back) => self.front.ipv6_configured() && back.ipv6_configured(),
            None => self.front.ipv6_configured(),
        }
    }
}

/// NUMA node an lcore belongs to, read from sysfs; node 0 when the
/// topology is unknown.
pub fn lcore_to_numa_node(lcore: usize) -> usize {
    let path = format!("/sys/devices/system/cpu/cpu{lcore}");
    if let Ok(entries) = std::fs::read_dir(path) {
        for entry in entries.flatten() {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(id) = name.strip_prefix("node") {
                if let Ok(node) = id.parse::<usize>() {
                    return node;
                }
            }
        }
    }
    0
}

/// Total NUMA nodes backing the configured lcores.
pub fn find_num_numa_nodes(lcores: impl IntoIterator<Item = usize>) -> usize {
    let mut nodes = 0;
    for lcore in lcores {
        let node = lcore_to_numa_node(lcore);
        if nodes <= node {
            nodes = node + 1;
        }
    }
    nodes.max(1)
}
