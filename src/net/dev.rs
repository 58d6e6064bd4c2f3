//! Ethernet device abstraction.
//!
//! The network model drives ports through the `EthDev` trait so that the
//! interface lifecycle, queue allocation, RSS, and filter programming stay
//! independent of the underlying driver. A bonded pseudo-port aggregates
//! several underlying ports behind the same trait.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::dataplane::buffer::{BufferPool, PktBuf};
use crate::error::{Error, Result};
use crate::net::filter::NtupleFilter;
use crate::net::rss::RSS_KEY_LEN;

/// Link aggregation mode for a multi-port interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BondingMode {
    None,
    ActiveBackup,
    /// 802.3ad dynamic link aggregation (LACP).
    Lacp8023ad,
}

impl BondingMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            BondingMode::None => "none",
            BondingMode::ActiveBackup => "active-backup",
            BondingMode::Lacp8023ad => "802.3ad",
        }
    }
}

/// Device configuration applied before start.
#[derive(Debug, Clone)]
pub struct PortConf {
    pub num_rx_queues: u16,
    pub num_tx_queues: u16,
    /// Secret key for the RSS hash.
    pub rss_key: [u8; RSS_KEY_LEN],
}

/// A configurable Ethernet port.
///
/// `rx_burst` fills `out` with up to `max` packets from the given queue.
/// `tx_burst` drains the packets it accepts from the front of `pkts` and
/// returns how many it took; whatever remains is the caller's to free.
pub trait EthDev: Send + Sync {
    fn name(&self) -> &str;

    fn configure(&self, conf: &PortConf) -> Result<()>;
    fn setup_rx_queue(&self, queue: u16, numa_node: usize, pool: &Arc<BufferPool>) -> Result<()>;
    fn setup_tx_queue(&self, queue: u16, numa_node: usize) -> Result<()>;

    fn start(&self) -> Result<()>;
    fn stop(&self);
    fn close(&self);

    fn link_up(&self) -> bool;
    fn mac_addr(&self) -> [u8; 6];

    fn rx_burst(&self, queue: u16, out: &mut Vec<PktBuf>, max: usize) -> usize;
    fn tx_burst(&self, queue: u16, pkts: &mut Vec<PktBuf>) -> usize;

    /// Size of the RSS redirection table, or 0 when RSS is unsupported.
    fn reta_size(&self) -> u16;
    fn update_reta(&self, table: &[u16]) -> Result<()>;
    fn query_reta(&self, table: &mut [u16]) -> Result<()>;

    fn set_mc_addr_list(&self, macs: &[[u8; 6]]) -> Result<()>;

    fn add_ntuple_filter(&self, filter: &NtupleFilter) -> Result<()>;
    fn add_ethertype_filter(&self, ether_type: u16, queue: u16) -> Result<()>;

    /// Set the device MTU. Invoked from the CPI admin path.
    fn set_mtu(&self, _mtu: u32) -> Result<()> {
        Ok(())
    }
}

/// Bonded pseudo-port over several slave ports.
///
/// The bond must be configured before it is started, and its slaves must be
/// started before it; link-up of the aggregate lags slave activation, which
/// is why interface start waits on the bond's link with a bounded retry.
pub struct BondedDev {
    name: String,
    mode: BondingMode,
    slaves: Vec<Arc<dyn EthDev>>,
    configured: AtomicBool,
    started: AtomicBool,
    /// Round-robin cursor for RX polling and balanced TX.
    cursor: AtomicUsize,
}

impl BondedDev {
    pub fn create(
        name: impl Into<String>,
        mode: BondingMode,
        slaves: Vec<Arc<dyn EthDev>>,
    ) -> Result<Arc<Self>> {
        let name = name.into();
        if slaves.is_empty() {
            return Err(Error::Port {
                port: name,
                msg: "bonded port needs at least one slave".into(),
            });
        }
        Ok(Arc::new(Self {
            name,
            mode,
            slaves,
            configured: AtomicBool::new(false),
            started: AtomicBool::new(false),
            cursor: AtomicUsize::new(0),
        }))
    }

    pub fn mode(&self) -> BondingMode {
        self.mode
    }

    /// The primary slave, whose identity (PCI address, MAC) the bond
    /// presents to the outside.
    pub fn primary(&self) -> &Arc<dyn EthDev> {
        &self.slaves[0]
    }

    fn active_slave(&self) -> Option<&Arc<dyn EthDev>> {
        self.slaves.iter().find(|s| s.link_up())
    }
}

impl EthDev for BondedDev {
    fn name(&self) -> &str {
        &self.name
    }

    fn configure(&self, _conf: &PortConf) -> Result<()> {
        if self.started.load(Ordering::Acquire) {
            return Err(Error::Port {
                port: self.name.clone(),
                msg: "bonded port must be configured before start".into(),
            });
        }
        self.configured.store(true, Ordering::Release);
        Ok(())
    }

    fn setup_rx_queue(&self, _queue: u16, _numa_node: usize, _pool: &Arc<BufferPool>) -> Result<()> {
        // Queues materialize on the slaves; the bond only validates state.
        if !self.configured.load(Ordering::Acquire) {
            return Err(Error::Port {
                port: self.name.clone(),
                msg: "bonded port not configured".into(),
            });
        }
        Ok(())
    }

    fn setup_tx_queue(&self, _queue: u16, _numa_node: usize) -> Result<()> {
        if !self.configured.load(Ordering::Acquire) {
            return Err(Error::Port {
                port: self.name.clone(),
                msg: "bonded port not configured".into(),
            });
        }
        Ok(())
    }

    fn start(&self) -> Result<()> {
        if !self.configured.load(Ordering::Acquire) {
            return Err(Error::Port {
                port: self.name.clone(),
                msg: "bonded port started before configure".into(),
            });
        }
        for slave in &self.slaves {
            if !slave.link_up() && self.mode == BondingMode::None {
                // Plain aggregation expects slaves already started.
                return Err(Error::Port {
                    port: self.name.clone(),
                    msg: format!("slave {} is not up", slave.name()),
                });
            }
        }
        self.started.store(true, Ordering::Release);
        Ok(())
    }

    fn stop(&self) {
        self.started.store(false, Ordering::Release);
    }

    fn close(&self) {
        self.stop();
    }

    fn link_up(&self) -> bool {
        self.started.load(Ordering::Acquire) && self.slaves.iter().any(|s| s.link_up())
    }

    fn mac_addr(&self) -> [u8; 6] {
        self.primary().mac_addr()
    }

    fn rx_burst(&self, queue: u16, out: &mut Vec<PktBuf>, max: usize) -> usize {
        let n = self.slaves.len();
        let first = self.cursor.fetch_add(1, Ordering::Relaxed) % n;
        let mut got = 0;
        for i in 0..n {
            if got >= max {
                break;
            }
            let slave = &self.slaves[(first + i) % n];
            got += slave.rx_burst(queue, out, max - got);
        }
        got
    }

    fn tx_burst(&self, queue: u16, pkts: &mut Vec<PktBuf>) -> usize {
        match self.mode {
            BondingMode::ActiveBackup => match self.active_slave() {
                Some(slave) => slave.tx_burst(queue, pkts),
                None => 0,
            },
            _ => {
                let n = self.slaves.len();
                let slave = &self.slaves[self.cursor.fetch_add(1, Ordering::Relaxed) % n];
                slave.tx_burst(queue, pkts)
            }
        }
    }

    fn reta_size(&self) -> u16 {
        self.primary().reta_size()
    }

    fn update_reta(&self, table: &[u16]) -> Result<()> {
        for slave in &self.slaves {
            slave.update_reta(table)?;
        }
        Ok(())
    }

    fn query_reta(&self, table: &mut [u16]) -> Result<()> {
        self.primary().query_reta(table)
    }

    fn set_mc_addr_list(&self, macs: &[[u8; 6]]) -> Result<()> {
        for slave in &self.slaves {
            slave.set_mc_addr_list(macs)?;
        }
        Ok(())
    }

    fn add_ntuple_filter(&self, filter: &NtupleFilter) -> Result<()> {
        for slave in &self.slaves {
            slave.add_ntuple_filter(filter)?;
        }
        Ok(())
    }

    fn add_ethertype_filter(&self, ether_type: u16, queue: u16) -> Result<()> {
        for slave in &self.slaves {
            slave.add_ethertype_filter(ether_type, queue)?;
        }
        Ok(())
    }

    fn set_mtu(&self, mtu: u32) -> Result<()> {
        for slave in &self.slaves {
            slave.set_mtu(mtu)?;
        }
        Ok(())
    }
}
