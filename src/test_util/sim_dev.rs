//! Simulated Ethernet port for tests.
//!
//! Implements `EthDev` over in-memory queues: tests inject frames into RX
//! queues (optionally through the programmed filters, emulating hardware
//! steering) and read back what the device was asked to transmit.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::dataplane::buffer::{BufferPool, PktBuf};
use crate::error::{Error, Result};
use crate::net::dev::{EthDev, PortConf};
use crate::net::filter::NtupleFilter;

/// A software port.
pub struct SimDev {
    name: String,
    mac: Mutex<[u8; 6]>,
    configured: AtomicBool,
    started: AtomicBool,
    reta_size: AtomicU16,
    reta: Mutex<Vec<u16>>,
    mc_addrs: Mutex<Vec<[u8; 6]>>,
    ntuple_filters: Mutex<Vec<NtupleFilter>>,
    ethertype_filters: Mutex<Vec<(u16, u16)>>,
    rx_queues: Mutex<Vec<VecDeque<PktBuf>>>,
    tx_queues: Mutex<Vec<Vec<PktBuf>>>,
    /// Per-call TX acceptance cap, for exercising transmit underruns.
    tx_accept: AtomicUsize,
    mtu: AtomicU32,
}

impl SimDev {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            mac: Mutex::new([0x02, 0, 0, 0, 0, 0x01]),
            configured: AtomicBool::new(false),
            started: AtomicBool::new(false),
            reta_size: AtomicU16::new(128),
            reta: Mutex::new(Vec::new()),
            mc_addrs: Mutex::new(Vec::new()),
            ntuple_filters: Mutex::new(Vec::new()),
            ethertype_filters: Mutex::new(Vec::new()),
            rx_queues: Mutex::new(Vec::new()),
            tx_queues: Mutex::new(Vec::new()),
            tx_accept: AtomicUsize::new(usize::MAX),
            mtu: AtomicU32::new(1500),
        })
    }

    pub fn with_reta_size(self: Arc<Self>, size: u16) -> Arc<Self> {
        self.reta_size.store(size, Ordering::SeqCst);
        self
    }

    pub fn with_mac(self: Arc<Self>, mac: [u8; 6]) -> Arc<Self> {
        *self.mac.lock().unwrap() = mac;
        self
    }

    /// Cap how many packets each `tx_burst` call accepts.
    pub fn limit_tx(&self, n: usize) {
        self.tx_accept.store(n, Ordering::SeqCst);
    }

    /// Inject a frame into a specific RX queue.
    pub fn inject_rx(&self, queue: u16, pkt: PktBuf) {
        let mut queues = self.rx_queues.lock().unwrap();
        if let Some(q) = queues.get_mut(queue as usize) {
            q.push_back(pkt);
        }
    }

    /// Inject a frame through the programmed filters, the way the NIC
    /// would steer it. Unmatched frames land on queue 0.
    pub fn inject_rx_steered(&self, pool: &Arc<BufferPool>, frame: &[u8]) -> Result<u16> {
        let queue = self.steer(frame);
        let mut pkt = pool
            .alloc()
            .ok_or(Error::Exhausted("sim pool"))?;
        pkt.fill_from(frame)?;
        self.inject_rx(queue, pkt);
        Ok(queue)
    }

    /// Queue the programmed filters would choose for a frame.
    pub fn steer(&self, frame: &[u8]) -> u16 {
        for filter in self.ntuple_filters.lock().unwrap().iter() {
            if filter.matches(frame) {
                return filter.queue;
            }
        }
        if frame.len() >= 14 {
            let ethertype = u16::from_be_bytes([frame[12], frame[13]]);
            for (ty, queue) in self.ethertype_filters.lock().unwrap().iter() {
                if *ty == ethertype {
                    return *queue;
                }
            }
        }
        0
    }

    /// Everything transmitted on a queue so far, draining it.
    pub fn take_tx(&self, queue: u16) -> Vec<PktBuf> {
        let mut queues = self.tx_queues.lock().unwrap();
        match queues.get_mut(queue as usize) {
            Some(q) => std::mem::take(q),
            None => Vec::new(),
        }
    }

    pub fn mtu(&self) -> u32 {
        self.mtu.load(Ordering::SeqCst)
    }

    pub fn mc_addrs(&self) -> Vec<[u8; 6]> {
        self.mc_addrs.lock().unwrap().clone()
    }

    pub fn ntuple_filters(&self) -> Vec<NtupleFilter> {
        self.ntuple_filters.lock().unwrap().clone()
    }

    fn err(&self, msg: &str) -> Error {
        Error::Port {
            port: self.name.clone(),
            msg: msg.to_string(),
        }
    }
}

impl EthDev for SimDev {
    fn name(&self) -> &str {
        &self.name
    }

    fn configure(&self, conf: &PortConf) -> Result<()> {
        if self.started.load(Ordering::SeqCst) {
            return Err(self.err("configure while started"));
        }
        *self.rx_queues.lock().unwrap() = (0..conf.num_rx_queues).map(|_| VecDeque::new()).collect();
        *self.tx_queues.lock().unwrap() = (0..conf.num_tx_queues).map(|_| Vec::new()).collect();
        *self.reta.lock().unwrap() = vec![0; self.reta_size.load(Ordering::SeqCst) as usize];
        self.configured.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn setup_rx_queue(&self, queue: u16, _numa_node: usize, _pool: &Arc<BufferPool>) -> Result<()> {
        if queue as usize >= self.rx_queues.lock().unwrap().len() {
            return Err(self.err("RX queue out of range"));
        }
        Ok(())
    }

    fn setup_tx_queue(&self, queue: u16, _numa_node: usize) -> Result<()> {
        if queue as usize >= self.tx_queues.lock().unwrap().len() {
            return Err(self.err("TX queue out of range"));
        }
        Ok(())
    }

    fn start(&self) -> Result<()> {
        if !self.configured.load(Ordering::SeqCst) {
            return Err(self.err("start before configure"));
        }
        self.started.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn stop(&self) {
        self.started.store(false, Ordering::SeqCst);
    }

    fn close(&self) {
        self.stop();
        self.rx_queues.lock().unwrap().clear();
        self.tx_queues.lock().unwrap().clear();
    }

    fn link_up(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    fn mac_addr(&self) -> [u8; 6] {
        *self.mac.lock().unwrap()
    }

    fn rx_burst(&self, queue: u16, out: &mut Vec<PktBuf>, max: usize) -> usize {
        let mut queues = self.rx_queues.lock().unwrap();
        let Some(q) = queues.get_mut(queue as usize) else {
            return 0;
        };
        let mut n = 0;
        while n < max {
            match q.pop_front() {
                Some(pkt) => {
                    out.push(pkt);
                    n += 1;
                }
                None => break,
            }
        }
        n
    }

    fn tx_burst(&self, queue: u16, pkts: &mut Vec<PktBuf>) -> usize {
        let mut queues = self.tx_queues.lock().unwrap();
        let Some(q) = queues.get_mut(queue as usize) else {
            return 0;
        };
        let cap = self.tx_accept.load(Ordering::SeqCst);
        let n = pkts.len().min(cap);
        for pkt in pkts.drain(..n) {
            q.push(pkt);
        }
        n
    }

    fn reta_size(&self) -> u16 {
        self.reta_size.load(Ordering::SeqCst)
    }

    fn update_reta(&self, table: &[u16]) -> Result<()> {
        let mut reta = self.reta.lock().unwrap();
        if table.len() != reta.len() {
            return Err(self.err("RETA size mismatch"));
        }
        reta.copy_from_slice(table);
        Ok(())
    }

    fn query_reta(&self, table: &mut [u16]) -> Result<()> {
        let reta = self.reta.lock().unwrap();
        if table.len() != reta.len() {
            return Err(self.err("RETA size mismatch"));
        }
        table.copy_from_slice(&reta);
        Ok(())
    }

    fn set_mc_addr_list(&self, macs: &[[u8; 6]]) -> Result<()> {
        *self.mc_addrs.lock().unwrap() = macs.to_vec();
        Ok(())
    }

    fn add_ntuple_filter(&self, filter: &NtupleFilter) -> Result<()> {
        self.ntuple_filters.lock().unwrap().push(*filter);
        Ok(())
    }

    fn add_ethertype_filter(&self, ether_type: u16, queue: u16) -> Result<()> {
        self.ethertype_filters.lock().unwrap().push((ether_type, queue));
        Ok(())
    }

    fn set_mtu(&self, mtu: u32) -> Result<()> {
        self.mtu.store(mtu, Ordering::SeqCst);
        Ok(())
    }
}
