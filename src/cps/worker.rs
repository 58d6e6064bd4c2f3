//! The CPS worker: one cooperative loop on one lcore.
//!
//! Each iteration moves ingress packets from the NIC into the CPI, drains
//! the request mailbox, moves egress packets from the CPI back out the
//! NIC (intercepting ARP and ND on the way), ticks the staleness scan
//! timer, and drains one batch of kernel routing events. Nothing blocks;
//! termination is a cooperative flag observed once per iteration.

use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use smoltcp::wire::{ArpOperation, ArpPacket, ArpRepr, EthernetFrame};
use tracing::{info, warn};

use crate::cps::cpi::Cpi;
use crate::cps::mailbox::Mailbox;
use crate::cps::neighbor::{
    build_arp_reply, build_nd_advert, LinkResolver, NeighborTracker,
};
use crate::cps::route::{FibSink, RouteEventSocket};
use crate::cps::CpsRequest;
use crate::dataplane::buffer::{BufferPool, PktBuf};
use crate::net::{Iface, Side};

/// Requests handled per mailbox drain.
pub const CPS_REQ_BURST_SIZE: usize = 32;

const ETHER_TYPE_ARP: u16 = 0x0806;
const ETHER_TYPE_IPV6: u16 = 0x86dd;
const IPPROTO_ICMPV6: u8 = 58;
const ND_NEIGHBOR_SOLICITATION: u8 = 135;
const ND_NEIGHBOR_ADVERTISEMENT: u8 = 136;

/// Deadline-driven periodic trigger ticked by the worker itself.
pub struct ScanTimer {
    interval: Duration,
    next: Instant,
}

impl ScanTimer {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            next: Instant::now() + interval,
        }
    }

    /// True once per elapsed interval.
    pub fn expired(&mut self) -> bool {
        let now = Instant::now();
        if now >= self.next {
            self.next = now + self.interval;
            true
        } else {
            false
        }
    }
}

/// Per-interface state of the worker: the NIC queues, the CPI twin, and
/// the outstanding resolution requests of that CPI.
pub struct IfaceLane {
    pub iface: Arc<Iface>,
    pub cpi: Cpi,
    pub rx_queue: u16,
    pub tx_queue: u16,
    pub tracker: NeighborTracker,
    rx_scratch: Vec<PktBuf>,
    fwd_scratch: Vec<PktBuf>,
}

impl IfaceLane {
    pub fn new(iface: Arc<Iface>, cpi: Cpi, rx_queue: u16, tx_queue: u16, burst: usize) -> Self {
        Self {
            iface,
            cpi,
            rx_queue,
            tx_queue,
            tracker: NeighborTracker::new(),
            rx_scratch: Vec::with_capacity(burst),
            fwd_scratch: Vec::with_capacity(burst),
        }
    }
}

/// The CPS worker.
pub struct CpsWorker {
    front: IfaceLane,
    back: Option<IfaceLane>,
    mailbox: Mailbox<CpsRequest>,
    resolver: Arc<dyn LinkResolver>,
    pool: Arc<BufferPool>,
    scan_timer: ScanTimer,
    route: Option<(RouteEventSocket, Arc<dyn FibSink>)>,
    exiting: Arc<AtomicBool>,
    max_pkt_burst: usize,
    req_scratch: Vec<CpsRequest>,
}

impl CpsWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        front: IfaceLane,
        back: Option<IfaceLane>,
        mailbox: Mailbox<CpsRequest>,
        resolver: Arc<dyn LinkResolver>,
        pool: Arc<BufferPool>,
        scan_interval: Duration,
        route: Option<(RouteEventSocket, Arc<dyn FibSink>)>,
        exiting: Arc<AtomicBool>,
        max_pkt_burst: usize,
    ) -> Self {
        Self {
            front,
            back,
            mailbox,
            resolver,
            pool,
            scan_timer: ScanTimer::new(scan_interval),
            route,
            exiting,
            max_pkt_burst,
            req_scratch: Vec::with_capacity(CPS_REQ_BURST_SIZE),
        }
    }

    /// Run until the exiting flag is observed.
    pub fn run(&mut self) {
        info!("cps: the CPS block is running");
        while !self.exiting.load(Ordering::Acquire) {
            self.iteration();
        }
        info!("cps: the CPS block is exiting");
    }

    /// One pass of the cooperative loop.
    pub fn iteration(&mut self) {
        // IPv4 BGP packets arrive directly on the NIC queue via the
        // n-tuple filters; push everything into the kernel stack.
        process_ingress(&mut self.front, self.max_pkt_burst);
        if let Some(back) = &mut self.back {
            process_ingress(back, self.max_pkt_burst);
        }

        // Requests made to the CPS block, including IPv6 BGP packets that
        // arrived via the ACL.
        self.process_reqs();

        // Packets the kernel produced: intercept neighbor discovery,
        // forward the rest out the NIC.
        process_egress(&mut self.front, self.resolver.as_ref(), self.max_pkt_burst);
        if let Some(back) = &mut self.back {
            process_egress(back, self.resolver.as_ref(), self.max_pkt_burst);
        }

        if self.scan_timer.expired() {
            self.scan();
        }

        if let Some((sock, fib)) = &self.route {
            if let Err(e) = sock.poll(fib.as_ref()) {
                warn!(error = %e, "cps: failed to read routing events");
            }
        }
    }

    /// Staleness pass over both trackers. Public so tests can drive the
    /// scan without waiting out the timer.
    pub fn scan(&mut self) {
        self.front.tracker.scan(self.resolver.as_ref());
        if let Some(back) = &mut self.back {
            back.tracker.scan(self.resolver.as_ref());
        }
    }

    pub fn lane(&self, side: Side) -> Option<&IfaceLane> {
        match side {
            Side::Front => Some(&self.front),
            Side::Back => self.back.as_ref(),
        }
    }

    fn lane_mut(&mut self, side: Side) -> Option<&mut IfaceLane> {
        match side {
            Side::Front => Some(&mut self.front),
            Side::Back => self.back.as_mut(),
        }
    }

    fn process_reqs(&mut self) {
        self.req_scratch.clear();
        let mut reqs = std::mem::take(&mut self.req_scratch);
        self.mailbox.dequeue_burst(&mut reqs, CPS_REQ_BURST_SIZE);

        for req in reqs.drain(..) {
            match req {
                CpsRequest::Bgp { side, mut pkts } => {
                    if let Some(lane) = self.lane_mut(side) {
                        lane.cpi.tx_burst(&mut pkts);
                    }
                    // Whatever the CPI refused is freed; the peer
                    // retransmits.
                    drop(pkts);
                }
                CpsRequest::Arp { side, ip, ha } => {
                    let pool = Arc::clone(&self.pool);
                    if let Some(lane) = self.lane_mut(side) {
                        send_arp_reply_cpi(lane, &pool, ip, ha);
                        // Remove the request either way: a failed reply
                        // just forces the kernel to solicit again.
                        lane.tracker.remove_arp(ip);
                    }
                }
                CpsRequest::Nd { side, ip, ha } => {
                    let pool = Arc::clone(&self.pool);
                    if let Some(lane) = self.lane_mut(side) {
                        send_nd_advert_cpi(lane, &pool, ip, ha);
                        lane.tracker.remove_nd(ip);
                    }
                }
            }
        }
        self.req_scratch = reqs;
    }
}

/// NIC RX queue -> CPI, then service kernel administrative requests.
fn process_ingress(lane: &mut IfaceLane, burst: usize) {
    lane.rx_scratch.clear();
    lane.iface
        .dev()
        .rx_burst(lane.rx_queue, &mut lane.rx_scratch, burst);
    lane.cpi.tx_burst(&mut lane.rx_scratch);
    // Packets the CPI could not absorb are freed here.
    lane.rx_scratch.clear();

    // MTU and link-state requests from the kernel are handled inline so
    // the kernel's netlink operations complete.
    if let Err(e) = lane.cpi.handle_request() {
        warn!(cpi = lane.cpi.name(), error = %e, "error handling userspace request on CPI");
    }
}

/// CPI -> NIC TX queue, intercepting neighbor discovery.
fn process_egress(lane: &mut IfaceLane, resolver: &dyn LinkResolver, burst: usize) {
    lane.rx_scratch.clear();
    lane.fwd_scratch.clear();
    if lane.cpi.rx_burst(&mut lane.rx_scratch, burst) == 0 {
        return;
    }

    for pkt in lane.rx_scratch.drain(..) {
        let data = pkt.data();
        if data.len() < 14 {
            continue; // freed
        }
        match u16::from_be_bytes([data[12], data[13]]) {
            ETHER_TYPE_ARP => {
                // Intercept and consume; the resolver does the on-wire
                // resolution for us.
                if let Some(target) = arp_request_target(data) {
                    if resolver.arp_enabled() {
                        lane.tracker.note_arp_request(target);
                        resolver.hold_arp(target);
                    }
                }
            }
            ETHER_TYPE_IPV6 if pkt_is_nd(&lane.iface, data) => {
                if let Some(target) = nd_target(data) {
                    if resolver.nd_enabled() {
                        lane.tracker.note_nd_request(target);
                        resolver.hold_nd(target);
                    }
                }
            }
            _ => {
                // Forward all other packets to the interface.
                lane.fwd_scratch.push(pkt);
            }
        }
    }

    lane.iface
        .dev()
        .tx_burst(lane.tx_queue, &mut lane.fwd_scratch);
    // Packets the NIC could not transmit are freed; the kernel resends.
    lane.fwd_scratch.clear();
}

fn send_arp_reply_cpi(lane: &mut IfaceLane, pool: &Arc<BufferPool>, ip: Ipv4Addr, ha: [u8; 6]) {
    let Some(ip4_addr) = lane.iface.ip4_addr else {
        return;
    };
    let Some(reply) = build_arp_reply(pool, &lane.iface.name, lane.iface.mac(), ip4_addr, ip, ha)
    else {
        return;
    };
    let mut pkts = vec![reply];
    if lane.cpi.tx_burst(&mut pkts) == 0 {
        warn!(cpi = lane.cpi.name(), "could not transmit an ARP reply to the CPI");
    }
}

fn send_nd_advert_cpi(lane: &mut IfaceLane, pool: &Arc<BufferPool>, ip: Ipv6Addr, ha: [u8; 6]) {
    let Some(nd) = lane.iface.nd_addrs() else {
        return;
    };
    let Some(advert) = build_nd_advert(
        pool,
        &lane.iface.name,
        lane.iface.mac(),
        nd.ll_ip6_addr,
        ip,
        ha,
    ) else {
        return;
    };
    let mut pkts = vec![advert];
    if lane.cpi.tx_burst(&mut pkts) == 0 {
        warn!(cpi = lane.cpi.name(), "could not transmit an ND advertisement to the CPI");
    }
}

/// Target address of an egress ARP request, if the frame is one.
fn arp_request_target(data: &[u8]) -> Option<Ipv4Addr> {
    let frame = EthernetFrame::new_checked(data).ok()?;
    let arp = ArpPacket::new_checked(frame.payload()).ok()?;
    match ArpRepr::parse(&arp).ok()? {
        ArpRepr::EthernetIpv4 {
            operation: ArpOperation::Request,
            target_protocol_addr,
            ..
        } => Some(target_protocol_addr),
        _ => None,
    }
}

/// Whether an egress IPv6 frame is a neighbor message sent by one of the
/// interface's own addresses (global, link-local, or either
/// solicited-node multicast).
fn pkt_is_nd(iface: &Iface, data: &[u8]) -> bool {
    // Ethernet + IPv6 + ICMPv6 header + ND target.
    if data.len() < 14 + 40 + 24 {
        return false;
    }
    if data[14 + 6] != IPPROTO_ICMPV6 {
        return false;
    }
    let icmp_type = data[14 + 40];
    if icmp_type != ND_NEIGHBOR_SOLICITATION && icmp_type != ND_NEIGHBOR_ADVERTISEMENT {
        return false;
    }
    let mut src = [0u8; 16];
    src.copy_from_slice(&data[14 + 8..14 + 24]);
    iface.owns_ipv6(&Ipv6Addr::from(src))
}

/// Target address of an egress neighbor solicitation or advertisement.
fn nd_target(data: &[u8]) -> Option<Ipv6Addr> {
    let off = 14 + 40 + 8;
    let bytes = data.get(off..off + 16)?;
    let mut target = [0u8; 16];
    target.copy_from_slice(bytes);
    Some(Ipv6Addr::from(target))
}
