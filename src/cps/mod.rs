//! The control-plane side channel (CPS) block.
//!
//! CPS keeps the host network stack functional on interfaces the fast
//! path owns: BGP sessions terminate on the host stack, ARP and ND are
//! intercepted and answered through the link-layer resolver, and kernel
//! routing changes feed the external FIB manager.
//!
//! Setup is staged. Stage 1 assigns the worker's NIC queues and creates
//! the CPIs (before devices start, so device reinitialization cannot wipe
//! RETA or multicast-MAC state). Stage 2 installs the BGP filters and
//! opens the routing socket. Stage 3 launches the worker loop on its
//! lcore.

pub mod cpi;
pub mod mailbox;
pub mod neighbor;
pub mod route;
pub mod worker;

use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use tracing::{debug, error, info};

use crate::config::CpsConfig;
use crate::dataplane::buffer::PktBuf;
use crate::error::{Error, Result};
use crate::net::acl::{AclAddrChunk, AclField, Ipv6AclRule};
use crate::net::dev::EthDev;
use crate::net::filter::ntuple_filter_add;
use crate::net::queue::QueueType;
use crate::net::{lcore_to_numa_node, Iface, Net, Side};
use cpi::{Cpi, CpiKernelHandle, CpiOps};
use mailbox::{mailbox, Mailbox, MailboxSender};
use neighbor::LinkResolver;
use route::{FibSink, RouteEventSocket};
use worker::{CpsWorker, IfaceLane};

/// Two rules per interface: BGP by source port and by destination port.
pub const NUM_ACL_BGP_RULES: usize = 2;

const IPPROTO_TCP: u8 = 6;

/// A request posted to the CPS worker's mailbox.
#[derive(Debug)]
pub enum CpsRequest {
    /// IPv6 BGP packets that arrived via the ACL; transmitted verbatim
    /// into the interface's CPI.
    Bgp { side: Side, pkts: Vec<PktBuf> },
    /// A completed ARP resolution from the link-layer resolver.
    Arp {
        side: Side,
        ip: Ipv4Addr,
        ha: [u8; 6],
    },
    /// A completed ND resolution from the link-layer resolver.
    Nd {
        side: Side,
        ip: Ipv6Addr,
        ha: [u8; 6],
    },
}

/// Post a burst of BGP packets to the CPS mailbox.
///
/// On failure the burst is freed here; the peer's TCP stack retransmits.
pub fn submit_bgp(
    sender: &MailboxSender<CpsRequest>,
    side: Side,
    pkts: Vec<PktBuf>,
) -> Result<()> {
    match sender.try_send(CpsRequest::Bgp { side, pkts }) {
        Ok(()) => Ok(()),
        Err(req) => {
            // Dropping the request frees the packets it carries.
            drop(req);
            Err(Error::Exhausted("cps mailbox"))
        }
    }
}

/// Build one of the two BGP steering rules for an interface's global
/// IPv6 address.
fn fill_bgp_rule(ip6_addr: Ipv6Addr, filter_source_port: bool, tcp_port_bgp: u16) -> Ipv6AclRule {
    let octets = ip6_addr.octets();
    let mut rule = Ipv6AclRule {
        proto: AclField {
            value: IPPROTO_TCP,
            mask: 0xff,
        },
        priority: 1,
        ..Default::default()
    };
    for (i, chunk) in rule.dst.iter_mut().enumerate() {
        *chunk = AclAddrChunk {
            value: u32::from_be_bytes([
                octets[i * 4],
                octets[i * 4 + 1],
                octets[i * 4 + 2],
                octets[i * 4 + 3],
            ]),
            mask_len: 32,
        };
    }
    if filter_source_port {
        rule.src_port = AclField {
            value: tcp_port_bgp,
            mask: 0xffff,
        };
    } else {
        rule.dst_port = AclField {
            value: tcp_port_bgp,
            mask: 0xffff,
        };
    }
    rule
}

/// Walk IPv6 extension headers; returns the offset of the upper-layer
/// header within `l3` and its protocol number.
fn ipv6_skip_exthdr(l3: &[u8]) -> Option<(usize, u8)> {
    const HOP_BY_HOP: u8 = 0;
    const ROUTING: u8 = 43;
    const FRAGMENT: u8 = 44;
    const AUTH: u8 = 51;
    const DEST_OPTS: u8 = 60;

    let mut next = *l3.get(6)?;
    let mut offset = 40usize;
    loop {
        match next {
            HOP_BY_HOP | ROUTING | DEST_OPTS => {
                let hdr = l3.get(offset..offset + 2)?;
                next = hdr[0];
                offset += (hdr[1] as usize + 1) * 8;
            }
            FRAGMENT => {
                next = *l3.get(offset)?;
                offset += 8;
            }
            AUTH => {
                let hdr = l3.get(offset..offset + 2)?;
                next = hdr[0];
                offset += (hdr[1] as usize + 2) * 4;
            }
            _ => return Some((offset, next)),
        }
        if offset > l3.len() {
            return None;
        }
    }
}

/// Extension-header fallback matcher for BGP: match IPv6 packets whose
/// destination is the interface's global address and whose TCP header,
/// behind any extension headers, uses the BGP port on either side.
pub fn match_bgp(pkt: &PktBuf, iface: &Iface, tcp_port_bgp: u16) -> bool {
    let data = pkt.data();
    if data.len() < 14 + 40 + 20 {
        debug!(
            iface = %iface.name,
            len = data.len(),
            "BGP packet shorter than Ethernet + IPv6 + TCP"
        );
        return false;
    }
    if u16::from_be_bytes([data[12], data[13]]) != 0x86dd {
        return false;
    }
    let l3 = &data[14..];

    let Some(ip6_addr) = iface.ip6_addr else {
        return false;
    };
    if l3[24..40] != ip6_addr.octets() {
        return false;
    }

    let Some((tcp_offset, nexthdr)) = ipv6_skip_exthdr(l3) else {
        return false;
    };
    if nexthdr != IPPROTO_TCP {
        return false;
    }
    let Some(tcp) = l3.get(tcp_offset..tcp_offset + 20) else {
        debug!(
            iface = %iface.name,
            len = data.len(),
            "BGP packet too short for its TCP header"
        );
        return false;
    };

    let src_port = u16::from_be_bytes([tcp[0], tcp[1]]);
    let dst_port = u16::from_be_bytes([tcp[2], tcp[3]]);
    src_port == tcp_port_bgp || dst_port == tcp_port_bgp
}

/// Install the BGP steering for one interface: n-tuple filters for IPv4
/// and a two-rule ACL category (with the extension-header fallback) for
/// IPv6.
fn add_bgp_filters(
    iface: &Arc<Iface>,
    side: Side,
    tcp_port_bgp: u16,
    rx_queue: u16,
    sender: &MailboxSender<CpsRequest>,
) -> Result<()> {
    if iface.ipv4_configured() {
        // Capture packets for connections started by our BGP speaker.
        ntuple_filter_add(
            iface.dev().as_ref(),
            iface.ip4_addr,
            tcp_port_bgp,
            u16::MAX,
            0,
            0,
            IPPROTO_TCP,
            rx_queue,
            true,
        )?;
        // Capture packets for connections remote BGP speakers started.
        ntuple_filter_add(
            iface.dev().as_ref(),
            iface.ip4_addr,
            0,
            0,
            tcp_port_bgp,
            u16::MAX,
            IPPROTO_TCP,
            rx_queue,
            true,
        )?;
    }

    if iface.ipv6_configured() {
        let ip6_addr = iface
            .ip6_addr
            .ok_or_else(|| Error::Config(format!("{} has no IPv6 address", iface.name)))?;
        let rules = vec![
            fill_bgp_rule(ip6_addr, true, tcp_port_bgp),
            fill_bgp_rule(ip6_addr, false, tcp_port_bgp),
        ];
        debug_assert_eq!(rules.len(), NUM_ACL_BGP_RULES);

        let match_sender = sender.clone();
        iface.acl.register(
            rules,
            Arc::new(move |pkts, _iface| submit_bgp(&match_sender, side, pkts)),
            Arc::new(move |pkt, iface| match_bgp(pkt, iface, tcp_port_bgp)),
        )?;
    }

    Ok(())
}

fn cpi_ops(dev: Arc<dyn EthDev>) -> CpiOps {
    let mtu_dev = Arc::clone(&dev);
    CpiOps {
        change_mtu: Box::new(move |mtu| mtu_dev.set_mtu(mtu)),
        config_link: Box::new(move |up| {
            if up {
                dev.start()
            } else {
                dev.stop();
                Ok(())
            }
        }),
    }
}

struct LaneSetup {
    iface: Arc<Iface>,
    cpi: Cpi,
    rx_queue: u16,
    tx_queue: u16,
}

/// The CPS block through its setup stages.
pub struct CpsBlock {
    conf: CpsConfig,
    front: LaneSetup,
    back: Option<LaneSetup>,
    mailbox_tx: MailboxSender<CpsRequest>,
    mailbox_rx: Option<Mailbox<CpsRequest>>,
    front_kernel: CpiKernelHandle,
    back_kernel: Option<CpiKernelHandle>,
    route_sock: Option<RouteEventSocket>,
    max_pkt_burst: usize,
}

impl CpsBlock {
    /// Stage 1: assign this block's NIC queues and create the CPIs.
    pub fn stage1(net: &Net, conf: CpsConfig) -> Result<Self> {
        let numa_node = lcore_to_numa_node(conf.lcore);
        let pool = net.pools.pool(numa_node);

        let front = Self::lane_stage1(&net.front, conf.lcore, numa_node, pool)?;
        let back = match &net.back {
            Some(iface) => Some(Self::lane_stage1(iface, conf.lcore, numa_node, pool)?),
            None => None,
        };

        let (mailbox_tx, mailbox_rx) = mailbox("cps_mb", conf.mailbox_max_entries);
        let front_kernel = front.1.clone();
        let back_kernel = back.as_ref().map(|b| b.1.clone());

        Ok(Self {
            conf,
            front: front.0,
            back: back.map(|b| b.0),
            mailbox_tx,
            mailbox_rx: Some(mailbox_rx),
            front_kernel,
            back_kernel,
            route_sock: None,
            max_pkt_burst: net.max_pkt_burst,
        })
    }

    fn lane_stage1(
        iface: &Arc<Iface>,
        lcore: usize,
        numa_node: usize,
        pool: &Arc<crate::dataplane::buffer::BufferPool>,
    ) -> Result<(LaneSetup, CpiKernelHandle)> {
        let rx_queue = iface.get_queue_id(QueueType::Rx, lcore, numa_node, pool)?;
        let tx_queue = iface.get_queue_id(QueueType::Tx, lcore, numa_node, pool)?;

        let (cpi, kernel) = Cpi::new(
            format!("cpi_{}", iface.name),
            cpi_ops(Arc::clone(iface.dev())),
        );

        Ok((
            LaneSetup {
                iface: Arc::clone(iface),
                cpi,
                rx_queue,
                tx_queue,
            },
            kernel,
        ))
    }

    /// Stage 2: install BGP steering and open the routing socket.
    ///
    /// `open_route_sock` is false in environments without a kernel
    /// routing socket (the FIB manager then gets no updates).
    pub fn stage2(&mut self, open_route_sock: bool) -> Result<()> {
        add_bgp_filters(
            &self.front.iface,
            Side::Front,
            self.conf.tcp_port_bgp,
            self.front.rx_queue,
            &self.mailbox_tx,
        )
        .map_err(|e| {
            error!("cps: failed to add BGP filters on the front iface");
            e
        })?;

        if let Some(back) = &self.back {
            add_bgp_filters(
                &back.iface,
                Side::Back,
                self.conf.tcp_port_bgp,
                back.rx_queue,
                &self.mailbox_tx,
            )
            .map_err(|e| {
                error!("cps: failed to add BGP filters on the back iface");
                e
            })?;
        }

        if open_route_sock {
            self.route_sock = Some(RouteEventSocket::open().map_err(|e| {
                error!("cps: failed to open route event socket");
                e
            })?);
        }

        Ok(())
    }

    /// Producer handle for the resolver and the ACL path.
    pub fn mailbox_sender(&self) -> MailboxSender<CpsRequest> {
        self.mailbox_tx.clone()
    }

    /// Kernel-side handle of an interface's CPI.
    pub fn kernel_handle(&self, side: Side) -> Option<CpiKernelHandle> {
        match side {
            Side::Front => Some(self.front_kernel.clone()),
            Side::Back => self.back_kernel.clone(),
        }
    }

    /// Build the worker without spawning a thread. Used by tests and by
    /// callers that own their scheduling.
    pub fn into_worker(
        mut self,
        net: &Net,
        resolver: Arc<dyn LinkResolver>,
        fib: Option<Arc<dyn FibSink>>,
        exiting: Arc<AtomicBool>,
    ) -> Result<CpsWorker> {
        let numa_node = lcore_to_numa_node(self.conf.lcore);
        let pool = Arc::clone(net.pools.pool(numa_node));
        let burst = self.max_pkt_burst;

        let mailbox_rx = self
            .mailbox_rx
            .take()
            .ok_or_else(|| Error::Config("cps worker already built".into()))?;

        let route = match (self.route_sock.take(), fib) {
            (Some(sock), Some(fib)) => Some((sock, fib)),
            _ => None,
        };

        let front = IfaceLane::new(
            self.front.iface,
            self.front.cpi,
            self.front.rx_queue,
            self.front.tx_queue,
            burst,
        );
        let back = self.back.map(|b| {
            IfaceLane::new(b.iface, b.cpi, b.rx_queue, b.tx_queue, burst)
        });

        Ok(CpsWorker::new(
            front,
            back,
            mailbox_rx,
            resolver,
            pool,
            self.conf.scan_interval,
            route,
            exiting,
            burst,
        ))
    }

    /// Stage 3: launch the worker loop on its own pinned thread.
    pub fn spawn(
        self,
        net: &Net,
        resolver: Arc<dyn LinkResolver>,
        fib: Option<Arc<dyn FibSink>>,
    ) -> Result<CpsRunning> {
        let exiting = Arc::new(AtomicBool::new(false));
        let lcore = self.conf.lcore;
        let mailbox_tx = self.mailbox_sender();
        let front_kernel = self.front_kernel.clone();
        let back_kernel = self.back_kernel.clone();
        let mut worker = self.into_worker(net, resolver, fib, Arc::clone(&exiting))?;

        let thread = std::thread::Builder::new()
            .name("cps".to_string())
            .spawn(move || {
                pin_to_lcore(lcore);
                worker.run();
            })
            .map_err(|e| Error::Config(format!("failed to spawn the CPS worker: {e}")))?;

        Ok(CpsRunning {
            mailbox: mailbox_tx,
            front_kernel,
            back_kernel,
            exiting,
            thread: Some(thread),
        })
    }
}

fn pin_to_lcore(lcore: usize) {
    use nix::sched::{sched_setaffinity, CpuSet};
    use nix::unistd::Pid;

    let mut set = CpuSet::new();
    if set.set(lcore).is_ok() {
        if let Err(e) = sched_setaffinity(Pid::from_raw(0), &set) {
            tracing::warn!(lcore, error = %e, "cps: could not pin the worker");
        }
    }
}

/// Handle to the running CPS block.
pub struct CpsRunning {
    pub mailbox: MailboxSender<CpsRequest>,
    pub front_kernel: CpiKernelHandle,
    pub back_kernel: Option<CpiKernelHandle>,
    exiting: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl CpsRunning {
    /// Cooperative shutdown: raise the flag and join the worker.
    pub fn stop(mut self) {
        self.exiting.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("cps: the worker thread panicked");
            }
        }
        info!("cps: stopped");
    }
}

impl Drop for CpsRunning {
    fn drop(&mut self) {
        self.exiting.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}
