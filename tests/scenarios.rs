//! End-to-end scenarios for the CPS block over simulated ports.

use std::collections::HashMap;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use gatekeeper_net::config::{CpsConfig, IfaceConfig, NetConfig};
use gatekeeper_net::cps::mailbox::MailboxSender;
use gatekeeper_net::cps::neighbor::LinkResolver;
use gatekeeper_net::cps::worker::CpsWorker;
use gatekeeper_net::cps::{submit_bgp, CpsBlock, CpsRequest};
use gatekeeper_net::cps::cpi::CpiKernelHandle;
use gatekeeper_net::dataplane::buffer::{BufferPool, PktBuf};
use gatekeeper_net::net::dev::EthDev;
use gatekeeper_net::net::{Net, Side};
use gatekeeper_net::test_util::{arp_request, neighbor_solicitation, tcp4_packet, tcp6_packet, SimDev};

const FRONT_MAC: [u8; 6] = [0x02, 0, 0, 0, 0, 0x01];

#[derive(Default)]
struct RecResolver {
    arp_holds: Mutex<Vec<Ipv4Addr>>,
    arp_puts: Mutex<Vec<Ipv4Addr>>,
    nd_holds: Mutex<Vec<Ipv6Addr>>,
    nd_puts: Mutex<Vec<Ipv6Addr>>,
}

impl LinkResolver for RecResolver {
    fn hold_arp(&self, ip: Ipv4Addr) {
        self.arp_holds.lock().unwrap().push(ip);
    }
    fn put_arp(&self, ip: Ipv4Addr) {
        self.arp_puts.lock().unwrap().push(ip);
    }
    fn hold_nd(&self, ip: Ipv6Addr) {
        self.nd_holds.lock().unwrap().push(ip);
    }
    fn put_nd(&self, ip: Ipv6Addr) {
        self.nd_puts.lock().unwrap().push(ip);
    }
}

struct Harness {
    net: Net,
    dev: Arc<SimDev>,
    worker: CpsWorker,
    mailbox: MailboxSender<CpsRequest>,
    kernel: CpiKernelHandle,
    pool: Arc<BufferPool>,
    resolver: Arc<RecResolver>,
}

impl Harness {
    fn new(cidrs: &[&str], mac: [u8; 6], cps_conf: CpsConfig) -> Self {
        let dev = SimDev::new("sim:0").with_mac(mac);
        let mut port_map: HashMap<String, Arc<dyn EthDev>> = HashMap::new();
        port_map.insert("sim:0".to_string(), dev.clone());

        let net_config = NetConfig::new(IfaceConfig::new(
            "front",
            vec!["sim:0".to_string()],
            cidrs.iter().map(|s| s.to_string()).collect(),
        ));
        let net = Net::init(&net_config, &port_map, 1).unwrap();

        let mut cps = CpsBlock::stage1(&net, cps_conf).unwrap();
        net.start().unwrap();
        cps.stage2(false).unwrap();
        net.finalize().unwrap();

        let mailbox = cps.mailbox_sender();
        let kernel = cps.kernel_handle(Side::Front).unwrap();
        let pool = Arc::clone(net.pools.pool(0));
        let resolver = Arc::new(RecResolver::default());
        let worker = cps
            .into_worker(
                &net,
                resolver.clone(),
                None,
                Arc::new(AtomicBool::new(false)),
            )
            .unwrap();

        Self {
            net,
            dev,
            worker,
            mailbox,
            kernel,
            pool,
            resolver,
        }
    }

    fn inject_from_kernel(&self, frame: &[u8]) {
        let mut pkt = self.pool.alloc().unwrap();
        pkt.fill_from(frame).unwrap();
        self.kernel.inject(pkt).unwrap();
    }

    fn pkt(&self, frame: &[u8]) -> PktBuf {
        let mut pkt = self.pool.alloc().unwrap();
        pkt.fill_from(frame).unwrap();
        pkt
    }
}

fn v4_harness() -> Harness {
    Harness::new(
        &["192.0.2.1/24"],
        FRONT_MAC,
        CpsConfig {
            scan_interval: Duration::from_millis(50),
            ..CpsConfig::default()
        },
    )
}

fn v6_harness() -> Harness {
    Harness::new(
        &["2001:db8::1/64"],
        [0x02, 0, 0, 0, 0, 0x02],
        CpsConfig {
            scan_interval: Duration::from_millis(50),
            ..CpsConfig::default()
        },
    )
}

/// S1: a resolved ARP request turns into a bit-exact reply on the CPI
/// and clears exactly the matching tracker entry.
#[test]
fn arp_reply_injection() {
    let mut h = v4_harness();
    let target = Ipv4Addr::new(192, 0, 2, 100);
    let other = Ipv4Addr::new(192, 0, 2, 101);

    // The kernel solicits two neighbors; both get tracked.
    h.inject_from_kernel(&arp_request(FRONT_MAC, Ipv4Addr::new(192, 0, 2, 1), target));
    h.inject_from_kernel(&arp_request(FRONT_MAC, Ipv4Addr::new(192, 0, 2, 1), other));
    h.worker.iteration();
    let lane = h.worker.lane(Side::Front).unwrap();
    assert!(lane.tracker.has_arp(target));
    assert!(lane.tracker.has_arp(other));
    assert_eq!(*h.resolver.arp_holds.lock().unwrap(), vec![target, other]);

    let resolved_mac = [0x02, 0, 0, 0, 0, 0x64];
    h.mailbox
        .try_send(CpsRequest::Arp {
            side: Side::Front,
            ip: target,
            ha: resolved_mac,
        })
        .unwrap();
    h.worker.iteration();

    let reply = h.kernel.recv().expect("ARP reply on the CPI");
    let data = reply.data();
    assert_eq!(&data[0..6], &FRONT_MAC);
    assert_eq!(&data[6..12], &resolved_mac);
    assert_eq!(u16::from_be_bytes([data[12], data[13]]), 0x0806);
    let arp = &data[14..];
    assert_eq!(u16::from_be_bytes([arp[6], arp[7]]), 2); // reply
    assert_eq!(&arp[8..14], &resolved_mac); // sha
    assert_eq!(&arp[14..18], &target.octets()); // sip
    assert_eq!(&arp[18..24], &FRONT_MAC); // tha
    assert_eq!(&arp[24..28], &[192, 0, 2, 1]); // tip

    let lane = h.worker.lane(Side::Front).unwrap();
    assert!(!lane.tracker.has_arp(target), "resolved entry removed");
    assert!(lane.tracker.has_arp(other), "other entries untouched");
}

/// S2: a resolved ND request turns into a valid neighbor advertisement.
#[test]
fn nd_advertisement_injection() {
    let mut h = v6_harness();
    let iface_mac = [0x02, 0, 0, 0, 0, 0x02];
    let ll: Ipv6Addr = "fe80::ff:fe00:2".parse().unwrap();
    let target: Ipv6Addr = "2001:db8::100".parse().unwrap();

    assert_eq!(h.net.front.nd_addrs().unwrap().ll_ip6_addr, ll);

    // Kernel solicits from its link-local address.
    h.inject_from_kernel(&neighbor_solicitation(iface_mac, ll, target));
    h.worker.iteration();
    assert!(h.worker.lane(Side::Front).unwrap().tracker.has_nd(target));
    assert_eq!(*h.resolver.nd_holds.lock().unwrap(), vec![target]);

    let resolved_mac = [0x02, 0, 0, 0, 0, 0xc8];
    h.mailbox
        .try_send(CpsRequest::Nd {
            side: Side::Front,
            ip: target,
            ha: resolved_mac,
        })
        .unwrap();
    h.worker.iteration();

    let advert = h.kernel.recv().expect("ND advertisement on the CPI");
    let data = advert.data();
    assert_eq!(&data[0..6], &iface_mac);
    assert_eq!(&data[6..12], &resolved_mac);
    assert_eq!(u16::from_be_bytes([data[12], data[13]]), 0x86dd);

    let ip = &data[14..54];
    assert_eq!(&ip[8..24], &target.octets());
    assert_eq!(&ip[24..40], &ll.octets());
    assert_eq!(ip[6], 58);
    assert_eq!(ip[7], 255);

    let icmp = &data[54..];
    assert_eq!(icmp[0], 136);
    assert_eq!(icmp[1], 0);
    assert_eq!(icmp[4] >> 4, 0x6); // Override | Solicited
    assert_eq!(&icmp[8..24], &target.octets());
    assert_eq!(icmp[24], 2);
    assert_eq!(icmp[25], 1);
    assert_eq!(&icmp[26..32], &resolved_mac);

    assert!(!h.worker.lane(Side::Front).unwrap().tracker.has_nd(target));
}

/// S3: IPv6 BGP classifies into the BGP category, rides the mailbox, and
/// surfaces unchanged on the CPI.
#[test]
fn bgp_ipv6_steering() {
    let mut h = v6_harness();
    let iface_v6: Ipv6Addr = "2001:db8::1".parse().unwrap();
    let peer: Ipv6Addr = "2001:db8::99".parse().unwrap();

    let frame = tcp6_packet(
        [0x02, 0, 0, 0, 0, 0x02],
        [0x02, 0, 0, 0, 0, 0x99],
        peer,
        iface_v6,
        54321,
        179,
    );
    let pkt = h.pkt(&frame);
    h.net
        .front
        .acl
        .process_burst(0, vec![pkt], &h.net.front)
        .unwrap();

    h.worker.iteration();
    let rx = h.kernel.recv().expect("BGP packet on the CPI");
    assert_eq!(rx.data(), &frame[..]);
}

/// The extension-header fallback claims BGP packets the classifier
/// cannot place.
#[test]
fn bgp_ipv6_extension_header_fallback() {
    let mut h = v6_harness();
    let iface_v6: Ipv6Addr = "2001:db8::1".parse().unwrap();

    // IPv6 + hop-by-hop (8 bytes) + TCP dport 179.
    let mut l3 = vec![0u8; 40 + 8 + 20];
    l3[0] = 0x60;
    l3[4..6].copy_from_slice(&((8 + 20) as u16).to_be_bytes());
    l3[6] = 0; // hop-by-hop
    l3[7] = 64;
    l3[8..24].copy_from_slice(&"2001:db8::99".parse::<Ipv6Addr>().unwrap().octets());
    l3[24..40].copy_from_slice(&iface_v6.octets());
    l3[40] = 6; // next: TCP
    l3[41] = 0; // 8 bytes of options
    l3[48..50].copy_from_slice(&54321u16.to_be_bytes());
    l3[50..52].copy_from_slice(&179u16.to_be_bytes());

    let mut frame = vec![0u8; 14];
    frame[0..6].copy_from_slice(&[0x02, 0, 0, 0, 0, 0x02]);
    frame[6..12].copy_from_slice(&[0x02, 0, 0, 0, 0, 0x99]);
    frame[12..14].copy_from_slice(&0x86ddu16.to_be_bytes());
    frame.extend_from_slice(&l3);

    let pkt = h.pkt(&frame);
    h.net
        .front
        .acl
        .process_burst(0, vec![pkt], &h.net.front)
        .unwrap();

    h.worker.iteration();
    let rx = h.kernel.recv().expect("ext-header BGP packet on the CPI");
    assert_eq!(rx.data(), &frame[..]);
}

/// IPv4 BGP is steered by the n-tuple filters straight onto the CPS RX
/// queue and pushed into the CPI by ingress.
#[test]
fn bgp_ipv4_steering() {
    let mut h = v4_harness();
    let frame = tcp4_packet(
        FRONT_MAC,
        [0x02, 0, 0, 0, 0, 0x99],
        Ipv4Addr::new(198, 51, 100, 7),
        Ipv4Addr::new(192, 0, 2, 1),
        40000,
        179,
    );

    let queue = h.dev.inject_rx_steered(&h.pool, &frame).unwrap();
    let lane = h.worker.lane(Side::Front).unwrap();
    assert_eq!(queue, lane.rx_queue, "filter steers BGP to the CPS queue");

    h.worker.iteration();
    let rx = h.kernel.recv().expect("BGP packet on the CPI");
    assert_eq!(rx.data(), &frame[..]);
}

/// S5: an ND entry the kernel stops soliciting is evicted by the second
/// scan, and the resolver's hold is released.
#[test]
fn nd_stale_eviction() {
    let mut h = v6_harness();
    let ll: Ipv6Addr = "fe80::ff:fe00:2".parse().unwrap();
    let target: Ipv6Addr = "2001:db8::100".parse().unwrap();

    h.inject_from_kernel(&neighbor_solicitation(
        [0x02, 0, 0, 0, 0, 0x02],
        ll,
        target,
    ));
    h.worker.iteration();
    assert!(h.worker.lane(Side::Front).unwrap().tracker.has_nd(target));

    h.worker.scan();
    assert!(
        h.worker.lane(Side::Front).unwrap().tracker.has_nd(target),
        "present but stale after the first scan"
    );
    assert!(h.resolver.nd_puts.lock().unwrap().is_empty());

    h.worker.scan();
    assert!(
        !h.worker.lane(Side::Front).unwrap().tracker.has_nd(target),
        "absent after the second scan"
    );
    assert_eq!(*h.resolver.nd_puts.lock().unwrap(), vec![target]);
}

/// The timer-driven scan evicts within two intervals of wall clock.
#[test]
fn nd_stale_eviction_by_timer() {
    let mut h = v6_harness();
    let ll: Ipv6Addr = "fe80::ff:fe00:2".parse().unwrap();
    let target: Ipv6Addr = "2001:db8::100".parse().unwrap();

    h.inject_from_kernel(&neighbor_solicitation(
        [0x02, 0, 0, 0, 0, 0x02],
        ll,
        target,
    ));
    h.worker.iteration();

    // Two 50ms scan intervals plus slack.
    let deadline = std::time::Instant::now() + Duration::from_millis(500);
    while h.worker.lane(Side::Front).unwrap().tracker.has_nd(target) {
        assert!(
            std::time::Instant::now() < deadline,
            "entry survived past two scan intervals"
        );
        h.worker.iteration();
        std::thread::sleep(Duration::from_millis(10));
    }
}

/// S6: mailbox overflow drops the overflowing burst (freeing its
/// packets) while everything already posted is delivered in order.
#[test]
fn mailbox_overflow() {
    let h = Harness::new(
        &["192.0.2.1/24"],
        FRONT_MAC,
        CpsConfig {
            mailbox_max_entries: 4,
            scan_interval: Duration::from_millis(50),
            ..CpsConfig::default()
        },
    );
    let mut worker = h.worker;

    let available = h.pool.available();
    for i in 0..4u8 {
        let mut pkt = h.pool.alloc().unwrap();
        pkt.fill_from(&[i; 64]).unwrap();
        submit_bgp(&h.mailbox, Side::Front, vec![pkt]).unwrap();
    }

    let mut pkt = h.pool.alloc().unwrap();
    pkt.fill_from(&[0xee; 64]).unwrap();
    assert!(submit_bgp(&h.mailbox, Side::Front, vec![pkt]).is_err());
    assert_eq!(
        h.pool.available(),
        available - 4,
        "the overflowing burst was freed"
    );

    worker.iteration();
    for i in 0..4u8 {
        let rx = h.kernel.recv().expect("posted burst delivered");
        assert_eq!(rx.data()[0], i, "FIFO order preserved");
    }
    assert!(h.kernel.recv().is_none());
}

/// Egress: non-ARP/ND kernel traffic goes out the NIC; transmit underrun
/// frees the excess.
#[test]
fn egress_forwarding_and_underrun() {
    let mut h = v4_harness();
    let frame = tcp4_packet(
        [0x02, 0, 0, 0, 0, 0x99],
        FRONT_MAC,
        Ipv4Addr::new(192, 0, 2, 1),
        Ipv4Addr::new(198, 51, 100, 7),
        40000,
        443,
    );

    h.inject_from_kernel(&frame);
    h.worker.iteration();

    let lane = h.worker.lane(Side::Front).unwrap();
    let sent = h.dev.take_tx(lane.tx_queue);
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].data(), &frame[..]);

    // Now refuse all transmission: the packet must be freed, not leaked.
    let available = h.pool.available();
    h.dev.limit_tx(0);
    h.inject_from_kernel(&frame);
    h.worker.iteration();
    assert_eq!(h.pool.available(), available);
}

/// Kernel MTU and link requests are serviced from the worker loop.
#[test]
fn cpi_admin_requests() {
    let mut h = v4_harness();
    h.kernel.request_mtu(9000);
    h.worker.iteration();
    assert_eq!(h.dev.mtu(), 9000);
}

/// The spawned worker honors cooperative shutdown.
#[test]
fn worker_thread_shutdown() {
    let dev = SimDev::new("sim:0");
    let mut port_map: HashMap<String, Arc<dyn EthDev>> = HashMap::new();
    port_map.insert("sim:0".to_string(), dev.clone());

    let net_config = NetConfig::new(IfaceConfig::new(
        "front",
        vec!["sim:0".to_string()],
        vec!["192.0.2.1/24".to_string()],
    ));
    let net = Net::init(&net_config, &port_map, 1).unwrap();
    let mut cps = CpsBlock::stage1(&net, CpsConfig::default()).unwrap();
    net.start().unwrap();
    cps.stage2(false).unwrap();
    net.finalize().unwrap();

    let running = cps
        .spawn(&net, Arc::new(RecResolver::default()), None)
        .unwrap();
    std::thread::sleep(Duration::from_millis(50));
    running.stop();
    net.stop();
}
