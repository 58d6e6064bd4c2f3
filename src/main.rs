use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::info;

use gatekeeper_net::config::{CpsConfig, IfaceConfig, NetConfig};
use gatekeeper_net::cps::neighbor::NullResolver;
use gatekeeper_net::cps::route::{FibSink, RouteUpdate};
use gatekeeper_net::cps::CpsBlock;
use gatekeeper_net::launch::Launch;
use gatekeeper_net::net::dev::EthDev;
use gatekeeper_net::net::{find_num_numa_nodes, Net};
use gatekeeper_net::test_util::SimDev;

/// Gatekeeper data plane: network model and control-plane side channel.
///
/// Runs the CPS block against simulated ports; the production port layer
/// (PCI probing, platform driver) plugs in behind the same device trait.
#[derive(Parser)]
#[command(name = "gatekeeper-net", version)]
struct Args {
    /// CIDRs of the front interface (one IPv4 and/or one IPv6).
    #[arg(long = "front-cidr", required = true)]
    front_cidrs: Vec<String>,

    /// CIDRs of the back interface; omit to run without one.
    #[arg(long = "back-cidr")]
    back_cidrs: Vec<String>,

    /// TCP port used to steer BGP traffic.
    #[arg(long, default_value_t = 179)]
    bgp_port: u16,

    /// Seconds between staleness scans of neighbor resolution requests.
    #[arg(long, default_value_t = 5)]
    scan_interval: u64,

    /// The lcore the CPS worker is pinned to.
    #[arg(long, default_value_t = 0)]
    lcore: usize,

    /// Subscribe to kernel routing events (requires a netlink socket).
    #[arg(long)]
    route_events: bool,
}

/// Log-only FIB consumer, standing in for the external FIB manager.
struct LoggingFib;

impl FibSink for LoggingFib {
    fn route_update(&self, update: RouteUpdate) {
        info!(
            op = ?update.op,
            prefix = %update.prefix,
            gateway = ?update.gateway,
            "route update"
        );
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    let mut net_config = NetConfig::new(IfaceConfig::new(
        "front",
        vec!["sim:0".to_string()],
        args.front_cidrs.clone(),
    ));
    if !args.back_cidrs.is_empty() {
        net_config = net_config.back(IfaceConfig::new(
            "back",
            vec!["sim:1".to_string()],
            args.back_cidrs.clone(),
        ));
    }

    let mut port_map: HashMap<String, Arc<dyn EthDev>> = HashMap::new();
    port_map.insert("sim:0".to_string(), SimDev::new("sim:0"));
    port_map.insert(
        "sim:1".to_string(),
        SimDev::new("sim:1").with_mac([0x02, 0, 0, 0, 0, 0x02]),
    );

    let numa_nodes = find_num_numa_nodes([args.lcore]);
    let net = Net::init(&net_config, &port_map, numa_nodes).context("network stage 1 failed")?;

    let cps_conf = CpsConfig {
        tcp_port_bgp: args.bgp_port,
        scan_interval: Duration::from_secs(args.scan_interval),
        lcore: args.lcore,
        ..CpsConfig::default()
    };
    let mut cps = CpsBlock::stage1(&net, cps_conf).context("cps stage 1 failed")?;

    let mut launch = Launch::new();
    launch.at_stage2("net-start", || net.start());
    launch.at_stage2("cps-filters", || cps.stage2(args.route_events));
    launch.at_stage2("acl-build", || net.finalize());
    launch.run().context("startup failed")?;

    let fib: Arc<dyn FibSink> = Arc::new(LoggingFib);
    let running = cps
        .spawn(&net, Arc::new(NullResolver), Some(fib))
        .context("failed to launch the CPS worker")?;

    info!("gatekeeper-net is running; Ctrl-C to stop");
    install_sigint_handler()?;
    while RUNNING.load(Ordering::Acquire) {
        std::thread::sleep(Duration::from_millis(100));
    }

    info!("shutting down");
    running.stop();
    net.stop();
    Ok(())
}

static RUNNING: AtomicBool = AtomicBool::new(true);

extern "C" fn on_sigint(_sig: i32) {
    RUNNING.store(false, Ordering::Release);
}

fn install_sigint_handler() -> anyhow::Result<()> {
    use nix::sys::signal::{signal, SigHandler, Signal};
    unsafe {
        signal(Signal::SIGINT, SigHandler::Handler(on_sigint))?;
        signal(Signal::SIGTERM, SigHandler::Handler(on_sigint))?;
    }
    Ok(())
}
