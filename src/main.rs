// File: main.rs
//
// The purpose of this file is to parse node configuration from the command
// line, wire up the ZeroMQ channel and node facade, and run the node until
// it is asked to leave.

use chord_kv::channel::ZmqChannel;
use chord_kv::hash;
use chord_kv::msg::{NodeInfo, PeerAddr};
use chord_kv::node::NodeFacade;
use chord_kv::ring::RingConfig;
use log::info;
use std::sync::Arc;
use std::time::Duration;
use structopt::StructOpt;

/// Holds data parsed from the command line to initialize the node.
#[derive(StructOpt, Debug)]
#[structopt(name = "chord-kv")]
pub struct CLI {
    #[structopt(short, long)]
    debug: bool,

    #[structopt(long)]
    node_name: String,

    #[structopt(long)]
    pub_endpoint: String,

    #[structopt(long)]
    router_endpoint: String,

    /// Address of an existing node to join through. Omit to bootstrap a
    /// brand new ring.
    #[structopt(long)]
    bootstrap: Option<String>,

    /// Number of successors a key is replicated to, including the owner.
    #[structopt(long, default_value = "3")]
    replication_factor: usize,

    /// Finger table width in bits. Defaults to the full 160-bit ring.
    #[structopt(long, default_value = "160")]
    finger_width: u32,

    #[structopt(long, default_value = "1000")]
    stabilize_interval_ms: u64,

    #[structopt(long, default_value = "30000")]
    fix_fingers_interval_ms: u64,

    #[structopt(long, default_value = "2000")]
    check_predecessor_interval_ms: u64,

    #[structopt(long, default_value = "5000")]
    heartbeat_timeout_ms: u64,

    #[structopt(long, default_value = "2")]
    max_heartbeat_failures: u32,

    #[structopt(long, default_value = "5000")]
    request_timeout_ms: u64,
}

fn parse_peer_addr(s: &str) -> PeerAddr {
    let mut parts = s.rsplitn(2, ':');
    let port: u16 = parts
        .next()
        .and_then(|p| p.parse().ok())
        .unwrap_or_else(|| panic!("invalid peer address {:?}, expected host:port", s));
    let ip = parts.next().unwrap_or("127.0.0.1").to_string();
    PeerAddr::new(ip, port)
}

fn main() {
    let cli_options = CLI::from_args();

    let level = if cli_options.debug {
        log::Level::Debug
    } else {
        log::Level::Info
    };
    simple_logger::init_with_level(level).expect("failed to initialize logger");

    let ctx = zmq::Context::new();
    let channel = Arc::new(
        ZmqChannel::new(&ctx, &cli_options.node_name, &cli_options.router_endpoint)
            .expect("failed to construct zmq channel"),
    );

    let self_addr = parse_peer_addr(&cli_options.node_name);
    let self_info = NodeInfo::new(self_addr, hash::hash(&cli_options.node_name));

    let ring_config = RingConfig {
        finger_width: cli_options.finger_width,
        stabilize_interval: Duration::from_millis(cli_options.stabilize_interval_ms),
        fix_fingers_interval: Duration::from_millis(cli_options.fix_fingers_interval_ms),
        check_predecessor_interval: Duration::from_millis(cli_options.check_predecessor_interval_ms),
        heartbeat_timeout: Duration::from_millis(cli_options.heartbeat_timeout_ms),
        max_heartbeat_failures: cli_options.max_heartbeat_failures,
        request_timeout: Duration::from_millis(cli_options.request_timeout_ms),
    };
    let request_timeout = ring_config.request_timeout;

    let facade = NodeFacade::new(
        self_info,
        ring_config.clone(),
        cli_options.replication_factor,
        request_timeout,
        cli_options.bootstrap.is_none(),
        channel.clone(),
    );

    if let Some(bootstrap) = &cli_options.bootstrap {
        let bootstrap_addr = parse_peer_addr(bootstrap);
        facade
            .join(&bootstrap_addr)
            .expect("failed to join ring through bootstrap node");
    }

    info!("{} listening, self id {}", cli_options.node_name, facade.self_info().id);
    let _maintenance = facade.spawn_maintenance(&ring_config);

    let sub_socket = ctx.socket(zmq::SUB).expect("failed to create sub socket");
    sub_socket
        .connect(&cli_options.pub_endpoint)
        .expect("failed connecting subscriber");
    sub_socket
        .set_subscribe(cli_options.node_name.as_bytes())
        .expect("failed subscribing");

    let dispatch_facade = facade.clone();
    channel.run_receive_loop(sub_socket, move |msg| dispatch_facade.dispatch(msg));
}
