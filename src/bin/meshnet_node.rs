//! Mesh VPN node binary: joins the rendezvous mesh, hole-punches to peers,
//! and runs the encrypted overlay data plane.

use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};

use meshnet::config::{parse_cidr, parse_psk_hex, NodeArgs};
use meshnet::crypto::CryptoBox;
use meshnet::mesh_node::{MeshNode, MeshNodeHandler};
use meshnet::node_core::NodeCore;
use meshnet::vpn::tun::TunDevice;
use meshnet::vpn::VpnNode;

#[cfg(target_os = "linux")]
fn make_tun(name: &str) -> Arc<dyn TunDevice> {
    Arc::new(meshnet::vpn::tun::LinuxTun::new(name.to_string()))
}

#[cfg(not(target_os = "linux"))]
fn make_tun(_name: &str) -> Arc<dyn TunDevice> {
    Arc::new(meshnet::vpn::NullTun::new())
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = NodeArgs::parse();

    let server_addr: SocketAddr = match args.server.parse() {
        Ok(addr) => addr,
        Err(e) => {
            error!(error = %e, "--server is not a valid host:port");
            std::process::exit(1);
        }
    };
    let key = match parse_psk_hex(&args.key) {
        Ok(k) => k,
        Err(e) => {
            error!(error = %e, "--key is invalid");
            std::process::exit(1);
        }
    };
    let (network, prefix_len) = match parse_cidr(&args.network) {
        Ok(pair) => pair,
        Err(e) => {
            error!(error = %e, "--network is invalid");
            std::process::exit(1);
        }
    };
    let crypto = match CryptoBox::new(&key) {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "failed to initialize pre-shared key cipher");
            std::process::exit(1);
        }
    };

    let core = match NodeCore::bind(args.id.clone(), args.port).await {
        Ok(core) => Arc::new(core),
        Err(e) => {
            error!(error = %e, "failed to bind node socket");
            std::process::exit(1);
        }
    };
    info!(id = %args.id, addr = ?core.local_addr(), "mesh node listening");

    let mesh = MeshNode::new(Arc::clone(&core), server_addr);
    let shutdown = mesh.shutdown_token();
    let recv_loop = core.spawn_recv_loop(Arc::new(MeshNodeHandler(Arc::clone(&mesh))), shutdown.clone());
    let maintenance = mesh.spawn_maintenance();

    let tun = make_tun(&args.tun);
    let vpn = VpnNode::new(Arc::clone(&mesh), crypto, tun, network, prefix_len, None);
    if let Err(e) = vpn.start().await {
        error!(error = %e, "failed to start vpn data plane");
        std::process::exit(1);
    }
    info!(overlay_ip = %vpn.self_ip, "overlay data plane started");

    if !args.bootstrap_dht.is_empty() {
        info!("DHT bootstrap peers configured but DHT-based peer discovery for mesh nodes is not wired up; use meshnet-dht directly for DHT-only discovery");
    }

    tokio::signal::ctrl_c().await.expect("failed to listen for ctrl-c");
    info!("shutting down mesh node");
    mesh.stop();
    let _ = tokio::join!(recv_loop, maintenance);
}
