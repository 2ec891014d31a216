//! Kademlia DHT discovery node binary.

use std::net::{Ipv4Addr, SocketAddr};

use clap::Parser;
use tracing::{error, info, warn};

use meshnet::config::DhtArgs;
use meshnet::dht::DhtNode;

fn parse_seed(s: &str) -> Option<(Ipv4Addr, u16)> {
    let addr: SocketAddr = s.parse().ok()?;
    match addr {
        SocketAddr::V4(v4) => Some((*v4.ip(), v4.port())),
        SocketAddr::V6(_) => None,
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = DhtArgs::parse();

    let node = match DhtNode::bind(args.id.clone(), args.port).await {
        Ok(node) => node,
        Err(e) => {
            error!(error = %e, "failed to start dht node");
            std::process::exit(1);
        }
    };
    info!(id = %args.id, addr = ?node.local_addr(), "dht node listening");

    let recv_loop = node.spawn_recv_loop();
    let maintenance = node.spawn_maintenance();

    let seeds: Vec<(Ipv4Addr, u16)> = args.bootstrap.iter().filter_map(|s| parse_seed(s)).collect();
    if seeds.len() != args.bootstrap.len() {
        warn!("one or more --bootstrap entries could not be parsed as host:port and were skipped");
    }
    if !seeds.is_empty() {
        node.bootstrap(&seeds).await;
    }

    tokio::signal::ctrl_c().await.expect("failed to listen for ctrl-c");
    info!("shutting down dht node");
    node.stop();
    let _ = tokio::join!(recv_loop, maintenance);
}
