//! Rendezvous server binary.

use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::info;

use meshnet::config::ServerArgs;
use meshnet::discovery_server::DiscoveryServer;
use meshnet::node_core::NodeCore;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = ServerArgs::parse();

    let core = match NodeCore::bind_addr("server", &args.bind, args.port).await {
        Ok(core) => Arc::new(core),
        Err(e) => {
            tracing::error!(error = %e, "failed to bind rendezvous server socket");
            std::process::exit(1);
        }
    };
    info!(bind = %args.bind, addr = ?core.local_addr(), "rendezvous server listening");

    let shutdown = CancellationToken::new();
    let server = DiscoveryServer::new(Arc::clone(&core));
    let sweeper = server.spawn_sweeper(shutdown.clone());
    let recv_loop = core.spawn_recv_loop(server, shutdown.clone());

    tokio::signal::ctrl_c().await.expect("failed to listen for ctrl-c");
    info!("shutting down rendezvous server");
    shutdown.cancel();
    let _ = tokio::join!(sweeper, recv_loop);
}
