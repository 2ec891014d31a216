//! Shared UDP plumbing: one receive task per socket, dispatch by tagged
//! control-message variant, and `send_to_peer` / `send_to_addr` helpers.
//!
//! A struct holding an `Arc<UdpSocket>` plus whatever shared state it needs,
//! a `recv_from` loop bounded by a buffer size, and small async helper
//! methods that build one datagram and `send_to` it.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::peer_table::PeerTable;
use crate::wire::ControlMessage;

/// Anything that wants to react to inbound control messages implements
/// this. `touch`-ing the sender in the peer table happens once, centrally,
/// before dispatch -- implementors do not need to do it themselves.
#[async_trait::async_trait]
pub trait ControlHandler: Send + Sync {
    async fn handle(&self, msg: ControlMessage, from: SocketAddr);
}

pub struct NodeCore {
    pub self_id: String,
    pub socket: Arc<UdpSocket>,
    pub peer_table: Arc<PeerTable>,
}

impl NodeCore {
    pub async fn bind(self_id: impl Into<String>, port: u16) -> std::io::Result<Self> {
        Self::bind_addr(self_id, "0.0.0.0", port).await
    }

    pub async fn bind_addr(self_id: impl Into<String>, host: &str, port: u16) -> std::io::Result<Self> {
        let socket = UdpSocket::bind((host, port)).await?;
        let self_id = self_id.into();
        Ok(Self {
            peer_table: Arc::new(PeerTable::new(self_id.clone())),
            self_id,
            socket: Arc::new(socket),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Best-effort LAN-facing IPv4 address of this host, for advertising a
    /// local-endpoint hole-punch fallback alongside the STUN-discovered
    /// external one. Opens a UDP socket and "connects" it to a public
    /// address without sending any traffic, purely so the OS routing table
    /// picks an outbound interface, then reads that socket's own address.
    /// Falls back to loopback if no route is available.
    pub fn local_ip() -> std::net::Ipv4Addr {
        std::net::UdpSocket::bind("0.0.0.0:0")
            .and_then(|s| {
                s.connect(("8.8.8.8", 1))?;
                s.local_addr()
            })
            .ok()
            .and_then(|addr| match addr.ip() {
                std::net::IpAddr::V4(ip) => Some(ip),
                std::net::IpAddr::V6(_) => None,
            })
            .unwrap_or(std::net::Ipv4Addr::LOCALHOST)
    }

    /// Spawns the receive loop. `recv_from` is bounded by a 1s timeout so
    /// the loop can observe `shutdown` without blocking forever.
    pub fn spawn_recv_loop(
        self: &Arc<Self>,
        handler: Arc<dyn ControlHandler>,
        shutdown: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut buf = vec![0u8; crate::wire::MAX_MESSAGE_SIZE];
            loop {
                if shutdown.is_cancelled() {
                    break;
                }
                let recv = tokio::time::timeout(
                    std::time::Duration::from_secs(1),
                    this.socket.recv_from(&mut buf),
                )
                .await;
                let (len, from) = match recv {
                    Ok(Ok(pair)) => pair,
                    Ok(Err(e)) => {
                        warn!(error = %e, "udp recv error");
                        continue;
                    }
                    Err(_) => continue, // timeout: loop back to check shutdown
                };

                let msg = match ControlMessage::decode(&buf[..len]) {
                    Ok(msg) => msg,
                    Err(e) => {
                        warn!(error = %e, %from, "dropping malformed datagram");
                        continue;
                    }
                };

                if msg.node_id() == this.self_id {
                    continue;
                }

                trace!(node_id = msg.node_id(), %from, "control message received");
                handler.handle(msg, from).await;
            }
        })
    }

    /// Sends a message to a peer's known external endpoint. Returns `false`
    /// if the peer is unknown or the send fails; never panics on a bad
    /// address (`PeerUnknown` / `TransportError`).
    pub async fn send_to_peer(&self, node_id: &str, msg: &ControlMessage) -> bool {
        let Some(peer) = self.peer_table.get(node_id) else {
            warn!(node_id, "send_to_peer: unknown peer");
            return false;
        };
        let addr: SocketAddr = (peer.external.ip, peer.external.port).into();
        self.send_to_addr(addr, msg).await
    }

    pub async fn send_to_addr(&self, addr: SocketAddr, msg: &ControlMessage) -> bool {
        let bytes = msg.encode();
        match self.socket.send_to(&bytes, addr).await {
            Ok(_) => {
                debug!(%addr, action = variant_name(msg), "sent control message");
                true
            }
            Err(e) => {
                warn!(%addr, error = %e, "send_to_addr failed");
                false
            }
        }
    }
}

fn variant_name(msg: &ControlMessage) -> &'static str {
    match msg {
        ControlMessage::Ping { .. } => "ping",
        ControlMessage::Pong { .. } => "pong",
        ControlMessage::Register { .. } => "register",
        ControlMessage::RegisterOk { .. } => "register_ok",
        ControlMessage::Discover { .. } => "discover",
        ControlMessage::DiscoverResponse { .. } => "discover_response",
        ControlMessage::HolePunch { .. } => "hole_punch",
        ControlMessage::HolePunchAck { .. } => "hole_punch_ack",
        ControlMessage::VpnPacket { .. } => "vpn_packet",
        ControlMessage::VpnRouteUpdate { .. } => "vpn_route_update",
    }
}
