//! Rendezvous client and hole-punch engine: extends [`NodeCore`] with
//! registration, peer-listing pulls, and the three-state hole-punch
//! machine (`discovered -> punching -> active`).

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::node_core::{ControlHandler, NodeCore};
use crate::peer_table::{Endpoint, PeerStatus, PeerTable};
use crate::wire::ControlMessage;

pub const MAX_ATTEMPTS: u32 = 5;
pub const RECONNECT_INTERVAL: Duration = Duration::from_secs(60);
pub const MAINTENANCE_PERIOD: Duration = Duration::from_secs(5);
const PING_IDLE_THRESHOLD: Duration = Duration::from_secs(30);
const PUNCH_IDLE_THRESHOLD: Duration = Duration::from_secs(60);

/// Counts surfaced by [`MeshNode::stats`] for logging and introspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MeshNodeStats {
    pub known_peers: usize,
    pub active_peers: usize,
    pub punching: usize,
    pub registered: bool,
}

#[derive(Debug, Clone)]
pub struct HolePunchAttempt {
    pub peer_id: String,
    pub started_at: Instant,
    pub attempts: u32,
    pub max_attempts: u32,
}

/// Delegate for the VPN-specific actions (`vpn_packet`, `vpn_route_update`).
/// [`crate::vpn::VpnNode`] implements this; a plain mesh node without a TUN
/// device simply never registers one and those actions are logged+dropped.
#[async_trait::async_trait]
pub trait DataPlaneHandler: Send + Sync {
    async fn handle_vpn_packet(&self, node_id: &str, data: &str);
    async fn handle_route_update(&self, node_id: &str, table: &HashMap<String, String>);
}

pub struct MeshNode {
    pub core: Arc<NodeCore>,
    server_addr: SocketAddr,
    registered: Mutex<bool>,
    last_discover: Mutex<Instant>,
    punch_attempts: Mutex<HashMap<String, HolePunchAttempt>>,
    data_plane: Mutex<Option<Arc<dyn DataPlaneHandler>>>,
    shutdown: CancellationToken,
    self_weak: Mutex<Weak<MeshNode>>,
}

impl MeshNode {
    pub fn new(core: Arc<NodeCore>, server_addr: SocketAddr) -> Arc<Self> {
        let arc = Arc::new(Self {
            core,
            server_addr,
            registered: Mutex::new(false),
            // Force an immediate first discover on the first maintenance tick.
            last_discover: Mutex::new(Instant::now() - RECONNECT_INTERVAL),
            punch_attempts: Mutex::new(HashMap::new()),
            data_plane: Mutex::new(None),
            shutdown: CancellationToken::new(),
            self_weak: Mutex::new(Weak::new()),
        });
        *arc.self_weak.lock().unwrap() = Arc::downgrade(&arc);
        arc
    }

    fn arc_self(&self) -> Arc<Self> {
        self.self_weak
            .lock()
            .unwrap()
            .upgrade()
            .expect("MeshNode is always held behind the Arc returned by new()")
    }

    pub fn set_data_plane(&self, handler: Arc<dyn DataPlaneHandler>) {
        *self.data_plane.lock().unwrap() = Some(handler);
    }

    pub fn peer_table(&self) -> &PeerTable {
        &self.core.peer_table
    }

    /// A point-in-time snapshot for logging and tests.
    pub fn stats(&self) -> MeshNodeStats {
        MeshNodeStats {
            known_peers: self.peer_table().len(),
            active_peers: self.peer_table().active_peers().len(),
            punching: self.punch_attempts.lock().unwrap().len(),
            registered: *self.registered.lock().unwrap(),
        }
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    pub async fn register(&self) {
        let local_port = self.core.local_addr().ok().map(|a| a.port());
        let msg = ControlMessage::Register {
            node_id: self.core.self_id.clone(),
            local_ip: Some(NodeCore::local_ip().to_string()),
            local_port,
            capabilities: Default::default(),
        };
        if self.core.send_to_addr(self.server_addr, &msg).await {
            // Registration is confirmed by `register_ok`; we optimistically
            // mark `registered` here too so a slow/lost reply does not
            // cause us to spam `register` every 5s tick before the ack.
        }
    }

    pub async fn discover(&self) {
        let exclude_ids: Vec<String> = self
            .peer_table()
            .all()
            .into_iter()
            .map(|p| p.node_id)
            .collect();
        let msg = ControlMessage::Discover {
            node_id: self.core.self_id.clone(),
            exclude_ids,
        };
        self.core.send_to_addr(self.server_addr, &msg).await;
        *self.last_discover.lock().unwrap() = Instant::now();
    }

    /// Spawns the 5s maintenance loop.
    pub fn spawn_maintenance(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                if this.shutdown.is_cancelled() {
                    break;
                }
                this.maintenance_tick().await;
                tokio::select! {
                    _ = tokio::time::sleep(MAINTENANCE_PERIOD) => {}
                    _ = this.shutdown.cancelled() => break,
                }
            }
        })
    }

    async fn maintenance_tick(&self) {
        if !*self.registered.lock().unwrap() {
            self.register().await;
        }
        if self.last_discover.lock().unwrap().elapsed() > RECONNECT_INTERVAL {
            self.discover().await;
        }

        let now = Instant::now();
        for peer in self.peer_table().all() {
            if peer.status != PeerStatus::Active && now.duration_since(peer.last_seen) > PUNCH_IDLE_THRESHOLD {
                self.initiate_hole_punch(&peer.node_id).await;
            } else if peer.status == PeerStatus::Active && now.duration_since(peer.last_seen) > PING_IDLE_THRESHOLD {
                let msg = ControlMessage::Ping {
                    node_id: self.core.self_id.clone(),
                };
                self.core.send_to_peer(&peer.node_id, &msg).await;
            }
        }

        self.peer_table().cleanup_default();

        let stats = self.stats();
        tracing::debug!(
            known_peers = stats.known_peers,
            active_peers = stats.active_peers,
            punching = stats.punching,
            registered = stats.registered,
            "maintenance tick"
        );
    }

    fn backoff(attempts: u32) -> Duration {
        let secs = 0.5_f64 * 2f64.powi(attempts as i32);
        Duration::from_secs_f64(secs.min(5.0))
    }

    fn endpoint_for_attempt(peer_external: Endpoint, peer_local: Option<Endpoint>, attempt: u32) -> Endpoint {
        if attempt % 2 == 0 {
            peer_external
        } else {
            peer_local.unwrap_or(peer_external)
        }
    }

    async fn send_hole_punch_to(&self, addr: Endpoint) {
        let msg = ControlMessage::HolePunch {
            node_id: self.core.self_id.clone(),
        };
        self.core
            .send_to_addr(SocketAddr::from((addr.ip, addr.port)), &msg)
            .await;
    }

    /// Begins (or no-ops if already in progress) a hole-punch attempt
    /// toward `peer_id`. A peer already `Punching` never starts a second
    /// concurrent attempt.
    pub async fn initiate_hole_punch(&self, peer_id: &str) {
        let Some(peer) = self.peer_table().get(peer_id) else {
            return;
        };
        {
            let mut attempts = self.punch_attempts.lock().unwrap();
            if attempts.contains_key(peer_id) {
                return;
            }
            attempts.insert(
                peer_id.to_string(),
                HolePunchAttempt {
                    peer_id: peer_id.to_string(),
                    started_at: Instant::now(),
                    attempts: 0,
                    max_attempts: MAX_ATTEMPTS,
                },
            );
        }
        self.peer_table().mark_status(peer_id, PeerStatus::Punching);

        self.send_hole_punch_to(peer.external).await;
        if let Some(local) = peer.local {
            if local != peer.external {
                self.send_hole_punch_to(local).await;
            }
        }

        let this = self.arc_self();
        let peer_id = peer_id.to_string();
        tokio::spawn(async move { this.punch_retry_loop(peer_id).await });
    }

    async fn punch_retry_loop(self: Arc<Self>, peer_id: String) {
        loop {
            if self.shutdown.is_cancelled() {
                return;
            }
            let attempts_now = {
                let attempts = self.punch_attempts.lock().unwrap();
                match attempts.get(&peer_id) {
                    Some(a) => a.attempts,
                    None => return, // acked, or removed on shutdown
                }
            };
            let delay = Self::backoff(attempts_now);
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.shutdown.cancelled() => return,
            }

            let (attempt_num, max_attempts, peer) = {
                let mut attempts = self.punch_attempts.lock().unwrap();
                let Some(a) = attempts.get_mut(&peer_id) else {
                    return; // acked while sleeping
                };
                a.attempts += 1;
                let Some(peer) = self.peer_table().get(&peer_id) else {
                    attempts.remove(&peer_id);
                    return;
                };
                (a.attempts, a.max_attempts, peer)
            };

            if attempt_num >= max_attempts {
                self.punch_attempts.lock().unwrap().remove(&peer_id);
                self.peer_table().mark_status(&peer_id, PeerStatus::Discovered);
                info!(peer_id = %peer_id, "hole punch exhausted, reverting to discovered");
                return;
            }

            let addr = Self::endpoint_for_attempt(peer.external, peer.local, attempt_num);
            self.send_hole_punch_to(addr).await;
        }
    }

    async fn handle_discover_response(&self, peers: &[crate::wire::DiscoveredPeer]) {
        for p in peers {
            let Ok(ip) = p.external_ip.parse::<Ipv4Addr>() else {
                continue;
            };
            let external = Endpoint::new(ip, p.external_port);
            let local = match (&p.local_ip, p.local_port) {
                (Some(ip), Some(port)) => ip.parse::<Ipv4Addr>().ok().map(|ip| Endpoint::new(ip, port)),
                _ => None,
            };
            let is_new = !self.peer_table().contains(&p.node_id);
            self.peer_table().upsert(&p.node_id, external, local);
            if is_new {
                self.initiate_hole_punch(&p.node_id).await;
            }
        }
    }

    async fn handle_inbound_hole_punch(&self, node_id: &str, from: SocketAddr) {
        let ip = match from.ip() {
            std::net::IpAddr::V4(ip) => ip,
            std::net::IpAddr::V6(_) => {
                warn!(node_id, "ignoring hole_punch from an IPv6 source");
                return;
            }
        };
        let external = Endpoint::new(ip, from.port());
        self.peer_table().upsert(node_id, external, None);
        self.peer_table().mark_status(node_id, PeerStatus::Active);
        let ack = ControlMessage::HolePunchAck {
            node_id: self.core.self_id.clone(),
        };
        self.core.send_to_addr(from, &ack).await;
    }

    async fn handle_inbound_hole_punch_ack(&self, node_id: &str) {
        // hole_punch_ack for an unknown peer: the peer is added in `active`
        // state, not dropped.
        if !self.peer_table().contains(node_id) {
            warn!(node_id, "hole_punch_ack from unknown peer; admitting as active");
        }
        self.punch_attempts.lock().unwrap().remove(node_id);
        self.peer_table().mark_status(node_id, PeerStatus::Active);
        self.peer_table().touch(node_id);
    }

    /// Entry point used by [`crate::node_core::ControlHandler`] impls
    /// composed on top of a mesh node (see [`crate::vpn::VpnNode`]).
    pub async fn dispatch(&self, msg: ControlMessage, from: SocketAddr) {
        // Any inbound message from a not-yet-known sender triggers a
        // hole-punch attempt toward the address it was seen from, even if
        // its own payload carries richer endpoint info (e.g. a later
        // `discover_response`).
        let sender = msg.node_id().to_string();
        let first_seen = !self.peer_table().contains(&sender) && !matches!(msg, ControlMessage::HolePunch { .. } | ControlMessage::HolePunchAck { .. });
        if first_seen {
            if let std::net::IpAddr::V4(ip) = from.ip() {
                self.peer_table().upsert(&sender, Endpoint::new(ip, from.port()), None);
                self.initiate_hole_punch(&sender).await;
            }
        } else {
            self.peer_table().touch(&sender);
        }

        match msg {
            ControlMessage::Ping { node_id } => {
                let pong = ControlMessage::Pong {
                    node_id: self.core.self_id.clone(),
                };
                self.core.send_to_addr(from, &pong).await;
                let _ = node_id;
            }
            ControlMessage::Pong { .. } => {}
            ControlMessage::RegisterOk { .. } => {
                *self.registered.lock().unwrap() = true;
                info!("registered with rendezvous server");
            }
            ControlMessage::DiscoverResponse { peers, .. } => {
                self.handle_discover_response(&peers).await;
            }
            ControlMessage::HolePunch { node_id } => {
                self.handle_inbound_hole_punch(&node_id, from).await;
            }
            ControlMessage::HolePunchAck { node_id } => {
                self.handle_inbound_hole_punch_ack(&node_id).await;
            }
            ControlMessage::VpnPacket { node_id, data } => {
                if let Some(dp) = self.data_plane.lock().unwrap().clone() {
                    dp.handle_vpn_packet(&node_id, &data).await;
                }
            }
            ControlMessage::VpnRouteUpdate { node_id, routing_table } => {
                if let Some(dp) = self.data_plane.lock().unwrap().clone() {
                    dp.handle_route_update(&node_id, &routing_table).await;
                }
            }
            // Server-only actions received by a client are logged and dropped.
            ControlMessage::Register { .. } | ControlMessage::Discover { .. } => {
                warn!("ignoring server-only action received by mesh node");
            }
        }
    }
}

/// Thin adapter so [`MeshNode`] can be registered directly with
/// [`NodeCore::spawn_recv_loop`].
pub struct MeshNodeHandler(pub Arc<MeshNode>);

#[async_trait::async_trait]
impl ControlHandler for MeshNodeHandler {
    async fn handle(&self, msg: ControlMessage, from: SocketAddr) {
        self.0.dispatch(msg, from).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_follows_capped_exponential_schedule() {
        let schedule = [0.5, 1.0, 2.0, 4.0, 5.0];
        for (attempts, expected) in schedule.iter().enumerate() {
            let got = MeshNode::backoff(attempts as u32).as_secs_f64();
            assert!((got - expected).abs() < 1e-9, "attempts={attempts}");
        }
    }

    #[test]
    fn endpoint_alternates_by_parity() {
        let ext = Endpoint::new(Ipv4Addr::new(1, 1, 1, 1), 1);
        let local = Endpoint::new(Ipv4Addr::new(2, 2, 2, 2), 2);
        assert_eq!(MeshNode::endpoint_for_attempt(ext, Some(local), 0), ext);
        assert_eq!(MeshNode::endpoint_for_attempt(ext, Some(local), 1), local);
        assert_eq!(MeshNode::endpoint_for_attempt(ext, Some(local), 2), ext);
    }

    #[test]
    fn endpoint_falls_through_to_external_without_local() {
        let ext = Endpoint::new(Ipv4Addr::new(1, 1, 1, 1), 1);
        assert_eq!(MeshNode::endpoint_for_attempt(ext, None, 1), ext);
    }

    #[tokio::test]
    async fn register_sends_real_local_endpoint() {
        let fake_server = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_addr = fake_server.local_addr().unwrap();

        let core = Arc::new(NodeCore::bind("self", 0).await.unwrap());
        let local_port = core.local_addr().unwrap().port();
        let mesh = MeshNode::new(core, server_addr);
        mesh.register().await;

        let mut buf = [0u8; 4096];
        let (len, _) = tokio::time::timeout(Duration::from_secs(2), fake_server.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        let msg = crate::wire::ControlMessage::decode(&buf[..len]).unwrap();
        match msg {
            ControlMessage::Register { local_ip, local_port: sent_port, .. } => {
                assert!(local_ip.is_some(), "register() must advertise a local IP");
                assert_eq!(sent_port, Some(local_port));
            }
            other => panic!("expected Register, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn stats_reflects_punching_and_active_counts() {
        let core = Arc::new(NodeCore::bind("self", 0).await.unwrap());
        let mesh = MeshNode::new(core, "127.0.0.1:9".parse().unwrap());

        mesh.peer_table().upsert("p1", Endpoint::new(Ipv4Addr::new(1, 1, 1, 1), 1), None);
        mesh.initiate_hole_punch("p1").await;
        assert_eq!(mesh.stats().punching, 1);

        mesh.handle_inbound_hole_punch_ack("p1").await;
        let stats = mesh.stats();
        assert_eq!(stats.punching, 0);
        assert_eq!(stats.active_peers, 1);
        assert_eq!(stats.known_peers, 1);
    }
}
