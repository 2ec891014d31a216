//! The rendezvous server: a UDP registry answering `register` and
//! `discover`, expiring dead entries once a minute.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::node_core::{ControlHandler, NodeCore};
use crate::wire::{ControlMessage, DiscoveredPeer};

const EXPIRY: Duration = Duration::from_secs(300);
const SWEEP_PERIOD: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
struct Registration {
    external: SocketAddr,
    local_ip: Option<String>,
    local_port: Option<u16>,
    capabilities: HashMap<String, serde_json::Value>,
    last_seen: Instant,
}

pub struct DiscoveryServer {
    core: Arc<NodeCore>,
    nodes: Mutex<HashMap<String, Registration>>,
}

impl DiscoveryServer {
    pub fn new(core: Arc<NodeCore>) -> Arc<Self> {
        Arc::new(Self {
            core,
            nodes: Mutex::new(HashMap::new()),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.core.local_addr()
    }

    /// Evicts records with `now - last_seen > 300s`, once a minute.
    pub fn spawn_sweeper(self: &Arc<Self>, shutdown: CancellationToken) -> tokio::task::JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(SWEEP_PERIOD) => {}
                    _ = shutdown.cancelled() => break,
                }
                let now = Instant::now();
                let mut nodes = this.nodes.lock().unwrap();
                let before = nodes.len();
                nodes.retain(|_, r| now.duration_since(r.last_seen) <= EXPIRY);
                let evicted = before - nodes.len();
                if evicted > 0 {
                    info!(evicted, "swept expired rendezvous registrations");
                }
            }
        })
    }

    fn handle_register(
        &self,
        node_id: String,
        local_ip: Option<String>,
        local_port: Option<u16>,
        capabilities: HashMap<String, serde_json::Value>,
        from: SocketAddr,
    ) -> ControlMessage {
        let now = Instant::now();
        self.nodes.lock().unwrap().insert(
            node_id.clone(),
            Registration {
                external: from,
                local_ip,
                local_port,
                capabilities,
                last_seen: now,
            },
        );
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        ControlMessage::RegisterOk {
            node_id,
            external_ip: from.ip().to_string(),
            external_port: from.port(),
            timestamp,
        }
    }

    fn handle_discover(&self, node_id: &str, exclude_ids: &[String]) -> ControlMessage {
        let now = Instant::now();
        let excluded: std::collections::HashSet<&str> =
            exclude_ids.iter().map(String::as_str).chain(std::iter::once(node_id)).collect();

        let nodes = self.nodes.lock().unwrap();
        let peers = nodes
            .iter()
            .filter(|(id, reg)| {
                !excluded.contains(id.as_str()) && now.duration_since(reg.last_seen) < EXPIRY
            })
            .map(|(id, reg)| DiscoveredPeer {
                node_id: id.clone(),
                external_ip: reg.external.ip().to_string(),
                external_port: reg.external.port(),
                local_ip: reg.local_ip.clone(),
                local_port: reg.local_port,
                capabilities: reg.capabilities.clone(),
            })
            .collect();

        ControlMessage::DiscoverResponse {
            node_id: self.core.self_id.clone(),
            peers,
        }
    }

    fn touch(&self, node_id: &str) {
        if let Some(reg) = self.nodes.lock().unwrap().get_mut(node_id) {
            reg.last_seen = Instant::now();
        }
    }

    pub fn registered_count(&self) -> usize {
        self.nodes.lock().unwrap().len()
    }
}

#[async_trait::async_trait]
impl ControlHandler for DiscoveryServer {
    async fn handle(&self, msg: ControlMessage, from: SocketAddr) {
        let reply = match msg {
            ControlMessage::Register {
                node_id,
                local_ip,
                local_port,
                capabilities,
            } => Some(self.handle_register(node_id, local_ip, local_port, capabilities, from)),
            ControlMessage::Discover { node_id, exclude_ids } => {
                self.touch(&node_id);
                Some(self.handle_discover(&node_id, &exclude_ids))
            }
            ControlMessage::Ping { node_id } => {
                self.touch(&node_id);
                Some(ControlMessage::Pong {
                    node_id: self.core.self_id.clone(),
                })
            }
            _ => {
                warn!(%from, "dropping action not understood by the rendezvous server");
                None
            }
        };

        if let Some(reply) = reply {
            self.core.send_to_addr(from, &reply).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // `NodeCore::bind` is async (it opens a socket); tests that need a real
    // server exercise it through the binaries' integration tests instead.
    // These unit tests cover the pure registration/filtering logic via the
    // `DiscoveryServerTestDouble` below, which mirrors `DiscoveryServer`'s
    // register/discover logic without requiring a bound socket.

    #[test]
    fn discover_excludes_requester_and_exclude_list() {
        // Exercised indirectly: build a server via the test constructor
        // below rather than a bound socket.
        let srv = DiscoveryServerTestDouble::new();
        srv.register("a", "203.0.113.1:4000");
        srv.register("b", "203.0.113.2:4000");
        srv.register("c", "203.0.113.3:4000");

        let resp = srv.discover("a", &["b".to_string()]);
        let ControlMessage::DiscoverResponse { peers, .. } = resp else {
            panic!("expected discover_response");
        };
        let ids: Vec<_> = peers.iter().map(|p| p.node_id.as_str()).collect();
        assert_eq!(ids, vec!["c"]);
    }

    #[test]
    fn discover_with_all_peers_excluded_returns_empty_not_error() {
        let srv = DiscoveryServerTestDouble::new();
        srv.register("a", "203.0.113.1:4000");
        srv.register("b", "203.0.113.2:4000");

        let resp = srv.discover("a", &["b".to_string()]);
        let ControlMessage::DiscoverResponse { peers, .. } = resp else {
            panic!("expected discover_response");
        };
        assert!(peers.is_empty());
    }

    /// A minimal stand-in exposing the same pure logic as
    /// [`DiscoveryServer`] without requiring a bound UDP socket, so the
    /// filtering rules can be unit tested synchronously.
    struct DiscoveryServerTestDouble {
        nodes: Mutex<HashMap<String, Registration>>,
    }

    impl DiscoveryServerTestDouble {
        fn new() -> Self {
            Self {
                nodes: Mutex::new(HashMap::new()),
            }
        }

        fn register(&self, node_id: &str, addr: &str) {
            self.nodes.lock().unwrap().insert(
                node_id.to_string(),
                Registration {
                    external: addr.parse().unwrap(),
                    local_ip: None,
                    local_port: None,
                    capabilities: HashMap::new(),
                    last_seen: Instant::now(),
                },
            );
        }

        fn discover(&self, node_id: &str, exclude_ids: &[String]) -> ControlMessage {
            let now = Instant::now();
            let excluded: std::collections::HashSet<&str> =
                exclude_ids.iter().map(String::as_str).chain(std::iter::once(node_id)).collect();
            let nodes = self.nodes.lock().unwrap();
            let peers = nodes
                .iter()
                .filter(|(id, reg)| {
                    !excluded.contains(id.as_str()) && now.duration_since(reg.last_seen) < EXPIRY
                })
                .map(|(id, reg)| DiscoveredPeer {
                    node_id: id.clone(),
                    external_ip: reg.external.ip().to_string(),
                    external_port: reg.external.port(),
                    local_ip: reg.local_ip.clone(),
                    local_port: reg.local_port,
                    capabilities: reg.capabilities.clone(),
                })
                .collect();
            ControlMessage::DiscoverResponse {
                node_id: "server".into(),
                peers,
            }
        }
    }
}
