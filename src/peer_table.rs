//! The peer table: `node_id -> {external endpoint, last-seen, status,
//! local endpoint?}`. One instance per node, owned exclusively by that
//! node and accessed only through this API.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde_json::{Map, Value};

pub const ACTIVE_WINDOW: Duration = Duration::from_secs(60);
pub const DEFAULT_MAX_AGE: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerStatus {
    Discovered,
    Active,
    Punching,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Endpoint {
    pub ip: Ipv4Addr,
    pub port: u16,
}

impl Endpoint {
    pub fn new(ip: Ipv4Addr, port: u16) -> Self {
        Self { ip, port }
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

#[derive(Debug, Clone)]
pub struct Peer {
    pub node_id: String,
    pub external: Endpoint,
    pub local: Option<Endpoint>,
    pub status: PeerStatus,
    pub last_seen: Instant,
    pub capabilities: Map<String, Value>,
}

/// A mapping from `node_id` to peer state, guarded by a single mutex whose
/// critical sections never perform network I/O.
pub struct PeerTable {
    self_id: String,
    peers: Mutex<HashMap<String, Peer>>,
}

impl PeerTable {
    pub fn new(self_id: impl Into<String>) -> Self {
        Self {
            self_id: self_id.into(),
            peers: Mutex::new(HashMap::new()),
        }
    }

    /// Inserts or updates a peer's endpoint information. Returns `false`
    /// (and does nothing) for `node_id == self`, per the invariant that a
    /// peer table never contains a self-entry.
    pub fn upsert(&self, node_id: &str, external: Endpoint, local: Option<Endpoint>) -> bool {
        if node_id == self.self_id {
            return false;
        }
        let mut peers = self.peers.lock().unwrap();
        let entry = peers.entry(node_id.to_string()).or_insert_with(|| Peer {
            node_id: node_id.to_string(),
            external,
            local,
            status: PeerStatus::Discovered,
            last_seen: Instant::now(),
            capabilities: Map::new(),
        });
        entry.external = external;
        if local.is_some() {
            entry.local = local;
        }
        entry.last_seen = Instant::now();
        true
    }

    /// Refreshes `last_seen` for a peer, if present.
    pub fn touch(&self, node_id: &str) {
        if let Some(p) = self.peers.lock().unwrap().get_mut(node_id) {
            p.last_seen = Instant::now();
        }
    }

    pub fn mark_status(&self, node_id: &str, status: PeerStatus) {
        if let Some(p) = self.peers.lock().unwrap().get_mut(node_id) {
            p.status = status;
        }
    }

    pub fn get(&self, node_id: &str) -> Option<Peer> {
        self.peers.lock().unwrap().get(node_id).cloned()
    }

    pub fn contains(&self, node_id: &str) -> bool {
        self.peers.lock().unwrap().contains_key(node_id)
    }

    /// Peers with `status = Active` and `now - last_seen < 60s`.
    pub fn active_peers(&self) -> Vec<Peer> {
        let now = Instant::now();
        self.peers
            .lock()
            .unwrap()
            .values()
            .filter(|p| p.status == PeerStatus::Active && now.duration_since(p.last_seen) < ACTIVE_WINDOW)
            .cloned()
            .collect()
    }

    pub fn all(&self) -> Vec<Peer> {
        self.peers.lock().unwrap().values().cloned().collect()
    }

    /// Removes peers with `now - last_seen > max_age`.
    pub fn cleanup(&self, max_age: Duration) {
        let now = Instant::now();
        self.peers
            .lock()
            .unwrap()
            .retain(|_, p| now.duration_since(p.last_seen) <= max_age);
    }

    pub fn cleanup_default(&self) {
        self.cleanup(DEFAULT_MAX_AGE);
    }

    pub fn len(&self) -> usize {
        self.peers.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ep(port: u16) -> Endpoint {
        Endpoint::new(Ipv4Addr::new(127, 0, 0, 1), port)
    }

    #[test]
    fn self_entry_never_added() {
        let t = PeerTable::new("self");
        assert!(!t.upsert("self", ep(1), None));
        assert!(t.is_empty());
    }

    #[test]
    fn cleanup_removes_stale_entries() {
        let t = PeerTable::new("self");
        t.upsert("p1", ep(1), None);
        // Can't fast-forward Instant without tokio::time::pause (which only
        // affects tokio's clock, not std::time::Instant), so we exercise
        // the zero-age boundary instead: nothing older than "now" is removed.
        t.cleanup(Duration::from_secs(0));
        assert!(t.contains("p1"));
    }

    #[test]
    fn active_peers_filters_by_status_and_recency() {
        let t = PeerTable::new("self");
        t.upsert("p1", ep(1), None);
        assert!(t.active_peers().is_empty());
        t.mark_status("p1", PeerStatus::Active);
        t.touch("p1");
        assert_eq!(t.active_peers().len(), 1);
    }

    #[test]
    fn upsert_preserves_local_when_not_resupplied() {
        let t = PeerTable::new("self");
        t.upsert("p1", ep(1), Some(ep(2)));
        t.upsert("p1", ep(3), None);
        let p = t.get("p1").unwrap();
        assert_eq!(p.external, ep(3));
        assert_eq!(p.local, Some(ep(2)));
    }
}
