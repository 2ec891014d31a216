//! DHT node: owns the UDP socket, the k-bucket routing table and local
//! key/value storage, and drives PING/FIND_NODE/FIND_VALUE/STORE RPCs.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::Rng;
use serde_json::Value;
use tokio::net::UdpSocket;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::messages::{DhtMessage, NodeInfo};
use super::routing_table::{Contact, InsertOutcome, RoutingTable};
use super::{hash_key, parse_id, to_hex, ID_BYTES, K};

const RPC_TIMEOUT: Duration = Duration::from_secs(2);
const MAINTENANCE_PERIOD: Duration = Duration::from_secs(10);
const BUCKET_STALE_AFTER: Duration = Duration::from_secs(3600);

#[derive(Debug, thiserror::Error)]
pub enum DhtError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("no response from {0}")]
    Timeout(SocketAddr),
    #[error("malformed response")]
    Malformed,
    #[error("invalid id: {0}")]
    InvalidId(#[from] super::DhtIdError),
}

pub struct DhtNode {
    pub self_id: String,
    self_id_bytes: [u8; ID_BYTES],
    socket: Arc<UdpSocket>,
    routing: Arc<RoutingTable>,
    storage: Mutex<HashMap<String, Value>>,
    pending: Mutex<HashMap<u64, oneshot::Sender<DhtMessage>>>,
    shutdown: CancellationToken,
}

impl DhtNode {
    pub async fn bind(node_id: impl Into<String>, port: u16) -> Result<Arc<Self>, DhtError> {
        let node_id = node_id.into();
        let self_id_bytes = parse_id(&node_id)?;
        let socket = UdpSocket::bind(("0.0.0.0", port)).await?;
        Ok(Arc::new(Self {
            self_id: node_id,
            self_id_bytes,
            socket: Arc::new(socket),
            routing: Arc::new(RoutingTable::new(self_id_bytes)),
            storage: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        }))
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn routing_table(&self) -> &RoutingTable {
        &self.routing
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    fn new_msgid() -> u64 {
        rand::thread_rng().gen()
    }

    /// Records activity from any sender, applying the ping-the-head
    /// eviction rule when its bucket is full. The ping is sent outside
    /// the routing table's mutex, matching the decouple in
    /// `routing_table::RoutingTable`.
    async fn observe(self: &Arc<Self>, node_id: &str, from: SocketAddr) {
        if node_id == self.self_id {
            return;
        }
        let Ok(peer_bytes) = parse_id(node_id) else {
            return;
        };
        let ip = match from.ip() {
            std::net::IpAddr::V4(ip) => ip,
            std::net::IpAddr::V6(_) => return,
        };
        let contact = Contact {
            node_id: node_id.to_string(),
            ip,
            port: from.port(),
            last_seen: std::time::Instant::now(),
        };
        match self.routing.try_insert(peer_bytes, contact.clone()) {
            InsertOutcome::Inserted => {}
            InsertOutcome::BucketFull { bucket, head, candidate } => {
                let this = Arc::clone(self);
                tokio::spawn(async move {
                    let head_addr = SocketAddr::from((head.ip, head.port));
                    let replied = this.ping(head_addr).await.unwrap_or(false);
                    this.routing.resolve_full_bucket(bucket, replied, head, candidate);
                });
            }
        }
    }

    pub fn spawn_recv_loop(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut buf = vec![0u8; super::messages::MAX_DHT_MESSAGE_SIZE];
            loop {
                if this.shutdown.is_cancelled() {
                    break;
                }
                let recv = tokio::time::timeout(
                    Duration::from_secs(1),
                    this.socket.recv_from(&mut buf),
                )
                .await;
                let (len, from) = match recv {
                    Ok(Ok(pair)) => pair,
                    Ok(Err(e)) => {
                        warn!(error = %e, "dht udp recv error");
                        continue;
                    }
                    Err(_) => continue,
                };
                let msg = match DhtMessage::decode(&buf[..len]) {
                    Ok(m) => m,
                    Err(e) => {
                        warn!(error = %e, %from, "dropping malformed dht datagram");
                        continue;
                    }
                };
                this.observe(msg.node_id(), from).await;

                let msgid = msg.msgid();
                let is_response = matches!(
                    msg,
                    DhtMessage::Pong { .. }
                        | DhtMessage::Nodes { .. }
                        | DhtMessage::Value { .. }
                        | DhtMessage::StoreOk { .. }
                );
                if is_response {
                    if let Some(tx) = this.pending.lock().unwrap().remove(&msgid) {
                        let _ = tx.send(msg);
                    }
                    continue;
                }
                this.handle_request(msg, from).await;
            }
        })
    }

    async fn handle_request(&self, msg: DhtMessage, from: SocketAddr) {
        match msg {
            DhtMessage::Ping { msgid, .. } => {
                self.send(
                    from,
                    DhtMessage::Pong {
                        node_id: self.self_id.clone(),
                        msgid,
                    },
                )
                .await;
            }
            DhtMessage::FindNode { msgid, target, .. } => {
                let Ok(target_bytes) = parse_id(&target) else {
                    return;
                };
                let nodes = self.local_nodes_near(&target_bytes);
                self.send(
                    from,
                    DhtMessage::Nodes {
                        node_id: self.self_id.clone(),
                        msgid,
                        nodes,
                    },
                )
                .await;
            }
            DhtMessage::FindValue { msgid, key, .. } => {
                let found = self.storage.lock().unwrap().get(&key).cloned();
                let reply = match found {
                    Some(value) => DhtMessage::Value {
                        node_id: self.self_id.clone(),
                        msgid,
                        key,
                        value,
                    },
                    None => {
                        let Ok(target_bytes) = parse_id(&key) else {
                            return;
                        };
                        DhtMessage::Nodes {
                            node_id: self.self_id.clone(),
                            msgid,
                            nodes: self.local_nodes_near(&target_bytes),
                        }
                    }
                };
                self.send(from, reply).await;
            }
            DhtMessage::Store { msgid, key, value, .. } => {
                self.storage.lock().unwrap().insert(key.clone(), value);
                self.send(
                    from,
                    DhtMessage::StoreOk {
                        node_id: self.self_id.clone(),
                        msgid,
                        key,
                    },
                )
                .await;
            }
            _ => {}
        }
    }

    fn local_nodes_near(&self, target: &[u8; ID_BYTES]) -> Vec<NodeInfo> {
        self.routing
            .closest_to(target, K)
            .into_iter()
            .map(|c| NodeInfo {
                node_id: c.node_id,
                host: c.ip.to_string(),
                port: c.port,
            })
            .collect()
    }

    async fn send(&self, addr: SocketAddr, msg: DhtMessage) {
        let bytes = msg.encode();
        if let Err(e) = self.socket.send_to(&bytes, addr).await {
            warn!(%addr, error = %e, "dht send failed");
        }
    }

    async fn request(self: &Arc<Self>, addr: SocketAddr, msg: DhtMessage) -> Result<DhtMessage, DhtError> {
        let msgid = msg.msgid();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(msgid, tx);
        self.send(addr, msg).await;
        match tokio::time::timeout(RPC_TIMEOUT, rx).await {
            Ok(Ok(resp)) => Ok(resp),
            _ => {
                self.pending.lock().unwrap().remove(&msgid);
                Err(DhtError::Timeout(addr))
            }
        }
    }

    pub async fn ping(self: &Arc<Self>, addr: SocketAddr) -> Result<bool, DhtError> {
        let msg = DhtMessage::Ping {
            node_id: self.self_id.clone(),
            msgid: Self::new_msgid(),
        };
        match self.request(addr, msg).await {
            Ok(DhtMessage::Pong { .. }) => Ok(true),
            Ok(_) => Err(DhtError::Malformed),
            Err(DhtError::Timeout(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub async fn find_node(self: &Arc<Self>, addr: SocketAddr, target: &str) -> Result<Vec<NodeInfo>, DhtError> {
        let msg = DhtMessage::FindNode {
            node_id: self.self_id.clone(),
            msgid: Self::new_msgid(),
            target: target.to_string(),
        };
        match self.request(addr, msg).await? {
            DhtMessage::Nodes { nodes, .. } => Ok(nodes),
            _ => Err(DhtError::Malformed),
        }
    }

    async fn find_value_rpc(self: &Arc<Self>, addr: SocketAddr, key: &str) -> Result<Option<Value>, DhtError> {
        let msg = DhtMessage::FindValue {
            node_id: self.self_id.clone(),
            msgid: Self::new_msgid(),
            key: key.to_string(),
        };
        match self.request(addr, msg).await? {
            DhtMessage::Value { value, .. } => Ok(Some(value)),
            DhtMessage::Nodes { .. } => Ok(None),
            _ => Err(DhtError::Malformed),
        }
    }

    async fn store_rpc(self: &Arc<Self>, addr: SocketAddr, key: &str, value: Value) -> Result<(), DhtError> {
        let msg = DhtMessage::Store {
            node_id: self.self_id.clone(),
            msgid: Self::new_msgid(),
            key: key.to_string(),
            value,
        };
        match self.request(addr, msg).await? {
            DhtMessage::StoreOk { .. } => Ok(()),
            _ => Err(DhtError::Malformed),
        }
    }

    /// Single-hop local lookup: the K closest contacts to `target` known
    /// to this node (single-hop lookup, not the full iterative α-parallel
    /// lookup; see DESIGN.md).
    pub fn find_nodes_local(&self, target: &str) -> Vec<NodeInfo> {
        let Ok(target_bytes) = parse_id(target) else {
            return Vec::new();
        };
        self.local_nodes_near(&target_bytes)
    }

    /// Stores `key -> value` locally under its `sha1_key` address, and
    /// best-effort forwards a STORE to the locally-known contacts closest
    /// to that address. `key` itself need not be hex; it is hashed into the
    /// 40-hex storage/routing namespace first, so `store("hello", ...)`
    /// and `get("hello")` from any node agree on where the value lives.
    pub async fn store(self: &Arc<Self>, key: &str, value: Value) {
        let target = hash_key(key);
        let sha1_key = to_hex(&target);
        self.storage.lock().unwrap().insert(sha1_key.clone(), value.clone());
        for c in self.routing.closest_to(&target, K) {
            let addr = SocketAddr::from((c.ip, c.port));
            let _ = self.store_rpc(addr, &sha1_key, value.clone()).await;
        }
    }

    /// Checks local storage first, then queries known contacts closest to
    /// `key`'s `sha1_key` address via FIND_VALUE until one returns a value.
    pub async fn get(self: &Arc<Self>, key: &str) -> Option<Value> {
        let target = hash_key(key);
        let sha1_key = to_hex(&target);
        if let Some(v) = self.storage.lock().unwrap().get(&sha1_key).cloned() {
            return Some(v);
        }
        for c in self.routing.closest_to(&target, K) {
            let addr = SocketAddr::from((c.ip, c.port));
            if let Ok(Some(v)) = self.find_value_rpc(addr, &sha1_key).await {
                return Some(v);
            }
        }
        None
    }

    /// Pings each seed, then issues `FIND_NODE(self_id)` against every
    /// seed that replied. Success means at least one seed replied.
    pub async fn bootstrap(self: &Arc<Self>, seeds: &[(Ipv4Addr, u16)]) -> bool {
        let mut any_replied = false;
        for (ip, port) in seeds {
            let addr = SocketAddr::from((*ip, *port));
            match self.ping(addr).await {
                Ok(true) => any_replied = true,
                _ => continue,
            }
            if let Ok(nodes) = self.find_node(addr, &self.self_id).await {
                self.merge_nodes(nodes).await;
            }
        }
        if any_replied {
            info!(peers = self.routing.len(), "dht bootstrap complete");
        } else {
            warn!("dht bootstrap: no seed responded");
        }
        any_replied
    }

    async fn merge_nodes(self: &Arc<Self>, nodes: Vec<NodeInfo>) {
        for n in nodes {
            if n.node_id == self.self_id {
                continue;
            }
            let Ok(ip) = n.host.parse::<Ipv4Addr>() else {
                continue;
            };
            self.observe(&n.node_id, SocketAddr::from((ip, n.port))).await;
        }
    }

    /// Spawns the 10s maintenance loop: refreshes the stalest bucket not
    /// touched in the last hour by issuing `FIND_NODE` for a synthetic id
    /// inside its range.
    pub fn spawn_maintenance(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(MAINTENANCE_PERIOD) => {}
                    _ = this.shutdown.cancelled() => break,
                }
                this.refresh_stale_bucket().await;
            }
        })
    }

    async fn refresh_stale_bucket(self: &Arc<Self>) {
        let Some(bucket) = self.routing.stalest_bucket_over(BUCKET_STALE_AFTER) else {
            return;
        };
        let synthetic = super::flip_bit(&self.self_id_bytes, NUM_BUCKETS - 1 - bucket);
        let target = to_hex(&synthetic);

        // Query a known contact, any bucket, to drive the refresh.
        let contact = self.routing.closest_to(&self.self_id_bytes, 1);
        if let Some(c) = contact.into_iter().next() {
            let addr = SocketAddr::from((c.ip, c.port));
            if let Ok(nodes) = self.find_node(addr, &target).await {
                self.merge_nodes(nodes).await;
            }
        }
        self.routing.mark_bucket_refreshed(bucket);
        debug!(bucket, "refreshed stale dht bucket");
    }
}

const NUM_BUCKETS: usize = super::NUM_BUCKETS;
