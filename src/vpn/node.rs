//! The VPN data plane: TUN egress/ingress, pre-shared-key encryption, and
//! routing-table gossip, layered on top of a [`MeshNode`] via
//! [`DataPlaneHandler`].

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use blake2::digest::{Update, VariableOutput};
use blake2::Blake2bVar;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::crypto::CryptoBox;
use crate::mesh_node::{DataPlaneHandler, MeshNode};
use crate::wire::ControlMessage;

use super::routing::VpnRoutingTable;
use super::tun::TunDevice;

const GOSSIP_PERIOD: Duration = Duration::from_secs(30);

/// Derives a stable overlay IP for `node_id` within `network/prefix_len`:
/// the first 4 bytes of `BLAKE2b(node_id)`, interpreted big-endian modulo
/// `2^host_bits - 2`, plus 1, added to the network address.
pub fn derive_self_ip(node_id: &str, network: Ipv4Addr, prefix_len: u8) -> Ipv4Addr {
    let mut hasher = Blake2bVar::new(4).expect("4 is a valid blake2b output size");
    hasher.update(node_id.as_bytes());
    let mut digest = [0u8; 4];
    hasher
        .finalize_variable(&mut digest)
        .expect("output buffer matches the requested 4-byte size");
    let hash_value = u32::from_be_bytes(digest) as u64;

    let host_bits = 32 - prefix_len as u32;
    let modulus = (1u64 << host_bits) - 2;
    let host_part = (hash_value % modulus) + 1;

    let network_u32 = u32::from(network);
    Ipv4Addr::from(network_u32 + host_part as u32)
}

pub struct VpnNode {
    pub mesh: Arc<MeshNode>,
    crypto: CryptoBox,
    tun: Arc<dyn TunDevice>,
    pub routing: VpnRoutingTable,
    pub self_ip: Ipv4Addr,
    prefix_len: u8,
}

impl VpnNode {
    pub fn new(
        mesh: Arc<MeshNode>,
        crypto: CryptoBox,
        tun: Arc<dyn TunDevice>,
        network: Ipv4Addr,
        prefix_len: u8,
        self_ip: Option<Ipv4Addr>,
    ) -> Arc<Self> {
        let self_ip = self_ip.unwrap_or_else(|| derive_self_ip(&mesh.core.self_id, network, prefix_len));
        let routing = VpnRoutingTable::new();
        routing.set(self_ip, &mesh.core.self_id);
        Arc::new(Self {
            mesh,
            crypto,
            tun,
            routing,
            self_ip,
            prefix_len,
        })
    }

    /// Opens the TUN device, registers this node as the mesh's data plane,
    /// and spawns the egress reader and gossip loops.
    pub async fn start(self: &Arc<Self>) -> Result<(), crate::error::NodeError> {
        self.tun.open(self.self_ip, self.prefix_len).await?;
        let (tx, rx) = mpsc::channel(256);
        self.tun.start_reading(tx).await?;
        self.mesh.set_data_plane(Arc::clone(self) as Arc<dyn DataPlaneHandler>);
        self.spawn_tun_egress(rx);
        self.spawn_gossip_loop();
        Ok(())
    }

    fn spawn_tun_egress(self: &Arc<Self>, mut rx: mpsc::Receiver<Vec<u8>>) -> tokio::task::JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(packet) = rx.recv().await {
                this.handle_tun_packet(packet).await;
            }
        })
    }

    async fn handle_tun_packet(&self, packet: Vec<u8>) {
        if packet.len() < 20 || (packet[0] >> 4) != 4 {
            return;
        }
        let dst_ip = Ipv4Addr::new(packet[16], packet[17], packet[18], packet[19]);
        let ciphertext = self.crypto.encrypt(&packet);
        let data = hex::encode(ciphertext);

        match self.routing.node_for_ip(dst_ip) {
            Some(node_id) => {
                let msg = ControlMessage::VpnPacket {
                    node_id: self.mesh.core.self_id.clone(),
                    data,
                };
                self.mesh.core.send_to_peer(&node_id, &msg).await;
            }
            None => {
                debug!(%dst_ip, "no route, broadcasting vpn_packet to active peers");
                for peer in self.mesh.peer_table().active_peers() {
                    let msg = ControlMessage::VpnPacket {
                        node_id: self.mesh.core.self_id.clone(),
                        data: data.clone(),
                    };
                    self.mesh.core.send_to_peer(&peer.node_id, &msg).await;
                }
            }
        }
    }

    fn spawn_gossip_loop(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let this = Arc::clone(self);
        let shutdown = self.mesh.shutdown_token();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(GOSSIP_PERIOD) => {}
                    _ = shutdown.cancelled() => break,
                }
                this.gossip_routes().await;
            }
        })
    }

    async fn gossip_routes(&self) {
        let routing_table = self.routing.snapshot();
        for peer in self.mesh.peer_table().active_peers() {
            let msg = ControlMessage::VpnRouteUpdate {
                node_id: self.mesh.core.self_id.clone(),
                routing_table: routing_table.clone(),
            };
            self.mesh.core.send_to_peer(&peer.node_id, &msg).await;
        }
    }
}

#[async_trait]
impl DataPlaneHandler for VpnNode {
    async fn handle_vpn_packet(&self, node_id: &str, data: &str) {
        let Ok(ciphertext) = hex::decode(data) else {
            warn!(node_id, "vpn_packet payload is not valid hex");
            return;
        };
        let plaintext = match self.crypto.decrypt(&ciphertext) {
            Ok(pt) => pt,
            Err(e) => {
                warn!(node_id, error = %e, "vpn_packet failed to decrypt");
                return;
            }
        };
        if plaintext.len() < 20 {
            warn!(node_id, "decrypted vpn_packet is shorter than an IPv4 header");
            return;
        }

        let src_ip = Ipv4Addr::new(plaintext[12], plaintext[13], plaintext[14], plaintext[15]);
        if self.routing.node_for_ip(src_ip).as_deref() != Some(node_id) {
            self.routing.set(src_ip, node_id);
        }

        if let Err(e) = self.tun.write(&plaintext).await {
            warn!(error = %e, "failed writing decrypted packet to tun");
        }
    }

    async fn handle_route_update(&self, _node_id: &str, table: &HashMap<String, String>) {
        for (ip_str, owner) in table {
            if owner == &self.mesh.core.self_id {
                continue;
            }
            let Ok(ip) = ip_str.parse::<Ipv4Addr>() else {
                continue;
            };
            if ip == self.self_ip {
                warn!(%ip, claimed_by = %owner, "overlay IP conflict: gossip claims our own self-IP");
                continue;
            }
            self.routing.set(ip, owner);
        }
    }
}
