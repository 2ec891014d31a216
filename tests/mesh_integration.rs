//! End-to-end scenarios over real loopback UDP sockets (no real TUN device;
//! `NullTun` stands in).

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use meshnet::crypto::{CryptoBox, KEY_LEN};
use meshnet::discovery_server::DiscoveryServer;
use meshnet::mesh_node::{MeshNode, MeshNodeHandler};
use meshnet::node_core::NodeCore;
use meshnet::peer_table::PeerStatus;
use meshnet::vpn::tun::{NullTun, TunDevice};
use meshnet::vpn::VpnNode;
use tokio_util::sync::CancellationToken;

struct Harness {
    server_shutdown: CancellationToken,
}

async fn start_server() -> (std::net::SocketAddr, Harness) {
    let core = Arc::new(NodeCore::bind("server", 0).await.unwrap());
    let addr = core.local_addr().unwrap();
    let server = DiscoveryServer::new(Arc::clone(&core));
    let shutdown = CancellationToken::new();
    server.spawn_sweeper(shutdown.clone());
    core.spawn_recv_loop(server, shutdown.clone());
    (addr, Harness { server_shutdown: shutdown })
}

fn ipv4_packet(src: Ipv4Addr, dst: Ipv4Addr, payload: &[u8]) -> Vec<u8> {
    let mut packet = vec![0u8; 20 + payload.len()];
    packet[0] = 0x45; // version 4, IHL 5
    packet[12..16].copy_from_slice(&src.octets());
    packet[16..20].copy_from_slice(&dst.octets());
    packet[20..].copy_from_slice(payload);
    packet
}

async fn wait_until_active(mesh: &MeshNode, peer_id: &str) {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if let Some(p) = mesh.peer_table().get(peer_id) {
                if p.status == PeerStatus::Active {
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("peer never became active");
}

struct Node {
    mesh: Arc<MeshNode>,
    vpn: Arc<VpnNode>,
    tun: Arc<NullTun>,
}

async fn start_node(id: &str, server_addr: std::net::SocketAddr, key: [u8; KEY_LEN]) -> Node {
    let core = Arc::new(NodeCore::bind(id, 0).await.unwrap());
    let mesh = MeshNode::new(Arc::clone(&core), server_addr);
    core.spawn_recv_loop(Arc::new(MeshNodeHandler(Arc::clone(&mesh))), mesh.shutdown_token());
    mesh.spawn_maintenance();

    let tun = Arc::new(NullTun::new());
    let crypto = CryptoBox::new(&key).unwrap();
    let vpn = VpnNode::new(
        Arc::clone(&mesh),
        crypto,
        Arc::clone(&tun) as Arc<dyn TunDevice>,
        Ipv4Addr::new(10, 0, 0, 0),
        24,
        None,
    );
    vpn.start().await.unwrap();
    Node { mesh, vpn, tun }
}

#[tokio::test]
async fn two_node_direct_hole_punch_and_data_plane() {
    let (server_addr, _harness) = start_server().await;
    let key = {
        let mut k = [0u8; KEY_LEN];
        k[KEY_LEN - 1] = 1;
        k
    };

    let a = start_node("a1", server_addr, key).await;
    let b = start_node("b1", server_addr, key).await;

    wait_until_active(&a.mesh, "b1").await;
    wait_until_active(&b.mesh, "a1").await;

    let payload = b"echo-request-payload";
    let packet = ipv4_packet(a.vpn.self_ip, b.vpn.self_ip, payload);
    a.tun.inject(packet.clone()).await;

    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let written = b.tun.written_packets();
            if written.iter().any(|p| p == &packet) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("b never received a's packet over the data plane");

    a.mesh.stop();
    b.mesh.stop();
}

#[tokio::test]
async fn peer_to_peer_traffic_survives_rendezvous_server_outage() {
    let (server_addr, harness) = start_server().await;
    let key = [3u8; KEY_LEN];

    let a = start_node("a2", server_addr, key).await;
    let b = start_node("b2", server_addr, key).await;

    wait_until_active(&a.mesh, "b2").await;
    wait_until_active(&b.mesh, "a2").await;

    // Kill the rendezvous server.
    harness.server_shutdown.cancel();

    // Direct traffic between already-active peers keeps flowing.
    let payload = b"post-outage-packet";
    let packet = ipv4_packet(a.vpn.self_ip, b.vpn.self_ip, payload);
    a.tun.inject(packet.clone()).await;

    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if b.tun.written_packets().iter().any(|p| p == &packet) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("data plane traffic should not depend on the rendezvous server");

    // Both peers are still marked active; the outage did not panic the
    // maintenance loop on either side.
    assert_eq!(a.mesh.peer_table().get("b2").unwrap().status, PeerStatus::Active);
    assert_eq!(b.mesh.peer_table().get("a2").unwrap().status, PeerStatus::Active);

    a.mesh.stop();
    b.mesh.stop();
}
