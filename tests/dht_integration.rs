//! End-to-end DHT scenario over real loopback UDP sockets: three nodes
//! bootstrap off a seed, then a value stored on one node is retrievable
//! from another purely through the DHT's STORE/FIND_VALUE RPCs.

use std::net::Ipv4Addr;
use std::time::Duration;

use meshnet::dht::DhtNode;

async fn start_dht(id: &str) -> std::sync::Arc<DhtNode> {
    let node = DhtNode::bind(id, 0).await.unwrap();
    node.spawn_recv_loop();
    node.spawn_maintenance();
    node
}

fn loopback_seed(node: &DhtNode) -> (Ipv4Addr, u16) {
    let addr = node.local_addr().unwrap();
    (Ipv4Addr::new(127, 0, 0, 1), addr.port())
}

#[tokio::test]
async fn store_and_get_across_bootstrapped_nodes() {
    let x = start_dht("1111111111111111111111111111111111111111").await;
    let y = start_dht("2222222222222222222222222222222222222222").await;
    let z = start_dht("3333333333333333333333333333333333333333").await;

    let seed = loopback_seed(&x);
    assert!(y.bootstrap(&[seed]).await, "y failed to bootstrap off the seed");
    assert!(z.bootstrap(&[seed]).await, "z failed to bootstrap off the seed");

    y.store("hello", serde_json::json!("world")).await;

    let found = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Some(v) = z.get("hello").await {
                return v;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("z never resolved the value stored by y");

    assert_eq!(found, serde_json::json!("world"));
}

#[tokio::test]
async fn bootstrap_against_a_dead_seed_fails_without_panicking() {
    let lonely = start_dht("4444444444444444444444444444444444444444").await;
    let dead_seed = (Ipv4Addr::new(127, 0, 0, 1), 1);
    assert!(!lonely.bootstrap(&[dead_seed]).await);
    assert!(lonely.routing_table().is_empty());
}
