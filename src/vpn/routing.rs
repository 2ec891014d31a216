//! Overlay routing table: `ip -> node_id` and its inverse, kept consistent
//! through a single `set`/`get` API so no caller can update one side
//! without the other.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Mutex;

#[derive(Default)]
pub struct VpnRoutingTable {
    ip_to_node: Mutex<HashMap<Ipv4Addr, String>>,
    node_to_ip: Mutex<HashMap<String, Ipv4Addr>>,
}

impl VpnRoutingTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, ip: Ipv4Addr, node_id: &str) {
        let mut ip_to_node = self.ip_to_node.lock().unwrap();
        let mut node_to_ip = self.node_to_ip.lock().unwrap();
        if let Some(old_ip) = node_to_ip.get(node_id).copied() {
            if old_ip != ip {
                ip_to_node.remove(&old_ip);
            }
        }
        ip_to_node.insert(ip, node_id.to_string());
        node_to_ip.insert(node_id.to_string(), ip);
    }

    pub fn node_for_ip(&self, ip: Ipv4Addr) -> Option<String> {
        self.ip_to_node.lock().unwrap().get(&ip).cloned()
    }

    pub fn ip_for_node(&self, node_id: &str) -> Option<Ipv4Addr> {
        self.node_to_ip.lock().unwrap().get(node_id).copied()
    }

    /// A snapshot suitable for `vpn_route_update`'s `routing_table` field:
    /// `ip string -> node_id`.
    pub fn snapshot(&self) -> HashMap<String, String> {
        self.ip_to_node
            .lock()
            .unwrap()
            .iter()
            .map(|(ip, node)| (ip.to_string(), node.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.ip_to_node.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_keeps_both_directions_consistent() {
        let t = VpnRoutingTable::new();
        t.set(Ipv4Addr::new(10, 0, 0, 2), "b1");
        assert_eq!(t.node_for_ip(Ipv4Addr::new(10, 0, 0, 2)), Some("b1".to_string()));
        assert_eq!(t.ip_for_node("b1"), Some(Ipv4Addr::new(10, 0, 0, 2)));
    }

    #[test]
    fn reassigning_a_node_to_a_new_ip_drops_the_old_mapping() {
        let t = VpnRoutingTable::new();
        t.set(Ipv4Addr::new(10, 0, 0, 2), "b1");
        t.set(Ipv4Addr::new(10, 0, 0, 3), "b1");
        assert_eq!(t.node_for_ip(Ipv4Addr::new(10, 0, 0, 2)), None);
        assert_eq!(t.node_for_ip(Ipv4Addr::new(10, 0, 0, 3)), Some("b1".to_string()));
    }
}
