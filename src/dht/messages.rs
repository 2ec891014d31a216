//! DHT RPC wire schema: JSON over UDP, every message carries `type`,
//! `node_id`, `msgid`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const MAX_DHT_MESSAGE_SIZE: usize = 4096;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeInfo {
    pub node_id: String,
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum DhtMessage {
    #[serde(rename = "PING")]
    Ping { node_id: String, msgid: u64 },
    #[serde(rename = "PONG")]
    Pong { node_id: String, msgid: u64 },
    #[serde(rename = "FIND_NODE")]
    FindNode {
        node_id: String,
        msgid: u64,
        target: String,
    },
    #[serde(rename = "NODES")]
    Nodes {
        node_id: String,
        msgid: u64,
        nodes: Vec<NodeInfo>,
    },
    #[serde(rename = "FIND_VALUE")]
    FindValue {
        node_id: String,
        msgid: u64,
        key: String,
    },
    #[serde(rename = "VALUE")]
    Value {
        node_id: String,
        msgid: u64,
        key: String,
        value: Value,
    },
    #[serde(rename = "STORE")]
    Store {
        node_id: String,
        msgid: u64,
        key: String,
        value: Value,
    },
    #[serde(rename = "STORE_OK")]
    StoreOk { node_id: String, msgid: u64, key: String },
}

impl DhtMessage {
    pub fn node_id(&self) -> &str {
        match self {
            DhtMessage::Ping { node_id, .. }
            | DhtMessage::Pong { node_id, .. }
            | DhtMessage::FindNode { node_id, .. }
            | DhtMessage::Nodes { node_id, .. }
            | DhtMessage::FindValue { node_id, .. }
            | DhtMessage::Value { node_id, .. }
            | DhtMessage::Store { node_id, .. }
            | DhtMessage::StoreOk { node_id, .. } => node_id,
        }
    }

    pub fn msgid(&self) -> u64 {
        match self {
            DhtMessage::Ping { msgid, .. }
            | DhtMessage::Pong { msgid, .. }
            | DhtMessage::FindNode { msgid, .. }
            | DhtMessage::Nodes { msgid, .. }
            | DhtMessage::FindValue { msgid, .. }
            | DhtMessage::Value { msgid, .. }
            | DhtMessage::Store { msgid, .. }
            | DhtMessage::StoreOk { msgid, .. } => *msgid,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("DhtMessage always serializes")
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, String> {
        if bytes.len() >= MAX_DHT_MESSAGE_SIZE {
            return Err(format!("message too large ({} bytes)", bytes.len()));
        }
        serde_json::from_slice(bytes).map_err(|e| e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ping_round_trips() {
        let msg = DhtMessage::Ping {
            node_id: "a".repeat(40),
            msgid: 42,
        };
        let bytes = msg.encode();
        let decoded = DhtMessage::decode(&bytes).unwrap();
        assert_eq!(decoded.msgid(), 42);
    }

    #[test]
    fn store_carries_arbitrary_json_value() {
        let msg = DhtMessage::Store {
            node_id: "b".repeat(40),
            msgid: 1,
            key: "c".repeat(40),
            value: serde_json::json!({"nested": [1, 2, 3]}),
        };
        let bytes = msg.encode();
        let DhtMessage::Store { value, .. } = DhtMessage::decode(&bytes).unwrap() else {
            panic!("expected store");
        };
        assert_eq!(value["nested"][1], 2);
    }
}
