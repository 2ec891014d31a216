//! Control-plane wire schema: one JSON object per UDP datagram.
//!
//! Dispatch is a tagged `enum` with exhaustive matching, so an unhandled
//! action is a single compiler-checked catch-all rather than a map lookup
//! that can silently miss a case.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Datagrams at or above this size are dropped before they are even parsed.
pub const MAX_MESSAGE_SIZE: usize = 4096;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ControlMessage {
    Ping {
        node_id: String,
    },
    Pong {
        node_id: String,
    },
    Register {
        node_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        local_ip: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        local_port: Option<u16>,
        #[serde(default)]
        capabilities: HashMap<String, Value>,
    },
    RegisterOk {
        node_id: String,
        external_ip: String,
        external_port: u16,
        timestamp: u64,
    },
    Discover {
        node_id: String,
        #[serde(default)]
        exclude_ids: Vec<String>,
    },
    DiscoverResponse {
        node_id: String,
        peers: Vec<DiscoveredPeer>,
    },
    HolePunch {
        node_id: String,
    },
    HolePunchAck {
        node_id: String,
    },
    VpnPacket {
        node_id: String,
        data: String,
    },
    VpnRouteUpdate {
        node_id: String,
        routing_table: HashMap<String, String>,
    },
}

impl ControlMessage {
    pub fn node_id(&self) -> &str {
        match self {
            ControlMessage::Ping { node_id }
            | ControlMessage::Pong { node_id }
            | ControlMessage::Register { node_id, .. }
            | ControlMessage::RegisterOk { node_id, .. }
            | ControlMessage::Discover { node_id, .. }
            | ControlMessage::DiscoverResponse { node_id, .. }
            | ControlMessage::HolePunch { node_id }
            | ControlMessage::HolePunchAck { node_id }
            | ControlMessage::VpnPacket { node_id, .. }
            | ControlMessage::VpnRouteUpdate { node_id, .. } => node_id,
        }
    }

    /// Serializes to a single UTF-8 JSON datagram.
    pub fn encode(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("ControlMessage always serializes")
    }

    /// Parses an inbound datagram. Oversized or malformed datagrams are
    /// rejected here rather than left for the caller to filter.
    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        if bytes.len() >= MAX_MESSAGE_SIZE {
            return Err(DecodeError::TooLarge(bytes.len()));
        }
        serde_json::from_slice(bytes).map_err(|e| DecodeError::Malformed(e.to_string()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveredPeer {
    pub node_id: String,
    pub external_ip: String,
    pub external_port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_port: Option<u16>,
    #[serde(default)]
    pub capabilities: HashMap<String, Value>,
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("message too large ({0} bytes)")]
    TooLarge(usize),
    #[error("malformed message: {0}")]
    Malformed(String),
}
