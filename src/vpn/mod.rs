//! The VPN data plane: TUN boundary, overlay routing table, and the node
//! that ties encryption, routing, and gossip together over a mesh node.

pub mod node;
pub mod routing;
pub mod tun;

pub use node::{derive_self_ip, VpnNode};
pub use routing::VpnRoutingTable;
pub use tun::{NullTun, TunDevice};
