//! CLI surface for the four binaries, plus the small parsers (pre-shared
//! key hex, overlay CIDR) shared between them.

use std::net::Ipv4Addr;

use clap::Parser;
use thiserror::Error;

use crate::crypto::KEY_LEN;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("pre-shared key must be {} lowercase hex chars, got {0}", KEY_LEN * 2)]
    BadKeyHex(usize),
    #[error("pre-shared key is not valid hex: {0}")]
    KeyNotHex(String),
    #[error("invalid CIDR '{0}': {1}")]
    BadCidr(String, String),
    #[error("prefix length must be 1-32, got {0}")]
    BadPrefixLen(u8),
}

/// Parses a 64-character lowercase hex pre-shared key into its 32 raw bytes.
pub fn parse_psk_hex(s: &str) -> Result<[u8; KEY_LEN], ConfigError> {
    if s.len() != KEY_LEN * 2 {
        return Err(ConfigError::BadKeyHex(s.len()));
    }
    let mut out = [0u8; KEY_LEN];
    hex::decode_to_slice(s, &mut out).map_err(|_| ConfigError::KeyNotHex(s.to_string()))?;
    Ok(out)
}

/// Parses `a.b.c.d/n` into its network address and prefix length.
pub fn parse_cidr(s: &str) -> Result<(Ipv4Addr, u8), ConfigError> {
    let (ip_part, prefix_part) = s
        .split_once('/')
        .ok_or_else(|| ConfigError::BadCidr(s.to_string(), "missing '/prefix'".to_string()))?;
    let ip: Ipv4Addr = ip_part
        .parse()
        .map_err(|e: std::net::AddrParseError| ConfigError::BadCidr(s.to_string(), e.to_string()))?;
    let prefix: u8 = prefix_part
        .parse()
        .map_err(|_| ConfigError::BadCidr(s.to_string(), "prefix is not a number".to_string()))?;
    if prefix == 0 || prefix > 32 {
        return Err(ConfigError::BadPrefixLen(prefix));
    }
    Ok((ip, prefix))
}

#[derive(Debug, Parser)]
#[command(name = "meshnet-server", about = "Rendezvous (discovery) server")]
pub struct ServerArgs {
    #[arg(long, default_value = "0.0.0.0", help_heading = "Network")]
    pub bind: String,
    #[arg(long, default_value_t = 8000, help_heading = "Network")]
    pub port: u16,
}

#[derive(Debug, Parser)]
#[command(name = "meshnet-node", about = "Mesh VPN node")]
pub struct NodeArgs {
    /// This node's id, used as the mesh identity and (absent --overlay-ip) as
    /// the seed for deterministic overlay IP derivation.
    #[arg(long, help_heading = "Identity")]
    pub id: String,

    #[arg(long, default_value_t = 0, help_heading = "Network")]
    pub port: u16,

    /// Rendezvous server address, `host:port`.
    #[arg(long, help_heading = "Network")]
    pub server: String,

    /// Overlay network CIDR, e.g. `10.0.0.0/24`.
    #[arg(long, help_heading = "Overlay")]
    pub network: String,

    /// TUN device name.
    #[arg(long, default_value = "meshnet0", help_heading = "Overlay")]
    pub tun: String,

    /// Pre-shared key, 64 lowercase hex chars (32 bytes).
    #[arg(long, help_heading = "Security")]
    pub key: String,

    /// Optional DHT bootstrap peers, `host:port`, comma separated, used
    /// instead of (or alongside) the rendezvous server.
    #[arg(long, value_delimiter = ',', help_heading = "Discovery")]
    pub bootstrap_dht: Vec<String>,
}

#[derive(Debug, Parser)]
#[command(name = "meshnet-dht", about = "Kademlia DHT discovery node")]
pub struct DhtArgs {
    /// 40 lowercase hex char DHT node id.
    #[arg(long, help_heading = "Identity")]
    pub id: String,

    #[arg(long, default_value_t = 0, help_heading = "Network")]
    pub port: u16,

    /// Bootstrap seeds, `host:port`, comma separated.
    #[arg(long, value_delimiter = ',', help_heading = "Discovery")]
    pub bootstrap: Vec<String>,
}

#[derive(Debug, Parser)]
#[command(name = "meshnet-keygen", about = "Generates a 32-byte pre-shared key as hex")]
pub struct KeygenArgs;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_psk_hex_accepts_64_lowercase_hex_chars() {
        let key = "00".repeat(KEY_LEN);
        let bytes = parse_psk_hex(&key).unwrap();
        assert_eq!(bytes, [0u8; KEY_LEN]);
    }

    #[test]
    fn parse_psk_hex_rejects_wrong_length() {
        assert!(matches!(parse_psk_hex("ab"), Err(ConfigError::BadKeyHex(2))));
    }

    #[test]
    fn parse_psk_hex_rejects_uppercase_or_non_hex() {
        assert!(parse_psk_hex(&"ZZ".repeat(KEY_LEN)).is_err());
    }

    #[test]
    fn parse_cidr_splits_network_and_prefix() {
        let (ip, prefix) = parse_cidr("10.0.0.0/24").unwrap();
        assert_eq!(ip, Ipv4Addr::new(10, 0, 0, 0));
        assert_eq!(prefix, 24);
    }

    #[test]
    fn parse_cidr_rejects_missing_slash() {
        assert!(parse_cidr("10.0.0.0").is_err());
    }

    #[test]
    fn parse_cidr_rejects_zero_prefix() {
        assert!(matches!(parse_cidr("10.0.0.0/0"), Err(ConfigError::BadPrefixLen(0))));
    }
}
