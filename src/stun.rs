//! Minimal RFC 5389 STUN client: Binding Request/Response only, IPv4 only.
//!
//! No dedicated STUN actor: a function taking a socket reference that the
//! caller already owns, builds one small datagram, and awaits a reply with
//! a timeout.

use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::Duration;

use rand::RngCore;
use thiserror::Error;
use tokio::net::{ToSocketAddrs, UdpSocket};
use tracing::{debug, warn};

const BINDING_REQUEST: u16 = 0x0001;
const BINDING_RESPONSE: u16 = 0x0101;
const MAGIC_COOKIE: u32 = 0x2112_A442;
const MAPPED_ADDRESS: u16 = 0x0001;
const XOR_MAPPED_ADDRESS: u16 = 0x0020;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(2);

pub const DEFAULT_STUN_SERVERS: &[&str] = &[
    "stun.l.google.com:19302",
    "stun1.l.google.com:19302",
    "stun2.l.google.com:19302",
    "stun.ekiga.net:3478",
    "stun.stunprotocol.org:3478",
];

#[derive(Debug, Error)]
pub enum StunError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("no STUN server responded")]
    NoServerResponded,
    #[error("malformed STUN response")]
    Malformed,
    #[error("response did not contain an IPv4 mapped address")]
    NoIpv4Mapping,
}

/// Performs a Binding Request against each server in `servers` (in
/// randomized order) on `socket` until one replies, returning the
/// reflexive `(ip, port)`.
pub async fn discover(
    socket: &UdpSocket,
    servers: &[&str],
) -> Result<SocketAddrV4, StunError> {
    let mut order: Vec<&str> = servers.to_vec();
    {
        use rand::seq::SliceRandom;
        order.shuffle(&mut rand::thread_rng());
    }

    for server in order {
        match query_server(socket, server).await {
            Ok(addr) => return Ok(addr),
            Err(e) => {
                warn!(server, error = %e, "STUN server did not respond");
                continue;
            }
        }
    }
    Err(StunError::NoServerResponded)
}

async fn query_server<A: ToSocketAddrs>(
    socket: &UdpSocket,
    server: A,
) -> Result<SocketAddrV4, StunError> {
    let mut txn_id = [0u8; 12];
    rand::thread_rng().fill_bytes(&mut txn_id);

    let request = encode_binding_request(&txn_id);
    socket.send_to(&request, server).await?;

    let mut buf = [0u8; 1024];
    let recv = tokio::time::timeout(REQUEST_TIMEOUT, socket.recv_from(&mut buf))
        .await
        .map_err(|_| StunError::NoServerResponded)??;
    let (len, _from) = recv;

    let addr = parse_binding_response(&buf[..len], &txn_id)?;
    debug!(%addr, "STUN reflexive address resolved");
    Ok(addr)
}

fn encode_binding_request(txn_id: &[u8; 12]) -> Vec<u8> {
    let mut msg = Vec::with_capacity(20);
    msg.extend_from_slice(&BINDING_REQUEST.to_be_bytes());
    msg.extend_from_slice(&0u16.to_be_bytes()); // zero-length body
    msg.extend_from_slice(&MAGIC_COOKIE.to_be_bytes());
    msg.extend_from_slice(txn_id);
    msg
}

/// Parses a Binding Response, honoring both `MAPPED_ADDRESS` and
/// `XOR_MAPPED_ADDRESS` (preferred), walking TLV attributes with 4-byte
/// padding. IPv4 only.
fn parse_binding_response(data: &[u8], expected_txn_id: &[u8; 12]) -> Result<SocketAddrV4, StunError> {
    if data.len() < 20 {
        return Err(StunError::Malformed);
    }
    let msg_type = u16::from_be_bytes([data[0], data[1]]);
    if msg_type != BINDING_RESPONSE {
        return Err(StunError::Malformed);
    }
    let msg_len = u16::from_be_bytes([data[2], data[3]]) as usize;
    let cookie = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
    if cookie != MAGIC_COOKIE {
        return Err(StunError::Malformed);
    }
    if &data[8..20] != expected_txn_id {
        return Err(StunError::Malformed);
    }
    if data.len() < 20 + msg_len {
        return Err(StunError::Malformed);
    }

    let mut mapped: Option<SocketAddrV4> = None;
    let mut xor_mapped: Option<SocketAddrV4> = None;

    let mut offset = 20usize;
    let end = 20 + msg_len;
    while offset + 4 <= end {
        let attr_type = u16::from_be_bytes([data[offset], data[offset + 1]]);
        let attr_len = u16::from_be_bytes([data[offset + 2], data[offset + 3]]) as usize;
        let value_start = offset + 4;
        let value_end = value_start + attr_len;
        if value_end > data.len() {
            break;
        }
        let value = &data[value_start..value_end];

        match attr_type {
            MAPPED_ADDRESS => {
                if let Some(addr) = parse_mapped_address(value) {
                    mapped = Some(addr);
                }
            }
            XOR_MAPPED_ADDRESS => {
                if let Some(addr) = parse_xor_mapped_address(value) {
                    xor_mapped = Some(addr);
                }
            }
            _ => {}
        }

        // Attributes are padded to a 4-byte boundary.
        let padded_len = attr_len.div_ceil(4) * 4;
        offset = value_start + padded_len;
    }

    xor_mapped.or(mapped).ok_or(StunError::NoIpv4Mapping)
}

fn parse_mapped_address(value: &[u8]) -> Option<SocketAddrV4> {
    if value.len() < 8 || value[1] != 0x01 {
        return None; // family must be IPv4
    }
    let port = u16::from_be_bytes([value[2], value[3]]);
    let ip = Ipv4Addr::new(value[4], value[5], value[6], value[7]);
    Some(SocketAddrV4::new(ip, port))
}

fn parse_xor_mapped_address(value: &[u8]) -> Option<SocketAddrV4> {
    if value.len() < 8 || value[1] != 0x01 {
        return None;
    }
    let cookie_bytes = MAGIC_COOKIE.to_be_bytes();
    let xport = u16::from_be_bytes([value[2], value[3]]);
    let port = xport ^ u16::from_be_bytes([cookie_bytes[0], cookie_bytes[1]]);

    let mut addr_bytes = [0u8; 4];
    for i in 0..4 {
        addr_bytes[i] = value[4 + i] ^ cookie_bytes[i];
    }
    let ip = Ipv4Addr::from(addr_bytes);
    Some(SocketAddrV4::new(ip, port))
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Builds a canonical Binding Response carrying an XOR_MAPPED_ADDRESS
    /// for 192.0.2.1:54321.
    fn canonical_response(txn_id: [u8; 12]) -> Vec<u8> {
        let ip = Ipv4Addr::new(192, 0, 2, 1);
        let port: u16 = 54321;
        let cookie_bytes = MAGIC_COOKIE.to_be_bytes();
        let xport = port ^ u16::from_be_bytes([cookie_bytes[0], cookie_bytes[1]]);
        let mut xaddr = [0u8; 4];
        for (i, b) in ip.octets().iter().enumerate() {
            xaddr[i] = b ^ cookie_bytes[i];
        }

        let mut attr_value = Vec::new();
        attr_value.push(0x00);
        attr_value.push(0x01);
        attr_value.extend_from_slice(&xport.to_be_bytes());
        attr_value.extend_from_slice(&xaddr);

        let mut body = Vec::new();
        body.extend_from_slice(&XOR_MAPPED_ADDRESS.to_be_bytes());
        body.extend_from_slice(&(attr_value.len() as u16).to_be_bytes());
        body.extend_from_slice(&attr_value);

        let mut msg = Vec::new();
        msg.extend_from_slice(&BINDING_RESPONSE.to_be_bytes());
        msg.extend_from_slice(&(body.len() as u16).to_be_bytes());
        msg.extend_from_slice(&MAGIC_COOKIE.to_be_bytes());
        msg.extend_from_slice(&txn_id);
        msg.extend_from_slice(&body);
        msg
    }

    #[test]
    fn parses_xor_mapped_address() {
        let txn_id = [9u8; 12];
        let resp = canonical_response(txn_id);
        let addr = parse_binding_response(&resp, &txn_id).unwrap();
        assert_eq!(addr, SocketAddrV4::new(Ipv4Addr::new(192, 0, 2, 1), 54321));
    }

    #[test]
    fn rejects_mismatched_transaction_id() {
        let resp = canonical_response([1u8; 12]);
        assert!(parse_binding_response(&resp, &[2u8; 12]).is_err());
    }

    #[test]
    fn binding_request_has_expected_header() {
        let txn = [5u8; 12];
        let req = encode_binding_request(&txn);
        assert_eq!(req.len(), 20);
        assert_eq!(u16::from_be_bytes([req[0], req[1]]), BINDING_REQUEST);
        assert_eq!(
            u32::from_be_bytes([req[4], req[5], req[6], req[7]]),
            MAGIC_COOKIE
        );
        assert_eq!(&req[8..20], &txn);
    }
}
