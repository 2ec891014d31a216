//! Kademlia-style DHT: the decentralized alternative to the rendezvous
//! server. 160-bit node ids (40 hex chars), XOR distance, k-bucket routing,
//! PING/FIND_NODE/FIND_VALUE/STORE over JSON-over-UDP.

pub mod messages;
pub mod node;
pub mod routing_table;

pub use node::DhtNode;

pub const ID_BITS: usize = 160;
pub const ID_BYTES: usize = 20;
pub const NUM_BUCKETS: usize = ID_BITS;
pub const K: usize = 20;

#[derive(Debug, thiserror::Error)]
pub enum DhtIdError {
    #[error("DHT node id must be exactly 40 hex characters, got {0}")]
    WrongLength(usize),
    #[error("DHT node id must be lowercase hex: {0}")]
    NotHex(String),
}

/// Parses a 40-hex-char id into its 20-byte form.
pub fn parse_id(id: &str) -> Result<[u8; ID_BYTES], DhtIdError> {
    if id.len() != ID_BYTES * 2 {
        return Err(DhtIdError::WrongLength(id.len()));
    }
    let mut out = [0u8; ID_BYTES];
    hex::decode_to_slice(id, &mut out).map_err(|_| DhtIdError::NotHex(id.to_string()))?;
    Ok(out)
}

pub fn to_hex(id: &[u8; ID_BYTES]) -> String {
    hex::encode(id)
}

/// Maps an arbitrary client-supplied key (e.g. `"hello"`) into the 40-hex
/// `sha1_key` address space `DhtStorage` and routing both operate on.
pub fn hash_key(key: &str) -> [u8; ID_BYTES] {
    use sha1::{Digest, Sha1};
    let digest = Sha1::digest(key.as_bytes());
    let mut out = [0u8; ID_BYTES];
    out.copy_from_slice(&digest);
    out
}

/// XOR distance between two ids, as a 20-byte big-endian value.
pub fn xor_distance(a: &[u8; ID_BYTES], b: &[u8; ID_BYTES]) -> [u8; ID_BYTES] {
    let mut out = [0u8; ID_BYTES];
    for i in 0..ID_BYTES {
        out[i] = a[i] ^ b[i];
    }
    out
}

/// Number of leading zero bits in a big-endian 160-bit value.
fn leading_zero_bits(bytes: &[u8; ID_BYTES]) -> u32 {
    let mut count = 0u32;
    for b in bytes.iter() {
        if *b == 0 {
            count += 8;
            continue;
        }
        count += b.leading_zeros();
        break;
    }
    count
}

/// The bucket a peer with id `peer` belongs to in a table rooted at
/// `local`: `159 - floor(log2(local XOR peer))`, and `0` when the XOR is
/// zero (i.e. `peer == local`).
pub fn bucket_index(local: &[u8; ID_BYTES], peer: &[u8; ID_BYTES]) -> usize {
    let xor = xor_distance(local, peer);
    if xor == [0u8; ID_BYTES] {
        return 0;
    }
    leading_zero_bits(&xor) as usize
}

/// Flips bit `bit_index` (0 = LSB of the last byte) of `id`, used to
/// synthesize a target id that falls within a given bucket's range for
/// refresh lookups.
pub fn flip_bit(id: &[u8; ID_BYTES], bit_index: usize) -> [u8; ID_BYTES] {
    let mut out = *id;
    let byte_index = ID_BYTES - 1 - (bit_index / 8);
    let bit_in_byte = bit_index % 8;
    out[byte_index] ^= 1 << bit_in_byte;
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_zero_for_self() {
        let id = [0xABu8; ID_BYTES];
        assert_eq!(bucket_index(&id, &id), 0);
    }

    #[test]
    fn bucket_zero_for_msb_difference() {
        let local = [0u8; ID_BYTES];
        let mut peer = [0u8; ID_BYTES];
        peer[0] = 0x80; // differ only in the top bit
        assert_eq!(bucket_index(&local, &peer), 0);
    }

    #[test]
    fn bucket_zero_for_lsb_difference() {
        let local = [0u8; ID_BYTES];
        let mut peer = [0u8; ID_BYTES];
        peer[ID_BYTES - 1] = 0x01; // differ only in the bottom bit
        assert_eq!(bucket_index(&local, &peer), 159);
    }

    #[test]
    fn parse_id_roundtrips_through_hex() {
        let hex_id = "a".repeat(40);
        let bytes = parse_id(&hex_id).unwrap();
        assert_eq!(to_hex(&bytes), hex_id);
    }

    #[test]
    fn parse_id_rejects_wrong_length() {
        assert!(matches!(parse_id("abc"), Err(DhtIdError::WrongLength(3))));
    }

    #[test]
    fn hash_key_is_deterministic_and_hex_parseable() {
        let a = hash_key("hello");
        let b = hash_key("hello");
        assert_eq!(a, b);
        assert_eq!(parse_id(&to_hex(&a)).unwrap(), a);
    }

    #[test]
    fn hash_key_differs_across_inputs_in_practice() {
        assert_ne!(hash_key("hello"), hash_key("world"));
    }
}
