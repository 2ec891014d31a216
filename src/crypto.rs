//! Pre-shared-key authenticated encryption for the overlay data plane.
//!
//! Uses an XSalsa20-Poly1305 construction (the `crypto_secretbox` crate,
//! binary-compatible with libsodium's `crypto_secretbox`) with a random
//! 24-byte nonce prepended to each ciphertext. The key is shared out of
//! band by every member of the mesh; there is no handshake.

use crypto_secretbox::aead::{Aead, AeadCore, KeyInit, OsRng};
use crypto_secretbox::{Nonce, XSalsa20Poly1305};
use thiserror::Error;

pub const KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 24;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("authentication failed")]
    AuthFailure,
    #[error("ciphertext too short to contain a nonce")]
    Truncated,
    #[error("key must be exactly {KEY_LEN} bytes, got {0}")]
    BadKeyLength(usize),
}

/// A bound pre-shared key ready to encrypt/decrypt datagrams.
#[derive(Clone)]
pub struct CryptoBox {
    cipher: XSalsa20Poly1305,
}

impl CryptoBox {
    pub fn new(key: &[u8]) -> Result<Self, CryptoError> {
        if key.len() != KEY_LEN {
            return Err(CryptoError::BadKeyLength(key.len()));
        }
        Ok(Self {
            cipher: XSalsa20Poly1305::new_from_slice(key).map_err(|_| CryptoError::BadKeyLength(key.len()))?,
        })
    }

    /// Encrypts `plaintext`, returning `nonce (24B) || ciphertext || tag (16B)`.
    pub fn encrypt(&self, plaintext: &[u8]) -> Vec<u8> {
        let nonce = XSalsa20Poly1305::generate_nonce(&mut OsRng);
        // A fresh random nonce makes this infallible in practice; the
        // underlying crate only errs on plaintexts far past any MTU.
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext)
            .expect("encryption of an MTU-sized datagram does not fail");
        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(nonce.as_slice());
        out.extend_from_slice(&ciphertext);
        out
    }

    /// Decrypts a `nonce || ciphertext || tag` blob produced by [`encrypt`].
    pub fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if data.len() < NONCE_LEN {
            return Err(CryptoError::Truncated);
        }
        let (nonce_bytes, ciphertext) = data.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);
        self.cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| CryptoError::AuthFailure)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> [u8; KEY_LEN] {
        [7u8; KEY_LEN]
    }

    #[test]
    fn round_trip_is_identity() {
        let b = CryptoBox::new(&key()).unwrap();
        let msg = b"hello mesh, this is an ip packet payload";
        let ct = b.encrypt(msg);
        let pt = b.decrypt(&ct).unwrap();
        assert_eq!(pt, msg);
    }

    #[test]
    fn bit_flip_fails_auth() {
        let b = CryptoBox::new(&key()).unwrap();
        let mut ct = b.encrypt(b"payload");
        let last = ct.len() - 1;
        ct[last] ^= 0x01;
        assert!(matches!(b.decrypt(&ct), Err(CryptoError::AuthFailure)));
    }

    #[test]
    fn truncated_fails() {
        let b = CryptoBox::new(&key()).unwrap();
        assert!(matches!(b.decrypt(&[0u8; 4]), Err(CryptoError::Truncated)));
    }

    #[test]
    fn wrong_key_fails_auth() {
        let a = CryptoBox::new(&[1u8; KEY_LEN]).unwrap();
        let b = CryptoBox::new(&[2u8; KEY_LEN]).unwrap();
        let ct = a.encrypt(b"secret");
        assert!(matches!(b.decrypt(&ct), Err(CryptoError::AuthFailure)));
    }

    #[test]
    fn bad_key_length_rejected() {
        assert!(matches!(
            CryptoBox::new(&[0u8; 10]),
            Err(CryptoError::BadKeyLength(10))
        ));
    }
}
