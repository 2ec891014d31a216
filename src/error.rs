use std::net::AddrParseError;

use thiserror::Error;

use crate::crypto::CryptoError;
use crate::stun::StunError;

/// Top-level error type for the control and data planes.
///
/// Per the failure taxonomy: only configuration and TUN-open errors are
/// fatal. Everything else is logged and dropped by the caller; this enum
/// exists so library functions still have a precise `Result` to return to
/// callers that want to react (tests, metrics, the maintenance loop).
#[derive(Debug, Error)]
pub enum NodeError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error(transparent)]
    Stun(#[from] StunError),
    #[error("malformed control message: {0}")]
    MalformedMessage(String),
    #[error("message too large ({0} bytes)")]
    MessageTooLarge(usize),
    #[error("unknown action: {0}")]
    UnknownAction(String),
    #[error("unknown peer: {0}")]
    PeerUnknown(String),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("tun device failure: {0}")]
    Tun(String),
}

impl From<AddrParseError> for NodeError {
    fn from(value: AddrParseError) -> Self {
        NodeError::Config(value.to_string())
    }
}
