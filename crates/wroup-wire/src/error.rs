//! Errors from the wire protocol layer.

use thiserror::Error;
use wroup_types::{Peer, WroupError};

/// Errors from the wire protocol layer.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Malformed envelope: {0}")]
    Decode(String),
    #[error("Unknown envelope kind: {0:?}")]
    UnknownKind(String),
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: u64, max: u32 },
    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),
    #[error("Connect to {peer} failed: {reason}")]
    ConnectFailed { peer: Peer, reason: String },
}

impl WireError {
    /// Whether this error means the frame itself was bad (as opposed to the socket).
    pub fn is_decode(&self) -> bool {
        matches!(
            self,
            WireError::Json(_)
                | WireError::Decode(_)
                | WireError::UnknownKind(_)
                | WireError::MessageTooLarge { .. }
        )
    }

    /// Convert into the shared error type, attaching the peer when known.
    pub fn into_wroup(self, peer: Option<&Peer>) -> WroupError {
        match self {
            WireError::ConnectFailed { peer, reason } => WroupError::ConnectFailed { peer, reason },
            WireError::HandshakeFailed(reason) => match peer {
                Some(p) => WroupError::ConnectFailed {
                    peer: p.clone(),
                    reason,
                },
                None => WroupError::Decode(reason),
            },
            e if e.is_decode() => WroupError::Decode(e.to_string()),
            _ => WroupError::TransportClosed {
                peer: peer.cloned(),
            },
        }
    }
}

impl From<WireError> for WroupError {
    fn from(e: WireError) -> Self {
        e.into_wroup(None)
    }
}
