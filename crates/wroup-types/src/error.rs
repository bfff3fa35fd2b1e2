//! Shared error types for Wroup.

use crate::peer::Peer;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Top-level error type.
#[derive(Error, Debug)]
pub enum WroupError {
    /// The radio/discovery channel could not start.
    #[error("Discovery unavailable: {0}")]
    DiscoveryUnavailable(String),

    /// The local service advertisement was rejected.
    #[error("Service registration failed: {0}")]
    RegistrationFailed(String),

    /// A link to a peer could not be established.
    #[error("Connect to {peer} failed: {reason}")]
    ConnectFailed {
        /// The peer we tried to reach.
        peer: Peer,
        /// Why it failed.
        reason: String,
    },

    /// A malformed or unrecognized envelope was received.
    #[error("Decode error: {0}")]
    Decode(String),

    /// A peer socket dropped unexpectedly.
    #[error("Transport closed{}", display_peer(.peer))]
    TransportClosed {
        /// The peer on the other end, when known.
        peer: Option<Peer>,
    },

    /// A configuration error occurred.
    #[error("Configuration error: {0}")]
    Config(String),

    /// An I/O error occurred.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

fn display_peer(peer: &Option<Peer>) -> String {
    match peer {
        Some(p) => format!(" ({p})"),
        None => String::new(),
    }
}

impl WroupError {
    /// Classify this error for event consumers.
    pub fn code(&self) -> ErrorCode {
        match self {
            WroupError::DiscoveryUnavailable(_) => ErrorCode::DiscoveryUnavailable,
            WroupError::RegistrationFailed(_) => ErrorCode::RegistrationFailed,
            WroupError::ConnectFailed { .. } => ErrorCode::ConnectFailed,
            WroupError::Decode(_) => ErrorCode::DecodeError,
            WroupError::TransportClosed { .. } | WroupError::Io(_) => ErrorCode::TransportClosed,
            WroupError::Config(_) => ErrorCode::DiscoveryUnavailable,
        }
    }
}

/// Alias for Result with WroupError.
pub type WroupResult<T> = Result<T, WroupError>;

/// Classified error code carried by error notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Radio/discovery channel could not start.
    DiscoveryUnavailable,
    /// Advertisement rejected.
    RegistrationFailed,
    /// Peer link could not be established.
    ConnectFailed,
    /// Malformed or unrecognized envelope.
    DecodeError,
    /// Peer socket dropped unexpectedly.
    TransportClosed,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorCode::DiscoveryUnavailable => "discovery_unavailable",
            ErrorCode::RegistrationFailed => "registration_failed",
            ErrorCode::ConnectFailed => "connect_failed",
            ErrorCode::DecodeError => "decode_error",
            ErrorCode::TransportClosed => "transport_closed",
        };
        f.write_str(s)
    }
}

/// Numeric failure reason reported by a Wi-Fi Direct style radio stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RadioFailure {
    /// Generic internal error (reason 0).
    Error,
    /// Peer-to-peer is not supported on this device (reason 1).
    P2pNotSupported,
    /// The framework is busy with another request (reason 2).
    Busy,
}

impl RadioFailure {
    /// Map a radio reason code. Unknown codes yield `None`.
    pub fn from_reason(reason: i32) -> Option<Self> {
        match reason {
            0 => Some(RadioFailure::Error),
            1 => Some(RadioFailure::P2pNotSupported),
            2 => Some(RadioFailure::Busy),
            _ => None,
        }
    }

    /// Error for a failed browse request.
    pub fn into_discovery_error(self) -> WroupError {
        WroupError::DiscoveryUnavailable(format!("radio failure: {self:?}"))
    }

    /// Error for a failed advertisement request.
    pub fn into_registration_error(self) -> WroupError {
        WroupError::RegistrationFailed(format!("radio failure: {self:?}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes() {
        assert_eq!(
            WroupError::Decode("x".into()).code(),
            ErrorCode::DecodeError
        );
        assert_eq!(
            WroupError::TransportClosed { peer: None }.code(),
            ErrorCode::TransportClosed
        );
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "gone");
        assert_eq!(WroupError::from(io).code(), ErrorCode::TransportClosed);
    }

    #[test]
    fn test_messages_carry_peer() {
        let peer = Peer::new("tab", "02:11");
        let err = WroupError::ConnectFailed {
            peer: peer.clone(),
            reason: "timed out".into(),
        };
        assert!(err.to_string().contains("02:11"));
        let closed = WroupError::TransportClosed { peer: Some(peer) };
        assert!(closed.to_string().contains("tab"));
        assert_eq!(
            WroupError::TransportClosed { peer: None }.to_string(),
            "Transport closed"
        );
    }

    #[test]
    fn test_radio_reasons() {
        assert_eq!(RadioFailure::from_reason(2), Some(RadioFailure::Busy));
        assert_eq!(RadioFailure::from_reason(7), None);
        assert_eq!(
            RadioFailure::P2pNotSupported.into_discovery_error().code(),
            ErrorCode::DiscoveryUnavailable
        );
        assert_eq!(
            RadioFailure::Busy.into_registration_error().code(),
            ErrorCode::RegistrationFailed
        );
    }
}
