//! Error types.

use tether_core::TransportError;
use thiserror::Error;

/// Problem while dialing a WebSocket server.
#[derive(Debug, Error)]
pub enum ConnectError {
    /// A pass-through header could not be encoded.
    #[error("invalid header {name}: {reason}")]
    InvalidHeader {
        /// Header name as supplied by the caller.
        name: String,

        /// Why it was rejected.
        reason: String,
    },

    /// WebSocket handshake or I/O error.
    #[error(transparent)]
    WebSocket(#[from] tungstenite::Error),
}

impl From<ConnectError> for TransportError {
    fn from(err: ConnectError) -> Self {
        TransportError::Connect(err.to_string())
    }
}

/// Problem while upgrading an HTTP request to a WebSocket.
#[derive(Debug, Error)]
pub enum UpgradeError {
    /// Upgrades are only valid on `GET`.
    #[error("upgrade requires GET, got {0}")]
    Method(hyper::Method),

    /// A required handshake header is missing or malformed.
    #[error("missing or invalid `{0}` header")]
    Header(&'static str),

    /// Only protocol version 13 is spoken.
    #[error("unsupported WebSocket version")]
    Version,

    /// The request carried no upgrade handle (already taken, or not HTTP/1.1).
    #[error("request is not upgradable")]
    NotUpgradable,

    /// Hyper failed to hand over the upgraded connection.
    #[error("upgrade failed: {0}")]
    Hyper(#[from] hyper::Error),
}

/// Map a tungstenite failure into the transport vocabulary.
///
/// `limit` is the payload limit the socket was configured with, reported back
/// when the peer exceeds it.
#[must_use]
pub fn transport_error(error: tungstenite::Error, limit: usize) -> TransportError {
    match error {
        tungstenite::Error::Capacity(_) => TransportError::PayloadTooLarge { limit },
        tungstenite::Error::Io(e) => TransportError::Io(e.to_string()),
        tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
            TransportError::Closed
        }
        other => TransportError::Protocol(other.to_string()),
    }
}
