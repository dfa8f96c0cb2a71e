//! Events reported by a live transport.

use core::fmt;

use crate::error::TransportError;

/// What a transport reports to whoever drives it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A whole text frame arrived.
    Message(String),

    /// The transport failed. A [`Closed`](TransportEvent::Closed) follows.
    Error(TransportError),

    /// The transport is closed. Always the last event.
    Closed(CloseReason),
}

/// Why a connection closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseReason {
    /// WebSocket-style close code, when one is known.
    pub code: Option<u16>,

    /// Human-readable description.
    pub description: String,
}

impl CloseReason {
    /// Close code for an orderly shutdown.
    pub const NORMAL: u16 = 1000;

    /// Close code for a connection that dropped without a close handshake.
    pub const ABNORMAL: u16 = 1006;

    /// An orderly close.
    #[must_use]
    pub fn normal() -> Self {
        Self {
            code: Some(Self::NORMAL),
            description: "transport close".to_string(),
        }
    }

    /// A close announced by the peer.
    #[must_use]
    pub fn remote(code: Option<u16>, description: impl Into<String>) -> Self {
        Self {
            code,
            description: description.into(),
        }
    }

    /// A close that dropped queued output without a handshake.
    #[must_use]
    pub fn discarded() -> Self {
        Self {
            code: Some(Self::ABNORMAL),
            description: "forced close".to_string(),
        }
    }

    /// A connection that dropped without a close handshake.
    #[must_use]
    pub fn abnormal(description: impl Into<String>) -> Self {
        Self {
            code: Some(Self::ABNORMAL),
            description: description.into(),
        }
    }

    /// A close caused by a transport error.
    #[must_use]
    pub fn from_error(error: &TransportError) -> Self {
        Self::abnormal(error.to_string())
    }

    /// Whether both sides completed an orderly close.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.code == Some(Self::NORMAL)
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "{} ({code})", self.description),
            None => f.write_str(&self.description),
        }
    }
}

/// Decode a frame to text, replacing invalid UTF-8.
///
/// Binary frames are surfaced as text so that callers never observe
/// transport-specific framing.
#[must_use]
pub fn decode_text(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}
