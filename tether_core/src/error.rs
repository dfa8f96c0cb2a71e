//! Error types shared by every transport.
//!
//! These are `Clone` because a single failure may have to be reported to
//! several parties (for example, every pending send callback of a
//! connection that closed).

use thiserror::Error;

use crate::event::CloseReason;

/// A failure of a live or opening transport.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The transport could not be opened.
    #[error("connection failed: {0}")]
    Connect(String),

    /// A frame exceeded the configured maximum payload.
    #[error("payload exceeds the {limit} byte limit")]
    PayloadTooLarge {
        /// The configured limit.
        limit: usize,
    },

    /// The peer sent something the transport does not understand.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// The network failed underneath the transport.
    #[error("I/O error: {0}")]
    Io(String),

    /// The transport is already closed.
    #[error("transport closed")]
    Closed,
}

/// Why a particular send never reached the network.
///
/// Delivered only through that send's completion callback.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SendError {
    /// The connection closed before the frame was flushed.
    #[error("connection closed before flush: {0}")]
    Closed(CloseReason),

    /// The transport failed while flushing the frame.
    #[error("flush failed: {0}")]
    Flush(#[from] TransportError),
}
