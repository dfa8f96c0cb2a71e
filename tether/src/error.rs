//! Errors surfaced by channels and the acceptor.

use tether_core::{TransportError, TransportKind};
use thiserror::Error;

/// Problem with a [`ClientChannel`](crate::ClientChannel) operation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChannelError {
    /// `open` was already called on this channel.
    #[error("channel already opened")]
    AlreadyOpen,

    /// The address is not a `ws`, `wss`, `http` or `https` URL.
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    /// The channel has no live transport yet.
    #[error("channel is not open")]
    NotOpen,

    /// The channel is closed.
    #[error("channel closed")]
    Closed,

    /// The live transport cannot pause its read side.
    #[error("{0} transport cannot be paused")]
    PauseUnsupported(TransportKind),

    /// A transport failure.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Problem starting a [`ConnectionAcceptor`](crate::ConnectionAcceptor).
#[derive(Debug, Error)]
pub enum AcceptorError {
    /// The listening socket could not be bound.
    #[error("failed to bind listener: {0}")]
    Bind(#[from] std::io::Error),
}
