//! # Tether
//!
//! Bidirectional text channels that survive hostile networks.
//!
//! A [`ClientChannel`] first tries a WebSocket upgrade and, if that fails
//! before the connection opens, retries once over HTTP long-polling. The
//! application sees a single event stream either way:
//!
//! ```text
//!              ┌───────────── Negotiating ─────────────┐
//!  open() ───▶ │ websocket ──error/close──▶ polling    │ ──open──▶ Established ──▶ Closed
//!              └──────────────────┬────────────────────┘
//!                                 └── polling fails too ──error──▶ Closed
//! ```
//!
//! On the server a [`ConnectionAcceptor`] listens for both kinds on one HTTP
//! port and hands every accepted connection to the application as a
//! [`PeerConnection`] together with the head of the request that opened it.
//! Anything that is neither an upgrade nor a long-poll request goes to an
//! application-supplied [`HttpHandler`].

#![forbid(unsafe_code)]

pub mod acceptor;
pub mod client;
pub mod error;
pub mod peer;
pub mod transport;

pub use acceptor::{ConnectionAcceptor, HttpHandler};
pub use client::{ChannelOptions, ClientChannel};
pub use error::{AcceptorError, ChannelError};
pub use peer::{ConnectionId, PeerConnection};
pub use tether_core::{
    CloseReason, ConnectionPhase, SendError, TransportConfig, TransportError, TransportEvent,
    TransportKind,
};
