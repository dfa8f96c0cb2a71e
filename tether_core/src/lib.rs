//! # Tether Core
//!
//! Transport-agnostic building blocks shared by the WebSocket transport,
//! the HTTP long-poll transport, and the client/server components built
//! on top of them.
//!
//! Nothing in this crate performs I/O. It defines:
//!
//! - [`TransportKind`] and [`ConnectionPhase`], the vocabulary of negotiation
//! - [`TransportEvent`] and [`CloseReason`], what a live transport reports
//! - [`TransportConfig`], the explicit configuration threaded through constructors
//! - [`PendingSends`], the sequence-numbered send-completion bookkeeping
//! - [`Slot`], a single replaceable event listener

pub mod config;
pub mod error;
pub mod event;
pub mod kind;
pub mod listener;
pub mod pending;

pub use config::TransportConfig;
pub use error::{SendError, TransportError};
pub use event::{CloseReason, TransportEvent};
pub use kind::{ConnectionPhase, TransportKind};
pub use listener::Slot;
pub use pending::PendingSends;
