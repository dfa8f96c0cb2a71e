//! # Tether WebSocket
//!
//! The primary transport. Every socket, client or server side, is owned by
//! a single background task (see [`websocket::WebSocket`]) so that writes,
//! reads, pausing and shutdown never contend for the stream.
//!
//! * [`client::connect`] dials a `ws://` address with pass-through headers.
//! * [`handshake`] validates an HTTP/1.1 upgrade request and builds the
//!   `101 Switching Protocols` response.
//! * [`server::PendingUpgrade`] turns the upgraded hyper connection into a
//!   [`websocket::WebSocket`].

#![cfg_attr(not(windows), allow(clippy::multiple_crate_versions))] // windows-sys

pub mod client;
pub mod error;
pub mod handshake;
pub mod server;
pub mod websocket;

pub use websocket::WebSocket;
