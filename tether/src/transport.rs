//! The live transport behind a channel or peer connection.
//!
//! Exactly two kinds exist, so this is a closed enum rather than a trait
//! object. The long-poll kind has a separate variant per side because the
//! server end is fed by HTTP requests while the client end drives them.

use futures::{FutureExt, future::BoxFuture};
use tether_core::{TransportError, TransportEvent, TransportKind};
use tether_http_longpoll::{connection::LongPollConnection, session::LongPollSession};
use tether_websocket::WebSocket;

/// One live transport handle.
#[derive(Debug, Clone)]
pub enum Transport {
    /// A WebSocket, either dialed or accepted.
    WebSocket(WebSocket),

    /// Server end of a long-poll session.
    PollSession(LongPollSession),

    /// Client end of a long-poll session.
    PollClient(LongPollConnection),
}

impl Transport {
    /// Which kind of transport this is.
    #[must_use]
    pub const fn kind(&self) -> TransportKind {
        match self {
            Transport::WebSocket(_) => TransportKind::Primary,
            Transport::PollSession(_) | Transport::PollClient(_) => TransportKind::Fallback,
        }
    }

    /// Whether frames can still be queued.
    #[must_use]
    pub fn is_open(&self) -> bool {
        match self {
            Transport::WebSocket(ws) => ws.is_open(),
            Transport::PollSession(session) => session.is_open(),
            Transport::PollClient(conn) => conn.is_open(),
        }
    }

    /// Queue `text` now; the returned future resolves when it is flushed.
    pub fn queue_frame(&self, text: String) -> BoxFuture<'static, Result<(), TransportError>> {
        match self {
            Transport::WebSocket(ws) => ws.queue_frame(text).boxed(),
            Transport::PollSession(session) => session.queue_frame(text).boxed(),
            Transport::PollClient(conn) => conn.queue_frame(text).boxed(),
        }
    }

    /// Next event, or `None` once the closed event has been consumed.
    pub async fn recv(&self) -> Option<TransportEvent> {
        match self {
            Transport::WebSocket(ws) => ws.recv().await,
            Transport::PollSession(session) => session.recv().await,
            Transport::PollClient(conn) => conn.recv().await,
        }
    }

    /// Orderly close behind any queued frames.
    pub fn close(&self) {
        match self {
            Transport::WebSocket(ws) => ws.close(),
            Transport::PollSession(session) => session.close(),
            Transport::PollClient(conn) => conn.close(),
        }
    }

    /// Abrupt close.
    ///
    /// Long-poll sessions drop their queue and finish on the spot. A
    /// WebSocket additionally drops the raw socket without a closing
    /// handshake, so this never waits on the peer.
    pub fn terminate(&self) {
        match self {
            Transport::WebSocket(ws) => ws.terminate(),
            Transport::PollSession(session) => session.discard(),
            Transport::PollClient(conn) => conn.terminate(),
        }
    }

    /// Stop reading incoming frames. Returns `false` for the long-poll kind,
    /// which cannot be paused.
    pub fn pause(&self) -> bool {
        match self {
            Transport::WebSocket(ws) => {
                ws.pause();
                true
            }
            Transport::PollSession(_) | Transport::PollClient(_) => false,
        }
    }

    /// Undo [`pause`](Self::pause).
    pub fn resume(&self) -> bool {
        match self {
            Transport::WebSocket(ws) => {
                ws.resume();
                true
            }
            Transport::PollSession(_) | Transport::PollClient(_) => false,
        }
    }
}
