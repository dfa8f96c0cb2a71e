//! Server-side view of one accepted connection.
//!
//! ```text
//!            send(text, cb) ──► pending[seq] = cb
//!                  │
//!                  ▼
//!   outbound ──► send_loop ──► transport.queue_frame ──► flushed? ──► pending.complete(seq)
//!
//!   transport.recv ──► recv_loop ──► on_message / on_error
//!                           │
//!                           └── Closed ──► finish ──► pending.fail_all ──► on_close
//! ```
//!
//! Whatever ends the connection first (peer close, transport failure,
//! [`terminate`](PeerConnection::terminate)) runs `finish` once. Every send
//! callback still pending at that point is failed with the close reason, so
//! each callback fires exactly once.

use core::{
    fmt,
    sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering},
};
use std::sync::Arc;

use futures::{FutureExt, StreamExt, channel::oneshot, stream::FuturesUnordered};
use parking_lot::Mutex;
use tether_core::{
    CloseReason, PendingSends, SendError, Slot, TransportError, TransportEvent, TransportKind,
};
use tokio_util::sync::CancellationToken;

use crate::transport::Transport;

const OPEN: u8 = 0;
const CLOSING: u8 = 1;
const CLOSED: u8 = 2;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identifier of an accepted connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    fn next() -> Self {
        Self(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// The raw number.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

type FinishHook = Box<dyn FnOnce(ConnectionId) + Send>;

enum Outbound {
    Frame { seq: u64, text: String },
    Close,
}

/// One accepted connection, of either transport kind.
///
/// Clones share the same connection.
#[derive(Clone)]
pub struct PeerConnection {
    inner: Arc<Inner>,
}

struct Inner {
    id: ConnectionId,
    transport: Transport,
    state: AtomicU8,
    started: AtomicBool,
    pending: PendingSends,
    outbound_tx: async_channel::Sender<Outbound>,
    outbound_rx: async_channel::Receiver<Outbound>,
    close_reason: Mutex<Option<CloseReason>>,
    finish_hooks: Mutex<Vec<FinishHook>>,
    on_message: Slot<String>,
    on_error: Slot<TransportError>,
    on_close: Slot<CloseReason>,
    cancel: CancellationToken,
}

impl PeerConnection {
    /// Wrap an accepted transport. Nothing is read or written until
    /// [`start`](Self::start).
    #[must_use]
    pub fn new(transport: Transport) -> Self {
        let (outbound_tx, outbound_rx) = async_channel::unbounded();
        Self {
            inner: Arc::new(Inner {
                id: ConnectionId::next(),
                transport,
                state: AtomicU8::new(OPEN),
                started: AtomicBool::new(false),
                pending: PendingSends::new(),
                outbound_tx,
                outbound_rx,
                close_reason: Mutex::new(None),
                finish_hooks: Mutex::new(Vec::new()),
                on_message: Slot::new(),
                on_error: Slot::new(),
                on_close: Slot::new(),
                cancel: CancellationToken::new(),
            }),
        }
    }

    /// Spawn the read and write tasks. Calling this again does nothing.
    pub fn start(&self) {
        if self.inner.started.swap(true, Ordering::AcqRel) {
            return;
        }
        tokio::spawn(self.clone().recv_loop());
        tokio::spawn(self.clone().send_loop());
    }

    /// This connection's identifier.
    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    /// The transport kind this connection runs over.
    #[must_use]
    pub fn kind(&self) -> TransportKind {
        self.inner.transport.kind()
    }

    /// Whether the connection accepts new sends.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.inner.state.load(Ordering::Acquire) == OPEN
    }

    /// Number of sends whose callback has not fired yet.
    #[must_use]
    pub fn pending_sends(&self) -> usize {
        self.inner.pending.len()
    }

    /// Handle incoming messages. Replaces any previous handler.
    pub fn on_message(&self, handler: impl Fn(String) + Send + Sync + 'static) {
        self.inner.on_message.set(handler);
    }

    /// Handle transport errors. Replaces any previous handler.
    pub fn on_error(&self, handler: impl Fn(TransportError) + Send + Sync + 'static) {
        self.inner.on_error.set(handler);
    }

    /// Handle the close of the connection. Replaces any previous handler.
    pub fn on_close(&self, handler: impl Fn(CloseReason) + Send + Sync + 'static) {
        self.inner.on_close.set(handler);
    }

    /// Drop the application's message, error and close handlers.
    ///
    /// Bookkeeping registered by the acceptor is left in place.
    pub fn remove_all_listeners(&self) {
        self.inner.on_message.clear();
        self.inner.on_error.clear();
        self.inner.on_close.clear();
    }

    /// Queue `text` and call `callback` exactly once: with `Ok(())` when the
    /// transport has flushed it, or with an error if the flush failed or the
    /// connection closed first.
    ///
    /// On a connection that is already closing the callback runs before
    /// this returns.
    pub fn send(
        &self,
        text: impl Into<String>,
        callback: impl FnOnce(Result<(), SendError>) + Send + 'static,
    ) {
        if !self.is_open() {
            callback(Err(SendError::Closed(self.close_reason())));
            return;
        }

        let seq = self.inner.pending.register(callback);
        let queued = self.inner.outbound_tx.try_send(Outbound::Frame {
            seq,
            text: text.into(),
        });
        if queued.is_err() {
            self.inner
                .pending
                .fail(seq, SendError::Closed(self.close_reason()));
        }
    }

    /// [`send`](Self::send), awaiting the outcome instead of taking a callback.
    ///
    /// # Errors
    ///
    /// Returns the [`SendError`] the callback would have received.
    pub async fn send_async(&self, text: impl Into<String>) -> Result<(), SendError> {
        let (tx, rx) = oneshot::channel();
        self.send(text, move |result| drop(tx.send(result)));
        rx.await
            .unwrap_or_else(|_| Err(SendError::Closed(CloseReason::discarded())))
    }

    /// Close in an orderly way: queued frames are flushed, then the closing
    /// handshake runs. `on_close` fires when it completes.
    pub fn close(&self) {
        if self
            .inner
            .state
            .compare_exchange(OPEN, CLOSING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        tracing::debug!(conn_id = %self.inner.id, "closing connection");
        if self.inner.outbound_tx.try_send(Outbound::Close).is_err() {
            self.inner.transport.close();
        }
    }

    /// Disconnect immediately without waiting for the peer.
    ///
    /// When this returns the connection is closed, every pending send
    /// callback has fired and `on_close` has been called.
    pub fn terminate(&self) {
        if self.inner.state.load(Ordering::Acquire) == CLOSED {
            return;
        }

        tracing::debug!(conn_id = %self.inner.id, kind = %self.kind(), "terminating connection");
        self.inner.transport.terminate();
        self.finish(CloseReason::discarded());
    }

    /// Run `hook` once the connection has finished, or right away if it
    /// already has.
    pub(crate) fn on_finished(&self, hook: impl FnOnce(ConnectionId) + Send + 'static) {
        let mut hooks = self.inner.finish_hooks.lock();
        if self.inner.state.load(Ordering::Acquire) == CLOSED {
            drop(hooks);
            hook(self.inner.id);
        } else {
            hooks.push(Box::new(hook));
        }
    }

    fn close_reason(&self) -> CloseReason {
        self.inner
            .close_reason
            .lock()
            .clone()
            .unwrap_or_else(CloseReason::normal)
    }

    fn finish(&self, reason: CloseReason) {
        if self.inner.state.swap(CLOSED, Ordering::AcqRel) == CLOSED {
            return;
        }
        *self.inner.close_reason.lock() = Some(reason.clone());

        self.inner.cancel.cancel();
        self.inner.outbound_tx.close();
        let failed = self
            .inner
            .pending
            .fail_all(&SendError::Closed(reason.clone()));

        tracing::info!(
            conn_id = %self.inner.id,
            kind = %self.kind(),
            %reason,
            failed_sends = failed,
            "connection closed"
        );

        let hooks = core::mem::take(&mut *self.inner.finish_hooks.lock());
        for hook in hooks {
            hook(self.inner.id);
        }
        self.inner.on_close.emit(reason);
    }

    async fn recv_loop(self) {
        loop {
            let event = tokio::select! {
                biased;
                () = self.inner.cancel.cancelled() => break,
                event = self.inner.transport.recv() => event,
            };

            match event {
                Some(TransportEvent::Message(text)) => {
                    self.inner.on_message.emit(text);
                }
                Some(TransportEvent::Error(error)) => {
                    tracing::warn!(conn_id = %self.inner.id, "transport error: {error}");
                    self.inner.on_error.emit(error);
                }
                Some(TransportEvent::Closed(reason)) => {
                    self.finish(reason);
                    break;
                }
                None => {
                    self.finish(CloseReason::abnormal("transport ended"));
                    break;
                }
            }
        }
    }

    async fn send_loop(self) {
        let mut in_flight = FuturesUnordered::new();
        let mut closing = false;

        loop {
            if closing && in_flight.is_empty() {
                break;
            }

            tokio::select! {
                biased;
                () = self.inner.cancel.cancelled() => break,
                Some((seq, flushed)) = in_flight.next(), if !in_flight.is_empty() => {
                    self.settle(seq, flushed);
                }
                outbound = self.inner.outbound_rx.recv(), if !closing => match outbound {
                    Ok(Outbound::Frame { seq, text }) => {
                        in_flight.push(
                            self.inner.transport.queue_frame(text).map(move |flushed| (seq, flushed)),
                        );
                    }
                    Ok(Outbound::Close) => {
                        self.inner.transport.close();
                        closing = true;
                    }
                    Err(_) => closing = true,
                },
            }
        }
    }

    fn settle(&self, seq: u64, flushed: Result<(), TransportError>) {
        match flushed {
            Ok(()) => {
                self.inner.pending.complete(seq);
            }
            Err(TransportError::Closed) => {
                self.inner
                    .pending
                    .fail(seq, SendError::Closed(self.close_reason()));
            }
            Err(error) => {
                self.inner.pending.fail(seq, SendError::Flush(error));
            }
        }
    }
}

impl fmt::Debug for PeerConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerConnection")
            .field("id", &self.inner.id)
            .field("kind", &self.kind())
            .field("open", &self.is_open())
            .field("pending_sends", &self.pending_sends())
            .finish_non_exhaustive()
    }
}
