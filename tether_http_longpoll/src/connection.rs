//! Client-side long-poll connection driven by background tasks.
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │                   LongPollConnection                       │
//! │                                                            │
//! │  send_frame(text) ──► outbound ──► sender_task             │
//! │                                      POST ...&sid ───────► │
//! │                                                            │
//! │  recv() ◄── events ◄── poll_task                           │
//! │                          GET ...&sid ◄───────────────────  │
//! └────────────────────────────────────────────────────────────┘
//! ```
//!
//! The sender batches whatever is queued into one `POST`, bounded by the
//! encoded size the server accepts; a frame is flushed once the server has
//! acknowledged the `POST` carrying it.

use core::{
    fmt,
    sync::atomic::{AtomicU8, Ordering},
};
use std::sync::Arc;

use futures::channel::oneshot;
use tether_core::{CloseReason, TransportError, TransportEvent};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::{
    client::LongPollClient,
    error::ClientError,
    packet::{self, Packet},
};

const OPEN: u8 = 0;
const CLOSING: u8 = 1;
const CLOSED: u8 = 2;

enum Outgoing {
    Frame {
        text: String,
        flushed: oneshot::Sender<Result<(), TransportError>>,
    },
    Close,
}

/// A long-poll session driven by a poll task and a sender task.
///
/// Clones share the same connection.
#[derive(Clone)]
pub struct LongPollConnection {
    inner: Arc<Inner>,
}

struct Inner {
    client: LongPollClient,
    state: AtomicU8,
    outbound: async_channel::Sender<Outgoing>,
    events_tx: async_channel::Sender<TransportEvent>,
    events_rx: async_channel::Receiver<TransportEvent>,
    cancel: CancellationToken,
}

impl LongPollConnection {
    /// Open a session at `url` and start polling it.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError`] if the session could not be opened.
    pub async fn open(url: Url, headers: &[(String, String)]) -> Result<Self, ClientError> {
        let client = LongPollClient::connect(url, headers).await?;
        Ok(Self::start(client))
    }

    /// Start driving an already-opened session.
    #[must_use]
    pub fn start(client: LongPollClient) -> Self {
        let (outbound, outbound_rx) = async_channel::unbounded();
        let (events_tx, events_rx) = async_channel::unbounded();

        let conn = Self {
            inner: Arc::new(Inner {
                client,
                state: AtomicU8::new(OPEN),
                outbound,
                events_tx,
                events_rx,
                cancel: CancellationToken::new(),
            }),
        };

        tokio::spawn(conn.clone().poll_loop());
        tokio::spawn(conn.clone().send_loop(outbound_rx));
        conn
    }

    /// Whether frames can still be queued.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.inner.state.load(Ordering::Acquire) == OPEN
    }

    /// Queue a text frame and wait until the server has acknowledged it.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Closed`] if the connection is closing or
    /// finishes first, or the failure of the `POST` that carried the frame.
    pub async fn send_frame(&self, text: String) -> Result<(), TransportError> {
        self.queue_frame(text).await
    }

    /// Queue a text frame now and return a future that resolves once the
    /// `POST` carrying it has been acknowledged.
    pub fn queue_frame(
        &self,
        text: String,
    ) -> impl Future<Output = Result<(), TransportError>> + Send + 'static {
        let queued = if self.is_open() {
            let (flushed, rx) = oneshot::channel();
            self.inner
                .outbound
                .try_send(Outgoing::Frame { text, flushed })
                .map(|()| rx)
                .map_err(|_| TransportError::Closed)
        } else {
            Err(TransportError::Closed)
        };

        async move { queued?.await.unwrap_or(Err(TransportError::Closed)) }
    }

    /// Wait for the next event. Returns `None` once the closed event has
    /// been consumed.
    pub async fn recv(&self) -> Option<TransportEvent> {
        self.inner.events_rx.recv().await.ok()
    }

    /// Send a `close` packet behind any queued frames, then finish.
    pub fn close(&self) {
        if self
            .inner
            .state
            .compare_exchange(OPEN, CLOSING, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
            && self.inner.outbound.try_send(Outgoing::Close).is_err()
        {
            self.finish(CloseReason::normal(), None);
        }
    }

    /// Stop immediately without telling the server.
    pub fn terminate(&self) {
        self.finish(CloseReason::discarded(), None);
    }

    fn finish(&self, reason: CloseReason, error: Option<TransportError>) {
        if self.inner.state.swap(CLOSED, Ordering::AcqRel) == CLOSED {
            return;
        }

        tracing::debug!(
            session = %self.inner.client.session_id(),
            %reason,
            "long-poll connection finished"
        );

        self.inner.cancel.cancel();
        self.inner.outbound.close();
        if let Some(error) = error {
            drop(self.inner.events_tx.try_send(TransportEvent::Error(error)));
        }
        drop(self.inner.events_tx.try_send(TransportEvent::Closed(reason)));
        self.inner.events_tx.close();
    }

    fn fail(&self, error: &ClientError) {
        if self.inner.state.load(Ordering::Acquire) == CLOSING {
            // The server tears the session down as soon as it sees our close.
            self.finish(CloseReason::normal(), None);
            return;
        }

        let error = error.to_transport(self.inner.client.max_payload());
        if error == TransportError::Closed {
            self.finish(CloseReason::abnormal("session gone"), None);
        } else {
            let reason = CloseReason::from_error(&error);
            self.finish(reason, Some(error));
        }
    }

    async fn poll_loop(self) {
        loop {
            let polled = tokio::select! {
                () = self.inner.cancel.cancelled() => break,
                polled = self.inner.client.poll() => polled,
            };

            match polled {
                Ok(None) => {}
                Ok(Some(packets)) => {
                    for packet in packets {
                        match packet {
                            Packet::Message(text) => {
                                if self.is_open() {
                                    drop(self.inner.events_tx.try_send(TransportEvent::Message(text)));
                                }
                            }
                            Packet::Close => {
                                self.finish(CloseReason::normal(), None);
                                return;
                            }
                            Packet::Noop => {}
                        }
                    }
                }
                Err(e) => {
                    if !self.inner.cancel.is_cancelled() {
                        tracing::warn!("long-poll failed: {e}");
                        self.fail(&e);
                    }
                    break;
                }
            }
        }
    }

    async fn send_loop(self, outbound: async_channel::Receiver<Outgoing>) {
        let max_payload = self.inner.client.max_payload();
        let batch_limit = packet::max_batch_len(max_payload);
        let mut carry: Option<Outgoing> = None;

        loop {
            let first = match carry.take() {
                Some(outgoing) => outgoing,
                None => tokio::select! {
                    () = self.inner.cancel.cancelled() => break,
                    next = outbound.recv() => match next {
                        Ok(outgoing) => outgoing,
                        Err(_) => break,
                    },
                },
            };

            // Batch queued frames while the encoded body stays within what the
            // server reads. A single oversized frame still goes out alone and
            // fails there.
            let mut packets = Vec::new();
            let mut acks = Vec::new();
            let mut size = 2;
            let mut closing = false;
            let mut next = Some(first);
            while let Some(outgoing) = next.take() {
                match outgoing {
                    Outgoing::Frame { text, flushed } => {
                        let frame_size = packet::message_len(&text);
                        if !packets.is_empty() && size + frame_size > batch_limit {
                            carry = Some(Outgoing::Frame { text, flushed });
                            break;
                        }
                        size += frame_size;
                        packets.push(Packet::Message(text));
                        acks.push(flushed);
                        next = outbound.try_recv().ok();
                    }
                    Outgoing::Close => {
                        packets.push(Packet::Close);
                        closing = true;
                    }
                }
            }

            // An in-flight POST is already on the wire; let it finish even if
            // the connection is torn down meanwhile.
            match self.inner.client.send(&packets).await {
                Ok(()) => {
                    for ack in acks {
                        drop(ack.send(Ok(())));
                    }
                    if closing {
                        self.finish(CloseReason::normal(), None);
                        break;
                    }
                }
                Err(error) => {
                    let reported = error.to_transport(max_payload);
                    for ack in acks {
                        drop(ack.send(Err(reported.clone())));
                    }
                    if !self.inner.cancel.is_cancelled() {
                        tracing::warn!("long-poll send failed: {error}");
                        self.fail(&error);
                    }
                    break;
                }
            }
        }

        let leftover = carry.into_iter().chain(core::iter::from_fn(|| outbound.try_recv().ok()));
        for outgoing in leftover {
            if let Outgoing::Frame { flushed, .. } = outgoing {
                drop(flushed.send(Err(TransportError::Closed)));
            }
        }
    }
}

impl fmt::Debug for LongPollConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LongPollConnection")
            .field("session", &self.inner.client.session_id())
            .field("open", &self.is_open())
            .finish_non_exhaustive()
    }
}
