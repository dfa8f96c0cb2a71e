//! Session management for HTTP long-poll connections.
//!
//! Each client that opens a session gets a [`SessionId`] mapping to a
//! [`LongPollSession`]. There are no background reader or writer tasks: the
//! HTTP handlers push into and pull from the session's channels directly.
//!
//! ```text
//! POST ...&sid  ──► push_client_packets ──► events  ──► recv()
//! send_frame()  ──► outbound            ──► take_batch ──► GET ...&sid
//! ```
//!
//! A frame counts as flushed once it has been taken into a poll response.

use core::{
    fmt,
    sync::atomic::{AtomicBool, AtomicU8, Ordering},
    time::Duration,
};
use std::{collections::BTreeMap, sync::Arc};

use async_lock::Mutex;
use futures::channel::oneshot;
use tether_core::{CloseReason, TransportError, TransportEvent};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::{error::ServerError, packet::Packet};

/// An opaque session identifier.
///
/// Encoded as a 32-character hex string on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SessionId([u8; 16]);

impl SessionId {
    /// Generate a new random session ID.
    #[must_use]
    pub fn random() -> Self {
        Self(rand::random())
    }

    /// Encode the session ID as a hex string.
    #[must_use]
    pub fn to_hex(&self) -> String {
        use core::fmt::Write;

        let mut buf = String::with_capacity(32);
        for byte in &self.0 {
            let _ = write!(buf, "{byte:02x}");
        }
        buf
    }

    /// Decode a session ID from a hex string.
    ///
    /// Returns `None` unless the string is exactly 32 hex characters.
    #[must_use]
    pub fn from_hex(s: &str) -> Option<Self> {
        if s.len() != 32 {
            return None;
        }

        let mut bytes = [0u8; 16];
        for (byte, pair) in bytes.iter_mut().zip(s.as_bytes().chunks_exact(2)) {
            let [hi, lo] = pair else { return None };
            *byte = (hex_digit(*hi)? << 4) | hex_digit(*lo)?;
        }

        Some(Self(bytes))
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

const fn hex_digit(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

const OPEN: u8 = 0;
const CLOSING: u8 = 1;
const CLOSED: u8 = 2;

struct Outgoing {
    packet: Packet,
    flushed: Option<oneshot::Sender<Result<(), TransportError>>>,
}

/// Server-side state of one long-poll client.
///
/// Clones share the same session.
#[derive(Clone)]
pub struct LongPollSession {
    inner: Arc<Inner>,
}

struct Inner {
    id: SessionId,
    state: AtomicU8,
    polling: AtomicBool,
    last_seen: parking_lot::Mutex<Instant>,

    outbound_tx: async_channel::Sender<Outgoing>,
    outbound_rx: async_channel::Receiver<Outgoing>,

    events_tx: async_channel::Sender<TransportEvent>,
    events_rx: async_channel::Receiver<TransportEvent>,

    finished: CancellationToken,
}

impl LongPollSession {
    /// Create an open session.
    #[must_use]
    pub fn new(id: SessionId) -> Self {
        let (outbound_tx, outbound_rx) = async_channel::unbounded();
        let (events_tx, events_rx) = async_channel::unbounded();

        Self {
            inner: Arc::new(Inner {
                id,
                state: AtomicU8::new(OPEN),
                polling: AtomicBool::new(false),
                last_seen: parking_lot::Mutex::new(Instant::now()),
                outbound_tx,
                outbound_rx,
                events_tx,
                events_rx,
                finished: CancellationToken::new(),
            }),
        }
    }

    /// The session's ID.
    #[must_use]
    pub fn id(&self) -> SessionId {
        self.inner.id
    }

    /// Whether frames can still be queued.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.inner.state.load(Ordering::Acquire) == OPEN
    }

    /// Whether the session has finished.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.state.load(Ordering::Acquire) == CLOSED
    }

    /// Queue a text frame and wait until a poll response has taken it.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Closed`] if the session is closing, or
    /// finishes before the frame is polled.
    pub async fn send_frame(&self, text: String) -> Result<(), TransportError> {
        self.queue_frame(text).await
    }

    /// Queue a text frame now and return a future that resolves once a poll
    /// has carried it.
    pub fn queue_frame(
        &self,
        text: String,
    ) -> impl Future<Output = Result<(), TransportError>> + Send + 'static {
        let queued = if self.is_open() {
            let (flushed, rx) = oneshot::channel();
            self.inner
                .outbound_tx
                .try_send(Outgoing {
                    packet: Packet::Message(text),
                    flushed: Some(flushed),
                })
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

    /// Queue a `close` packet behind any pending frames. The session
    /// finishes once a poll delivers it.
    pub fn close(&self) {
        if self
            .inner
            .state
            .compare_exchange(OPEN, CLOSING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        if self
            .inner
            .outbound_tx
            .try_send(Outgoing {
                packet: Packet::Close,
                flushed: None,
            })
            .is_err()
        {
            self.finish(CloseReason::normal());
        }
    }

    /// Finish immediately, failing every queued frame.
    pub fn discard(&self) {
        self.finish(CloseReason::discarded());
    }

    /// Report `error`, then finish.
    pub fn fail(&self, error: TransportError) {
        let reason = CloseReason::from_error(&error);
        self.shut_down(reason, Some(error));
    }

    /// Finish with `reason`. Only the first call has any effect.
    pub fn finish(&self, reason: CloseReason) {
        self.shut_down(reason, None);
    }

    fn shut_down(&self, reason: CloseReason, error: Option<TransportError>) {
        if self.inner.state.swap(CLOSED, Ordering::AcqRel) == CLOSED {
            return;
        }

        tracing::debug!(session = %self.inner.id, %reason, "long-poll session finished");

        self.inner.finished.cancel();
        self.inner.outbound_tx.close();
        while let Ok(outgoing) = self.inner.outbound_rx.try_recv() {
            if let Some(flushed) = outgoing.flushed {
                drop(flushed.send(Err(TransportError::Closed)));
            }
        }

        if let Some(error) = error {
            drop(self.inner.events_tx.try_send(TransportEvent::Error(error)));
        }
        drop(self.inner.events_tx.try_send(TransportEvent::Closed(reason)));
        self.inner.events_tx.close();
    }

    /// Deliver packets from a client `POST`.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::SessionClosed`] if the session has finished.
    pub fn push_client_packets(&self, packets: Vec<Packet>) -> Result<(), ServerError> {
        self.touch();
        if self.is_closed() {
            return Err(ServerError::SessionClosed);
        }

        for packet in packets {
            match packet {
                Packet::Message(text) => {
                    if self.is_open() {
                        drop(self.inner.events_tx.try_send(TransportEvent::Message(text)));
                    }
                }
                Packet::Close => {
                    self.finish(CloseReason::normal());
                    break;
                }
                Packet::Noop => {}
            }
        }

        Ok(())
    }

    /// Hold a poll open for up to `wait`, then take everything queued.
    ///
    /// An empty batch means the poll timed out. Taking a `close` packet
    /// finishes the session.
    ///
    /// # Errors
    ///
    /// * [`ServerError::PollInProgress`] if another poll is outstanding.
    /// * [`ServerError::SessionClosed`] if the session has finished.
    pub async fn take_batch(&self, wait: Duration) -> Result<Vec<Packet>, ServerError> {
        if self.is_closed() {
            return Err(ServerError::SessionClosed);
        }
        if self.inner.polling.swap(true, Ordering::AcqRel) {
            return Err(ServerError::PollInProgress);
        }
        let _guard = PollGuard(self);

        let first = tokio::select! {
            biased;
            outgoing = self.inner.outbound_rx.recv() => {
                outgoing.map_err(|_| ServerError::SessionClosed)?
            }
            () = self.inner.finished.cancelled() => return Err(ServerError::SessionClosed),
            () = tokio::time::sleep(wait) => return Ok(Vec::new()),
        };

        let mut packets = Vec::new();
        let mut acks = Vec::new();
        let mut closing = false;
        let mut next = Some(first);
        while let Some(Outgoing { packet, flushed }) = next.take() {
            closing = packet == Packet::Close;
            packets.push(packet);
            acks.extend(flushed);
            if !closing {
                next = self.inner.outbound_rx.try_recv().ok();
            }
        }

        for ack in acks {
            drop(ack.send(Ok(())));
        }
        if closing {
            self.finish(CloseReason::normal());
        }

        Ok(packets)
    }

    /// Tear the session down once the client has neither polled nor posted
    /// for `idle`.
    pub fn spawn_watchdog(&self, idle: Duration) {
        let session = self.clone();
        tokio::spawn(async move {
            loop {
                let deadline = if session.inner.polling.load(Ordering::Acquire) {
                    Instant::now() + idle
                } else {
                    *session.inner.last_seen.lock() + idle
                };

                tokio::select! {
                    () = session.inner.finished.cancelled() => break,
                    () = tokio::time::sleep_until(deadline) => {
                        let idle_for = session.inner.last_seen.lock().elapsed();
                        if !session.inner.polling.load(Ordering::Acquire) && idle_for >= idle {
                            tracing::info!(session = %session.inner.id, "client stopped polling");
                            session.fail(TransportError::Io("poll timeout".into()));
                            break;
                        }
                    }
                }
            }
        });
    }

    fn touch(&self) {
        *self.inner.last_seen.lock() = Instant::now();
    }
}

impl fmt::Debug for LongPollSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self.inner.state.load(Ordering::Acquire) {
            OPEN => "open",
            CLOSING => "closing",
            _ => "closed",
        };
        f.debug_struct("LongPollSession")
            .field("id", &self.inner.id)
            .field("state", &state)
            .finish_non_exhaustive()
    }
}

struct PollGuard<'a>(&'a LongPollSession);

impl Drop for PollGuard<'_> {
    fn drop(&mut self) {
        self.0.touch();
        self.0.inner.polling.store(false, Ordering::Release);
    }
}

/// Thread-safe map from [`SessionId`] to [`LongPollSession`].
#[derive(Debug, Clone, Default)]
pub struct SessionStore {
    sessions: Arc<Mutex<BTreeMap<SessionId, LongPollSession>>>,
}

impl SessionStore {
    /// Create a new empty session store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a session, dropping finished ones along the way.
    pub async fn insert(&self, session: LongPollSession) {
        let mut sessions = self.sessions.lock().await;
        sessions.retain(|_, s| !s.is_closed());
        sessions.insert(session.id(), session);
    }

    /// Look up a session by ID.
    pub async fn get(&self, id: &SessionId) -> Option<LongPollSession> {
        self.sessions.lock().await.get(id).cloned()
    }

    /// Remove a session, returning it if it existed.
    pub async fn remove(&self, id: &SessionId) -> Option<LongPollSession> {
        self.sessions.lock().await.remove(id)
    }

    /// Remove every session.
    pub async fn drain(&self) -> Vec<LongPollSession> {
        let mut sessions = self.sessions.lock().await;
        core::mem::take(&mut *sessions).into_values().collect()
    }

    /// Number of tracked sessions.
    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }

    /// Whether no sessions are tracked.
    pub async fn is_empty(&self) -> bool {
        self.sessions.lock().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use testresult::TestResult;

    #[test]
    fn session_id_hex_roundtrip() {
        let id = SessionId::random();
        let hex = id.to_hex();
        assert_eq!(hex.len(), 32);
        assert_eq!(SessionId::from_hex(&hex), Some(id));
    }

    #[test]
    fn session_id_from_hex_rejects_invalid() {
        assert!(SessionId::from_hex("").is_none());
        assert!(SessionId::from_hex("too_short").is_none());
        assert!(SessionId::from_hex("zzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzz").is_none());
    }

    #[tokio::test]
    async fn poll_flushes_queued_frames_in_order() -> TestResult {
        let session = LongPollSession::new(SessionId::random());

        let first = tokio::spawn({
            let session = session.clone();
            async move { session.send_frame("a".into()).await }
        });
        let second = tokio::spawn({
            let session = session.clone();
            async move {
                tokio::task::yield_now().await;
                session.send_frame("b".into()).await
            }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        let batch = session.take_batch(Duration::from_secs(1)).await?;
        assert_eq!(
            batch,
            vec![Packet::Message("a".into()), Packet::Message("b".into())]
        );
        first.await??;
        second.await??;
        Ok(())
    }

    #[tokio::test]
    async fn empty_poll_times_out_with_no_packets() -> TestResult {
        let session = LongPollSession::new(SessionId::random());
        let batch = session.take_batch(Duration::from_millis(10)).await?;
        assert!(batch.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn overlapping_polls_are_rejected() -> TestResult {
        let session = LongPollSession::new(SessionId::random());
        let holder = tokio::spawn({
            let session = session.clone();
            async move { session.take_batch(Duration::from_millis(200)).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(matches!(
            session.take_batch(Duration::from_millis(10)).await,
            Err(ServerError::PollInProgress)
        ));
        assert!(holder.await??.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn close_is_delivered_then_finishes() -> TestResult {
        let session = LongPollSession::new(SessionId::random());
        session.close();
        assert!(!session.is_open());

        let batch = session.take_batch(Duration::from_secs(1)).await?;
        assert_eq!(batch, vec![Packet::Close]);
        assert!(session.is_closed());
        assert_eq!(
            session.recv().await,
            Some(TransportEvent::Closed(CloseReason::normal()))
        );
        assert_eq!(session.recv().await, None);
        Ok(())
    }

    #[tokio::test]
    async fn discard_fails_unflushed_frames() -> TestResult {
        let session = LongPollSession::new(SessionId::random());
        let pending = tokio::spawn({
            let session = session.clone();
            async move { session.send_frame("never".into()).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        session.discard();
        assert_eq!(pending.await?, Err(TransportError::Closed));
        assert!(matches!(
            session.take_batch(Duration::from_millis(10)).await,
            Err(ServerError::SessionClosed)
        ));
        Ok(())
    }

    #[tokio::test]
    async fn client_packets_become_events() -> TestResult {
        let session = LongPollSession::new(SessionId::random());
        session.push_client_packets(vec![
            Packet::Noop,
            Packet::Message("hi".into()),
            Packet::Close,
            Packet::Message("ignored".into()),
        ])?;

        assert_eq!(
            session.recv().await,
            Some(TransportEvent::Message("hi".into()))
        );
        assert_eq!(
            session.recv().await,
            Some(TransportEvent::Closed(CloseReason::normal()))
        );
        assert!(matches!(
            session.push_client_packets(vec![]),
            Err(ServerError::SessionClosed)
        ));
        Ok(())
    }

    #[tokio::test]
    async fn idle_sessions_are_failed_by_the_watchdog() -> TestResult {
        let session = LongPollSession::new(SessionId::random());
        session.spawn_watchdog(Duration::from_millis(50));

        let event = tokio::time::timeout(Duration::from_secs(2), session.recv()).await?;
        assert_eq!(
            event,
            Some(TransportEvent::Error(TransportError::Io("poll timeout".into())))
        );
        assert!(session.is_closed());
        Ok(())
    }

    #[tokio::test]
    async fn store_prunes_finished_sessions_on_insert() {
        let store = SessionStore::new();
        let stale = LongPollSession::new(SessionId::random());
        store.insert(stale.clone()).await;
        stale.discard();

        let fresh = LongPollSession::new(SessionId::random());
        store.insert(fresh.clone()).await;

        assert_eq!(store.len().await, 1);
        assert!(store.get(&fresh.id()).await.is_some());
        assert!(store.get(&stale.id()).await.is_none());
    }
}
