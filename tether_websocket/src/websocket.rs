//! # WebSocket connection driver
//!
//! A [`WebSocket`] is a cheap, cloneable handle to a socket owned by one
//! background task. The handle talks to that task over a command queue and
//! reads what it produces from an event queue:
//!
//! ```text
//!             commands (send / close)
//!   handle ─────────────────────────────▶ ┌─────────────┐
//!                                         │ driver task │ ◀──▶ socket
//!   handle ◀───────────────────────────── └─────────────┘
//!             TransportEvent (message / error / closed)
//! ```
//!
//! Each send carries a oneshot that resolves once the frame has been written
//! and flushed, which is what the higher layers report to their callers.
//! The event stream always ends with exactly one [`TransportEvent::Closed`].

use core::{
    fmt,
    sync::atomic::{AtomicBool, Ordering},
};
use std::sync::Arc;

use async_tungstenite::WebSocketStream;
use futures::{AsyncRead, AsyncWrite, SinkExt, StreamExt, channel::oneshot};
use tether_core::{CloseReason, TransportError, TransportEvent, event::decode_text};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tungstenite::Message;

use crate::error::transport_error;

enum Command {
    Send {
        text: String,
        flushed: oneshot::Sender<Result<(), TransportError>>,
    },
    Close,
}

/// Handle to a WebSocket driven by a background task.
#[derive(Clone)]
pub struct WebSocket {
    inner: Arc<Inner>,
}

struct Inner {
    chan_id: u64,
    commands: mpsc::UnboundedSender<Command>,
    events: async_channel::Receiver<TransportEvent>,
    paused: watch::Sender<bool>,
    cancel: CancellationToken,
    open: Arc<AtomicBool>,
}

impl WebSocket {
    /// Take ownership of an established stream and start driving it.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn spawn<T>(stream: WebSocketStream<T>, max_payload: usize) -> Self
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let chan_id = rand::random::<u64>();
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (event_tx, events) = async_channel::unbounded();
        let (paused, paused_rx) = watch::channel(false);
        let cancel = CancellationToken::new();
        let open = Arc::new(AtomicBool::new(true));

        let driver = Driver {
            chan_id,
            max_payload,
            commands: command_rx,
            events: event_tx,
            paused: paused_rx,
            cancel: cancel.clone(),
            open: open.clone(),
        };
        tokio::spawn(driver.run(stream));

        Self {
            inner: Arc::new(Inner {
                chan_id,
                commands,
                events,
                paused,
                cancel,
                open,
            }),
        }
    }

    /// Random identifier used to correlate log lines for this socket.
    #[must_use]
    pub fn chan_id(&self) -> u64 {
        self.inner.chan_id
    }

    /// Whether the socket can still carry frames.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.inner.open.load(Ordering::Acquire)
    }

    /// Write one text frame and wait until it has been flushed.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Closed`] if the socket is closing or gone,
    /// or the underlying write failure.
    pub async fn send_frame(&self, text: String) -> Result<(), TransportError> {
        self.queue_frame(text).await
    }

    /// Queue a text frame now and return a future that resolves once it has
    /// been flushed. Frames queued from one task are written in call order.
    pub fn queue_frame(
        &self,
        text: String,
    ) -> impl Future<Output = Result<(), TransportError>> + Send + 'static {
        let queued = if self.is_open() {
            let (flushed, rx) = oneshot::channel();
            self.inner
                .commands
                .send(Command::Send { text, flushed })
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
        self.inner.events.recv().await.ok()
    }

    /// Start the closing handshake. Frames already queued are written first.
    pub fn close(&self) {
        self.inner.open.store(false, Ordering::Release);
        if self.inner.commands.send(Command::Close).is_err() {
            tracing::trace!(chan_id = self.inner.chan_id, "close on finished socket");
        }
    }

    /// Drop the socket immediately, without a closing handshake.
    pub fn terminate(&self) {
        self.inner.open.store(false, Ordering::Release);
        self.inner.cancel.cancel();
    }

    /// Stop reading from the socket. Writes continue.
    pub fn pause(&self) {
        self.inner.paused.send_replace(true);
    }

    /// Resume reading after [`pause`](Self::pause).
    pub fn resume(&self) {
        self.inner.paused.send_replace(false);
    }
}

impl fmt::Debug for WebSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebSocket")
            .field("chan_id", &self.inner.chan_id)
            .field("open", &self.is_open())
            .field("paused", &*self.inner.paused.borrow())
            .finish_non_exhaustive()
    }
}

struct Driver {
    chan_id: u64,
    max_payload: usize,
    commands: mpsc::UnboundedReceiver<Command>,
    events: async_channel::Sender<TransportEvent>,
    paused: watch::Receiver<bool>,
    cancel: CancellationToken,
    open: Arc<AtomicBool>,
}

impl Driver {
    async fn run<T>(mut self, mut ws: WebSocketStream<T>)
    where
        T: AsyncRead + AsyncWrite + Unpin,
    {
        let chan_id = self.chan_id;
        let mut closing = false;
        let mut watching_pause = true;
        let mut remote_close: Option<CloseReason> = None;

        let reason = loop {
            let reading = closing || !*self.paused.borrow();

            tokio::select! {
                biased;

                () = self.cancel.cancelled() => {
                    tracing::debug!(chan_id, "socket terminated");
                    break CloseReason::discarded();
                }

                command = self.commands.recv(), if !closing => match command {
                    Some(Command::Send { text, flushed }) => {
                        let result = tokio::select! {
                            biased;
                            () = self.cancel.cancelled() => Err(TransportError::Closed),
                            sent = ws.send(Message::text(text)) => {
                                sent.map_err(|e| transport_error(e, self.max_payload))
                            }
                        };

                        // Receiver may have given up; the outcome is still logged below.
                        drop(flushed.send(result.clone()));

                        if let Err(error) = result {
                            if self.cancel.is_cancelled() {
                                break CloseReason::discarded();
                            }
                            tracing::warn!(chan_id, %error, "write failed");
                            self.emit(TransportEvent::Error(error.clone())).await;
                            break CloseReason::from_error(&error);
                        }
                    }
                    Some(Command::Close) | None => {
                        closing = true;
                        self.open.store(false, Ordering::Release);
                        let sent = tokio::select! {
                            biased;
                            () = self.cancel.cancelled() => {
                                tracing::debug!(chan_id, "socket terminated while closing");
                                break CloseReason::discarded();
                            }
                            sent = ws.close(None) => sent,
                        };
                        if let Err(e) = sent {
                            tracing::debug!(chan_id, error = %e, "close handshake failed");
                            break CloseReason::abnormal(e.to_string());
                        }
                    }
                },

                changed = self.paused.changed(), if watching_pause => {
                    if changed.is_err() {
                        watching_pause = false;
                    }
                }

                frame = ws.next(), if reading => match frame {
                    Some(Ok(Message::Text(text))) => {
                        if !closing {
                            self.emit(TransportEvent::Message(text.as_str().to_owned())).await;
                        }
                    }
                    Some(Ok(Message::Binary(bytes))) => {
                        if !closing {
                            self.emit(TransportEvent::Message(decode_text(&bytes))).await;
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        tracing::debug!(chan_id, ?frame, "peer closed");
                        closing = true;
                        self.open.store(false, Ordering::Release);
                        remote_close = Some(match frame {
                            Some(frame) => CloseReason::remote(
                                Some(u16::from(frame.code)),
                                frame.reason.as_str(),
                            ),
                            None => CloseReason::normal(),
                        });
                    }
                    Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => {}
                    Some(Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed)) | None => {
                        break remote_close.take().unwrap_or_else(|| {
                            if closing {
                                CloseReason::normal()
                            } else {
                                CloseReason::abnormal("connection dropped")
                            }
                        });
                    }
                    Some(Err(e)) => {
                        if let Some(reason) = remote_close.take() {
                            break reason;
                        }
                        let error = transport_error(e, self.max_payload);
                        if closing {
                            break CloseReason::from_error(&error);
                        }
                        tracing::warn!(chan_id, %error, "read failed");
                        self.emit(TransportEvent::Error(error.clone())).await;
                        break CloseReason::from_error(&error);
                    }
                }
            }
        };

        self.open.store(false, Ordering::Release);
        drop(ws);
        self.commands.close();

        tracing::debug!(chan_id, %reason, "socket closed");
        self.emit(TransportEvent::Closed(reason)).await;
        self.events.close();
    }

    async fn emit(&self, event: TransportEvent) {
        if self.events.send(event).await.is_err() {
            tracing::trace!(chan_id = self.chan_id, "event dropped: no receiver");
        }
    }
}
