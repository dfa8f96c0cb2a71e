//! Client side: one logical channel over whichever transport opens.
//!
//! A single engine task owns the negotiation and, once a transport is open,
//! the event loop. Handlers therefore never run concurrently for one
//! channel.
//!
//! While negotiating, nothing reaches the application. A failure of the
//! WebSocket attempt (including the server closing it during the handshake)
//! starts the long-poll attempt instead; a failure of that attempt is
//! reported once through `on_error` and the channel ends without opening.
//! In that case the phase goes straight from `Negotiating` to `Closed`
//! rather than passing through `Established`: no further attempt is made
//! either way, and `Closed` also makes later sends fail instead of queueing.

use core::{
    fmt,
    sync::atomic::{AtomicBool, Ordering},
};
use std::sync::Arc;

use parking_lot::Mutex;
use tether_core::{
    CloseReason, ConnectionPhase, Slot, TransportConfig, TransportError, TransportEvent,
    TransportKind,
};
use tether_http_longpoll::{client::polling_url, connection::LongPollConnection};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::{error::ChannelError, transport::Transport};

/// What [`ClientChannel::open`] needs besides the address.
#[derive(Debug, Clone, Default)]
pub struct ChannelOptions {
    /// Sent with every handshake and long-poll request (cookies,
    /// authorization, ...).
    pub headers: Vec<(String, String)>,

    /// Transport preference and limits.
    pub config: TransportConfig,
}

impl ChannelOptions {
    /// Options with `config` and no extra headers.
    #[must_use]
    pub const fn new(config: TransportConfig) -> Self {
        Self {
            headers: Vec::new(),
            config,
        }
    }

    /// Add a pass-through header.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

/// WebSocket and long-poll endpoints derived from one address.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Endpoints {
    socket: Url,
    polling: Url,
}

impl Endpoints {
    fn resolve(address: &str, fallback_path: &str) -> Result<Self, ChannelError> {
        let invalid = |reason: String| ChannelError::InvalidAddress(reason);

        let mut socket = Url::parse(address).map_err(|e| invalid(e.to_string()))?;
        let scheme = match socket.scheme() {
            "ws" | "http" => "ws",
            "wss" | "https" => "wss",
            other => return Err(invalid(format!("unsupported scheme {other}"))),
        };
        socket
            .set_scheme(scheme)
            .map_err(|()| invalid(format!("cannot use scheme {scheme}")))?;

        let polling = polling_url(address, fallback_path).map_err(|e| invalid(e.to_string()))?;
        Ok(Self { socket, polling })
    }
}

enum Command {
    Send(String),
    Close,
}

/// A client connection that negotiates between a WebSocket and HTTP
/// long-polling.
///
/// Clones share the same channel.
#[derive(Clone)]
pub struct ClientChannel {
    inner: Arc<Inner>,
}

struct Inner {
    phase: Mutex<ConnectionPhase>,
    opened: AtomicBool,
    live: Mutex<Option<Transport>>,
    commands_tx: async_channel::Sender<Command>,
    commands_rx: async_channel::Receiver<Command>,
    on_open: Slot<TransportKind>,
    on_message: Slot<String>,
    on_error: Slot<TransportError>,
    on_close: Slot<CloseReason>,
    cancel: CancellationToken,
}

impl ClientChannel {
    /// A channel that has not been opened yet.
    #[must_use]
    pub fn new() -> Self {
        let (commands_tx, commands_rx) = async_channel::unbounded();
        Self {
            inner: Arc::new(Inner {
                phase: Mutex::new(ConnectionPhase::Negotiating),
                opened: AtomicBool::new(false),
                live: Mutex::new(None),
                commands_tx,
                commands_rx,
                on_open: Slot::new(),
                on_message: Slot::new(),
                on_error: Slot::new(),
                on_close: Slot::new(),
                cancel: CancellationToken::new(),
            }),
        }
    }

    /// Called once, with the kind of transport that opened.
    pub fn on_open(&self, handler: impl Fn(TransportKind) + Send + Sync + 'static) {
        self.inner.on_open.set(handler);
    }

    /// Called for every incoming message.
    pub fn on_message(&self, handler: impl Fn(String) + Send + Sync + 'static) {
        self.inner.on_message.set(handler);
    }

    /// Called when the channel fails. Terminal; no close follows.
    pub fn on_error(&self, handler: impl Fn(TransportError) + Send + Sync + 'static) {
        self.inner.on_error.set(handler);
    }

    /// Called when an open channel closes. Terminal.
    pub fn on_close(&self, handler: impl Fn(CloseReason) + Send + Sync + 'static) {
        self.inner.on_close.set(handler);
    }

    /// Drop every installed handler.
    pub fn remove_all_listeners(&self) {
        self.inner.on_open.clear();
        self.inner.on_message.clear();
        self.inner.on_error.clear();
        self.inner.on_close.clear();
    }

    /// Current lifecycle phase.
    #[must_use]
    pub fn phase(&self) -> ConnectionPhase {
        *self.inner.phase.lock()
    }

    /// The kind of the live transport, if one is open.
    #[must_use]
    pub fn transport_kind(&self) -> Option<TransportKind> {
        self.inner.live.lock().as_ref().map(Transport::kind)
    }

    /// Whether a transport is open and accepting frames.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.phase() == ConnectionPhase::Established
            && self.inner.live.lock().as_ref().is_some_and(Transport::is_open)
    }

    /// Start negotiating toward `address` (`ws`, `wss`, `http` or `https`).
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// * [`ChannelError::AlreadyOpen`] on a second call.
    /// * [`ChannelError::Closed`] if the channel was closed first.
    /// * [`ChannelError::InvalidAddress`] if `address` is not usable.
    pub fn open(&self, address: &str, options: ChannelOptions) -> Result<(), ChannelError> {
        if self.inner.opened.swap(true, Ordering::AcqRel) {
            return Err(ChannelError::AlreadyOpen);
        }
        if self.phase() == ConnectionPhase::Closed {
            return Err(ChannelError::Closed);
        }

        let endpoints = Endpoints::resolve(address, &options.config.fallback_path)?;
        tokio::spawn(self.clone().run(endpoints, options));
        Ok(())
    }

    /// Queue `text` for the peer.
    ///
    /// Before the channel opens, text is held and delivered in order by
    /// whichever transport wins.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::Closed`] once the channel is closing or closed.
    pub fn send(&self, text: impl Into<String>) -> Result<(), ChannelError> {
        if self.phase() == ConnectionPhase::Closed {
            return Err(ChannelError::Closed);
        }
        self.inner
            .commands_tx
            .try_send(Command::Send(text.into()))
            .map_err(|_| ChannelError::Closed)
    }

    /// Close the channel.
    ///
    /// An open channel closes in an orderly way and reports `on_close`. A
    /// channel that is still negotiating abandons its attempt silently.
    pub fn close(&self) {
        let mut phase = self.inner.phase.lock();
        match *phase {
            ConnectionPhase::Negotiating => {
                *phase = ConnectionPhase::Closed;
                drop(phase);
                tracing::debug!("channel closed while negotiating");
                self.inner.cancel.cancel();
                self.inner.commands_tx.close();
            }
            ConnectionPhase::Established => {
                drop(phase);
                if self.inner.commands_tx.try_send(Command::Close).is_ok() {
                    self.inner.commands_tx.close();
                }
            }
            ConnectionPhase::Closed => {}
        }
    }

    /// Stop reading incoming frames until [`resume`](Self::resume).
    ///
    /// # Errors
    ///
    /// * [`ChannelError::PauseUnsupported`] on a long-poll transport.
    /// * [`ChannelError::NotOpen`] / [`ChannelError::Closed`] without a live
    ///   transport.
    pub fn pause(&self) -> Result<(), ChannelError> {
        self.with_live(Transport::pause)
    }

    /// Resume reading after [`pause`](Self::pause).
    ///
    /// # Errors
    ///
    /// As for [`pause`](Self::pause).
    pub fn resume(&self) -> Result<(), ChannelError> {
        self.with_live(Transport::resume)
    }

    fn with_live(&self, op: impl FnOnce(&Transport) -> bool) -> Result<(), ChannelError> {
        let live = self.inner.live.lock();
        let Some(transport) = live.as_ref() else {
            return Err(match self.phase() {
                ConnectionPhase::Closed => ChannelError::Closed,
                ConnectionPhase::Negotiating | ConnectionPhase::Established => {
                    ChannelError::NotOpen
                }
            });
        };

        if op(transport) {
            Ok(())
        } else {
            Err(ChannelError::PauseUnsupported(transport.kind()))
        }
    }

    fn advance(&self, next: ConnectionPhase) -> bool {
        let mut phase = self.inner.phase.lock();
        if phase.can_advance_to(next) {
            *phase = next;
            true
        } else {
            false
        }
    }

    async fn run(self, endpoints: Endpoints, options: ChannelOptions) {
        if let Some(transport) = self.negotiate(&endpoints, &options).await {
            self.drive(&transport).await;
        }
        self.inner.live.lock().take();
        self.inner.commands_tx.close();
    }

    async fn negotiate(&self, endpoints: &Endpoints, options: &ChannelOptions) -> Option<Transport> {
        let mut kind = options.config.preferred_kind();

        loop {
            tracing::debug!(%kind, "opening transport");
            let attempt = tokio::select! {
                biased;
                () = self.inner.cancel.cancelled() => return None,
                attempt = dial(kind, endpoints, options) => attempt,
            };

            match attempt {
                Ok(transport) => {
                    if !self.advance(ConnectionPhase::Established) {
                        transport.terminate();
                        return None;
                    }
                    *self.inner.live.lock() = Some(transport.clone());
                    tracing::info!(%kind, "channel open");
                    self.inner.on_open.emit(kind);
                    return Some(transport);
                }
                Err(error) => {
                    if let Some(next) = kind.fallback() {
                        tracing::warn!("{kind} failed before opening, trying {next}: {error}");
                        kind = next;
                        continue;
                    }

                    if self.advance(ConnectionPhase::Closed) {
                        tracing::error!("no transport could be opened: {error}");
                        self.inner.on_error.emit(error);
                    }
                    return None;
                }
            }
        }
    }

    async fn drive(&self, transport: &Transport) {
        let mut closing = false;

        loop {
            tokio::select! {
                command = self.inner.commands_rx.recv(), if !closing => match command {
                    Ok(Command::Send(text)) => drop(transport.queue_frame(text)),
                    Ok(Command::Close) | Err(_) => {
                        closing = true;
                        transport.close();
                    }
                },
                event = transport.recv() => match event {
                    Some(TransportEvent::Message(text)) => {
                        self.inner.on_message.emit(text);
                    }
                    Some(TransportEvent::Error(error)) => {
                        transport.terminate();
                        if self.advance(ConnectionPhase::Closed) {
                            tracing::warn!(kind = %transport.kind(), "channel failed: {error}");
                            self.inner.on_error.emit(error);
                        }
                        break;
                    }
                    Some(TransportEvent::Closed(reason)) => {
                        self.finish_closed(reason);
                        break;
                    }
                    None => {
                        self.finish_closed(CloseReason::abnormal("transport ended"));
                        break;
                    }
                },
            }
        }
    }

    fn finish_closed(&self, reason: CloseReason) {
        if self.advance(ConnectionPhase::Closed) {
            tracing::info!(%reason, "channel closed");
            self.inner.on_close.emit(reason);
        }
    }
}

impl Default for ClientChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ClientChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientChannel")
            .field("phase", &self.phase())
            .field("transport", &self.transport_kind())
            .finish_non_exhaustive()
    }
}

async fn dial(
    kind: TransportKind,
    endpoints: &Endpoints,
    options: &ChannelOptions,
) -> Result<Transport, TransportError> {
    match kind {
        TransportKind::Primary => tether_websocket::client::connect(
            endpoints.socket.as_str(),
            &options.headers,
            options.config.max_payload,
        )
        .await
        .map(Transport::WebSocket)
        .map_err(TransportError::from),
        TransportKind::Fallback => {
            LongPollConnection::open(endpoints.polling.clone(), &options.headers)
                .await
                .map(Transport::PollClient)
                .map_err(TransportError::from)
        }
    }
}
