//! One HTTP listener for both transport kinds.
//!
//! Every request on the port is routed by shape:
//!
//! | Request                                   | Goes to                          |
//! |-------------------------------------------|----------------------------------|
//! | query carries `transport=polling`         | long-poll handler                |
//! | WebSocket upgrade handshake               | upgrade, then a `PeerConnection` |
//! | anything else                             | the pass-through [`HttpHandler`] |
//!
//! Accepted connections are kept in a registry until they finish, so
//! [`ConnectionAcceptor::close`] can terminate whatever is still live.

use core::{
    fmt,
    future::Future,
    net::SocketAddr,
    sync::atomic::{AtomicBool, Ordering},
};
use std::{convert::Infallible, sync::Arc};

use bytes::Bytes;
use dashmap::DashMap;
use futures::future::BoxFuture;
use http::{Request, Response, StatusCode, request::Parts};
use http_body_util::Full;
use hyper::{body::Incoming, server::conn::http1, service::service_fn};
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use tether_core::{Slot, TransportConfig};
use tether_http_longpoll::{
    is_polling_request,
    server::{Accepted, LongPollHandler},
};
use tether_websocket::handshake::is_upgrade_request;
use tokio::{
    net::{TcpListener, TcpStream},
    task::{JoinHandle, JoinSet},
};
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::{
    error::AcceptorError,
    peer::{ConnectionId, PeerConnection},
    transport::Transport,
};

/// Handles every request that is not part of a transport.
///
/// Implemented for any `Fn(Request<Incoming>) -> impl Future<Output = Response<..>>`.
pub trait HttpHandler: Send + Sync + 'static {
    /// Produce a response for `request`.
    fn handle(&self, request: Request<Incoming>) -> BoxFuture<'static, Response<Full<Bytes>>>;
}

impl<F, Fut> HttpHandler for F
where
    F: Fn(Request<Incoming>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Response<Full<Bytes>>> + Send + 'static,
{
    fn handle(&self, request: Request<Incoming>) -> BoxFuture<'static, Response<Full<Bytes>>> {
        Box::pin(self(request))
    }
}

/// Answers every request with `404 Not Found`.
#[derive(Debug, Clone, Copy, Default)]
pub struct NotFound;

impl HttpHandler for NotFound {
    fn handle(&self, _request: Request<Incoming>) -> BoxFuture<'static, Response<Full<Bytes>>> {
        Box::pin(async { plain(StatusCode::NOT_FOUND, "not found") })
    }
}

/// Configures and binds a [`ConnectionAcceptor`].
pub struct AcceptorBuilder {
    config: TransportConfig,
    passthrough: Arc<dyn HttpHandler>,
}

impl AcceptorBuilder {
    /// Route ordinary requests to `handler` instead of answering `404`.
    #[must_use]
    pub fn passthrough(mut self, handler: impl HttpHandler) -> Self {
        self.passthrough = Arc::new(handler);
        self
    }

    /// Bind `addr` and start accepting.
    ///
    /// # Errors
    ///
    /// Returns [`AcceptorError::Bind`] if the address cannot be bound.
    pub async fn bind(self, addr: SocketAddr) -> Result<ConnectionAcceptor, AcceptorError> {
        let listener = TcpListener::bind(addr).await?;
        self.listen(listener)
    }

    /// Start accepting on an already-bound listener.
    ///
    /// # Errors
    ///
    /// Returns [`AcceptorError::Bind`] if the listener's address cannot be read.
    pub fn listen(self, listener: TcpListener) -> Result<ConnectionAcceptor, AcceptorError> {
        let local_addr = listener.local_addr()?;
        let cancel = CancellationToken::new();

        let longpoll = self
            .config
            .accepts_polling()
            .then(|| LongPollHandler::new(&self.config));

        let shared = Arc::new(Shared {
            config: self.config,
            local_addr,
            longpoll,
            passthrough: self.passthrough,
            registry: DashMap::new(),
            on_connection: Slot::new(),
            closed: AtomicBool::new(false),
            shutdown_done: CancellationToken::new(),
            cancel: cancel.clone(),
        });

        tracing::info!(
            %local_addr,
            upgrades = shared.config.accepts_upgrades(),
            polling = shared.longpoll.is_some(),
            "accepting connections"
        );

        let accept_task = tokio::spawn(shared.clone().accept_loop(listener));

        Ok(ConnectionAcceptor {
            shared,
            accept_task: Arc::new(Mutex::new(Some(accept_task))),
            _guard: Arc::new(cancel.drop_guard()),
        })
    }
}

impl fmt::Debug for AcceptorBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AcceptorBuilder")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Accepts upgrade and long-poll connections on one HTTP port.
///
/// Clones share the same listener. Dropping the last clone stops the accept
/// loop; [`close`](Self::close) additionally terminates live connections.
#[derive(Clone)]
pub struct ConnectionAcceptor {
    shared: Arc<Shared>,
    accept_task: Arc<Mutex<Option<JoinHandle<()>>>>,
    _guard: Arc<DropGuard>,
}

struct Shared {
    config: TransportConfig,
    local_addr: SocketAddr,
    longpoll: Option<LongPollHandler>,
    passthrough: Arc<dyn HttpHandler>,
    registry: DashMap<ConnectionId, PeerConnection>,
    on_connection: Slot<(PeerConnection, Parts)>,
    closed: AtomicBool,
    /// Cancelled once [`ConnectionAcceptor::close`] has finished its work.
    shutdown_done: CancellationToken,
    cancel: CancellationToken,
}

impl ConnectionAcceptor {
    /// Start configuring an acceptor.
    #[must_use]
    pub fn builder(config: TransportConfig) -> AcceptorBuilder {
        AcceptorBuilder {
            config,
            passthrough: Arc::new(NotFound),
        }
    }

    /// The bound address.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.shared.local_addr
    }

    /// Handle every accepted connection together with the head of the
    /// request that opened it.
    ///
    /// The handler runs before the connection starts reading, so listeners
    /// installed inside it see every message.
    pub fn on_connection(&self, handler: impl Fn(PeerConnection, Parts) + Send + Sync + 'static) {
        self.shared
            .on_connection
            .set(move |(peer, request)| handler(peer, request));
    }

    /// Number of live connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.shared.registry.len()
    }

    /// Snapshot of the live connections.
    #[must_use]
    pub fn connections(&self) -> Vec<PeerConnection> {
        self.shared
            .registry
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Stop listening and terminate every live connection.
    ///
    /// Returns once the listener has stopped and the registry is empty,
    /// for every caller, including ones that call while a shutdown is
    /// already under way.
    pub async fn close(&self) {
        if !self.shared.closed.swap(true, Ordering::AcqRel) {
            // Detached so that dropping this caller cannot strand the others.
            tokio::spawn(self.shared.clone().shut_down(self.accept_task.clone()));
        }
        self.shared.shutdown_done.cancelled().await;
    }
}

impl fmt::Debug for ConnectionAcceptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionAcceptor")
            .field("local_addr", &self.shared.local_addr)
            .field("connections", &self.shared.registry.len())
            .finish_non_exhaustive()
    }
}

impl Shared {
    async fn shut_down(self: Arc<Self>, accept_task: Arc<Mutex<Option<JoinHandle<()>>>>) {
        let _done = self.shutdown_done.clone().drop_guard();
        tracing::info!(
            local_addr = %self.local_addr,
            live = self.registry.len(),
            "shutting down acceptor"
        );

        self.cancel.cancel();
        if let Some(longpoll) = &self.longpoll {
            longpoll.close().await;
        }
        // A connection finishing on its own may still be running its hooks;
        // wait until every one has left the registry.
        while !self.registry.is_empty() {
            self.terminate_all();
            tokio::task::yield_now().await;
        }

        let accept_task = accept_task.lock().take();
        if let Some(task) = accept_task
            && let Err(e) = task.await
        {
            tracing::error!("accept loop failed: {e}");
        }
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => break,
                accepted = next_session(self.longpoll.as_ref()) => match accepted {
                    Some(Accepted { session, request }) => {
                        self.admit(Transport::PollSession(session), request);
                    }
                    None => break,
                },
                tcp = listener.accept() => match tcp {
                    Ok((stream, peer_addr)) => {
                        tracing::debug!(%peer_addr, "accepted TCP connection");
                        connections.spawn(self.clone().serve(stream));
                    }
                    Err(e) => tracing::warn!("accept failed: {e}"),
                },
                Some(joined) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(e) = joined {
                        tracing::error!("HTTP connection task failed: {e}");
                    }
                }
            }
        }

        connections.shutdown().await;
        tracing::info!(local_addr = %self.local_addr, "listener stopped");
    }

    async fn serve(self: Arc<Self>, stream: TcpStream) {
        let shared = self.clone();
        let service = service_fn(move |req| {
            let shared = shared.clone();
            async move { Ok::<_, Infallible>(shared.route(req).await) }
        });

        let conn = http1::Builder::new()
            .serve_connection(TokioIo::new(stream), service)
            .with_upgrades();

        tokio::select! {
            served = conn => {
                if let Err(e) = served {
                    tracing::debug!("HTTP connection ended: {e}");
                }
            }
            () = self.cancel.cancelled() => {}
        }
    }

    async fn route(self: Arc<Self>, mut req: Request<Incoming>) -> Response<Full<Bytes>> {
        if let Some(longpoll) = &self.longpoll
            && is_polling_request(req.uri())
        {
            return longpoll.handle(req).await;
        }

        if is_upgrade_request(&req) {
            if !self.config.accepts_upgrades() {
                return plain(StatusCode::BAD_REQUEST, "upgrades are disabled");
            }
            if self.cancel.is_cancelled() {
                return plain(StatusCode::SERVICE_UNAVAILABLE, "shutting down");
            }

            return match tether_websocket::server::accept(&mut req, self.config.max_payload) {
                Ok((response, pending)) => {
                    let (request, _body) = req.into_parts();
                    tokio::spawn(async move {
                        match pending.finish().await {
                            Ok(ws) => self.admit(Transport::WebSocket(ws), request),
                            Err(e) => tracing::warn!("WebSocket upgrade failed: {e}"),
                        }
                    });
                    response
                }
                Err(e) => {
                    tracing::debug!("rejected upgrade: {e}");
                    plain(StatusCode::BAD_REQUEST, &e.to_string())
                }
            };
        }

        self.passthrough.handle(req).await
    }

    fn admit(self: &Arc<Self>, transport: Transport, request: Parts) {
        let peer = PeerConnection::new(transport);
        let conn_id = peer.id();

        self.registry.insert(conn_id, peer.clone());
        let registry = Arc::downgrade(self);
        peer.on_finished(move |id| {
            if let Some(shared) = registry.upgrade() {
                shared.registry.remove(&id);
            }
        });

        // `close` cancels before it walks the registry, so one of the two
        // sides always sees this connection.
        if self.cancel.is_cancelled() {
            peer.terminate();
            return;
        }

        tracing::info!(
            %conn_id,
            kind = %peer.kind(),
            uri = %request.uri,
            "accepted connection"
        );

        if !self.on_connection.emit((peer.clone(), request)) {
            tracing::warn!(%conn_id, "no connection handler installed");
        }
        peer.start();
    }

    fn terminate_all(&self) {
        // Terminating runs the registry-removal hook, which must not happen
        // while an iterator holds a shard lock.
        let live: Vec<PeerConnection> = self
            .registry
            .iter()
            .map(|entry| entry.value().clone())
            .collect();

        for peer in &live {
            peer.terminate();
        }
        tracing::debug!(terminated = live.len(), "terminated live connections");
    }
}

async fn next_session(longpoll: Option<&LongPollHandler>) -> Option<Accepted> {
    match longpoll {
        Some(handler) => handler.accept().await,
        None => core::future::pending().await,
    }
}

#[allow(clippy::expect_used)]
fn plain(status: StatusCode, body: &str) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header(http::header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(Full::new(Bytes::from(body.to_owned())))
        .expect("static response parts are valid")
}

#[cfg(test)]
mod tests {
    use super::*;
    use testresult::TestResult;

    #[tokio::test]
    async fn close_stops_the_listener() -> TestResult {
        let acceptor = ConnectionAcceptor::builder(TransportConfig::default())
            .bind("127.0.0.1:0".parse()?)
            .await?;
        let addr = acceptor.local_addr();

        acceptor.close().await;
        acceptor.close().await;

        assert_eq!(acceptor.connection_count(), 0);
        assert!(tokio::net::TcpStream::connect(addr).await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn concurrent_closes_all_wait_for_the_shutdown() -> TestResult {
        let acceptor = ConnectionAcceptor::builder(TransportConfig::default())
            .bind("127.0.0.1:0".parse()?)
            .await?;
        let addr = acceptor.local_addr();

        let second = acceptor.clone();
        let (_, closed_second) = tokio::join!(acceptor.close(), async move {
            second.close().await;
            tokio::net::TcpStream::connect(addr).await.is_err()
        });

        assert!(closed_second);
        assert_eq!(acceptor.connection_count(), 0);
        Ok(())
    }

    #[test]
    fn plain_responses_carry_their_status() {
        let response = plain(StatusCode::SERVICE_UNAVAILABLE, "busy");
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
