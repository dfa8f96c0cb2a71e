//! Hyper-facing request handler for the long-poll transport.
//!
//! | Request                          | Purpose                             |
//! |----------------------------------|-------------------------------------|
//! | `GET  <path>?transport=polling`  | open a session                      |
//! | `GET  <path>?...&sid=<id>`       | long-poll for server frames         |
//! | `POST <path>?...&sid=<id>`       | deliver client frames               |
//! | `OPTIONS <path>?...`             | CORS preflight                      |
//!
//! The handler is meant to sit next to a WebSocket upgrade path on the same
//! listener; the caller routes requests here with
//! [`is_polling_request`](crate::is_polling_request). New sessions are
//! handed out through [`LongPollHandler::accept`].

use core::{
    fmt,
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};
use std::sync::Arc;

use bytes::Bytes;
use http::{
    HeaderValue, Method, Request, Response, StatusCode,
    header::{CACHE_CONTROL, CONTENT_TYPE},
    request::Parts,
};
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::body::Body;
use tether_core::{TransportConfig, TransportError};

use crate::{
    SESSION_ID_HEADER, SESSION_PARAM, cors,
    error::ServerError,
    packet::{self, Handshake, Packet},
    query_param,
    session::{LongPollSession, SessionId, SessionStore},
};

/// A session opened by a client, with the request that opened it.
#[derive(Debug)]
pub struct Accepted {
    /// The new session.
    pub session: LongPollSession,

    /// Head of the session-opening request.
    pub request: Parts,
}

/// Server-side handler state, shared across request handlers.
#[derive(Clone)]
pub struct LongPollHandler {
    inner: Arc<Inner>,
}

struct Inner {
    sessions: SessionStore,
    path: String,
    max_payload: usize,
    poll_timeout: Duration,
    closing: AtomicBool,
    accepted_tx: async_channel::Sender<Accepted>,
    accepted_rx: async_channel::Receiver<Accepted>,
}

impl LongPollHandler {
    /// Create a handler serving `config.fallback_path`.
    #[must_use]
    pub fn new(config: &TransportConfig) -> Self {
        let (accepted_tx, accepted_rx) = async_channel::unbounded();
        Self {
            inner: Arc::new(Inner {
                sessions: SessionStore::new(),
                path: config.fallback_path.clone(),
                max_payload: config.max_payload,
                poll_timeout: config.poll_timeout,
                closing: AtomicBool::new(false),
                accepted_tx,
                accepted_rx,
            }),
        }
    }

    /// Access the session store.
    #[must_use]
    pub fn sessions(&self) -> &SessionStore {
        &self.inner.sessions
    }

    /// Wait for the next newly opened session. Returns `None` after
    /// [`close`](Self::close).
    pub async fn accept(&self) -> Option<Accepted> {
        self.inner.accepted_rx.recv().await.ok()
    }

    /// Stop accepting sessions and discard every live one.
    pub async fn close(&self) {
        self.inner.closing.store(true, Ordering::Release);
        self.inner.accepted_tx.close();

        while let Ok(unclaimed) = self.inner.accepted_rx.try_recv() {
            unclaimed.session.discard();
        }
        for session in self.inner.sessions.drain().await {
            session.discard();
        }
    }

    /// Route a long-poll request. Protocol errors become status codes, so
    /// this never fails.
    pub async fn handle<B>(&self, req: Request<B>) -> Response<Full<Bytes>>
    where
        B: Body<Data = Bytes>,
        B::Error: Into<Box<dyn core::error::Error + Send + Sync>>,
    {
        let origin_headers = req.headers().clone();
        let method = req.method().clone();
        tracing::debug!("HTTP long-poll: {method} {}", req.uri());

        let mut response = match self.route(req).await {
            Ok(resp) => resp,
            Err(e) => {
                tracing::debug!("long-poll request rejected: {e}");
                error_response(&e)
            }
        };

        if method == Method::OPTIONS {
            cors::apply_preflight(&origin_headers, response.headers_mut());
        } else {
            cors::apply(&origin_headers, response.headers_mut());
        }
        response
    }

    async fn route<B>(&self, req: Request<B>) -> Result<Response<Full<Bytes>>, ServerError>
    where
        B: Body<Data = Bytes>,
        B::Error: Into<Box<dyn core::error::Error + Send + Sync>>,
    {
        if !self.serves_path(req.uri().path()) {
            return Err(ServerError::NotFound);
        }
        if req.method() == Method::OPTIONS {
            return Ok(empty(StatusCode::NO_CONTENT));
        }
        if self.inner.closing.load(Ordering::Acquire) {
            return Err(ServerError::ShuttingDown);
        }

        let sid = query_param(req.uri(), SESSION_PARAM);
        match (req.method().clone(), sid) {
            (Method::GET, None) => self.open(req).await,
            (Method::GET, Some(sid)) => self.poll(&parse_sid(&sid)?).await,
            (Method::POST, Some(sid)) => self.push(&parse_sid(&sid)?, req).await,
            (Method::POST, None) => Err(ServerError::InvalidSessionId),
            (other, _) => Err(ServerError::MethodNotAllowed(other)),
        }
    }

    fn serves_path(&self, path: &str) -> bool {
        path == self.inner.path || path == self.inner.path.trim_end_matches('/')
    }

    #[allow(clippy::expect_used)]
    async fn open<B>(&self, req: Request<B>) -> Result<Response<Full<Bytes>>, ServerError> {
        let (parts, _) = req.into_parts();

        let id = SessionId::random();
        let session = LongPollSession::new(id);
        self.inner.sessions.insert(session.clone()).await;
        session.spawn_watchdog(self.inner.poll_timeout * 2);

        let handshake = Handshake {
            sid: id.to_hex(),
            max_payload: self.inner.max_payload,
            poll_timeout_ms: u64::try_from(self.inner.poll_timeout.as_millis())
                .unwrap_or(u64::MAX),
        };
        let body = serde_json::to_vec(&handshake)
            .map_err(|e| ServerError::MalformedPayload(e.to_string()))?;

        if self
            .inner
            .accepted_tx
            .try_send(Accepted {
                session: session.clone(),
                request: parts,
            })
            .is_err()
        {
            session.discard();
            self.inner.sessions.remove(&id).await;
            return Err(ServerError::ShuttingDown);
        }

        tracing::info!("long-poll session {id} opened");

        Ok(Response::builder()
            .status(StatusCode::OK)
            .header(SESSION_ID_HEADER, id.to_hex())
            .header(CONTENT_TYPE, "application/json")
            .header(CACHE_CONTROL, "no-store")
            .body(Full::new(Bytes::from(body)))
            .expect("valid response"))
    }

    #[allow(clippy::expect_used)]
    async fn poll(&self, id: &SessionId) -> Result<Response<Full<Bytes>>, ServerError> {
        let session = self.session(id).await?;

        let batch = match session.take_batch(self.inner.poll_timeout).await {
            Err(ServerError::SessionClosed) => {
                self.inner.sessions.remove(id).await;
                return Err(ServerError::SessionClosed);
            }
            other => other?,
        };

        if batch.is_empty() {
            return Ok(empty(StatusCode::NO_CONTENT));
        }
        if session.is_closed() {
            self.inner.sessions.remove(id).await;
        }

        let body = packet::encode_batch(&batch)
            .map_err(|e| ServerError::MalformedPayload(e.to_string()))?;
        tracing::debug!("session {id}: delivering {} packet(s)", batch.len());

        Ok(Response::builder()
            .status(StatusCode::OK)
            .header(CONTENT_TYPE, "application/json")
            .header(CACHE_CONTROL, "no-store")
            .body(Full::new(Bytes::from(body)))
            .expect("valid response"))
    }

    async fn push<B>(
        &self,
        id: &SessionId,
        req: Request<B>,
    ) -> Result<Response<Full<Bytes>>, ServerError>
    where
        B: Body<Data = Bytes>,
        B::Error: Into<Box<dyn core::error::Error + Send + Sync>>,
    {
        let session = self.session(id).await?;
        let limit = self.inner.max_payload;

        // Clients never batch past the encoding of one maximal message, so a
        // larger body must carry an oversized one.
        let body = match Limited::new(req.into_body(), packet::max_batch_len(limit))
            .collect()
            .await
        {
            Ok(collected) => collected.to_bytes(),
            Err(e) if e.downcast_ref::<LengthLimitError>().is_some() => {
                return Err(self.reject_oversized(id, &session).await);
            }
            Err(e) => return Err(ServerError::BodyRead(e.to_string())),
        };

        let packets = packet::decode_batch(&body)
            .map_err(|e| ServerError::MalformedPayload(e.to_string()))?;
        let oversized = packets
            .iter()
            .any(|p| matches!(p, Packet::Message(text) if text.len() > limit));
        if oversized {
            return Err(self.reject_oversized(id, &session).await);
        }

        let pushed = session.push_client_packets(packets);
        if session.is_closed() {
            self.inner.sessions.remove(id).await;
        }
        pushed?;

        Ok(empty(StatusCode::NO_CONTENT))
    }

    async fn reject_oversized(&self, id: &SessionId, session: &LongPollSession) -> ServerError {
        let limit = self.inner.max_payload;
        tracing::warn!("session {id}: message above {limit} bytes, closing");
        session.fail(TransportError::PayloadTooLarge { limit });
        self.inner.sessions.remove(id).await;
        ServerError::BodyTooLarge { limit }
    }

    async fn session(&self, id: &SessionId) -> Result<LongPollSession, ServerError> {
        let session = self
            .inner
            .sessions
            .get(id)
            .await
            .ok_or(ServerError::SessionNotFound)?;

        if session.is_closed() {
            self.inner.sessions.remove(id).await;
            return Err(ServerError::SessionClosed);
        }
        Ok(session)
    }
}

impl fmt::Debug for LongPollHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LongPollHandler")
            .field("path", &self.inner.path)
            .field("max_payload", &self.inner.max_payload)
            .field("poll_timeout", &self.inner.poll_timeout)
            .field("closing", &self.inner.closing.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

fn parse_sid(raw: &str) -> Result<SessionId, ServerError> {
    SessionId::from_hex(raw).ok_or(ServerError::InvalidSessionId)
}

fn empty(status: StatusCode) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::new()));
    *response.status_mut() = status;
    response
}

fn error_response(err: &ServerError) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(err.to_string())));
    *response.status_mut() = err.status();
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}
