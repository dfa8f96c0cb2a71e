//! Shared harness for the channel and acceptor tests.

#![allow(dead_code, clippy::expect_used, clippy::unwrap_used, missing_docs)]

use std::{net::SocketAddr, sync::OnceLock, time::Duration};

use bytes::Bytes;
use http::{Request, Response, StatusCode};
use http_body_util::Full;
use hyper::body::Incoming;
use tether::{
    ChannelOptions, ClientChannel, CloseReason, ConnectionAcceptor, PeerConnection,
    TransportConfig, TransportError, TransportKind,
};
use testresult::TestResult;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    time::timeout,
};

pub const WAIT: Duration = Duration::from_secs(5);

pub fn init_tracing() {
    static ONCE: OnceLock<()> = OnceLock::new();
    ONCE.get_or_init(|| {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .with_test_writer()
            .init();
    });
}

pub fn config() -> TransportConfig {
    TransportConfig::default().with_poll_timeout(Duration::from_millis(500))
}

// ─── Server Harness ──────────────────────────────────────────────────────────

pub struct Server {
    pub acceptor: ConnectionAcceptor,
    pub peers: async_channel::Receiver<PeerConnection>,
    pub address: String,
}

impl Server {
    pub async fn next_peer(&self) -> TestResult<PeerConnection> {
        Ok(timeout(WAIT, self.peers.recv()).await??)
    }
}

async fn health(request: Request<Incoming>) -> Response<Full<Bytes>> {
    let status = if request.uri().path() == "/health" {
        StatusCode::OK
    } else {
        StatusCode::NOT_FOUND
    };
    Response::builder()
        .status(status)
        .body(Full::new(Bytes::from_static(b"ok")))
        .unwrap()
}

/// Bind an acceptor that hands out every peer and, when `echo` is set,
/// sends each message straight back.
pub async fn serve(config: TransportConfig, echo: bool) -> TestResult<Server> {
    let acceptor = ConnectionAcceptor::builder(config)
        .passthrough(health)
        .bind("127.0.0.1:0".parse()?)
        .await?;

    let (peers_tx, peers) = async_channel::unbounded();
    acceptor.on_connection(move |peer, _request| {
        if echo {
            let replier = peer.clone();
            peer.on_message(move |text| replier.send(text, |_| {}));
        }
        drop(peers_tx.try_send(peer));
    });

    let address = format!("ws://{}/", acceptor.local_addr());
    Ok(Server {
        acceptor,
        peers,
        address,
    })
}

/// Listen on a fresh port, hang up on every WebSocket handshake once its
/// head has arrived, and relay every other connection to `upstream`.
pub async fn hang_up_on_upgrades(upstream: SocketAddr) -> TestResult<String> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let address = format!("ws://{}/", listener.local_addr()?);

    tokio::spawn(async move {
        while let Ok((mut inbound, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut head = Vec::new();
                let mut buf = [0u8; 1024];
                while !head.windows(4).any(|w| w == b"\r\n\r\n") {
                    match inbound.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => head.extend_from_slice(&buf[..n]),
                    }
                }

                let upgrade = String::from_utf8_lossy(&head)
                    .to_ascii_lowercase()
                    .contains("upgrade: websocket");
                if upgrade {
                    return;
                }

                let Ok(mut outbound) = TcpStream::connect(upstream).await else {
                    return;
                };
                if outbound.write_all(&head).await.is_ok() {
                    drop(tokio::io::copy_bidirectional(&mut inbound, &mut outbound).await);
                }
            });
        }
    });

    Ok(address)
}

// ─── Client Harness ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    Open(TransportKind),
    Message(String),
    Error(TransportError),
    Close(CloseReason),
}

pub struct Client {
    pub channel: ClientChannel,
    pub events: async_channel::Receiver<ClientEvent>,
}

impl Client {
    pub fn new() -> Self {
        let channel = ClientChannel::new();
        let (tx, events) = async_channel::unbounded();

        let open = tx.clone();
        channel.on_open(move |kind| drop(open.try_send(ClientEvent::Open(kind))));
        let message = tx.clone();
        channel.on_message(move |text| drop(message.try_send(ClientEvent::Message(text))));
        let error = tx.clone();
        channel.on_error(move |e| drop(error.try_send(ClientEvent::Error(e))));
        channel.on_close(move |reason| drop(tx.try_send(ClientEvent::Close(reason))));

        Self { channel, events }
    }

    pub async fn next(&self) -> TestResult<ClientEvent> {
        Ok(timeout(WAIT, self.events.recv()).await??)
    }

    /// Open toward `address` and wait for the open event.
    pub async fn open(address: &str, options: ChannelOptions) -> TestResult<(Self, TransportKind)> {
        let client = Self::new();
        client.channel.open(address, options)?;
        match client.next().await? {
            ClientEvent::Open(kind) => Ok((client, kind)),
            other => Err(format!("expected open, got {other:?}").into()),
        }
    }

    /// Collect `count` messages, failing on any other event.
    pub async fn messages(&self, count: usize) -> TestResult<Vec<String>> {
        let mut received = Vec::with_capacity(count);
        while received.len() < count {
            match self.next().await? {
                ClientEvent::Message(text) => received.push(text),
                other => return Err(format!("unexpected event {other:?}").into()),
            }
        }
        Ok(received)
    }

    /// Nothing else arrives within a short grace period.
    pub async fn assert_quiet(&self) -> TestResult {
        match timeout(Duration::from_millis(200), self.events.recv()).await {
            Err(_) | Ok(Err(_)) => Ok(()),
            Ok(Ok(event)) => Err(format!("unexpected event {event:?}").into()),
        }
    }
}
