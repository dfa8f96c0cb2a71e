//! Echo server.

use std::net::SocketAddr;

use anyhow::Result;
use bytes::Bytes;
use http::{Request, Response, StatusCode};
use http_body_util::Full;
use hyper::body::Incoming;
use tether::{ConnectionAcceptor, TransportConfig};
use tokio_util::sync::CancellationToken;

/// Arguments for the server command.
#[derive(Debug, clap::Parser)]
pub(crate) struct ServerArgs {
    /// Socket address to bind to
    #[arg(short, long, default_value = "0.0.0.0:8080")]
    pub(crate) listen: String,

    /// Serve HTTP long-polling only and refuse WebSocket upgrades
    #[arg(
        long,
        env = "TETHER_POLLING_ONLY",
        action = clap::ArgAction::Set,
        value_parser = crate::parse_switch,
        num_args = 0..=1,
        default_value = "false",
        default_missing_value = "true"
    )]
    pub(crate) polling_only: bool,

    /// Do not mount the long-poll listener
    #[arg(long, default_value_t = false)]
    pub(crate) no_fallback: bool,

    /// Largest accepted message, in bytes
    #[arg(long)]
    pub(crate) max_payload: Option<usize>,
}

impl ServerArgs {
    pub(crate) fn config(&self) -> TransportConfig {
        let mut config = TransportConfig::default()
            .with_polling_only(self.polling_only)
            .with_fallback_enabled(!self.no_fallback);
        if let Some(max_payload) = self.max_payload {
            config = config.with_max_payload(max_payload);
        }
        config
    }
}

/// Run the echo server until `token` is cancelled.
pub(crate) async fn run(args: ServerArgs, token: CancellationToken) -> Result<()> {
    let addr: SocketAddr = args.listen.parse()?;
    let acceptor = ConnectionAcceptor::builder(args.config())
        .passthrough(health)
        .bind(addr)
        .await?;

    acceptor.on_connection(|peer, request| {
        let conn_id = peer.id();
        tracing::info!(%conn_id, kind = %peer.kind(), uri = %request.uri, "peer connected");

        let replier = peer.clone();
        peer.on_message(move |text| {
            tracing::debug!(%conn_id, bytes = text.len(), "echo");
            replier.send(text, move |sent| {
                if let Err(e) = sent {
                    tracing::debug!(%conn_id, "echo not delivered: {e}");
                }
            });
        });
        peer.on_error(move |e| tracing::warn!(%conn_id, "peer error: {e}"));

        let owner = peer.clone();
        peer.on_close(move |reason| {
            tracing::info!(%conn_id, %reason, "peer disconnected");
            owner.remove_all_listeners();
        });
    });

    tracing::info!("tether server listening on {}", acceptor.local_addr());

    token.cancelled().await;
    tracing::info!("Shutting down server...");
    acceptor.close().await;

    Ok(())
}

#[allow(clippy::expect_used)]
async fn health(request: Request<Incoming>) -> Response<Full<Bytes>> {
    let (status, body) = if request.uri().path() == "/health" {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::NOT_FOUND, "not found")
    };

    Response::builder()
        .status(status)
        .body(Full::new(Bytes::from_static(body.as_bytes())))
        .expect("static response parts are valid")
}
