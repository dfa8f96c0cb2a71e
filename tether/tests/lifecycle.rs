//! Server-side lifecycle: send callbacks, forced termination and acceptor
//! shutdown.

#![allow(clippy::expect_used, clippy::unwrap_used, missing_docs)]

mod common;

use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_tungstenite::{WebSocketStream, tokio::TokioAdapter};
use common::{Client, ClientEvent, WAIT, config, init_tracing, serve};
use tether::{ChannelOptions, PeerConnection, SendError, TransportConfig, transport::Transport};
use tether_http_longpoll::{client::polling_url, connection::LongPollConnection};
use tether_websocket::{WebSocket, client::socket_config};
use testresult::TestResult;
use tokio::{
    io::AsyncWriteExt,
    time::{sleep, timeout},
};
use tungstenite::protocol::Role;

fn counting(counter: &Arc<AtomicUsize>) -> impl FnOnce(Result<(), SendError>) + Send + 'static {
    let counter = counter.clone();
    move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    }
}

async fn wait_for(counter: &AtomicUsize, expected: usize) -> TestResult {
    timeout(WAIT, async {
        while counter.load(Ordering::SeqCst) < expected {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await?;
    assert_eq!(counter.load(Ordering::SeqCst), expected);
    Ok(())
}

#[tokio::test]
async fn terminate_resolves_pending_sends_and_closes_the_client() -> TestResult {
    init_tracing();
    let server = serve(config(), false).await?;
    let (client, _) = Client::open(&server.address, ChannelOptions::new(config())).await?;
    let peer = server.next_peer().await?;

    let failed = Arc::new(AtomicUsize::new(0));
    for i in 0..5 {
        let failed = failed.clone();
        peer.send(format!("m{i}"), move |result| {
            assert!(matches!(result, Err(SendError::Closed(_))));
            failed.fetch_add(1, Ordering::SeqCst);
        });
    }

    peer.terminate();
    assert!(!peer.is_open());
    assert_eq!(peer.pending_sends(), 0);
    assert_eq!(failed.load(Ordering::SeqCst), 5);

    // A dropped socket reaches the client as a read error or an unclean
    // close, never both.
    match client.next().await? {
        ClientEvent::Close(reason) => assert!(!reason.is_clean()),
        ClientEvent::Error(_) => {}
        other => return Err(format!("expected a terminal event, got {other:?}").into()),
    }
    client.assert_quiet().await?;
    Ok(())
}

#[tokio::test]
async fn polling_peer_that_vanishes_fails_the_unflushed_send() -> TestResult {
    init_tracing();
    let config = config().with_poll_timeout(Duration::from_millis(300));
    let server = serve(config.clone(), false).await?;

    let url = polling_url(&server.address, &config.fallback_path)?;
    let client = LongPollConnection::open(url, &[]).await?;
    let peer = server.next_peer().await?;

    let (closed_tx, closed_rx) = async_channel::bounded(1);
    peer.on_close(move |reason| drop(closed_tx.try_send(reason)));

    // Stop polling without telling the server, then let any poll that was
    // already held run out.
    client.terminate();
    sleep(Duration::from_millis(350)).await;

    let outcome = timeout(WAIT, peer.send_async("unheard")).await?;
    assert!(matches!(outcome, Err(SendError::Closed(_))));

    let reason = timeout(WAIT, closed_rx.recv()).await??;
    assert!(!reason.is_clean());
    assert_eq!(peer.pending_sends(), 0);
    assert!(!peer.is_open());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn closing_the_acceptor_terminates_every_connection() -> TestResult {
    init_tracing();
    let server = serve(config(), false).await?;

    let mut clients = Vec::new();
    for _ in 0..100 {
        let (client, _) = Client::open(&server.address, ChannelOptions::new(config())).await?;
        clients.push(client);
    }

    let mut peers = Vec::new();
    for _ in 0..100 {
        peers.push(server.next_peer().await?);
    }
    assert_eq!(server.acceptor.connection_count(), 100);

    // Pause ten clients so their sends stay in flight.
    let settled = Arc::new(AtomicUsize::new(0));
    for (client, peer) in clients.iter().zip(&peers).take(10) {
        client.channel.pause()?;
        peer.send("x".repeat(64 * 1024), counting(&settled));
    }

    // One connection closes naturally while the acceptor shuts down.
    clients[50].channel.close();
    server.acceptor.close().await;

    assert_eq!(server.acceptor.connection_count(), 0);
    for peer in &peers {
        assert!(!peer.is_open());
        assert_eq!(peer.pending_sends(), 0);
    }
    wait_for(&settled, 10).await?;
    Ok(())
}

#[tokio::test]
async fn passthrough_and_cors_share_the_port() -> TestResult {
    init_tracing();
    let server = serve(TransportConfig::default(), false).await?;
    let base = format!("http://{}", server.acceptor.local_addr());
    let http = reqwest::Client::new();

    let health = http.get(format!("{base}/health")).send().await?;
    assert_eq!(health.status(), reqwest::StatusCode::OK);
    assert_eq!(health.text().await?, "ok");

    let missing = http.get(format!("{base}/nope")).send().await?;
    assert_eq!(missing.status(), reqwest::StatusCode::NOT_FOUND);

    let handshake = http
        .get(format!("{base}/engine.io/?transport=polling"))
        .header("origin", "https://app.example")
        .send()
        .await?;
    assert_eq!(handshake.status(), reqwest::StatusCode::OK);
    let headers = handshake.headers();
    assert_eq!(
        headers.get("access-control-allow-origin").map(|v| v.as_bytes()),
        Some(&b"https://app.example"[..])
    );
    assert_eq!(
        headers.get("access-control-allow-credentials").map(|v| v.as_bytes()),
        Some(&b"true"[..])
    );
    assert!(headers.contains_key("x-session-id"));

    server.next_peer().await?;
    Ok(())
}

#[tokio::test]
async fn upgrades_are_refused_when_serving_polling_only() -> TestResult {
    init_tracing();
    let server = serve(TransportConfig::default().with_polling_only(true), false).await?;

    let refused =
        tether_websocket::client::connect(&server.address, &[], TransportConfig::default().max_payload)
            .await;
    assert!(refused.is_err());
    assert_eq!(server.acceptor.connection_count(), 0);
    Ok(())
}

#[tokio::test]
async fn terminate_after_a_stalled_close_drops_the_socket() -> TestResult {
    init_tracing();
    // Nothing reads the client half, so once the pipe is full the close
    // frame can never be written.
    let (mut client, server) = tokio::io::duplex(1024);
    let stream = WebSocketStream::from_raw_socket(
        TokioAdapter::new(server),
        Role::Server,
        Some(socket_config(4096)),
    )
    .await;
    let peer = PeerConnection::new(Transport::WebSocket(WebSocket::spawn(stream, 4096)));
    peer.start();

    // 4 byte header + 1020 byte payload fills the pipe exactly.
    timeout(WAIT, peer.send_async("z".repeat(1020))).await??;

    let closes = Arc::new(AtomicUsize::new(0));
    peer.on_close({
        let closes = closes.clone();
        move |_| {
            closes.fetch_add(1, Ordering::SeqCst);
        }
    });

    peer.close();
    sleep(Duration::from_millis(100)).await;
    assert_eq!(closes.load(Ordering::SeqCst), 0);

    peer.terminate();
    assert!(!peer.is_open());
    assert_eq!(closes.load(Ordering::SeqCst), 1);
    assert_eq!(peer.pending_sends(), 0);

    // Writes only fail once the server half has been dropped.
    timeout(Duration::from_secs(2), async {
        while client.write_all(b"x").await.is_ok() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await?;
    Ok(())
}
