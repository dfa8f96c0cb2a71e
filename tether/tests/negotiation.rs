//! Client negotiation against a real acceptor: WebSocket first, long-poll
//! fallback, and what the application sees in each case.

#![allow(clippy::expect_used, clippy::unwrap_used, missing_docs)]

mod common;

use common::{Client, ClientEvent, config, hang_up_on_upgrades, init_tracing, serve};
use tether::{ChannelOptions, ChannelError, ConnectionPhase, TransportKind};
use testresult::TestResult;

#[tokio::test]
async fn websocket_round_trip() -> TestResult {
    init_tracing();
    let server = serve(config(), true).await?;

    let (client, kind) = Client::open(&server.address, ChannelOptions::new(config())).await?;
    assert_eq!(kind, TransportKind::Primary);
    assert_eq!(client.channel.transport_kind(), Some(TransportKind::Primary));
    assert!(client.channel.is_open());

    client.channel.send("hello")?;
    assert_eq!(client.messages(1).await?, vec!["hello".to_string()]);

    let peer = server.next_peer().await?;
    assert_eq!(peer.kind(), TransportKind::Primary);
    Ok(())
}

#[tokio::test]
async fn falls_back_to_polling_when_upgrades_are_refused() -> TestResult {
    init_tracing();
    let server = serve(config().with_polling_only(true), true).await?;

    let client = Client::new();
    client.channel.send("before 1")?;
    client.channel.send("before 2")?;
    client
        .channel
        .open(&server.address, ChannelOptions::new(config()))?;

    assert_eq!(client.next().await?, ClientEvent::Open(TransportKind::Fallback));
    client.channel.send("after")?;

    assert_eq!(
        client.messages(3).await?,
        vec!["before 1", "before 2", "after"]
    );
    assert_eq!(
        client.channel.pause(),
        Err(ChannelError::PauseUnsupported(TransportKind::Fallback))
    );

    let peer = server.next_peer().await?;
    assert_eq!(peer.kind(), TransportKind::Fallback);
    client.assert_quiet().await?;
    Ok(())
}

#[tokio::test]
async fn hang_up_during_the_handshake_falls_back() -> TestResult {
    init_tracing();
    let server = serve(config(), true).await?;
    let address = hang_up_on_upgrades(server.acceptor.local_addr()).await?;

    let client = Client::new();
    client.channel.send("queued")?;
    client.channel.open(&address, ChannelOptions::new(config()))?;

    assert_eq!(client.next().await?, ClientEvent::Open(TransportKind::Fallback));
    assert_eq!(client.messages(1).await?, vec!["queued".to_string()]);
    client.assert_quiet().await?;

    let peer = server.next_peer().await?;
    assert_eq!(peer.kind(), TransportKind::Fallback);
    Ok(())
}

#[tokio::test]
async fn forced_fallback_skips_the_upgrade() -> TestResult {
    init_tracing();
    let server = serve(config(), true).await?;

    let options = ChannelOptions::new(config().with_force_fallback(true));
    let (client, kind) = Client::open(&server.address, options).await?;
    assert_eq!(kind, TransportKind::Fallback);

    client.channel.send("polled")?;
    assert_eq!(client.messages(1).await?, vec!["polled".to_string()]);
    Ok(())
}

#[tokio::test]
async fn exhausted_fallback_reports_a_single_error() -> TestResult {
    init_tracing();
    // No long-poll listener: the polling request lands on the pass-through
    // handler and gets a 404.
    let server = serve(config().with_fallback_enabled(false), true).await?;

    let client = Client::new();
    let options = ChannelOptions::new(config().with_force_fallback(true));
    client.channel.open(&server.address, options)?;

    assert!(matches!(client.next().await?, ClientEvent::Error(_)));
    client.assert_quiet().await?;
    assert_eq!(client.channel.phase(), ConnectionPhase::Closed);
    assert_eq!(client.channel.send("too late"), Err(ChannelError::Closed));
    Ok(())
}

#[tokio::test]
async fn orderly_close_is_reported_once() -> TestResult {
    init_tracing();
    let server = serve(config(), true).await?;
    let (client, _) = Client::open(&server.address, ChannelOptions::new(config())).await?;
    let peer = server.next_peer().await?;

    let (closed_tx, closed_rx) = async_channel::bounded(1);
    peer.on_close(move |reason| drop(closed_tx.try_send(reason)));

    client.channel.close();
    match client.next().await? {
        ClientEvent::Close(reason) => assert!(reason.is_clean()),
        other => return Err(format!("expected close, got {other:?}").into()),
    }
    client.assert_quiet().await?;

    let server_side = tokio::time::timeout(common::WAIT, closed_rx.recv()).await??;
    assert!(server_side.is_clean());
    assert!(!peer.is_open());
    Ok(())
}

#[tokio::test]
async fn server_close_reaches_a_polling_client() -> TestResult {
    init_tracing();
    let server = serve(config(), false).await?;
    let options = ChannelOptions::new(config().with_force_fallback(true));
    let (client, _) = Client::open(&server.address, options).await?;
    let peer = server.next_peer().await?;

    peer.send_async("goodbye").await?;
    peer.close();

    assert_eq!(client.messages(1).await?, vec!["goodbye".to_string()]);
    match client.next().await? {
        ClientEvent::Close(reason) => assert!(reason.is_clean()),
        other => return Err(format!("expected close, got {other:?}").into()),
    }
    Ok(())
}

#[tokio::test]
async fn headers_reach_the_connection_handler() -> TestResult {
    init_tracing();
    let server = serve(config(), false).await?;

    let (seen_tx, seen_rx) = async_channel::bounded(2);
    server.acceptor.on_connection(move |_peer, request| {
        let value = request
            .headers
            .get("x-user")
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);
        drop(seen_tx.try_send(value));
    });

    let ws = ChannelOptions::new(config()).with_header("x-user", "ada");
    let (_ws_client, _) = Client::open(&server.address, ws).await?;
    let polling = ChannelOptions::new(config().with_force_fallback(true)).with_header("x-user", "ada");
    let (_poll_client, _) = Client::open(&server.address, polling).await?;

    for _ in 0..2 {
        let seen = tokio::time::timeout(common::WAIT, seen_rx.recv()).await??;
        assert_eq!(seen.as_deref(), Some("ada"));
    }
    Ok(())
}

#[tokio::test]
async fn paused_websocket_holds_messages_until_resumed() -> TestResult {
    init_tracing();
    let server = serve(config(), false).await?;
    let (client, _) = Client::open(&server.address, ChannelOptions::new(config())).await?;
    let peer = server.next_peer().await?;

    client.channel.pause()?;
    peer.send_async("held").await?;
    client.assert_quiet().await?;

    client.channel.resume()?;
    assert_eq!(client.messages(1).await?, vec!["held".to_string()]);
    Ok(())
}
