//! Accepting WebSocket upgrades on a hyper connection.

use async_tungstenite::{WebSocketStream, tokio::TokioAdapter};
use bytes::Bytes;
use http_body_util::Full;
use hyper::{Request, Response, upgrade::OnUpgrade};
use hyper_util::rt::TokioIo;
use tungstenite::protocol::Role;

use crate::{client::socket_config, error::UpgradeError, handshake, websocket::WebSocket};

/// An upgrade that has been answered but whose connection hyper has not yet
/// handed over.
#[derive(Debug)]
pub struct PendingUpgrade {
    on_upgrade: OnUpgrade,
    max_payload: usize,
}

/// Validate `request` and take its upgrade handle.
///
/// The returned response must be sent back to the client before
/// [`PendingUpgrade::finish`] can resolve.
///
/// # Errors
///
/// Returns [`UpgradeError`] if the request is not a valid WebSocket upgrade.
pub fn accept<B>(
    request: &mut Request<B>,
    max_payload: usize,
) -> Result<(Response<Full<Bytes>>, PendingUpgrade), UpgradeError> {
    let accept_key = handshake::validate(request)?;
    let on_upgrade = request
        .extensions_mut()
        .remove::<OnUpgrade>()
        .ok_or(UpgradeError::NotUpgradable)?;

    Ok((
        handshake::switching_protocols(&accept_key),
        PendingUpgrade {
            on_upgrade,
            max_payload,
        },
    ))
}

impl PendingUpgrade {
    /// Wait for hyper to release the connection and start driving it as a
    /// server-role WebSocket.
    ///
    /// # Errors
    ///
    /// Returns [`UpgradeError::Hyper`] if the connection was lost before the
    /// switch completed.
    pub async fn finish(self) -> Result<WebSocket, UpgradeError> {
        let upgraded = self.on_upgrade.await?;
        let io = TokioAdapter::new(TokioIo::new(upgraded));
        let stream = WebSocketStream::from_raw_socket(
            io,
            Role::Server,
            Some(socket_config(self.max_payload)),
        )
        .await;

        Ok(WebSocket::spawn(stream, self.max_payload))
    }
}
