//! Dialing a WebSocket server.

use async_tungstenite::tokio::connect_async_with_config;
use tungstenite::{
    client::IntoClientRequest,
    http::{HeaderName, HeaderValue},
    protocol::WebSocketConfig,
};

use crate::{error::ConnectError, websocket::WebSocket};

/// Socket configuration with both the message and the frame limit set to
/// `max_payload`.
#[must_use]
pub fn socket_config(max_payload: usize) -> WebSocketConfig {
    let mut config = WebSocketConfig::default();
    config.max_message_size = Some(max_payload);
    config.max_frame_size = Some(max_payload);
    config
}

/// Connect to `address` (a `ws://` URL), sending `headers` with the
/// handshake request.
///
/// # Errors
///
/// Returns [`ConnectError`] if a header is invalid or the handshake fails.
pub async fn connect(
    address: &str,
    headers: &[(String, String)],
    max_payload: usize,
) -> Result<WebSocket, ConnectError> {
    let mut request = address.into_client_request()?;
    for (name, value) in headers {
        let header_name =
            HeaderName::from_bytes(name.as_bytes()).map_err(|e| ConnectError::InvalidHeader {
                name: name.clone(),
                reason: e.to_string(),
            })?;
        let header_value = HeaderValue::from_str(value).map_err(|e| ConnectError::InvalidHeader {
            name: name.clone(),
            reason: e.to_string(),
        })?;
        request.headers_mut().append(header_name, header_value);
    }

    let (stream, response) =
        connect_async_with_config(request, Some(socket_config(max_payload))).await?;
    tracing::info!(status = %response.status(), "WebSocket connected to {address}");

    Ok(WebSocket::spawn(stream, max_payload))
}
