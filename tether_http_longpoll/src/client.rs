//! Raw long-poll client operations over [`reqwest`].
//!
//! [`LongPollClient`] performs single requests: open a session, poll once,
//! post a batch. The driven connection built on top of it lives in
//! [`connection`](crate::connection).

use core::time::Duration;

use reqwest::{
    StatusCode,
    header::{CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue},
};
use url::Url;

use crate::{
    POLLING, SESSION_ID_HEADER, SESSION_PARAM, TRANSPORT_PARAM,
    error::ClientError,
    packet::{self, Handshake, Packet},
    session::SessionId,
};

/// Slack on top of the server's poll timeout before a poll request is
/// abandoned client-side.
pub const POLL_GRACE: Duration = Duration::from_secs(10);

/// Build the polling URL for a server address.
///
/// `ws`/`wss` schemes become `http`/`https`, the fallback path is appended
/// to the address path, and `transport=polling` is added to the query.
///
/// # Errors
///
/// Returns [`ClientError::InvalidAddress`] for unparsable addresses or
/// unsupported schemes.
pub fn polling_url(address: &str, fallback_path: &str) -> Result<Url, ClientError> {
    let mut url = Url::parse(address).map_err(|e| ClientError::InvalidAddress(e.to_string()))?;

    let scheme = match url.scheme() {
        "ws" | "http" => "http",
        "wss" | "https" => "https",
        other => return Err(ClientError::InvalidAddress(format!("unsupported scheme {other}"))),
    };
    url.set_scheme(scheme)
        .map_err(|()| ClientError::InvalidAddress(format!("cannot use scheme {scheme}")))?;

    let base = url.path().trim_end_matches('/').to_owned();
    let suffix = fallback_path.trim_start_matches('/');
    url.set_path(&format!("{base}/{suffix}"));
    url.query_pairs_mut().append_pair(TRANSPORT_PARAM, POLLING);

    Ok(url)
}

/// Turn pass-through `(name, value)` pairs into a header map.
///
/// # Errors
///
/// Returns [`ClientError::InvalidHeader`] for names or values that cannot be
/// sent over HTTP.
pub fn header_map(headers: &[(String, String)]) -> Result<HeaderMap, ClientError> {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        let invalid = |reason: String| ClientError::InvalidHeader {
            name: name.clone(),
            reason,
        };
        let header_name =
            HeaderName::from_bytes(name.as_bytes()).map_err(|e| invalid(e.to_string()))?;
        let header_value = HeaderValue::from_str(value).map_err(|e| invalid(e.to_string()))?;
        map.append(header_name, header_value);
    }
    Ok(map)
}

/// An open long-poll session, seen from the client.
#[derive(Debug, Clone)]
pub struct LongPollClient {
    http: reqwest::Client,
    session_url: Url,
    session_id: SessionId,
    handshake: Handshake,
}

impl LongPollClient {
    /// Open a session at `url` (see [`polling_url`]), sending `headers` with
    /// every request.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError`] if the server is unreachable, answers with a
    /// non-200 status, or returns a malformed handshake.
    pub async fn connect(url: Url, headers: &[(String, String)]) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder()
            .default_headers(header_map(headers)?)
            .build()?;

        let response = http.get(url.clone()).send().await?;
        let status = response.status();
        if status != StatusCode::OK {
            let body = response.text().await.unwrap_or_default();
            return Err(ClientError::UnexpectedStatus {
                status: status.as_u16(),
                body,
            });
        }

        let header_sid = response
            .headers()
            .get(SESSION_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);
        let handshake: Handshake = serde_json::from_slice(&response.bytes().await?)?;

        let session_id = SessionId::from_hex(&handshake.sid)
            .ok_or_else(|| ClientError::InvalidSessionId(handshake.sid.clone()))?;
        if header_sid.is_some_and(|sid| sid != handshake.sid) {
            tracing::warn!("session header disagrees with handshake body, using body");
        }

        let mut session_url = url;
        session_url
            .query_pairs_mut()
            .append_pair(SESSION_PARAM, &handshake.sid);

        tracing::info!("long-poll session {session_id} opened at {session_url}");

        Ok(Self {
            http,
            session_url,
            session_id,
            handshake,
        })
    }

    /// The session's ID.
    #[must_use]
    pub const fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// Largest batch the server accepts, in bytes.
    #[must_use]
    pub const fn max_payload(&self) -> usize {
        self.handshake.max_payload
    }

    /// How long the server holds a poll open.
    #[must_use]
    pub const fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake.poll_timeout_ms)
    }

    /// Poll once. `Ok(None)` means the poll timed out empty.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError`] on transport failure or any status other than
    /// `200`/`204`.
    pub async fn poll(&self) -> Result<Option<Vec<Packet>>, ClientError> {
        let response = self
            .http
            .get(self.session_url.clone())
            .timeout(self.poll_timeout() + POLL_GRACE)
            .send()
            .await?;

        match response.status() {
            StatusCode::NO_CONTENT => Ok(None),
            StatusCode::OK => Ok(Some(packet::decode_batch(&response.bytes().await?)?)),
            status => Err(unexpected(status, response).await),
        }
    }

    /// Post a batch of packets.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError`] on transport failure or any status other than
    /// `204`.
    pub async fn send(&self, packets: &[Packet]) -> Result<(), ClientError> {
        let body = packet::encode_batch(packets)?;
        let response = self
            .http
            .post(self.session_url.clone())
            .header(CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await?;

        match response.status() {
            StatusCode::NO_CONTENT | StatusCode::OK => Ok(()),
            status => Err(unexpected(status, response).await),
        }
    }

    /// Tell the server the session is over.
    ///
    /// # Errors
    ///
    /// As for [`send`](Self::send).
    pub async fn close(&self) -> Result<(), ClientError> {
        self.send(&[Packet::Close]).await
    }
}

async fn unexpected(status: StatusCode, response: reqwest::Response) -> ClientError {
    ClientError::UnexpectedStatus {
        status: status.as_u16(),
        body: response.text().await.unwrap_or_default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn websocket_addresses_become_polling_urls() -> Result<(), ClientError> {
        let url = polling_url("ws://localhost:8080", "/engine.io/")?;
        assert_eq!(url.as_str(), "http://localhost:8080/engine.io/?transport=polling");

        let secure = polling_url("wss://docs.example/base/", "/engine.io/")?;
        assert_eq!(
            secure.as_str(),
            "https://docs.example/base/engine.io/?transport=polling"
        );
        Ok(())
    }

    #[test]
    fn existing_query_is_kept() -> Result<(), ClientError> {
        let url = polling_url("http://h/?doc=1", "/lp/")?;
        assert_eq!(url.as_str(), "http://h/lp/?doc=1&transport=polling");
        Ok(())
    }

    #[test]
    fn unsupported_schemes_are_rejected() {
        assert!(matches!(
            polling_url("ftp://h/", "/engine.io/"),
            Err(ClientError::InvalidAddress(_))
        ));
        assert!(matches!(
            polling_url("not a url", "/engine.io/"),
            Err(ClientError::InvalidAddress(_))
        ));
    }

    #[test]
    fn header_map_rejects_bad_names() {
        let bad = [("bad name".to_owned(), "v".to_owned())];
        assert!(matches!(
            header_map(&bad),
            Err(ClientError::InvalidHeader { .. })
        ));

        let good = [("x-user".to_owned(), "ada".to_owned())];
        assert!(header_map(&good).is_ok());
    }
}
