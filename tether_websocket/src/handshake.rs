//! # Server-side upgrade handshake
//!
//! Validation of an incoming HTTP/1.1 upgrade request (RFC 6455 §4.2.1) and
//! construction of the `101 Switching Protocols` response. The request is
//! inspected in place so the caller keeps it (and its upgrade handle).

use bytes::Bytes;
use http_body_util::Full;
use hyper::{
    Method, Request, Response, StatusCode,
    header::{
        CONNECTION, HeaderMap, HeaderValue, SEC_WEBSOCKET_ACCEPT, SEC_WEBSOCKET_KEY,
        SEC_WEBSOCKET_VERSION, UPGRADE,
    },
};
use tungstenite::handshake::derive_accept_key;

use crate::error::UpgradeError;

/// Whether `headers` ask for a WebSocket upgrade.
///
/// Both `Connection: upgrade` (possibly among other tokens) and
/// `Upgrade: websocket` must be present.
#[must_use]
pub fn is_upgrade_request<B>(request: &Request<B>) -> bool {
    header_has_token(request.headers(), &CONNECTION, "upgrade")
        && header_has_token(request.headers(), &UPGRADE, "websocket")
}

fn header_has_token(headers: &HeaderMap, name: &hyper::header::HeaderName, token: &str) -> bool {
    headers
        .get_all(name)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|t| t.trim().eq_ignore_ascii_case(token))
}

/// Validate the handshake headers and return the `Sec-WebSocket-Accept`
/// value to answer with.
///
/// # Errors
///
/// Returns [`UpgradeError`] describing the first violated requirement.
pub fn validate<B>(request: &Request<B>) -> Result<String, UpgradeError> {
    if request.method() != Method::GET {
        return Err(UpgradeError::Method(request.method().clone()));
    }
    if !header_has_token(request.headers(), &CONNECTION, "upgrade") {
        return Err(UpgradeError::Header("connection"));
    }
    if !header_has_token(request.headers(), &UPGRADE, "websocket") {
        return Err(UpgradeError::Header("upgrade"));
    }
    if request
        .headers()
        .get(SEC_WEBSOCKET_VERSION)
        .is_none_or(|v| v.as_bytes() != b"13")
    {
        return Err(UpgradeError::Version);
    }

    let key = request
        .headers()
        .get(SEC_WEBSOCKET_KEY)
        .ok_or(UpgradeError::Header("sec-websocket-key"))?;

    Ok(derive_accept_key(key.as_bytes()))
}

/// Build the `101 Switching Protocols` response for a validated request.
#[must_use]
#[allow(clippy::expect_used)]
pub fn switching_protocols(accept_key: &str) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::new()));
    *response.status_mut() = StatusCode::SWITCHING_PROTOCOLS;

    let headers = response.headers_mut();
    headers.insert(CONNECTION, HeaderValue::from_static("Upgrade"));
    headers.insert(UPGRADE, HeaderValue::from_static("websocket"));
    headers.insert(
        SEC_WEBSOCKET_ACCEPT,
        HeaderValue::from_str(accept_key).expect("base64 is a valid header value"),
    );

    response
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(headers: &[(&str, &str)]) -> Request<()> {
        let mut builder = Request::builder().method(Method::GET).uri("/");
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        builder.body(()).expect("valid request")
    }

    fn upgrade_headers() -> Vec<(&'static str, &'static str)> {
        vec![
            ("connection", "keep-alive, Upgrade"),
            ("upgrade", "websocket"),
            ("sec-websocket-version", "13"),
            ("sec-websocket-key", "dGhlIHNhbXBsZSBub25jZQ=="),
        ]
    }

    #[test]
    fn derives_the_rfc_accept_key() {
        let accept = validate(&request(&upgrade_headers())).expect("valid handshake");
        assert_eq!(accept, "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
    }

    #[test]
    fn detects_upgrade_among_connection_tokens() {
        assert!(is_upgrade_request(&request(&upgrade_headers())));
        assert!(!is_upgrade_request(&request(&[("connection", "keep-alive")])));
        assert!(!is_upgrade_request(&request(&[
            ("connection", "upgrade"),
            ("upgrade", "h2c")
        ])));
    }

    #[test]
    fn rejects_missing_key() {
        let headers: Vec<_> = upgrade_headers()
            .into_iter()
            .filter(|(name, _)| *name != "sec-websocket-key")
            .collect();
        assert!(matches!(
            validate(&request(&headers)),
            Err(UpgradeError::Header("sec-websocket-key"))
        ));
    }

    #[test]
    fn rejects_old_versions() {
        let headers: Vec<_> = upgrade_headers()
            .into_iter()
            .map(|(n, v)| if n == "sec-websocket-version" { (n, "8") } else { (n, v) })
            .collect();
        assert!(matches!(
            validate(&request(&headers)),
            Err(UpgradeError::Version)
        ));
    }

    #[test]
    fn response_switches_protocols() {
        let response = switching_protocols("abc=");
        assert_eq!(response.status(), StatusCode::SWITCHING_PROTOCOLS);
        assert_eq!(
            response.headers().get(SEC_WEBSOCKET_ACCEPT),
            Some(&HeaderValue::from_static("abc="))
        );
    }
}
