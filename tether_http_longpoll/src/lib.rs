//! # Tether HTTP Long-Poll Transport
//!
//! The fallback transport, for networks where WebSocket upgrades are
//! blocked (restrictive proxies, corporate firewalls). It maps the
//! bidirectional text-frame stream onto HTTP request-response pairs.
//!
//! # Protocol
//!
//! Every request targets the fallback path (by default `/engine.io/`) and
//! carries `transport=polling` in its query string. Bodies are JSON arrays
//! of [`Packet`](packet::Packet)s.
//!
//! ```text
//! ┌──────────┐                                  ┌──────────┐
//! │  Client  │                                  │  Server  │
//! └────┬─────┘                                  └────┬─────┘
//!      │  GET  /engine.io/?transport=polling         │
//!      │ ─────────────────────────────────────────►  │
//!      │  200 {"sid","maxPayload","pollTimeoutMs"}   │
//!      │  X-Session-Id: <sid>                        │
//!      │ ◄─────────────────────────────────────────  │
//!      │                                             │
//!      │  POST ...&sid=<sid>                         │
//!      │  [{"type":"message","data":"hi"}]           │
//!      │ ─────────────────────────────────────────►  │
//!      │  204 No Content                             │
//!      │ ◄─────────────────────────────────────────  │
//!      │                                             │
//!      │  GET  ...&sid=<sid>                         │
//!      │ ─────────────────────────────────────────►  │
//!      │           ... (blocks) ...                  │
//!      │  200 [{"type":"message","data":"yo"}]       │
//!      │  or 204 when the poll timed out             │
//!      │ ◄─────────────────────────────────────────  │
//!      │                                             │
//!      │  POST ...&sid=<sid>  [{"type":"close"}]     │
//!      │ ─────────────────────────────────────────►  │
//! ```
//!
//! A server-side close is delivered as a `close` packet in a poll response.
//! A session whose client stops polling is torn down after twice the poll
//! timeout.
//!
//! | Status | Meaning                                               |
//! |--------|-------------------------------------------------------|
//! | 400    | missing, malformed or unknown session; overlapping poll |
//! | 404    | request outside the fallback path                     |
//! | 405    | method other than `GET`, `POST` or `OPTIONS`          |
//! | 410    | session already closed                                |
//! | 413    | body above the advertised `maxPayload`                |
//! | 503    | server shutting down                                  |

pub mod client;
pub mod connection;
pub mod cors;
pub mod error;
pub mod packet;
pub mod server;
pub mod session;

use http::Uri;

/// Session ID header name, set on the session-opening response.
pub const SESSION_ID_HEADER: &str = "x-session-id";

/// Query parameter naming the transport.
pub const TRANSPORT_PARAM: &str = "transport";

/// Value of [`TRANSPORT_PARAM`] marking a long-poll request.
pub const POLLING: &str = "polling";

/// Query parameter carrying the session ID.
pub const SESSION_PARAM: &str = "sid";

/// Whether the request URI carries `transport=polling`.
#[must_use]
pub fn is_polling_request(uri: &Uri) -> bool {
    query_param(uri, TRANSPORT_PARAM).is_some_and(|v| v == POLLING)
}

/// First value of query parameter `name`, percent-decoded.
#[must_use]
pub fn query_param(uri: &Uri, name: &str) -> Option<String> {
    let query = uri.query()?;
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(k, _)| k == name)
        .map(|(_, v)| v.into_owned())
}
