//! Error types for the HTTP long-poll transport.

use http::{Method, StatusCode};
use tether_core::TransportError;
use thiserror::Error;

/// Errors while processing a long-poll request on the server.
///
/// Each maps onto the HTTP status the client receives.
#[derive(Debug, Error)]
pub enum ServerError {
    /// The `sid` parameter is missing or malformed.
    #[error("missing or invalid session ID")]
    InvalidSessionId,

    /// No session exists for the given ID.
    #[error("session not found")]
    SessionNotFound,

    /// Another poll for the same session is still outstanding.
    #[error("overlapping poll")]
    PollInProgress,

    /// The body is not a packet array.
    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    /// The body could not be read.
    #[error("body read error: {0}")]
    BodyRead(String),

    /// The body exceeds the advertised limit.
    #[error("request body exceeds {limit} bytes")]
    BodyTooLarge {
        /// The advertised `maxPayload`.
        limit: usize,
    },

    /// The session has already closed.
    #[error("session closed")]
    SessionClosed,

    /// The server is shutting down and accepts no new work.
    #[error("server shutting down")]
    ShuttingDown,

    /// The request is outside the fallback path.
    #[error("not found")]
    NotFound,

    /// Unsupported HTTP method.
    #[error("method {0} not allowed")]
    MethodNotAllowed(Method),
}

impl ServerError {
    /// HTTP status reported for this error.
    #[must_use]
    pub fn status(&self) -> StatusCode {
        match self {
            Self::InvalidSessionId
            | Self::SessionNotFound
            | Self::PollInProgress
            | Self::MalformedPayload(_)
            | Self::BodyRead(_) => StatusCode::BAD_REQUEST,
            Self::BodyTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            Self::SessionClosed => StatusCode::GONE,
            Self::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::MethodNotAllowed(_) => StatusCode::METHOD_NOT_ALLOWED,
        }
    }
}

/// Errors while talking to a long-poll server as a client.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The address could not be turned into a polling URL.
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    /// A pass-through header could not be encoded.
    #[error("invalid header {name}: {reason}")]
    InvalidHeader {
        /// Header name as supplied by the caller.
        name: String,

        /// Why it was rejected.
        reason: String,
    },

    /// HTTP request failed.
    #[error("HTTP request error: {0}")]
    Request(#[from] reqwest::Error),

    /// Server returned an unexpected status code.
    #[error("unexpected status {status}: {body}")]
    UnexpectedStatus {
        /// The HTTP status code.
        status: u16,

        /// The response body as a string.
        body: String,
    },

    /// A response body could not be decoded.
    #[error("decode error: {0}")]
    Decode(#[from] serde_json::Error),

    /// The server handed out a malformed session ID.
    #[error("invalid session ID {0:?}")]
    InvalidSessionId(String),
}

impl ClientError {
    /// Map onto the transport vocabulary, given the server's advertised
    /// payload limit.
    #[must_use]
    pub fn to_transport(&self, max_payload: usize) -> TransportError {
        match self {
            Self::InvalidAddress(_) | Self::InvalidHeader { .. } => {
                TransportError::Connect(self.to_string())
            }
            Self::Request(e) if e.is_connect() => TransportError::Connect(e.to_string()),
            Self::Request(e) => TransportError::Io(e.to_string()),
            Self::UnexpectedStatus { status: 413, .. } => TransportError::PayloadTooLarge {
                limit: max_payload,
            },
            Self::UnexpectedStatus { status: 410, .. } => TransportError::Closed,
            Self::UnexpectedStatus { .. } | Self::Decode(_) | Self::InvalidSessionId(_) => {
                TransportError::Protocol(self.to_string())
            }
        }
    }
}

impl From<ClientError> for TransportError {
    fn from(err: ClientError) -> Self {
        err.to_transport(tether_core::config::DEFAULT_MAX_PAYLOAD)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses_follow_the_protocol_table() {
        assert_eq!(ServerError::PollInProgress.status(), StatusCode::BAD_REQUEST);
        assert_eq!(ServerError::SessionClosed.status(), StatusCode::GONE);
        assert_eq!(
            ServerError::BodyTooLarge { limit: 1 }.status(),
            StatusCode::PAYLOAD_TOO_LARGE
        );
        assert_eq!(
            ServerError::ShuttingDown.status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn payload_rejection_reports_the_limit() {
        let err = ClientError::UnexpectedStatus {
            status: 413,
            body: String::new(),
        };
        assert_eq!(
            err.to_transport(64),
            TransportError::PayloadTooLarge { limit: 64 }
        );
    }
}
