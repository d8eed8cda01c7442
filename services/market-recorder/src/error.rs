//! Error taxonomy for exchange connectivity
//!
//! `FeedError` covers everything between the socket and a typed message.
//! Every variant is local to one symbol's worker; none of them is fatal to
//! the process. `is_retryable` separates faults worth a reconnect from
//! ones that will repeat forever (bad request, unknown symbol).

use thiserror::Error;
use types::errors::ParseError;

/// Network, protocol and decode faults seen by an ingestion worker.
#[derive(Error, Debug)]
pub enum FeedError {
    #[error("Connection failed: {0}")]
    Connect(String),

    #[error("Request timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("Stream closed by remote: {0}")]
    Closed(String),

    #[error("Malformed message: {0}")]
    Decode(String),

    #[error("Invalid value: {0}")]
    Value(#[from] ParseError),
}

impl FeedError {
    /// Whether retrying the same request can succeed.
    ///
    /// 4xx responses other than 408/418/429 mean the request itself is
    /// wrong. Decode errors apply to one message only and are skipped, not
    /// retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            FeedError::Connect(_)
            | FeedError::Timeout(_)
            | FeedError::WebSocket(_)
            | FeedError::Closed(_) => true,
            FeedError::Http { status, .. } => {
                *status >= 500 || matches!(status, 408 | 418 | 429)
            }
            FeedError::Decode(_) | FeedError::Value(_) => false,
        }
    }

    /// Short label for metrics and log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            FeedError::Connect(_) => "connect",
            FeedError::Timeout(_) => "timeout",
            FeedError::Http { .. } => "http",
            FeedError::WebSocket(_) => "websocket",
            FeedError::Closed(_) => "closed",
            FeedError::Decode(_) => "decode",
            FeedError::Value(_) => "value",
        }
    }
}

impl From<reqwest::Error> for FeedError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            // reqwest does not expose the configured duration
            FeedError::Timeout(std::time::Duration::ZERO)
        } else if let Some(status) = err.status() {
            FeedError::Http {
                status: status.as_u16(),
                body: err.to_string(),
            }
        } else if err.is_decode() {
            FeedError::Decode(err.to_string())
        } else {
            FeedError::Connect(err.to_string())
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for FeedError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsError;
        match err {
            WsError::ConnectionClosed | WsError::AlreadyClosed => {
                FeedError::Closed(err.to_string())
            }
            WsError::Io(io) => FeedError::Connect(io.to_string()),
            other => FeedError::WebSocket(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for FeedError {
    fn from(err: serde_json::Error) -> Self {
        FeedError::Decode(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_retry_classification() {
        let server = FeedError::Http { status: 503, body: String::new() };
        let throttled = FeedError::Http { status: 429, body: String::new() };
        let bad_symbol = FeedError::Http { status: 400, body: String::new() };

        assert!(server.is_retryable());
        assert!(throttled.is_retryable());
        assert!(!bad_symbol.is_retryable());
    }

    #[test]
    fn test_decode_not_retryable() {
        let err: FeedError = serde_json::from_str::<u64>("nope").unwrap_err().into();
        assert_eq!(err.kind(), "decode");
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_parse_error_conversion() {
        let err: FeedError = ParseError::InvalidPrice("x".into()).into();
        assert!(matches!(err, FeedError::Value(_)));
        assert_eq!(err.to_string(), "Invalid value: Invalid price: x");
    }
}
