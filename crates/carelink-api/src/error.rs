use std::time::Duration;

use thiserror::Error;

/// Top-level error type for the `carelink-api` crate.
///
/// Every failure the [`RequestCoordinator`](crate::RequestCoordinator)
/// surfaces is already classified into one of the first five variants, so
/// callers never need transport-specific knowledge. The remaining variants
/// cover configuration and decoding problems local to this process.
#[derive(Debug, Error)]
pub enum Error {
    // ── Classified request failures ─────────────────────────────────
    /// The server rejected the session token (HTTP 401). Stored credentials
    /// have already been cleared by the time the caller sees this.
    #[error("Session expired -- please sign in again")]
    SessionExpired,

    /// Too many requests. Carries the server's retry-after hint when one was sent.
    #[error("Too many requests -- please wait a moment and try again")]
    RateLimited { retry_after: Option<Duration> },

    /// Non-2xx response with a server-supplied (or generic) message.
    #[error("{message}")]
    Server { status: u16, message: String },

    /// Nothing came back: connection refused, DNS failure, or timeout.
    #[error("No response from server -- check your network connection")]
    NetworkUnavailable { reason: String },

    /// Superseded by a newer identical request or cancelled by the caller.
    #[error("Request was cancelled")]
    Cancelled,

    // ── Local ───────────────────────────────────────────────────────
    /// URL parsing error.
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// TLS setup or HTTP client construction failed.
    #[error("TLS error: {0}")]
    Tls(String),

    /// JSON deserialization failed, with the raw body for debugging.
    #[error("Deserialization error: {message}")]
    Deserialization { message: String, body: String },

    // ── Realtime ────────────────────────────────────────────────────
    /// WebSocket handshake or stream failure.
    #[error("WebSocket connection failed: {0}")]
    WebSocketConnect(String),
}

impl Error {
    /// Returns `true` for [`Cancelled`](Self::Cancelled). UI layers use this
    /// to suppress error toasts for superseded duplicates.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Returns `true` if the caller must re-authenticate before retrying.
    pub fn is_auth_expired(&self) -> bool {
        matches!(self, Self::SessionExpired)
    }

    /// Returns `true` if this is a transient error worth retrying later.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::RateLimited { .. } | Self::NetworkUnavailable { .. } => true,
            Self::WebSocketConnect(_) => true,
            Self::Server { status, .. } => *status >= 500,
            _ => false,
        }
    }

    /// The server's retry-after hint, if this is a rate-limit error.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }

    /// HTTP status carried by a [`Server`](Self::Server) error.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Server { status, .. } => Some(*status),
            Self::SessionExpired => Some(401),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancelled_is_not_transient() {
        assert!(Error::Cancelled.is_cancelled());
        assert!(!Error::Cancelled.is_transient());
    }

    #[test]
    fn server_errors_only_transient_for_5xx() {
        let bad_request = Error::Server {
            status: 400,
            message: "nope".into(),
        };
        let unavailable = Error::Server {
            status: 503,
            message: "down".into(),
        };
        assert!(!bad_request.is_transient());
        assert!(unavailable.is_transient());
    }

    #[test]
    fn retry_after_only_on_rate_limit() {
        let limited = Error::RateLimited {
            retry_after: Some(Duration::from_secs(7)),
        };
        assert_eq!(limited.retry_after(), Some(Duration::from_secs(7)));
        assert_eq!(Error::SessionExpired.retry_after(), None);
    }

    #[test]
    fn server_message_is_displayed_verbatim() {
        let err = Error::Server {
            status: 422,
            message: "Incident reference already exists".into(),
        };
        assert_eq!(err.to_string(), "Incident reference already exists");
    }
}
