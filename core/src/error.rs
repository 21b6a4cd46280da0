//! Error types for the request engine.
//!
//! # Design
//! Every backend failure is normalized into one `FetchError` before it
//! reaches a caller. `ErrorKind` is the flat taxonomy callers match on;
//! `is_timeout_class` is the single rule that decides whether the dispatcher
//! may retry.

use thiserror::Error;

/// Flat classification of a `FetchError`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Connection,
    EmptyResponse,
    Http,
    Timeout,
    Filter,
    Decode,
    TransportUnavailable,
    Callback,
    Cancelled,
    InvalidRequest,
}

/// Errors surfaced by the dispatcher to failure callbacks and sync callers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    /// No response could be obtained from the server.
    #[error("connection failed: {0}")]
    Connection(String),

    /// The connection succeeded but produced no status line or headers.
    #[error("empty response from {url}")]
    EmptyResponse { url: String },

    /// The server answered with a status of 400 or above.
    #[error("HTTP {status}: {}", .reason.as_deref().unwrap_or("unknown status"))]
    Http {
        status: u16,
        reason: Option<String>,
        body: String,
    },

    /// The exchange did not finish within its timeout.
    #[error("request timed out: {0}")]
    Timeout(String),

    /// The streaming filter rejected a chunk or panicked.
    #[error("stream filter aborted the exchange: {0}")]
    Filter(String),

    /// The response body could not be decoded.
    #[error("failed to decode response: {0}")]
    Decode(String),

    /// The selected backend cannot run in this environment.
    #[error("transport `{backend}` is unavailable: {reason}")]
    TransportUnavailable { backend: String, reason: String },

    /// The success callback returned an error or panicked.
    #[error("completion callback failed: {0}")]
    Callback(String),

    #[error("request was cancelled")]
    Cancelled,

    /// The request could not be built (bad URL, unreadable upload, ...).
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl FetchError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            FetchError::Connection(_) => ErrorKind::Connection,
            FetchError::EmptyResponse { .. } => ErrorKind::EmptyResponse,
            FetchError::Http { .. } => ErrorKind::Http,
            FetchError::Timeout(_) => ErrorKind::Timeout,
            FetchError::Filter(_) => ErrorKind::Filter,
            FetchError::Decode(_) => ErrorKind::Decode,
            FetchError::TransportUnavailable { .. } => ErrorKind::TransportUnavailable,
            FetchError::Callback(_) => ErrorKind::Callback,
            FetchError::Cancelled => ErrorKind::Cancelled,
            FetchError::InvalidRequest(_) => ErrorKind::InvalidRequest,
        }
    }

    /// HTTP status attached to the error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            FetchError::Http { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Timeouts, gateway timeouts (504), and connection failures whose
    /// description mentions a timeout. Only these are retried.
    pub fn is_timeout_class(&self) -> bool {
        match self {
            FetchError::Timeout(_) => true,
            FetchError::Http { status, .. } => *status == 504,
            FetchError::Connection(msg) => mentions_timeout(msg),
            _ => false,
        }
    }
}

pub(crate) fn mentions_timeout(message: &str) -> bool {
    let message = message.to_ascii_lowercase();
    message.contains("timeout") || message.contains("timed out")
}
