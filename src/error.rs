//! Unified error type for the client runtime.
//!
//! Transport and protocol failures that the reconnect machinery absorbs are
//! surfaced as events instead; this type covers the failures that reach the
//! caller.

use thiserror::Error;

/// Standard result type for aqualink operations.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Non-2xx response from a worker REST endpoint.
    #[error("worker returned {status} for {url}")]
    Http {
        status: u16,
        url: String,
        /// Parsed JSON error body, if the worker sent one.
        body: Option<serde_json::Value>,
    },

    /// Response body exceeded the configured size cap.
    #[error("response from {url} exceeded {limit} bytes")]
    ResponseTooLarge { url: String, limit: usize },

    /// Underlying HTTP transport failure (DNS, refused, timeout, aborted).
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),

    /// Malformed JSON from the worker.
    #[error("invalid JSON payload: {0}")]
    Json(#[from] serde_json::Error),

    /// WebSocket transport failure.
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Invalid input supplied by the caller (bad loop mode, bad base64, …).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Operation attempted on a destroyed player or node.
    #[error("{0} has been destroyed")]
    Destroyed(&'static str),

    /// No guild entry for a lookup that requires one.
    #[error("no player for guild {0}")]
    PlayerNotFound(String),

    /// No connected node can take the request.
    #[error("no nodes available")]
    NoNodesAvailable,

    /// File-level persistence failure.
    #[error("persistence error: {0}")]
    Io(#[from] std::io::Error),

    /// Another process (or a stale crash) holds the save-file lock.
    #[error("save file is locked by {0}")]
    SaveFileLocked(String),

    /// The operation did not complete within its deadline.
    #[error("{0} timed out")]
    Timeout(&'static str),
}

impl Error {
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// True for HTTP 404 responses, which mean the remote resource is gone.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Http { status: 404, .. })
    }

    /// True when the error body blames the session id, which forces the
    /// owning node through a fresh ready handshake.
    pub fn blames_session(&self) -> bool {
        match self {
            Self::Http { body: Some(b), .. } => b
                .get("message")
                .and_then(|m| m.as_str())
                .is_some_and(|m| m.contains("sessionId")),
            _ => false,
        }
    }
}
