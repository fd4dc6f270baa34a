//! Danmaku error types.

use thiserror::Error;

/// Crate-specific result type.
pub type Result<T> = std::result::Result<T, DanmakuError>;

/// Errors that can occur while running a danmaku session.
#[derive(Error, Debug)]
pub enum DanmakuError {
    /// Credentials are missing, invalid or were rejected by the handshake.
    /// Never retried.
    #[error("Authentication error: {0}")]
    Auth(String),

    /// Transient transport failure (connect, read, write, discovery).
    #[error("Network error: {0}")]
    Network(String),

    /// A single frame could not be parsed. The session keeps running.
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    /// The caller tried to operate on a session that is not connected.
    #[error("Not connected")]
    NotConnected,

    /// A well-formed frame carried a payload we could not interpret.
    #[error("Decode warning: {0}")]
    Decode(String),

    /// An outbound chat message was refused before sending.
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// The platform rejected an outbound chat message.
    #[error("Send rejected (code {code}): {message}")]
    Send { code: i64, message: String },

    /// The operation was cancelled by `disconnect()`.
    #[error("Operation cancelled")]
    Cancelled,

    /// HTTP errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl DanmakuError {
    /// Create an authentication error.
    pub fn auth(msg: impl Into<String>) -> Self {
        Self::Auth(msg.into())
    }

    /// Create a network error.
    pub fn network(msg: impl Into<String>) -> Self {
        Self::Network(msg.into())
    }

    /// Create a malformed frame error.
    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::MalformedFrame(msg.into())
    }

    /// Create a decode warning.
    pub fn decode(msg: impl Into<String>) -> Self {
        Self::Decode(msg.into())
    }

    /// Whether the reconnect loop may try again after this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Network(_) | Self::Http(_) | Self::Io(_))
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for DanmakuError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::Network(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(DanmakuError::network("reset").is_retryable());
        assert!(!DanmakuError::auth("expired").is_retryable());
        assert!(!DanmakuError::NotConnected.is_retryable());
        assert!(!DanmakuError::malformed("short").is_retryable());
    }

    #[test]
    fn test_error_display() {
        let err = DanmakuError::Send {
            code: 10030,
            message: "too fast".to_string(),
        };
        assert_eq!(err.to_string(), "Send rejected (code 10030): too fast");
    }
}
