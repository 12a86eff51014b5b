//! Error types
//!
//! A single error enum covers everything that can make a caller-initiated
//! `connect` fail. Post-open failures never surface here; they are handled by
//! the reconnection policy and reported through the connection hooks.

use thiserror::Error;

/// Realtime core error type
///
/// Variants carry strings rather than source errors so the type stays
/// `Clone`: one in-flight connect attempt hands the same result to every
/// caller waiting on it.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RealtimeError {
    /// The token provider failed
    #[error("Token provider failed: {0}")]
    Token(String),

    /// The resolved endpoint is not a usable URL
    #[error("Invalid realtime endpoint: {0}")]
    InvalidEndpoint(String),

    /// The transport failed to open or errored while opening
    #[error("Transport error: {0}")]
    Transport(String),

    /// The transport closed before the handshake completed
    #[error("Realtime connection closed before opening (code {code})")]
    ClosedBeforeOpen { code: u16 },

    /// The attempt was abandoned by a manual disconnect
    #[error("Connection attempt aborted")]
    Aborted,

    /// Internal failure (task join error and similar)
    #[error("{0}")]
    Internal(String),
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, RealtimeError>;

impl From<url::ParseError> for RealtimeError {
    fn from(err: url::ParseError) -> Self {
        Self::InvalidEndpoint(err.to_string())
    }
}

#[cfg(feature = "websocket")]
impl From<tokio_tungstenite::tungstenite::Error> for RealtimeError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::Transport(err.to_string())
    }
}

impl From<RealtimeError> for String {
    fn from(err: RealtimeError) -> String {
        err.to_string()
    }
}
