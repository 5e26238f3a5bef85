//! Domain error types for tether
//!
//! Provides structured error types for different domains:
//! - `TransportError` for channel/framing failures (fatal to the connection)
//! - `HandlerError` for callback bridge handlers (absorbed into response frames)
//! - `TetherError` as the top-level error type

use serde_json::Value;
use thiserror::Error;

/// Top-level error type for tether
#[derive(Debug, Error)]
pub enum TetherError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Connection lost")]
    ConnectionLost,

    #[error("Client is not initialized")]
    NotInitialized,

    #[error("Session already has a turn in flight")]
    SessionBusy,

    #[error("Session is closed")]
    SessionClosed,

    #[error("{0}")]
    Remote(RemoteError),

    #[error("Request timed out after {0}ms")]
    Timeout(u64),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

/// Errors related to the byte channel and framing
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Failed to spawn agent: {0}")]
    SpawnFailed(String),

    #[error("Connection closed")]
    Closed,

    #[error("Malformed frame: {0}")]
    MalformedFrame(String),
}

/// An error response issued by the remote side, surfaced verbatim
/// with its code, message, and data preserved.
#[derive(Debug, Clone)]
pub struct RemoteError {
    pub code: i64,
    pub message: String,
    pub data: Option<Value>,
}

impl std::fmt::Display for RemoteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Remote error {}: {}", self.code, self.message)
    }
}

/// Failures local to a registered handler. The callback bridge absorbs these
/// into a protocol-legal negative response; they never surface to the caller.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("Handler failed: {0}")]
    Failed(String),

    #[error("Handler timed out")]
    Timeout,
}

/// Result type alias for TetherError
pub type Result<T> = std::result::Result<T, TetherError>;

/// Result type alias for HandlerError
pub type HandlerResult<T> = std::result::Result<T, HandlerError>;

impl From<serde_json::Error> for TetherError {
    fn from(err: serde_json::Error) -> Self {
        TetherError::Protocol(format!("JSON serialization error: {err}"))
    }
}

impl From<String> for TetherError {
    fn from(msg: String) -> Self {
        TetherError::Other(msg)
    }
}

impl From<&str> for TetherError {
    fn from(msg: &str) -> Self {
        TetherError::Other(msg.to_string())
    }
}

impl From<std::io::Error> for HandlerError {
    fn from(err: std::io::Error) -> Self {
        HandlerError::Failed(err.to_string())
    }
}
