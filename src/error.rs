// error.rs - Centralized error handling using thiserror

use serde::{Deserialize, Serialize};

/// Crate-wide Result type
pub type Result<T> = std::result::Result<T, Error>;

/// Error kinds the engine distinguishes.
///
/// Uses thiserror for ergonomic error handling and automatic Display impl.
/// All variants are serializable so a terminal error can cross a host
/// boundary (IPC, FFI) the same way an application error crosses a bridge.
///
/// Propagation policy: C3 and C5 absorb per-item `Storage`/`Wire` errors
/// internally and never let them escape as a returned `Error` — one bad
/// record cannot stall the engine. C4, C6, and C7 surface terminal errors to
/// C8, which owns the retry-vs-terminate decision.
#[derive(Debug, thiserror::Error, Serialize, Deserialize, Clone)]
#[serde(tag = "type", content = "message")]
pub enum Error {
    #[error("storage error: {0}")]
    Storage(String),

    #[error("transport error (retryable): {0}")]
    TransportRetryable(String),

    #[error("transport error (fatal): {0}")]
    TransportFatal(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("conflict handler error: {0}")]
    Conflict(String),

    #[error("invariant violation: {0}")]
    Invariant(String),

    #[error("operation cancelled")]
    Cancelled,
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        Error::Storage(err.to_string())
    }
}

impl Error {
    /// True for the control-flow "error" that just means cooperative
    /// shutdown raced with completion; never logged as a failure and never
    /// drives a retry decision.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }
}
