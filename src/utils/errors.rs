// src/utils/errors.rs
//! Crate-wide error type
//!
//! Errors raised inside the runtime process are converted to wire payloads
//! (see [`ErrorCode`]) and never cross the process boundary as panics.
//! Errors raised inside the supervisor are returned to the caller.

use crate::engine::config::ConfigError;
use crate::engine::model::ModelError;
use crate::engine::tools::ToolError;
use crate::protocol::message::ProtocolError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, RuntimeError>;

/// Unified error type for the runtime process and the supervisor
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// Agent configuration rejected at `initialize`
    #[error(transparent)]
    InvalidConfig(#[from] ConfigError),

    /// Malformed or unroutable protocol message
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("agent is not initialized")]
    NotInitialized,

    #[error("agent is already initialized")]
    AlreadyInitialized,

    /// A `chat-stream` is already in flight on this runtime
    #[error("runtime is busy processing another message")]
    Busy,

    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The worker is alive but fails the health policy
    #[error("worker is unhealthy: {0}")]
    Unhealthy(String),

    /// Automatic restarts exhausted; cleared only by caller action
    #[error("worker failed after {restarts} restart attempts: {reason}")]
    RestartLimitExceeded { restarts: u32, reason: String },

    /// The worker exited or closed its channel with calls outstanding
    #[error("worker exited: {0}")]
    WorkerExited(String),

    #[error("failed to spawn worker process: {0}")]
    ProcessSpawnFailed(String),

    /// An error reported by the runtime process over the wire
    #[error("runtime rejected request ({code}): {message}")]
    Remote { code: ErrorCode, message: String },

    #[error(transparent)]
    Model(#[from] ModelError),

    #[error(transparent)]
    Tool(#[from] ToolError),

    #[error("settings error: {0}")]
    Settings(#[from] config::ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl RuntimeError {
    /// Wire code for this error
    pub fn code(&self) -> ErrorCode {
        match self {
            RuntimeError::InvalidConfig(_) => ErrorCode::InvalidConfig,
            RuntimeError::AlreadyInitialized => ErrorCode::AlreadyInitialized,
            RuntimeError::NotInitialized => ErrorCode::NotInitialized,
            RuntimeError::InvalidInput(_) => ErrorCode::InvalidInput,
            RuntimeError::Busy => ErrorCode::Busy,
            RuntimeError::Remote { code, .. } => *code,
            _ => ErrorCode::Internal,
        }
    }

    /// Whether the caller may retry the same request later unchanged
    pub fn is_retryable(&self) -> bool {
        self.code() == ErrorCode::Busy
            || matches!(
                self,
                RuntimeError::Unhealthy(_) | RuntimeError::WorkerExited(_)
            )
    }
}

/// Error codes carried in `error` messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    InvalidConfig,
    AlreadyInitialized,
    NotInitialized,
    InvalidInput,
    Busy,
    Internal,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::InvalidConfig => "invalid_config",
            ErrorCode::AlreadyInitialized => "already_initialized",
            ErrorCode::NotInitialized => "not_initialized",
            ErrorCode::InvalidInput => "invalid_input",
            ErrorCode::Busy => "busy",
            ErrorCode::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes() {
        assert_eq!(RuntimeError::Busy.code(), ErrorCode::Busy);
        assert_eq!(RuntimeError::NotInitialized.code(), ErrorCode::NotInitialized);
        assert_eq!(
            RuntimeError::Internal("boom".into()).code(),
            ErrorCode::Internal
        );
    }

    #[test]
    fn test_oversized_message_is_internal() {
        let err = RuntimeError::from(ProtocolError::Oversized(64));
        assert_eq!(err.code(), ErrorCode::Internal);
        assert!(!err.is_retryable());
        assert_eq!(err.to_string(), "protocol error: message exceeds 64 bytes");
    }

    #[test]
    fn test_retryable() {
        assert!(RuntimeError::Busy.is_retryable());
        assert!(RuntimeError::Unhealthy("stale".into()).is_retryable());
        assert!(!RuntimeError::AlreadyInitialized.is_retryable());
        assert!(!RuntimeError::RestartLimitExceeded {
            restarts: 3,
            reason: "crash".into()
        }
        .is_retryable());
    }

    #[test]
    fn test_code_serialization() {
        let json = serde_json::to_string(&ErrorCode::InvalidConfig).unwrap();
        assert_eq!(json, "\"invalid_config\"");
        assert_eq!(ErrorCode::Busy.to_string(), "busy");
    }
}
