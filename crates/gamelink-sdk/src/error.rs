// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SDK-specific error types.

use gamelink_protocol::{ClientError, FrameError};
use thiserror::Error;

/// Errors that can occur in the SDK.
///
/// `SdkError` is `Clone` so a single outcome (for example a failed batch
/// flush) can be handed to several completion callbacks.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SdkError {
    /// Configuration error (missing identity, invalid environment variable)
    #[error("configuration error: {0}")]
    Config(String),

    /// Transport-level failure (DNS, connect, reset, TLS)
    #[error("network error: {0}")]
    Network(String),

    /// Request exceeded its deadline
    #[error("request timed out after {0}ms")]
    Timeout(u64),

    /// Malformed or unexpected control-plane frame
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Operation is not valid in the current state
    #[error("cannot {action} while {state}")]
    Conflict {
        /// State the component was in
        state: String,
        /// Rejected operation
        action: String,
    },

    /// Task was cancelled before it produced a result
    #[error("task cancelled")]
    Cancelled,

    /// Scheduler is not admitting new work
    #[error("scheduler stopped")]
    Stopped,

    /// Server answered with a non-success status where success was required
    #[error("server error: {status} - {message}")]
    Server {
        /// HTTP status code
        status: u16,
        /// Response body or reason
        message: String,
    },

    /// Durable store failure
    #[error("storage error: {0}")]
    Storage(String),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Internal SDK error
    #[error("internal error: {0}")]
    Internal(String),
}

impl SdkError {
    /// Whether a later attempt of the same operation may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            SdkError::Network(_) | SdkError::Timeout(_) => true,
            SdkError::Server { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }

    pub(crate) fn conflict(state: impl std::fmt::Display, action: &str) -> Self {
        SdkError::Conflict {
            state: state.to_string(),
            action: action.to_string(),
        }
    }
}

impl From<ClientError> for SdkError {
    fn from(err: ClientError) -> Self {
        match err {
            ClientError::Timeout(ms) => SdkError::Timeout(ms),
            ClientError::InvalidHeader(msg) => SdkError::Config(msg),
            other => SdkError::Network(other.to_string()),
        }
    }
}

impl From<FrameError> for SdkError {
    fn from(err: FrameError) -> Self {
        SdkError::Protocol(err.to_string())
    }
}

impl From<serde_json::Error> for SdkError {
    fn from(err: serde_json::Error) -> Self {
        SdkError::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for SdkError {
    fn from(err: std::io::Error) -> Self {
        SdkError::Storage(err.to_string())
    }
}

/// Type alias for SDK results.
pub type Result<T> = std::result::Result<T, SdkError>;
