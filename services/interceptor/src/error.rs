//! Error types for transports and background contexts

use feed_core::errors::SnapshotError;
use thiserror::Error;

/// Transport-level failures.
///
/// When returned while installing interception these are logged and the
/// original transport keeps working unmodified.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("channel is closed")]
    Closed,

    #[error("unsupported operation: {0}")]
    Unsupported(String),

    #[error("failed to start background context: {0}")]
    Spawn(String),

    #[error("bootstrap synthesis failed: {0}")]
    Bootstrap(String),
}

/// Background script failures, reported inside the background context.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScriptError {
    #[error("script not found: {locator}")]
    NotFound { locator: String },

    #[error("script {locator} failed: {reason}")]
    Failed { locator: String, reason: String },

    #[error("snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),
}
