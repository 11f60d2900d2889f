//! Error taxonomy for payload rewriting and configuration snapshots
//!
//! None of these are fatal to the host: the infallible entry points turn
//! every rewrite error into an unchanged passthrough.

use thiserror::Error;

/// Why a payload could not be rewritten.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RewriteError {
    #[error("payload is not valid JSON: {0}")]
    Decode(String),

    #[error("payload matches no known envelope shape")]
    ShapeMismatch,

    #[error("binary payloads are not rewritten")]
    Binary,
}

/// Configuration snapshot failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SnapshotError {
    #[error("failed to encode configuration snapshot: {0}")]
    Encode(String),

    #[error("failed to decode configuration snapshot: {0}")]
    Decode(String),
}
