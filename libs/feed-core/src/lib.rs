//! Feed mutation core
//!
//! Side-effect-free logic shared by every interception installer, whether
//! it runs in the consuming context or inside a background context.
//!
//! # Modules
//! - `config`: Interception configuration and the live `SharedConfig` handle
//! - `generator`: Deterministic override value generator
//! - `rewriter`: Envelope matching and field rewriting for JSON payloads
//! - `snapshot`: Frozen, serialized configuration copies
//! - `errors`: Rewrite and snapshot error taxonomy

pub mod config;
pub mod errors;
pub mod generator;
pub mod rewriter;
pub mod snapshot;

// Library version constant
pub const LIB_VERSION: &str = "0.1.0";

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::config::*;
    pub use crate::errors::*;
    pub use crate::rewriter::*;
    pub use crate::snapshot::*;
}
