//! Feed Interceptor
//!
//! Installs value rewriting on the paths live feed messages take to
//! application code:
//! - Point-to-point sockets (listener registration and handler slot)
//! - Consumer ports of shared background contexts
//! - Posts made inside background contexts, via a bootstrap proxy
//!
//! Interception is best-effort. Any installation failure leaves the
//! transport working unmodified.
//!
//! # Architecture
//!
//! ```text
//!   Controller ──► SharedConfig ───────────────┐
//!                       │                       │ snapshot (frozen)
//!                       │                  ┌────▼──────────┐
//!                       │                  │BootstrapUnit  │
//!                       │                  │ patch → load  │
//!                       │                  └────┬──────────┘
//!                       │                       │ post filter
//!  Socket/Port   ┌──────▼──────┐        ┌───────▼────────┐
//!  ─────────────►│TransportHook│        │Background ctx  │
//!     tap (1x)   │ rewrite once│        │ (WorkerScope)  │
//!                └──────┬──────┘        └───────┬────────┘
//!                       │ fan-out               │ broadcast
//!              ┌────────┴───────┐               ▼
//!              │listeners       │         consumer ports
//!              │onmessage slot  │
//!              └────────────────┘
//! ```

pub mod bootstrap;
pub mod channel;
pub mod error;
pub mod hook;
pub mod loopback;
pub mod worker;

// Library version
pub const SERVICE_VERSION: &str = "0.1.0";

pub use bootstrap::{BootstrapUnit, BootstrapWorkerFactory};
pub use channel::{MessageChannel, SocketFactory, WorkerFactory};
pub use error::{ScriptError, TransportError};
pub use hook::{HookOptions, TransportHook};
