//! HTTP serving subsystem.
//!
//! # Data Flow
//! ```text
//! ListenerRegistry (inherited or fresh socket)
//!     → server.rs (one axum-server per listener, optional TLS)
//!     → application router
//!
//! Drain:
//!     graceful_shutdown on every handle → join all → close registry
//! ```

pub mod server;

pub use server::{ServerSpec, ServerUnit, Supervisor};
