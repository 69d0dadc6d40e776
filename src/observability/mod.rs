//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! Lifecycle, registry and supervisor produce:
//!     → logging.rs (structured log events)
//!     → metrics.rs (counters and gauges)
//!
//! Consumers:
//!     → stdout (text or JSON)
//!     → /metrics endpoint (Prometheus scrape), itself a supervised server
//! ```
//!
//! # Design Decisions
//! - Structured logging (JSON) for machine parsing
//! - Metrics are cheap (atomic increments)
//! - The library only records; binaries decide what gets installed

pub mod logging;
pub mod metrics;
