//! Zero-downtime restarts for network services.
//!
//! A running generation hands its listening sockets to a freshly started copy of
//! itself on the restart signal, then drains once the copy tells it to. Clients
//! never see a refused connection.
//!
//! ```text
//!   generation N                          generation N+1
//!   ────────────                          ──────────────
//!   Serving
//!   SIGUSR2 ─▶ restart hook
//!            ─▶ spawn with LISTEN_FDS ──▶ adopt fds 3..3+n
//!   Serving                               start servers on them
//!                          ◀── SIGTERM ── Serving
//!   Draining (stop accepting,
//!            finish in-flight)
//!   wait for retained work
//!   exit
//! ```
//!
//! Two modes share the lifecycle: [`GracefulServer`] runs HTTP servers,
//! [`GracefulNet`] hands out raw listeners.

#[cfg(not(unix))]
compile_error!("grace-handoff relies on Unix descriptor inheritance and signals");

// Core subsystems
pub mod config;
pub mod http;
pub mod net;

// Cross-cutting concerns
pub mod error;
pub mod lifecycle;
pub mod observability;

mod grace;

pub use error::{GraceError, GraceResult};
pub use grace::{GracefulNet, GracefulServer, Options};
pub use http::ServerSpec;
pub use lifecycle::{
    HookError, LifecycleState, NoopWaiter, ProcessSignal, RestartHook, RestartSignal,
    SignalSource, Waiter, WorkCounter,
};
pub use net::{Connection, ConnectionSet, Listener};
