//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup (startup.rs):
//!     Adopt inherited sockets → Start servers → Signal parent → Write pid file
//!
//! Signals (signals.rs → state.rs):
//!     SIGTERM/SIGINT → Draining → Terminated
//!     SIGUSR2 (or SIGHUP) → HandingOff → restart hook → spawn successor → Serving
//!
//! Exit (shutdown.rs, waiter.rs):
//!     Drain finished → wait for retained work → surface deferred errors
//! ```
//!
//! # Design Decisions
//! - The generation is read from the environment once and passed explicitly
//! - One task owns all state transitions
//! - There is no drain deadline; a second SIGTERM is the operator's escape hatch

pub mod generation;
pub mod hook;
pub mod shutdown;
pub mod signals;
pub mod startup;
pub mod state;
pub mod waiter;

pub use generation::ProcessGeneration;
pub use hook::{HookError, NoopHook, RestartHook};
pub use shutdown::{ErrorAggregator, ErrorSink, RecordedErrors};
pub use signals::{DrainEscalation, ProcessSignal, RestartSignal, SignalSource};
pub use state::{Drain, DrainFuture, LifecycleState, StateMachine};
pub use waiter::{NoopWaiter, RetainGuard, WaitFuture, Waiter, WorkCounter};
