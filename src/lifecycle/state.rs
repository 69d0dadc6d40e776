//! Lifecycle state machine.
//!
//! # States
//! ```text
//! Serving --restart--> HandingOff --(spawned or failed)--> Serving
//! Serving --terminate/interrupt--> Draining --> Terminated
//! ```
//!
//! # Design Decisions
//! - A single task consumes signal events, so transitions never race
//! - Draining is monotonic: restart signals received while draining are ignored
//! - The state is published on a watch channel for observers

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::watch;

use crate::error::GraceError;
use crate::lifecycle::hook::RestartHook;
use crate::lifecycle::shutdown::ErrorSink;
use crate::lifecycle::signals::SignalSource;
use crate::net::ListenerRegistry;
use crate::observability::metrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Serving,
    Draining,
    HandingOff,
    Terminated,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LifecycleState::Serving => "serving",
            LifecycleState::Draining => "draining",
            LifecycleState::HandingOff => "handing_off",
            LifecycleState::Terminated => "terminated",
        };
        f.write_str(name)
    }
}

/// Future returned by [`Drain::drain`].
pub type DrainFuture<'a> = Pin<Box<dyn Future<Output = ()> + Send + 'a>>;

/// Whatever stops accepting new work when the process terminates.
pub trait Drain: Send + Sync {
    /// Stop accepting and release every listener. Must be safe to call twice.
    fn drain(&self) -> DrainFuture<'_>;
}

impl Drain for ListenerRegistry {
    fn drain(&self) -> DrainFuture<'_> {
        Box::pin(async move { self.close_all() })
    }
}

/// Publisher half of the lifecycle state.
pub type StateTx = Arc<watch::Sender<LifecycleState>>;

pub fn state_channel() -> StateTx {
    Arc::new(watch::channel(LifecycleState::Serving).0)
}

/// Consumes signal events and drives the lifecycle transitions.
pub struct StateMachine {
    drain: Arc<dyn Drain>,
    registry: Arc<ListenerRegistry>,
    hook: Arc<dyn RestartHook>,
    errors: ErrorSink,
    state: StateTx,
}

impl StateMachine {
    pub fn new(
        drain: Arc<dyn Drain>,
        registry: Arc<ListenerRegistry>,
        hook: Arc<dyn RestartHook>,
        errors: ErrorSink,
        state: StateTx,
    ) -> Self {
        Self {
            drain,
            registry,
            hook,
            errors,
            state,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<LifecycleState> {
        self.state.subscribe()
    }

    fn set(&self, next: LifecycleState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            tracing::debug!(from = %previous, to = %next, "Lifecycle transition");
        }
    }

    /// Run until the process is told to terminate and has drained.
    pub async fn run(self, source: SignalSource) -> LifecycleState {
        let (mut signals, escalation) = source.into_parts();

        while let Some(signal) = signals.recv().await {
            metrics::record_signal(signal.as_str());
            if signal.is_termination() {
                escalation.arm();
                tracing::info!(signal = %signal, pid = self.registry.generation().pid(), "Draining");
                return self.terminate().await;
            }
            self.hand_off();
        }

        tracing::warn!("Signal source closed, draining");
        self.terminate().await
    }

    async fn terminate(&self) -> LifecycleState {
        self.set(LifecycleState::Draining);
        self.drain.drain().await;
        self.set(LifecycleState::Terminated);
        LifecycleState::Terminated
    }

    fn hand_off(&self) {
        self.set(LifecycleState::HandingOff);
        tracing::info!(pid = self.registry.generation().pid(), "Restart requested, starting successor");

        if let Err(e) = self.hook.before_restart() {
            self.errors.record(GraceError::Hook(e));
        }

        match self.registry.start_successor() {
            Ok(pid) => tracing::info!(successor = pid, "Waiting for successor to take over"),
            Err(e) => self.errors.record(e.into()),
        }

        self.set(LifecycleState::Serving);
    }
}
