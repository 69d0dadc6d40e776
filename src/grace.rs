//! Embedding API.
//!
//! # Responsibilities
//! - [`GracefulServer`]: run a set of HTTP servers with zero-downtime restarts
//! - [`GracefulNet`]: hand out raw listeners with the same restart semantics
//! - Run one lifecycle: serve, hand off on the restart signal, drain on terminate,
//!   then wait for retained work before returning
//!
//! # Design Decisions
//! - Options are shared by both modes and set through chained setters
//! - Fatal errors end `run` immediately; stop errors are held until the exit wait
//!   is over so they never cut a drain short

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use crate::error::GraceError;
use crate::http::{ServerSpec, ServerUnit, Supervisor};
use crate::lifecycle::shutdown::{ErrorAggregator, RecordedErrors};
use crate::lifecycle::state::{state_channel, LifecycleState, StateMachine, StateTx};
use crate::lifecycle::{
    startup, Drain, NoopHook, NoopWaiter, ProcessGeneration, RestartHook, RestartSignal,
    SignalSource, Waiter,
};
use crate::net::{
    ConnectionGuard, ConnectionId, ConnectionSet, ListenAddr, Listener, ListenerRegistry,
    NetworkKind,
};

/// Settings shared by [`GracefulServer`] and [`GracefulNet`].
pub struct Options {
    hook: Arc<dyn RestartHook>,
    waiter: Arc<dyn Waiter>,
    executable: Option<PathBuf>,
    restart_signal: RestartSignal,
    signals: Option<SignalSource>,
    generation: Option<ProcessGeneration>,
    pid_file: Option<PathBuf>,
    connection_poll: Option<Duration>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            hook: Arc::new(NoopHook),
            waiter: Arc::new(NoopWaiter),
            executable: None,
            restart_signal: RestartSignal::default(),
            signals: None,
            generation: None,
            pid_file: None,
            connection_poll: None,
        }
    }
}

impl Options {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `hook` right before a successor is started.
    pub fn on_restart(mut self, hook: impl RestartHook + 'static) -> Self {
        self.hook = Arc::new(hook);
        self
    }

    /// Keep the process alive after draining until `waiter` reports no work.
    pub fn waiter(mut self, waiter: impl Waiter + 'static) -> Self {
        self.waiter = Arc::new(waiter);
        self
    }

    /// Start `path` as successor instead of the running executable.
    pub fn executable(mut self, path: impl Into<PathBuf>) -> Self {
        self.executable = Some(path.into());
        self
    }

    pub fn restart_signal(mut self, signal: RestartSignal) -> Self {
        self.restart_signal = signal;
        self
    }

    /// Take signal events from `source` instead of installing OS handlers.
    pub fn signals(mut self, source: SignalSource) -> Self {
        self.signals = Some(source);
        self
    }

    /// Use `generation` instead of reading it from the environment.
    pub fn generation(mut self, generation: ProcessGeneration) -> Self {
        self.generation = Some(generation);
        self
    }

    /// Write the pid to `path` once serving.
    pub fn pid_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.pid_file = Some(path.into());
        self
    }

    /// Poll interval of the connection set in [`GracefulNet`].
    pub fn connection_poll_interval(mut self, interval: Duration) -> Self {
        self.connection_poll = Some(interval);
        self
    }

    fn registry(&mut self) -> Result<ListenerRegistry, GraceError> {
        let generation = self.generation.take().unwrap_or_else(ProcessGeneration::current);
        let registry = ListenerRegistry::new(generation)?;
        Ok(match self.executable.take() {
            Some(path) => registry.with_executable(path),
            None => registry,
        })
    }

    fn signal_source(&mut self) -> Result<SignalSource, GraceError> {
        match self.signals.take() {
            Some(source) => Ok(source),
            None => SignalSource::install(self.restart_signal).map_err(GraceError::Signals),
        }
    }
}

/// Steps after startup common to both modes.
struct Lifecycle {
    registry: Arc<ListenerRegistry>,
    hook: Arc<dyn RestartHook>,
    waiters: Vec<Arc<dyn Waiter>>,
    pid_file: Option<PathBuf>,
    errors: ErrorAggregator,
    state: StateTx,
}

impl Lifecycle {
    /// Announce, replace the parent, then serve signals until drained.
    async fn run(mut self, drain: Arc<dyn Drain>, source: SignalSource) -> Result<(), GraceError> {
        let generation = self.registry.generation().clone();
        startup::announce(&generation, &self.registry.active_listeners());

        if let Err(e) = self.go_live(&generation) {
            self.state.send_replace(LifecycleState::Terminated);
            return Err(e);
        }

        let machine = StateMachine::new(
            drain,
            Arc::clone(&self.registry),
            Arc::clone(&self.hook),
            self.errors.sink(),
            Arc::clone(&self.state),
        );
        let mut task = tokio::spawn(machine.run(source));

        let mut deferred: Option<GraceError> = None;
        loop {
            tokio::select! {
                joined = &mut task => {
                    if let Err(e) = joined {
                        if e.is_panic() {
                            std::panic::resume_unwind(e.into_panic());
                        }
                    }
                    break;
                }
                err = self.errors.next() => {
                    if err.is_deferred() {
                        tracing::warn!(error = %err, "Server stop failed");
                        deferred.get_or_insert(err);
                        continue;
                    }
                    tracing::error!(error = %err, "Fatal lifecycle error");
                    task.abort();
                    self.state.send_replace(LifecycleState::Terminated);
                    return Err(err);
                }
            }
        }

        for waiter in &self.waiters {
            waiter.wait().await;
        }
        tracing::info!(pid = generation.pid(), "Exiting");

        match deferred.or_else(|| self.errors.try_next()) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn go_live(&self, generation: &ProcessGeneration) -> Result<(), GraceError> {
        startup::close_parent(generation)?;
        if let Some(path) = &self.pid_file {
            startup::write_pid_file(path, generation.pid())?;
        }
        Ok(())
    }
}

/// A set of HTTP servers restarted without dropping connections.
pub struct GracefulServer {
    servers: Vec<ServerSpec>,
    options: Options,
    errors: ErrorAggregator,
    state: StateTx,
}

impl GracefulServer {
    pub fn new(servers: Vec<ServerSpec>, options: Options) -> Self {
        Self {
            errors: ErrorAggregator::new(servers.len()),
            servers,
            options,
            state: state_channel(),
        }
    }

    /// Observe lifecycle transitions.
    pub fn lifecycle(&self) -> watch::Receiver<LifecycleState> {
        self.state.subscribe()
    }

    /// Errors that were logged but did not end the lifecycle.
    pub fn recorded_errors(&self) -> RecordedErrors {
        self.errors.recorded()
    }

    /// Serve until terminated and drained.
    ///
    /// Listener errors are returned before anything is served.
    pub async fn run(self) -> Result<(), GraceError> {
        let Self {
            servers,
            mut options,
            errors,
            state,
        } = self;

        let source = options.signal_source()?;
        let registry = Arc::new(options.registry()?);

        let mut units = Vec::with_capacity(servers.len());
        for spec in servers {
            tracing::debug!(
                server = spec.name(),
                address = spec.address(),
                tls = spec.is_tls(),
                "Claiming listener"
            );
            let address = ListenAddr::resolve(NetworkKind::Tcp, spec.address())?;
            let listener = registry.claim(NetworkKind::Tcp, address)?.to_tcp()?;
            units.push(ServerUnit::new(spec, listener)?);
        }
        registry.release_unclaimed();

        let supervisor = Arc::new(Supervisor::new(units, Arc::clone(&registry), errors.sink()));
        supervisor.start().await;

        let lifecycle = Lifecycle {
            registry,
            hook: options.hook,
            waiters: vec![options.waiter],
            pid_file: options.pid_file,
            errors,
            state,
        };
        lifecycle.run(supervisor, source).await
    }
}

/// Raw listeners with the same restart semantics as [`GracefulServer`].
///
/// The application accepts and serves connections itself and reports them
/// through [`add_conn`](Self::add_conn) / [`remove_conn`](Self::remove_conn).
pub struct GracefulNet {
    registry: Arc<ListenerRegistry>,
    connections: ConnectionSet,
    options: Options,
    errors: ErrorAggregator,
    state: StateTx,
}

impl GracefulNet {
    /// Adopt inherited listeners and prepare to hand out new ones.
    pub fn new(mut options: Options) -> Result<Self, GraceError> {
        let registry = Arc::new(options.registry()?);
        let connections = match options.connection_poll {
            Some(interval) => ConnectionSet::with_poll_interval(interval),
            None => ConnectionSet::new(),
        };
        Ok(Self {
            registry,
            connections,
            options,
            errors: ErrorAggregator::new(0),
            state: state_channel(),
        })
    }

    /// Listen on `address` of `network` (`tcp`, `tcp4`, `tcp6`, `unix`).
    ///
    /// Must be called from within a Tokio runtime.
    pub fn listen(&self, network: &str, address: &str) -> Result<Listener, GraceError> {
        let bound = self.registry.listen(network, address)?;
        Ok(Listener::new(bound, self.registry.subscribe_closed())?)
    }

    pub fn listen_tcp(&self, addr: SocketAddr) -> Result<Listener, GraceError> {
        let bound = self.registry.listen_tcp(addr)?;
        Ok(Listener::new(crate::net::BoundListener::Tcp(bound), self.registry.subscribe_closed())?)
    }

    pub fn listen_unix(&self, path: impl AsRef<Path>) -> Result<Listener, GraceError> {
        let bound = self.registry.listen_unix(path)?;
        Ok(Listener::new(crate::net::BoundListener::Unix(bound), self.registry.subscribe_closed())?)
    }

    /// Record a live connection; exit waits until it is removed.
    pub fn add_conn(&self) -> ConnectionId {
        self.connections.add_conn()
    }

    pub fn remove_conn(&self, id: ConnectionId) {
        self.connections.remove_conn(id)
    }

    /// Record a live connection for as long as the guard lives.
    pub fn track(&self) -> ConnectionGuard {
        self.connections.track()
    }

    pub fn connections(&self) -> &ConnectionSet {
        &self.connections
    }

    pub fn registry(&self) -> &Arc<ListenerRegistry> {
        &self.registry
    }

    pub fn lifecycle(&self) -> watch::Receiver<LifecycleState> {
        self.state.subscribe()
    }

    pub fn recorded_errors(&self) -> RecordedErrors {
        self.errors.recorded()
    }

    /// Serve signals until terminated, then wait for tracked connections.
    ///
    /// On terminate every listener stops accepting; connections already accepted
    /// keep running until removed.
    pub async fn run(self) -> Result<(), GraceError> {
        let Self {
            registry,
            connections,
            mut options,
            errors,
            state,
        } = self;

        let source = options.signal_source()?;
        registry.release_unclaimed();

        let lifecycle = Lifecycle {
            registry: Arc::clone(&registry),
            hook: options.hook,
            waiters: vec![Arc::new(connections) as Arc<dyn Waiter>, options.waiter],
            pid_file: options.pid_file,
            errors,
            state,
        };
        lifecycle.run(registry, source).await
    }
}
