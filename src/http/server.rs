//! Supervised HTTP servers.
//!
//! # Responsibilities
//! - Serve one axum router per listener, plain or TLS
//! - Report when every server accepts traffic
//! - Stop every server gracefully, in parallel, exactly once
//! - Turn unexpected serve failures into fatal lifecycle errors
//!
//! # Design Decisions
//! - Listeners come from the registry, never bound here
//! - A serve error after shutdown started is a stop error, reported after every
//!   server has stopped; before that it is fatal
//! - In-flight requests are never cut off; there is no stop deadline

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use axum::Router;
use axum_server::tls_rustls::RustlsConfig;
use axum_server::Handle;
use futures_util::future::join_all;
use tokio::sync::OnceCell;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;

use crate::error::GraceError;
use crate::lifecycle::shutdown::ErrorSink;
use crate::lifecycle::state::{Drain, DrainFuture};
use crate::net::ListenerRegistry;
use crate::observability::metrics;

/// What the application wants served: an address, a router and optional TLS.
#[derive(Clone)]
pub struct ServerSpec {
    name: String,
    address: String,
    router: Router,
    tls: Option<RustlsConfig>,
}

impl ServerSpec {
    /// Serve `router` on `address` (`host:port` or `:port`).
    pub fn new(address: impl Into<String>, router: Router) -> Self {
        let address = address.into();
        Self {
            name: address.clone(),
            address,
            router,
            tls: None,
        }
    }

    /// Name used in logs and errors. Defaults to the address.
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_tls(mut self, tls: RustlsConfig) -> Self {
        self.tls = Some(tls);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn is_tls(&self) -> bool {
        self.tls.is_some()
    }
}

impl std::fmt::Debug for ServerSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerSpec")
            .field("name", &self.name)
            .field("address", &self.address)
            .field("tls", &self.tls.is_some())
            .finish()
    }
}

/// A server paired with the listener it will serve on.
pub struct ServerUnit {
    name: String,
    address: SocketAddr,
    listener: std::net::TcpListener,
    router: Router,
    tls: Option<RustlsConfig>,
}

impl ServerUnit {
    pub fn new(spec: ServerSpec, listener: std::net::TcpListener) -> io::Result<Self> {
        listener.set_nonblocking(true)?;
        let address = listener.local_addr()?;
        Ok(Self {
            name: spec.name,
            address,
            listener,
            router: spec.router,
            tls: spec.tls,
        })
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }
}

struct RunningServer {
    name: String,
    address: SocketAddr,
    handle: Handle,
    task: JoinHandle<io::Result<()>>,
}

/// Runs every configured server and stops them together.
pub struct Supervisor {
    pending: Mutex<Vec<ServerUnit>>,
    running: Mutex<Vec<RunningServer>>,
    registry: Arc<ListenerRegistry>,
    errors: ErrorSink,
    stopping: Arc<AtomicBool>,
    stopped: OnceCell<()>,
}

impl Supervisor {
    pub fn new(units: Vec<ServerUnit>, registry: Arc<ListenerRegistry>, errors: ErrorSink) -> Self {
        Self {
            pending: Mutex::new(units),
            running: Mutex::new(Vec::new()),
            registry,
            errors,
            stopping: Arc::new(AtomicBool::new(false)),
            stopped: OnceCell::new(),
        }
    }

    /// Start every server and resolve once each one accepts connections.
    ///
    /// Returns the addresses that are live. A server that failed before
    /// accepting has already reported a fatal error.
    pub async fn start(&self) -> Vec<SocketAddr> {
        let units = std::mem::take(&mut *self.pending.lock().expect("supervisor mutex poisoned"));

        let mut handles = Vec::with_capacity(units.len());
        {
            let mut running = self.running.lock().expect("supervisor mutex poisoned");
            for unit in units {
                let handle = Handle::new();
                handles.push((unit.name.clone(), handle.clone()));
                running.push(self.spawn(unit, handle));
            }
        }

        let mut live = Vec::with_capacity(handles.len());
        for (name, handle) in handles {
            match handle.listening().await {
                Some(addr) => {
                    tracing::info!(server = %name, address = %addr, "Server accepting connections");
                    live.push(addr);
                }
                None => tracing::warn!(server = %name, "Server stopped before accepting connections"),
            }
        }
        live
    }

    fn spawn(&self, unit: ServerUnit, handle: Handle) -> RunningServer {
        let ServerUnit {
            name,
            address,
            listener,
            router,
            tls,
        } = unit;

        let stopping = Arc::clone(&self.stopping);
        let errors = self.errors.clone();
        let server_handle = handle.clone();
        let server_name = name.clone();

        let task = tokio::spawn(async move {
            let app = router
                .layer(TraceLayer::new_for_http())
                .into_make_service_with_connect_info::<SocketAddr>();

            let result = match tls {
                Some(tls) => {
                    axum_server::tls_rustls::from_tcp_rustls(listener, tls)
                        .handle(server_handle)
                        .serve(app)
                        .await
                }
                None => {
                    axum_server::from_tcp(listener)
                        .handle(server_handle)
                        .serve(app)
                        .await
                }
            };

            match result {
                Err(source) if !stopping.load(Ordering::SeqCst) => {
                    errors.report(GraceError::Serve {
                        name: server_name,
                        address: address.to_string(),
                        source,
                    });
                    Ok(())
                }
                other => other,
            }
        });

        RunningServer {
            name,
            address,
            handle,
            task,
        }
    }

    /// Stop accepting on every server, wait for in-flight requests, then close
    /// every registry listener. Safe to call more than once.
    pub async fn shutdown(&self) {
        self.stopped.get_or_init(|| self.stop_all()).await;
    }

    async fn stop_all(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        let servers = std::mem::take(&mut *self.running.lock().expect("supervisor mutex poisoned"));
        tracing::info!(servers = servers.len(), "Stopping servers");

        let stops = servers.into_iter().map(|server| async move {
            server.handle.graceful_shutdown(None);
            let outcome = match server.task.await {
                Ok(result) => result,
                Err(e) => Err(io::Error::other(e.to_string())),
            };
            (server.name, server.address, outcome)
        });

        let mut failures = Vec::new();
        for (name, address, outcome) in join_all(stops).await {
            match outcome {
                Ok(()) => {
                    metrics::record_server_stop("clean");
                    tracing::debug!(server = %name, address = %address, "Server stopped");
                }
                Err(source) => {
                    metrics::record_server_stop("error");
                    failures.push(GraceError::Stop {
                        name,
                        address: address.to_string(),
                        source,
                    });
                }
            }
        }

        self.registry.close_all();
        for failure in failures {
            self.errors.report(failure);
        }
        tracing::info!("All servers stopped");
    }
}

impl Drain for Supervisor {
    fn drain(&self) -> DrainFuture<'_> {
        Box::pin(self.shutdown())
    }
}
