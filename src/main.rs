//! grace-handoff daemon.
//!
//! Serves the HTTP servers named in the configuration file and restarts without
//! dropping a connection.
//!
//! ```text
//!   kill -USR2 <pid>   start a successor on the same sockets, then drain
//!   kill -TERM <pid>   stop accepting, finish in-flight requests, exit
//!   kill -TERM <pid>   (again, while draining) exit immediately
//! ```
//!
//! Every server runs the same demonstration router:
//! - `GET /` answers with the pid of the generation that served it
//! - `GET /slow/{secs}` answers after `secs` seconds
//! - `POST /jobs/{secs}` starts background work that delays exit until done
//! - `GET /health` reports the lifecycle state

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use clap::Parser;
use serde_json::json;
use tokio::sync::watch;

use grace_handoff::config::{self, GraceConfig};
use grace_handoff::lifecycle::HookError;
use grace_handoff::net::tls;
use grace_handoff::observability::{logging, metrics};
use grace_handoff::{GracefulServer, LifecycleState, Options, ServerSpec, WorkCounter};

#[derive(Parser)]
#[command(name = "grace-handoff")]
#[command(about = "HTTP servers with zero-downtime restarts", long_about = None)]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(short, long, default_value = "grace.toml")]
    config: PathBuf,
}

#[derive(Clone)]
struct AppState {
    pid: u32,
    work: WorkCounter,
    lifecycle: watch::Receiver<LifecycleState>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let config = config::load_config(&args.config)?;

    logging::init(&config.observability);

    tracing::info!(
        config = %args.config.display(),
        servers = config.servers.len(),
        restart_signal = %config.lifecycle.restart_signal,
        "grace-handoff v0.1.0 starting"
    );

    let work = WorkCounter::new();
    let options = options(&args.config, &config, work.clone());

    // The state receiver only exists once the server is built; handlers get it
    // through a channel filled right after.
    let (lifecycle_tx, lifecycle_rx) = watch::channel(LifecycleState::Serving);
    let state = AppState {
        pid: std::process::id(),
        work,
        lifecycle: lifecycle_rx,
    };

    let specs = server_specs(&config, state).await?;
    let server = GracefulServer::new(specs, options);

    let mut lifecycle = server.lifecycle();
    tokio::spawn(async move {
        while lifecycle.changed().await.is_ok() {
            let current = *lifecycle.borrow_and_update();
            if lifecycle_tx.send(current).is_err() {
                break;
            }
        }
    });

    if let Err(e) = server.run().await {
        tracing::error!(error = %e, "Lifecycle ended with an error");
        return Err(e.into());
    }

    tracing::info!("Shutdown complete");
    Ok(())
}

fn options(path: &std::path::Path, config: &GraceConfig, work: WorkCounter) -> Options {
    let config_path = path.to_path_buf();
    let hook = move || -> Result<(), HookError> {
        config::load_config(&config_path)?;
        tracing::info!(config = %config_path.display(), "Configuration valid for successor");
        Ok(())
    };

    let mut options = Options::new()
        .on_restart(hook)
        .waiter(work)
        .restart_signal(config.lifecycle.restart_signal);
    if let Some(executable) = &config.lifecycle.executable {
        options = options.executable(executable);
    }
    if let Some(pid_file) = &config.lifecycle.pid_file {
        options = options.pid_file(pid_file);
    }
    options
}

async fn server_specs(config: &GraceConfig, state: AppState) -> Result<Vec<ServerSpec>, Box<dyn std::error::Error>> {
    let mut specs = Vec::with_capacity(config.servers.len() + 1);

    for server in &config.servers {
        let mut spec = ServerSpec::new(&server.address, app(state.clone())).named(server.display_name());
        if let Some(tls_config) = &server.tls {
            spec = spec.with_tls(tls::load(tls_config).await?);
        }
        specs.push(spec);
    }

    if let Some(address) = &config.observability.metrics_address {
        let handle = metrics::install_recorder()?;
        let router = Router::new().route(
            "/metrics",
            get(move || {
                let handle = handle.clone();
                async move { handle.render() }
            }),
        );
        specs.push(ServerSpec::new(address, router).named("metrics"));
    }

    Ok(specs)
}

fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(whoami))
        .route("/slow/{secs}", get(slow))
        .route("/jobs/{secs}", post(background_job))
        .route("/health", get(health))
        .with_state(state)
}

async fn whoami(
    State(state): State<AppState>,
    axum::extract::ConnectInfo(peer): axum::extract::ConnectInfo<SocketAddr>,
) -> String {
    tracing::debug!(peer = %peer, "Serving request");
    format!("{}\n", state.pid)
}

async fn slow(State(state): State<AppState>, Path(secs): Path<u64>) -> String {
    tokio::time::sleep(Duration::from_secs(secs)).await;
    format!("{}\n", state.pid)
}

async fn background_job(State(state): State<AppState>, Path(secs): Path<u64>) -> impl IntoResponse {
    let guard = state.work.guard();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(secs)).await;
        tracing::info!(secs, "Background job finished");
        drop(guard);
    });
    (StatusCode::ACCEPTED, format!("{}\n", state.pid))
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let current = *state.lifecycle.borrow();
    let status = if current == LifecycleState::Serving {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(json!({
            "pid": state.pid,
            "state": current,
            "retained_work": state.work.outstanding(),
        })),
    )
}
