//! Configuration schema definitions.
//!
//! This module defines the configuration structure of the daemon.
//! All types derive Serde traits for deserialization from config files.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::lifecycle::RestartSignal;

/// Root configuration of the daemon.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct GraceConfig {
    /// Servers to run, in order.
    pub servers: Vec<ServerConfig>,

    /// Restart and exit behaviour.
    pub lifecycle: LifecycleConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// One HTTP server.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Name for logs. Defaults to the address.
    #[serde(default)]
    pub name: Option<String>,

    /// Listen address (e.g., "0.0.0.0:8080" or ":8080").
    pub address: String,

    /// Optional TLS configuration.
    #[serde(default)]
    pub tls: Option<TlsConfig>,
}

impl ServerConfig {
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.address)
    }
}

/// TLS configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TlsConfig {
    /// Path to certificate file (PEM).
    pub cert_path: String,

    /// Path to private key file (PEM).
    pub key_path: String,
}

/// Restart and exit behaviour.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LifecycleConfig {
    /// Signal that starts a graceful handoff ("SIGUSR2" or "SIGHUP").
    pub restart_signal: RestartSignal,

    /// Where to write the pid of the serving generation.
    pub pid_file: Option<PathBuf>,

    /// Binary to start as successor. Defaults to the running executable.
    pub executable: Option<PathBuf>,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            restart_signal: RestartSignal::default(),
            pid_file: None,
            executable: None,
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log filter directive (e.g., "info,grace_handoff=debug").
    pub log_filter: Option<String>,

    /// Emit logs as JSON lines.
    pub json_logs: bool,

    /// Address of the Prometheus scrape endpoint. Disabled when unset.
    pub metrics_address: Option<String>,
}
