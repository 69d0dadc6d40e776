//! Crate-level error type.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::lifecycle::hook::HookError;
use crate::net::{ListenError, SpawnError};
use crate::net::tls::TlsError;

/// Errors surfaced by [`GracefulServer::run`](crate::GracefulServer::run) and
/// [`GracefulNet::run`](crate::GracefulNet::run), or recorded along the way.
#[derive(Debug, Error)]
pub enum GraceError {
    /// A listener could not be acquired. Fatal, before serving starts.
    #[error(transparent)]
    Listen(#[from] ListenError),

    /// The successor process could not be started. Recorded, not fatal.
    #[error(transparent)]
    Spawn(#[from] SpawnError),

    #[error(transparent)]
    Tls(#[from] TlsError),

    /// The pre-handoff hook failed. Recorded, the handoff is still attempted.
    #[error("restart hook failed: {0}")]
    Hook(#[source] HookError),

    /// A server's graceful stop failed. Reported once every stop has finished.
    #[error("server {name} ({address}) failed to stop: {source}")]
    Stop {
        name: String,
        address: String,
        #[source]
        source: io::Error,
    },

    /// A server stopped accepting without being asked to.
    #[error("server {name} ({address}) stopped serving: {source}")]
    Serve {
        name: String,
        address: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to install signal handlers: {0}")]
    Signals(#[source] io::Error),

    /// The parent generation could not be told to drain.
    #[error("failed to close parent process {pid}: {source}")]
    CloseParent {
        pid: u32,
        #[source]
        source: nix::Error,
    },

    #[error("failed to write pid file {}: {source}", path.display())]
    PidFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to prepare listener: {0}")]
    Io(#[from] io::Error),
}

impl GraceError {
    /// Errors that must not cut the drain short; they surface after exit is allowed.
    pub fn is_deferred(&self) -> bool {
        matches!(self, GraceError::Stop { .. })
    }
}

/// Result type for lifecycle operations.
pub type GraceResult<T> = Result<T, GraceError>;
