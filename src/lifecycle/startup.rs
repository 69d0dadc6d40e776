//! Startup steps shared by every serving mode.
//!
//! # Responsibilities
//! - Announce what this generation is serving and where it came from
//! - Tell the parent generation to drain once this one accepts traffic
//! - Publish the pid for `gracectl`
//!
//! # Design Decisions
//! - The parent is only signalled after every server is live
//! - A generation started by init (parent pid 1) never signals its parent
//! - The pid file is replaced atomically so readers never see a partial write

use std::io::Write;
use std::path::Path;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;

use crate::error::GraceError;
use crate::lifecycle::ProcessGeneration;
use crate::net::ListenerHandle;

/// Comma separated list of listener addresses for log lines.
pub fn format_addrs(listeners: &[ListenerHandle]) -> String {
    listeners
        .iter()
        .map(|l| format!("{} {}", l.kind(), l.address()))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Log the startup line of this generation.
pub fn announce(generation: &ProcessGeneration, listeners: &[ListenerHandle]) {
    let addrs = format_addrs(listeners);
    if generation.is_init_activated() {
        tracing::info!(pid = generation.pid(), listeners = %addrs, "Serving with init activated sockets");
    } else if generation.replaces_parent() {
        tracing::info!(
            pid = generation.pid(),
            parent = generation.parent_pid(),
            listeners = %addrs,
            "Graceful handoff, serving"
        );
    } else {
        tracing::info!(pid = generation.pid(), listeners = %addrs, "Serving");
    }
}

/// Ask the parent generation to drain, if this generation replaced one.
pub fn close_parent(generation: &ProcessGeneration) -> Result<(), GraceError> {
    if !generation.replaces_parent() {
        return Ok(());
    }
    let pid = generation.parent_pid();
    kill(Pid::from_raw(pid as i32), Signal::SIGTERM)
        .map_err(|source| GraceError::CloseParent { pid, source })?;
    tracing::info!(parent = pid, "Asked parent process to drain");
    Ok(())
}

/// Write `pid` to `path` through a temporary file and a rename.
pub fn write_pid_file(path: &Path, pid: u32) -> Result<(), GraceError> {
    let err = |source| GraceError::PidFile {
        path: path.to_path_buf(),
        source,
    };

    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(err)?;
    writeln!(tmp, "{}", pid).map_err(err)?;
    tmp.persist(path).map_err(|e| err(e.error))?;
    Ok(())
}

/// Read a pid written by [`write_pid_file`].
pub fn read_pid_file(path: &Path) -> Result<u32, GraceError> {
    let err = |source| GraceError::PidFile {
        path: path.to_path_buf(),
        source,
    };
    let content = std::fs::read_to_string(path).map_err(err)?;
    content.trim().parse().map_err(|e| {
        err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("invalid pid: {}", e),
        ))
    })
}
