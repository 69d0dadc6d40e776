//! Listener registry and successor launcher.
//!
//! # Responsibilities
//! - Hand out listening sockets, preferring ones inherited from the parent generation
//! - Keep a descriptor for every active listener so a successor can be given a copy
//! - Spawn the successor with those descriptors installed at `3..3+n`
//!
//! # Design Decisions
//! - The registry owns one descriptor per listener; callers always get a duplicate,
//!   so closing a caller's listener never removes the address from a handoff
//! - One mutex guards the whole state and is held across every read-modify-write,
//!   including the full spawn of a successor
//! - A failed spawn leaves every listener exactly as it was

use std::io;
use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, OwnedFd, RawFd};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command};
use std::sync::{Arc, Mutex, MutexGuard};

use thiserror::Error;
use tokio::sync::watch;

use crate::lifecycle::ProcessGeneration;
use crate::net::addr::{ListenAddr, NetworkKind};
use crate::net::inherit::{self, INHERITED_FD_START, LISTEN_FDS_ENV};
use crate::observability::metrics;

/// Errors produced while acquiring listeners.
#[derive(Debug, Error)]
pub enum ListenError {
    /// Address is unavailable and no inherited listener matches it.
    #[error("failed to bind {network} {address}: {source}")]
    Bind {
        network: NetworkKind,
        address: String,
        #[source]
        source: io::Error,
    },

    /// The address is already active in this generation.
    #[error("{network} {address} is already bound in this process")]
    AlreadyBound { network: NetworkKind, address: String },

    #[error("unsupported network: {0}")]
    UnsupportedNetwork(String),

    #[error("invalid address {address}: {reason}")]
    InvalidAddress { address: String, reason: String },

    /// An inherited descriptor could not be adopted.
    #[error("inherited descriptor {fd} is unusable: {reason}")]
    Inherit { fd: RawFd, reason: String },

    /// The listener exists but is of a different network kind than requested.
    #[error("listener {address} is a {actual} listener, not {expected}")]
    WrongKind {
        address: String,
        expected: &'static str,
        actual: NetworkKind,
    },

    #[error("failed to duplicate listener descriptor: {0}")]
    Duplicate(#[source] io::Error),

    /// The registry has been closed by a drain.
    #[error("listener registry is closed")]
    Closed,
}

/// Errors produced while starting a successor generation.
#[derive(Debug, Error)]
pub enum SpawnError {
    #[error("no executable known for the successor process")]
    NoExecutable,

    #[error("failed to duplicate listener descriptor for successor: {0}")]
    Duplicate(#[source] nix::Error),

    #[error("failed to start successor {}: {source}", executable.display())]
    Exec {
        executable: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// A listening socket tracked by the registry.
///
/// Identity is `(kind, address)`. Cloning shares the underlying descriptor.
#[derive(Debug, Clone)]
pub struct ListenerHandle {
    kind: NetworkKind,
    address: ListenAddr,
    fd: Arc<OwnedFd>,
    inherited: bool,
}

impl ListenerHandle {
    pub(crate) fn new(kind: NetworkKind, address: ListenAddr, fd: OwnedFd, inherited: bool) -> Self {
        Self {
            kind,
            address,
            fd: Arc::new(fd),
            inherited,
        }
    }

    pub fn kind(&self) -> NetworkKind {
        self.kind
    }

    pub fn address(&self) -> &ListenAddr {
        &self.address
    }

    /// Whether this listener came from the parent generation.
    pub fn is_inherited(&self) -> bool {
        self.inherited
    }

    pub fn raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    fn matches(&self, kind: NetworkKind, address: &ListenAddr) -> bool {
        kind.accepts(self.kind) && self.address.same_as(address)
    }

    fn duplicate(&self) -> Result<OwnedFd, ListenError> {
        self.fd.try_clone().map_err(ListenError::Duplicate)
    }

    /// A new TCP listener sharing this socket.
    pub fn to_tcp(&self) -> Result<std::net::TcpListener, ListenError> {
        if self.kind == NetworkKind::Unix {
            return Err(self.wrong_kind("tcp"));
        }
        Ok(std::net::TcpListener::from(self.duplicate()?))
    }

    /// A new Unix listener sharing this socket.
    pub fn to_unix(&self) -> Result<std::os::unix::net::UnixListener, ListenError> {
        if self.kind != NetworkKind::Unix {
            return Err(self.wrong_kind("unix"));
        }
        Ok(std::os::unix::net::UnixListener::from(self.duplicate()?))
    }

    /// A new listener of whichever kind this socket is.
    pub fn to_bound(&self) -> Result<BoundListener, ListenError> {
        match self.kind {
            NetworkKind::Unix => self.to_unix().map(BoundListener::Unix),
            _ => self.to_tcp().map(BoundListener::Tcp),
        }
    }

    fn wrong_kind(&self, expected: &'static str) -> ListenError {
        ListenError::WrongKind {
            address: self.address.to_string(),
            expected,
            actual: self.kind,
        }
    }
}

/// A listener returned by [`ListenerRegistry::listen`].
#[derive(Debug)]
pub enum BoundListener {
    Tcp(std::net::TcpListener),
    Unix(std::os::unix::net::UnixListener),
}

#[derive(Default)]
struct RegistryState {
    /// Inherited listeners nobody asked for yet.
    inherited: Vec<ListenerHandle>,
    active: Vec<ListenerHandle>,
    closed: bool,
}

/// Owner of every listening socket of this generation.
pub struct ListenerRegistry {
    generation: ProcessGeneration,
    executable: Option<PathBuf>,
    state: Mutex<RegistryState>,
    closed_tx: watch::Sender<bool>,
}

impl ListenerRegistry {
    /// Create the registry, adopting every descriptor the generation inherited.
    pub fn new(generation: ProcessGeneration) -> Result<Self, ListenError> {
        let inherited = inherit::adopt_from_env(&generation)?;
        Ok(Self::with_inherited(generation, inherited))
    }

    /// Create a registry from already adopted inherited listeners.
    pub fn with_inherited(generation: ProcessGeneration, inherited: Vec<ListenerHandle>) -> Self {
        // Resolved now: after an on-disk upgrade the path names the new binary.
        let executable = match std::env::current_exe() {
            Ok(path) => Some(path),
            Err(e) => {
                tracing::warn!(error = %e, "Cannot resolve current executable, restarts disabled");
                None
            }
        };

        Self {
            generation,
            executable,
            state: Mutex::new(RegistryState {
                inherited,
                ..Default::default()
            }),
            closed_tx: watch::channel(false).0,
        }
    }

    /// Override the binary started by [`start_successor`](Self::start_successor).
    pub fn with_executable(mut self, executable: impl Into<PathBuf>) -> Self {
        self.executable = Some(executable.into());
        self
    }

    pub fn generation(&self) -> &ProcessGeneration {
        &self.generation
    }

    pub fn executable(&self) -> Option<&Path> {
        self.executable.as_deref()
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().expect("listener registry mutex poisoned")
    }

    /// Listen on `address` of the given network (`tcp`, `tcp4`, `tcp6`, `unix`).
    pub fn listen(&self, network: &str, address: &str) -> Result<BoundListener, ListenError> {
        let kind: NetworkKind = network.parse()?;
        let addr = ListenAddr::resolve(kind, address)?;
        self.claim(kind, addr)?.to_bound()
    }

    pub fn listen_tcp(&self, addr: SocketAddr) -> Result<std::net::TcpListener, ListenError> {
        self.claim(NetworkKind::Tcp, ListenAddr::Inet(addr))?.to_tcp()
    }

    pub fn listen_unix(&self, path: impl AsRef<Path>) -> Result<std::os::unix::net::UnixListener, ListenError> {
        self.claim(NetworkKind::Unix, ListenAddr::Unix(path.as_ref().to_path_buf()))?
            .to_unix()
    }

    /// Claim the inherited listener for `address`, or bind a fresh one.
    pub fn claim(&self, kind: NetworkKind, address: ListenAddr) -> Result<ListenerHandle, ListenError> {
        let mut state = self.lock();
        if state.closed {
            return Err(ListenError::Closed);
        }

        if let Some(pos) = state.inherited.iter().position(|h| h.matches(kind, &address)) {
            let handle = state.inherited.swap_remove(pos);
            tracing::debug!(network = %handle.kind, address = %handle.address, "Reusing inherited listener");
            state.active.push(handle.clone());
            metrics::set_active_listeners(state.active.len());
            return Ok(handle);
        }

        if state.active.iter().any(|h| h.matches(kind, &address)) {
            return Err(ListenError::AlreadyBound {
                network: kind,
                address: address.to_string(),
            });
        }

        let handle = bind_fresh(kind, &address)?;
        tracing::debug!(network = %handle.kind, address = %handle.address, "Bound new listener");
        state.active.push(handle.clone());
        metrics::set_active_listeners(state.active.len());
        Ok(handle)
    }

    /// Every listener currently active in this generation.
    pub fn active_listeners(&self) -> Vec<ListenerHandle> {
        self.lock().active.clone()
    }

    /// Close inherited listeners no server claimed.
    ///
    /// Returns how many were released.
    pub fn release_unclaimed(&self) -> usize {
        let released: Vec<ListenerHandle> = self.lock().inherited.drain(..).collect();
        for handle in &released {
            tracing::warn!(
                network = %handle.kind,
                address = %handle.address,
                "Closing inherited listener nobody claimed"
            );
        }
        released.len()
    }

    /// Drop every registry-held descriptor and tell raw listeners to stop accepting.
    pub fn close_all(&self) {
        let mut state = self.lock();
        if state.closed {
            return;
        }
        let count = state.active.len();
        state.active.clear();
        state.inherited.clear();
        state.closed = true;
        self.closed_tx.send_replace(true);
        metrics::set_active_listeners(0);
        tracing::info!(listeners = count, "Listener registry closed");
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Receiver that flips to `true` once [`close_all`](Self::close_all) ran.
    pub fn subscribe_closed(&self) -> watch::Receiver<bool> {
        self.closed_tx.subscribe()
    }

    /// Start a copy of this executable that inherits every active listener.
    ///
    /// The child gets the same arguments, working directory and environment plus
    /// `LISTEN_FDS`. On failure nothing about the current listeners changes.
    pub fn start_successor(&self) -> Result<u32, SpawnError> {
        let state = self.lock();
        let executable = self.executable.clone().ok_or(SpawnError::NoExecutable)?;

        let count = state.active.len();
        let floor = INHERITED_FD_START + count as RawFd;

        // Parked above the target range and close-on-exec: only the dup2'd copies
        // survive into the new image.
        let parked = state
            .active
            .iter()
            .map(|h| inherit::dup_above(h.raw_fd(), floor))
            .collect::<Result<Vec<OwnedFd>, _>>()
            .map_err(SpawnError::Duplicate)?;
        let sources: Vec<RawFd> = parked.iter().map(AsRawFd::as_raw_fd).collect();

        let mut command = Command::new(&executable);
        command
            .args(std::env::args_os().skip(1))
            .env(LISTEN_FDS_ENV, count.to_string());

        // SAFETY: the hook runs between fork and exec and only calls dup2.
        unsafe {
            command.pre_exec(move || inherit::install_fds(&sources));
        }

        match command.spawn() {
            Ok(child) => {
                let pid = child.id();
                tracing::info!(
                    pid,
                    executable = %executable.display(),
                    listeners = count,
                    "Started successor process"
                );
                metrics::record_handoff("spawned");
                drop(parked);
                reap(child);
                Ok(pid)
            }
            Err(source) => {
                metrics::record_handoff("spawn_failed");
                Err(SpawnError::Exec { executable, source })
            }
        }
    }
}

/// Wait for `child` on a detached thread so a successor that dies early does not
/// linger as a zombie. A successor that takes over outlives this process.
fn reap(mut child: Child) {
    let pid = child.id();
    let spawned = std::thread::Builder::new()
        .name("successor-reaper".to_string())
        .spawn(move || match child.wait() {
            Ok(status) if status.success() => tracing::debug!(pid, "Successor exited"),
            Ok(status) => tracing::warn!(pid, status = %status, "Successor exited with failure"),
            Err(e) => tracing::warn!(pid, error = %e, "Failed to wait for successor"),
        });
    if let Err(e) = spawned {
        tracing::warn!(pid, error = %e, "Failed to start successor reaper");
    }
}

fn bind_fresh(kind: NetworkKind, address: &ListenAddr) -> Result<ListenerHandle, ListenError> {
    let bind_err = |source: io::Error| ListenError::Bind {
        network: kind,
        address: address.to_string(),
        source,
    };

    match address {
        ListenAddr::Inet(addr) => {
            let listener = std::net::TcpListener::bind(addr).map_err(bind_err)?;
            let local = listener.local_addr().map_err(bind_err)?;
            Ok(ListenerHandle::new(
                NetworkKind::for_inet(&local),
                ListenAddr::Inet(local),
                listener.into(),
                false,
            ))
        }
        ListenAddr::Unix(path) => {
            let listener = std::os::unix::net::UnixListener::bind(path).map_err(bind_err)?;
            Ok(ListenerHandle::new(
                NetworkKind::Unix,
                ListenAddr::Unix(path.clone()),
                listener.into(),
                false,
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};

    fn registry() -> ListenerRegistry {
        ListenerRegistry::with_inherited(ProcessGeneration::fresh(), Vec::new())
    }

    #[test]
    fn binds_fresh_and_tracks_active() {
        let registry = registry();
        let listener = registry.listen("tcp", "127.0.0.1:0").unwrap();
        let BoundListener::Tcp(listener) = listener else {
            panic!("expected a tcp listener");
        };
        let addr = listener.local_addr().unwrap();

        let active = registry.active_listeners();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].address(), &ListenAddr::Inet(addr));
        assert!(!active[0].is_inherited());
    }

    #[test]
    fn address_is_bound_once_per_generation() {
        let registry = registry();
        let first = registry.listen_tcp("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = first.local_addr().unwrap();

        let err = registry.listen_tcp(addr).unwrap_err();
        assert!(matches!(err, ListenError::AlreadyBound { .. }));
    }

    #[test]
    fn bind_error_when_taken_elsewhere() {
        let outsider = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = outsider.local_addr().unwrap();

        let err = registry().listen_tcp(addr).unwrap_err();
        assert!(matches!(err, ListenError::Bind { .. }));
    }

    #[test]
    fn inherited_listener_is_reused_and_accepts() {
        // Parent generation binds the address.
        let parent = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = parent.local_addr().unwrap();
        let inherited = inherit::adopt(parent.try_clone().unwrap().into()).unwrap();

        let generation = ProcessGeneration::new(1, 1, 1);
        let registry = ListenerRegistry::with_inherited(generation, vec![inherited]);

        // A client connects before the child claims the socket and while the parent
        // closes its copy: the connection waits in the shared backlog.
        let mut client = std::net::TcpStream::connect(addr).unwrap();
        drop(parent);

        let listener = registry.listen_tcp(addr).unwrap();
        assert!(registry.active_listeners()[0].is_inherited());

        let (mut conn, _) = listener.accept().unwrap();
        client.write_all(b"ping").unwrap();
        let mut buf = [0u8; 4];
        conn.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[test]
    fn unspecified_request_matches_inherited() {
        let parent = std::net::TcpListener::bind("0.0.0.0:0").unwrap();
        let port = parent.local_addr().unwrap().port();
        let inherited = inherit::adopt(parent.into()).unwrap();

        let registry = ListenerRegistry::with_inherited(ProcessGeneration::new(1, 1, 1), vec![inherited]);
        registry.listen("tcp", &format!(":{}", port)).unwrap();
        assert!(registry.active_listeners()[0].is_inherited());
    }

    #[test]
    fn unix_listeners() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.sock");
        let registry = registry();

        let listener = registry.listen_unix(&path).unwrap();
        assert!(path.exists());
        let _client = std::os::unix::net::UnixStream::connect(&path).unwrap();
        listener.accept().unwrap();

        assert!(matches!(
            registry.active_listeners()[0].to_tcp(),
            Err(ListenError::WrongKind { .. })
        ));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn successor_that_exits_is_reaped() {
        let registry = registry().with_executable("/bin/true");
        let pid = registry.start_successor().unwrap();

        // A zombie keeps its /proc entry until it is waited for.
        let entry = PathBuf::from(format!("/proc/{}", pid));
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        while entry.exists() {
            assert!(std::time::Instant::now() < deadline, "successor {} was never reaped", pid);
            std::thread::sleep(std::time::Duration::from_millis(20));
        }
    }

    #[test]
    fn spawn_failure_leaves_listeners_untouched() {
        let registry = registry().with_executable("/nonexistent/grace-handoff-successor");
        let listener = registry.listen_tcp("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = listener.local_addr().unwrap();

        let err = registry.start_successor().unwrap_err();
        assert!(matches!(err, SpawnError::Exec { .. }));

        assert_eq!(registry.active_listeners().len(), 1);
        let _client = std::net::TcpStream::connect(addr).unwrap();
        listener.accept().unwrap();
    }

    #[test]
    fn successor_is_spawned() {
        let registry = registry().with_executable("/bin/true");
        registry.listen_tcp("127.0.0.1:0".parse().unwrap()).unwrap();

        let pid = registry.start_successor().unwrap();
        assert!(pid > 0);
        assert_eq!(registry.active_listeners().len(), 1);
    }

    #[test]
    fn close_all_is_final() {
        let registry = registry();
        registry.listen_tcp("127.0.0.1:0".parse().unwrap()).unwrap();
        let closed = registry.subscribe_closed();

        registry.close_all();
        assert!(*closed.borrow());
        assert!(registry.active_listeners().is_empty());
        assert!(matches!(
            registry.listen("tcp", "127.0.0.1:0"),
            Err(ListenError::Closed)
        ));
    }

    #[test]
    fn unclaimed_inherited_listeners_are_released() {
        let parent = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let inherited = inherit::adopt(parent.into()).unwrap();
        let registry = ListenerRegistry::with_inherited(ProcessGeneration::new(1, 1, 1), vec![inherited]);

        assert_eq!(registry.release_unclaimed(), 1);
        assert_eq!(registry.release_unclaimed(), 0);
    }
}
