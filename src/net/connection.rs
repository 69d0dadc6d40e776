//! Live-connection tracking for raw-socket servers.
//!
//! # Responsibilities
//! - Generate unique connection IDs for tracing
//! - Track which connections are still open
//! - Gate process exit until the set is empty
//!
//! # Design Decisions
//! - Emptiness is polled at a fixed interval; exit lags the last close by up to one
//!   interval, which is fine for callers that cannot wrap each unit of work
//! - Also a [`Waiter`], so it plugs into the same exit gate as [`WorkCounter`]
//!
//! [`WorkCounter`]: crate::lifecycle::WorkCounter

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::lifecycle::waiter::{WaitFuture, Waiter};

/// Global atomic counter for connection IDs.
static CONNECTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Poll interval used when none is configured.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Unique identifier for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Generate a new unique connection ID.
    pub fn new() -> Self {
        Self(CONNECTION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

#[derive(Debug, Default)]
struct Tracked {
    conns: HashSet<ConnectionId>,
    /// Work registered through [`Waiter::retain`] without an ID.
    anonymous: usize,
}

impl Tracked {
    fn len(&self) -> usize {
        self.conns.len() + self.anonymous
    }
}

/// Set of live connections, polled until empty.
#[derive(Debug, Clone)]
pub struct ConnectionSet {
    tracked: Arc<Mutex<Tracked>>,
    poll_interval: Duration,
}

impl ConnectionSet {
    pub fn new() -> Self {
        Self::with_poll_interval(DEFAULT_POLL_INTERVAL)
    }

    pub fn with_poll_interval(poll_interval: Duration) -> Self {
        Self {
            tracked: Arc::new(Mutex::new(Tracked::default())),
            poll_interval,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Tracked> {
        self.tracked.lock().expect("connection set mutex poisoned")
    }

    /// Record a new live connection.
    pub fn add_conn(&self) -> ConnectionId {
        let id = ConnectionId::new();
        self.lock().conns.insert(id);
        tracing::trace!(connection_id = %id, "Connection tracked");
        id
    }

    /// Forget a connection. Unknown IDs are ignored.
    pub fn remove_conn(&self, id: ConnectionId) {
        if self.lock().conns.remove(&id) {
            tracing::trace!(connection_id = %id, "Connection closed");
        }
    }

    /// Record a connection and get a guard that removes it on drop.
    pub fn track(&self) -> ConnectionGuard {
        ConnectionGuard {
            set: self.clone(),
            id: self.add_conn(),
        }
    }

    /// Connections and anonymous work still outstanding.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ConnectionSet {
    fn default() -> Self {
        Self::new()
    }
}

impl Waiter for ConnectionSet {
    fn retain(&self) {
        self.lock().anonymous += 1;
    }

    fn done(&self) {
        let mut tracked = self.lock();
        if tracked.anonymous == 0 {
            drop(tracked);
            panic!("ConnectionSet::done called more often than retain");
        }
        tracked.anonymous -= 1;
    }

    fn wait(&self) -> WaitFuture<'_> {
        Box::pin(async move {
            loop {
                let remaining = self.len();
                if remaining == 0 {
                    break;
                }
                tracing::debug!(remaining, "Waiting for connections to close");
                tokio::time::sleep(self.poll_interval).await;
            }
        })
    }
}

/// Guard that tracks a connection's lifetime.
#[derive(Debug)]
pub struct ConnectionGuard {
    set: ConnectionSet,
    id: ConnectionId,
}

impl ConnectionGuard {
    pub fn id(&self) -> ConnectionId {
        self.id
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.set.remove_conn(self.id);
    }
}
