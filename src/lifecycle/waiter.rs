//! Work coordinator: keeps the process alive while outstanding work remains.
//!
//! # Responsibilities
//! - Count work the application registers outside of request handling
//! - Block the final exit until that count reaches zero
//!
//! # Design Decisions
//! - One [`Waiter`] trait for every strategy, so callers can plug their own
//! - [`WorkCounter`] wakes waiters the moment the count hits zero; the polling
//!   [`ConnectionSet`](crate::net::ConnectionSet) is offered for raw-socket callers
//! - No timeout: waiting favours never dropping work over bounded exit time

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::watch;

use crate::observability::metrics;

/// Future returned by [`Waiter::wait`].
pub type WaitFuture<'a> = Pin<Box<dyn Future<Output = ()> + Send + 'a>>;

/// Capability gating process exit on outstanding work.
///
/// All methods must be safe to call from any task at any time, including while
/// another task is inside `wait`.
pub trait Waiter: Send + Sync {
    /// Register one unit of outstanding work.
    fn retain(&self);

    /// Release one unit registered with [`retain`](Self::retain).
    fn done(&self);

    /// Resolve once no work is outstanding.
    fn wait(&self) -> WaitFuture<'_>;
}

impl<W: Waiter + ?Sized> Waiter for Arc<W> {
    fn retain(&self) {
        (**self).retain()
    }

    fn done(&self) {
        (**self).done()
    }

    fn wait(&self) -> WaitFuture<'_> {
        (**self).wait()
    }
}

/// Waiter used when the application configured none.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopWaiter;

impl Waiter for NoopWaiter {
    fn retain(&self) {}

    fn done(&self) {}

    fn wait(&self) -> WaitFuture<'_> {
        Box::pin(std::future::ready(()))
    }
}

/// Reference-counting waiter.
///
/// Clones share the same counter.
#[derive(Debug, Clone)]
pub struct WorkCounter {
    count: Arc<watch::Sender<usize>>,
}

impl WorkCounter {
    pub fn new() -> Self {
        Self {
            count: Arc::new(watch::channel(0).0),
        }
    }

    /// Retain and get a guard that releases on drop.
    pub fn guard(&self) -> RetainGuard {
        self.retain();
        RetainGuard {
            counter: self.clone(),
        }
    }

    /// Units of work currently outstanding.
    pub fn outstanding(&self) -> usize {
        *self.count.borrow()
    }
}

impl Default for WorkCounter {
    fn default() -> Self {
        Self::new()
    }
}

impl Waiter for WorkCounter {
    fn retain(&self) {
        let mut current = 0;
        self.count.send_modify(|n| {
            *n += 1;
            current = *n;
        });
        metrics::set_retained_work(current);
    }

    fn done(&self) {
        let mut underflow = false;
        let mut current = 0;
        self.count.send_modify(|n| {
            if *n == 0 {
                underflow = true;
            } else {
                *n -= 1;
                current = *n;
            }
        });
        if underflow {
            panic!("WorkCounter::done called more often than retain");
        }
        metrics::set_retained_work(current);
    }

    fn wait(&self) -> WaitFuture<'_> {
        let mut rx = self.count.subscribe();
        Box::pin(async move {
            // The sender lives in `self`, so the channel cannot close while we wait.
            let _ = rx.wait_for(|n| *n == 0).await;
        })
    }
}

/// Releases one unit of a [`WorkCounter`] when dropped.
#[derive(Debug)]
pub struct RetainGuard {
    counter: WorkCounter,
}

impl Drop for RetainGuard {
    fn drop(&mut self) {
        self.counter.done();
    }
}
