//! Error aggregation for the lifecycle.
//!
//! # Responsibilities
//! - Funnel fatal and stop errors from server tasks into the run loop
//! - Keep non-fatal errors (failed spawns, failed hooks) for later inspection
//!
//! # Design Decisions
//! - Bounded channel sized `1 + 2n` for `n` servers: one error per server while
//!   serving, one per server while stopping, one spare
//! - Reporting never blocks; a full channel drops the error with a warning

use std::sync::{Arc, Mutex};

use tokio::sync::mpsc::{self, error::TrySendError};

use crate::error::GraceError;

/// Upper bound on recorded non-fatal errors kept in memory.
const MAX_RECORDED: usize = 64;

/// Capacity of the error channel for `servers` supervised servers.
pub fn channel_capacity(servers: usize) -> usize {
    1 + 2 * servers
}

/// Non-fatal errors recorded while running.
#[derive(Clone, Default)]
pub struct RecordedErrors {
    inner: Arc<Mutex<Vec<GraceError>>>,
}

impl RecordedErrors {
    fn push(&self, err: GraceError) {
        let mut errors = self.inner.lock().expect("recorded errors mutex poisoned");
        if errors.len() == MAX_RECORDED {
            errors.remove(0);
        }
        errors.push(err);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("recorded errors mutex poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Rendered messages, oldest first.
    pub fn messages(&self) -> Vec<String> {
        self.inner
            .lock()
            .expect("recorded errors mutex poisoned")
            .iter()
            .map(ToString::to_string)
            .collect()
    }

    /// Remove and return everything recorded so far.
    pub fn take(&self) -> Vec<GraceError> {
        std::mem::take(&mut *self.inner.lock().expect("recorded errors mutex poisoned"))
    }
}

impl std::fmt::Debug for RecordedErrors {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordedErrors").field("len", &self.len()).finish()
    }
}

/// Sending half handed to server tasks and the state machine.
#[derive(Clone)]
pub struct ErrorSink {
    tx: mpsc::Sender<GraceError>,
    recorded: RecordedErrors,
}

impl ErrorSink {
    /// Hand an error to the run loop.
    pub fn report(&self, err: GraceError) {
        match self.tx.try_send(err) {
            Ok(()) => {}
            Err(TrySendError::Full(err)) => {
                tracing::warn!(error = %err, "Error channel full, dropping error");
            }
            Err(TrySendError::Closed(err)) => {
                tracing::debug!(error = %err, "Run loop gone, dropping error");
            }
        }
    }

    /// Log and keep an error that does not change the lifecycle.
    pub fn record(&self, err: GraceError) {
        tracing::error!(error = %err, "Lifecycle operation failed");
        self.recorded.push(err);
    }
}

/// Receiving half, owned by the run loop.
pub struct ErrorAggregator {
    rx: mpsc::Receiver<GraceError>,
    tx: mpsc::Sender<GraceError>,
    recorded: RecordedErrors,
}

impl ErrorAggregator {
    /// Aggregator for `servers` supervised servers.
    pub fn new(servers: usize) -> Self {
        let (tx, rx) = mpsc::channel(channel_capacity(servers));
        Self {
            rx,
            tx,
            recorded: RecordedErrors::default(),
        }
    }

    pub fn sink(&self) -> ErrorSink {
        ErrorSink {
            tx: self.tx.clone(),
            recorded: self.recorded.clone(),
        }
    }

    pub fn recorded(&self) -> RecordedErrors {
        self.recorded.clone()
    }

    /// Wait for the next reported error.
    ///
    /// # Panics
    /// If the channel yields nothing. The aggregator keeps a sender alive, so that
    /// can only mean the lifecycle is corrupted.
    pub async fn next(&mut self) -> GraceError {
        match self.rx.recv().await {
            Some(err) => err,
            None => panic!("error channel closed while the lifecycle was running"),
        }
    }

    /// An error already waiting in the channel, if any.
    pub fn try_next(&mut self) -> Option<GraceError> {
        self.rx.try_recv().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    fn stop_error(name: &str) -> GraceError {
        GraceError::Stop {
            name: name.to_string(),
            address: "127.0.0.1:0".to_string(),
            source: io::Error::other("boom"),
        }
    }

    #[test]
    fn capacity_scales_with_servers() {
        assert_eq!(channel_capacity(0), 1);
        assert_eq!(channel_capacity(3), 7);
    }

    #[tokio::test]
    async fn reports_are_delivered_in_order() {
        let mut errors = ErrorAggregator::new(1);
        let sink = errors.sink();
        sink.report(stop_error("a"));
        sink.report(stop_error("b"));

        assert!(errors.next().await.to_string().contains("server a"));
        assert!(errors.try_next().unwrap().to_string().contains("server b"));
        assert!(errors.try_next().is_none());
    }

    #[test]
    fn full_channel_drops_without_blocking() {
        let mut errors = ErrorAggregator::new(0);
        let sink = errors.sink();
        sink.report(stop_error("kept"));
        sink.report(stop_error("dropped"));

        assert!(errors.try_next().unwrap().to_string().contains("kept"));
        assert!(errors.try_next().is_none());
    }

    #[test]
    fn recorded_errors_are_kept_separately() {
        let mut errors = ErrorAggregator::new(1);
        let sink = errors.sink();
        sink.record(GraceError::Hook("not ready".into()));

        assert!(errors.try_next().is_none());
        let recorded = errors.recorded();
        assert_eq!(recorded.len(), 1);
        assert!(recorded.messages()[0].contains("not ready"));
        assert_eq!(recorded.take().len(), 1);
        assert!(recorded.is_empty());
    }
}
