//! Metrics collection and exposition.
//!
//! # Responsibilities
//! - Define lifecycle metrics (signals, handoffs, server stops, retained work)
//! - Install the Prometheus recorder and render the scrape output
//!
//! # Metrics
//! - `grace_signals_total` (counter): signals handled, by `signal`
//! - `grace_handoffs_total` (counter): successor spawns, by `outcome`
//! - `grace_server_stops_total` (counter): server stops, by `outcome`
//! - `grace_retained_work` (gauge): units held by the work counter
//! - `grace_active_listeners` (gauge): listeners owned by the registry
//!
//! # Design Decisions
//! - Recording without an installed recorder is a no-op, so library users pay nothing
//! - Label values are static strings

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

/// Install the global Prometheus recorder.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    describe();
    Ok(handle)
}

fn describe() {
    ::metrics::describe_counter!("grace_signals_total", "Signals handled by the lifecycle");
    ::metrics::describe_counter!("grace_handoffs_total", "Successor process spawn attempts");
    ::metrics::describe_counter!("grace_server_stops_total", "Supervised server stops");
    ::metrics::describe_gauge!("grace_retained_work", "Outstanding retained work units");
    ::metrics::describe_gauge!("grace_active_listeners", "Listeners owned by this generation");
}

pub fn record_signal(signal: &'static str) {
    ::metrics::counter!("grace_signals_total", "signal" => signal).increment(1);
}

pub fn record_handoff(outcome: &'static str) {
    ::metrics::counter!("grace_handoffs_total", "outcome" => outcome).increment(1);
}

pub fn record_server_stop(outcome: &'static str) {
    ::metrics::counter!("grace_server_stops_total", "outcome" => outcome).increment(1);
}

pub fn set_retained_work(count: usize) {
    ::metrics::gauge!("grace_retained_work").set(count as f64);
}

pub fn set_active_listeners(count: usize) {
    ::metrics::gauge!("grace_active_listeners").set(count as f64);
}
