//! OS signal handling.
//!
//! # Responsibilities
//! - Register handlers for SIGTERM, SIGINT and the restart signal
//! - Translate them into [`ProcessSignal`] events on a buffered channel
//! - Hand the OS default back for SIGTERM/SIGINT once a drain started
//!
//! # Design Decisions
//! - Uses Tokio's signal streams; delivery never blocks the handler
//! - One consumer: the lifecycle state machine
//! - A second SIGTERM/SIGINT during a drain terminates the process immediately

use std::fmt;
use std::io;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc::{self, error::TrySendError};

/// Capacity of the signal event channel.
pub const SIGNAL_BUFFER: usize = 10;

/// A signal event the lifecycle reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessSignal {
    Terminate,
    Interrupt,
    Restart,
}

impl ProcessSignal {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessSignal::Terminate => "terminate",
            ProcessSignal::Interrupt => "interrupt",
            ProcessSignal::Restart => "restart",
        }
    }

    pub fn is_termination(&self) -> bool {
        matches!(self, ProcessSignal::Terminate | ProcessSignal::Interrupt)
    }
}

impl fmt::Display for ProcessSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which OS signal requests a graceful restart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RestartSignal {
    #[default]
    #[serde(rename = "SIGUSR2")]
    Usr2,
    #[serde(rename = "SIGHUP")]
    Hup,
}

impl RestartSignal {
    pub fn kind(&self) -> SignalKind {
        match self {
            RestartSignal::Usr2 => SignalKind::user_defined2(),
            RestartSignal::Hup => SignalKind::hangup(),
        }
    }

    /// The signal as sent by `kill`.
    pub fn as_nix(&self) -> nix::sys::signal::Signal {
        match self {
            RestartSignal::Usr2 => nix::sys::signal::Signal::SIGUSR2,
            RestartSignal::Hup => nix::sys::signal::Signal::SIGHUP,
        }
    }
}

impl FromStr for RestartSignal {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s.to_ascii_uppercase();
        match name.strip_prefix("SIG").unwrap_or(name.as_str()) {
            "USR2" => Ok(RestartSignal::Usr2),
            "HUP" => Ok(RestartSignal::Hup),
            _ => Err(format!("unsupported restart signal: {}", s)),
        }
    }
}

impl fmt::Display for RestartSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RestartSignal::Usr2 => f.write_str("SIGUSR2"),
            RestartSignal::Hup => f.write_str("SIGHUP"),
        }
    }
}

/// Switch that hands SIGTERM/SIGINT back to the OS default action.
///
/// Once armed, the next SIGTERM or SIGINT terminates the process without running
/// any further drain logic.
#[derive(Debug, Clone, Default)]
pub struct DrainEscalation {
    armed: Arc<AtomicBool>,
}

impl DrainEscalation {
    /// A switch not wired to any OS handler.
    pub fn detached() -> Self {
        Self::default()
    }

    fn register(&self) -> io::Result<()> {
        for sig in [signal_hook::consts::SIGTERM, signal_hook::consts::SIGINT] {
            signal_hook::flag::register_conditional_default(sig, Arc::clone(&self.armed))?;
        }
        Ok(())
    }

    pub fn arm(&self) {
        self.armed.store(true, Ordering::SeqCst);
    }

    pub fn is_armed(&self) -> bool {
        self.armed.load(Ordering::SeqCst)
    }
}

/// Stream of signal events for the state machine.
pub struct SignalSource {
    rx: mpsc::Receiver<ProcessSignal>,
    escalation: DrainEscalation,
}

impl SignalSource {
    /// Install OS signal handlers.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn install(restart: RestartSignal) -> io::Result<Self> {
        let escalation = DrainEscalation::default();
        escalation.register()?;

        let mut terminate = signal(SignalKind::terminate())?;
        let mut interrupt = signal(SignalKind::interrupt())?;
        let mut restart_stream = signal(restart.kind())?;

        let (tx, rx) = mpsc::channel(SIGNAL_BUFFER);
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    Some(()) = terminate.recv() => ProcessSignal::Terminate,
                    Some(()) = interrupt.recv() => ProcessSignal::Interrupt,
                    Some(()) = restart_stream.recv() => ProcessSignal::Restart,
                    else => break,
                };
                match tx.try_send(event) {
                    Ok(()) => {}
                    Err(TrySendError::Full(event)) => {
                        tracing::warn!(signal = %event, "Signal buffer full, dropping signal");
                    }
                    Err(TrySendError::Closed(_)) => break,
                }
            }
        });

        tracing::debug!(restart_signal = %restart, "Signal handlers installed");
        Ok(Self { rx, escalation })
    }

    /// A source fed by hand instead of by the OS.
    ///
    /// Used by tests and by applications that drive restarts themselves.
    pub fn manual() -> (mpsc::Sender<ProcessSignal>, Self) {
        let (tx, rx) = mpsc::channel(SIGNAL_BUFFER);
        (
            tx,
            Self {
                rx,
                escalation: DrainEscalation::detached(),
            },
        )
    }

    pub fn escalation(&self) -> &DrainEscalation {
        &self.escalation
    }

    pub fn into_parts(self) -> (mpsc::Receiver<ProcessSignal>, DrainEscalation) {
        (self.rx, self.escalation)
    }
}
