//! Raw listeners for callers that drive their own accept loop.
//!
//! # Responsibilities
//! - Wrap a registry listener for the Tokio reactor
//! - Stop accepting once the registry is closed by a drain
//!
//! # Design Decisions
//! - A closed listener drops its socket on the next `accept`, which is what makes the
//!   address stop accepting in this generation
//! - Established connections are never touched

use std::io;
use std::net::SocketAddr;

use thiserror::Error;
use tokio::net::{TcpStream, UnixStream};
use tokio::sync::watch;

use crate::net::addr::ListenAddr;
use crate::net::registry::BoundListener;

/// Error type for listener operations.
#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("failed to accept: {0}")]
    Accept(#[source] io::Error),

    /// The listener was closed because the process is draining.
    #[error("listener closed")]
    Closed,
}

/// An accepted connection.
#[derive(Debug)]
pub enum Connection {
    Tcp(TcpStream, SocketAddr),
    Unix(UnixStream),
}

enum Inner {
    Tcp(tokio::net::TcpListener),
    Unix(tokio::net::UnixListener),
}

impl Inner {
    async fn accept(&self) -> io::Result<Connection> {
        match self {
            Inner::Tcp(l) => l.accept().await.map(|(s, a)| Connection::Tcp(s, a)),
            Inner::Unix(l) => l.accept().await.map(|(s, _)| Connection::Unix(s)),
        }
    }
}

/// A listener obtained from [`GracefulNet`](crate::GracefulNet).
pub struct Listener {
    inner: Option<Inner>,
    address: ListenAddr,
    closed: watch::Receiver<bool>,
}

impl Listener {
    /// Register a bound listener with the current Tokio runtime.
    pub(crate) fn new(bound: BoundListener, closed: watch::Receiver<bool>) -> io::Result<Self> {
        let (inner, address) = match bound {
            BoundListener::Tcp(l) => {
                l.set_nonblocking(true)?;
                let address = ListenAddr::Inet(l.local_addr()?);
                (Inner::Tcp(tokio::net::TcpListener::from_std(l)?), address)
            }
            BoundListener::Unix(l) => {
                l.set_nonblocking(true)?;
                let address = l
                    .local_addr()?
                    .as_pathname()
                    .map(|p| ListenAddr::Unix(p.to_path_buf()))
                    .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "unnamed unix socket"))?;
                (Inner::Unix(tokio::net::UnixListener::from_std(l)?), address)
            }
        };

        Ok(Self {
            inner: Some(inner),
            address,
            closed,
        })
    }

    /// Accept the next connection.
    ///
    /// Returns [`ListenerError::Closed`] once the process started draining.
    pub async fn accept(&mut self) -> Result<Connection, ListenerError> {
        let outcome = match &self.inner {
            None => return Err(ListenerError::Closed),
            Some(inner) => {
                let mut closed = self.closed.clone();
                tokio::select! {
                    res = inner.accept() => Some(res),
                    _ = closed.wait_for(|c| *c) => None,
                }
            }
        };

        match outcome {
            Some(res) => {
                let conn = res.map_err(ListenerError::Accept)?;
                tracing::trace!(address = %self.address, "Connection accepted");
                Ok(conn)
            }
            None => {
                self.close();
                Err(ListenerError::Closed)
            }
        }
    }

    /// Stop accepting on this listener.
    pub fn close(&mut self) {
        if self.inner.take().is_some() {
            tracing::debug!(address = %self.address, "Listener closed");
        }
    }

    pub fn local_addr(&self) -> &ListenAddr {
        &self.address
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_none()
    }
}
