//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! LISTEN_FDS from parent
//!     → inherit.rs (adopt descriptors 3..3+n, read their addresses)
//!     → registry.rs (claim inherited or bind fresh, one per address)
//!     → listener.rs (raw accept loop) or http::server (supervised servers)
//!
//! On restart:
//!     registry.rs duplicates every active descriptor
//!     → successor exec'd with them installed at 3..3+n
//! ```
//!
//! # Design Decisions
//! - The registry is the only owner of listening descriptors
//! - Identity is network kind + address, never the descriptor number
//! - TLS is optional and layered on by the server supervisor

pub mod addr;
pub mod connection;
pub mod inherit;
pub mod listener;
pub mod registry;
pub mod tls;

pub use addr::{ListenAddr, NetworkKind};
pub use connection::{ConnectionGuard, ConnectionId, ConnectionSet};
pub use listener::{Connection, Listener, ListenerError};
pub use registry::{BoundListener, ListenError, ListenerHandle, ListenerRegistry, SpawnError};
