//! Descriptor inheritance across an exec boundary.
//!
//! A parent generation places its listening sockets at descriptors `3..3+n` of the
//! child and sets `LISTEN_FDS=n`. This is the same layout systemd socket activation
//! uses, so an init-activated process is handled by the same code.
//!
//! Fails hard if the environment claims descriptors that are not sockets: a
//! half-inherited state is a bug in the parent, and serving from it would hide that.

use std::net::{SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use nix::fcntl::{fcntl, FcntlArg, FdFlag};
use nix::sys::socket::{getsockname, SockaddrStorage};

use crate::lifecycle::ProcessGeneration;
use crate::net::addr::{ListenAddr, NetworkKind};
use crate::net::registry::{ListenError, ListenerHandle};

/// Environment variable carrying the number of inherited descriptors.
pub const LISTEN_FDS_ENV: &str = "LISTEN_FDS";

/// First inherited descriptor, right after the standard streams.
pub const INHERITED_FD_START: RawFd = 3;

/// Number of inherited descriptors announced by the environment.
///
/// Absent or unparseable values mean a cold start.
pub fn count_from_env() -> usize {
    std::env::var(LISTEN_FDS_ENV)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(0)
}

/// Adopt every descriptor the generation inherited.
pub fn adopt_from_env(generation: &ProcessGeneration) -> Result<Vec<ListenerHandle>, ListenError> {
    let mut handles = Vec::with_capacity(generation.inherited_fds());

    for i in 0..generation.inherited_fds() {
        let fd = INHERITED_FD_START + i as RawFd;
        if !is_socket(fd) {
            return Err(ListenError::Inherit {
                fd,
                reason: "not an open socket".to_string(),
            });
        }

        // SAFETY: the descriptor was handed to us by the parent and nothing else in this
        // process owns it; it was just verified to be an open socket.
        let owned = unsafe { OwnedFd::from_raw_fd(fd) };
        let handle = adopt(owned)?;
        tracing::info!(
            fd,
            network = %handle.kind(),
            address = %handle.address(),
            "Inherited listener from parent process"
        );
        handles.push(handle);
    }

    Ok(handles)
}

/// Turn an inherited listening descriptor into a registry handle.
///
/// The socket's own address decides its identity. The descriptor is marked
/// close-on-exec so it only reaches a successor through [`install_fds`].
pub fn adopt(fd: OwnedFd) -> Result<ListenerHandle, ListenError> {
    let raw = fd.as_raw_fd();
    if !is_socket(raw) {
        return Err(ListenError::Inherit {
            fd: raw,
            reason: "not an open socket".to_string(),
        });
    }

    let storage: SockaddrStorage = getsockname(raw).map_err(|e| ListenError::Inherit {
        fd: raw,
        reason: format!("getsockname failed: {}", e),
    })?;

    let (kind, address) = if let Some(sin) = storage.as_sockaddr_in() {
        let addr = SocketAddr::V4(SocketAddrV4::from(*sin));
        (NetworkKind::for_inet(&addr), ListenAddr::Inet(addr))
    } else if let Some(sin6) = storage.as_sockaddr_in6() {
        let addr = SocketAddr::V6(SocketAddrV6::from(*sin6));
        (NetworkKind::for_inet(&addr), ListenAddr::Inet(addr))
    } else if let Some(path) = storage.as_unix_addr().and_then(|u| u.path()) {
        (NetworkKind::Unix, ListenAddr::Unix(path.to_path_buf()))
    } else {
        return Err(ListenError::Inherit {
            fd: raw,
            reason: "unsupported socket family".to_string(),
        });
    };

    set_cloexec(raw, true).map_err(|e| ListenError::Inherit {
        fd: raw,
        reason: format!("failed to set close-on-exec: {}", e),
    })?;

    Ok(ListenerHandle::new(kind, address, fd, true))
}

/// Duplicate `fd` to a descriptor numbered at least `min`, close-on-exec.
///
/// Used to park sources above the child's target range so that installing one
/// descriptor can never clobber another that is still waiting to be installed.
pub fn dup_above(fd: RawFd, min: RawFd) -> nix::Result<OwnedFd> {
    let new = fcntl(fd, FcntlArg::F_DUPFD_CLOEXEC(min))?;
    // SAFETY: fcntl just returned a fresh descriptor that nobody else owns.
    Ok(unsafe { OwnedFd::from_raw_fd(new) })
}

/// Install `sources` at `3..3+n` in the current process.
///
/// Only meant to run in a freshly forked child right before exec: it performs nothing
/// but `dup2`, which is async-signal-safe. `dup2` clears close-on-exec on the target.
pub fn install_fds(sources: &[RawFd]) -> std::io::Result<()> {
    for (i, fd) in sources.iter().enumerate() {
        nix::unistd::dup2(*fd, INHERITED_FD_START + i as RawFd)?;
    }
    Ok(())
}

fn set_cloexec(fd: RawFd, on: bool) -> nix::Result<()> {
    let flags = FdFlag::from_bits_truncate(fcntl(fd, FcntlArg::F_GETFD)?);
    let flags = if on {
        flags | FdFlag::FD_CLOEXEC
    } else {
        flags & !FdFlag::FD_CLOEXEC
    };
    fcntl(fd, FcntlArg::F_SETFD(flags))?;
    Ok(())
}

/// Whether `fd` is an open socket.
fn is_socket(fd: RawFd) -> bool {
    if fd < 0 {
        return false;
    }
    let mut stat: libc::stat = unsafe { std::mem::zeroed() };
    // SAFETY: fstat only writes into the provided buffer.
    if unsafe { libc::fstat(fd, &mut stat) } != 0 {
        return false;
    }
    (stat.st_mode & libc::S_IFMT) == libc::S_IFSOCK
}
