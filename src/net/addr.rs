//! Listener addresses and their identity.
//!
//! # Responsibilities
//! - Parse `(network, address)` pairs into a typed [`ListenAddr`]
//! - Decide whether two addresses name the same listening socket
//!
//! # Design Decisions
//! - `:port` means all interfaces, like most server configs expect
//! - Host names are resolved once, first address wins

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use std::str::FromStr;

use crate::net::registry::ListenError;

/// Network family of a listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NetworkKind {
    /// TCP over either IP family.
    Tcp,
    /// TCP restricted to IPv4.
    Tcp4,
    /// TCP restricted to IPv6.
    Tcp6,
    /// Unix domain stream socket.
    Unix,
}

impl NetworkKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NetworkKind::Tcp => "tcp",
            NetworkKind::Tcp4 => "tcp4",
            NetworkKind::Tcp6 => "tcp6",
            NetworkKind::Unix => "unix",
        }
    }

    /// Whether a listener of kind `other` can satisfy a request for `self`.
    pub fn accepts(&self, other: NetworkKind) -> bool {
        match self {
            NetworkKind::Tcp => matches!(other, NetworkKind::Tcp | NetworkKind::Tcp4 | NetworkKind::Tcp6),
            _ => *self == other,
        }
    }

    /// Kind of an inet listener, derived from the bound address.
    pub fn for_inet(addr: &SocketAddr) -> Self {
        if addr.is_ipv4() {
            NetworkKind::Tcp4
        } else {
            NetworkKind::Tcp6
        }
    }
}

impl FromStr for NetworkKind {
    type Err = ListenError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tcp" => Ok(NetworkKind::Tcp),
            "tcp4" => Ok(NetworkKind::Tcp4),
            "tcp6" => Ok(NetworkKind::Tcp6),
            "unix" => Ok(NetworkKind::Unix),
            other => Err(ListenError::UnsupportedNetwork(other.to_string())),
        }
    }
}

impl fmt::Display for NetworkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Address a listener is bound to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ListenAddr {
    Inet(SocketAddr),
    Unix(PathBuf),
}

impl ListenAddr {
    /// Resolve a textual address for the given network.
    pub fn resolve(kind: NetworkKind, address: &str) -> Result<Self, ListenError> {
        if kind == NetworkKind::Unix {
            if address.is_empty() {
                return Err(invalid(address, "empty unix socket path"));
            }
            return Ok(ListenAddr::Unix(PathBuf::from(address)));
        }

        let addr = if let Some(port) = address.strip_prefix(':') {
            let port: u16 = port.parse().map_err(|_| invalid(address, "invalid port"))?;
            let ip = match kind {
                NetworkKind::Tcp6 => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
                _ => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            };
            SocketAddr::new(ip, port)
        } else if let Ok(addr) = address.parse::<SocketAddr>() {
            addr
        } else {
            address
                .to_socket_addrs()
                .map_err(|e| invalid(address, &e.to_string()))?
                .find(|a| match kind {
                    NetworkKind::Tcp4 => a.is_ipv4(),
                    NetworkKind::Tcp6 => a.is_ipv6(),
                    _ => true,
                })
                .ok_or_else(|| invalid(address, "host resolved to no usable address"))?
        };

        match (kind, addr) {
            (NetworkKind::Tcp4, SocketAddr::V6(_)) => Err(invalid(address, "not an IPv4 address")),
            (NetworkKind::Tcp6, SocketAddr::V4(_)) => Err(invalid(address, "not an IPv6 address")),
            _ => Ok(ListenAddr::Inet(addr)),
        }
    }

    /// Whether both addresses name the same listening socket.
    ///
    /// Unspecified hosts compare equal when the ports match, so `:8080` finds an inherited
    /// `0.0.0.0:8080` or `[::]:8080`.
    pub fn same_as(&self, other: &ListenAddr) -> bool {
        match (self, other) {
            (ListenAddr::Inet(a), ListenAddr::Inet(b)) => {
                a == b || (a.port() == b.port() && a.ip().is_unspecified() && b.ip().is_unspecified())
            }
            (ListenAddr::Unix(a), ListenAddr::Unix(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Display for ListenAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListenAddr::Inet(addr) => write!(f, "{}", addr),
            ListenAddr::Unix(path) => write!(f, "{}", path.display()),
        }
    }
}

fn invalid(address: &str, reason: &str) -> ListenError {
    ListenError::InvalidAddress {
        address: address.to_string(),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_only_means_all_interfaces() {
        let addr = ListenAddr::resolve(NetworkKind::Tcp, ":9001").unwrap();
        assert_eq!(addr, ListenAddr::Inet("0.0.0.0:9001".parse().unwrap()));

        let addr = ListenAddr::resolve(NetworkKind::Tcp6, ":9001").unwrap();
        assert_eq!(addr, ListenAddr::Inet("[::]:9001".parse().unwrap()));
    }

    #[test]
    fn unspecified_hosts_match_on_port() {
        let v4 = ListenAddr::Inet("0.0.0.0:9001".parse().unwrap());
        let v6 = ListenAddr::Inet("[::]:9001".parse().unwrap());
        let other_port = ListenAddr::Inet("0.0.0.0:9002".parse().unwrap());
        let loopback = ListenAddr::Inet("127.0.0.1:9001".parse().unwrap());

        assert!(v4.same_as(&v6));
        assert!(!v4.same_as(&other_port));
        assert!(!v4.same_as(&loopback));
        assert!(loopback.same_as(&loopback.clone()));
    }

    #[test]
    fn family_restrictions_are_enforced() {
        assert!(ListenAddr::resolve(NetworkKind::Tcp4, "[::1]:80").is_err());
        assert!(ListenAddr::resolve(NetworkKind::Tcp6, "127.0.0.1:80").is_err());
        assert!(ListenAddr::resolve(NetworkKind::Tcp, ":notaport").is_err());
    }

    #[test]
    fn network_kinds() {
        assert_eq!("tcp".parse::<NetworkKind>().unwrap(), NetworkKind::Tcp);
        assert!("udp".parse::<NetworkKind>().is_err());
        assert!(NetworkKind::Tcp.accepts(NetworkKind::Tcp6));
        assert!(!NetworkKind::Tcp4.accepts(NetworkKind::Tcp6));
        assert!(!NetworkKind::Unix.accepts(NetworkKind::Tcp));
    }
}
