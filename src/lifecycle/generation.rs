//! Identity of the running process generation.

use crate::net::inherit;

/// One instance of the running process, from start to exit.
///
/// Read from the environment exactly once at startup and passed explicitly to every
/// component that needs it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessGeneration {
    pid: u32,
    parent_pid: u32,
    inherited_fds: usize,
}

impl ProcessGeneration {
    pub fn new(pid: u32, parent_pid: u32, inherited_fds: usize) -> Self {
        Self {
            pid,
            parent_pid,
            inherited_fds,
        }
    }

    /// Describe the current process.
    pub fn current() -> Self {
        Self::new(
            std::process::id(),
            nix::unistd::getppid().as_raw() as u32,
            inherit::count_from_env(),
        )
    }

    /// A generation that inherited nothing, for the current pid.
    pub fn fresh() -> Self {
        Self::new(
            std::process::id(),
            nix::unistd::getppid().as_raw() as u32,
            0,
        )
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn parent_pid(&self) -> u32 {
        self.parent_pid
    }

    /// Number of listening descriptors received from the parent.
    pub fn inherited_fds(&self) -> usize {
        self.inherited_fds
    }

    pub fn is_inherited(&self) -> bool {
        self.inherited_fds > 0
    }

    /// Started by init with sockets already open (socket activation).
    pub fn is_init_activated(&self) -> bool {
        self.is_inherited() && self.parent_pid == 1
    }

    /// Whether this generation must tell its parent to drain once it is serving.
    pub fn replaces_parent(&self) -> bool {
        self.is_inherited() && self.parent_pid != 1
    }
}
