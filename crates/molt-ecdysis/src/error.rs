//! Error taxonomy for socket handoff and restart.

use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Errors produced by the restart core.
///
/// Acquisition errors (`Bind`, `InvalidDescriptor`) are fatal: the process has
/// no socket to serve on. Everything else is raised during a restart attempt
/// and is recovered by the controller.
#[derive(Debug, Error)]
pub enum EcdysisError {
    /// A fresh listener could not be bound.
    #[error("failed to bind listener on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// The inherited descriptor is absent or not a listening stream socket.
    #[error("inherited fd {fd} is not usable: {reason}")]
    InvalidDescriptor { fd: RawFd, reason: String },

    /// The listener cannot yield a descriptor the child could accept on.
    #[error("listener cannot be handed off: {0}")]
    UnsupportedListener(String),

    /// The replacement process could not be created.
    #[error("failed to spawn {}: {source}", executable.display())]
    Spawn {
        executable: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The child never confirmed it was serving.
    #[error("child {pid} did not report ready: {reason}")]
    ChildNotReady { pid: u32, reason: String },

    /// Drain deadline elapsed with connections still open.
    #[error("{remaining} connection(s) still open after {deadline:?}, forcibly closed")]
    ShutdownTimeout { remaining: usize, deadline: Duration },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl EcdysisError {
    /// Whether this error leaves the process without a usable listener.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            EcdysisError::Bind { .. } | EcdysisError::InvalidDescriptor { .. }
        )
    }
}

pub type Result<T, E = EcdysisError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquisition_errors_are_fatal() {
        let bind = EcdysisError::Bind {
            addr: "127.0.0.1:80".parse().unwrap(),
            source: std::io::Error::from(std::io::ErrorKind::AddrInUse),
        };
        assert!(bind.is_fatal());

        let inherited = EcdysisError::InvalidDescriptor {
            fd: 3,
            reason: "not a socket".to_string(),
        };
        assert!(inherited.is_fatal());
    }

    #[test]
    fn test_restart_errors_are_recoverable() {
        let spawn = EcdysisError::Spawn {
            executable: PathBuf::from("/nonexistent"),
            source: std::io::Error::from(std::io::ErrorKind::NotFound),
        };
        assert!(!spawn.is_fatal());
        assert!(spawn.to_string().contains("/nonexistent"));

        let timeout = EcdysisError::ShutdownTimeout {
            remaining: 2,
            deadline: Duration::from_secs(20),
        };
        assert!(!timeout.is_fatal());
        assert!(timeout.to_string().starts_with("2 connection(s)"));
    }
}
