//! Listening socket acquisition and handoff.
//!
//! A generation either binds a fresh TCP listener or adopts the one its
//! parent left on [`INHERITED_FD`]. Inherited descriptors are validated with
//! `fstat` and `getsockopt` before adoption. A reborn process whose fd is
//! unusable has no other way to get a socket, so that error is fatal.

use std::io;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info};

use crate::error::{EcdysisError, Result};

/// Descriptor slot the parent places the listening socket on.
pub const INHERITED_FD: RawFd = 3;

/// Extracted duplicates land at or above this fd, clear of the convention slots.
const EXTRACT_FD_FLOOR: RawFd = 100;

/// Where a generation's listener came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Fresh,
    Inherited,
}

/// How to obtain the listener for this generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquire {
    /// Bind a new listener at this address.
    Fresh(SocketAddr),
    /// Adopt an already-listening socket from this descriptor.
    Inherited(RawFd),
}

impl Acquire {
    /// Pick the acquisition mode for a process: reborn processes inherit
    /// from [`INHERITED_FD`], first boots bind `addr`.
    pub fn for_generation(reborn: bool, addr: SocketAddr) -> Self {
        if reborn {
            Acquire::Inherited(INHERITED_FD)
        } else {
            Acquire::Fresh(addr)
        }
    }
}

/// The bound listening socket of one process generation.
#[derive(Debug)]
pub struct SocketHandle {
    listener: TcpListener,
    local_addr: SocketAddr,
    origin: Origin,
}

impl SocketHandle {
    pub async fn acquire(how: Acquire) -> Result<Self> {
        match how {
            Acquire::Fresh(addr) => Self::bind(addr).await,
            Acquire::Inherited(fd) => Self::inherit(fd),
        }
    }

    /// Bind a fresh listener.
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        let bind_err = |source| EcdysisError::Bind { addr, source };
        let listener = TcpListener::bind(addr).await.map_err(bind_err)?;
        let local_addr = listener.local_addr().map_err(bind_err)?;

        info!(fd = listener.as_raw_fd(), addr = %local_addr, "Bound fresh listener");

        Ok(Self {
            listener,
            local_addr,
            origin: Origin::Fresh,
        })
    }

    /// Adopt a listening socket handed down by the parent process.
    ///
    /// On success the descriptor is owned by the returned handle and marked
    /// close-on-exec so unrelated subprocesses do not leak it.
    pub fn inherit(fd: RawFd) -> Result<Self> {
        validate_listening_socket(fd)
            .map_err(|reason| EcdysisError::InvalidDescriptor { fd, reason })?;

        set_cloexec(fd).map_err(|e| EcdysisError::InvalidDescriptor {
            fd,
            reason: format!("failed to set FD_CLOEXEC: {e}"),
        })?;

        // SAFETY: fd is an open listening stream socket, and by convention
        // nothing else in this process refers to it.
        let std_listener = unsafe { std::net::TcpListener::from_raw_fd(fd) };

        let invalid = |e: io::Error| EcdysisError::InvalidDescriptor {
            fd,
            reason: e.to_string(),
        };
        std_listener.set_nonblocking(true).map_err(invalid)?;
        let listener = TcpListener::from_std(std_listener).map_err(invalid)?;
        let local_addr = listener.local_addr().map_err(invalid)?;

        info!(fd, addr = %local_addr, "Inherited listener from parent process");

        Ok(Self {
            listener,
            local_addr,
            origin: Origin::Inherited,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn origin(&self) -> Origin {
        self.origin
    }

    pub(crate) async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
        self.listener.accept().await
    }

    /// Duplicate the listening descriptor for a child process.
    ///
    /// The duplicate is close-on-exec; the spawner moves it onto
    /// [`INHERITED_FD`] in the child. This handle keeps accepting.
    pub fn extract_descriptor(&self) -> Result<OwnedFd> {
        let fd = self.listener.as_raw_fd();
        validate_listening_socket(fd).map_err(EcdysisError::UnsupportedListener)?;

        let dup = unsafe { libc::fcntl(fd, libc::F_DUPFD_CLOEXEC, EXTRACT_FD_FLOOR) };
        if dup < 0 {
            return Err(EcdysisError::Io(io::Error::last_os_error()));
        }

        debug!(fd, dup, "Extracted listening descriptor");

        // SAFETY: fcntl just returned a new descriptor that nothing else owns.
        Ok(unsafe { OwnedFd::from_raw_fd(dup) })
    }
}

/// Check that `fd` is an open, listening, stream-oriented socket.
pub(crate) fn validate_listening_socket(fd: RawFd) -> std::result::Result<(), String> {
    if fd < 0 {
        return Err("negative descriptor".to_string());
    }

    let mut stat: libc::stat = unsafe { std::mem::zeroed() };
    if unsafe { libc::fstat(fd, &mut stat) } != 0 {
        return Err(format!("fstat failed: {}", io::Error::last_os_error()));
    }
    if (stat.st_mode & libc::S_IFMT) != libc::S_IFSOCK {
        return Err("not a socket".to_string());
    }

    let sock_type = getsockopt_int(fd, libc::SO_TYPE)?;
    if sock_type != libc::SOCK_STREAM {
        return Err(format!("socket type {sock_type} is not SOCK_STREAM"));
    }

    if getsockopt_int(fd, libc::SO_ACCEPTCONN)? == 0 {
        return Err("socket is not listening".to_string());
    }

    Ok(())
}

fn getsockopt_int(fd: RawFd, option: libc::c_int) -> std::result::Result<libc::c_int, String> {
    let mut value: libc::c_int = 0;
    let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            option,
            &mut value as *mut libc::c_int as *mut libc::c_void,
            &mut len,
        )
    };
    if rc != 0 {
        return Err(format!("getsockopt failed: {}", io::Error::last_os_error()));
    }
    Ok(value)
}

pub(crate) fn set_cloexec(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::IntoRawFd;

    fn loopback() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    #[tokio::test]
    async fn test_fresh_bind() {
        let handle = SocketHandle::acquire(Acquire::Fresh(loopback())).await.unwrap();
        assert_eq!(handle.origin(), Origin::Fresh);
        assert_ne!(handle.local_addr().port(), 0);

        let stream = TcpStream::connect(handle.local_addr()).await;
        assert!(stream.is_ok());
    }

    #[tokio::test]
    async fn test_bind_conflict_is_bind_error() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = taken.local_addr().unwrap();

        let err = SocketHandle::bind(addr).await.unwrap_err();
        assert!(matches!(err, EcdysisError::Bind { addr: a, .. } if a == addr));
        assert!(err.is_fatal());
    }

    /// FRESH -> extract -> INHERITED keeps the local address.
    #[tokio::test]
    async fn test_extract_inherit_round_trip() {
        let fresh = SocketHandle::bind(loopback()).await.unwrap();
        let extracted = fresh.extract_descriptor().unwrap();

        let inherited = SocketHandle::inherit(extracted.into_raw_fd()).unwrap();
        assert_eq!(inherited.origin(), Origin::Inherited);
        assert_eq!(inherited.local_addr(), fresh.local_addr());

        let (client, accepted) = tokio::join!(
            TcpStream::connect(inherited.local_addr()),
            inherited.accept()
        );
        assert!(client.is_ok());
        assert!(accepted.is_ok());
    }

    #[tokio::test]
    async fn test_extracted_fd_is_high_and_cloexec() {
        let handle = SocketHandle::bind(loopback()).await.unwrap();
        let extracted = handle.extract_descriptor().unwrap();
        let fd = extracted.as_raw_fd();

        assert!(fd >= EXTRACT_FD_FLOOR);
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
        assert_ne!(flags & libc::FD_CLOEXEC, 0);
    }

    #[test]
    fn test_invalid_fd_detection() {
        assert!(validate_listening_socket(9999).is_err());
        assert!(validate_listening_socket(-1).is_err());

        let err = SocketHandle::inherit(9999).unwrap_err();
        assert!(matches!(err, EcdysisError::InvalidDescriptor { fd: 9999, .. }));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_regular_file_is_not_a_socket() {
        let file = std::fs::File::open("/dev/null").unwrap();
        let reason = validate_listening_socket(file.as_raw_fd()).unwrap_err();
        assert_eq!(reason, "not a socket");
    }

    #[test]
    fn test_datagram_socket_rejected() {
        let udp = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let reason = validate_listening_socket(udp.as_raw_fd()).unwrap_err();
        assert!(reason.contains("SOCK_STREAM"), "unexpected reason: {reason}");
    }

    #[test]
    fn test_unlistened_stream_socket_rejected() {
        let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0) };
        assert!(fd >= 0);
        // SAFETY: freshly created socket owned by this test.
        let owned = unsafe { OwnedFd::from_raw_fd(fd) };

        let reason = validate_listening_socket(owned.as_raw_fd()).unwrap_err();
        assert_eq!(reason, "socket is not listening");
    }

    #[test]
    fn test_acquire_for_generation() {
        let addr: SocketAddr = "0.0.0.0:8080".parse().unwrap();
        assert_eq!(Acquire::for_generation(false, addr), Acquire::Fresh(addr));
        assert_eq!(
            Acquire::for_generation(true, addr),
            Acquire::Inherited(INHERITED_FD)
        );
    }
}
