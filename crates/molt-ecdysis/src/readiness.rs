//! One-shot readiness confirmation from a reborn child to its parent.
//!
//! The parent creates a pipe and hands the write end to the child on
//! [`READY_FD`], advertised through [`READY_ENV`]. The child writes a single
//! byte once it is serving. EOF without that byte means the child died or
//! never got there.

use std::fs::File;
use std::io::{self, Write};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tracing::{debug, info};

/// Descriptor slot carrying the write end of the readiness pipe in the child.
pub const READY_FD: RawFd = 4;

/// Environment variable naming the readiness descriptor in the child.
pub const READY_ENV: &str = "MOLT_READY_FD";

const READY_BYTE: u8 = b'R';

static NOTIFIED: AtomicBool = AtomicBool::new(false);

/// Both ends of a close-on-exec readiness pipe.
pub(crate) struct ReadyPipe {
    pub(crate) read: OwnedFd,
    pub(crate) write: OwnedFd,
}

impl ReadyPipe {
    pub(crate) fn new() -> io::Result<Self> {
        let mut fds: [libc::c_int; 2] = [-1; 2];
        create_pipe(&mut fds)?;
        // SAFETY: pipe() returned two fresh descriptors owned by nobody else.
        let (read, write) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };
        Ok(Self { read, write })
    }
}

#[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
fn create_pipe(fds: &mut [libc::c_int; 2]) -> io::Result<()> {
    if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(any(target_os = "linux", target_os = "android", target_os = "freebsd")))]
fn create_pipe(fds: &mut [libc::c_int; 2]) -> io::Result<()> {
    if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
        return Err(io::Error::last_os_error());
    }
    for fd in fds.iter() {
        crate::listener::set_cloexec(*fd)?;
    }
    Ok(())
}

/// Tell the parent generation this process is serving.
///
/// Returns `Ok(false)` when no readiness channel was handed down (first boot,
/// or the parent runs without readiness). Only the first call writes.
///
/// Fails without writing when the advertised descriptor is not [`READY_FD`].
pub fn notify_parent() -> io::Result<bool> {
    let Ok(value) = std::env::var(READY_ENV) else {
        return Ok(false);
    };
    let fd = advertised_fd(&value)?;

    if NOTIFIED.swap(true, Ordering::SeqCst) {
        debug!(fd, "Readiness already reported");
        return Ok(false);
    }

    let mut stat: libc::stat = unsafe { std::mem::zeroed() };
    if unsafe { libc::fstat(fd, &mut stat) } != 0 {
        return Err(io::Error::last_os_error());
    }
    if (stat.st_mode & libc::S_IFMT) != libc::S_IFIFO {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{READY_ENV}={fd} is not a pipe"),
        ));
    }

    // SAFETY: fd is the pipe the parent placed on READY_FD; this process
    // uses it exactly once, guarded by NOTIFIED, and closes it here.
    let mut pipe = unsafe { File::from_raw_fd(fd) };
    pipe.write_all(&[READY_BYTE])?;
    info!(fd, "Reported ready to parent process");
    Ok(true)
}

/// The descriptor named by [`READY_ENV`]. Only [`READY_FD`] is accepted, so a
/// stray value cannot make this process write into stdout or some other fd.
fn advertised_fd(value: &str) -> io::Result<RawFd> {
    match value.trim().parse::<RawFd>() {
        Ok(READY_FD) => Ok(READY_FD),
        _ => Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{READY_ENV}={value:?} does not name fd {READY_FD}"),
        )),
    }
}

/// Wait for the child's readiness byte on the read end of the pipe.
///
/// The caller must have closed its copy of the write end, otherwise a dead
/// child is only detected by the timeout.
pub(crate) async fn wait_ready(read: OwnedFd, timeout: Duration) -> Result<(), String> {
    let fd = read.as_raw_fd();
    let mut receiver = tokio::net::unix::pipe::Receiver::from_owned_fd(read)
        .map_err(|e| format!("readiness pipe fd {fd} unusable: {e}"))?;

    let mut byte = [0u8; 1];
    match tokio::time::timeout(timeout, receiver.read(&mut byte)).await {
        Err(_) => Err(format!("no readiness signal within {timeout:?}")),
        Ok(Ok(0)) => Err("readiness pipe closed before the child was serving".to_string()),
        Ok(Ok(_)) if byte[0] == READY_BYTE => Ok(()),
        Ok(Ok(_)) => Err(format!("unexpected readiness byte {:#04x}", byte[0])),
        Ok(Err(e)) => Err(format!("readiness pipe read failed: {e}")),
    }
}
