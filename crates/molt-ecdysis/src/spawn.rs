//! Launching the replacement process with the listener on a fixed fd.
//!
//! The child gets the listening socket on [`INHERITED_FD`] and, when readiness
//! is requested, the write end of a pipe on [`READY_FD`]. Both are placed
//! between fork and exec:
//! 1. dup every source fd into the high range with `F_DUPFD_CLOEXEC`, so a
//!    source sitting on 3 or 4 cannot be clobbered by the next step
//! 2. `dup2` each temporary onto its slot, which clears close-on-exec there
//!
//! Everything else stays close-on-exec and disappears at exec.

use std::ffi::{OsStr, OsString};
use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::{AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};

use tracing::{info, warn};

use crate::error::{EcdysisError, Result};
use crate::listener::INHERITED_FD;
use crate::readiness::{ReadyPipe, READY_ENV, READY_FD};

/// Flag telling a process it was spawned to inherit a listener.
pub const REBORN_FLAG: &str = "--reborn";

/// Temporary fds in the child are created at or above this number.
const TEMP_FD_FLOOR: RawFd = 100;

/// Where the child's stdout and stderr go.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum OutputSink {
    /// Share the parent's streams.
    #[default]
    Inherit,
    /// Discard.
    Null,
    /// Append to a file, created if missing.
    File(PathBuf),
}

impl OutputSink {
    /// Parse `inherit`, `null`, or a file path.
    pub fn parse(s: &str) -> Self {
        match s {
            "inherit" | "" => OutputSink::Inherit,
            "null" | "none" => OutputSink::Null,
            path => OutputSink::File(PathBuf::from(path)),
        }
    }

    fn stdio_pair(&self) -> io::Result<(Stdio, Stdio)> {
        match self {
            OutputSink::Inherit => Ok((Stdio::inherit(), Stdio::inherit())),
            OutputSink::Null => Ok((Stdio::null(), Stdio::null())),
            OutputSink::File(path) => {
                let file: File = OpenOptions::new().create(true).append(true).open(path)?;
                let err = file.try_clone()?;
                Ok((Stdio::from(file), Stdio::from(err)))
            }
        }
    }
}

/// Everything needed to start the next generation.
#[derive(Debug)]
pub struct SpawnRequest<'a> {
    pub executable: &'a Path,
    /// Arguments passed before the reborn flag.
    pub args: &'a [OsString],
    pub reborn_flag: &'a str,
    /// Listening socket to place on [`INHERITED_FD`].
    pub listener: BorrowedFd<'a>,
    /// Hand the child a readiness pipe on [`READY_FD`].
    pub ready: bool,
    pub output: &'a OutputSink,
}

/// A started child process.
#[derive(Debug)]
pub struct SpawnedChild {
    pub pid: u32,
    process: Option<Child>,
    ready: Option<OwnedFd>,
}

impl SpawnedChild {
    /// A child this crate does not manage (no kill on failed readiness).
    pub fn detached(pid: u32) -> Self {
        Self {
            pid,
            process: None,
            ready: None,
        }
    }

    /// Attach the read end of a readiness pipe.
    pub fn with_ready(mut self, read: OwnedFd) -> Self {
        self.ready = Some(read);
        self
    }

    pub(crate) fn take_ready(&mut self) -> Option<OwnedFd> {
        self.ready.take()
    }

    /// Kill and reap a child that failed to come up.
    ///
    /// The blocking `wait` runs on tokio's blocking pool.
    pub(crate) async fn abort(self) {
        let pid = self.pid;
        let Some(mut process) = self.process else {
            return;
        };
        if let Err(e) = process.kill() {
            warn!(child_pid = pid, error = %e, "Failed to kill child process");
        }
        match tokio::task::spawn_blocking(move || process.wait()).await {
            Ok(Ok(status)) => info!(child_pid = pid, %status, "Reaped aborted child process"),
            Ok(Err(e)) => warn!(child_pid = pid, error = %e, "Failed to reap child process"),
            Err(e) => warn!(child_pid = pid, error = %e, "Reaper task failed"),
        }
    }
}

/// Starts the next process generation.
pub trait Spawner: Send {
    fn spawn(&mut self, request: SpawnRequest<'_>) -> Result<SpawnedChild>;
}

/// [`Spawner`] that launches a real OS process.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessSpawner;

impl Spawner for ProcessSpawner {
    fn spawn(&mut self, request: SpawnRequest<'_>) -> Result<SpawnedChild> {
        let spawn_err = |source| EcdysisError::Spawn {
            executable: request.executable.to_path_buf(),
            source,
        };

        let pipe = if request.ready {
            Some(ReadyPipe::new().map_err(spawn_err)?)
        } else {
            None
        };
        let (stdout, stderr) = request.output.stdio_pair().map_err(spawn_err)?;

        let mut command = Command::new(request.executable);
        command
            .args(request.args)
            .arg(request.reborn_flag)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr);

        let listener_fd = request.listener.as_raw_fd();
        let ready_fd = pipe.as_ref().map(|p| p.write.as_raw_fd());
        match ready_fd {
            Some(_) => command.env(READY_ENV, READY_FD.to_string()),
            None => command.env_remove(READY_ENV),
        };

        // SAFETY: the closure only calls fcntl and dup2, which are
        // async-signal-safe, and captures plain integers.
        unsafe {
            command.pre_exec(move || {
                let mut slots = [(listener_fd, INHERITED_FD), (-1, READY_FD)];
                if let Some(fd) = ready_fd {
                    slots[1].0 = fd;
                }

                let mut temps = [-1; 2];
                for (i, (source, _)) in slots.iter().enumerate() {
                    if *source >= 0 {
                        temps[i] = cvt(libc::fcntl(*source, libc::F_DUPFD_CLOEXEC, TEMP_FD_FLOOR))?;
                    }
                }
                for (i, (_, target)) in slots.iter().enumerate() {
                    if temps[i] >= 0 {
                        cvt(libc::dup2(temps[i], *target))?;
                    }
                }
                Ok(())
            });
        }

        info!(
            exe = %request.executable.display(),
            args = ?request.args,
            listener_fd,
            ready = request.ready,
            "Spawning replacement process"
        );

        let child = command.spawn().map_err(spawn_err)?;
        let pid = child.id();

        // Drop our write end so a dead child shows up as EOF.
        let ready = pipe.map(|p| {
            drop(p.write);
            p.read
        });

        info!(child_pid = pid, "Spawned replacement process");

        Ok(SpawnedChild {
            pid,
            process: Some(child),
            ready,
        })
    }
}

fn cvt(rc: libc::c_int) -> io::Result<libc::c_int> {
    if rc < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(rc)
    }
}

/// Arguments for the next generation: this process's arguments without
/// argv[0] and without any reborn flag it was itself started with.
pub fn inherited_args<I, S>(args: I) -> Vec<OsString>
where
    I: IntoIterator<Item = S>,
    S: Into<OsString>,
{
    args.into_iter()
        .skip(1)
        .map(Into::into)
        .filter(|arg| arg.as_os_str() != OsStr::new(REBORN_FLAG))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::os::fd::AsFd;

    #[test]
    fn test_inherited_args_strip_argv0_and_reborn() {
        let args = inherited_args(["molt-server", "--listen", "0.0.0.0:8080", "--reborn"]);
        assert_eq!(args, vec![OsString::from("--listen"), OsString::from("0.0.0.0:8080")]);
    }

    #[test]
    fn test_output_sink_parse() {
        assert_eq!(OutputSink::parse("inherit"), OutputSink::Inherit);
        assert_eq!(OutputSink::parse("null"), OutputSink::Null);
        assert_eq!(
            OutputSink::parse("/var/log/molt.log"),
            OutputSink::File(PathBuf::from("/var/log/molt.log"))
        );
    }

    #[test]
    fn test_missing_executable_is_spawn_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let mut spawner = ProcessSpawner;

        let err = spawner
            .spawn(SpawnRequest {
                executable: Path::new("/nonexistent/molt-server"),
                args: &[],
                reborn_flag: REBORN_FLAG,
                listener: listener.as_fd(),
                ready: true,
                output: &OutputSink::Null,
            })
            .unwrap_err();

        assert!(matches!(err, EcdysisError::Spawn { .. }));
        // The caller's listener is untouched.
        assert!(std::net::TcpStream::connect(listener.local_addr().unwrap()).is_ok());
    }

    /// The child sees the listener on fd 3 and the reborn flag in argv.
    #[test]
    fn test_child_receives_listener_on_fd3() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let out = std::env::temp_dir().join(format!("molt-spawn-{}.out", std::process::id()));
        let _ = std::fs::remove_file(&out);

        let args = [
            OsString::from("-c"),
            OsString::from(r#"test -S /dev/fd/3 && echo "ok $0""#),
        ];
        let mut spawner = ProcessSpawner;
        let mut child = spawner
            .spawn(SpawnRequest {
                executable: Path::new("/bin/sh"),
                args: &args,
                reborn_flag: REBORN_FLAG,
                listener: listener.as_fd(),
                ready: false,
                output: &OutputSink::File(out.clone()),
            })
            .unwrap();
        assert!(child.take_ready().is_none());

        let status = child.process.take().unwrap().wait().unwrap();
        assert!(status.success());

        let mut written = String::new();
        File::open(&out).unwrap().read_to_string(&mut written).unwrap();
        assert_eq!(written.trim(), format!("ok {REBORN_FLAG}"));
        let _ = std::fs::remove_file(&out);
    }
}
