//! Restart configuration.
//!
//! # Environment Variables
//!
//! - `MOLT_LISTEN_ADDR`: address for a fresh bind. Default: `0.0.0.0:8080`
//! - `MOLT_READ_TIMEOUT_SECS`: per-connection request read timeout. Default: 6
//! - `MOLT_DRAIN_TIMEOUT_SECS`: drain deadline after a restart signal. Default: 20
//! - `MOLT_READY_TIMEOUT_SECS`: how long to wait for the child's readiness
//!   byte; `0` disables the readiness channel. Default: 10

use std::ffi::OsString;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::path::PathBuf;
use std::time::Duration;

use tracing::info;

use crate::server::ServerConfig;
use crate::spawn::{inherited_args, OutputSink};

pub const DEFAULT_LISTEN_ADDR: SocketAddr =
    SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 8080));
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(20);
pub const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(10);

/// What SIGTERM does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TerminateBehavior {
    /// Same as SIGHUP: spawn a replacement, then drain.
    #[default]
    Restart,
    /// Drain and exit without a replacement.
    Stop,
}

impl TerminateBehavior {
    /// Parse from a string. Anything other than `stop` means restart.
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "stop" | "exit" => TerminateBehavior::Stop,
            _ => TerminateBehavior::Restart,
        }
    }
}

/// Configuration for one process generation.
#[derive(Debug, Clone)]
pub struct EcdysisConfig {
    pub listen_addr: SocketAddr,
    /// Set when this process was spawned to inherit a listener.
    pub reborn: bool,
    pub server: ServerConfig,
    pub drain_timeout: Duration,
    /// `None` disables the readiness channel.
    pub ready_timeout: Option<Duration>,
    /// Binary to launch for the next generation.
    pub executable: PathBuf,
    /// Arguments for the next generation, before the reborn flag.
    pub child_args: Vec<OsString>,
    pub child_output: OutputSink,
    pub terminate: TerminateBehavior,
}

impl Default for EcdysisConfig {
    fn default() -> Self {
        Self {
            listen_addr: DEFAULT_LISTEN_ADDR,
            reborn: false,
            server: ServerConfig::default(),
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
            ready_timeout: Some(DEFAULT_READY_TIMEOUT),
            executable: current_executable(),
            child_args: inherited_args(std::env::args_os()),
            child_output: OutputSink::Inherit,
            terminate: TerminateBehavior::Restart,
        }
    }
}

impl EcdysisConfig {
    /// Defaults overridden by `MOLT_*` environment variables.
    ///
    /// Unparseable values fall back to the default.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(addr) = env_parse::<SocketAddr>("MOLT_LISTEN_ADDR") {
            config.listen_addr = addr;
        }
        if let Some(secs) = env_parse::<u64>("MOLT_READ_TIMEOUT_SECS") {
            config.server.read_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse::<u64>("MOLT_DRAIN_TIMEOUT_SECS") {
            config.drain_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse::<u64>("MOLT_READY_TIMEOUT_SECS") {
            config.ready_timeout = ready_timeout_from_secs(secs);
        }

        config
    }

    pub fn log_config(&self) {
        info!(
            listen_addr = %self.listen_addr,
            reborn = self.reborn,
            read_timeout_secs = self.server.read_timeout.as_secs_f64(),
            drain_timeout_secs = self.drain_timeout.as_secs_f64(),
            ready_timeout_secs = self.ready_timeout.map(|d| d.as_secs_f64()),
            executable = %self.executable.display(),
            terminate = ?self.terminate,
            "Restart configuration"
        );
    }
}

/// `0` disables readiness.
pub fn ready_timeout_from_secs(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

/// argv[0] of this process, so the next generation runs whatever binary is
/// installed at that path now. Falls back to `current_exe` when argv is empty.
fn current_executable() -> PathBuf {
    std::env::args_os()
        .next()
        .map(PathBuf::from)
        .or_else(|| std::env::current_exe().ok())
        .unwrap_or_default()
}
