//! molt-server: a demo service that restarts without refusing connections.
//!
//! Send `SIGHUP` (or `SIGTERM`) to hand the listening socket to a fresh copy
//! of this binary; `SIGINT` drains and exits.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use molt_ecdysis::{
    ready_timeout_from_secs, EcdysisConfig, OutputSink, ProcessSpawner, RestartController,
    TerminateBehavior, UnixSignals,
};
use tracing::{info, warn, Instrument};

mod handler;
mod telemetry;

use handler::DemoHandler;

/// molt-server - zero-downtime restart demo
#[derive(Parser, Debug)]
#[command(name = "molt-server")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Adopt the listener on fd 3 instead of binding (set by the parent on restart)
    #[arg(long)]
    reborn: bool,

    /// Address to bind on first boot [env: MOLT_LISTEN_ADDR, default: 0.0.0.0:8080]
    #[arg(short, long)]
    listen: Option<SocketAddr>,

    /// Seconds a client gets to send its request [env: MOLT_READ_TIMEOUT_SECS]
    #[arg(long)]
    read_timeout_secs: Option<u64>,

    /// Seconds in-flight requests get to finish after a restart signal [env: MOLT_DRAIN_TIMEOUT_SECS]
    #[arg(long)]
    drain_timeout_secs: Option<u64>,

    /// Seconds to wait for the new process to report ready; 0 disables [env: MOLT_READY_TIMEOUT_SECS]
    #[arg(long)]
    ready_timeout_secs: Option<u64>,

    /// Artificial handler latency in milliseconds
    #[arg(long, default_value_t = 0)]
    handler_delay_ms: u64,

    /// Binary to launch on restart (default: argv[0])
    #[arg(long)]
    executable: Option<PathBuf>,

    /// Where the new process writes stdout/stderr: inherit, null, or a file path
    #[arg(long, default_value = "inherit")]
    child_output: String,

    /// What SIGTERM does: restart or stop
    #[arg(long, default_value = "restart")]
    on_terminate: String,

    /// Emit JSON logs
    #[arg(long)]
    json_logs: bool,
}

impl Cli {
    /// Environment defaults with command-line overrides on top.
    fn ecdysis_config(&self) -> EcdysisConfig {
        let mut config = EcdysisConfig::from_env();
        config.reborn = self.reborn;

        if let Some(addr) = self.listen {
            config.listen_addr = addr;
        }
        if let Some(secs) = self.read_timeout_secs {
            config.server.read_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = self.drain_timeout_secs {
            config.drain_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = self.ready_timeout_secs {
            config.ready_timeout = ready_timeout_from_secs(secs);
        }
        if let Some(exe) = &self.executable {
            config.executable = exe.clone();
        }
        config.child_output = OutputSink::parse(&self.child_output);
        config.terminate = TerminateBehavior::parse(&self.on_terminate);

        config
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    telemetry::init(cli.json_logs)
        .map_err(|e| anyhow::anyhow!("Failed to init telemetry: {}", e))?;

    let span = tracing::info_span!("molt", pid = std::process::id());
    run(cli).instrument(span).await
}

async fn run(cli: Cli) -> Result<()> {
    info!("molt-server starting...");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config = cli.ecdysis_config();
    config.log_config();

    // Register before the listener is live so an early signal is not fatal.
    let signals = UnixSignals::new().context("Failed to install signal handlers")?;

    let handler = Arc::new(DemoHandler::new(Duration::from_millis(cli.handler_delay_ms)));
    let controller = RestartController::boot(config, handler, ProcessSpawner)
        .await
        .context("Failed to acquire listening socket")?;

    let termination = controller.run_with(signals).await;

    match termination.successor {
        Some(pid) => info!(successor_pid = pid, "Handed off to new process"),
        None => info!("Stopped without a successor"),
    }
    if let Some(e) = &termination.drain_error {
        warn!(error = %e, "Exiting with connections forcibly closed");
    }

    info!("molt-server exiting");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use molt_ecdysis::REBORN_FLAG;

    #[test]
    fn test_reborn_flag_matches_spawner_convention() {
        let cli = Cli::try_parse_from(["molt-server", REBORN_FLAG]).unwrap();
        assert!(cli.reborn);

        let cli = Cli::try_parse_from(["molt-server"]).unwrap();
        assert!(!cli.reborn);
    }

    #[test]
    fn test_cli_overrides_config() {
        let cli = Cli::try_parse_from([
            "molt-server",
            "--listen",
            "127.0.0.1:9090",
            "--drain-timeout-secs",
            "3",
            "--ready-timeout-secs",
            "0",
            "--child-output",
            "null",
            "--on-terminate",
            "stop",
        ])
        .unwrap();
        let config = cli.ecdysis_config();

        assert_eq!(config.listen_addr, "127.0.0.1:9090".parse().unwrap());
        assert_eq!(config.drain_timeout, Duration::from_secs(3));
        assert_eq!(config.ready_timeout, None);
        assert_eq!(config.child_output, OutputSink::Null);
        assert_eq!(config.terminate, TerminateBehavior::Stop);
    }
}
