//! The per-generation restart state machine.
//!
//! ```text
//! BOOTING --socket acquired, serving--> SERVING --signal--> DRAINING --shutdown--> TERMINATED
//!                                          ^                    |
//!                                          +--restart aborted---+
//! ```
//!
//! On a restart signal the controller disables its signal source, extracts
//! the listening descriptor, spawns the next generation and, if a readiness
//! channel is configured, waits for the child to confirm it is serving. Any
//! failure along the way kills the child (if there is one), re-enables
//! signals and returns to SERVING. Only then does the drain start.

use std::os::fd::AsFd;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::{EcdysisConfig, TerminateBehavior};
use crate::error::{EcdysisError, Result};
use crate::listener::{Acquire, SocketHandle};
use crate::readiness;
use crate::server::{Handler, Server};
use crate::signals::{SignalSource, Trigger, UnixSignals};
use crate::spawn::{ProcessSpawner, SpawnRequest, Spawner, REBORN_FLAG};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationState {
    Booting,
    Serving,
    Draining,
    Terminated,
}

/// Identity of this process generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Generation {
    pub pid: u32,
    pub parent_pid: u32,
    /// Listener came from the parent rather than a fresh bind.
    pub inherited: bool,
}

impl Generation {
    fn current(inherited: bool) -> Self {
        Self {
            pid: std::process::id(),
            parent_pid: std::os::unix::process::parent_id(),
            inherited,
        }
    }
}

/// One accepted restart or stop request.
#[derive(Debug, Clone, Copy)]
struct RestartRequest {
    trigger: Trigger,
    deadline: Duration,
}

impl RestartRequest {
    fn wants_successor(&self, terminate: TerminateBehavior) -> bool {
        match self.trigger {
            Trigger::Reload => true,
            Trigger::Terminate => terminate == TerminateBehavior::Restart,
            Trigger::Interrupt => false,
        }
    }
}

/// How a generation ended.
#[derive(Debug)]
pub struct Termination {
    /// `None` when the signal source closed.
    pub trigger: Option<Trigger>,
    /// Pid of the generation that took over the listener, if any.
    pub successor: Option<u32>,
    /// Set when the drain deadline expired.
    pub drain_error: Option<EcdysisError>,
}

impl Termination {
    pub fn drained_cleanly(&self) -> bool {
        self.drain_error.is_none()
    }
}

/// Owns the server of one generation and drives it through restart.
pub struct RestartController<S = ProcessSpawner> {
    config: EcdysisConfig,
    generation: Generation,
    server: Server,
    spawner: S,
    state: watch::Sender<GenerationState>,
}

impl<S: Spawner> RestartController<S> {
    /// BOOTING -> SERVING: acquire the listener and start serving.
    ///
    /// Acquisition errors are returned as-is; they are fatal for the process.
    pub async fn boot(
        config: EcdysisConfig,
        handler: Arc<dyn Handler>,
        spawner: S,
    ) -> Result<Self> {
        let generation = Generation::current(config.reborn);
        let (state, _) = watch::channel(GenerationState::Booting);

        info!(
            pid = generation.pid,
            parent_pid = generation.parent_pid,
            reborn = config.reborn,
            "Booting generation"
        );

        let socket =
            SocketHandle::acquire(Acquire::for_generation(config.reborn, config.listen_addr))
                .await?;
        let server = Server::serve(socket, handler, config.server);
        state.send_replace(GenerationState::Serving);

        info!(
            addr = %server.local_addr(),
            origin = ?server.socket().origin(),
            "Generation serving"
        );

        if config.reborn {
            match readiness::notify_parent() {
                Ok(true) => {}
                Ok(false) => debug!("No readiness channel from parent"),
                Err(e) => warn!(error = %e, "Failed to report readiness to parent"),
            }
        }

        Ok(Self {
            config,
            generation,
            server,
            spawner,
            state,
        })
    }

    pub fn generation(&self) -> &Generation {
        &self.generation
    }

    pub fn local_addr(&self) -> std::net::SocketAddr {
        self.server.local_addr()
    }

    /// Watch state transitions.
    pub fn subscribe(&self) -> watch::Receiver<GenerationState> {
        self.state.subscribe()
    }

    /// Serve until SIGHUP, SIGTERM or SIGINT ends this generation.
    pub async fn run(self) -> Result<Termination> {
        let signals = UnixSignals::new()?;
        Ok(self.run_with(signals).await)
    }

    /// Serve until `signals` ends this generation.
    pub async fn run_with<Src: SignalSource>(mut self, mut signals: Src) -> Termination {
        loop {
            let Some(trigger) = signals.recv().await else {
                info!("Signal source closed, stopping");
                let deadline = self.config.drain_timeout;
                return self.drain(None, deadline, None).await;
            };

            // No second request may start while this one is in flight.
            signals.disable();
            let request = RestartRequest {
                trigger,
                deadline: self.config.drain_timeout,
            };
            info!(trigger = ?request.trigger, "Restart request accepted");
            self.set_state(GenerationState::Draining);

            let successor = if request.wants_successor(self.config.terminate) {
                match self.spawn_successor().await {
                    Ok(pid) => Some(pid),
                    Err(e) => {
                        error!(error = %e, "Restart aborted, continuing to serve");
                        if let Err(e) = signals.enable() {
                            error!(error = %e, "Failed to re-enable signal delivery");
                        }
                        self.set_state(GenerationState::Serving);
                        continue;
                    }
                }
            } else {
                info!("Stopping without a replacement");
                None
            };

            return self
                .drain(Some(request.trigger), request.deadline, successor)
                .await;
        }
    }

    async fn spawn_successor(&mut self) -> Result<u32> {
        let descriptor = self.server.socket().extract_descriptor()?;

        let mut child = self.spawner.spawn(SpawnRequest {
            executable: &self.config.executable,
            args: &self.config.child_args,
            reborn_flag: REBORN_FLAG,
            listener: descriptor.as_fd(),
            ready: self.config.ready_timeout.is_some(),
            output: &self.config.child_output,
        })?;
        drop(descriptor);
        let pid = child.pid;

        match (child.take_ready(), self.config.ready_timeout) {
            (Some(read), Some(timeout)) => {
                info!(
                    child_pid = pid,
                    timeout_secs = timeout.as_secs_f64(),
                    "Waiting for child to report ready"
                );
                if let Err(reason) = readiness::wait_ready(read, timeout).await {
                    child.abort().await;
                    return Err(EcdysisError::ChildNotReady { pid, reason });
                }
                info!(child_pid = pid, "Child reported ready");
            }
            _ => debug!(child_pid = pid, "Proceeding without readiness confirmation"),
        }

        Ok(pid)
    }

    async fn drain(
        self,
        trigger: Option<Trigger>,
        deadline: Duration,
        successor: Option<u32>,
    ) -> Termination {
        self.set_state(GenerationState::Draining);
        info!(
            timeout_secs = deadline.as_secs_f64(),
            successor,
            active_connections = self.server.active_connections(),
            "Draining generation"
        );

        let drain_error = self.server.shutdown(deadline).await.err();
        if let Some(e) = &drain_error {
            warn!(error = %e, "Drain did not complete cleanly");
        }

        self.state.send_replace(GenerationState::Terminated);
        info!(pid = self.generation.pid, "Generation terminated");

        Termination {
            trigger,
            successor,
            drain_error,
        }
    }

    fn set_state(&self, next: GenerationState) {
        let prev = self.state.send_replace(next);
        if prev != next {
            debug!(from = ?prev, to = ?next, "Generation state changed");
        }
    }
}
