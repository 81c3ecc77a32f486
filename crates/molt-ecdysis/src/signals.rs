//! Sources of restart and stop requests.
//!
//! The controller disables its source as soon as it accepts a request and
//! only re-enables it when a restart attempt is abandoned. Requests that
//! arrive while disabled are dropped, so a burst of signals yields one spawn.

use std::io;

use async_trait::async_trait;
use tokio::signal::unix::{signal, Signal, SignalKind};
use tokio::sync::mpsc;
use tracing::debug;

/// Why the controller was woken.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// SIGHUP: spawn a replacement, then drain.
    Reload,
    /// SIGTERM: treated like `Reload` unless configured to stop.
    Terminate,
    /// SIGINT: drain without a replacement.
    Interrupt,
}

#[async_trait]
pub trait SignalSource: Send {
    /// Next request. `None` means the source is gone for good.
    ///
    /// Never resolves while the source is disabled.
    async fn recv(&mut self) -> Option<Trigger>;

    /// Stop delivering requests.
    fn disable(&mut self);

    /// Resume delivering requests, discarding anything that arrived meanwhile.
    fn enable(&mut self) -> io::Result<()>;
}

/// SIGHUP, SIGTERM and SIGINT through tokio's signal driver.
///
/// Disabling drops the streams. tokio keeps its process-wide handler
/// installed, so signals arriving while disabled are swallowed rather than
/// killing the process.
pub struct UnixSignals {
    streams: Option<UnixStreams>,
}

struct UnixStreams {
    hangup: Signal,
    terminate: Signal,
    interrupt: Signal,
}

impl UnixSignals {
    /// Register the handlers. Must be called inside a tokio runtime.
    pub fn new() -> io::Result<Self> {
        let mut signals = Self { streams: None };
        signals.enable()?;
        Ok(signals)
    }
}

#[async_trait]
impl SignalSource for UnixSignals {
    async fn recv(&mut self) -> Option<Trigger> {
        let Some(streams) = self.streams.as_mut() else {
            return std::future::pending().await;
        };

        tokio::select! {
            Some(()) = streams.hangup.recv() => Some(Trigger::Reload),
            Some(()) = streams.terminate.recv() => Some(Trigger::Terminate),
            Some(()) = streams.interrupt.recv() => Some(Trigger::Interrupt),
            else => None,
        }
    }

    fn disable(&mut self) {
        if self.streams.take().is_some() {
            debug!("Signal delivery disabled");
        }
    }

    fn enable(&mut self) -> io::Result<()> {
        if self.streams.is_none() {
            self.streams = Some(UnixStreams {
                hangup: signal(SignalKind::hangup())?,
                terminate: signal(SignalKind::terminate())?,
                interrupt: signal(SignalKind::interrupt())?,
            });
            debug!("Signal delivery enabled");
        }
        Ok(())
    }
}

/// Requests fed through a channel, for embedding applications and tests.
pub struct ChannelSignals {
    rx: mpsc::UnboundedReceiver<Trigger>,
    enabled: bool,
}

/// Create a channel-backed source and its sender.
pub fn channel() -> (mpsc::UnboundedSender<Trigger>, ChannelSignals) {
    let (tx, rx) = mpsc::unbounded_channel();
    (tx, ChannelSignals { rx, enabled: true })
}

#[async_trait]
impl SignalSource for ChannelSignals {
    async fn recv(&mut self) -> Option<Trigger> {
        if !self.enabled {
            return std::future::pending().await;
        }
        self.rx.recv().await
    }

    fn disable(&mut self) {
        self.enabled = false;
    }

    fn enable(&mut self) -> io::Result<()> {
        let mut dropped = 0;
        while self.rx.try_recv().is_ok() {
            dropped += 1;
        }
        if dropped > 0 {
            debug!(dropped, "Discarded requests received while disabled");
        }
        self.enabled = true;
        Ok(())
    }
}
