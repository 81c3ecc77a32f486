//! # molt-ecdysis
//!
//! Zero-downtime restarts by handing the listening socket to a replacement
//! process, in the spirit of
//! [Cloudflare's Ecdysis](https://blog.cloudflare.com/ecdysis-rust-graceful-restarts/).
//!
//! ## Overview
//!
//! 1. The first generation binds its listener; a reborn generation adopts the
//!    one its parent placed on fd 3
//! 2. On a restart signal the running generation spawns the same executable
//!    with `--reborn`, passing the listener through fd inheritance
//! 3. The child confirms it is serving over a one-shot pipe on fd 4
//! 4. The old generation stops accepting, drains in-flight connections up to
//!    a deadline, then exits
//!
//! The kernel accept queue is shared by both generations while they overlap,
//! so no connection is refused during the handoff.
//!
//! ## Signal Conventions
//!
//! - `SIGHUP`: restart
//! - `SIGTERM`: restart (or plain stop, see [`TerminateBehavior`])
//! - `SIGINT`: drain and exit without a replacement
//!
//! ## Platform
//!
//! This crate requires Unix (Linux / macOS). It will not compile on other platforms.

#[cfg(not(unix))]
compile_error!("molt-ecdysis requires a Unix platform (Linux or macOS)");

mod config;
mod controller;
mod error;
mod listener;
mod readiness;
mod server;
mod signals;
mod spawn;

pub use config::{ready_timeout_from_secs, EcdysisConfig, TerminateBehavior};
pub use controller::{Generation, GenerationState, RestartController, Termination};
pub use error::{EcdysisError, Result};
pub use listener::{Acquire, Origin, SocketHandle, INHERITED_FD};
pub use readiness::{notify_parent, READY_ENV, READY_FD};
pub use server::{Handler, Request, Response, Server, ServerConfig};
pub use signals::{channel as signal_channel, ChannelSignals, SignalSource, Trigger, UnixSignals};
pub use spawn::{
    inherited_args, OutputSink, ProcessSpawner, SpawnRequest, SpawnedChild, Spawner, REBORN_FLAG,
};
