//! rudpping - a paced UDP probe for latency, jitter and burst-loss measurement
//!
//! A client sends fixed-size heartbeats at a precisely paced interval; a
//! server echoes them, acknowledges them, or silently records them. Both sides
//! keep statistics: the client measures round-trip time and one-way delay,
//! the server tracks each client flow's sequence gaps, loss-burst histogram,
//! one-way delay, jitter and throughput.
//!
//! # Features
//!
//! - Sub-millisecond send pacing with an optional adaptive (Kalman) strategy
//! - Three probe modes: full echo, ACK only, and fire-and-forget stream
//! - Per-flow loss-burst histograms and online delay statistics
//! - JSON output format
//! - Asynchronous I/O using tokio

pub mod clock;
pub mod packet;
pub mod pacing;
pub mod stats;
pub mod flow;
pub mod server;
pub mod client;
pub mod config;
pub mod measurements;
pub mod error;

pub use error::{Error, Result};
pub use config::{Config, Mode, PacingStrategy, ProbeMode};
pub use measurements::{ClientSummary, ServerSummary};
pub use flow::{FlowCollector, FlowKey, FlowReport};
pub use client::{Client, ProgressCallback, ProgressEvent};
pub use server::Server;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
