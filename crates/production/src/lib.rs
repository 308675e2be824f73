//! Production runner with async I/O.
//!
//! This crate wraps the deterministic PBFT state machine with real I/O:
//!
//! - Network messages via a [`Transport`](pbft_core::Transport) and an
//!   inbound tokio channel
//! - View-change timers via tokio tasks
//! - Application commits and checkpoints on a background worker
//! - Snapshots and checkpoints persisted through a [`Dber`](pbft_core::Dber)
//!
//! # Architecture
//!
//! Uses the event aggregator pattern: a single task owns the state machine
//! and receives events via mpsc channels. This avoids mutex contention.
//!
//! ```text
//!    timers ─┐
//!  internal ─┤   biased select    ┌──────────────────┐
//!   network ─┼──────────────────► │ ProductionRunner │ ── state.handle(event)
//!   clients ─┘                    └──────────────────┘
//!                                          │ actions
//!            ┌──────────────┬──────────────┼───────────────┐
//!            ▼              ▼              ▼               ▼
//!        Transport       Storage        Timers      Apply worker
//!                                                  (blocking pool)
//!                                                          │
//!                                   CheckpointBuilt ◄──────┘ (internal)
//! ```
//!
//! Collaborator failures (application, storage, transport) never stop the
//! runner. They are logged, counted in [`metrics`] and reported on the
//! channel returned by [`ProductionRunner::take_error_receiver`].

mod apply;
pub mod metrics;
mod runner;
#[cfg(feature = "rocksdb")]
mod storage;
pub mod telemetry;
mod timers;
mod transport;

pub use runner::{
    CollaboratorError, ProductionRunner, ProductionRunnerBuilder, RunnerConfig, RunnerError,
    RunnerHandle, RunnerStatus, ShutdownHandle,
};
#[cfg(feature = "rocksdb")]
pub use storage::{CompressionType, RocksDbConfig, RocksDbStorage};
pub use telemetry::{encode_metrics, init_logging, TelemetryError};
pub use timers::TimerManager;
pub use transport::{LocalHub, LocalTransport};
