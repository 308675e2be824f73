//! Deterministic simulation of a PBFT validator network.
//!
//! Every validator runs the real [`pbft_bft::BftState`] against simulated
//! time, a simulated network and in-memory storage. All randomness comes from
//! one seeded RNG, so a seed fully determines a run.
//!
//! # Example
//!
//! ```no_run
//! use pbft_simulation::{NetworkConfig, SimulationRunner};
//! use std::time::Duration;
//!
//! let mut runner =
//!     SimulationRunner::new(NetworkConfig::default(), Default::default(), 42).unwrap();
//! runner.start();
//! runner.submit_request_to_all(b"transfer".to_vec());
//! runner.run_until(Duration::from_secs(1));
//! assert_eq!(runner.committed_sequence(0), Some(1));
//! ```

mod application;
mod event_queue;
mod network;
mod runner;

/// Index of a node in the simulation. Node `i` is `ValidatorId(i)`.
pub type NodeIndex = u32;

pub use application::RecordingApplication;
pub use event_queue::EventKey;
pub use network::{NetworkConfig, SimulatedNetwork};
pub use runner::{SimulationRunner, SimulationStats};
