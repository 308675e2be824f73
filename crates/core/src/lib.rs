//! Core types for PBFT consensus.
//!
//! This crate provides the seams between the consensus state machine and the
//! outside world:
//!
//! - [`Event`]: All possible inputs to the state machine
//! - [`Action`]: All possible outputs from the state machine
//! - [`EventPriority`]: Ordering priority for events at the same timestamp
//! - [`StateMachine`]: The trait that the state machine implements
//! - [`Backend`], [`Transport`], [`Application`], [`Dber`]: collaborator
//!   capabilities a runner plugs in
//!
//! # Architecture
//!
//! ```text
//! Events → StateMachine::handle() → Actions
//! ```
//!
//! The state machine is synchronous and performs no I/O. The runner
//! (simulation or production) delivers events, executes the returned actions
//! and converts their results back into events.

mod action;
mod backend;
mod event;
mod storage;
mod traits;

pub use action::Action;
pub use backend::{Backend, StaticBackend};
pub use event::{Event, EventPriority};
pub use storage::{prefixed, Dber, DberExt, MemoryDb, StorageError, KEY_PREFIX};
pub use traits::{Application, ApplyError, StateMachine, Transport, TransportError};

/// Timers the state machine can arm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TimerId {
    /// Fires when the current round made no progress in time.
    ViewChange,
}
