//! PBFT consensus state machine.
//!
//! This crate provides a synchronous three-phase BFT consensus
//! implementation that can be used for both simulation and production.
//!
//! # Architecture
//!
//! The BFT state machine processes events synchronously:
//!
//! - `Event::RequestReceived` → Queue the request; propose it if we lead the view
//! - `Event::MessageReceived` → Authenticate, then handle by message code
//! - `Event::BacklogMessage` → A queued message whose view or phase arrived
//! - `Event::ViewChangeTimer` → Vote for the next view if a round is stuck
//! - `Event::CheckpointBuilt` → Announce the checkpoint digest
//!
//! All I/O is performed by the runner via returned `Action`s.
//!
//! # Terminology
//!
//! - **Sequence**: Position in the committed log (1, 2, ...). Strictly
//!   sequential; sequence N is decided only after N-1 is committed.
//!
//! - **View number**: Attempt number. Incremented by a view change, which
//!   replaces the proposer. It is not reset when the sequence advances.
//!
//! - **Subject**: `(view, digest)` pair carried by prepare and commit votes.
//!   A vote counts only if its subject equals the accepted preprepare's.
//!
//! - **Quorum**: 2F+1 distinct validators, where F defaults to `ceil(N/3) - 1`.
//!
//! # Consensus Protocol
//!
//! ```text
//! AcceptRequest ──preprepare──► Preprepared ──2F+1 prepares──► Prepared
//!       ▲                                                          │
//!       │                                                   2F+1 commits
//!       │                                                          ▼
//!       └──────────────(CheckpointReady if due)◄────────────── Committed
//! ```
//!
//! ## Safety
//!
//! - **Single subject per round**: Once a preprepare is accepted for a view,
//!   a conflicting one is rejected and votes for other digests are not counted.
//!
//! - **Quorum intersection**: Any two quorums of 2F+1 overlap in at least one
//!   honest validator, so two digests cannot both commit at one sequence.
//!
//! - **Locking**: A validator that prepared a proposal and then changes view
//!   stays locked on it until the sequence commits. It rejects preprepares
//!   for other digests at that sequence and re-proposes the locked proposal
//!   if it becomes proposer.
//!
//! ## Liveness
//!
//! - **Timeout-based view change**: A stuck validator votes for the next view.
//!   2F+1 votes move the validator; F+1 votes make it join. The timeout doubles
//!   with each consecutive view change and resets on commit.
//!
//! - **Backlog**: Messages for a later view or phase are queued per sender and
//!   replayed through the runner's internal queue once they become processable.

mod backlog;
mod checkpoint;
mod config;
mod error;
pub mod persistence;
mod phase;
mod round_state;
mod snapshots;
mod state;
mod view_change;

pub use backlog::Backlog;
pub use checkpoint::CheckpointTracker;
pub use config::{BftConfig, ConfigError, MAX_BACKOFF_EXPONENT};
pub use error::BftError;
pub use persistence::RecoveredState;
pub use phase::State;
pub use round_state::RoundState;
pub use snapshots::SnapshotHistory;
pub use state::{BftState, BftStats};
pub use view_change::ViewChangeState;
