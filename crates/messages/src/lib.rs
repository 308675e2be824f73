//! Network messages for the consensus protocol.
//!
//! A [`Message`] is a signed envelope `{code, sender, payload, signature}`.
//! The payload is the encoded typed body selected by the [`MessageCode`]:
//!
//! | Code         | Body                          |
//! |--------------|-------------------------------|
//! | `PrePrepare` | [`pbft_types::Preprepare`]    |
//! | `Prepare`    | [`pbft_types::Subject`]       |
//! | `Commit`     | [`pbft_types::Subject`]       |
//! | `ViewChange` | [`ViewChangeVote`]            |
//! | `Checkpoint` | [`CheckpointVote`]            |

pub mod codec;
mod message;
pub mod payload;

pub use codec::{CodecError, WIRE_VERSION};
pub use message::{Message, MessageCode};
pub use payload::{CheckpointVote, ViewChangeVote};
