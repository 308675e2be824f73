//! Typed message bodies that are not plain `pbft_types` values.

mod checkpoint;
mod view_change_vote;

pub use checkpoint::CheckpointVote;
pub use view_change_vote::ViewChangeVote;
