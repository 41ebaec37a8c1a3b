//! Domain types: positions, orientation, and the tag entity.

mod position;
mod tag;

pub use position::{Orientation, Position};
pub use tag::{distance_between, pair_age, ShortAddr, Tag, TagRole, COLOR_PALETTE};
