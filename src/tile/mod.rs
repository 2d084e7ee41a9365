//! Tile partition of the region of interest and its neighborhood relation.
//!
//! Tiles are created once per run, persisted to the manifest and read back
//! unchanged on resumed runs. The tile directory string doubles as the key
//! under which every per-tile output is found.

mod borrowing;
mod manifest;
#[allow(clippy::module_inception)]
mod tile;

pub use borrowing::{borrow_matches, within_borrowing_ellipse, BORROWING_ELLIPSE_RATIO};
pub use manifest::{load, persist};
pub use tile::{neighbors_of, partition, retain_usable, Region, Tile, TileKey};
