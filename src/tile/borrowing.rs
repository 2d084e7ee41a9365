//! Which keypoint matches a tile may borrow from its neighbors.

use ndarray::{Array2, ArrayView2, Axis};

use super::Tile;

/// Semi-axes of the acceptance ellipse, as a fraction of tile width/height.
pub const BORROWING_ELLIPSE_RATIO: f64 = 0.75;

/// Whether a reference-image point lies strictly inside the tile's
/// borrowing ellipse.
pub fn within_borrowing_ellipse(tile: &Tile, mx: f64, my: f64) -> bool {
    let (cx, cy) = tile.center();
    let dx = (mx - cx) / f64::from(tile.w);
    let dy = (my - cy) / f64::from(tile.h);
    dx.hypot(dy) < BORROWING_ELLIPSE_RATIO
}

/// Rows of a neighbor's `N x 4` match list whose reference point (columns
/// 0 and 1) falls inside the tile's ellipse.
pub fn borrow_matches(tile: &Tile, candidates: ArrayView2<'_, f64>) -> Array2<f64> {
    if candidates.ncols() < 2 {
        return Array2::zeros((0, candidates.ncols()));
    }
    let rows: Vec<usize> = candidates
        .outer_iter()
        .enumerate()
        .filter(|(_, m)| within_borrowing_ellipse(tile, m[0], m[1]))
        .map(|(i, _)| i)
        .collect();
    candidates.select(Axis(0), &rows)
}
