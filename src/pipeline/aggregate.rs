//! In-process aggregation across tiles: global pointing correction and
//! global mean height offsets.

use nalgebra::DMatrix;
use ndarray::{array, Array1, Array2, ArrayView1, ArrayView2};

/// Singular values below this fraction of the largest make the fit degenerate.
const RANK_TOLERANCE: f64 = 1e-9;

/// One tile's contribution: the mean secondary keypoint `p` and the
/// corrected position `q = A * [p, 1]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PointingSample {
    pub p: [f64; 2],
    pub q: [f64; 2],
}

impl PointingSample {
    /// Sample from a local 3x3 correction and the tile's keypoint center.
    pub fn from_local(correction: ArrayView2<'_, f64>, center: ArrayView1<'_, f64>) -> Option<Self> {
        if correction.shape() != [3, 3] || center.len() < 2 {
            return None;
        }
        let p = [center[0], center[1]];
        let q = correction.dot(&array![p[0], p[1], 1.0]);
        Some(Self { p, q: [q[0], q[1]] })
    }
}

/// Combine the local corrections of one pair into a single 3x3 correction.
///
/// No sample gives the identity, one sample gives its own matrix, two give
/// the mean translation and three or more a least-squares affine fit
/// (mean translation again when the points are degenerate).
pub fn global_from_local(samples: &[PointingSample], single: Option<ArrayView2<'_, f64>>) -> Array2<f64> {
    match samples.len() {
        0 => Array2::eye(3),
        1 => single
            .filter(|m| m.shape() == [3, 3])
            .map(|m| m.to_owned())
            .unwrap_or_else(|| translation(samples)),
        2 => translation(samples),
        _ => affine(samples).unwrap_or_else(|| translation(samples)),
    }
}

fn translation(samples: &[PointingSample]) -> Array2<f64> {
    let n = samples.len().max(1) as f64;
    let tx = samples.iter().map(|s| s.q[0] - s.p[0]).sum::<f64>() / n;
    let ty = samples.iter().map(|s| s.q[1] - s.p[1]).sum::<f64>() / n;
    array![[1.0, 0.0, tx], [0.0, 1.0, ty], [0.0, 0.0, 1.0]]
}

fn affine(samples: &[PointingSample]) -> Option<Array2<f64>> {
    // least squares on rows [px, py, 1] -> [qx, qy]
    let design = DMatrix::from_fn(samples.len(), 3, |r, c| match c {
        0 => samples[r].p[0],
        1 => samples[r].p[1],
        _ => 1.0,
    });
    let targets = DMatrix::from_fn(samples.len(), 2, |r, c| samples[r].q[c]);

    let svd = design.svd(true, true);
    let eps = RANK_TOLERANCE * svd.singular_values.max().max(1.0);
    if svd.rank(eps) < 3 {
        return None;
    }
    let beta = svd.solve(&targets, eps).ok()?;
    Some(array![
        [beta[(0, 0)], beta[(1, 0)], beta[(2, 0)]],
        [beta[(0, 1)], beta[(1, 1)], beta[(2, 1)]],
        [0.0, 0.0, 1.0]
    ])
}

/// Mean of the non-NaN values, NaN when there are none.
pub fn nan_mean(values: impl IntoIterator<Item = f64>) -> f64 {
    let (sum, count) = values
        .into_iter()
        .filter(|v| !v.is_nan())
        .fold((0.0, 0usize), |(s, c), v| (s + v, c + 1));
    if count == 0 {
        f64::NAN
    } else {
        sum / count as f64
    }
}

/// Column-wise [`nan_mean`] over per-tile vectors of per-pair values.
pub fn nan_mean_per_pair(per_tile: &[Array1<f64>], num_pairs: usize) -> Vec<f64> {
    (0..num_pairs)
        .map(|pair| nan_mean(per_tile.iter().filter_map(|v| v.get(pair).copied())))
        .collect()
}
