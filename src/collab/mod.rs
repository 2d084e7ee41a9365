//! Numeric collaborators consumed by the stages.
//!
//! The orchestrator never looks inside images, disparity maps or point
//! clouds. Everything numeric goes through [`Collaborators`], whose requests
//! name input and output files plus the pass-through knobs from the config.
//! Small results (matrices, bounds, flags) come back in the response.

mod external;

pub use external::ExternalTools;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::path::PathBuf;

use crate::config::ImageConfig;
use crate::tile::Region;

/// Row-major 3x3 matrix (pointing correction or homography).
pub type Matrix3 = [[f64; 3]; 3];

/// One keypoint match: reference x, y then secondary x, y.
pub type KeypointMatch = [f64; 4];

/// Build the mask of a tile and report whether the tile is usable.
#[derive(Debug, Clone, Serialize)]
pub struct MaskRequest {
    pub images: Vec<ImageConfig>,
    pub region: Region,
    pub out_mask: PathBuf,
}

#[derive(Debug, Clone, Serialize)]
pub struct PointingRequest {
    pub reference: ImageConfig,
    pub secondary: ImageConfig,
    pub region: Region,
    pub sift_match_thresh: f64,
    pub relative_sift_match_thresh: bool,
    pub max_pointing_error: f64,
    pub n_gcp_per_axis: u32,
}

/// Local pointing estimate. Either part may be absent when the tile has too
/// few matches.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PointingEstimate {
    #[serde(default)]
    pub correction: Option<Matrix3>,
    #[serde(default)]
    pub matches: Option<Vec<KeypointMatch>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RectifyRequest {
    pub reference: ImageConfig,
    pub secondary: ImageConfig,
    pub region: Region,
    pub pointing: Matrix3,
    pub matches: Option<Vec<KeypointMatch>>,
    pub method: String,
    pub horizontal_margin: u32,
    pub vertical_margin: u32,
    pub out_ref: PathBuf,
    pub out_sec: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rectification {
    pub h_ref: Matrix3,
    pub h_sec: Matrix3,
    pub disp_min: f64,
    pub disp_max: f64,
    pub success: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct DisparityRequest {
    pub rectified_ref: PathBuf,
    pub rectified_sec: PathBuf,
    pub out_disparity: PathBuf,
    pub out_mask: PathBuf,
    pub algorithm: String,
    pub disp_min: f64,
    pub disp_max: f64,
    pub timeout_secs: u64,
    pub max_disp_range: Option<f64>,
    pub mask_erosion: u32,
}

/// Triangulate one unit's disparity, into a height map (several pairs) or
/// directly into the tile point cloud (single pair).
#[derive(Debug, Clone, Serialize)]
pub struct TriangulationRequest {
    pub region: Region,
    pub ref_rpc: PathBuf,
    pub sec_rpc: PathBuf,
    pub h_ref: PathBuf,
    pub h_sec: PathBuf,
    pub disparity: PathBuf,
    pub disparity_mask: PathBuf,
    pub tile_mask: PathBuf,
    pub global_pointing: PathBuf,
    pub out_crs: String,
    pub color_image: Option<PathBuf>,
    pub filtering_radius_gsd: f64,
    pub filtering_fill_factor: f64,
    pub gsd: f64,
    pub output: PathBuf,
}

/// Mean height of each pair's height map over the pixels valid in all pairs.
#[derive(Debug, Clone, Serialize)]
pub struct MeanHeightsRequest {
    pub region: Region,
    pub height_maps: Vec<PathBuf>,
}

/// Merge the per-pair height maps of a tile after removing each pair's
/// global mean offset.
#[derive(Debug, Clone, Serialize)]
pub struct FusionRequest {
    pub height_maps: Vec<PathBuf>,
    pub global_mean_heights: Vec<Option<f64>>,
    pub operator: String,
    pub threshold: f64,
    pub remove_spurious: bool,
    pub output: PathBuf,
}

#[derive(Debug, Clone, Serialize)]
pub struct CloudRequest {
    pub region: Region,
    pub height_map: PathBuf,
    pub ref_rpc: PathBuf,
    pub color_image: PathBuf,
    pub out_crs: String,
    pub filtering_radius_gsd: f64,
    pub filtering_fill_factor: f64,
    pub gsd: f64,
    pub output: PathBuf,
}

/// Raster grid in output CRS units: upper-left corner and size in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RasterGrid {
    pub xoff: f64,
    pub yoff: f64,
    pub xsize: u64,
    pub ysize: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct FlattenRequest {
    pub clouds: Vec<PathBuf>,
    pub resolution: f64,
    pub grid: RasterGrid,
    pub radius: u32,
    pub sigma: Option<f64>,
    pub aggregation_with_max: bool,
    pub out_dsm: PathBuf,
    pub out_confidence: PathBuf,
}

#[derive(Debug, Clone, Serialize)]
pub struct HoleFillRequest {
    pub dsm: PathBuf,
    pub max_size: u32,
    pub output: PathBuf,
}

#[derive(Debug, Clone, Serialize)]
pub struct MergeRequest {
    pub inputs: Vec<PathBuf>,
    pub bounds: Option<[f64; 4]>,
    pub resolution: f64,
    /// Always NaN; serialized as `null`.
    pub nodata: f64,
    pub output: PathBuf,
}

/// External numeric operations.
///
/// Every method is one independent call; implementations must be safe to
/// call concurrently from many worker tasks.
pub trait Collaborators: Send + Sync + 'static {
    /// Returns false when the tile is not visible or totally masked.
    fn create_tile_mask(&self, req: MaskRequest) -> impl Future<Output = Result<bool>> + Send;

    /// Fails on degenerate input (empty or masked image regions).
    fn estimate_pointing_correction(
        &self,
        req: PointingRequest,
    ) -> impl Future<Output = Result<PointingEstimate>> + Send;

    fn rectify(&self, req: RectifyRequest) -> impl Future<Output = Result<Rectification>> + Send;

    /// Returns false when the matcher gave up (including its own timeout).
    fn compute_disparity(
        &self,
        req: DisparityRequest,
    ) -> impl Future<Output = Result<bool>> + Send;

    fn disparity_to_height(
        &self,
        req: TriangulationRequest,
    ) -> impl Future<Output = Result<()>> + Send;

    fn disparity_to_cloud(
        &self,
        req: TriangulationRequest,
    ) -> impl Future<Output = Result<()>> + Send;

    /// One value per pair; NaN where a height map is missing.
    fn local_mean_heights(
        &self,
        req: MeanHeightsRequest,
    ) -> impl Future<Output = Result<Vec<f64>>> + Send;

    fn fuse_heights(&self, req: FusionRequest) -> impl Future<Output = Result<()>> + Send;

    fn heights_to_cloud(&self, req: CloudRequest) -> impl Future<Output = Result<()>> + Send;

    /// `[xmin, ymin, xmax, ymax]` of a point cloud, `None` when it has no points.
    fn point_cloud_bounds(
        &self,
        cloud: PathBuf,
    ) -> impl Future<Output = Result<Option<[f64; 4]>>> + Send;

    fn flatten_point_clouds(&self, req: FlattenRequest)
        -> impl Future<Output = Result<()>> + Send;

    fn fill_holes(&self, req: HoleFillRequest) -> impl Future<Output = Result<()>> + Send;

    fn merge_rasters(&self, req: MergeRequest) -> impl Future<Output = Result<()>> + Send;
}

/// Matrix helpers for moving between JSON arrays and `ndarray`.
pub(crate) mod convert {
    use anyhow::Result;
    use ndarray::{Array2, ArrayView2};

    use super::{KeypointMatch, Matrix3};

    pub fn matrix3_to_array(m: &Matrix3) -> Array2<f64> {
        Array2::from_shape_fn((3, 3), |(r, c)| m[r][c])
    }

    pub fn array_to_matrix3(a: ArrayView2<'_, f64>) -> Result<Matrix3> {
        if a.shape() != [3, 3] {
            anyhow::bail!("expected a 3x3 matrix, got {:?}", a.shape());
        }
        let mut m = [[0.0; 3]; 3];
        for ((r, c), v) in a.indexed_iter() {
            m[r][c] = *v;
        }
        Ok(m)
    }

    pub fn matches_to_array(matches: &[KeypointMatch]) -> Array2<f64> {
        Array2::from_shape_fn((matches.len(), 4), |(r, c)| matches[r][c])
    }

    pub fn array_to_matches(a: ArrayView2<'_, f64>) -> Result<Vec<KeypointMatch>> {
        if a.nrows() > 0 && a.ncols() != 4 {
            anyhow::bail!("expected N x 4 keypoint matches, got {:?}", a.shape());
        }
        Ok(a.outer_iter().map(|r| [r[0], r[1], r[2], r[3]]).collect())
    }
}
