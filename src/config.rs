//! Configuration for the stereo DSM pipeline.
//!
//! A [`Config`] is loaded once, validated, and then shared read-only as
//! `Arc<Config>` with every stage and collaborator call.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::tile::Region;

/// Main configuration for the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Input images; the first one is the reference image
    pub images: Vec<ImageConfig>,

    /// Region of interest in reference image pixel coordinates
    pub roi: Region,

    /// Output configuration
    pub output: OutputConfig,

    /// Tile sizing
    #[serde(default)]
    pub tiling: TilingConfig,

    /// Worker pools, timeouts and GPU budget
    #[serde(default)]
    pub processing: ProcessingConfig,

    /// Pointing correction knobs (passed through to the collaborator)
    #[serde(default)]
    pub pointing: PointingConfig,

    /// Rectification knobs (passed through to the collaborator)
    #[serde(default)]
    pub rectification: RectificationConfig,

    /// Stereo matching knobs
    #[serde(default)]
    pub matching: MatchingConfig,

    /// Height fusion and 3D filtering knobs
    #[serde(default)]
    pub fusion: FusionConfig,

    /// DSM rasterization knobs
    #[serde(default)]
    pub dsm: DsmConfig,

    /// External tool used to run the numeric collaborators
    #[serde(default)]
    pub tools: ToolsConfig,
}

/// One input image with its camera model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageConfig {
    /// Panchromatic image path
    pub img: PathBuf,

    /// Camera model (RPC) path
    pub rpc: PathBuf,

    /// Optional color image used to colorize point clouds
    #[serde(default)]
    pub clr: Option<PathBuf>,
}

/// Output configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Run output directory (tiles, manifest, global rasters)
    pub out_dir: PathBuf,

    /// Output CRS for point clouds and rasters
    #[serde(default = "default_out_crs")]
    pub crs: String,

    /// Delete per-stage intermediates once the next stage consumed them
    #[serde(default)]
    pub clean_intermediate: bool,
}

/// Tile sizing configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TilingConfig {
    /// Tile width in pixels
    #[serde(default = "default_tile_size")]
    pub tile_width: u32,

    /// Tile height in pixels
    #[serde(default = "default_tile_size")]
    pub tile_height: u32,
}

impl Default for TilingConfig {
    fn default() -> Self {
        Self {
            tile_width: default_tile_size(),
            tile_height: default_tile_size(),
        }
    }
}

/// Processing configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingConfig {
    /// Default worker count per stage (null = num CPUs)
    #[serde(default)]
    pub max_processes: Option<usize>,

    /// Worker count for the stereo matching stage (null = max_processes)
    #[serde(default)]
    pub max_processes_stereo_matching: Option<usize>,

    /// Per-task timeout in seconds (null = no timeout)
    #[serde(default = "default_task_timeout")]
    pub timeout_secs: Option<u64>,

    /// Total GPU memory in MiB; null means GPU use is not bounded
    #[serde(default)]
    pub gpu_total_memory_mib: Option<u64>,

    /// Number of Tokio worker threads
    #[serde(default)]
    pub worker_threads: Option<usize>,

    /// Enable periodic progress reporting during stages
    #[serde(default = "default_true")]
    pub enable_metrics: bool,

    /// Progress reporting interval in seconds
    #[serde(default = "default_metrics_interval")]
    pub metrics_interval_secs: u64,

    /// Optional path to save metrics JSON after the run completes
    #[serde(default)]
    pub metrics_output_path: Option<PathBuf>,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            max_processes: None,
            max_processes_stereo_matching: None,
            timeout_secs: default_task_timeout(),
            gpu_total_memory_mib: None,
            worker_threads: None,
            enable_metrics: true,
            metrics_interval_secs: default_metrics_interval(),
            metrics_output_path: None,
        }
    }
}

impl ProcessingConfig {
    /// Default number of concurrent workers per stage.
    pub fn workers(&self) -> usize {
        self.max_processes.unwrap_or_else(num_cpus)
    }

    /// Number of concurrent workers for stereo matching.
    pub fn stereo_workers(&self) -> usize {
        self.max_processes_stereo_matching
            .unwrap_or_else(|| self.workers())
    }

    /// Per-task timeout.
    pub fn task_timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }
}

/// Pointing correction configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PointingConfig {
    /// SIFT match ratio threshold
    #[serde(default = "default_sift_match_thresh")]
    pub sift_match_thresh: f64,

    /// Use the relative (ratio) matching criterion instead of absolute distances
    #[serde(default = "default_true")]
    pub relative_sift_match_thresh: bool,

    /// Maximum pointing error in pixels
    #[serde(default = "default_max_pointing_error")]
    pub max_pointing_error: f64,

    /// Ground control points per axis
    #[serde(default = "default_n_gcp_per_axis")]
    pub n_gcp_per_axis: u32,
}

impl Default for PointingConfig {
    fn default() -> Self {
        Self {
            sift_match_thresh: default_sift_match_thresh(),
            relative_sift_match_thresh: true,
            max_pointing_error: default_max_pointing_error(),
            n_gcp_per_axis: default_n_gcp_per_axis(),
        }
    }
}

/// Rectification configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RectificationConfig {
    /// Rectification method ("rpc", "sift")
    #[serde(default = "default_rectification_method")]
    pub method: String,

    /// Horizontal margin added to rectified tiles, in pixels
    #[serde(default = "default_horizontal_margin")]
    pub horizontal_margin: u32,

    /// Vertical margin added to rectified tiles, in pixels
    #[serde(default = "default_vertical_margin")]
    pub vertical_margin: u32,
}

impl Default for RectificationConfig {
    fn default() -> Self {
        Self {
            method: default_rectification_method(),
            horizontal_margin: default_horizontal_margin(),
            vertical_margin: default_vertical_margin(),
        }
    }
}

/// Stereo matching configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchingConfig {
    /// Matching algorithm name; names ending in `_gpu` run under the GPU budget
    #[serde(default = "default_matching_algorithm")]
    pub algorithm: String,

    /// Timeout passed to the matcher itself, in seconds
    #[serde(default = "default_matcher_timeout")]
    pub timeout_secs: u64,

    /// Clamp on the disparity range handed to the matcher
    #[serde(default)]
    pub max_disp_range: Option<f64>,

    /// Erosion (pixels) applied around masked pixels of the disparity mask
    #[serde(default = "default_mask_erosion")]
    pub mask_erosion: u32,
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            algorithm: default_matching_algorithm(),
            timeout_secs: default_matcher_timeout(),
            max_disp_range: None,
            mask_erosion: default_mask_erosion(),
        }
    }
}

impl MatchingConfig {
    /// Whether the configured matcher runs on the GPU.
    pub fn uses_gpu(&self) -> bool {
        self.algorithm.ends_with("_gpu")
    }
}

/// Height fusion and 3D filtering configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FusionConfig {
    /// Fusion operator ("average_if_close", "median", ...)
    #[serde(default = "default_fusion_operator")]
    pub operator: String,

    /// Height agreement threshold in meters
    #[serde(default = "default_fusion_threshold")]
    pub threshold: f64,

    /// Remove isolated spurious matches before fusion
    #[serde(default)]
    pub remove_spurious: bool,

    /// 3D outlier filter radius in GSD units (0 disables)
    #[serde(default)]
    pub filtering_radius_gsd: f64,

    /// 3D outlier filter fill factor (0 disables)
    #[serde(default)]
    pub filtering_fill_factor: f64,

    /// Ground sample distance in meters
    #[serde(default = "default_gsd")]
    pub gsd: f64,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            operator: default_fusion_operator(),
            threshold: default_fusion_threshold(),
            remove_spurious: false,
            filtering_radius_gsd: 0.0,
            filtering_fill_factor: 0.0,
            gsd: default_gsd(),
        }
    }
}

/// DSM rasterization configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DsmConfig {
    /// DSM pixel size in output CRS units
    #[serde(default = "default_dsm_resolution")]
    pub resolution: f64,

    /// Splatting radius in pixels
    #[serde(default)]
    pub radius: u32,

    /// Gaussian weighting sigma (null = uniform)
    #[serde(default)]
    pub sigma: Option<f64>,

    /// Aggregate with max instead of mean
    #[serde(default)]
    pub aggregation_with_max: bool,

    /// Fill holes smaller than this many pixels (null disables)
    #[serde(default)]
    pub fill_holes_smaller_than: Option<u32>,

    /// Global raster bounds in output CRS [min_x, min_y, max_x, max_y]
    #[serde(default)]
    pub bounds: Option<[f64; 4]>,
}

impl Default for DsmConfig {
    fn default() -> Self {
        Self {
            resolution: default_dsm_resolution(),
            radius: 0,
            sigma: None,
            aggregation_with_max: false,
            fill_holes_smaller_than: None,
            bounds: None,
        }
    }
}

/// External tool configuration.
///
/// Each collaborator call runs `program args... <operation>` with a JSON
/// request on stdin and reads a JSON response from stdout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsConfig {
    /// Executable name or path
    #[serde(default = "default_tool_program")]
    pub program: String,

    /// Extra leading arguments
    #[serde(default)]
    pub args: Vec<String>,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            program: default_tool_program(),
            args: Vec::new(),
        }
    }
}

impl Config {
    /// Load configuration from a YAML or JSON file.
    /// Format is auto-detected from file extension (.yaml, .yml, or .json).
    ///
    /// Relative paths inside the file are resolved against the file's directory.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");

        let mut config: Config = match ext {
            "yaml" | "yml" => serde_yaml::from_str(&contents)?,
            "json" => serde_json::from_str(&contents)?,
            _ => {
                // Try YAML first (it's a superset of JSON)
                serde_yaml::from_str(&contents)?
            }
        };

        if let Some(base) = path.parent() {
            config.resolve_relative_paths(base);
        }
        Ok(config)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> anyhow::Result<Self> {
        let config: Config = serde_yaml::from_str(yaml)?;
        Ok(config)
    }

    /// Load configuration from a JSON string.
    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        let config: Config = serde_json::from_str(json)?;
        Ok(config)
    }

    /// Serialize configuration to YAML.
    pub fn to_yaml(&self) -> anyhow::Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    fn resolve_relative_paths(&mut self, base: &Path) {
        let resolve = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = base.join(&*p);
            }
        };

        resolve(&mut self.output.out_dir);
        for image in &mut self.images {
            resolve(&mut image.img);
            resolve(&mut image.rpc);
            if let Some(clr) = image.clr.as_mut() {
                resolve(clr);
            }
        }
    }

    /// Number of image pairs (every non-reference image against the reference).
    pub fn num_pairs(&self) -> usize {
        self.images.len().saturating_sub(1)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.images.len() < 2 {
            anyhow::bail!(
                "At least two images are required, got {}",
                self.images.len()
            );
        }
        if self.roi.w == 0 || self.roi.h == 0 {
            anyhow::bail!("ROI width and height must be > 0");
        }
        if self.tiling.tile_width == 0 || self.tiling.tile_height == 0 {
            anyhow::bail!("Tile sizes must be > 0");
        }
        if self.processing.max_processes == Some(0) {
            anyhow::bail!("max_processes must be > 0");
        }
        if self.processing.max_processes_stereo_matching == Some(0) {
            anyhow::bail!("max_processes_stereo_matching must be > 0");
        }
        if self.processing.timeout_secs == Some(0) {
            anyhow::bail!("timeout_secs must be > 0 (use null to disable)");
        }
        if let Some(total) = self.processing.gpu_total_memory_mib {
            let reserve = crate::resource::GPU_CONTEXT_RESERVE_MIB
                * self.processing.stereo_workers() as u64;
            if total <= reserve {
                anyhow::bail!(
                    "gpu_total_memory_mib ({}) must exceed the per-worker context reservation ({} MiB)",
                    total,
                    reserve
                );
            }
        }
        if self.dsm.resolution <= 0.0 {
            anyhow::bail!("DSM resolution must be > 0");
        }
        if self.tools.program.is_empty() {
            anyhow::bail!("tools.program must not be empty");
        }
        Ok(())
    }
}

fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

// Default value functions for serde
fn default_out_crs() -> String { "EPSG:4326".to_string() }
fn default_tile_size() -> u32 { 300 }
fn default_task_timeout() -> Option<u64> { Some(600) }
fn default_true() -> bool { true }
fn default_metrics_interval() -> u64 { 10 }
fn default_sift_match_thresh() -> f64 { 0.6 }
fn default_max_pointing_error() -> f64 { 10.0 }
fn default_n_gcp_per_axis() -> u32 { 5 }
fn default_rectification_method() -> String { "rpc".to_string() }
fn default_horizontal_margin() -> u32 { 20 }
fn default_vertical_margin() -> u32 { 5 }
fn default_matching_algorithm() -> String { "mgm".to_string() }
fn default_matcher_timeout() -> u64 { 600 }
fn default_mask_erosion() -> u32 { 2 }
fn default_fusion_operator() -> String { "average_if_close".to_string() }
fn default_fusion_threshold() -> f64 { 3.0 }
fn default_gsd() -> f64 { 0.5 }
fn default_dsm_resolution() -> f64 { 0.5 }
fn default_tool_program() -> String { "dsm-tools".to_string() }

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn create_test_config(out_dir: &Path, num_images: usize) -> Config {
        Config {
            images: (0..num_images)
                .map(|i| ImageConfig {
                    img: PathBuf::from(format!("img_{}.tif", i)),
                    rpc: PathBuf::from(format!("rpc_{}.xml", i)),
                    clr: None,
                })
                .collect(),
            roi: Region::new(0, 0, 16, 16),
            output: OutputConfig {
                out_dir: out_dir.to_path_buf(),
                crs: default_out_crs(),
                clean_intermediate: false,
            },
            tiling: TilingConfig {
                tile_width: 4,
                tile_height: 4,
            },
            processing: ProcessingConfig {
                max_processes: Some(4),
                enable_metrics: false,
                ..ProcessingConfig::default()
            },
            pointing: PointingConfig::default(),
            rectification: RectificationConfig::default(),
            matching: MatchingConfig::default(),
            fusion: FusionConfig::default(),
            dsm: DsmConfig {
                resolution: 1.0,
                ..DsmConfig::default()
            },
            tools: ToolsConfig::default(),
        }
    }

    #[test]
    fn test_defaults_from_minimal_yaml() {
        let yaml = r#"
images:
  - { img: a.tif, rpc: a.xml }
  - { img: b.tif, rpc: b.xml }
roi: { x: 0, y: 0, w: 1000, h: 800 }
output:
  out_dir: /tmp/run
"#;
        let config = Config::from_yaml(yaml).unwrap();
        assert_eq!(config.tiling.tile_width, 300);
        assert_eq!(config.processing.timeout_secs, Some(600));
        assert_eq!(config.matching.algorithm, "mgm");
        assert!(!config.matching.uses_gpu());
        assert_eq!(config.num_pairs(), 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_requires_two_images() {
        let dir = PathBuf::from("/tmp/run");
        let config = create_test_config(&dir, 1);
        assert!(config.validate().is_err());

        let config = create_test_config(&dir, 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_gpu_budget_must_cover_contexts() {
        let mut config = create_test_config(Path::new("/tmp/run"), 2);
        config.processing.max_processes_stereo_matching = Some(4);
        config.processing.gpu_total_memory_mib = Some(400);
        assert!(config.validate().is_err());

        config.processing.gpu_total_memory_mib = Some(8_000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_stereo_workers_fall_back_to_default() {
        let mut processing = ProcessingConfig {
            max_processes: Some(6),
            ..ProcessingConfig::default()
        };
        assert_eq!(processing.stereo_workers(), 6);

        processing.max_processes_stereo_matching = Some(2);
        assert_eq!(processing.stereo_workers(), 2);
    }

    #[test]
    fn test_relative_paths_resolved_against_config_dir() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{
                "images": [
                    {"img": "a.tif", "rpc": "a.xml"},
                    {"img": "/abs/b.tif", "rpc": "b.xml", "clr": "b_clr.tif"}
                ],
                "roi": {"x": 0, "y": 0, "w": 10, "h": 10},
                "output": {"out_dir": "out"}
            }"#,
        )
        .unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.output.out_dir, dir.path().join("out"));
        assert_eq!(config.images[0].img, dir.path().join("a.tif"));
        assert_eq!(config.images[1].img, PathBuf::from("/abs/b.tif"));
        assert_eq!(config.images[1].clr, Some(dir.path().join("b_clr.tif")));
    }

    #[test]
    fn test_gpu_algorithm_detection() {
        let matching = MatchingConfig {
            algorithm: "sgm_gpu".to_string(),
            ..MatchingConfig::default()
        };
        assert!(matching.uses_gpu());
    }
}
