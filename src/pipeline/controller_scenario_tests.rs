//! End-to-end runs of the controller against a scripted in-process backend
//! that writes small placeholder files instead of real rasters.

use anyhow::Result;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

use crate::collab::*;
use crate::config::tests::create_test_config;
use crate::config::{Config, ImageConfig};
use crate::error::PipelineError;
use crate::layout::textio::read_matrix;
use crate::layout::{GlobalOutput, RunLayout, TileOutput, UnitOutput};
use crate::pipeline::{Metrics, Pipeline, RunSummary, Stage, UnitKey};
use crate::tile::Tile;

type UnitId = (u32, u32, usize);

/// Backend whose behavior per tile and pair is set up by each test.
#[derive(Default)]
struct ScriptedBackend {
    all_masked: bool,
    pointing_errors: HashSet<UnitId>,
    rectify_unsuccessful: HashSet<UnitId>,
    wide_disparity: HashSet<UnitId>,
    /// Units whose matcher reports that it produced no disparity
    disparity_failures: HashSet<UnitId>,
    /// Units whose matcher invocation errors out
    disparity_errors: HashSet<UnitId>,
    /// Units whose pointing estimate never returns in time
    slow_pointing: HashSet<UnitId>,
    /// Tiles whose point cloud comes out without points
    empty_clouds: HashSet<(u32, u32)>,
    matches_seen: Mutex<HashMap<UnitId, usize>>,
    flattened: Mutex<HashMap<PathBuf, usize>>,
    merges: Mutex<HashMap<String, usize>>,
}

const LOCAL_CORRECTION: Matrix3 = [[1.0, 0.0, 1.0], [0.0, 1.0, 0.5], [0.0, 0.0, 1.0]];

fn pair_of(image: &ImageConfig) -> usize {
    image
        .img
        .file_stem()
        .and_then(|s| s.to_str())
        .and_then(|s| s.strip_prefix("img_"))
        .and_then(|s| s.parse().ok())
        .unwrap_or(0)
}

/// Tile origin and pair of a per-unit output path,
/// `<root>/tiles/row_<y>_height_<h>/col_<x>_width_<w>/pair_<i>/<file>`.
fn unit_of(path: &Path) -> Option<UnitId> {
    fn leading_number(name: &Path, prefix: &str) -> Option<u32> {
        name.file_name()?
            .to_str()?
            .strip_prefix(prefix)?
            .split('_')
            .next()?
            .parse()
            .ok()
    }
    let pair_dir = path.parent()?;
    let col_dir = pair_dir.parent()?;
    let pair = leading_number(pair_dir, "pair_")? as usize;
    let x = leading_number(col_dir, "col_")?;
    let y = leading_number(col_dir.parent()?, "row_")?;
    Some((x, y, pair))
}

fn write(path: &Path, contents: &str) -> Result<()> {
    std::fs::write(path, contents)?;
    Ok(())
}

impl Collaborators for ScriptedBackend {
    async fn create_tile_mask(&self, req: MaskRequest) -> Result<bool> {
        write(&req.out_mask, "mask")?;
        Ok(!self.all_masked)
    }

    async fn estimate_pointing_correction(&self, req: PointingRequest) -> Result<PointingEstimate> {
        let r = req.region;
        let id = (r.x, r.y, pair_of(&req.secondary));
        if self.pointing_errors.contains(&id) {
            anyhow::bail!("not enough matches");
        }
        if self.slow_pointing.contains(&id) {
            tokio::time::sleep(Duration::from_secs(30)).await;
        }
        let (x, y) = (f64::from(r.x), f64::from(r.y));
        let (cx, cy) = (x + f64::from(r.w) / 2.0, y + f64::from(r.h) / 2.0);
        Ok(PointingEstimate {
            correction: Some(LOCAL_CORRECTION),
            // one match at the center, one near the bottom-right corner
            matches: Some(vec![
                [cx, cy, cx - 1.0, cy - 0.5],
                [x + 3.9, y + 3.9, x + 2.9, y + 3.4],
            ]),
        })
    }

    async fn rectify(&self, req: RectifyRequest) -> Result<Rectification> {
        let id = (req.region.x, req.region.y, pair_of(&req.secondary));
        self.matches_seen
            .lock()
            .unwrap()
            .insert(id, req.matches.as_ref().map_or(0, Vec::len));

        write(&req.out_ref, "ref")?;
        write(&req.out_sec, "sec")?;
        let (disp_min, disp_max) = if self.wide_disparity.contains(&id) {
            (0.0, 3.0)
        } else {
            (-1.0, 1.0)
        };
        Ok(Rectification {
            h_ref: LOCAL_CORRECTION,
            h_sec: LOCAL_CORRECTION,
            disp_min,
            disp_max,
            success: !self.rectify_unsuccessful.contains(&id),
        })
    }

    async fn compute_disparity(&self, req: DisparityRequest) -> Result<bool> {
        if let Some(id) = unit_of(&req.out_disparity) {
            if self.disparity_errors.contains(&id) {
                anyhow::bail!("matcher crashed");
            }
            if self.disparity_failures.contains(&id) {
                return Ok(false);
            }
        }
        write(&req.out_disparity, "disp")?;
        write(&req.out_mask, "mask")?;
        Ok(true)
    }

    async fn disparity_to_height(&self, req: TriangulationRequest) -> Result<()> {
        write(&req.output, "heights")
    }

    async fn disparity_to_cloud(&self, req: TriangulationRequest) -> Result<()> {
        let empty = self.empty_clouds.contains(&(req.region.x, req.region.y));
        write(&req.output, if empty { "empty" } else { "ply" })
    }

    async fn local_mean_heights(&self, req: MeanHeightsRequest) -> Result<Vec<f64>> {
        Ok(req
            .height_maps
            .iter()
            .map(|p| if p.is_file() { 10.0 } else { f64::NAN })
            .collect())
    }

    async fn fuse_heights(&self, req: FusionRequest) -> Result<()> {
        write(&req.output, "fused")
    }

    async fn heights_to_cloud(&self, req: CloudRequest) -> Result<()> {
        let empty = self.empty_clouds.contains(&(req.region.x, req.region.y));
        write(&req.output, if empty { "empty" } else { "ply" })
    }

    async fn point_cloud_bounds(&self, cloud: PathBuf) -> Result<Option<[f64; 4]>> {
        let contents = std::fs::read_to_string(&cloud)?;
        Ok((contents != "empty").then_some([0.0, 0.0, 3.5, 3.5]))
    }

    async fn flatten_point_clouds(&self, req: FlattenRequest) -> Result<()> {
        write(&req.out_dsm, "dsm")?;
        write(&req.out_confidence, "confidence")?;
        self.flattened
            .lock()
            .unwrap()
            .insert(req.out_dsm.clone(), req.clouds.len());
        Ok(())
    }

    async fn fill_holes(&self, req: HoleFillRequest) -> Result<()> {
        write(&req.output, "filled")
    }

    async fn merge_rasters(&self, req: MergeRequest) -> Result<()> {
        write(&req.output, "merged")?;
        let name = req.output.file_name().unwrap().to_string_lossy().into_owned();
        self.merges.lock().unwrap().insert(name, req.inputs.len());
        Ok(())
    }
}

async fn run(config: &Config, backend: &Arc<ScriptedBackend>, start: u8, stop: u8) -> Result<RunSummary> {
    Pipeline::new(Arc::new(config.clone()), backend.clone(), Metrics::new())
        .run(start, stop)
        .await
}

/// Failures used by most scenarios: pointing fails for tile (0,0) on pair 1,
/// rectification fails for (4,0) on pair 2, and (12,12) on pair 2 has a
/// disparity span above half the tile width.
fn failing_backend() -> ScriptedBackend {
    ScriptedBackend {
        pointing_errors: [(0, 0, 1)].into_iter().collect(),
        rectify_unsuccessful: [(4, 0, 2)].into_iter().collect(),
        wide_disparity: [(12, 12, 2)].into_iter().collect(),
        ..Default::default()
    }
}

fn tile_at(tiles: &[Tile], x: u32, y: u32) -> &Tile {
    tiles.iter().find(|t| t.x == x && t.y == y).unwrap()
}

fn count_pair(keys: &[UnitKey], pair: usize) -> usize {
    keys.iter().filter(|k| k.pair == pair).count()
}

#[tokio::test]
async fn test_full_run_drops_units_and_merges() {
    let dir = TempDir::new().unwrap();
    let config = create_test_config(dir.path(), 3);
    let backend = Arc::new(failing_backend());

    let summary = run(&config, &backend, 0, 7).await.unwrap();
    let layout = RunLayout::new(dir.path());
    let origin = tile_at(&summary.tiles, 0, 0);

    assert_eq!(summary.tiles.len(), 16);
    assert!(layout.manifest().is_file());
    assert_eq!(summary.stage_inputs[&1].len(), 32);

    // pointing failure removes the unit before rectification
    let rectified = &summary.stage_inputs[&3];
    assert_eq!(count_pair(rectified, 1), 15);
    assert_eq!(count_pair(rectified, 2), 16);
    let dropped = UnitKey {
        tile: origin.dir.clone(),
        pair: 1,
    };
    assert!(!rectified.contains(&dropped));
    assert!(!summary.stage_inputs[&5].contains(&dropped));
    assert!(!layout.has_unit_output(origin, 1, UnitOutput::HomographyRef));
    assert!(layout.has_unit_output(origin, 2, UnitOutput::HomographyRef));

    // rectification and the disparity check each drop one more unit;
    // a span of exactly half the tile width passes
    assert_eq!(summary.stage_inputs[&4].len(), 30);
    assert_eq!(summary.stage_inputs[&5].len(), 29);
    assert_eq!(summary.final_live.len(), 29);

    let pointing = summary.reports_for(Stage::LocalPointing).next().unwrap();
    assert_eq!((pointing.inputs, pointing.failed, pointing.dropped), (32, 1, 1));
    let check = summary.reports_for(Stage::DisparityCheck).next().unwrap();
    assert_eq!((check.succeeded, check.dropped), (29, 1));

    // identical local corrections give the same global correction
    let global = read_matrix(&layout.global_pointing(1)).unwrap();
    for (r, row) in LOCAL_CORRECTION.iter().enumerate() {
        for (c, v) in row.iter().enumerate() {
            assert!((global[[r, c]] - v).abs() < 1e-6);
        }
    }

    // corner matches of the upper-left neighbors are borrowed; on pair 1
    // tile (0,0) has no matches to lend
    let seen = backend.matches_seen.lock().unwrap().clone();
    assert_eq!(seen[&(4, 4, 1)], 4);
    assert_eq!(seen[&(4, 4, 2)], 5);

    // every tile keeps at least one live unit, so every tile has a DSM
    let flattened = backend.flattened.lock().unwrap().clone();
    assert_eq!(flattened.len(), 16);
    assert_eq!(flattened[&layout.tile_file(origin, TileOutput::Dsm)], 4);
    let inner = tile_at(&summary.tiles, 4, 4);
    assert_eq!(flattened[&layout.tile_file(inner, TileOutput::Dsm)], 9);

    assert_eq!(summary.merged, vec![GlobalOutput::Dsm, GlobalOutput::Confidence]);
    let merges = backend.merges.lock().unwrap().clone();
    assert_eq!(merges["dsm.tif"], 16);
    assert!(!merges.contains_key("dsm-filtered.tif"));
    assert!(layout.global_file(GlobalOutput::Dsm).is_file());
    assert!(!layout.global_file(GlobalOutput::DsmFiltered).exists());

    let mean = std::fs::read_to_string(layout.global_mean_height(1)).unwrap();
    assert_eq!(mean.trim().parse::<f64>().unwrap(), 10.0);
}

#[tokio::test]
async fn test_resumed_run_sees_same_live_set() {
    let config_dir = TempDir::new().unwrap();
    let config = create_test_config(config_dir.path(), 3);
    let full = run(&config, &Arc::new(failing_backend()), 0, 7).await.unwrap();

    let resume_dir = TempDir::new().unwrap();
    let config = create_test_config(resume_dir.path(), 3);
    let backend = Arc::new(failing_backend());
    let first = run(&config, &backend, 0, 3).await.unwrap();
    assert!(first.merged.is_empty());
    assert!(!first.stage_inputs.contains_key(&4));

    let resumed = run(&config, &backend, 4, 7).await.unwrap();
    assert!(!resumed.stage_inputs.contains_key(&3));
    assert_eq!(resumed.stage_inputs[&4], full.stage_inputs[&4]);
    assert_eq!(resumed.stage_inputs[&5], full.stage_inputs[&5]);
    assert_eq!(resumed.final_live.keys(), full.final_live.keys());
    assert_eq!(resumed.merged, full.merged);

    // rerunning an earlier stage invalidates the journals after it
    let layout = RunLayout::new(resume_dir.path());
    assert!(layout.live_set_journal(7).is_file());
    run(&config, &backend, 2, 3).await.unwrap();
    assert!(layout.live_set_journal(3).is_file());
    assert!(!layout.live_set_journal(5).exists());
    assert!(!layout.live_set_journal(7).exists());
}

#[tokio::test]
async fn test_resume_without_manifest_is_run_fatal() {
    let dir = TempDir::new().unwrap();
    let config = create_test_config(dir.path(), 3);

    let err = run(&config, &Arc::new(ScriptedBackend::default()), 4, 7)
        .await
        .unwrap_err();
    match err.downcast_ref::<PipelineError>() {
        Some(e @ PipelineError::MissingManifest { start_from: 4, .. }) => assert!(e.is_run_fatal()),
        other => panic!("unexpected error: {:?}", other),
    }
}

#[tokio::test]
async fn test_no_usable_tiles_is_run_fatal() {
    let dir = TempDir::new().unwrap();
    let config = create_test_config(dir.path(), 2);
    let backend = Arc::new(ScriptedBackend {
        all_masked: true,
        ..Default::default()
    });

    let err = run(&config, &backend, 0, 7).await.unwrap_err();
    assert!(matches!(
        err.downcast_ref::<PipelineError>(),
        Some(PipelineError::NoUsableTiles)
    ));
    assert!(!RunLayout::new(dir.path()).manifest().exists());
}

#[tokio::test]
async fn test_invalid_stage_range() {
    let dir = TempDir::new().unwrap();
    let config = create_test_config(dir.path(), 2);
    let backend = Arc::new(ScriptedBackend::default());

    let err = run(&config, &backend, 5, 3).await.unwrap_err();
    assert!(matches!(
        err.downcast_ref::<PipelineError>(),
        Some(PipelineError::InvalidStageRange {
            start_from: 5,
            stop_after: 3
        })
    ));

    let err = run(&config, &backend, 0, 9).await.unwrap_err();
    assert!(matches!(
        err.downcast_ref::<PipelineError>(),
        Some(PipelineError::UnknownStage(9))
    ));
}

#[tokio::test]
async fn test_single_pair_builds_clouds_from_disparity() {
    let dir = TempDir::new().unwrap();
    let mut config = create_test_config(dir.path(), 2);
    config.dsm.fill_holes_smaller_than = Some(4);
    let backend = Arc::new(ScriptedBackend {
        empty_clouds: [(0, 0)].into_iter().collect(),
        ..Default::default()
    });

    let summary = run(&config, &backend, 0, 7).await.unwrap();
    let layout = RunLayout::new(dir.path());

    assert_eq!(summary.final_live.len(), 16);
    for tile in &summary.tiles {
        assert!(layout.has_tile_output(tile, TileOutput::Cloud));
        assert!(!layout.has_unit_output(tile, 1, UnitOutput::HeightMap));
    }

    // the empty cloud is skipped, the other tiles are rasterized
    let raster = summary.reports_for(Stage::Rasterization).next().unwrap();
    assert_eq!((raster.succeeded, raster.skipped, raster.dropped), (15, 1, 0));
    let origin = tile_at(&summary.tiles, 0, 0);
    assert!(!layout.has_tile_output(origin, TileOutput::Dsm));

    assert_eq!(summary.merged.len(), 3);
    let merges = backend.merges.lock().unwrap().clone();
    assert_eq!(merges["dsm.tif"], 15);
    assert_eq!(merges["dsm-filtered.tif"], 15);
    assert_eq!(merges["confidence.tif"], 15);
}

#[tokio::test]
async fn test_gpu_matching_under_budget() {
    let dir = TempDir::new().unwrap();
    let mut config = create_test_config(dir.path(), 3);
    config.matching.algorithm = "sgm_gpu".to_string();
    config.processing.max_processes_stereo_matching = Some(2);
    config.processing.gpu_total_memory_mib = Some(1_000);
    config.validate().unwrap();

    let backend = Arc::new(ScriptedBackend::default());
    let metrics = Metrics::new();
    let summary = Pipeline::new(Arc::new(config), backend, metrics.clone())
        .run(0, 5)
        .await
        .unwrap();

    let matching = summary.reports_for(Stage::StereoMatching).next().unwrap();
    assert_eq!((matching.inputs, matching.succeeded), (32, 32));
    assert!(metrics.snapshot().gpu_peak_mib >= 1);
}

#[tokio::test]
async fn test_matching_failures_keep_units_live() {
    let dir = TempDir::new().unwrap();
    let config = create_test_config(dir.path(), 3);
    let backend = Arc::new(ScriptedBackend {
        disparity_failures: [(8, 8, 1)].into_iter().collect(),
        disparity_errors: [(12, 0, 2)].into_iter().collect(),
        ..Default::default()
    });

    let summary = run(&config, &backend, 0, 7).await.unwrap();
    let layout = RunLayout::new(dir.path());

    let matching = summary.reports_for(Stage::StereoMatching).next().unwrap();
    assert_eq!((matching.inputs, matching.succeeded), (32, 30));
    assert_eq!((matching.failed, matching.dropped), (2, 0));

    // both units reach triangulation and are skipped there
    let failed = tile_at(&summary.tiles, 8, 8);
    let errored = tile_at(&summary.tiles, 12, 0);
    let triangulated = &summary.stage_inputs[&6];
    assert_eq!(triangulated.len(), 32);
    for key in [
        UnitKey {
            tile: failed.dir.clone(),
            pair: 1,
        },
        UnitKey {
            tile: errored.dir.clone(),
            pair: 2,
        },
    ] {
        assert!(triangulated.contains(&key));
        assert!(summary.final_live.keys().contains(&key));
    }

    let heights = summary
        .reports_for(Stage::Triangulation)
        .find(|r| r.step == "heights")
        .unwrap();
    assert_eq!((heights.succeeded, heights.skipped, heights.failed), (30, 2, 0));
    assert!(!layout.has_unit_output(failed, 1, UnitOutput::HeightMap));
    assert!(layout.has_unit_output(failed, 2, UnitOutput::HeightMap));

    // the other pair still gives both tiles a cloud and a DSM
    assert!(layout.has_tile_output(failed, TileOutput::Cloud));
    assert!(layout.has_tile_output(errored, TileOutput::Dsm));
    assert_eq!(summary.merged, vec![GlobalOutput::Dsm, GlobalOutput::Confidence]);
}

#[tokio::test]
async fn test_timeout_in_gating_stage_drops_only_that_unit() {
    let dir = TempDir::new().unwrap();
    let mut config = create_test_config(dir.path(), 3);
    config.processing.timeout_secs = Some(1);
    let backend = Arc::new(ScriptedBackend {
        slow_pointing: [(4, 8, 2)].into_iter().collect(),
        ..Default::default()
    });

    let summary = run(&config, &backend, 0, 3).await.unwrap();

    let pointing = summary.reports_for(Stage::LocalPointing).next().unwrap();
    assert_eq!((pointing.inputs, pointing.succeeded), (32, 31));
    assert_eq!((pointing.timed_out, pointing.failed, pointing.dropped), (1, 0, 1));

    let slow = UnitKey {
        tile: tile_at(&summary.tiles, 4, 8).dir.clone(),
        pair: 2,
    };
    assert_eq!(summary.stage_inputs[&2].len(), 31);
    assert!(!summary.stage_inputs[&3].contains(&slow));
    assert!(!summary.final_live.keys().contains(&slow));
    assert_eq!(summary.final_live.len(), 31);
}

#[tokio::test]
async fn test_gpu_request_over_budget_fails_unit_not_run() {
    let dir = TempDir::new().unwrap();
    let mut config = create_test_config(dir.path(), 3);
    // 512x512 tiles need several MiB each; two worker contexts leave 1 MiB
    config.roi = crate::tile::Region::new(0, 0, 1024, 512);
    config.tiling.tile_width = 512;
    config.tiling.tile_height = 512;
    config.matching.algorithm = "sgm_gpu".to_string();
    config.processing.max_processes_stereo_matching = Some(2);
    config.processing.gpu_total_memory_mib = Some(241);
    config.validate().unwrap();

    let backend = Arc::new(ScriptedBackend::default());
    let summary = run(&config, &backend, 0, 6).await.unwrap();

    let matching = summary.reports_for(Stage::StereoMatching).next().unwrap();
    assert_eq!((matching.inputs, matching.failed, matching.dropped), (4, 4, 0));
    assert_eq!(summary.final_live.len(), 4);

    let heights = summary
        .reports_for(Stage::Triangulation)
        .find(|r| r.step == "heights")
        .unwrap();
    assert_eq!(heights.skipped, 4);
}
