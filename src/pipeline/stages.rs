//! Per-unit and per-tile stage functions.
//!
//! Every launched function takes its argument (a [`Tile`] or a [`WorkUnit`])
//! plus the shared [`StageContext`], reads what earlier stages left in the
//! run directory, calls one or more collaborators and writes its own outputs.
//! The returned [`StageOutcome`] tells the controller whether the unit did
//! its work; an `Err` is a failure of the same kind.
//!
//! Stages 2, 6c and 7b aggregate across tiles and run in-process.

use anyhow::{Context, Result};
use ndarray::{array, s, Array1, Axis};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use crate::collab::convert::{array_to_matches, array_to_matrix3, matches_to_array, matrix3_to_array};
use crate::collab::{
    CloudRequest, Collaborators, DisparityRequest, FlattenRequest, FusionRequest, HoleFillRequest,
    KeypointMatch, MaskRequest, MeanHeightsRequest, MergeRequest, PointingRequest, RasterGrid,
    RectifyRequest, TriangulationRequest,
};
use crate::config::Config;
use crate::layout::textio::{read_matrix, read_vector, write_matrix, write_vector};
use crate::layout::{GlobalOutput, RunLayout, TileOutput, UnitOutput};
use crate::pipeline::aggregate::{global_from_local, nan_mean_per_pair, PointingSample};
use crate::pipeline::{LiveSet, Metrics, WorkUnit};
use crate::resource::GpuMemoryManager;
use crate::tile::{borrow_matches, neighbors_of, Tile};

/// Disparity spans above this many pixels are reported.
const LARGE_DISPARITY_SPAN: f64 = 100.0;

const MIB: u64 = 1024 * 1024;

/// Everything a stage function needs besides its own argument.
pub struct StageContext<B> {
    pub config: Arc<Config>,
    pub backend: Arc<B>,
    pub layout: RunLayout,
    pub metrics: Arc<Metrics>,
}

/// What one unit (or tile) did in a stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageOutcome {
    Ok,
    /// Nothing to do, usually because an upstream output is missing
    Skipped(String),
    Failed(String),
}

impl StageOutcome {
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok)
    }
}

fn remove_if_exists(path: &std::path::Path) {
    if path.is_file() {
        if let Err(e) = std::fs::remove_file(path) {
            tracing::debug!("Failed to remove {}: {}", path.display(), e);
        }
    }
}

/// Stage 0: create the tile directories and its mask.
pub async fn create_mask<B: Collaborators>(tile: Tile, ctx: Arc<StageContext<B>>) -> Result<StageOutcome> {
    ctx.layout
        .create_tile_dirs(&tile, ctx.config.num_pairs())
        .with_context(|| format!("Failed to create directories for {}", tile))?;

    let usable = ctx
        .backend
        .create_tile_mask(MaskRequest {
            images: ctx.config.images.clone(),
            region: tile.region(),
            out_mask: ctx.layout.tile_file(&tile, TileOutput::Mask),
        })
        .await?;

    if usable {
        Ok(StageOutcome::Ok)
    } else {
        Ok(StageOutcome::Skipped("not visible or totally masked".to_string()))
    }
}

/// Stage 1: local pointing correction of one unit.
pub async fn pointing_correction<B: Collaborators>(
    unit: WorkUnit,
    ctx: Arc<StageContext<B>>,
) -> Result<StageOutcome> {
    let cfg = &ctx.config;
    let estimate = ctx
        .backend
        .estimate_pointing_correction(PointingRequest {
            reference: cfg.images[0].clone(),
            secondary: cfg.images[unit.pair].clone(),
            region: unit.tile.region(),
            sift_match_thresh: cfg.pointing.sift_match_thresh,
            relative_sift_match_thresh: cfg.pointing.relative_sift_match_thresh,
            max_pointing_error: cfg.pointing.max_pointing_error,
            n_gcp_per_axis: cfg.pointing.n_gcp_per_axis,
        })
        .await
        .with_context(|| format!("pointing correction failed for {}", unit))?;

    let layout = &ctx.layout;
    if let Some(correction) = estimate.correction {
        write_matrix(
            &layout.unit_file(&unit.tile, unit.pair, UnitOutput::Pointing),
            matrix3_to_array(&correction).view(),
        )?;
    }

    if let Some(matches) = estimate.matches {
        let m = matches_to_array(&matches);
        write_matrix(
            &layout.unit_file(&unit.tile, unit.pair, UnitOutput::SiftMatches),
            m.view(),
        )?;
        // mean secondary keypoint, used by the global correction
        if let Some(center) = m.slice(s![.., 2..4]).mean_axis(Axis(0)) {
            write_vector(
                &layout.unit_file(&unit.tile, unit.pair, UnitOutput::CenterKeypointsSec),
                center.view(),
            )?;
        }
    }

    Ok(StageOutcome::Ok)
}

/// Stage 2: combine the live units' local corrections into one correction
/// per pair. Never drops units.
pub fn global_pointing<B: Collaborators>(ctx: &StageContext<B>, live: &LiveSet) -> Result<()> {
    let layout = &ctx.layout;

    for pair in 1..=ctx.config.num_pairs() {
        let mut samples = Vec::new();
        let mut last_local = None;

        for unit in live.units_for_pair(pair) {
            let pointing = layout.unit_file(&unit.tile, pair, UnitOutput::Pointing);
            let center = layout.unit_file(&unit.tile, pair, UnitOutput::CenterKeypointsSec);
            if !pointing.is_file() || !center.is_file() {
                continue;
            }

            let local = match (read_matrix(&pointing), read_vector(&center)) {
                (Ok(a), Ok(c)) => match PointingSample::from_local(a.view(), c.view()) {
                    Some(sample) => {
                        samples.push(sample);
                        a
                    }
                    None => continue,
                },
                (Err(e), _) | (_, Err(e)) => {
                    tracing::warn!("Ignoring local pointing of {}: {:#}", unit, e);
                    continue;
                }
            };
            last_local = Some(local);
        }

        let single = if samples.len() == 1 { last_local.as_ref().map(|a| a.view()) } else { None };
        let global = global_from_local(&samples, single);
        write_matrix(&layout.global_pointing(pair), global.view())?;
        tracing::info!(
            "Global pointing for pair {} from {} local corrections",
            pair,
            samples.len()
        );

        if ctx.config.output.clean_intermediate {
            for unit in live.units_for_pair(pair) {
                remove_if_exists(&layout.unit_file(&unit.tile, pair, UnitOutput::CenterKeypointsSec));
            }
        }
    }
    Ok(())
}

/// Own matches plus the neighbors' matches that fall inside the tile's
/// borrowing ellipse. Neighbors without a match file are ignored.
fn collect_matches(layout: &RunLayout, unit: &WorkUnit) -> Result<Vec<KeypointMatch>> {
    let mut matches = Vec::new();

    let own = layout.unit_file(&unit.tile, unit.pair, UnitOutput::SiftMatches);
    if own.is_file() {
        matches.extend(array_to_matches(read_matrix(&own)?.view())?);
    }

    for neighbor in neighbors_of(&unit.tile) {
        let path = layout.unit_file_by_key(neighbor, unit.pair, UnitOutput::SiftMatches);
        if !path.is_file() {
            continue;
        }
        let candidates = read_matrix(&path)?;
        let borrowed = borrow_matches(&unit.tile, candidates.view());
        matches.extend(array_to_matches(borrowed.view())?);
    }
    Ok(matches)
}

/// Stage 3: rectify one unit with its local (or the global) pointing.
pub async fn rectify_unit<B: Collaborators>(unit: WorkUnit, ctx: Arc<StageContext<B>>) -> Result<StageOutcome> {
    let cfg = &ctx.config;
    let layout = &ctx.layout;

    let local = layout.unit_file(&unit.tile, unit.pair, UnitOutput::Pointing);
    let pointing_path = if local.is_file() {
        local
    } else {
        layout.global_pointing(unit.pair)
    };
    let pointing = array_to_matrix3(read_matrix(&pointing_path)?.view())
        .with_context(|| format!("invalid pointing matrix {}", pointing_path.display()))?;

    let matches = collect_matches(layout, &unit)?;

    let rect = ctx
        .backend
        .rectify(RectifyRequest {
            reference: cfg.images[0].clone(),
            secondary: cfg.images[unit.pair].clone(),
            region: unit.tile.region(),
            pointing,
            matches: (!matches.is_empty()).then_some(matches),
            method: cfg.rectification.method.clone(),
            horizontal_margin: cfg.rectification.horizontal_margin,
            vertical_margin: cfg.rectification.vertical_margin,
            out_ref: layout.unit_file(&unit.tile, unit.pair, UnitOutput::RectifiedRef),
            out_sec: layout.unit_file(&unit.tile, unit.pair, UnitOutput::RectifiedSec),
        })
        .await?;

    if !rect.success {
        return Ok(StageOutcome::Failed("rectification unsuccessful".to_string()));
    }

    write_matrix(
        &layout.unit_file(&unit.tile, unit.pair, UnitOutput::HomographyRef),
        matrix3_to_array(&rect.h_ref).view(),
    )?;
    write_matrix(
        &layout.unit_file(&unit.tile, unit.pair, UnitOutput::HomographySec),
        matrix3_to_array(&rect.h_sec).view(),
    )?;
    write_vector(
        &layout.unit_file(&unit.tile, unit.pair, UnitOutput::DispMinMax),
        array![rect.disp_min, rect.disp_max].view(),
    )?;
    Ok(StageOutcome::Ok)
}

fn read_disparity_range(layout: &RunLayout, unit: &WorkUnit) -> Result<(f64, f64)> {
    let path = layout.unit_file(&unit.tile, unit.pair, UnitOutput::DispMinMax);
    let range = read_vector(&path)?;
    if range.len() != 2 {
        anyhow::bail!("{}: expected 2 values, got {}", path.display(), range.len());
    }
    Ok((range[0], range[1]))
}

/// Stage 4: drop units whose disparity span exceeds half the tile width.
pub async fn disparity_check<B: Collaborators>(
    unit: WorkUnit,
    ctx: Arc<StageContext<B>>,
) -> Result<StageOutcome> {
    let (disp_min, disp_max) = read_disparity_range(&ctx.layout, &unit)?;
    let span = disp_max - disp_min;

    // TODO: smooth the range with the neighbors' disp_min_max.txt before
    // judging, so one bad tile does not leave a hole in the DSM.
    if span > LARGE_DISPARITY_SPAN {
        tracing::info!("Large disparity range for {}: [{}, {}]", unit, disp_min, disp_max);
    }
    let limit = f64::from(unit.tile.w) / 2.0;
    if span > limit {
        return Ok(StageOutcome::Failed(format!(
            "disparity range {} exceeds half the tile width ({})",
            span, limit
        )));
    }
    Ok(StageOutcome::Ok)
}

/// GPU memory for matching one tile, in MiB: a cost volume of 16-bit
/// costs over the disparity span plus per-pixel working buffers.
pub fn gpu_request_mib(tile: &Tile, disparity_span: f64) -> u32 {
    let pixels = u64::from(tile.w) * u64::from(tile.h);
    let levels = disparity_span.max(0.0).ceil() as u64 + 1;
    let bytes = pixels * levels * 2 + pixels * 16;
    bytes.div_ceil(MIB).clamp(1, u64::from(u32::MAX)) as u32
}

/// Stage 5: dense matching of one unit, under the GPU budget when the
/// matcher runs on the GPU.
pub async fn stereo_matching<B: Collaborators>(
    unit: WorkUnit,
    (ctx, gpu): (Arc<StageContext<B>>, GpuMemoryManager),
) -> Result<StageOutcome> {
    let cfg = &ctx.config;
    let layout = &ctx.layout;
    let (disp_min, disp_max) = read_disparity_range(layout, &unit)?;

    let mut allocation = if cfg.matching.uses_gpu() {
        let size = gpu_request_mib(&unit.tile, disp_max - disp_min);
        let wait_start = Instant::now();
        let allocation = gpu.request(size).await?;
        ctx.metrics.add_gpu_wait_time(wait_start.elapsed());
        ctx.metrics.record_gpu_peak(gpu.peak_mib());
        Some(allocation)
    } else {
        None
    };

    let result = ctx
        .backend
        .compute_disparity(DisparityRequest {
            rectified_ref: layout.unit_file(&unit.tile, unit.pair, UnitOutput::RectifiedRef),
            rectified_sec: layout.unit_file(&unit.tile, unit.pair, UnitOutput::RectifiedSec),
            out_disparity: layout.unit_file(&unit.tile, unit.pair, UnitOutput::Disparity),
            out_mask: layout.unit_file(&unit.tile, unit.pair, UnitOutput::DisparityMask),
            algorithm: cfg.matching.algorithm.clone(),
            disp_min,
            disp_max,
            timeout_secs: cfg.matching.timeout_secs,
            max_disp_range: cfg.matching.max_disp_range,
            mask_erosion: cfg.matching.mask_erosion,
        })
        .await;

    if let Some(allocation) = allocation.as_mut() {
        gpu.release(allocation)?;
    }

    if cfg.output.clean_intermediate {
        remove_if_exists(&layout.unit_file(&unit.tile, unit.pair, UnitOutput::RectifiedSec));
        if cfg.images.len() > 2 {
            remove_if_exists(&layout.unit_file(&unit.tile, unit.pair, UnitOutput::RectifiedRef));
        }
    }

    match result {
        Ok(true) => Ok(StageOutcome::Ok),
        Ok(false) => Ok(StageOutcome::Failed("matcher produced no disparity".to_string())),
        Err(e) => Err(e.context(format!("stereo matching failed for {}", unit))),
    }
}

fn triangulation_request(
    ctx: &StageContext<impl Collaborators>,
    unit: &WorkUnit,
    color_image: Option<PathBuf>,
    output: PathBuf,
) -> TriangulationRequest {
    let cfg = &ctx.config;
    let layout = &ctx.layout;
    let (tile, pair) = (&unit.tile, unit.pair);
    TriangulationRequest {
        region: tile.region(),
        ref_rpc: cfg.images[0].rpc.clone(),
        sec_rpc: cfg.images[pair].rpc.clone(),
        h_ref: layout.unit_file(tile, pair, UnitOutput::HomographyRef),
        h_sec: layout.unit_file(tile, pair, UnitOutput::HomographySec),
        disparity: layout.unit_file(tile, pair, UnitOutput::Disparity),
        disparity_mask: layout.unit_file(tile, pair, UnitOutput::DisparityMask),
        tile_mask: layout.tile_file(tile, TileOutput::Mask),
        global_pointing: layout.global_pointing(pair),
        out_crs: cfg.output.crs.clone(),
        color_image,
        filtering_radius_gsd: cfg.fusion.filtering_radius_gsd,
        filtering_fill_factor: cfg.fusion.filtering_fill_factor,
        gsd: cfg.fusion.gsd,
        output,
    }
}

fn color_image(cfg: &Config) -> PathBuf {
    let reference = &cfg.images[0];
    reference.clr.clone().unwrap_or_else(|| reference.img.clone())
}

/// Stage 6a (several pairs): triangulate one unit into a height map.
pub async fn disparity_to_height<B: Collaborators>(
    unit: WorkUnit,
    ctx: Arc<StageContext<B>>,
) -> Result<StageOutcome> {
    if !ctx.layout.has_unit_output(&unit.tile, unit.pair, UnitOutput::Disparity) {
        return Ok(StageOutcome::Skipped("no disparity map".to_string()));
    }
    let output = ctx.layout.unit_file(&unit.tile, unit.pair, UnitOutput::HeightMap);
    let req = triangulation_request(&ctx, &unit, None, output);
    ctx.backend.disparity_to_height(req).await?;
    Ok(StageOutcome::Ok)
}

/// Stage 6 (single pair): triangulate the tile's disparity straight into
/// its point cloud.
pub async fn disparity_to_cloud<B: Collaborators>(tile: Tile, ctx: Arc<StageContext<B>>) -> Result<StageOutcome> {
    let unit = WorkUnit { tile, pair: 1 };
    if !ctx.layout.has_unit_output(&unit.tile, unit.pair, UnitOutput::Disparity) {
        return Ok(StageOutcome::Skipped("no disparity map".to_string()));
    }
    let output = ctx.layout.tile_file(&unit.tile, TileOutput::Cloud);
    let req = triangulation_request(&ctx, &unit, Some(color_image(&ctx.config)), output);
    ctx.backend.disparity_to_cloud(req).await?;
    Ok(StageOutcome::Ok)
}

fn height_maps(ctx: &StageContext<impl Collaborators>, tile: &Tile) -> (Vec<PathBuf>, bool) {
    let maps: Vec<PathBuf> = (1..=ctx.config.num_pairs())
        .map(|pair| ctx.layout.unit_file(tile, pair, UnitOutput::HeightMap))
        .collect();
    let any = maps.iter().any(|p| p.is_file());
    (maps, any)
}

/// Stage 6b: per-pair mean heights of one tile.
pub async fn local_mean_heights<B: Collaborators>(tile: Tile, ctx: Arc<StageContext<B>>) -> Result<StageOutcome> {
    let (maps, any) = height_maps(&ctx, &tile);
    if !any {
        return Ok(StageOutcome::Skipped("no height map".to_string()));
    }

    let means = ctx
        .backend
        .local_mean_heights(MeanHeightsRequest {
            region: tile.region(),
            height_maps: maps,
        })
        .await?;
    write_vector(
        &ctx.layout.tile_file(&tile, TileOutput::LocalMeanHeights),
        Array1::from(means).view(),
    )?;
    Ok(StageOutcome::Ok)
}

/// Stage 6c: NaN-ignoring mean of the tiles' local means, one file per pair.
pub fn global_mean_heights<B: Collaborators>(ctx: &StageContext<B>, tiles: &[Tile]) -> Result<Vec<f64>> {
    let num_pairs = ctx.config.num_pairs();
    let mut per_tile = Vec::with_capacity(tiles.len());
    for tile in tiles {
        let path = ctx.layout.tile_file(tile, TileOutput::LocalMeanHeights);
        if !path.is_file() {
            continue;
        }
        match read_vector(&path) {
            Ok(v) => per_tile.push(v),
            Err(e) => tracing::warn!("Ignoring local mean heights of {}: {:#}", tile, e),
        }
    }

    let means = nan_mean_per_pair(&per_tile, num_pairs);
    for (i, mean) in means.iter().enumerate() {
        write_vector(&ctx.layout.global_mean_height(i + 1), array![*mean].view())?;
    }
    Ok(means)
}

fn read_global_mean_heights(ctx: &StageContext<impl Collaborators>) -> Vec<Option<f64>> {
    (1..=ctx.config.num_pairs())
        .map(|pair| {
            read_vector(&ctx.layout.global_mean_height(pair))
                .ok()
                .and_then(|v| v.get(0).copied())
                .filter(|m| !m.is_nan())
        })
        .collect()
}

/// Stage 6d: fuse the tile's height maps and build its point cloud.
pub async fn fuse_and_cloud<B: Collaborators>(tile: Tile, ctx: Arc<StageContext<B>>) -> Result<StageOutcome> {
    let (maps, any) = height_maps(&ctx, &tile);
    if !any {
        return Ok(StageOutcome::Skipped("no height map".to_string()));
    }

    let cfg = &ctx.config;
    let fused = ctx.layout.tile_file(&tile, TileOutput::HeightMap);
    ctx.backend
        .fuse_heights(FusionRequest {
            height_maps: maps,
            global_mean_heights: read_global_mean_heights(&ctx),
            operator: cfg.fusion.operator.clone(),
            threshold: cfg.fusion.threshold,
            remove_spurious: cfg.fusion.remove_spurious,
            output: fused.clone(),
        })
        .await?;

    ctx.backend
        .heights_to_cloud(CloudRequest {
            region: tile.region(),
            height_map: fused,
            ref_rpc: cfg.images[0].rpc.clone(),
            color_image: color_image(cfg),
            out_crs: cfg.output.crs.clone(),
            filtering_radius_gsd: cfg.fusion.filtering_radius_gsd,
            filtering_fill_factor: cfg.fusion.filtering_fill_factor,
            gsd: cfg.fusion.gsd,
            output: ctx.layout.tile_file(&tile, TileOutput::Cloud),
        })
        .await?;
    Ok(StageOutcome::Ok)
}

/// Raster grid aligned on multiples of `resolution` that covers `bounds`
/// (`[xmin, ymin, xmax, ymax]`). Rows run north to south.
pub fn raster_grid(bounds: [f64; 4], resolution: f64) -> RasterGrid {
    let [xmin, ymin, xmax, ymax] = bounds;
    let xoff = (xmin / resolution).floor() * resolution;
    let xsize = 1.0 + ((xmax - xoff) / resolution).floor();
    let yoff = (ymax / resolution).ceil() * resolution;
    let ysize = 1.0 - ((ymin - yoff) / resolution).floor();
    RasterGrid {
        xoff,
        yoff,
        xsize: xsize.max(1.0) as u64,
        ysize: ysize.max(1.0) as u64,
    }
}

/// Stage 7a: rasterize the tile's cloud, together with the neighbors'
/// clouds that exist, into the tile DSM.
pub async fn rasterize_tile<B: Collaborators>(tile: Tile, ctx: Arc<StageContext<B>>) -> Result<StageOutcome> {
    let layout = &ctx.layout;
    let cloud = layout.tile_file(&tile, TileOutput::Cloud);
    if !cloud.is_file() {
        return Ok(StageOutcome::Skipped("no point cloud".to_string()));
    }

    let Some(bounds) = ctx.backend.point_cloud_bounds(cloud.clone()).await? else {
        return Ok(StageOutcome::Skipped("point cloud is empty".to_string()));
    };

    let dsm_cfg = &ctx.config.dsm;
    let mut clouds = vec![cloud];
    clouds.extend(
        neighbors_of(&tile)
            .iter()
            .map(|key| layout.tile_file_by_key(key, TileOutput::Cloud))
            .filter(|p| p.is_file()),
    );

    let dsm = layout.tile_file(&tile, TileOutput::Dsm);
    ctx.backend
        .flatten_point_clouds(FlattenRequest {
            clouds,
            resolution: dsm_cfg.resolution,
            grid: raster_grid(bounds, dsm_cfg.resolution),
            radius: dsm_cfg.radius,
            sigma: dsm_cfg.sigma,
            aggregation_with_max: dsm_cfg.aggregation_with_max,
            out_dsm: dsm.clone(),
            out_confidence: layout.tile_file(&tile, TileOutput::Confidence),
        })
        .await?;

    if let Some(max_size) = dsm_cfg.fill_holes_smaller_than {
        ctx.backend
            .fill_holes(HoleFillRequest {
                dsm,
                max_size,
                output: layout.tile_file(&tile, TileOutput::DsmFiltered),
            })
            .await?;
    }
    Ok(StageOutcome::Ok)
}

/// Stage 7b: merge the per-tile rasters of every manifest tile into the
/// run-level rasters. Returns the outputs that were written.
pub async fn merge_global<B: Collaborators>(ctx: &StageContext<B>, tiles: &[Tile]) -> Result<Vec<GlobalOutput>> {
    let mut merges = Vec::new();
    for output in GlobalOutput::ALL {
        let inputs: Vec<PathBuf> = tiles
            .iter()
            .filter(|t| ctx.layout.has_tile_output(t, output.tile_source()))
            .map(|t| ctx.layout.tile_file(t, output.tile_source()))
            .collect();
        if inputs.is_empty() {
            tracing::info!("No tile has a {}, skipping its merge", output.file_name());
            continue;
        }

        tracing::info!("Merging {} tiles into {}", inputs.len(), output.file_name());
        let req = MergeRequest {
            inputs,
            bounds: ctx.config.dsm.bounds,
            resolution: ctx.config.dsm.resolution,
            nodata: f64::NAN,
            output: ctx.layout.global_file(output),
        };
        merges.push(async move {
            ctx.backend
                .merge_rasters(req)
                .await
                .with_context(|| format!("Failed to merge {}", output.file_name()))
                .map(|()| output)
        });
    }

    futures::future::try_join_all(merges).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tile::{partition, Region};

    #[test]
    fn test_raster_grid_alignment() {
        let grid = raster_grid([0.2, 0.3, 2.7, 1.9], 1.0);
        assert_eq!(
            grid,
            RasterGrid {
                xoff: 0.0,
                yoff: 2.0,
                xsize: 3,
                ysize: 3
            }
        );

        let grid = raster_grid([10.25, -3.0, 11.0, -1.1], 0.5);
        assert_eq!(grid.xoff, 10.0);
        assert_eq!(grid.xsize, 3);
        assert_eq!(grid.yoff, -1.0);
        assert_eq!(grid.ysize, 5);
    }

    #[test]
    fn test_gpu_request_grows_with_span() {
        let tile = partition(Region::new(0, 0, 300, 300), 300, 300).remove(0);
        let small = gpu_request_mib(&tile, 10.0);
        let large = gpu_request_mib(&tile, 100.0);

        assert!(small >= 1);
        assert!(large > small);
        // 90000 px * 101 levels * 2 B + 90000 px * 16 B
        assert_eq!(large, (90_000u64 * 101 * 2 + 90_000 * 16).div_ceil(MIB) as u32);
    }

    #[test]
    fn test_gpu_request_at_least_one_mib() {
        let tile = partition(Region::new(0, 0, 4, 4), 4, 4).remove(0);
        assert_eq!(gpu_request_mib(&tile, 2.0), 1);
        assert_eq!(gpu_request_mib(&tile, -5.0), 1);
    }

    #[test]
    fn test_outcome_is_ok() {
        assert!(StageOutcome::Ok.is_ok());
        assert!(!StageOutcome::Skipped("no cloud".into()).is_ok());
    }
}
