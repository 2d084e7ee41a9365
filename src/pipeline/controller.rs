//! Stage pipeline controller.
//!
//! Runs the stages strictly one after another, threads the live set through
//! them, journals it after every stage and turns task outcomes into stage
//! reports. Resumed runs reload the tile manifest and the latest journal.

use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use crate::collab::Collaborators;
use crate::config::Config;
use crate::error::{GpuMemoryError, PipelineError};
use crate::layout::{GlobalOutput, RunLayout};
use crate::pipeline::live_set::{clear_journals_from, load_latest_journal, write_journal};
use crate::pipeline::stages::{self, StageContext, StageOutcome};
use crate::pipeline::{Launcher, LiveSet, Metrics, TaskOutcome, UnitKey, WorkUnit};
use crate::resource::GpuMemoryManager;
use crate::tile::{self, Tile};

/// Pipeline stages, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Stage {
    Initialization,
    LocalPointing,
    GlobalPointing,
    Rectification,
    DisparityCheck,
    StereoMatching,
    Triangulation,
    Rasterization,
}

impl Stage {
    pub const ALL: [Stage; 8] = [
        Self::Initialization,
        Self::LocalPointing,
        Self::GlobalPointing,
        Self::Rectification,
        Self::DisparityCheck,
        Self::StereoMatching,
        Self::Triangulation,
        Self::Rasterization,
    ];

    pub fn index(self) -> u8 {
        self as u8
    }

    pub fn from_index(index: u8) -> Result<Self, PipelineError> {
        Self::ALL
            .get(usize::from(index))
            .copied()
            .ok_or(PipelineError::UnknownStage(index))
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Initialization => "initialization",
            Self::LocalPointing => "local pointing correction",
            Self::GlobalPointing => "global pointing correction",
            Self::Rectification => "rectification",
            Self::DisparityCheck => "disparity range check",
            Self::StereoMatching => "stereo matching",
            Self::Triangulation => "triangulation",
            Self::Rasterization => "rasterization",
        }
    }

    /// Stages whose non-successful units leave the live set.
    pub fn is_gating(self) -> bool {
        matches!(
            self,
            Self::Initialization | Self::LocalPointing | Self::Rectification | Self::DisparityCheck
        )
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}) {}", self.index(), self.name())
    }
}

/// Outcome counts of one launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageReport {
    pub stage: Stage,
    /// Sub-step name when a stage launches several times
    pub step: &'static str,
    pub inputs: usize,
    pub succeeded: usize,
    pub skipped: usize,
    pub failed: usize,
    pub timed_out: usize,
    pub dropped: usize,
}

impl StageReport {
    fn new(stage: Stage, step: &'static str, inputs: usize) -> Self {
        Self {
            stage,
            step,
            inputs,
            succeeded: 0,
            skipped: 0,
            failed: 0,
            timed_out: 0,
            dropped: 0,
        }
    }
}

impl std::fmt::Display for StageReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} [{}]: {} inputs, {} ok, {} skipped, {} failed, {} timed out, {} dropped",
            self.stage,
            self.step,
            self.inputs,
            self.succeeded,
            self.skipped,
            self.failed,
            self.timed_out,
            self.dropped
        )
    }
}

/// What a run did.
#[derive(Debug, Clone)]
pub struct RunSummary {
    /// The tile manifest the run worked on
    pub tiles: Vec<Tile>,
    pub reports: Vec<StageReport>,
    /// Live units handed to each executed stage (1-7)
    pub stage_inputs: BTreeMap<u8, Vec<UnitKey>>,
    pub final_live: LiveSet,
    /// Run-level rasters written by the final merge
    pub merged: Vec<GlobalOutput>,
}

impl RunSummary {
    pub fn reports_for(&self, stage: Stage) -> impl Iterator<Item = &StageReport> {
        self.reports.iter().filter(move |r| r.stage == stage)
    }
}

/// Runs stages 0-7 over one output directory.
pub struct Pipeline<B: Collaborators> {
    ctx: Arc<StageContext<B>>,
    launcher: Launcher,
}

impl<B: Collaborators> Pipeline<B> {
    pub fn new(config: Arc<Config>, backend: Arc<B>, metrics: Arc<Metrics>) -> Self {
        let processing = &config.processing;
        let mut launcher = Launcher::new(processing.workers(), processing.task_timeout(), metrics.clone());
        if processing.enable_metrics {
            launcher = launcher.with_progress(processing.metrics_interval_secs);
        }

        let layout = RunLayout::new(&config.output.out_dir);
        Self {
            ctx: Arc::new(StageContext {
                config,
                backend,
                layout,
                metrics,
            }),
            launcher,
        }
    }

    pub fn layout(&self) -> &RunLayout {
        &self.ctx.layout
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.ctx.metrics
    }

    /// Run stages `start_from..=stop_after`.
    pub async fn run(&self, start_from: u8, stop_after: u8) -> Result<RunSummary> {
        let start = Stage::from_index(start_from)?;
        let stop = Stage::from_index(stop_after)?;
        if start > stop {
            return Err(PipelineError::InvalidStageRange {
                start_from,
                stop_after,
            }
            .into());
        }

        let layout = &self.ctx.layout;
        std::fs::create_dir_all(layout.root())
            .with_context(|| format!("Failed to create {}", layout.root().display()))?;
        clear_journals_from(layout, start_from)?;

        let mut reports = Vec::new();
        let tiles = if start == Stage::Initialization {
            let started = Instant::now();
            let tiles = self.initialize(&mut reports).await?;
            self.ctx
                .metrics
                .record_stage_time(Stage::Initialization.name(), started.elapsed());
            tiles
        } else {
            self.load_manifest(start_from)?
        };

        let num_pairs = self.ctx.config.num_pairs();
        let mut live = if start_from <= 1 {
            LiveSet::full(&tiles, num_pairs)
        } else {
            match load_latest_journal(layout, start_from)? {
                Some(journal) => {
                    tracing::info!(
                        "Resuming from stage {} with the live set of stage {}",
                        start_from,
                        journal.stage
                    );
                    LiveSet::from_keys(&tiles, num_pairs, &journal.units)
                }
                None => {
                    tracing::warn!(
                        "No live-set journal before stage {}, assuming every unit is live",
                        start_from
                    );
                    LiveSet::full(&tiles, num_pairs)
                }
            }
        };

        let mut stage_inputs = BTreeMap::new();
        let mut merged = Vec::new();
        for stage in Stage::ALL
            .into_iter()
            .filter(|s| *s != Stage::Initialization && *s >= start && *s <= stop)
        {
            stage_inputs.insert(stage.index(), live.keys());
            let started = Instant::now();

            live = match stage {
                Stage::LocalPointing => {
                    tracing::info!("1) correcting pointing locally...");
                    self.run_units(stage, "per unit", live, stages::pointing_correction::<B>, &mut reports)
                        .await?
                }
                Stage::GlobalPointing => {
                    tracing::info!("2) correcting pointing globally...");
                    stages::global_pointing(&self.ctx, &live)?;
                    live
                }
                Stage::Rectification => {
                    tracing::info!("3) rectifying tiles...");
                    self.run_units(stage, "per unit", live, stages::rectify_unit::<B>, &mut reports)
                        .await?
                }
                Stage::DisparityCheck => {
                    tracing::info!("4) checking disparity ranges...");
                    self.run_units(stage, "per unit", live, stages::disparity_check::<B>, &mut reports)
                        .await?
                }
                Stage::StereoMatching => {
                    tracing::info!("5) running stereo matching...");
                    self.stereo_matching(live, &mut reports).await?
                }
                Stage::Triangulation => {
                    tracing::info!("6) triangulating...");
                    self.triangulation(live, &tiles, &mut reports).await?
                }
                Stage::Rasterization => {
                    tracing::info!("7) computing DSM by tile...");
                    let live_tiles = live.live_tiles(&tiles);
                    self.run_tiles(stage, "tile DSM", live_tiles, stages::rasterize_tile::<B>, &mut reports)
                        .await?;

                    tracing::info!("7) computing global DSM...");
                    merged = stages::merge_global(&self.ctx, &tiles).await?;
                    live
                }
                Stage::Initialization => live,
            };

            self.ctx.metrics.record_stage_time(stage.name(), started.elapsed());
            write_journal(layout, stage.index(), &live)?;
            tracing::info!("{} done, {} work units live", stage, live.len());
        }

        Ok(RunSummary {
            tiles,
            reports,
            stage_inputs,
            final_live: live,
            merged,
        })
    }

    /// Stage 0: partition, build masks, keep usable tiles, write the manifest.
    async fn initialize(&self, reports: &mut Vec<StageReport>) -> Result<Vec<Tile>> {
        tracing::info!("0) initializing tiles...");
        let cfg = &self.ctx.config;
        let tiles = tile::partition(cfg.roi, cfg.tiling.tile_width, cfg.tiling.tile_height);
        tracing::info!(
            "Region {}x{} at ({}, {}) split into {} tiles",
            cfg.roi.w,
            cfg.roi.h,
            cfg.roi.x,
            cfg.roi.y,
            tiles.len()
        );

        let labels: Vec<String> = tiles.iter().map(ToString::to_string).collect();
        let outcomes = self
            .launcher
            .launch(stages::create_mask::<B>, tiles.clone(), self.ctx.clone())
            .await;
        let (report, usable) = self.tally(Stage::Initialization, "tile masks", &labels, outcomes)?;
        tracing::info!("{}", report);
        reports.push(report);

        let tiles = tile::retain_usable(tiles, &usable);
        if tiles.is_empty() {
            return Err(PipelineError::NoUsableTiles.into());
        }

        tile::persist(&tiles, &self.ctx.layout.manifest())?;
        Ok(tiles)
    }

    fn load_manifest(&self, start_from: u8) -> Result<Vec<Tile>> {
        let path = self.ctx.layout.manifest();
        if !path.is_file() {
            return Err(PipelineError::MissingManifest { start_from, path }.into());
        }
        let tiles = tile::load(&path)?;
        if tiles.is_empty() {
            return Err(PipelineError::EmptyManifest { path }.into());
        }
        tracing::info!("Loaded {} tiles from {}", tiles.len(), path.display());
        Ok(tiles)
    }

    /// Launch a per-unit stage function over the live set and apply the
    /// stage's gating to the outcomes.
    async fn run_units<F, Fut>(
        &self,
        stage: Stage,
        step: &'static str,
        live: LiveSet,
        call: F,
        reports: &mut Vec<StageReport>,
    ) -> Result<LiveSet>
    where
        F: Fn(WorkUnit, Arc<StageContext<B>>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<StageOutcome>> + Send + 'static,
    {
        self.run_units_with(stage, step, live, &self.launcher, call, self.ctx.clone(), reports)
            .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_units_with<S, F, Fut>(
        &self,
        stage: Stage,
        step: &'static str,
        live: LiveSet,
        launcher: &Launcher,
        call: F,
        shared: S,
        reports: &mut Vec<StageReport>,
    ) -> Result<LiveSet>
    where
        S: Clone + Send + Sync + 'static,
        F: Fn(WorkUnit, S) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<StageOutcome>> + Send + 'static,
    {
        let labels: Vec<String> = live.units().iter().map(ToString::to_string).collect();
        let outcomes = launcher.launch(call, live.units().to_vec(), shared).await;
        let (report, keep) = self.tally(stage, step, &labels, outcomes)?;
        tracing::info!("{}", report);
        reports.push(report);

        if stage.is_gating() {
            let (kept, _) = live.partition_by(&keep);
            Ok(kept)
        } else {
            Ok(live)
        }
    }

    /// Launch a per-tile step. Never changes the live set.
    async fn run_tiles<F, Fut>(
        &self,
        stage: Stage,
        step: &'static str,
        tiles: Vec<Tile>,
        call: F,
        reports: &mut Vec<StageReport>,
    ) -> Result<()>
    where
        F: Fn(Tile, Arc<StageContext<B>>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<StageOutcome>> + Send + 'static,
    {
        let labels: Vec<String> = tiles.iter().map(ToString::to_string).collect();
        let outcomes = self.launcher.launch(call, tiles, self.ctx.clone()).await;
        let (report, _) = self.tally(stage, step, &labels, outcomes)?;
        tracing::info!("{}", report);
        reports.push(report);
        Ok(())
    }

    async fn stereo_matching(&self, live: LiveSet, reports: &mut Vec<StageReport>) -> Result<LiveSet> {
        let processing = &self.ctx.config.processing;
        let workers = processing.stereo_workers();
        let gpu = if self.ctx.config.matching.uses_gpu() {
            GpuMemoryManager::from_total(processing.gpu_total_memory_mib, workers)?
        } else {
            GpuMemoryManager::unbounded()
        };
        if let Some(budget) = gpu.budget_mib() {
            tracing::info!("GPU budget: {} MiB shared by {} workers", budget, workers);
        }

        let launcher = self.launcher.with_workers(workers);
        let live = self
            .run_units_with(
                Stage::StereoMatching,
                "per unit",
                live,
                &launcher,
                stages::stereo_matching::<B>,
                (self.ctx.clone(), gpu.clone()),
                reports,
            )
            .await?;

        self.ctx.metrics.record_gpu_peak(gpu.peak_mib());
        if gpu.in_use_mib() != 0 || gpu.outstanding() != 0 {
            let fault = GpuMemoryError::BookkeepingCorrupted {
                in_use_mib: gpu.in_use_mib(),
                budget_mib: gpu.budget_mib().unwrap_or(0),
            };
            tracing::error!("GPU memory still held after stereo matching: {}", fault);
            return Err(PipelineError::ResourceFault {
                stage: Stage::StereoMatching.name(),
                source: fault,
            }
            .into());
        }
        Ok(live)
    }

    async fn triangulation(
        &self,
        live: LiveSet,
        manifest: &[Tile],
        reports: &mut Vec<StageReport>,
    ) -> Result<LiveSet> {
        let stage = Stage::Triangulation;
        let live_tiles = live.live_tiles(manifest);

        if self.ctx.config.images.len() > 2 {
            let live = self
                .run_units(stage, "heights", live, stages::disparity_to_height::<B>, reports)
                .await?;
            self.run_tiles(stage, "local mean heights", live_tiles.clone(), stages::local_mean_heights::<B>, reports)
                .await?;

            let means = stages::global_mean_heights(&self.ctx, &live_tiles)?;
            tracing::info!("Global mean heights per pair: {:?}", means);

            self.run_tiles(stage, "fusion", live_tiles, stages::fuse_and_cloud::<B>, reports)
                .await?;
            Ok(live)
        } else {
            self.run_tiles(stage, "point clouds", live_tiles, stages::disparity_to_cloud::<B>, reports)
                .await?;
            Ok(live)
        }
    }

    /// Count outcomes, log every unit that did not succeed and decide which
    /// inputs stay live. A fatal GPU bookkeeping error aborts the run.
    fn tally(
        &self,
        stage: Stage,
        step: &'static str,
        labels: &[String],
        outcomes: Vec<TaskOutcome<StageOutcome>>,
    ) -> Result<(StageReport, Vec<bool>)> {
        let metrics = &self.ctx.metrics;
        let gating = stage.is_gating();
        let mut report = StageReport::new(stage, step, outcomes.len());
        let mut keep = Vec::with_capacity(outcomes.len());

        for (label, outcome) in labels.iter().zip(outcomes) {
            let reason = match outcome {
                TaskOutcome::Succeeded(StageOutcome::Ok) => {
                    report.succeeded += 1;
                    metrics.add_succeeded();
                    keep.push(true);
                    continue;
                }
                TaskOutcome::Succeeded(StageOutcome::Skipped(reason)) => {
                    report.skipped += 1;
                    metrics.add_skipped();
                    if !gating {
                        tracing::debug!("{}: skipping {}: {}", stage.name(), label, reason);
                        keep.push(true);
                        continue;
                    }
                    reason
                }
                TaskOutcome::Succeeded(StageOutcome::Failed(reason)) => {
                    report.failed += 1;
                    metrics.add_failed();
                    reason
                }
                TaskOutcome::Failed(e) => {
                    if let Some(gpu_err) = e.downcast_ref::<GpuMemoryError>() {
                        if gpu_err.is_fatal() {
                            tracing::error!("{} aborted by {}: {}", stage.name(), label, gpu_err);
                            return Err(PipelineError::ResourceFault {
                                stage: stage.name(),
                                source: gpu_err.clone(),
                            }
                            .into());
                        }
                    }
                    report.failed += 1;
                    metrics.add_failed();
                    format!("{:#}", e)
                }
                outcome @ TaskOutcome::Panicked(_) => {
                    report.failed += 1;
                    metrics.add_failed();
                    outcome.failure_reason()
                }
                TaskOutcome::TimedOut => {
                    report.timed_out += 1;
                    metrics.add_timed_out();
                    "timed out".to_string()
                }
            };

            if gating {
                report.dropped += 1;
                tracing::warn!("{}: dropping {}: {}", stage.name(), label, reason);
            } else {
                tracing::warn!("{} failed for {}: {}", stage.name(), label, reason);
            }
            keep.push(!gating);
        }

        metrics.add_dropped(report.dropped as u64);
        Ok((report, keep))
    }
}
