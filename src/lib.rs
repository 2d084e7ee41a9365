//! Stereo DSM Pipeline
//!
//! Orchestrates a tiled multi-view satellite stereo pipeline: the region of
//! interest is cut into tiles, every tile is matched against each secondary
//! image, and the per-tile results are fused into point clouds and then
//! into a digital surface model.
//!
//! # Architecture
//!
//! - **Tile**: partition of the region, neighborhood relation, manifest
//! - **Layout**: every file a run reads or writes
//! - **Collab**: the numeric operations, run by an external tool
//! - **Resource**: GPU memory budget shared by the matching workers
//! - **Pipeline**: task launcher, live set and the 8-stage controller
//!
//! # Usage
//!
//! ```no_run
//! use stereo_dsm::{run_pipeline, Config};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::from_file("config.yaml".as_ref())?;
//!     run_pipeline(config, 0, 7).await?;
//!     Ok(())
//! }
//! ```

pub mod collab;
pub mod config;
pub mod error;
pub mod layout;
pub mod pipeline;
pub mod resource;
pub mod tile;

pub use collab::{Collaborators, ExternalTools};
pub use config::Config;
pub use error::{GpuMemoryError, PipelineError, RUN_FATAL_EXIT_CODE};
pub use layout::RunLayout;
pub use pipeline::{LiveSet, Metrics, Pipeline, RunSummary, Stage, StageReport};
pub use resource::GpuMemoryManager;
pub use tile::{Region, Tile};

use anyhow::Result;
use std::sync::Arc;

use pipeline::MetricsReporter;

/// Run stages `start_from..=stop_after` with the external tool backend.
pub async fn run_pipeline(config: Config, start_from: u8, stop_after: u8) -> Result<RunSummary> {
    // Validate configuration
    config.validate()?;
    let config = Arc::new(config);

    tracing::info!("Starting stereo DSM pipeline");
    tracing::info!(
        "{} images ({} pairs), output in {}",
        config.images.len(),
        config.num_pairs(),
        config.output.out_dir.display()
    );

    let backend = Arc::new(ExternalTools::new(&config.tools));
    let metrics = Metrics::new();
    let pipeline = Pipeline::new(config.clone(), backend, metrics.clone());

    let summary = pipeline.run(start_from, stop_after).await?;

    if config.processing.enable_metrics {
        let reporter = MetricsReporter::new(metrics.clone(), config.processing.metrics_interval_secs, 0);
        reporter.print_summary();
    }
    if let Some(path) = &config.processing.metrics_output_path {
        if let Err(e) = metrics.snapshot().save_to_file(path) {
            tracing::warn!("Failed to save metrics to {}: {}", path.display(), e);
        }
    }

    tracing::info!(
        "Pipeline complete: {} of {} work units live, merged {:?}",
        summary.final_live.len(),
        summary.tiles.len() * config.num_pairs(),
        summary.merged.iter().map(|o| o.file_name()).collect::<Vec<_>>()
    );
    Ok(summary)
}

/// Build a Tokio runtime with the specified configuration.
pub fn build_runtime(worker_threads: Option<usize>) -> Result<tokio::runtime::Runtime> {
    let mut builder = tokio::runtime::Builder::new_multi_thread();

    if let Some(threads) = worker_threads {
        builder.worker_threads(threads);
    }

    builder.enable_all();

    Ok(builder.build()?)
}
