//! Stereo DSM Pipeline CLI
//!
//! Runs the tiled stereo pipeline described by a configuration file.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use stereo_dsm::resource::GPU_CONTEXT_RESERVE_MIB;
use stereo_dsm::tile::partition;
use stereo_dsm::{build_runtime, run_pipeline, Config, PipelineError, RUN_FATAL_EXIT_CODE};

#[derive(Parser)]
#[command(name = "stereo-dsm")]
#[command(about = "Compute a digital surface model from satellite stereo images", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.yaml", global = true)]
    config: PathBuf,

    /// Override the default worker count per stage
    #[arg(long, global = true)]
    workers: Option<usize>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the pipeline (default if no command specified)
    Run {
        /// First stage to run (0-7); later stages reuse a previous run's outputs
        #[arg(long, default_value_t = 0)]
        start_from: u8,

        /// Last stage to run (0-7)
        #[arg(long, default_value_t = 7)]
        stop_after: u8,
    },

    /// Show the tiling and work units without processing
    Analyze,

    /// Validate configuration
    Validate,

    /// Generate a sample configuration file
    GenerateConfig {
        /// Output path for configuration file
        #[arg(short, long, default_value = "config.yaml")]
        output: PathBuf,
    },
}

fn main() -> ExitCode {
    // Initialize logging
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        None => run_command(cli.config, cli.workers, 0, 7),
        Some(Commands::Run {
            start_from,
            stop_after,
        }) => run_command(cli.config, cli.workers, start_from, stop_after),
        Some(Commands::Analyze) => analyze_command(cli.config, cli.workers),
        Some(Commands::Validate) => validate_command(cli.config),
        Some(Commands::GenerateConfig { output }) => generate_config_command(output),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => ExitCode::from(exit_status_for(&e)),
    }
}

fn exit_status_for(error: &anyhow::Error) -> u8 {
    match error.downcast_ref::<PipelineError>() {
        Some(fatal) if fatal.is_run_fatal() => {
            tracing::error!("{}", fatal);
            RUN_FATAL_EXIT_CODE
        }
        _ => {
            tracing::error!("{:#}", error);
            1
        }
    }
}

fn load_config(config_path: &Path, workers: Option<usize>) -> Result<Config> {
    let mut config = Config::from_file(config_path)?;

    // Apply overrides
    if let Some(w) = workers {
        config.processing.max_processes = Some(w);
    }

    config.validate()?;
    Ok(config)
}

fn run_command(config_path: PathBuf, workers: Option<usize>, start_from: u8, stop_after: u8) -> Result<()> {
    let config = load_config(&config_path, workers)?;

    // Build and run Tokio runtime
    let runtime = build_runtime(config.processing.worker_threads)?;
    let summary = runtime.block_on(async { run_pipeline(config, start_from, stop_after).await })?;

    for report in &summary.reports {
        println!("{}", report);
    }
    Ok(())
}

fn analyze_command(config_path: PathBuf, workers: Option<usize>) -> Result<()> {
    let config = load_config(&config_path, workers)?;
    let tiles = partition(config.roi, config.tiling.tile_width, config.tiling.tile_height);
    let processing = &config.processing;

    println!("\n=== Work Analysis ===");
    println!("Images: {} ({} pairs)", config.images.len(), config.num_pairs());
    println!(
        "Region: {}x{} at ({}, {})",
        config.roi.w, config.roi.h, config.roi.x, config.roi.y
    );
    println!(
        "Tile size: {}x{}",
        config.tiling.tile_width, config.tiling.tile_height
    );
    println!("Tiles: {}", tiles.len());
    println!("Work units (tile x pair): {}", tiles.len() * config.num_pairs());

    println!("\n=== Workers ===");
    println!("Default: {}", processing.workers());
    println!("Stereo matching: {}", processing.stereo_workers());
    match processing.task_timeout() {
        Some(t) => println!("Task timeout: {}s", t.as_secs()),
        None => println!("Task timeout: none"),
    }

    println!("\n=== Stereo Matching ===");
    println!("Algorithm: {}", config.matching.algorithm);
    if config.matching.uses_gpu() {
        match processing.gpu_total_memory_mib {
            Some(total) => {
                let reserve = GPU_CONTEXT_RESERVE_MIB * processing.stereo_workers() as u64;
                println!(
                    "GPU budget: {} MiB ({} MiB total, {} MiB worker contexts)",
                    total.saturating_sub(reserve),
                    total,
                    reserve
                );
            }
            None => println!("GPU budget: unbounded"),
        }
    }
    println!("=====================\n");

    Ok(())
}

fn validate_command(config_path: PathBuf) -> Result<()> {
    let config = Config::from_file(&config_path)?;
    config.validate()?;
    println!("Configuration is valid");
    Ok(())
}

fn generate_config_command(output: PathBuf) -> Result<()> {
    // Generate a commented YAML config
    let yaml = r#"# Stereo DSM Pipeline Configuration
# Relative paths are resolved against the directory of this file.

# === IMAGES: the first one is the reference image ===
images:
  - img: "images/img_01.tif"
    rpc: "images/rpc_01.xml"
    # Optional color image used to colorize point clouds
    # clr: "images/clr_01.tif"
  - img: "images/img_02.tif"
    rpc: "images/rpc_02.xml"

# === ROI: region of interest in reference image pixels ===
roi: { x: 0, y: 0, w: 3000, h: 2000 }

# === OUTPUT ===
output:
  out_dir: "output"

  # CRS of point clouds and rasters
  crs: "EPSG:4326"

  # Delete intermediate files once consumed
  clean_intermediate: false

# === TILING ===
tiling:
  tile_width: 300
  tile_height: 300

# === PROCESSING: workers, timeouts and GPU ===
processing:
  # Concurrent tasks per stage (null = num CPUs)
  # max_processes: 8

  # Concurrent tasks for stereo matching (null = max_processes)
  # max_processes_stereo_matching: 2

  # Per-task timeout in seconds (null disables)
  timeout_secs: 600

  # Total device memory in MiB; bounds GPU matchers (null = unbounded)
  # gpu_total_memory_mib: 8000

  # Tokio worker threads (null = num CPUs)
  # worker_threads: 8

  # Print progress during stages
  enable_metrics: true
  metrics_interval_secs: 10

  # metrics_output_path: "output/metrics.json"

# === POINTING CORRECTION ===
pointing:
  sift_match_thresh: 0.6
  relative_sift_match_thresh: true
  max_pointing_error: 10
  n_gcp_per_axis: 5

# === RECTIFICATION ===
rectification:
  method: "rpc"
  horizontal_margin: 20
  vertical_margin: 5

# === STEREO MATCHING ===
matching:
  # Algorithms ending in _gpu run under the GPU budget
  algorithm: "mgm"
  timeout_secs: 600
  # max_disp_range: 200
  mask_erosion: 2

# === HEIGHT FUSION / 3D FILTERING ===
fusion:
  operator: "average_if_close"
  threshold: 3.0
  remove_spurious: false
  filtering_radius_gsd: 0
  filtering_fill_factor: 0
  gsd: 0.5

# === DSM ===
dsm:
  resolution: 0.5
  radius: 0
  # sigma: 1.0
  aggregation_with_max: false
  # fill_holes_smaller_than: 10
  # bounds: [xmin, ymin, xmax, ymax]

# === EXTERNAL TOOL running the numeric steps ===
tools:
  program: "dsm-tools"
  args: []
"#;

    std::fs::write(&output, yaml)?;
    println!("Generated sample configuration at: {}", output.display());

    Ok(())
}
