//! Run progress counters and periodic reporting.

use serde::{Serialize, Serializer};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::time::interval;

fn serialize_duration<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_f64(duration.as_secs_f64())
}

/// Metrics for one pipeline run.
#[derive(Debug, Default)]
pub struct Metrics {
    /// Tasks handed to the launcher
    pub units_dispatched: AtomicU64,

    /// Tasks that reached a final state, whatever it was
    pub units_finished: AtomicU64,

    /// Tasks that returned a successful outcome
    pub units_succeeded: AtomicU64,

    /// Tasks that had nothing to do (missing upstream output)
    pub units_skipped: AtomicU64,

    /// Tasks that failed or panicked
    pub units_failed: AtomicU64,

    /// Tasks aborted by the per-task timeout
    pub units_timed_out: AtomicU64,

    /// Work units removed from the live set
    pub units_dropped: AtomicU64,

    /// Time spent waiting for GPU memory (microseconds, summed across tasks)
    pub gpu_wait_us: AtomicU64,

    /// Highest GPU memory usage observed (MiB)
    pub gpu_peak_mib: AtomicU64,

    /// Start time
    start_time: Option<Instant>,

    /// Wall time per stage, keyed by stage name
    stage_times: Mutex<BTreeMap<String, Duration>>,
}

impl Metrics {
    /// Create new metrics.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            start_time: Some(Instant::now()),
            ..Default::default()
        })
    }

    pub fn add_dispatched(&self, count: u64) {
        self.units_dispatched.fetch_add(count, Ordering::Relaxed);
    }

    pub fn add_finished(&self) {
        self.units_finished.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_succeeded(&self) {
        self.units_succeeded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_skipped(&self) {
        self.units_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_failed(&self) {
        self.units_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_timed_out(&self) {
        self.units_timed_out.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_dropped(&self, count: u64) {
        self.units_dropped.fetch_add(count, Ordering::Relaxed);
    }

    /// Record time spent waiting for a GPU allocation.
    pub fn add_gpu_wait_time(&self, duration: Duration) {
        self.gpu_wait_us
            .fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn record_gpu_peak(&self, mib: u64) {
        self.gpu_peak_mib.fetch_max(mib, Ordering::Relaxed);
    }

    pub fn record_stage_time(&self, stage: &str, duration: Duration) {
        let mut times = self.stage_times.lock().unwrap_or_else(|e| e.into_inner());
        *times.entry(stage.to_string()).or_default() += duration;
    }

    /// Tasks that reached a final state.
    pub fn units_completed(&self) -> u64 {
        self.units_finished.load(Ordering::Relaxed)
    }

    /// Get elapsed time since start.
    pub fn elapsed(&self) -> Duration {
        self.start_time.map_or(Duration::ZERO, |t| t.elapsed())
    }

    /// Get completed tasks per second.
    pub fn units_per_second(&self) -> f64 {
        let elapsed = self.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            self.units_completed() as f64 / elapsed
        } else {
            0.0
        }
    }

    /// Get a snapshot of current metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let stage_secs = self
            .stage_times
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(k, v)| (k.clone(), v.as_secs_f64()))
            .collect();

        MetricsSnapshot {
            units_dispatched: self.units_dispatched.load(Ordering::Relaxed),
            units_succeeded: self.units_succeeded.load(Ordering::Relaxed),
            units_skipped: self.units_skipped.load(Ordering::Relaxed),
            units_failed: self.units_failed.load(Ordering::Relaxed),
            units_timed_out: self.units_timed_out.load(Ordering::Relaxed),
            units_dropped: self.units_dropped.load(Ordering::Relaxed),
            elapsed: self.elapsed(),
            units_per_second: self.units_per_second(),
            gpu_wait_secs: self.gpu_wait_us.load(Ordering::Relaxed) as f64 / 1_000_000.0,
            gpu_peak_mib: self.gpu_peak_mib.load(Ordering::Relaxed),
            stage_secs,
        }
    }
}

/// Snapshot of metrics at a point in time.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub units_dispatched: u64,
    pub units_succeeded: u64,
    pub units_skipped: u64,
    pub units_failed: u64,
    pub units_timed_out: u64,
    pub units_dropped: u64,
    #[serde(serialize_with = "serialize_duration")]
    pub elapsed: Duration,
    pub units_per_second: f64,
    /// Total time tasks spent waiting for GPU memory (seconds, summed across tasks)
    pub gpu_wait_secs: f64,
    pub gpu_peak_mib: u64,
    /// Wall time per stage (seconds)
    pub stage_secs: BTreeMap<String, f64>,
}

impl MetricsSnapshot {
    /// Save metrics to a JSON file.
    pub fn save_to_file(&self, path: &Path) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        tracing::info!("Metrics saved to {}", path.display());
        Ok(())
    }
}

impl std::fmt::Display for MetricsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Units: {} ok, {} skipped, {} failed, {} timed out, {} dropped | \
             Rate: {:.1} units/s | GPU: peak {} MiB, wait {:.1}s | Elapsed: {:.1}s",
            self.units_succeeded,
            self.units_skipped,
            self.units_failed,
            self.units_timed_out,
            self.units_dropped,
            self.units_per_second,
            self.gpu_peak_mib,
            self.gpu_wait_secs,
            self.elapsed.as_secs_f64(),
        )
    }
}

/// Periodic progress reporter for one launch.
pub struct MetricsReporter {
    metrics: Arc<Metrics>,
    interval_secs: u64,
    total_units: u64,
    /// Completed count when the launch started
    baseline: u64,
}

impl MetricsReporter {
    /// Create a new metrics reporter.
    pub fn new(metrics: Arc<Metrics>, interval_secs: u64, total_units: u64) -> Self {
        let baseline = metrics.units_completed();
        Self {
            metrics,
            interval_secs,
            total_units,
            baseline,
        }
    }

    /// Progress of the current launch in percent.
    pub fn progress(&self) -> f64 {
        if self.total_units == 0 {
            return 0.0;
        }
        let done = self.metrics.units_completed().saturating_sub(self.baseline);
        done as f64 / self.total_units as f64 * 100.0
    }

    /// Start the periodic reporter.
    pub async fn run(self, mut shutdown: mpsc::Receiver<()>) {
        let mut ticker = interval(Duration::from_secs(self.interval_secs.max(1)));
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    tracing::info!("[{:.1}%] {}", self.progress(), self.metrics.snapshot());
                }
                _ = shutdown.recv() => {
                    break;
                }
            }
        }
    }

    /// Print a final summary.
    pub fn print_summary(&self) {
        let snapshot = self.metrics.snapshot();

        println!("\n=== Pipeline Summary ===");
        println!("Total time: {:.1}s", snapshot.elapsed.as_secs_f64());
        println!("Tasks dispatched: {}", snapshot.units_dispatched);
        println!("Succeeded: {}", snapshot.units_succeeded);
        println!("Skipped: {}", snapshot.units_skipped);
        println!("Failed: {}", snapshot.units_failed);
        println!("Timed out: {}", snapshot.units_timed_out);
        println!("Dropped from live set: {}", snapshot.units_dropped);
        if snapshot.gpu_peak_mib > 0 {
            println!(
                "GPU: peak {} MiB, {:.1}s waiting",
                snapshot.gpu_peak_mib, snapshot.gpu_wait_secs
            );
        }

        if !snapshot.stage_secs.is_empty() {
            println!("\n--- Stage Time Breakdown ---");
            for (stage, secs) in &snapshot.stage_secs {
                println!("{:<28} {:>7.1}s", stage, secs);
            }
        }
        println!("========================\n");
    }
}
