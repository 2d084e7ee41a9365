//! Bounded parallel task launcher.
//!
//! A fixed number of worker loops pull `(index, argument)` pairs from a
//! shared queue. Every task runs as its own Tokio task so an error, panic or
//! timeout stays contained, and outcomes are put back in input order.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinError;

use crate::pipeline::{Metrics, MetricsReporter};

/// Final state of one launched task.
#[derive(Debug)]
pub enum TaskOutcome<T> {
    Succeeded(T),
    Failed(anyhow::Error),
    Panicked(String),
    TimedOut,
}

impl<T> TaskOutcome<T> {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded(_))
    }

    pub fn value(&self) -> Option<&T> {
        match self {
            Self::Succeeded(v) => Some(v),
            _ => None,
        }
    }

    /// Short reason for logs; empty on success.
    pub fn failure_reason(&self) -> String {
        match self {
            Self::Succeeded(_) => String::new(),
            Self::Failed(e) => format!("{:#}", e),
            Self::Panicked(msg) => format!("panicked: {}", msg),
            Self::TimedOut => "timed out".to_string(),
        }
    }
}

fn outcome_from_join<T>(joined: Result<anyhow::Result<T>, JoinError>) -> TaskOutcome<T> {
    match joined {
        Ok(Ok(value)) => TaskOutcome::Succeeded(value),
        Ok(Err(e)) => TaskOutcome::Failed(e),
        Err(e) if e.is_panic() => {
            let payload = e.into_panic();
            let msg = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic payload".to_string());
            TaskOutcome::Panicked(msg)
        }
        Err(e) => TaskOutcome::Failed(anyhow::anyhow!("task cancelled: {}", e)),
    }
}

/// Runs one call per argument on a bounded worker pool.
#[derive(Clone)]
pub struct Launcher {
    workers: usize,
    timeout: Option<Duration>,
    metrics: Arc<Metrics>,
    progress_interval_secs: Option<u64>,
}

impl Launcher {
    pub fn new(workers: usize, timeout: Option<Duration>, metrics: Arc<Metrics>) -> Self {
        Self {
            workers: workers.max(1),
            timeout,
            metrics,
            progress_interval_secs: None,
        }
    }

    /// Log progress every `interval_secs` while a launch is running.
    pub fn with_progress(mut self, interval_secs: u64) -> Self {
        self.progress_interval_secs = Some(interval_secs);
        self
    }

    /// Same launcher with a different worker count.
    pub fn with_workers(&self, workers: usize) -> Self {
        Self {
            workers: workers.max(1),
            ..self.clone()
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Run `call(arg, shared.clone())` for every argument.
    ///
    /// Returns exactly one outcome per argument, in argument order. The
    /// timeout of a task starts when a worker picks it up; on expiry the
    /// task is aborted and awaited before its outcome is recorded.
    pub async fn launch<A, S, T, F, Fut>(
        &self,
        call: F,
        args: Vec<A>,
        shared: S,
    ) -> Vec<TaskOutcome<T>>
    where
        A: Send + 'static,
        S: Clone + Send + Sync + 'static,
        T: Send + 'static,
        F: Fn(A, S) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        let total = args.len();
        if total == 0 {
            return Vec::new();
        }
        self.metrics.add_dispatched(total as u64);

        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);
        let reporter_handle = match self.progress_interval_secs {
            Some(interval) => {
                let reporter = MetricsReporter::new(self.metrics.clone(), interval, total as u64);
                Some(tokio::spawn(reporter.run(shutdown_rx)))
            }
            None => {
                drop(shutdown_rx);
                None
            }
        };

        // Create a shared work queue
        let (work_tx, work_rx) = async_channel::bounded::<(usize, A)>(total);
        for item in args.into_iter().enumerate() {
            let _ = work_tx.send(item).await;
        }
        work_tx.close();

        let (result_tx, mut result_rx) = mpsc::unbounded_channel::<(usize, TaskOutcome<T>)>();
        let call = Arc::new(call);

        let mut handles = Vec::with_capacity(self.workers);
        for _ in 0..self.workers.min(total) {
            let work_rx = work_rx.clone();
            let result_tx = result_tx.clone();
            let call = call.clone();
            let shared = shared.clone();
            let metrics = self.metrics.clone();
            let timeout = self.timeout;

            handles.push(tokio::spawn(async move {
                while let Ok((idx, arg)) = work_rx.recv().await {
                    let call = call.clone();
                    let shared = shared.clone();
                    let mut task = tokio::spawn(async move { call(arg, shared).await });

                    let outcome = match timeout {
                        Some(limit) => match tokio::time::timeout(limit, &mut task).await {
                            Ok(joined) => outcome_from_join(joined),
                            Err(_) => {
                                task.abort();
                                let _ = task.await;
                                TaskOutcome::TimedOut
                            }
                        },
                        None => outcome_from_join(task.await),
                    };

                    metrics.add_finished();
                    if let TaskOutcome::Panicked(msg) = &outcome {
                        tracing::error!("Task {} panicked: {}", idx, msg);
                    }
                    if result_tx.send((idx, outcome)).is_err() {
                        tracing::debug!("Result receiver dropped, stopping worker");
                        break;
                    }
                }
            }));
        }
        drop(result_tx);

        // Wait for all workers to complete
        for handle in handles {
            let _ = handle.await;
        }

        let mut slots: Vec<Option<TaskOutcome<T>>> = (0..total).map(|_| None).collect();
        while let Ok((idx, outcome)) = result_rx.try_recv() {
            slots[idx] = Some(outcome);
        }

        let _ = shutdown_tx.send(()).await;
        if let Some(handle) = reporter_handle {
            let _ = handle.await;
        }

        slots
            .into_iter()
            .map(|slot| {
                slot.unwrap_or_else(|| {
                    TaskOutcome::Failed(anyhow::anyhow!("worker exited before reporting"))
                })
            })
            .collect()
    }
}
