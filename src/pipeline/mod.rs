//! Stage orchestration: task launcher, live set, stage functions and the
//! controller that runs them in order.

pub mod aggregate;
mod controller;
mod launcher;
mod live_set;
mod metrics;
pub mod stages;

#[cfg(test)]
mod controller_scenario_tests;

pub use controller::{Pipeline, RunSummary, Stage, StageReport};
pub use launcher::{Launcher, TaskOutcome};
pub use live_set::{LiveSet, LiveSetJournal, UnitKey, WorkUnit};
pub use metrics::{Metrics, MetricsReporter, MetricsSnapshot};
pub use stages::{StageContext, StageOutcome};
