//! Typed errors that callers need to tell apart.
//!
//! Most fallible paths in the crate return `anyhow::Result`. The two enums here
//! exist because the controller and the CLI branch on them: run-fatal
//! conditions end the process with a dedicated exit code, and GPU bookkeeping
//! faults abort the run instead of being absorbed as a unit failure.

use std::path::PathBuf;

use crate::resource::AllocationId;

/// Exit code used by the CLI when a run-fatal condition stops the pipeline.
pub const RUN_FATAL_EXIT_CODE: u8 = 2;

/// Conditions that stop a run before (or between) stages.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("the ROI is not seen in two images or is totally masked")]
    NoUsableTiles,

    #[error(
        "start_from set to {start_from} but no tile manifest was found at '{}'; \
         make sure this is the output directory of a previous run",
        path.display()
    )]
    MissingManifest { start_from: u8, path: PathBuf },

    #[error("tile manifest at '{}' is empty", path.display())]
    EmptyManifest { path: PathBuf },

    #[error("invalid stage range: start_from={start_from}, stop_after={stop_after}")]
    InvalidStageRange { start_from: u8, stop_after: u8 },

    #[error("stage index {0} is out of range (0-7)")]
    UnknownStage(u8),

    #[error("resource fault during {stage}: {source}")]
    ResourceFault {
        stage: &'static str,
        #[source]
        source: GpuMemoryError,
    },
}

impl PipelineError {
    /// Whether this error should end the process with [`RUN_FATAL_EXIT_CODE`].
    pub fn is_run_fatal(&self) -> bool {
        !matches!(self, Self::ResourceFault { .. })
    }
}

/// Errors raised by the GPU memory manager.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GpuMemoryError {
    #[error("requested {requested_mib} MiB but the whole GPU budget is {budget_mib} MiB")]
    ExceedsBudget { requested_mib: u32, budget_mib: u32 },

    #[error("GPU budget of {total_mib} MiB cannot hold {workers} worker contexts of {reserve_mib} MiB")]
    BudgetExhausted {
        total_mib: u64,
        workers: usize,
        reserve_mib: u64,
    },

    #[error("GPU allocation {0} released twice")]
    DoubleRelease(AllocationId),

    #[error("GPU allocation {0} is not held by this manager")]
    NotHeld(AllocationId),

    #[error("GPU ledger corrupted: {in_use_mib} MiB in use exceeds budget of {budget_mib} MiB")]
    BookkeepingCorrupted { in_use_mib: u64, budget_mib: u32 },

    #[error("GPU memory manager closed")]
    Closed,
}

impl GpuMemoryError {
    /// Programming faults that must abort the run rather than fail one unit.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::DoubleRelease(_) | Self::NotHeld(_) | Self::BookkeepingCorrupted { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(GpuMemoryError::DoubleRelease(AllocationId(3)).is_fatal());
        assert!(GpuMemoryError::NotHeld(AllocationId(3)).is_fatal());
        assert!(!GpuMemoryError::ExceedsBudget {
            requested_mib: 10,
            budget_mib: 5
        }
        .is_fatal());
    }

    #[test]
    fn test_run_fatal_message() {
        let err = PipelineError::NoUsableTiles;
        assert!(err.is_run_fatal());
        assert!(err.to_string().contains("totally masked"));

        let fault = PipelineError::ResourceFault {
            stage: "stereo matching",
            source: GpuMemoryError::DoubleRelease(AllocationId(1)),
        };
        assert!(!fault.is_run_fatal());
    }
}
