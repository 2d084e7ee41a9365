//! Shared resource handles threaded into worker tasks.

mod gpu_memory;

pub use gpu_memory::{
    AllocationId, GpuAllocation, GpuMemoryManager, GPU_CONTEXT_RESERVE_MIB,
};
