//! GPU memory budget shared by the stereo matching workers.
//!
//! The manager is a cheap [`Clone`] handle. Capacity waiting goes through a
//! fair Tokio semaphore (one permit per MiB), so a large request that is
//! already queued is served before smaller requests that arrive after it.
//! The outstanding-allocation ledger lives behind a mutex and is checked on
//! every grant and every release.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::GpuMemoryError;

/// GPU memory reserved per worker for the runtime context, in MiB.
pub const GPU_CONTEXT_RESERVE_MIB: u64 = 120;

/// Identifier of one grant, unique within a manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AllocationId(pub u64);

impl std::fmt::Display for AllocationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug)]
enum Mode {
    Unbounded,
    Bounded {
        budget_mib: u32,
        capacity: Arc<Semaphore>,
    },
}

#[derive(Debug, Default)]
struct Ledger {
    outstanding: HashMap<AllocationId, u32>,
    in_use_mib: u64,
    peak_mib: u64,
}

#[derive(Debug)]
struct Inner {
    mode: Mode,
    ledger: Mutex<Ledger>,
    next_id: AtomicU64,
}

impl Inner {
    fn ledger(&self) -> MutexGuard<'_, Ledger> {
        // A poisoned ledger is still consistent: every mutation is a single
        // insert/remove paired with an arithmetic update.
        self.ledger.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn record_grant(&self, id: AllocationId, size_mib: u32) -> Result<(), GpuMemoryError> {
        let Mode::Bounded { budget_mib, .. } = self.mode else {
            return Ok(());
        };

        let mut ledger = self.ledger();
        ledger.outstanding.insert(id, size_mib);
        ledger.in_use_mib += u64::from(size_mib);
        ledger.peak_mib = ledger.peak_mib.max(ledger.in_use_mib);

        if ledger.in_use_mib > u64::from(budget_mib) {
            return Err(GpuMemoryError::BookkeepingCorrupted {
                in_use_mib: ledger.in_use_mib,
                budget_mib,
            });
        }
        Ok(())
    }

    fn record_release(&self, id: AllocationId) -> Result<(), GpuMemoryError> {
        if matches!(self.mode, Mode::Unbounded) {
            return Ok(());
        }

        let mut ledger = self.ledger();
        let size = ledger
            .outstanding
            .remove(&id)
            .ok_or(GpuMemoryError::NotHeld(id))?;
        ledger.in_use_mib = ledger.in_use_mib.saturating_sub(u64::from(size));
        Ok(())
    }
}

/// Bounded (or passthrough) GPU memory allocator.
#[derive(Debug, Clone)]
pub struct GpuMemoryManager {
    inner: Arc<Inner>,
}

impl GpuMemoryManager {
    fn with_mode(mode: Mode) -> Self {
        Self {
            inner: Arc::new(Inner {
                mode,
                ledger: Mutex::new(Ledger::default()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// A manager that grants every request immediately and tracks nothing.
    pub fn unbounded() -> Self {
        Self::with_mode(Mode::Unbounded)
    }

    /// A manager with an explicit budget in MiB.
    pub fn bounded(budget_mib: u32) -> Self {
        Self::with_mode(Mode::Bounded {
            budget_mib,
            capacity: Arc::new(Semaphore::new(budget_mib as usize)),
        })
    }

    /// Budget derived from the device total minus one context reservation
    /// per concurrent worker.
    pub fn make_bounded(total_mib: u64, workers: usize) -> Result<Self, GpuMemoryError> {
        let reserve = GPU_CONTEXT_RESERVE_MIB * workers as u64;
        if total_mib <= reserve {
            return Err(GpuMemoryError::BudgetExhausted {
                total_mib,
                workers,
                reserve_mib: GPU_CONTEXT_RESERVE_MIB,
            });
        }
        let budget = (total_mib - reserve).min(u64::from(u32::MAX)) as u32;
        Ok(Self::bounded(budget))
    }

    /// Build the manager for a run: bounded when a device total is configured.
    pub fn from_total(total_mib: Option<u64>, workers: usize) -> Result<Self, GpuMemoryError> {
        match total_mib {
            Some(total) => Self::make_bounded(total, workers),
            None => Ok(Self::unbounded()),
        }
    }

    /// Wait until `size_mib` fits in the budget and reserve it.
    pub async fn request(&self, size_mib: u32) -> Result<GpuAllocation, GpuMemoryError> {
        let id = AllocationId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));

        let permit = match &self.inner.mode {
            Mode::Unbounded => None,
            Mode::Bounded {
                budget_mib,
                capacity,
            } => {
                if size_mib > *budget_mib {
                    return Err(GpuMemoryError::ExceedsBudget {
                        requested_mib: size_mib,
                        budget_mib: *budget_mib,
                    });
                }
                let permit = capacity
                    .clone()
                    .acquire_many_owned(size_mib)
                    .await
                    .map_err(|_| GpuMemoryError::Closed)?;
                Some(permit)
            }
        };

        let mut allocation = GpuAllocation {
            id,
            size_mib,
            owner: self.inner.clone(),
            permit,
            released: true,
        };
        self.inner.record_grant(id, size_mib)?;
        allocation.released = false;

        tracing::debug!("GPU allocation {} granted ({} MiB)", id, size_mib);
        Ok(allocation)
    }

    /// Release an allocation through this manager.
    ///
    /// Fails with [`GpuMemoryError::NotHeld`] when the allocation was granted
    /// by a different manager.
    pub fn release(&self, allocation: &mut GpuAllocation) -> Result<(), GpuMemoryError> {
        if !Arc::ptr_eq(&self.inner, &allocation.owner) {
            return Err(GpuMemoryError::NotHeld(allocation.id));
        }
        allocation.release()
    }

    pub fn is_bounded(&self) -> bool {
        matches!(self.inner.mode, Mode::Bounded { .. })
    }

    pub fn budget_mib(&self) -> Option<u32> {
        match self.inner.mode {
            Mode::Unbounded => None,
            Mode::Bounded { budget_mib, .. } => Some(budget_mib),
        }
    }

    /// MiB currently held by outstanding allocations (0 when unbounded).
    pub fn in_use_mib(&self) -> u64 {
        self.inner.ledger().in_use_mib
    }

    /// Highest concurrent usage observed (0 when unbounded).
    pub fn peak_mib(&self) -> u64 {
        self.inner.ledger().peak_mib
    }

    pub fn outstanding(&self) -> usize {
        self.inner.ledger().outstanding.len()
    }
}

/// Memory held by one task for one GPU step.
///
/// Dropping an unreleased allocation returns its memory, so failed,
/// panicked and aborted tasks never leak budget.
#[derive(Debug)]
pub struct GpuAllocation {
    id: AllocationId,
    size_mib: u32,
    owner: Arc<Inner>,
    permit: Option<OwnedSemaphorePermit>,
    released: bool,
}

impl GpuAllocation {
    pub fn id(&self) -> AllocationId {
        self.id
    }

    pub fn size_mib(&self) -> u32 {
        self.size_mib
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    /// Return the memory to the budget. A second call is an error.
    pub fn release(&mut self) -> Result<(), GpuMemoryError> {
        if self.released {
            tracing::error!("GPU allocation {} released twice", self.id);
            return Err(GpuMemoryError::DoubleRelease(self.id));
        }
        self.released = true;

        // Ledger first, then capacity: a waiter woken by the permit must
        // never observe the old usage.
        let result = self.owner.record_release(self.id);
        self.permit.take();

        tracing::debug!("GPU allocation {} released ({} MiB)", self.id, self.size_mib);
        result
    }
}

impl Drop for GpuAllocation {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = self.release() {
            tracing::error!("Failed to release dropped GPU allocation: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_unbounded_grants_immediately() {
        let manager = GpuMemoryManager::unbounded();
        let mut allocation = manager.request(u32::MAX).await.unwrap();

        assert!(!manager.is_bounded());
        assert_eq!(manager.in_use_mib(), 0);
        allocation.release().unwrap();
    }

    #[test]
    fn test_make_bounded_reserves_context_per_worker() {
        let manager = GpuMemoryManager::make_bounded(1000, 4).unwrap();
        assert_eq!(manager.budget_mib(), Some(520));

        let err = GpuMemoryManager::make_bounded(480, 4).unwrap_err();
        assert!(matches!(err, GpuMemoryError::BudgetExhausted { .. }));
    }

    #[tokio::test]
    async fn test_request_larger_than_budget_fails() {
        let manager = GpuMemoryManager::bounded(100);
        let err = manager.request(101).await.unwrap_err();

        assert_eq!(
            err,
            GpuMemoryError::ExceedsBudget {
                requested_mib: 101,
                budget_mib: 100
            }
        );
        assert_eq!(manager.in_use_mib(), 0);
    }

    #[tokio::test]
    async fn test_request_equal_to_budget_waits_for_release() {
        let manager = GpuMemoryManager::bounded(100);
        let mut held = manager.request(30).await.unwrap();

        let waiting = manager.clone();
        let full = tokio::spawn(async move { waiting.request(100).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!full.is_finished());

        held.release().unwrap();
        let mut full = tokio::time::timeout(Duration::from_secs(1), full)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(manager.in_use_mib(), 100);
        full.release().unwrap();
    }

    #[tokio::test]
    async fn test_double_release_rejected() {
        let manager = GpuMemoryManager::bounded(100);
        let mut allocation = manager.request(40).await.unwrap();

        allocation.release().unwrap();
        assert_eq!(manager.in_use_mib(), 0);

        let err = allocation.release().unwrap_err();
        assert_eq!(err, GpuMemoryError::DoubleRelease(allocation.id()));
        assert!(err.is_fatal());
        assert_eq!(manager.in_use_mib(), 0);
    }

    #[tokio::test]
    async fn test_release_through_foreign_manager_rejected() {
        let manager = GpuMemoryManager::bounded(100);
        let other = GpuMemoryManager::bounded(100);
        let mut allocation = manager.request(10).await.unwrap();

        let err = other.release(&mut allocation).unwrap_err();
        assert!(matches!(err, GpuMemoryError::NotHeld(_)));
        assert_eq!(manager.in_use_mib(), 10);

        manager.release(&mut allocation).unwrap();
        assert_eq!(manager.in_use_mib(), 0);
    }

    #[tokio::test]
    async fn test_drop_returns_memory() {
        let manager = GpuMemoryManager::bounded(50);
        {
            let _allocation = manager.request(50).await.unwrap();
            assert_eq!(manager.in_use_mib(), 50);
        }
        assert_eq!(manager.in_use_mib(), 0);
        assert_eq!(manager.outstanding(), 0);

        let again = tokio::time::timeout(Duration::from_secs(1), manager.request(50)).await;
        assert!(again.is_ok());
    }

    #[tokio::test]
    async fn test_aborted_task_returns_memory() {
        let manager = GpuMemoryManager::bounded(64);

        let held = manager.clone();
        let handle = tokio::spawn(async move {
            let _allocation = held.request(64).await.unwrap();
            tokio::time::sleep(Duration::from_secs(3600)).await;
        });

        while manager.in_use_mib() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        handle.abort();
        let _ = handle.await;

        assert_eq!(manager.in_use_mib(), 0);
        let next = tokio::time::timeout(Duration::from_secs(1), manager.request(64)).await;
        assert!(next.is_ok());
    }

    #[tokio::test]
    async fn test_queued_large_request_not_overtaken() {
        let manager = GpuMemoryManager::bounded(10);
        let mut first = manager.request(6).await.unwrap();

        let big_manager = manager.clone();
        let big = tokio::spawn(async move { big_manager.request(10).await });
        tokio::time::sleep(Duration::from_millis(20)).await;

        // 4 MiB are nominally free, but the queued 10 MiB request comes first.
        let small = tokio::time::timeout(Duration::from_millis(50), manager.request(2)).await;
        assert!(small.is_err());

        first.release().unwrap();
        let mut big = big.await.unwrap().unwrap();
        assert_eq!(manager.in_use_mib(), 10);

        big.release().unwrap();
        let small = tokio::time::timeout(Duration::from_secs(1), manager.request(2)).await;
        assert!(small.is_ok());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_budget_never_exceeded_under_contention() {
        let manager = GpuMemoryManager::bounded(16);
        let mut handles = Vec::new();

        for i in 0..48u32 {
            let manager = manager.clone();
            handles.push(tokio::spawn(async move {
                let size = i % 7 + 1;
                let mut allocation = manager.request(size).await.unwrap();
                let observed = manager.in_use_mib();
                tokio::time::sleep(Duration::from_millis(u64::from(i % 3))).await;
                allocation.release().unwrap();
                observed
            }));
        }

        for handle in handles {
            let observed = handle.await.unwrap();
            assert!(observed <= 16);
        }
        assert!(manager.peak_mib() <= 16);
        assert!(manager.peak_mib() > 0);
        assert_eq!(manager.in_use_mib(), 0);
        assert_eq!(manager.outstanding(), 0);
    }
}
