//! Memory budget tracking for bounded tile memory
//!
//! A single [`MemoryBudget`] caps the bytes held by decoded tile buffers
//! across every page that shares it. Reservations are atomic, so a budget can
//! be shared by several caches without a common lock.
//!
//! Buffers the cache does not own (a page's full decode) are charged through
//! a [`Reservation`], which hands its bytes back when dropped.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Memory pressure level derived from budget utilization
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MemoryPressure {
    /// Below 50% utilization
    Low,
    /// 50-75% utilization
    Moderate,
    /// 75-90% utilization
    High,
    /// Above 90% utilization
    Critical,
}

impl MemoryPressure {
    /// Pressure level for a utilization ratio (0.0 to 1.0)
    pub fn from_utilization(utilization: f64) -> Self {
        if utilization < 0.5 {
            MemoryPressure::Low
        } else if utilization < 0.75 {
            MemoryPressure::Moderate
        } else if utilization < 0.90 {
            MemoryPressure::High
        } else {
            MemoryPressure::Critical
        }
    }

    /// True for High and Critical
    pub fn needs_eviction(&self) -> bool {
        matches!(self, MemoryPressure::High | MemoryPressure::Critical)
    }
}

/// Process-wide ceiling on resident tile bytes
///
/// # Example
///
/// ```
/// use pagetile_cache::MemoryBudget;
///
/// let budget = MemoryBudget::with_limit_mb(64);
///
/// let tile = 1024 * 1024 * 4;
/// assert!(budget.try_reserve(tile));
/// assert_eq!(budget.current_usage(), tile);
///
/// budget.release(tile);
/// assert_eq!(budget.current_usage(), 0);
/// ```
#[derive(Debug)]
pub struct MemoryBudget {
    ceiling: AtomicUsize,
    current_usage: AtomicUsize,
    peak_usage: AtomicUsize,
}

impl MemoryBudget {
    pub fn new(ceiling_bytes: usize) -> Self {
        Self {
            ceiling: AtomicUsize::new(ceiling_bytes),
            current_usage: AtomicUsize::new(0),
            peak_usage: AtomicUsize::new(0),
        }
    }

    pub fn with_limit_mb(limit_mb: usize) -> Self {
        Self::new(limit_mb.saturating_mul(1024 * 1024))
    }

    pub fn ceiling(&self) -> usize {
        self.ceiling.load(Ordering::Relaxed)
    }

    /// Change the ceiling. Existing reservations are kept even if they now
    /// exceed it; later reservations fail until enough is released.
    pub fn set_ceiling(&self, ceiling_bytes: usize) {
        self.ceiling.store(ceiling_bytes, Ordering::Relaxed);
    }

    pub fn current_usage(&self) -> usize {
        self.current_usage.load(Ordering::Acquire)
    }

    /// Highest usage ever reserved
    pub fn peak_usage(&self) -> usize {
        self.peak_usage.load(Ordering::Relaxed)
    }

    pub fn available(&self) -> usize {
        self.ceiling().saturating_sub(self.current_usage())
    }

    /// Current utilization ratio (0.0 to 1.0, may exceed 1.0 after a shrink)
    pub fn utilization(&self) -> f64 {
        let ceiling = self.ceiling();
        if ceiling == 0 {
            0.0
        } else {
            self.current_usage() as f64 / ceiling as f64
        }
    }

    pub fn pressure(&self) -> MemoryPressure {
        MemoryPressure::from_utilization(self.utilization())
    }

    /// True if `bytes` would fit right now
    pub fn can_allocate(&self, bytes: usize) -> bool {
        self.current_usage().saturating_add(bytes) <= self.ceiling()
    }

    /// Reserve `bytes` if they fit under the ceiling
    pub fn try_reserve(&self, bytes: usize) -> bool {
        let ceiling = self.ceiling();
        let reserved = self
            .current_usage
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                let next = current.checked_add(bytes)?;
                (next <= ceiling).then_some(next)
            });

        match reserved {
            Ok(previous) => {
                self.peak_usage.fetch_max(previous + bytes, Ordering::Relaxed);
                true
            }
            Err(_) => false,
        }
    }

    /// Return `bytes` to the budget. Saturates at zero.
    pub fn release(&self, bytes: usize) {
        self.current_usage
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                Some(current.saturating_sub(bytes))
            })
            .ok();
    }

    /// Reserve `bytes` for as long as the returned guard lives
    pub fn try_reserve_owned(self: &Arc<Self>, bytes: usize) -> Option<Reservation> {
        self.try_reserve(bytes).then(|| Reservation {
            budget: Arc::clone(self),
            bytes,
        })
    }
}

/// Bytes held against a [`MemoryBudget`], released on drop
#[derive(Debug)]
pub struct Reservation {
    budget: Arc<MemoryBudget>,
    bytes: usize,
}

impl Reservation {
    pub fn bytes(&self) -> usize {
        self.bytes
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        self.budget.release(self.bytes);
    }
}

impl Default for MemoryBudget {
    /// 512 MiB
    fn default() -> Self {
        Self::with_limit_mb(512)
    }
}
