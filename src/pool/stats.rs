use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionReason {
    Idle,
    Unhealthy,
    Failures,
    Shutdown,
}

/// Lock-free per-backend counters, updated on the acquire/release path.
#[derive(Debug, Default)]
pub struct SlotCounters {
    pub acquisitions: AtomicU64,
    pub creations: AtomicU64,
    pub creation_failures: AtomicU64,
    pub call_failures: AtomicU64,
    pub acquire_wait_micros: AtomicU64,
    pub in_use: AtomicUsize,
    pub peak_in_use: AtomicUsize,
    pub evicted_idle: AtomicU64,
    pub evicted_unhealthy: AtomicU64,
    pub evicted_failures: AtomicU64,
    pub evicted_shutdown: AtomicU64,
}

impl SlotCounters {
    pub fn record_acquisition(&self, wait_micros: u64) {
        self.acquisitions.fetch_add(1, Ordering::Relaxed);
        self.acquire_wait_micros
            .fetch_add(wait_micros, Ordering::Relaxed);

        let in_use = self.in_use.fetch_add(1, Ordering::AcqRel) + 1;
        self.peak_in_use.fetch_max(in_use, Ordering::AcqRel);
    }

    pub fn record_release(&self) {
        self.in_use.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn record_eviction(&self, reason: EvictionReason) {
        let counter = match reason {
            EvictionReason::Idle => &self.evicted_idle,
            EvictionReason::Unhealthy => &self.evicted_unhealthy,
            EvictionReason::Failures => &self.evicted_failures,
            EvictionReason::Shutdown => &self.evicted_shutdown,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn total_evictions(&self) -> u64 {
        self.evicted_idle.load(Ordering::Relaxed)
            + self.evicted_unhealthy.load(Ordering::Relaxed)
            + self.evicted_failures.load(Ordering::Relaxed)
            + self.evicted_shutdown.load(Ordering::Relaxed)
    }
}

/// Point-in-time view of one backend's pool state.
#[derive(Debug, Clone, Serialize)]
pub struct BackendPoolStats {
    pub backend: String,
    pub total: usize,
    pub available: usize,
    pub in_use: usize,
    pub concurrency_limit: usize,
    pub acquisitions: u64,
    pub creations: u64,
    pub creation_failures: u64,
    pub call_failures: u64,
    pub avg_acquire_wait_ms: f64,
    pub peak_in_use: usize,
    pub evicted_idle: u64,
    pub evicted_unhealthy: u64,
    pub evicted_failures: u64,
    pub evicted_shutdown: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct GlobalPoolStats {
    pub backends: usize,
    pub total_handles: usize,
    pub total_in_use: usize,
    pub total_acquisitions: u64,
    pub total_creations: u64,
    pub total_evictions: u64,
}

impl GlobalPoolStats {
    pub fn aggregate(per_backend: &[BackendPoolStats]) -> Self {
        Self {
            backends: per_backend.len(),
            total_handles: per_backend.iter().map(|s| s.total).sum(),
            total_in_use: per_backend.iter().map(|s| s.in_use).sum(),
            total_acquisitions: per_backend.iter().map(|s| s.acquisitions).sum(),
            total_creations: per_backend.iter().map(|s| s.creations).sum(),
            total_evictions: per_backend
                .iter()
                .map(|s| {
                    s.evicted_idle + s.evicted_unhealthy + s.evicted_failures + s.evicted_shutdown
                })
                .sum(),
        }
    }
}
