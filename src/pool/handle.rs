use std::time::{Duration, Instant};

use crate::backend::SharedClient;

/// One live client instance tracked by the pool. A handle sits in its
/// backend's idle queue or is held by exactly one lease, never both.
pub struct PooledHandle {
    pub client: SharedClient,
    pub created_at: Instant,
    pub last_used: Instant,
    pub last_health_check: Option<Instant>,
    pub use_count: u64,
    pub consecutive_failures: u32,
    pub health_passes: u32,
    pub health_failures: u32,
    pub healthy: bool,
}

impl PooledHandle {
    pub fn new(client: SharedClient) -> Self {
        let now = Instant::now();
        Self {
            client,
            created_at: now,
            last_used: now,
            last_health_check: None,
            use_count: 0,
            consecutive_failures: 0,
            health_passes: 0,
            health_failures: 0,
            healthy: true,
        }
    }

    pub fn touch(&mut self) {
        self.last_used = Instant::now();
        self.use_count += 1;
    }

    pub fn idle_for(&self) -> Duration {
        self.last_used.elapsed()
    }

    pub fn record_call_success(&mut self) {
        self.consecutive_failures = 0;
    }

    pub fn record_call_failure(&mut self) {
        self.consecutive_failures += 1;
    }

    pub fn record_health_result(&mut self, passed: bool) {
        self.last_health_check = Some(Instant::now());
        self.healthy = passed;
        if passed {
            self.health_passes += 1;
        } else {
            self.health_failures += 1;
        }
    }

    /// Fraction of health probes passed; unprobed handles rank as healthy.
    pub fn health_success_rate(&self) -> f64 {
        let total = self.health_passes + self.health_failures;
        if total == 0 {
            1.0
        } else {
            f64::from(self.health_passes) / f64::from(total)
        }
    }

    /// A stale handle is discarded on release instead of re-queued.
    pub fn is_stale(&self, max_consecutive_failures: u32) -> bool {
        !self.healthy || self.consecutive_failures >= max_consecutive_failures
    }
}
