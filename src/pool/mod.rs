pub mod handle;
pub mod stats;

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::Retry;
use tracing::{debug, info, warn};

use crate::backend::registry::SettingsOverride;
use crate::backend::{BackendDescriptor, BackendRegistry, SharedClient};
use crate::error::{Error, Result};
use crate::resilience::CircuitBreaker;

pub use handle::PooledHandle;
pub use stats::{BackendPoolStats, EvictionReason, GlobalPoolStats, SlotCounters};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Longest a caller blocks waiting for a free slot.
    pub max_wait: Duration,
    pub idle_timeout: Duration,
    /// Handles kept warm per backend; also the warm-up target on first use.
    pub min_idle: usize,
    pub health_check_interval: Duration,
    pub health_check_timeout: Duration,
    pub cleanup_interval: Duration,
    /// Idle-handle unhealthy fraction past which the worst half is evicted.
    pub unhealthy_ratio: f64,
    pub max_consecutive_failures: u32,
    pub max_creation_retries: u32,
    pub creation_backoff_base: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_wait: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(300),
            min_idle: 1,
            health_check_interval: Duration::from_secs(30),
            health_check_timeout: Duration::from_secs(5),
            cleanup_interval: Duration::from_secs(60),
            unhealthy_ratio: 0.5,
            max_consecutive_failures: 3,
            max_creation_retries: 3,
            creation_backoff_base: Duration::from_millis(50),
        }
    }
}

struct SlotState {
    idle: VecDeque<PooledHandle>,
    /// Handles alive for this backend: idle + leased + borrowed by the
    /// health loop. Bounded by the concurrency limit.
    total: usize,
}

/// Per-backend pool state. The semaphore bounds concurrent leases; the
/// mutex guards the idle queue and is never held across an await.
struct BackendSlot {
    name: String,
    descriptor: BackendDescriptor,
    limit: usize,
    semaphore: Arc<Semaphore>,
    state: Mutex<SlotState>,
    counters: SlotCounters,
    warmed: AtomicBool,
}

impl BackendSlot {
    fn new(descriptor: BackendDescriptor) -> Self {
        let limit = descriptor.defaults.concurrency_limit.max(1);
        Self {
            name: descriptor.name.clone(),
            limit,
            semaphore: Arc::new(Semaphore::new(limit)),
            state: Mutex::new(SlotState {
                idle: VecDeque::new(),
                total: 0,
            }),
            counters: SlotCounters::default(),
            warmed: AtomicBool::new(false),
            descriptor,
        }
    }
}

/// Owns every live client handle, amortizes construction cost and bounds
/// per-backend concurrency. Acquisitions are circuit-checked; background
/// workers keep only healthy, non-stale handles in the idle queues.
pub struct ClientPool {
    registry: Arc<BackendRegistry>,
    breaker: Arc<CircuitBreaker>,
    config: PoolConfig,
    slots: RwLock<HashMap<String, Arc<BackendSlot>>>,
    closed: Arc<AtomicBool>,
    shutdown_tx: watch::Sender<bool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl ClientPool {
    pub fn new(
        registry: Arc<BackendRegistry>,
        breaker: Arc<CircuitBreaker>,
        config: PoolConfig,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            registry,
            breaker,
            config,
            slots: RwLock::new(HashMap::new()),
            closed: Arc::new(AtomicBool::new(false)),
            shutdown_tx,
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Spawns the supervised health-check and cleanup workers. They stop on
    /// the shutdown signal and are joined in `shutdown`.
    pub fn start(self: &Arc<Self>) {
        let pool = Arc::clone(self);
        let rx = self.shutdown_tx.subscribe();
        let health = tokio::spawn(async move { pool.health_loop(rx).await });

        let pool = Arc::clone(self);
        let rx = self.shutdown_tx.subscribe();
        let cleanup = tokio::spawn(async move { pool.cleanup_loop(rx).await });

        self.workers.lock().extend([health, cleanup]);
        info!("Client pool workers started");
    }

    /// Checks the circuit, then pops an idle handle, constructs a new one
    /// when under the limit, or waits up to `max_wait` for a release.
    pub async fn acquire(&self, model: &str) -> Result<ClientLease> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::PoolClosed);
        }

        let descriptor = self.registry.resolve(model)?;
        let name = descriptor.name.clone();

        if self.breaker.is_open(&name) {
            debug!(backend = %name, "Acquisition rejected, circuit open");
            return Err(Error::CircuitOpen { backend: name });
        }

        let slot = self.slot(&descriptor).await;
        let start = Instant::now();
        let deadline = start + self.config.max_wait;

        let permit = match timeout(
            self.config.max_wait,
            Arc::clone(&slot.semaphore).acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(Error::PoolClosed),
            Err(_) => {
                return Err(Error::AcquireTimeout {
                    backend: name,
                    waited_ms: start.elapsed().as_millis() as u64,
                })
            }
        };

        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::PoolClosed);
        }

        let handle = self.checkout(&slot, deadline).await?;
        slot.counters
            .record_acquisition(start.elapsed().as_micros() as u64);

        Ok(ClientLease {
            handle: Some(handle),
            slot,
            pool_closed: Arc::clone(&self.closed),
            max_consecutive_failures: self.config.max_consecutive_failures,
            _permit: permit,
        })
    }

    /// Pre-constructs warm handles for the named backends before the first
    /// caller can block on acquisition.
    pub async fn warm_up(&self, models: &[String]) {
        for model in models {
            match self.registry.resolve(model) {
                Ok(descriptor) => {
                    let _ = self.slot(&descriptor).await;
                }
                Err(e) => warn!(model = %model, "Cannot warm up: {}", e),
            }
        }
    }

    /// Stops workers, closes every tracked handle exactly once and rejects
    /// further acquisitions. Leased handles are closed on release.
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Shutting down client pool");
        let _ = self.shutdown_tx.send(true);

        let workers: Vec<_> = self.workers.lock().drain(..).collect();
        for worker in workers {
            let _ = worker.await;
        }

        let slots: Vec<_> = self.slots.read().values().cloned().collect();
        for slot in slots {
            slot.semaphore.close();
            let drained: Vec<PooledHandle> = {
                let mut state = slot.state.lock();
                let drained: Vec<_> = state.idle.drain(..).collect();
                state.total -= drained.len();
                drained
            };
            for handle in drained {
                slot.counters.record_eviction(EvictionReason::Shutdown);
                handle.client.close().await;
            }
        }
        info!("Client pool shut down");
    }

    pub fn stats(&self, backend: &str) -> Option<BackendPoolStats> {
        self.slots.read().get(backend).map(|slot| slot_stats(slot))
    }

    pub fn stats_all(&self) -> Vec<BackendPoolStats> {
        self.slots.read().values().map(|s| slot_stats(s)).collect()
    }

    pub fn global_stats(&self) -> GlobalPoolStats {
        GlobalPoolStats::aggregate(&self.stats_all())
    }

    async fn slot(&self, descriptor: &BackendDescriptor) -> Arc<BackendSlot> {
        let existing = self.slots.read().get(&descriptor.name).cloned();
        let slot = match existing {
            Some(slot) => slot,
            None => {
                // Coarse map lock, held only for the insert.
                let mut slots = self.slots.write();
                Arc::clone(
                    slots
                        .entry(descriptor.name.clone())
                        .or_insert_with(|| Arc::new(BackendSlot::new(descriptor.clone()))),
                )
            }
        };

        if !slot.warmed.swap(true, Ordering::SeqCst) {
            self.warm_slot(&slot).await;
        }
        slot
    }

    async fn warm_slot(&self, slot: &Arc<BackendSlot>) {
        let target = self.config.min_idle.min(slot.limit);
        for _ in 0..target {
            match self.construct_with_retry(slot).await {
                Ok(client) => {
                    let mut state = slot.state.lock();
                    state.idle.push_back(PooledHandle::new(client));
                    state.total += 1;
                }
                Err(e) => {
                    warn!(backend = %slot.name, "Warm-up construction failed: {}", e);
                    break;
                }
            }
        }
        let available = slot.state.lock().idle.len();
        debug!(backend = %slot.name, available, "Backend slot warmed");
    }

    async fn checkout(
        &self,
        slot: &Arc<BackendSlot>,
        deadline: Instant,
    ) -> Result<PooledHandle> {
        loop {
            let mut construct = false;
            {
                let mut state = slot.state.lock();
                while let Some(mut handle) = state.idle.pop_front() {
                    if handle.is_stale(self.config.max_consecutive_failures) {
                        state.total -= 1;
                        let reason = if handle.healthy {
                            EvictionReason::Failures
                        } else {
                            EvictionReason::Unhealthy
                        };
                        slot.counters.record_eviction(reason);
                        spawn_close(handle.client);
                        continue;
                    }
                    handle.touch();
                    return Ok(handle);
                }
                if state.total < slot.limit {
                    state.total += 1; // reserve before the await below
                    construct = true;
                }
            }

            if construct {
                return match self.construct_with_retry(slot).await {
                    Ok(client) => {
                        let mut handle = PooledHandle::new(client);
                        handle.touch();
                        Ok(handle)
                    }
                    Err(e) => {
                        slot.state.lock().total -= 1;
                        slot.counters
                            .creation_failures
                            .fetch_add(1, Ordering::Relaxed);
                        self.breaker.record_failure(&slot.name);
                        Err(e)
                    }
                };
            }

            // Every handle is briefly borrowed by the health loop; wait for
            // one to come back.
            if Instant::now() >= deadline {
                return Err(Error::AcquireTimeout {
                    backend: slot.name.clone(),
                    waited_ms: self.config.max_wait.as_millis() as u64,
                });
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    async fn construct_with_retry(&self, slot: &BackendSlot) -> Result<SharedClient> {
        let retries = self.config.max_creation_retries.saturating_sub(1) as usize;
        let strategy = ExponentialBackoff::from_millis(
            self.config.creation_backoff_base.as_millis().max(2) as u64,
        )
        .max_delay(Duration::from_secs(5))
        .map(jitter)
        .take(retries);

        let registry = Arc::clone(&self.registry);
        let descriptor = slot.descriptor.clone();
        let name = slot.name.clone();

        let client = Retry::spawn(strategy, move || {
            let registry = Arc::clone(&registry);
            let descriptor = descriptor.clone();
            async move { registry.construct(&descriptor, &SettingsOverride::default()) }
        })
        .await?;

        slot.counters.creations.fetch_add(1, Ordering::Relaxed);
        debug!(backend = %name, "Constructed new pooled client");
        Ok(client)
    }

    async fn health_loop(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.health_check_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.run_health_checks().await,
                _ = shutdown.changed() => {
                    debug!("Health loop stopping");
                    return;
                }
            }
        }
    }

    /// Probes idle handles only; in-use handles are never touched. Handles
    /// stay counted in `total` while borrowed so the concurrency accounting
    /// holds.
    async fn run_health_checks(&self) {
        let slots: Vec<_> = self.slots.read().values().cloned().collect();
        for slot in slots {
            let mut borrowed: Vec<PooledHandle> = {
                let mut state = slot.state.lock();
                state.idle.drain(..).collect()
            };

            let mut failures = 0;
            for handle in &mut borrowed {
                let passed = matches!(
                    timeout(self.config.health_check_timeout, handle.client.health_check())
                        .await,
                    Ok(Ok(true))
                );
                handle.record_health_result(passed);
                if !passed {
                    failures += 1;
                }
            }

            if failures > 0 {
                warn!(backend = %slot.name, failures, "Idle handles failed health probe");
            }

            let mut state = slot.state.lock();
            for handle in borrowed {
                state.idle.push_back(handle);
            }
        }
    }

    async fn cleanup_loop(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.cleanup_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.run_cleanup().await,
                _ = shutdown.changed() => {
                    debug!("Cleanup loop stopping");
                    return;
                }
            }
        }
    }

    /// Evicts idle-timed-out handles down to `min_idle`, and when the
    /// unhealthy fraction of a backend's idle handles exceeds the configured
    /// ratio, force-evicts the worst half ranked by probe success rate.
    async fn run_cleanup(&self) {
        let slots: Vec<_> = self.slots.read().values().cloned().collect();
        for slot in slots {
            let mut to_close: Vec<PooledHandle> = Vec::new();
            {
                let mut state = slot.state.lock();

                let mut kept = VecDeque::with_capacity(state.idle.len());
                while let Some(handle) = state.idle.pop_front() {
                    if state.total > self.config.min_idle
                        && handle.idle_for() >= self.config.idle_timeout
                    {
                        state.total -= 1;
                        slot.counters.record_eviction(EvictionReason::Idle);
                        to_close.push(handle);
                    } else {
                        kept.push_back(handle);
                    }
                }
                state.idle = kept;

                let idle_count = state.idle.len();
                if idle_count > 0 {
                    let unhealthy =
                        state.idle.iter().filter(|h| !h.healthy).count();
                    let ratio = unhealthy as f64 / idle_count as f64;
                    if ratio > self.config.unhealthy_ratio {
                        warn!(
                            backend = %slot.name,
                            unhealthy,
                            idle_count,
                            "Unhealthy ratio exceeded, evicting worst half"
                        );
                        let mut handles: Vec<PooledHandle> =
                            state.idle.drain(..).collect();
                        handles.sort_by(|a, b| {
                            a.health_success_rate()
                                .partial_cmp(&b.health_success_rate())
                                .unwrap_or(std::cmp::Ordering::Equal)
                        });
                        let evict_count = handles.len().div_ceil(2);
                        for handle in handles.drain(..evict_count) {
                            state.total -= 1;
                            slot.counters.record_eviction(EvictionReason::Unhealthy);
                            to_close.push(handle);
                        }
                        state.idle = handles.into();
                    }
                }
            }
            for handle in to_close {
                handle.client.close().await;
            }
        }
    }
}

fn slot_stats(slot: &BackendSlot) -> BackendPoolStats {
    let (total, available) = {
        let state = slot.state.lock();
        (state.total, state.idle.len())
    };
    let acquisitions = slot.counters.acquisitions.load(Ordering::Relaxed);
    let wait_micros = slot.counters.acquire_wait_micros.load(Ordering::Relaxed);
    let avg_acquire_wait_ms = if acquisitions == 0 {
        0.0
    } else {
        wait_micros as f64 / acquisitions as f64 / 1000.0
    };

    BackendPoolStats {
        backend: slot.name.clone(),
        total,
        available,
        in_use: slot.counters.in_use.load(Ordering::Relaxed),
        concurrency_limit: slot.limit,
        acquisitions,
        creations: slot.counters.creations.load(Ordering::Relaxed),
        creation_failures: slot.counters.creation_failures.load(Ordering::Relaxed),
        call_failures: slot.counters.call_failures.load(Ordering::Relaxed),
        avg_acquire_wait_ms,
        peak_in_use: slot.counters.peak_in_use.load(Ordering::Relaxed),
        evicted_idle: slot.counters.evicted_idle.load(Ordering::Relaxed),
        evicted_unhealthy: slot.counters.evicted_unhealthy.load(Ordering::Relaxed),
        evicted_failures: slot.counters.evicted_failures.load(Ordering::Relaxed),
        evicted_shutdown: slot.counters.evicted_shutdown.load(Ordering::Relaxed),
    }
}

fn spawn_close(client: SharedClient) {
    if let Ok(runtime) = tokio::runtime::Handle::try_current() {
        runtime.spawn(async move { client.close().await });
    }
}

/// Scoped checkout of one pooled client. Releases on drop on every exit
/// path: healthy handles return to the idle queue, stale ones (or any handle
/// after pool shutdown) are closed and discarded.
pub struct ClientLease {
    handle: Option<PooledHandle>,
    slot: Arc<BackendSlot>,
    pool_closed: Arc<AtomicBool>,
    max_consecutive_failures: u32,
    _permit: OwnedSemaphorePermit,
}

impl ClientLease {
    pub fn client(&self) -> &SharedClient {
        // Present from construction until drop.
        &self
            .handle
            .as_ref()
            .expect("lease handle present until drop")
            .client
    }

    pub fn backend(&self) -> &str {
        &self.slot.name
    }

    pub fn record_success(&mut self) {
        if let Some(handle) = self.handle.as_mut() {
            handle.record_call_success();
        }
    }

    pub fn record_failure(&mut self) {
        self.slot.counters.call_failures.fetch_add(1, Ordering::Relaxed);
        if let Some(handle) = self.handle.as_mut() {
            handle.record_call_failure();
        }
    }
}

impl Drop for ClientLease {
    fn drop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        self.slot.counters.record_release();

        let shutting_down = self.pool_closed.load(Ordering::SeqCst);
        if shutting_down || handle.is_stale(self.max_consecutive_failures) {
            let reason = if shutting_down {
                EvictionReason::Shutdown
            } else if handle.healthy {
                EvictionReason::Failures
            } else {
                EvictionReason::Unhealthy
            };
            self.slot.state.lock().total -= 1;
            self.slot.counters.record_eviction(reason);
            debug!(backend = %self.slot.name, ?reason, "Discarding handle on release");
            spawn_close(handle.client);
        } else {
            self.slot.state.lock().idle.push_back(handle);
        }
    }
}
