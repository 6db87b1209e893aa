// src/runtime/pool.rs
//! Pool of bootstrapped, Ready instances for the synchronous path
//!
//! Bootstrapping an isolate costs tens of milliseconds, so synchronous
//! executions borrow a warm instance instead of building one per request.
//!
//! # Architecture
//!
//! ```text
//! RuntimePool
//! ├─ ready: ArrayQueue<PoolEntry>     idle instances
//! ├─ ready_count: Semaphore           one permit per queued instance
//! ├─ slots: [Option<Arc<HealthRecord>>]  arena scanned by HealthMonitor
//! └─ reaper task                      tears down + replaces recycled instances
//! ```
//!
//! Checkout takes a permit then pops; return pushes then adds a permit.
//! Recycling is drain-then-replace: a flagged instance is never handed out
//! again, it is torn down once back in the pool's hands and a fresh one is
//! bootstrapped in its place. The retired instance's unit of `live` passes
//! straight to its replacement, so a recycle never lets `live` dip.

use crate::runtime::health::{HealthRecord, HealthSource, RecycleReason};
use crate::runtime::instance::{Instance, InstanceKind, InstanceSpec};
use crate::utils::config::PoolSettings;
use crate::utils::errors::{EngineError, Result};
use crossbeam::queue::ArrayQueue;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Pool-level failure the host should act on
#[derive(Debug, Clone)]
pub enum PoolFault {
    /// A replacement could not be bootstrapped; live size may be below `min_size`
    ReplacementFailed { attempts: u32, error: String },
}

/// Pool counters at a point in time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolSnapshot {
    pub live: usize,
    pub idle: usize,
    pub leased: usize,
    pub min: usize,
    pub max: usize,
    /// Leases handed out since start
    pub checkouts: u64,
}

/// An instance plus its arena slot
struct PoolEntry {
    slot: usize,
    instance: Instance,
}

enum Retire {
    /// Replace with a fresh instance; the live reservation moves to it
    Replace,
    /// Shrink: the live count was already released
    Evict,
}

/// Live capacity backing a bootstrap
#[derive(Debug, Clone, Copy)]
enum Reservation {
    /// Handed over by a retired instance
    Held,
    /// Must be taken against `max_size` first
    Needed,
}

struct PoolInner {
    settings: PoolSettings,
    spec: InstanceSpec,
    ready: ArrayQueue<PoolEntry>,
    ready_count: Semaphore,
    live: AtomicUsize,
    leased: AtomicUsize,
    checkouts: AtomicU64,
    slots: Mutex<Vec<Option<Arc<HealthRecord>>>>,
    reaper: mpsc::UnboundedSender<(PoolEntry, Retire)>,
    faults: broadcast::Sender<PoolFault>,
    closed: AtomicBool,
    cancel: CancellationToken,
}

/// Bounded pool of pooled-kind instances (cheap to clone)
#[derive(Clone)]
pub struct RuntimePool {
    inner: Arc<PoolInner>,
}

/// Exclusive use of one instance; returns it to the pool on drop
pub struct InstanceLease {
    entry: Option<PoolEntry>,
    pool: Arc<PoolInner>,
    completed: bool,
}

impl std::fmt::Debug for InstanceLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceLease")
            .field("instance_id", &self.instance_id())
            .field("completed", &self.completed)
            .finish_non_exhaustive()
    }
}

impl InstanceLease {
    pub fn instance_id(&self) -> Option<u64> {
        self.entry.as_ref().map(|e| e.instance.id())
    }

    /// Run code on the leased instance
    pub async fn execute(&mut self, code: &str, input_json: String, budget: Duration) -> Result<Value> {
        let entry = self
            .entry
            .as_ref()
            .ok_or_else(|| EngineError::Internal("lease already released".into()))?;
        self.completed = false;
        let result = entry.instance.execute(code, input_json, budget).await;
        self.completed = true;
        result
    }
}

impl Drop for InstanceLease {
    fn drop(&mut self) {
        if let Some(entry) = self.entry.take() {
            if !self.completed {
                // dropped mid-execution: the isolate may still be running
                entry.instance.interrupt();
                entry.instance.health().mark_recycle(RecycleReason::Abandoned);
            }
            release(&self.pool, entry);
        }
    }
}

impl RuntimePool {
    /// Create the pool and fill it to `min_size`
    pub async fn start(settings: PoolSettings, spec: InstanceSpec) -> Result<Self> {
        if spec.kind != InstanceKind::Pooled {
            return Err(EngineError::Internal("runtime pool requires pooled instances".into()));
        }

        let (reaper_tx, reaper_rx) = mpsc::unbounded_channel();
        let (faults, _) = broadcast::channel(16);
        let inner = Arc::new(PoolInner {
            ready: ArrayQueue::new(settings.max_size.max(1)),
            ready_count: Semaphore::new(0),
            live: AtomicUsize::new(0),
            leased: AtomicUsize::new(0),
            checkouts: AtomicU64::new(0),
            slots: Mutex::new(Vec::with_capacity(settings.max_size)),
            reaper: reaper_tx,
            faults,
            closed: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            settings,
            spec,
        });

        tokio::spawn(reaper_loop(Arc::downgrade(&inner), reaper_rx, inner.cancel.clone()));

        let pool = Self { inner };
        info!(
            min = pool.inner.settings.min_size,
            max = pool.inner.settings.max_size,
            "starting runtime pool"
        );
        let spawned = pool.refill().await?;
        info!(instances = spawned, "runtime pool ready");
        Ok(pool)
    }

    /// Check out an instance, waiting up to `acquire_timeout`
    pub async fn acquire(&self) -> Result<InstanceLease> {
        let inner = &self.inner;
        if inner.closed.load(Ordering::Acquire) {
            return Err(EngineError::Internal("runtime pool is shut down".into()));
        }
        self.maybe_grow();

        let started = Instant::now();
        let deadline = inner.settings.acquire_timeout();
        loop {
            let remaining = deadline.saturating_sub(started.elapsed());
            let permit = match tokio::time::timeout(remaining, inner.ready_count.acquire()).await {
                Ok(Ok(permit)) => permit,
                Ok(Err(_)) => return Err(EngineError::Internal("runtime pool is shut down".into())),
                Err(_) => {
                    return Err(EngineError::PoolExhausted {
                        waited: started.elapsed(),
                    })
                }
            };
            permit.forget();

            let Some(entry) = inner.ready.pop() else {
                warn!("ready permit without a queued instance");
                continue;
            };
            if entry.instance.health().needs_recycle() {
                retire(inner, entry, Retire::Replace);
                continue;
            }

            inner.leased.fetch_add(1, Ordering::AcqRel);
            inner.checkouts.fetch_add(1, Ordering::Relaxed);
            debug!(instance = entry.instance.id(), "instance leased");
            return Ok(InstanceLease {
                entry: Some(entry),
                pool: inner.clone(),
                completed: true,
            });
        }
    }

    pub fn snapshot(&self) -> PoolSnapshot {
        let inner = &self.inner;
        PoolSnapshot {
            live: inner.live.load(Ordering::Acquire),
            idle: inner.ready.len(),
            leased: inner.leased.load(Ordering::Acquire),
            min: inner.settings.min_size,
            max: inner.settings.max_size,
            checkouts: inner.checkouts.load(Ordering::Relaxed),
        }
    }

    pub fn subscribe_faults(&self) -> broadcast::Receiver<PoolFault> {
        self.inner.faults.subscribe()
    }

    /// Spawn instances until `min_size` is reached; returns how many were added
    pub async fn refill(&self) -> Result<usize> {
        let inner = &self.inner;
        let missing = inner
            .settings
            .min_size
            .saturating_sub(inner.live.load(Ordering::Acquire));
        if missing == 0 {
            return Ok(0);
        }

        let results = futures::future::join_all(
            (0..missing).map(|_| spawn_with_retry(inner.clone(), Reservation::Needed)),
        )
        .await;
        let mut added = 0;
        for result in results {
            if result? {
                added += 1;
            }
        }
        Ok(added)
    }

    /// Tear down idle instances past `idle_timeout` while above `min_size`
    ///
    /// Idle instances already flagged for recycling are drained here too.
    /// Returns how many instances were evicted for idleness.
    pub fn evict_idle(&self) -> usize {
        let inner = &self.inner;
        let idle_timeout = inner.settings.idle_timeout();
        let mut evicted = 0;

        for _ in 0..inner.ready.len() {
            let Ok(permit) = inner.ready_count.try_acquire() else {
                break;
            };
            permit.forget();
            let Some(entry) = inner.ready.pop() else {
                inner.ready_count.add_permits(1);
                break;
            };

            if entry.instance.health().needs_recycle() {
                retire(inner, entry, Retire::Replace);
                continue;
            }
            if entry.instance.health().idle_for() > idle_timeout && try_shrink(inner) {
                debug!(instance = entry.instance.id(), "evicting idle instance");
                retire(inner, entry, Retire::Evict);
                evicted += 1;
                continue;
            }
            push_ready(inner, entry);
        }
        evicted
    }

    /// One maintenance pass: drain flagged and idle instances, then refill
    pub async fn maintain(&self) {
        let evicted = self.evict_idle();
        if evicted > 0 {
            info!(evicted, "evicted idle instances");
        }
        if let Err(e) = self.refill().await {
            warn!(error = %e, "pool refill failed");
        }
        metrics::gauge!("engine_pool_live").set(self.inner.live.load(Ordering::Acquire) as f64);
    }

    /// Refuse new leases and tear down every idle instance
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        if inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        inner.ready_count.close();
        inner.cancel.cancel();

        let mut torn_down = 0;
        while let Some(entry) = inner.ready.pop() {
            inner.live.fetch_sub(1, Ordering::AcqRel);
            free_slot(inner, entry.slot);
            entry.instance.teardown().await;
            torn_down += 1;
        }
        info!(torn_down, "runtime pool shut down");
    }

    fn maybe_grow(&self) {
        let inner = &self.inner;
        let live = inner.live.load(Ordering::Acquire);
        if live >= inner.settings.max_size {
            return;
        }
        let idle = inner.ready.len();
        let ratio = if live == 0 { 0.0 } else { idle as f64 / live as f64 };
        if ratio < inner.settings.growth_threshold || live == 0 {
            debug!(live, idle, "growing runtime pool");
            let inner = inner.clone();
            tokio::spawn(async move {
                if let Err(e) = spawn_with_retry(inner, Reservation::Needed).await {
                    warn!(error = %e, "pool growth failed");
                }
            });
        }
    }
}

impl HealthSource for RuntimePool {
    fn health_records(&self) -> Vec<Arc<HealthRecord>> {
        self.inner.slots.lock().iter().flatten().cloned().collect()
    }

    fn after_scan(&self) {
        let pool = self.clone();
        tokio::spawn(async move { pool.maintain().await });
    }
}

/// Reserve one unit of live capacity against `max_size`
fn try_reserve(inner: &PoolInner) -> bool {
    inner
        .live
        .fetch_update(Ordering::AcqRel, Ordering::Acquire, |live| {
            (live < inner.settings.max_size).then_some(live + 1)
        })
        .is_ok()
}

/// Release one unit of live capacity, never going below `min_size`
fn try_shrink(inner: &PoolInner) -> bool {
    inner
        .live
        .fetch_update(Ordering::AcqRel, Ordering::Acquire, |live| {
            (live > inner.settings.min_size).then_some(live - 1)
        })
        .is_ok()
}

fn claim_slot(inner: &PoolInner, record: Arc<HealthRecord>) -> usize {
    let mut slots = inner.slots.lock();
    match slots.iter().position(Option::is_none) {
        Some(index) => {
            slots[index] = Some(record);
            index
        }
        None => {
            slots.push(Some(record));
            slots.len() - 1
        }
    }
}

fn free_slot(inner: &PoolInner, slot: usize) {
    if let Some(entry) = inner.slots.lock().get_mut(slot) {
        *entry = None;
    }
}

fn push_ready(inner: &PoolInner, entry: PoolEntry) {
    entry.instance.health().touch();
    match inner.ready.push(entry) {
        Ok(()) => inner.ready_count.add_permits(1),
        Err(entry) => {
            warn!(instance = entry.instance.id(), "ready queue full, retiring instance");
            retire(inner, entry, Retire::Evict);
            inner.live.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

fn release(inner: &PoolInner, entry: PoolEntry) {
    inner.leased.fetch_sub(1, Ordering::AcqRel);
    if inner.closed.load(Ordering::Acquire) {
        inner.live.fetch_sub(1, Ordering::AcqRel);
        retire(inner, entry, Retire::Evict);
        return;
    }
    if entry.instance.health().needs_recycle() {
        retire(inner, entry, Retire::Replace);
        return;
    }
    debug!(instance = entry.instance.id(), "instance returned");
    push_ready(inner, entry);
}

/// Remove an instance from rotation and hand it to the reaper
fn retire(inner: &PoolInner, entry: PoolEntry, mode: Retire) {
    free_slot(inner, entry.slot);

    let reason = entry
        .instance
        .health()
        .recycle_reason()
        .map(RecycleReason::as_str)
        .unwrap_or("idle");
    metrics::counter!("engine_instances_recycled_total", "reason" => reason).increment(1);
    debug!(instance = entry.instance.id(), reason, "retiring instance");

    if let Err(mpsc::error::SendError((entry, mode))) = inner.reaper.send((entry, mode)) {
        // reaper gone: the handle's Drop stops the thread
        if matches!(mode, Retire::Replace) {
            inner.live.fetch_sub(1, Ordering::AcqRel);
        }
        drop(entry);
    }
}

/// Bootstrap one instance into the ready queue against a reservation the
/// caller already holds
///
/// `Ok(false)` when the pool closed meanwhile; the reservation is released.
/// On error the reservation is still held.
async fn bootstrap_reserved(inner: &PoolInner) -> Result<bool> {
    let instance = Instance::spawn(inner.spec.clone()).await?;
    if inner.closed.load(Ordering::Acquire) {
        inner.live.fetch_sub(1, Ordering::AcqRel);
        instance.teardown().await;
        return Ok(false);
    }

    let slot = claim_slot(inner, instance.health().clone());
    metrics::counter!("engine_instances_created_total").increment(1);
    debug!(instance = instance.id(), slot, "instance added to pool");
    push_ready(inner, PoolEntry { slot, instance });
    Ok(true)
}

/// Bootstrap with retries; `Ok(false)` when at capacity or closed
///
/// The reservation is always consumed: by the new instance on success,
/// released otherwise.
async fn spawn_with_retry(inner: Arc<PoolInner>, reservation: Reservation) -> Result<bool> {
    if matches!(reservation, Reservation::Needed) && !try_reserve(&inner) {
        return Ok(false);
    }

    let attempts = inner.settings.replace_attempts;
    let mut last_error = None;
    for attempt in 1..=attempts {
        if inner.closed.load(Ordering::Acquire) {
            inner.live.fetch_sub(1, Ordering::AcqRel);
            return Ok(false);
        }
        match bootstrap_reserved(&inner).await {
            Ok(added) => return Ok(added),
            Err(e) => {
                warn!(attempt, attempts, error = %e, "instance bootstrap failed");
                last_error = Some(e);
            }
        }
    }
    inner.live.fetch_sub(1, Ordering::AcqRel);

    let message = last_error
        .map(|e| e.to_string())
        .unwrap_or_else(|| "no attempts made".to_string());
    error!(attempts, error = %message, "giving up on replacement instance");
    let _ = inner.faults.send(PoolFault::ReplacementFailed {
        attempts,
        error: message.clone(),
    });
    Err(EngineError::Internal(format!(
        "replacement failed after {} attempts: {}",
        attempts, message
    )))
}

/// Tear down one retired instance, bootstrapping its replacement alongside
async fn recycle(pool: Weak<PoolInner>, entry: PoolEntry, mode: Retire) {
    let Retire::Replace = mode else {
        entry.instance.teardown().await;
        return;
    };
    let Some(inner) = pool.upgrade() else {
        entry.instance.teardown().await;
        return;
    };

    let ((), replaced) = tokio::join!(
        entry.instance.teardown(),
        spawn_with_retry(inner, Reservation::Held)
    );
    if let Err(e) = replaced {
        debug!(error = %e, "replacement deferred to next maintenance pass");
    }
}

async fn reaper_loop(
    pool: Weak<PoolInner>,
    mut retired: mpsc::UnboundedReceiver<(PoolEntry, Retire)>,
    cancel: CancellationToken,
) {
    loop {
        let (entry, mode) = tokio::select! {
            _ = cancel.cancelled() => break,
            next = retired.recv() => match next {
                Some(next) => next,
                None => break,
            },
        };
        tokio::spawn(recycle(pool.clone(), entry, mode));
    }

    // entries still queued carry reservations nobody will use
    retired.close();
    while let Ok((entry, mode)) = retired.try_recv() {
        if let (Retire::Replace, Some(inner)) = (mode, pool.upgrade()) {
            inner.live.fetch_sub(1, Ordering::AcqRel);
        }
        drop(entry);
    }
    debug!("pool reaper stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::health::{HealthMonitor, HealthPolicy};
    use crate::runtime::modules::{ModuleContext, ModuleRegistry, ModuleStage, SandboxModule};
    use deno_core::JsRuntime;
    use serde_json::json;

    /// Installs cleanly `healthy` times, then fails every setup
    struct FlakyModule {
        healthy: usize,
        setups: AtomicUsize,
    }

    impl SandboxModule for FlakyModule {
        fn name(&self) -> &'static str {
            "flaky"
        }

        fn stage(&self) -> ModuleStage {
            ModuleStage::Locked
        }

        fn setup(&self, _runtime: &mut JsRuntime, _ctx: &ModuleContext) -> anyhow::Result<()> {
            if self.setups.fetch_add(1, Ordering::SeqCst) < self.healthy {
                Ok(())
            } else {
                Err(anyhow::anyhow!("flaky module refused to install"))
            }
        }
    }

    fn settings(min: usize, max: usize) -> PoolSettings {
        PoolSettings {
            min_size: min,
            max_size: max,
            acquire_timeout_ms: 2_000,
            ..Default::default()
        }
    }

    fn spec() -> InstanceSpec {
        InstanceSpec::new(InstanceKind::Pooled, Arc::new(ModuleRegistry::with_builtins()))
    }

    async fn wait_for_live(pool: &RuntimePool, live: usize) {
        for _ in 0..100 {
            if pool.snapshot().live == live && pool.snapshot().idle == live {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    #[tokio::test]
    async fn test_pool_starts_at_min_size() {
        let pool = RuntimePool::start(settings(2, 4), spec()).await.unwrap();
        let snapshot = pool.snapshot();
        assert_eq!(snapshot.live, 2);
        assert_eq!(snapshot.idle, 2);
        assert_eq!(snapshot.leased, 0);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_lease_returns_instance() {
        let pool = RuntimePool::start(settings(1, 1), spec()).await.unwrap();
        let id = {
            let mut lease = pool.acquire().await.unwrap();
            assert_eq!(pool.snapshot().leased, 1);
            let value = lease
                .execute("return 1 + 1;", "{}".into(), Duration::from_secs(5))
                .await
                .unwrap();
            assert_eq!(value, json!(2));
            lease.instance_id()
        };
        assert_eq!(pool.snapshot().leased, 0);

        let lease = pool.acquire().await.unwrap();
        assert_eq!(lease.instance_id(), id);
        drop(lease);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_acquire_times_out_when_exhausted() {
        let mut config = settings(1, 1);
        config.acquire_timeout_ms = 50;
        let pool = RuntimePool::start(config, spec()).await.unwrap();

        let _held = pool.acquire().await.unwrap();
        let err = pool.acquire().await.unwrap_err();
        assert!(matches!(err, EngineError::PoolExhausted { .. }));
        assert!(pool.snapshot().live <= 1);
        drop(_held);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_flagged_instance_is_replaced() {
        let pool = RuntimePool::start(settings(1, 1), spec()).await.unwrap();
        let first = {
            let lease = pool.acquire().await.unwrap();
            let entry = lease.entry.as_ref().unwrap();
            entry.instance.health().mark_recycle(RecycleReason::ErrorRate);
            lease.instance_id()
        };

        wait_for_live(&pool, 1).await;
        let lease = pool.acquire().await.unwrap();
        assert_ne!(lease.instance_id(), first);
        drop(lease);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_recycle_hands_live_capacity_to_replacement() {
        let pool = RuntimePool::start(settings(1, 1), spec()).await.unwrap();
        let first = {
            let lease = pool.acquire().await.unwrap();
            let entry = lease.entry.as_ref().unwrap();
            entry.instance.health().mark_recycle(RecycleReason::Fault);
            lease.instance_id()
        };

        // the old instance is tearing down while its replacement bootstraps
        let mut samples = 0;
        while pool.snapshot().idle == 0 {
            assert_eq!(pool.snapshot().live, 1, "live dipped after {} samples", samples);
            samples += 1;
            assert!(samples < 2_000, "replacement never became ready");
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        assert_eq!(pool.snapshot().live, 1);

        let lease = pool.acquire().await.unwrap();
        assert_ne!(lease.instance_id(), first);
        drop(lease);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_failed_replacement_raises_fault() {
        let mut registry = ModuleRegistry::with_builtins();
        registry
            .register(Arc::new(FlakyModule {
                healthy: 1,
                setups: AtomicUsize::new(0),
            }))
            .unwrap();
        let mut config = settings(1, 1);
        config.replace_attempts = 2;
        let pool = RuntimePool::start(
            config,
            InstanceSpec::new(InstanceKind::Pooled, Arc::new(registry)),
        )
        .await
        .unwrap();
        let mut faults = pool.subscribe_faults();

        {
            let lease = pool.acquire().await.unwrap();
            let entry = lease.entry.as_ref().unwrap();
            entry.instance.health().mark_recycle(RecycleReason::ErrorRate);
        }

        let fault = tokio::time::timeout(Duration::from_secs(10), faults.recv())
            .await
            .expect("no fault raised")
            .unwrap();
        let PoolFault::ReplacementFailed { attempts, error } = fault;
        assert_eq!(attempts, 2);
        assert!(error.contains("flaky"), "{}", error);
        assert_eq!(pool.snapshot().live, 0);
        assert_eq!(pool.snapshot().idle, 0);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_health_scan_recycles_idle_instance() {
        let pool = RuntimePool::start(settings(1, 1), spec()).await.unwrap();
        let first = {
            let mut lease = pool.acquire().await.unwrap();
            let err = lease
                .execute("throw new Error('x');", "{}".into(), Duration::from_secs(5))
                .await
                .unwrap_err();
            assert!(err.script_error().is_some());
            lease.instance_id().unwrap()
        };
        assert_eq!(pool.snapshot().idle, 1);

        let policy = HealthPolicy {
            min_error_count_for_check: 1,
            max_error_rate: 0.0,
            ..Default::default()
        };
        let monitor = HealthMonitor::start(Arc::new(pool.clone()), policy, Duration::from_millis(50));

        let mut replaced = false;
        for _ in 0..200 {
            let ids: Vec<u64> = pool.health_records().iter().map(|r| r.instance_id()).collect();
            if ids.len() == 1 && ids[0] != first && pool.snapshot().idle == 1 {
                replaced = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        monitor.stop().await;
        assert!(replaced, "idle instance was never recycled");
        assert_eq!(pool.snapshot().live, 1);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_timeout_leads_to_fresh_instance() {
        let pool = RuntimePool::start(settings(1, 1), spec()).await.unwrap();
        let first = {
            let mut lease = pool.acquire().await.unwrap();
            let err = lease
                .execute("for (;;) {}", "{}".into(), Duration::from_millis(100))
                .await
                .unwrap_err();
            assert!(matches!(err, EngineError::Timeout { .. }));
            lease.instance_id()
        };

        wait_for_live(&pool, 1).await;
        let lease = pool.acquire().await.unwrap();
        assert_ne!(lease.instance_id(), first);
        drop(lease);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_growth_respects_max_size() {
        let pool = RuntimePool::start(settings(1, 3), spec()).await.unwrap();
        let mut leases = Vec::new();
        for _ in 0..3 {
            leases.push(pool.acquire().await.unwrap());
        }
        assert_eq!(pool.snapshot().live, 3);
        assert_eq!(pool.snapshot().leased, 3);
        drop(leases);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_evict_idle_keeps_min_size() {
        let mut config = settings(1, 3);
        config.idle_timeout_ms = 0;
        let pool = RuntimePool::start(config, spec()).await.unwrap();
        // sequential checkouts so each one sees the pool drained and grows it
        let mut leases = Vec::new();
        for _ in 0..3 {
            leases.push(pool.acquire().await.unwrap());
        }
        assert_eq!(pool.snapshot().live, 3);
        drop(leases);
        tokio::time::sleep(Duration::from_millis(10)).await;

        pool.evict_idle();
        assert_eq!(pool.snapshot().live, 1);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_refuses_leases() {
        let pool = RuntimePool::start(settings(1, 1), spec()).await.unwrap();
        pool.shutdown().await;
        assert!(pool.acquire().await.is_err());
        assert_eq!(pool.snapshot().idle, 0);
    }
}
