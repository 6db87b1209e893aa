// src/runtime/health.rs
//! Per-instance health tracking and the periodic recycle scan
//!
//! Each live instance owns an [`Arc<HealthRecord>`] shared between its
//! handle (which updates counters) and the pool's slot table (which the
//! [`HealthMonitor`] scans). The monitor never tears anything down itself:
//! it only flags records, and the pool swaps flagged instances out once they
//! are back in its hands.

use crate::utils::config::HealthSettings;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Why an instance must leave the pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecycleReason {
    /// Error rate over threshold
    ErrorRate,
    /// Old and heavily used
    LongRunning,
    /// Timed out mid-execution
    Timeout,
    /// Heap limit reached
    HeapLimit,
    /// Per-execution reset failed
    ResetFailed,
    /// Lease dropped without completing
    Abandoned,
    /// Instance thread failed
    Fault,
}

impl RecycleReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ErrorRate => "error_rate",
            Self::LongRunning => "long_running",
            Self::Timeout => "timeout",
            Self::HeapLimit => "heap_limit",
            Self::ResetFailed => "reset_failed",
            Self::Abandoned => "abandoned",
            Self::Fault => "fault",
        }
    }
}

/// Counters for one instance
#[derive(Debug)]
pub struct HealthRecord {
    instance_id: u64,
    created_at: Instant,
    last_used: RwLock<Instant>,
    executions: AtomicU64,
    errors: AtomicU64,
    recycle: AtomicBool,
    reason: Mutex<Option<RecycleReason>>,
}

impl HealthRecord {
    pub fn new(instance_id: u64) -> Self {
        let now = Instant::now();
        Self {
            instance_id,
            created_at: now,
            last_used: RwLock::new(now),
            executions: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            recycle: AtomicBool::new(false),
            reason: Mutex::new(None),
        }
    }

    pub fn instance_id(&self) -> u64 {
        self.instance_id
    }

    /// Count one finished execution
    pub fn record_execution(&self, failed: bool) {
        self.executions.fetch_add(1, Ordering::Relaxed);
        if failed {
            self.errors.fetch_add(1, Ordering::Relaxed);
        }
        self.touch();
    }

    pub fn touch(&self) {
        *self.last_used.write() = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_used.read().elapsed()
    }

    /// Flag for recycling; the first reason wins
    pub fn mark_recycle(&self, reason: RecycleReason) {
        let mut slot = self.reason.lock();
        if slot.is_none() {
            *slot = Some(reason);
        }
        self.recycle.store(true, Ordering::Release);
    }

    pub fn needs_recycle(&self) -> bool {
        self.recycle.load(Ordering::Acquire)
    }

    pub fn recycle_reason(&self) -> Option<RecycleReason> {
        *self.reason.lock()
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        HealthSnapshot {
            instance_id: self.instance_id,
            age: self.created_at.elapsed(),
            idle: self.idle_for(),
            executions: self.executions.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            recycle: self.recycle_reason(),
        }
    }
}

/// Point-in-time view of a [`HealthRecord`]
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub instance_id: u64,
    pub age: Duration,
    pub idle: Duration,
    pub executions: u64,
    pub errors: u64,
    pub recycle: Option<RecycleReason>,
}

impl HealthSnapshot {
    pub fn error_rate(&self) -> f64 {
        if self.executions == 0 {
            0.0
        } else {
            self.errors as f64 / self.executions as f64
        }
    }
}

/// Thresholds used by the recycle scan
#[derive(Debug, Clone)]
pub struct HealthPolicy {
    pub min_error_count_for_check: u64,
    pub max_error_rate: f64,
    pub long_running_age: Duration,
    pub long_running_executions: u64,
}

impl Default for HealthPolicy {
    fn default() -> Self {
        Self::from_settings(&HealthSettings::default())
    }
}

impl HealthPolicy {
    pub fn from_settings(settings: &HealthSettings) -> Self {
        Self {
            min_error_count_for_check: settings.min_error_count_for_check,
            max_error_rate: settings.max_error_rate,
            long_running_age: settings.long_running_age(),
            long_running_executions: settings.long_running_executions,
        }
    }

    /// Decide whether an instance should be recycled
    ///
    /// The error rate is only considered once the instance has run at least
    /// `min_error_count_for_check` executions, so a young instance with a
    /// couple of early failures is left alone.
    pub fn evaluate(&self, snapshot: &HealthSnapshot) -> Option<RecycleReason> {
        if snapshot.executions >= self.min_error_count_for_check
            && snapshot.error_rate() > self.max_error_rate
        {
            return Some(RecycleReason::ErrorRate);
        }
        if snapshot.age > self.long_running_age
            && snapshot.executions > self.long_running_executions
        {
            return Some(RecycleReason::LongRunning);
        }
        None
    }
}

/// Source of health records for the monitor (implemented by the pool)
pub trait HealthSource: Send + Sync + 'static {
    fn health_records(&self) -> Vec<Arc<HealthRecord>>;

    /// Housekeeping run on the same tick, after the scan
    fn after_scan(&self) {}
}

/// Background task that flags unhealthy instances
pub struct HealthMonitor {
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl HealthMonitor {
    /// Start scanning `source` every `interval`
    pub fn start<S: HealthSource>(source: Arc<S>, policy: HealthPolicy, interval: Duration) -> Self {
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // first tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let flagged = scan(source.health_records(), &policy);
                        if flagged > 0 {
                            info!(flagged, "health scan flagged instances for recycling");
                        }
                        source.after_scan();
                    }
                }
            }
            debug!("health monitor stopped");
        });

        Self {
            cancel,
            task: Some(task),
        }
    }

    /// Stop the scan and wait for the task to exit
    pub async fn stop(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for HealthMonitor {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// One pass over `records`; returns how many were newly flagged
pub fn scan(records: Vec<Arc<HealthRecord>>, policy: &HealthPolicy) -> usize {
    let mut flagged = 0;
    for record in records {
        if record.needs_recycle() {
            continue;
        }
        let snapshot = record.snapshot();
        if let Some(reason) = policy.evaluate(&snapshot) {
            debug!(
                instance = snapshot.instance_id,
                executions = snapshot.executions,
                errors = snapshot.errors,
                ?reason,
                "instance marked for recycling"
            );
            record.mark_recycle(reason);
            flagged += 1;
        }
    }
    flagged
}
