// src/executor/router.rs
//! Front of the execution core
//!
//! Every request goes through the same steps:
//!
//! 1. Size validation (no instance touched)
//! 2. Path decision by [`AsyncDetector`]
//! 3. A [`ConcurrencyGate`] permit, held until the result is back
//! 4. Sync path: lease a pooled instance. Async path: bootstrap a one-shot
//!    instance with timers, run it to completion, tear it down.
//!
//! The whole route runs behind a catch-and-convert boundary: a panic
//! anywhere below becomes [`EngineError::Internal`] for that request only.

use crate::executor::detector::AsyncDetector;
use crate::runtime::gate::ConcurrencyGate;
use crate::runtime::health::{HealthMonitor, HealthPolicy};
use crate::runtime::instance::{Instance, InstanceKind, InstanceSpec};
use crate::runtime::modules::ModuleRegistry;
use crate::runtime::pool::{PoolFault, PoolSnapshot, RuntimePool};
use crate::utils::config::{EngineConfig, LimitSettings};
use crate::utils::errors::{EngineError, ErrorKind, Result, ScriptErrorKind};
use chrono::{DateTime, Utc};
use futures::FutureExt;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{Map, Value};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{debug, info, info_span, warn, Instrument};
use ulid::Ulid;

/// Which path served a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionPath {
    Sync,
    Async,
}

impl ExecutionPath {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sync => "sync",
            Self::Async => "async",
        }
    }
}

/// One script execution request
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub code: String,
    pub input: Map<String, Value>,
}

/// Successful execution
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionResult {
    pub id: String,
    pub value: Value,
    pub duration: Duration,
    pub path: ExecutionPath,
    pub started_at: DateTime<Utc>,
}

/// Process-wide execution counters
#[derive(Debug, Default)]
pub struct EngineStats {
    executions: AtomicU64,
    sync_executions: AtomicU64,
    async_executions: AtomicU64,
    succeeded: AtomicU64,
    validation_failures: AtomicU64,
    concurrency_failures: AtomicU64,
    execution_failures: AtomicU64,
    security_violations: AtomicU64,
    timeouts: AtomicU64,
    internal_failures: AtomicU64,
}

/// Failures by error class
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FailureCounts {
    pub validation: u64,
    pub concurrency: u64,
    pub execution: u64,
    pub security: u64,
    pub timeout: u64,
    pub internal: u64,
}

/// Read-only view handed to observers
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub executions: u64,
    pub sync_executions: u64,
    pub async_executions: u64,
    pub succeeded: u64,
    pub failures: FailureCounts,
    pub pool: PoolSnapshot,
    pub in_flight: usize,
}

impl EngineStats {
    fn record(&self, path: Option<ExecutionPath>, outcome: std::result::Result<(), &EngineError>) {
        self.executions.fetch_add(1, Ordering::Relaxed);
        match path {
            Some(ExecutionPath::Sync) => self.sync_executions.fetch_add(1, Ordering::Relaxed),
            Some(ExecutionPath::Async) => self.async_executions.fetch_add(1, Ordering::Relaxed),
            None => 0,
        };

        let Err(error) = outcome else {
            self.succeeded.fetch_add(1, Ordering::Relaxed);
            return;
        };
        let counter = match error.kind() {
            ErrorKind::Validation => &self.validation_failures,
            ErrorKind::Concurrency => &self.concurrency_failures,
            ErrorKind::Execution => &self.execution_failures,
            ErrorKind::Timeout => &self.timeouts,
            ErrorKind::Setup | ErrorKind::Internal => &self.internal_failures,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        if error.script_error().is_some_and(|e| e.is_security()) {
            self.security_violations.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn counts(&self) -> (u64, u64, u64, u64, FailureCounts) {
        (
            self.executions.load(Ordering::Relaxed),
            self.sync_executions.load(Ordering::Relaxed),
            self.async_executions.load(Ordering::Relaxed),
            self.succeeded.load(Ordering::Relaxed),
            FailureCounts {
                validation: self.validation_failures.load(Ordering::Relaxed),
                concurrency: self.concurrency_failures.load(Ordering::Relaxed),
                execution: self.execution_failures.load(Ordering::Relaxed),
                security: self.security_violations.load(Ordering::Relaxed),
                timeout: self.timeouts.load(Ordering::Relaxed),
                internal: self.internal_failures.load(Ordering::Relaxed),
            },
        )
    }
}

/// Routes requests to the pooled or one-shot path
pub struct ExecutionRouter {
    pool: RuntimePool,
    gate: ConcurrencyGate,
    one_shot: InstanceSpec,
    limits: LimitSettings,
    stats: EngineStats,
    monitor: Mutex<Option<HealthMonitor>>,
}

impl ExecutionRouter {
    /// Precompile modules, fill the pool and start the health monitor
    pub async fn start(config: &EngineConfig, registry: ModuleRegistry) -> Result<Self> {
        config.validate()?;
        registry
            .precompile_all()
            .map_err(|e| EngineError::Internal(format!("module precompile failed: {:#}", e)))?;
        let registry = Arc::new(registry);

        let spec_for = |kind| {
            let mut spec = InstanceSpec::new(kind, registry.clone());
            spec.debug_logging = config.sandbox.debug_logging;
            spec.max_heap_bytes = config.limits.max_heap_bytes();
            spec.max_result_bytes = config.limits.max_result_bytes;
            spec
        };

        let pool = RuntimePool::start(config.pool.clone(), spec_for(InstanceKind::Pooled)).await?;
        let monitor = HealthMonitor::start(
            Arc::new(pool.clone()),
            HealthPolicy::from_settings(&config.health),
            config.health.interval(),
        );

        info!(
            max_concurrent = config.limits.max_concurrent,
            modules = ?registry.names(),
            "execution router started"
        );
        Ok(Self {
            pool,
            gate: ConcurrencyGate::new(config.limits.max_concurrent, config.limits.gate_timeout()),
            one_shot: spec_for(InstanceKind::OneShot),
            limits: config.limits.clone(),
            stats: EngineStats::default(),
            monitor: Mutex::new(Some(monitor)),
        })
    }

    /// Run `code` as the body of a function receiving `input`
    pub async fn execute(&self, code: &str, input: Map<String, Value>) -> Result<ExecutionResult> {
        let id = Ulid::new().to_string();
        let started_at = Utc::now();
        let clock = Instant::now();

        let span = info_span!("execute", execution_id = %id);
        let (path, outcome) = AssertUnwindSafe(self.route(code, input).instrument(span))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                warn!(execution_id = %id, panic = %message, "execution panicked");
                (None, Err(EngineError::Internal(format!("execution panicked: {}", message))))
            });

        let duration = clock.elapsed();
        self.stats.record(path, outcome.as_ref().map(|_| ()));
        self.emit_metrics(path, &outcome, duration);

        let value = outcome?;
        Ok(ExecutionResult {
            id,
            value,
            duration,
            path: path.unwrap_or(ExecutionPath::Sync),
            started_at,
        })
    }

    /// Convenience wrapper over [`ExecutionRouter::execute`]
    pub async fn submit(&self, request: ExecutionRequest) -> Result<ExecutionResult> {
        self.execute(&request.code, request.input).await
    }

    async fn route(
        &self,
        code: &str,
        input: Map<String, Value>,
    ) -> (Option<ExecutionPath>, Result<Value>) {
        let input_json = match self.validate(code, input) {
            Ok(json) => json,
            Err(e) => return (None, Err(e)),
        };

        let path = if AsyncDetector::requires_async(code) {
            ExecutionPath::Async
        } else {
            ExecutionPath::Sync
        };

        let _permit = match self.gate.acquire().await {
            Ok(permit) => permit,
            Err(e) => return (Some(path), Err(e)),
        };
        metrics::gauge!("engine_in_flight").set(self.gate.in_flight() as f64);

        let budget = self.limits.execution_timeout();
        debug!(path = path.as_str(), "routing execution");
        let result = match path {
            ExecutionPath::Sync => self.run_pooled(code, input_json, budget).await,
            ExecutionPath::Async => self.run_one_shot(code, input_json, budget).await,
        };
        (Some(path), result)
    }

    fn validate(&self, code: &str, input: Map<String, Value>) -> Result<String> {
        if code.len() > self.limits.max_code_bytes {
            return Err(EngineError::Validation(format!(
                "code is {} bytes, limit is {}",
                code.len(),
                self.limits.max_code_bytes
            )));
        }
        let input_json = serde_json::to_string(&Value::Object(input))?;
        if input_json.len() > self.limits.max_input_bytes {
            return Err(EngineError::Validation(format!(
                "input is {} bytes, limit is {}",
                input_json.len(),
                self.limits.max_input_bytes
            )));
        }
        Ok(input_json)
    }

    async fn run_pooled(&self, code: &str, input_json: String, budget: Duration) -> Result<Value> {
        let mut lease = self.pool.acquire().await?;
        lease.execute(code, input_json, budget).await
    }

    async fn run_one_shot(&self, code: &str, input_json: String, budget: Duration) -> Result<Value> {
        let instance = Instance::spawn(self.one_shot.clone()).await.map_err(|e| match e {
            EngineError::Setup { .. } => {
                EngineError::Internal(format!("one-shot bootstrap failed: {}", e))
            }
            other => other,
        })?;
        let result = instance.execute(code, input_json, budget).await;
        tokio::spawn(instance.teardown());
        result
    }

    fn emit_metrics(&self, path: Option<ExecutionPath>, outcome: &Result<Value>, duration: Duration) {
        let path = path.map(ExecutionPath::as_str).unwrap_or("none");
        let outcome = match outcome {
            Ok(_) => "ok",
            Err(e) if e.script_error().is_some_and(|s| s.kind == ScriptErrorKind::Security) => {
                "security"
            }
            Err(e) => e.kind().as_str(),
        };
        metrics::counter!("engine_executions_total", "path" => path, "outcome" => outcome)
            .increment(1);
        metrics::histogram!("engine_execution_duration_seconds", "path" => path)
            .record(duration.as_secs_f64());
        metrics::gauge!("engine_in_flight").set(self.gate.in_flight() as f64);
    }

    pub fn stats(&self) -> StatsSnapshot {
        let (executions, sync_executions, async_executions, succeeded, failures) =
            self.stats.counts();
        StatsSnapshot {
            executions,
            sync_executions,
            async_executions,
            succeeded,
            failures,
            pool: self.pool.snapshot(),
            in_flight: self.gate.in_flight(),
        }
    }

    pub fn pool(&self) -> &RuntimePool {
        &self.pool
    }

    pub fn subscribe_faults(&self) -> broadcast::Receiver<PoolFault> {
        self.pool.subscribe_faults()
    }

    /// Stop the monitor, close admission and tear down idle instances
    pub async fn shutdown(&self) {
        let monitor = self.monitor.lock().take();
        if let Some(monitor) = monitor {
            monitor.stop().await;
        }
        self.gate.close();
        self.pool.shutdown().await;
        info!("execution router stopped");
    }
}
