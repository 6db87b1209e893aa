// src/utils/config.rs
//! Engine configuration
//!
//! Layered loading with the `config` crate:
//!
//! 1. Built-in defaults ([`EngineConfig::default`])
//! 2. Optional file: `$ENGINE_CONFIG`, else `config/engine.{toml,yaml,json}`
//! 3. Environment: `ENGINE__<SECTION>__<KEY>` (e.g. `ENGINE__POOL__MAX_SIZE=16`)

use crate::utils::errors::{EngineError, Result};
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Top-level engine configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub pool: PoolSettings,
    pub health: HealthSettings,
    pub limits: LimitSettings,
    pub sandbox: SandboxSettings,
    pub observability: ObservabilitySettings,
}

/// Runtime pool sizing and lifecycle
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolSettings {
    /// Instances kept alive at all times
    pub min_size: usize,

    /// Hard upper bound on live instances
    pub max_size: usize,

    /// Idle instances above `min_size` are torn down after this long
    pub idle_timeout_ms: u64,

    /// How long a checkout waits for a ready instance
    pub acquire_timeout_ms: u64,

    /// Grow when idle/live drops below this fraction (0.0-1.0)
    pub growth_threshold: f64,

    /// Bootstrap attempts for a replacement before raising a fault
    pub replace_attempts: u32,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            min_size: 2,
            max_size: 8,
            idle_timeout_ms: 300_000,
            acquire_timeout_ms: 2_000,
            growth_threshold: 0.25,
            replace_attempts: 3,
        }
    }
}

impl PoolSettings {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }
}

/// Health monitor thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthSettings {
    /// Scan interval
    pub interval_ms: u64,

    /// Executions required before the error rate is considered
    pub min_error_count_for_check: u64,

    /// Recycle when errors/executions exceeds this (0.0-1.0)
    pub max_error_rate: f64,

    /// Preventative rotation: minimum age...
    pub long_running_age_secs: u64,

    /// ...and minimum cumulative executions
    pub long_running_executions: u64,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            interval_ms: 10_000,
            min_error_count_for_check: 10,
            max_error_rate: 0.1,
            long_running_age_secs: 3_600,
            long_running_executions: 10_000,
        }
    }
}

impl HealthSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn long_running_age(&self) -> Duration {
        Duration::from_secs(self.long_running_age_secs)
    }
}

/// Admission control and per-execution limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitSettings {
    /// Global concurrency gate size (sync and async paths)
    pub max_concurrent: usize,

    /// How long a request waits for a gate permit
    pub gate_timeout_ms: u64,

    pub max_code_bytes: usize,
    pub max_input_bytes: usize,
    pub max_result_bytes: usize,

    /// Wall-clock budget per execution
    pub execution_timeout_ms: u64,

    /// V8 heap limit per instance
    pub max_heap_mb: usize,
}

impl Default for LimitSettings {
    fn default() -> Self {
        Self {
            max_concurrent: 32,
            gate_timeout_ms: 1_000,
            max_code_bytes: 64 * 1024,
            max_input_bytes: 256 * 1024,
            max_result_bytes: 1024 * 1024,
            execution_timeout_ms: 5_000,
            max_heap_mb: 64,
        }
    }
}

impl LimitSettings {
    pub fn gate_timeout(&self) -> Duration {
        Duration::from_millis(self.gate_timeout_ms)
    }

    pub fn execution_timeout(&self) -> Duration {
        Duration::from_millis(self.execution_timeout_ms)
    }

    pub fn max_heap_bytes(&self) -> usize {
        self.max_heap_mb * 1024 * 1024
    }
}

/// Capabilities exposed inside the sandbox
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxSettings {
    /// Forward `console.*` to the host log; when off, console calls throw
    pub debug_logging: bool,
}

/// Log output format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilitySettings {
    pub log_format: LogFormat,

    /// Prometheus listener, e.g. "0.0.0.0:9000" (disabled when unset)
    pub metrics_addr: Option<String>,
}

impl EngineConfig {
    /// Load configuration from defaults, optional file and environment
    pub fn load() -> Result<Self> {
        let file = std::env::var("ENGINE_CONFIG").ok();
        Self::load_from(file.as_deref().map(Path::new))
    }

    /// Load with an explicit file path (used by tests and `load`)
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let defaults = Config::try_from(&EngineConfig::default())?;

        let mut builder = Config::builder().add_source(defaults);
        builder = match path {
            Some(path) => builder.add_source(File::from(path).required(true)),
            None => builder.add_source(File::with_name("config/engine").required(false)),
        };
        builder = builder.add_source(
            Environment::with_prefix("ENGINE")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config: EngineConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject inconsistent settings
    pub fn validate(&self) -> Result<()> {
        let pool = &self.pool;
        if pool.max_size == 0 {
            return Err(EngineError::Config("pool.max_size must be > 0".into()));
        }
        if pool.min_size > pool.max_size {
            return Err(EngineError::Config(format!(
                "pool.min_size ({}) cannot exceed pool.max_size ({})",
                pool.min_size, pool.max_size
            )));
        }
        if !(0.0..=1.0).contains(&pool.growth_threshold) {
            return Err(EngineError::Config(
                "pool.growth_threshold must be within 0.0-1.0".into(),
            ));
        }
        if pool.replace_attempts == 0 {
            return Err(EngineError::Config("pool.replace_attempts must be > 0".into()));
        }

        if !(0.0..=1.0).contains(&self.health.max_error_rate) {
            return Err(EngineError::Config(
                "health.max_error_rate must be within 0.0-1.0".into(),
            ));
        }
        if self.health.interval_ms == 0 {
            return Err(EngineError::Config("health.interval_ms must be > 0".into()));
        }

        let limits = &self.limits;
        if limits.max_concurrent == 0 {
            return Err(EngineError::Config("limits.max_concurrent must be > 0".into()));
        }
        if limits.execution_timeout_ms == 0 {
            return Err(EngineError::Config(
                "limits.execution_timeout_ms must be > 0".into(),
            ));
        }
        if limits.max_code_bytes == 0 || limits.max_input_bytes == 0 || limits.max_result_bytes == 0
        {
            return Err(EngineError::Config("size limits must be > 0".into()));
        }
        if limits.max_heap_mb < 8 {
            return Err(EngineError::Config("limits.max_heap_mb must be >= 8".into()));
        }

        Ok(())
    }
}
