// src/lib.rs
//! Sandbox Engine Library
//!
//! Multi-tenant execution core for untrusted JavaScript snippets. Each
//! snippet runs inside a locked-down V8 isolate; synchronous snippets share
//! a pool of warm isolates, asynchronous ones get a fresh isolate each.
//!
//! # Architecture
//!
//! The engine is structured into several key modules:
//!
//! - **runtime**: isolates, sandbox bootstrap, pool, health, admission gate
//! - **executor**: request routing and execution stats
//! - **observability**: tracing and metrics setup
//! - **utils**: configuration and errors
//!
//! # Example
//!
//! ```no_run
//! use sandbox_engine::{EngineConfig, ExecutionRouter, ModuleRegistry};
//!
//! # async fn run() -> sandbox_engine::Result<()> {
//! let router = ExecutionRouter::start(&EngineConfig::default(), ModuleRegistry::with_builtins()).await?;
//! let mut input = serde_json::Map::new();
//! input.insert("n".into(), 20.into());
//! let result = router.execute("return input.n + 1;", input).await?;
//! assert_eq!(result.value, 21);
//! router.shutdown().await;
//! # Ok(())
//! # }
//! ```

// Public module exports
pub mod executor;
pub mod observability;
pub mod runtime;
pub mod utils;

// Re-export commonly used types
pub use executor::router::{ExecutionPath, ExecutionRequest, ExecutionResult, ExecutionRouter, StatsSnapshot};
pub use runtime::modules::{ModuleRegistry, SandboxModule};
pub use runtime::pool::{PoolFault, RuntimePool};
pub use utils::config::EngineConfig;
pub use utils::errors::{EngineError, ErrorKind, Result, ScriptError, ScriptErrorKind};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const GIT_HASH: &str = env!("GIT_HASH");

/// Engine build information
#[derive(Debug, Clone, serde::Serialize)]
pub struct BuildInfo {
    pub version: &'static str,
    pub git_hash: &'static str,
    pub build_timestamp: &'static str,
    pub rustc_version: &'static str,
}

impl BuildInfo {
    pub fn current() -> Self {
        Self {
            version: VERSION,
            git_hash: GIT_HASH,
            build_timestamp: env!("BUILD_TIMESTAMP"),
            rustc_version: env!("RUSTC_VERSION"),
        }
    }
}
