// src/runtime/mod.rs
//! Sandboxed script runtime
//!
//! This module provides the isolate-level building blocks:
//!
//! - **Sandbox**: the bootstrap state machine that locks down each isolate
//! - **Modules**: trusted builtin capabilities installed during bootstrap
//! - **Instance**: one isolate on a dedicated thread behind a `Send` handle
//! - **Pool**: warm, reusable instances for synchronous scripts
//! - **Health**: per-instance counters and the periodic recycle scan
//! - **Gate**: global admission control
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────── RuntimePool ─────────────────────────┐
//! │  ┌────────────┐  ┌────────────┐  ┌────────────┐              │
//! │  │ Instance 1 │  │ Instance 2 │  │ Instance 3 │   ...        │
//! │  │  (thread)  │  │  (thread)  │  │  (thread)  │              │
//! │  └─────┬──────┘  └─────┬──────┘  └─────┬──────┘              │
//! │        └── HealthRecord arena ◀── HealthMonitor (interval)   │
//! └──────────────────────────────────────────────────────────────┘
//!              ▲ lease                         one-shot instances
//!              │                               (async path, timers)
//!        ConcurrencyGate ◀── ExecutionRouter ──────────┘
//! ```

pub mod gate;
pub mod health;
pub mod instance;
pub mod modules;
pub mod ops;
pub mod pool;
pub mod sandbox;

// Re-export commonly used types
pub use gate::{ConcurrencyGate, GatePermit};
pub use health::{HealthMonitor, HealthPolicy, HealthRecord, HealthSnapshot, RecycleReason};
pub use instance::{Instance, InstanceKind, InstanceSpec};
pub use modules::{ModuleContext, ModuleRegistry, ModuleStage, SandboxModule};
pub use pool::{InstanceLease, PoolFault, PoolSnapshot, RuntimePool};
pub use sandbox::{SandboxStage, SecuritySandbox};
