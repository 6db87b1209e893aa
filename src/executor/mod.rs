// src/executor/mod.rs
//! Request routing
//!
//! - **Router**: validation, admission, path selection, stats
//! - **Detector**: static check for constructs that need an event loop

pub mod detector;
pub mod router;

pub use detector::AsyncDetector;
pub use router::{
    EngineStats, ExecutionPath, ExecutionRequest, ExecutionResult, ExecutionRouter, FailureCounts,
    StatsSnapshot,
};
