// src/utils/errors.rs
//! Error taxonomy for the execution core
//!
//! Every failure a caller can observe maps to one [`ErrorKind`]:
//!
//! - **Validation**: code or input exceeds configured limits (no instance touched)
//! - **Concurrency**: pool or gate acquisition timed out (retry later)
//! - **Execution**: the script threw, including "capability disabled" errors
//! - **Timeout**: the script exceeded its wall-clock budget
//! - **Setup**: sandbox bootstrap failed (pool-internal, never returned to callers)
//! - **Internal**: host-side faults converted at the execution boundary

use serde::Serialize;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

use crate::runtime::sandbox::SandboxStage;

/// Result alias used across the crate
pub type Result<T> = std::result::Result<T, EngineError>;

/// Error class exposed to the front door
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    Concurrency,
    Execution,
    Timeout,
    Setup,
    Internal,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::Concurrency => "concurrency",
            Self::Execution => "execution",
            Self::Timeout => "timeout",
            Self::Setup => "setup",
            Self::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a script-level failure happened
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScriptErrorKind {
    /// The script threw an ordinary error
    Thrown,
    /// A neutralized builtin or a locked accessor refused the operation
    Security,
    /// The isolate hit its heap limit and was terminated
    ResourceLimit,
    /// The script finished without reporting a result
    NoResult,
    /// The serialized result exceeds `max_result_bytes`
    ResultTooLarge,
}

/// Failure raised by tenant code inside the sandbox
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScriptError {
    pub kind: ScriptErrorKind,
    /// JavaScript error name (`TypeError`, `SecurityError`, ...)
    pub name: String,
    pub message: String,
}

impl ScriptError {
    /// Name carried by errors thrown from neutralized builtins.
    pub const SECURITY_ERROR_NAME: &'static str = "SecurityError";

    /// Build from a JS error name and message, classifying security errors.
    pub fn thrown(name: impl Into<String>, message: impl Into<String>) -> Self {
        let name = name.into();
        let kind = if name == Self::SECURITY_ERROR_NAME {
            ScriptErrorKind::Security
        } else {
            ScriptErrorKind::Thrown
        };
        Self {
            kind,
            name,
            message: message.into(),
        }
    }

    pub fn new(kind: ScriptErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            name: "Error".to_string(),
            message: message.into(),
        }
    }

    pub fn is_security(&self) -> bool {
        self.kind == ScriptErrorKind::Security
    }
}

impl fmt::Display for ScriptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.message)
    }
}

/// Engine error type
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Runtime pool exhausted after waiting {waited:?}")]
    PoolExhausted { waited: Duration },

    #[error("Concurrency limit of {max} reached after waiting {waited:?}")]
    ConcurrencyLimit { max: usize, waited: Duration },

    #[error("Script error: {0}")]
    Execution(ScriptError),

    #[error("Execution exceeded wall-clock budget of {budget:?}")]
    Timeout { budget: Duration },

    #[error("Sandbox setup failed at {stage:?}: {message}")]
    Setup { stage: SandboxStage, message: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Error class for this failure
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::PoolExhausted { .. } | Self::ConcurrencyLimit { .. } => ErrorKind::Concurrency,
            Self::Execution(_) => ErrorKind::Execution,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Setup { .. } => ErrorKind::Setup,
            Self::Config(_) | Self::Io(_) | Self::Serialization(_) | Self::Internal(_) => {
                ErrorKind::Internal
            }
        }
    }

    /// Whether the caller should retry later
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Concurrency
    }

    /// Script error details, if this is an execution failure
    pub fn script_error(&self) -> Option<&ScriptError> {
        match self {
            Self::Execution(e) => Some(e),
            _ => None,
        }
    }

    pub fn setup(stage: SandboxStage, message: impl Into<String>) -> Self {
        Self::Setup {
            stage,
            message: message.into(),
        }
    }
}

impl From<config::ConfigError> for EngineError {
    fn from(e: config::ConfigError) -> Self {
        Self::Config(e.to_string())
    }
}
