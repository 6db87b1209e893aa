// src/main.rs
//! Sandbox Engine
//!
//! Serves newline-delimited JSON on stdin/stdout. Each input line is a
//! request `{"id": ..., "code": "...", "input": {...}}`; each output line is
//! the matching response. Requests run concurrently, so responses may come
//! back out of order (match them by `id`).

use anyhow::Result;
use futures::{SinkExt, StreamExt};
use sandbox_engine::observability::{init_metrics, init_tracing};
use sandbox_engine::{
    BuildInfo, EngineConfig, EngineError, ErrorKind, ExecutionResult, ExecutionRouter,
    ModuleRegistry, PoolFault, ScriptError,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};
use tracing::{debug, error, info, warn};

/// Longest accepted request line
const MAX_LINE_BYTES: usize = 4 * 1024 * 1024;

#[derive(Debug, Deserialize)]
struct WireRequest {
    #[serde(default)]
    id: Option<Value>,
    code: String,
    #[serde(default)]
    input: Map<String, Value>,
}

#[derive(Debug, Serialize)]
struct WireResponse {
    id: Option<Value>,
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<ExecutionResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<WireError>,
}

#[derive(Debug, Serialize)]
struct WireError {
    kind: ErrorKind,
    message: String,
    retryable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    script: Option<ScriptError>,
}

impl WireResponse {
    fn from_outcome(id: Option<Value>, outcome: sandbox_engine::Result<ExecutionResult>) -> Self {
        match outcome {
            Ok(result) => Self {
                id,
                ok: true,
                result: Some(result),
                error: None,
            },
            Err(e) => Self::failure(id, &e),
        }
    }

    fn failure(id: Option<Value>, e: &EngineError) -> Self {
        Self {
            id,
            ok: false,
            result: None,
            error: Some(WireError {
                kind: e.kind(),
                message: e.to_string(),
                retryable: e.is_retryable(),
                script: e.script_error().cloned(),
            }),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first: it selects the log format
    let config = EngineConfig::load()?;

    // Initialize observability (tracing, metrics)
    init_tracing(&config.observability)?;
    init_metrics(&config.observability)?;

    let build = BuildInfo::current();
    info!(
        version = build.version,
        git = build.git_hash,
        rustc = build.rustc_version,
        "Starting Sandbox Engine"
    );
    debug!(?config, "configuration loaded");

    // Precompiles builtin modules (fatal on failure), fills the pool
    let router = Arc::new(ExecutionRouter::start(&config, ModuleRegistry::with_builtins()).await?);

    let mut faults = router.subscribe_faults();
    tokio::spawn(async move {
        while let Ok(fault) = faults.recv().await {
            match fault {
                PoolFault::ReplacementFailed { attempts, error } => {
                    error!(attempts, %error, "pool could not replace an instance");
                }
            }
        }
    });

    let (responses_tx, mut responses_rx) = mpsc::unbounded_channel::<String>();
    let writer = tokio::spawn(async move {
        let mut sink = FramedWrite::new(tokio::io::stdout(), LinesCodec::new());
        while let Some(line) = responses_rx.recv().await {
            if let Err(e) = sink.send(line).await {
                error!(error = %e, "failed to write response");
                break;
            }
        }
    });

    let mut lines = FramedRead::new(
        tokio::io::stdin(),
        LinesCodec::new_with_max_length(MAX_LINE_BYTES),
    );
    let mut tasks = JoinSet::new();
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    let mut interrupted = false;

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("Received shutdown signal, cleaning up...");
                interrupted = true;
                break;
            }
            next = lines.next() => {
                let line = match next {
                    Some(Ok(line)) => line,
                    Some(Err(e)) => {
                        warn!(error = %e, "discarding unreadable request line");
                        let response = WireResponse::failure(None, &EngineError::Validation(e.to_string()));
                        send(&responses_tx, &response);
                        continue;
                    }
                    None => {
                        info!("stdin closed, draining in-flight requests");
                        break;
                    }
                };
                if line.trim().is_empty() {
                    continue;
                }

                let request: WireRequest = match serde_json::from_str(&line) {
                    Ok(request) => request,
                    Err(e) => {
                        let response = WireResponse::failure(None, &EngineError::Validation(format!("malformed request: {}", e)));
                        send(&responses_tx, &response);
                        continue;
                    }
                };

                let router = router.clone();
                let responses = responses_tx.clone();
                tasks.spawn(async move {
                    let outcome = router.execute(&request.code, request.input).await;
                    send(&responses, &WireResponse::from_outcome(request.id, outcome));
                });
            }
        }
    }

    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined {
            error!(error = %e, "request task failed");
        }
    }

    router.shutdown().await;
    drop(responses_tx);
    let _ = writer.await;

    let stats = router.stats();
    info!(
        executions = stats.executions,
        succeeded = stats.succeeded,
        "Engine stopped gracefully"
    );

    if interrupted {
        // A blocked stdin read cannot be cancelled and would hold the runtime open.
        std::process::exit(0);
    }
    Ok(())
}

fn send(responses: &mpsc::UnboundedSender<String>, response: &WireResponse) {
    match serde_json::to_string(response) {
        Ok(line) => {
            let _ = responses.send(line);
        }
        Err(e) => error!(error = %e, "failed to encode response"),
    }
}
