// src/observability/mod.rs
//! Logging and metrics setup
//!
//! Logs go to stderr so stdout stays free for the NDJSON protocol.

use crate::utils::config::{LogFormat, ObservabilitySettings};
use anyhow::{anyhow, Context, Result};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Install the global tracing subscriber
///
/// Level defaults to `info` and is overridden by `RUST_LOG`.
pub fn init_tracing(settings: &ObservabilitySettings) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let (pretty, json) = match settings.log_format {
        LogFormat::Pretty => (Some(fmt::layer().with_writer(std::io::stderr)), None),
        LogFormat::Json => (
            None,
            Some(
                fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_writer(std::io::stderr),
            ),
        ),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(pretty)
        .with(json)
        .try_init()
        .map_err(|e| anyhow!("failed to install tracing subscriber: {}", e))
}

/// Start the Prometheus exporter when `metrics_addr` is set
pub fn init_metrics(settings: &ObservabilitySettings) -> Result<()> {
    let Some(addr) = settings.metrics_addr.as_deref() else {
        return Ok(());
    };
    let addr: SocketAddr = addr
        .parse()
        .with_context(|| format!("invalid metrics address '{}'", addr))?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("failed to install prometheus exporter")?;
    describe_metrics();

    info!(%addr, "prometheus exporter listening");
    Ok(())
}

fn describe_metrics() {
    metrics::describe_counter!("engine_executions_total", "Executions by path and outcome");
    metrics::describe_counter!("engine_instances_created_total", "Pooled instances bootstrapped");
    metrics::describe_counter!("engine_instances_recycled_total", "Pooled instances retired by reason");
    metrics::describe_histogram!(
        "engine_execution_duration_seconds",
        metrics::Unit::Seconds,
        "End-to-end execution latency"
    );
    metrics::describe_gauge!("engine_pool_live", "Live pooled instances");
    metrics::describe_gauge!("engine_in_flight", "Executions holding a gate permit");
}
