// Telemetry: structured JSON logging and Prometheus metrics.

use anyhow::Result;
use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Initialize structured logging with JSON formatting.
///
/// Log levels come from `RUST_LOG` when set, otherwise from the configured
/// level.
pub fn init_logging(log_level: &str) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .map_err(|e| anyhow::anyhow!("Failed to create env filter: {}", e))?;

    let json_layer = fmt::layer()
        .json()
        .with_current_span(true)
        .with_target(true)
        .with_filter(env_filter);

    tracing_subscriber::registry()
        .with(json_layer)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to initialize tracing subscriber: {}", e))?;

    tracing::info!(log_level = log_level, "Structured logging initialized");
    Ok(())
}

/// Install the Prometheus exporter and describe the scheduler's metrics.
pub fn init_metrics(metrics_port: u16) -> Result<()> {
    let addr: SocketAddr = format!("0.0.0.0:{}", metrics_port)
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid metrics port: {}", e))?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| anyhow::anyhow!("Failed to install Prometheus exporter: {}", e))?;

    describe_counter!(
        "scheduler_triggers_submitted_total",
        "Total triggers accepted through the submission API"
    );
    describe_counter!(
        "scheduler_triggers_fired_total",
        "Total job body dispatches"
    );
    describe_counter!(
        "scheduler_fires_succeeded_total",
        "Total fires whose job body returned success"
    );
    describe_counter!(
        "scheduler_fires_failed_total",
        "Total fires whose job body failed or panicked"
    );
    describe_counter!(
        "scheduler_fires_vetoed_total",
        "Total fires whose job body declined to run"
    );
    describe_counter!(
        "scheduler_misfires_total",
        "Total triggers found past their misfire threshold"
    );
    describe_counter!(
        "scheduler_orphans_recovered_total",
        "Total triggers reclaimed from stale instances"
    );
    describe_histogram!(
        "scheduler_poll_duration_seconds",
        "Duration of one claim-and-dispatch cycle"
    );
    describe_gauge!(
        "scheduler_running_jobs",
        "Job bodies currently executing on this instance"
    );

    tracing::info!(
        metrics_port = metrics_port,
        "Prometheus metrics exporter initialized"
    );
    Ok(())
}
