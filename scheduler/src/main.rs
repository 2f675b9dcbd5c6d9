// Scheduler node entry point: wires the Postgres-backed job store, the
// handler registry and the scheduler instance, then runs until SIGINT.

use std::sync::Arc;

use anyhow::Context;
use common::cluster::ClusterConfig;
use common::config::Settings;
use common::db::DbPool;
use common::executor::{JobContext, JobHandler, JobOutcome, JobRegistry};
use common::scheduler::{SchedulerConfig, SchedulerInstance};
use common::store::{JobStore, PostgresJobStore};
use common::telemetry;
use tracing::{error, info};

/// Built-in handler that logs a message from the job data map. Useful for
/// smoke-testing a deployment before real handlers are registered.
struct LogMessage;

#[async_trait::async_trait]
impl JobHandler for LogMessage {
    async fn execute(&self, ctx: JobContext) -> JobOutcome {
        let message = ctx
            .data
            .get("message")
            .and_then(|v| v.as_str())
            .unwrap_or("(no message)");
        info!(
            job_key = %ctx.job_key,
            trigger_key = %ctx.trigger_key,
            scheduled_time = %ctx.scheduled_time,
            message,
            "log_message job fired"
        );
        JobOutcome::Success
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = Settings::load().context("Failed to load configuration")?;
    settings
        .validate()
        .map_err(|reason| anyhow::anyhow!("Invalid configuration: {reason}"))?;
    telemetry::init_logging(&settings.observability.log_level)?;
    telemetry::init_metrics(settings.observability.metrics_port)?;

    info!("Starting durable scheduler node");

    let db_pool = DbPool::new(&settings.database)
        .await
        .context("Failed to initialize database pool")?;
    db_pool
        .run_migrations()
        .await
        .context("Failed to apply schema migrations")?;

    let store: Arc<dyn JobStore> = Arc::new(PostgresJobStore::new(db_pool));

    let registry = Arc::new(JobRegistry::new());
    registry.register("log_message", Arc::new(LogMessage));

    let instance = Arc::new(SchedulerInstance::new(
        SchedulerConfig::from(&settings.scheduler),
        ClusterConfig::from(&settings.cluster),
        settings.executor.max_concurrent,
        store,
        registry,
    ));
    info!(instance_id = %instance.instance_id(), "Scheduler instance created");

    let shutdown_instance = Arc::clone(&instance);
    tokio::spawn(async move {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "Failed to listen for Ctrl+C");
            return;
        }
        info!("Received Ctrl+C, initiating graceful shutdown");
        shutdown_instance.stop().await;
    });

    instance.run().await.context("Scheduler instance failed")?;

    info!("Scheduler node stopped");
    Ok(())
}
