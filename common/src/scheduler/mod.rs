// Scheduler facade: one instance per process, wiring the dispatch engine,
// the executor pool and the cluster membership loop over a shared store.

pub mod engine;
pub mod misfire;

pub use engine::{SchedulerConfig, SchedulerEngine};
pub use misfire::{resolve_misfire, MisfireAction, SMART_FIRE_NOW_MAX_REMAINING};

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::cluster::{generate_instance_id, ClusterConfig, ClusterMembership};
use crate::errors::SchedulerError;
use crate::executor::{Executor, JobRegistry};
use crate::models::{FireRecord, JobSpec, TriggerKey, TriggerSpec, TriggerState};
use crate::store::JobStore;

/// How long `stop` waits for in-flight job bodies before giving up.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// A running scheduler node: submission API plus the background loops.
pub struct SchedulerInstance {
    engine: Arc<SchedulerEngine>,
    cluster: Arc<ClusterMembership>,
}

impl SchedulerInstance {
    pub fn new(
        scheduler: SchedulerConfig,
        cluster: ClusterConfig,
        max_concurrent_jobs: usize,
        store: Arc<dyn JobStore>,
        registry: Arc<JobRegistry>,
    ) -> Self {
        let instance_id = generate_instance_id();
        let executor = Arc::new(Executor::new(max_concurrent_jobs));
        let engine = Arc::new(SchedulerEngine::new(
            scheduler,
            instance_id.clone(),
            Arc::clone(&store),
            registry,
            executor,
        ));
        let cluster = Arc::new(ClusterMembership::new(cluster, instance_id, store));
        Self { engine, cluster }
    }

    pub fn instance_id(&self) -> &str {
        self.engine.instance_id()
    }

    /// Recover stranded work, start the membership loop and run the
    /// dispatch loop until `stop` is called.
    pub async fn run(&self) -> Result<(), SchedulerError> {
        self.cluster.recover_on_startup().await?;

        let membership = Arc::clone(&self.cluster);
        let shutdown = self.engine.subscribe_shutdown();
        tokio::spawn(membership.run(shutdown));

        info!(instance_id = %self.instance_id(), "Scheduler instance started");
        Arc::clone(&self.engine).run().await;
        Ok(())
    }

    /// Signal both loops to stop and drain in-flight job bodies.
    pub async fn stop(&self) {
        self.engine.stop(DRAIN_TIMEOUT).await;
        info!(instance_id = %self.instance_id(), "Scheduler instance stopped");
    }

    pub async fn submit(
        &self,
        job: JobSpec,
        trigger: TriggerSpec,
    ) -> Result<TriggerKey, SchedulerError> {
        self.engine.submit(job, trigger).await
    }

    pub async fn pause(&self, key: &TriggerKey) -> Result<(), SchedulerError> {
        self.engine.pause(key).await
    }

    pub async fn resume(&self, key: &TriggerKey) -> Result<(), SchedulerError> {
        self.engine.resume(key).await
    }

    pub async fn unschedule(&self, key: &TriggerKey) -> Result<bool, SchedulerError> {
        self.engine.unschedule(key).await
    }

    pub async fn status(&self, key: &TriggerKey) -> Result<TriggerState, SchedulerError> {
        self.engine.status(key).await
    }

    pub async fn fire_records(
        &self,
        key: &TriggerKey,
    ) -> Result<Vec<FireRecord>, SchedulerError> {
        self.engine.fire_records(key).await
    }
}
