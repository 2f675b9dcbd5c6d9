// Cluster membership: heartbeats and orphan recovery.
//
// There is no leader. Every instance heartbeats its liveness row and every
// instance sweeps for triggers claimed by peers whose heartbeat went stale;
// the store makes the sweep safe to run concurrently. Recovered triggers go
// back to waiting and the normal misfire handling decides what happens to
// them on the next poll.

use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use metrics::counter;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::ClusterSettings;
use crate::errors::StoreError;
use crate::store::JobStore;

#[derive(Debug, Clone)]
pub struct ClusterConfig {
    pub heartbeat_interval: Duration,
    /// An instance whose heartbeat is older than this is presumed dead and
    /// its claims are up for recovery. Must comfortably exceed the
    /// heartbeat interval.
    pub stale_after_seconds: u64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(10),
            stale_after_seconds: 60,
        }
    }
}

impl From<&ClusterSettings> for ClusterConfig {
    fn from(settings: &ClusterSettings) -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(settings.heartbeat_interval_seconds),
            stale_after_seconds: settings.stale_after_seconds,
        }
    }
}

/// Identity for this process, unique across restarts so a rebooted host
/// never inherits its previous incarnation's claims.
pub fn generate_instance_id() -> String {
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "node".to_string());
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{host}-{}", &suffix[..8])
}

pub struct ClusterMembership {
    config: ClusterConfig,
    instance_id: String,
    store: Arc<dyn JobStore>,
}

impl ClusterMembership {
    pub fn new(
        config: ClusterConfig,
        instance_id: impl Into<String>,
        store: Arc<dyn JobStore>,
    ) -> Self {
        Self {
            config,
            instance_id: instance_id.into(),
            store,
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    fn stale_cutoff(&self, now: chrono::DateTime<Utc>) -> chrono::DateTime<Utc> {
        now - ChronoDuration::seconds(self.config.stale_after_seconds as i64)
    }

    /// One-shot sweep run before the dispatch loop starts, so work stranded
    /// by a previous incarnation of this node is released immediately.
    pub async fn recover_on_startup(&self) -> Result<u64, StoreError> {
        let recovered = self.store.recover_orphaned(self.stale_cutoff(Utc::now())).await?;
        if recovered > 0 {
            warn!(recovered, "Recovered orphaned triggers on startup");
            counter!("scheduler_orphans_recovered_total").increment(recovered);
        }
        Ok(recovered)
    }

    /// Heartbeat-and-sweep loop; runs until the engine signals shutdown.
    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = tokio::time::interval(self.config.heartbeat_interval);
        info!(instance_id = %self.instance_id, "Cluster membership loop started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let now = Utc::now();
                    if let Err(err) = self.store.record_heartbeat(&self.instance_id, now).await {
                        // Missing a beat is survivable as long as we catch
                        // up before the staleness window closes.
                        warn!(error = %err, "Failed to record heartbeat");
                        continue;
                    }
                    debug!(instance_id = %self.instance_id, "Heartbeat recorded");

                    match self.store.recover_orphaned(self.stale_cutoff(now)).await {
                        Ok(0) => {}
                        Ok(recovered) => {
                            warn!(recovered, "Recovered triggers from stale instances");
                            counter!("scheduler_orphans_recovered_total").increment(recovered);
                        }
                        Err(err) => warn!(error = %err, "Orphan recovery sweep failed"),
                    }
                }
                _ = shutdown.recv() => {
                    info!(instance_id = %self.instance_id, "Cluster membership loop stopping");
                    break;
                }
            }
        }
    }
}
