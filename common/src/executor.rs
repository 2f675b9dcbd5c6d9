// Executor: runs job bodies under a bounded worker pool.
//
// Job bodies are polymorphic over `JobHandler`; the registry maps the
// handler name persisted with a job to the body supplied by the embedding
// application. Cancellation is cooperative: bodies poll a flag, nothing is
// forcibly killed.

use crate::models::{JobDataMap, JobKey, TriggerKey};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Result of one job body run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Success,
    Failure(String),
    /// The body declined to run; the trigger still advances.
    Vetoed,
}

/// Cooperative cancellation flag shared between the scheduler and a
/// running job body.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Everything a job body sees about the fire that invoked it.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub job_key: JobKey,
    pub trigger_key: TriggerKey,
    pub data: JobDataMap,
    pub scheduled_time: DateTime<Utc>,
    pub fire_time: DateTime<Utc>,
    cancel: CancelFlag,
}

impl JobContext {
    pub fn new(
        job_key: JobKey,
        trigger_key: TriggerKey,
        data: JobDataMap,
        scheduled_time: DateTime<Utc>,
        fire_time: DateTime<Utc>,
        cancel: CancelFlag,
    ) -> Self {
        Self {
            job_key,
            trigger_key,
            data,
            scheduled_time,
            fire_time,
            cancel,
        }
    }

    /// Long-running bodies should poll this and wind down when set.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// A job body. Implementations are registered by name and shared across
/// every fire of the jobs referencing them.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn execute(&self, ctx: JobContext) -> JobOutcome;
}

/// Handler name -> job body.
#[derive(Default)]
pub struct JobRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn JobHandler>>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: impl Into<String>, handler: Arc<dyn JobHandler>) {
        self.handlers
            .write()
            .expect("job registry lock poisoned")
            .insert(name.into(), handler);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers
            .read()
            .expect("job registry lock poisoned")
            .get(name)
            .cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers
            .read()
            .expect("job registry lock poisoned")
            .contains_key(name)
    }
}

/// Bounded worker pool over spawned tasks.
pub struct Executor {
    semaphore: Arc<Semaphore>,
    running: Arc<RwLock<HashMap<TriggerKey, CancelFlag>>>,
}

impl Executor {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            running: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Wait for a worker slot. The dispatch loop awaits this before
    /// spawning so acquisition backpressures claiming.
    pub async fn acquire_slot(&self) -> OwnedSemaphorePermit {
        // The semaphore is never closed while the executor is alive.
        self.semaphore
            .clone()
            .acquire_owned()
            .await
            .expect("executor semaphore closed")
    }

    /// Run one job body on the pool, holding `permit` for its duration.
    /// Panics inside the body are caught and reported as failures.
    pub fn spawn(
        &self,
        handler: Arc<dyn JobHandler>,
        ctx: JobContext,
        permit: OwnedSemaphorePermit,
    ) -> JoinHandle<JobOutcome> {
        let trigger_key = ctx.trigger_key.clone();
        let cancel = ctx.cancel.clone();
        self.running
            .write()
            .expect("executor running map poisoned")
            .insert(trigger_key.clone(), cancel);

        let running = Arc::clone(&self.running);
        tokio::spawn(async move {
            let outcome = match AssertUnwindSafe(handler.execute(ctx)).catch_unwind().await {
                Ok(outcome) => outcome,
                Err(_) => {
                    warn!(trigger_key = %trigger_key, "Job body panicked");
                    JobOutcome::Failure("job body panicked".to_string())
                }
            };
            running
                .write()
                .expect("executor running map poisoned")
                .remove(&trigger_key);
            drop(permit);
            debug!(trigger_key = %trigger_key, ?outcome, "Job body finished");
            outcome
        })
    }

    /// Flag an in-flight fire for cooperative cancellation.
    /// Returns whether anything was running for the trigger.
    pub fn request_cancel(&self, key: &TriggerKey) -> bool {
        if let Some(flag) = self
            .running
            .read()
            .expect("executor running map poisoned")
            .get(key)
        {
            flag.request();
            true
        } else {
            false
        }
    }

    pub fn running_count(&self) -> usize {
        self.running
            .read()
            .expect("executor running map poisoned")
            .len()
    }

    /// Number of free worker slots.
    pub fn available_slots(&self) -> usize {
        self.semaphore.available_permits()
    }
}
