// In-memory job store.
//
// Backs tests and single-process embeddings. One async mutex around the
// whole state gives the same claim atomicity the Postgres store gets from
// row locks; callers on other tasks behave exactly like cluster members.

use crate::errors::StoreError;
use crate::models::{
    FireOutcome, FireRecord, JobDetail, JobKey, Trigger, TriggerKey, TriggerState,
};
use crate::store::{JobStore, TriggerRelease};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Default)]
struct Inner {
    jobs: HashMap<JobKey, JobDetail>,
    triggers: HashMap<TriggerKey, Trigger>,
    fire_records: Vec<FireRecord>,
    heartbeats: HashMap<String, DateTime<Utc>>,
}

impl Inner {
    fn delete_trigger_cascade(&mut self, key: &TriggerKey) {
        if let Some(trigger) = self.triggers.remove(key) {
            let job_key = trigger.job_key;
            let has_more = self.triggers.values().any(|t| t.job_key == job_key);
            if !has_more {
                if let Some(job) = self.jobs.get(&job_key) {
                    if !job.durable {
                        self.jobs.remove(&job_key);
                    }
                }
            }
        }
    }
}

#[derive(Default)]
pub struct MemoryJobStore {
    inner: Mutex<Inner>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn put_job(&self, job: &JobDetail, replace: bool) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        if !replace && inner.jobs.contains_key(&job.key) {
            return Err(StoreError::DuplicateKey(job.key.to_string()));
        }
        inner.jobs.insert(job.key.clone(), job.clone());
        Ok(())
    }

    async fn get_job(&self, key: &JobKey) -> Result<Option<JobDetail>, StoreError> {
        Ok(self.inner.lock().await.jobs.get(key).cloned())
    }

    async fn remove_job(&self, key: &JobKey) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().await;
        inner.triggers.retain(|_, t| &t.job_key != key);
        Ok(inner.jobs.remove(key).is_some())
    }

    async fn put_trigger(&self, trigger: &Trigger, replace: bool) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        if !inner.jobs.contains_key(&trigger.job_key) {
            return Err(StoreError::UnknownJob(trigger.job_key.clone()));
        }
        if !replace && inner.triggers.contains_key(&trigger.key) {
            return Err(StoreError::DuplicateKey(trigger.key.to_string()));
        }
        inner.triggers.insert(trigger.key.clone(), trigger.clone());
        Ok(())
    }

    async fn get_trigger(&self, key: &TriggerKey) -> Result<Option<Trigger>, StoreError> {
        Ok(self.inner.lock().await.triggers.get(key).cloned())
    }

    async fn trigger_state(&self, key: &TriggerKey) -> Result<TriggerState, StoreError> {
        self.inner
            .lock()
            .await
            .triggers
            .get(key)
            .map(|t| t.state)
            .ok_or_else(|| StoreError::UnknownTrigger(key.clone()))
    }

    async fn acquire_next_triggers(
        &self,
        before: DateTime<Utc>,
        max_count: usize,
        instance_id: &str,
    ) -> Result<Vec<Trigger>, StoreError> {
        let mut inner = self.inner.lock().await;

        let mut due: Vec<TriggerKey> = inner
            .triggers
            .values()
            .filter(|t| {
                t.state == TriggerState::Waiting
                    && t.next_fire_time.map_or(false, |nft| nft <= before)
            })
            .map(|t| t.key.clone())
            .collect();

        due.sort_by(|a, b| {
            let ta = &inner.triggers[a];
            let tb = &inner.triggers[b];
            ta.next_fire_time
                .cmp(&tb.next_fire_time)
                .then(tb.priority.cmp(&ta.priority))
                .then(a.cmp(b))
        });
        due.truncate(max_count);

        let now = Utc::now();
        let mut acquired = Vec::with_capacity(due.len());
        for key in due {
            if let Some(trigger) = inner.triggers.get_mut(&key) {
                trigger.state = TriggerState::Acquired;
                trigger.claimed_by = Some(instance_id.to_string());
                trigger.claimed_at = Some(now);
                acquired.push(trigger.clone());
            }
        }
        Ok(acquired)
    }

    async fn mark_executing(&self, key: &TriggerKey, instance_id: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let trigger = inner
            .triggers
            .get_mut(key)
            .ok_or_else(|| StoreError::UnknownTrigger(key.clone()))?;
        if trigger.state != TriggerState::Acquired
            || trigger.claimed_by.as_deref() != Some(instance_id)
        {
            return Err(StoreError::NotFound(format!(
                "trigger {key} is not acquired by {instance_id}"
            )));
        }
        trigger.state = TriggerState::Executing;
        Ok(())
    }

    async fn release_trigger(
        &self,
        key: &TriggerKey,
        release: TriggerRelease,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let trigger = inner
            .triggers
            .get_mut(key)
            .ok_or_else(|| StoreError::UnknownTrigger(key.clone()))?;
        if !matches!(
            trigger.state,
            TriggerState::Acquired | TriggerState::Executing
        ) {
            return Err(StoreError::UnknownTrigger(key.clone()));
        }
        trigger.state = release.state;
        trigger.next_fire_time = release.next_fire_time;
        trigger.prev_fire_time = release.prev_fire_time;
        trigger.remaining_repeats = release.remaining_repeats;
        trigger.start_time = release.start_time;
        trigger.claimed_by = None;
        trigger.claimed_at = None;
        Ok(())
    }

    async fn pause_trigger(&self, key: &TriggerKey) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let trigger = inner
            .triggers
            .get_mut(key)
            .ok_or_else(|| StoreError::UnknownTrigger(key.clone()))?;
        if !matches!(trigger.state, TriggerState::Waiting | TriggerState::Blocked) {
            return Err(StoreError::Corrupt(format!(
                "trigger {key} cannot be paused from state {}",
                trigger.state.as_str()
            )));
        }
        trigger.state = TriggerState::Paused;
        Ok(())
    }

    async fn resume_trigger(
        &self,
        key: &TriggerKey,
        next_fire_time: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let trigger = inner
            .triggers
            .get_mut(key)
            .ok_or_else(|| StoreError::UnknownTrigger(key.clone()))?;
        if trigger.state != TriggerState::Paused {
            return Err(StoreError::Corrupt(format!(
                "trigger {key} cannot be resumed from state {}",
                trigger.state.as_str()
            )));
        }
        trigger.state = if next_fire_time.is_some() {
            TriggerState::Waiting
        } else {
            TriggerState::Complete
        };
        trigger.next_fire_time = next_fire_time;
        Ok(())
    }

    async fn unschedule_trigger(&self, key: &TriggerKey) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().await;
        let Some(trigger) = inner.triggers.get_mut(key) else {
            return Ok(false);
        };
        if matches!(
            trigger.state,
            TriggerState::Acquired | TriggerState::Executing
        ) {
            trigger.cancel_requested = true;
        } else {
            inner.delete_trigger_cascade(key);
        }
        Ok(true)
    }

    async fn is_cancel_requested(&self, key: &TriggerKey) -> Result<bool, StoreError> {
        Ok(self
            .inner
            .lock()
            .await
            .triggers
            .get(key)
            .map_or(true, |t| t.cancel_requested))
    }

    async fn remove_cancelled_trigger(&self, key: &TriggerKey) -> Result<(), StoreError> {
        self.inner.lock().await.delete_trigger_cascade(key);
        Ok(())
    }

    async fn insert_fire_record(&self, record: &FireRecord) -> Result<(), StoreError> {
        self.inner.lock().await.fire_records.push(record.clone());
        Ok(())
    }

    async fn finalize_fire_record(
        &self,
        id: Uuid,
        outcome: FireOutcome,
        error: Option<&str>,
        completed_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let record = inner
            .fire_records
            .iter_mut()
            .find(|r| r.id == id && r.outcome == FireOutcome::InProgress)
            .ok_or_else(|| StoreError::NotFound(format!("open fire record {id} not found")))?;
        record.outcome = outcome;
        record.error = error.map(str::to_string);
        record.completed_at = Some(completed_at);
        Ok(())
    }

    async fn fire_records_for_trigger(
        &self,
        key: &TriggerKey,
    ) -> Result<Vec<FireRecord>, StoreError> {
        let inner = self.inner.lock().await;
        let mut records: Vec<FireRecord> = inner
            .fire_records
            .iter()
            .filter(|r| &r.trigger_key == key)
            .cloned()
            .collect();
        records.sort_by_key(|r| (r.scheduled_time, r.fired_at));
        Ok(records)
    }

    async fn record_heartbeat(
        &self,
        instance_id: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.inner
            .lock()
            .await
            .heartbeats
            .insert(instance_id.to_string(), at);
        Ok(())
    }

    async fn recover_orphaned(&self, stale_before: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock().await;

        let orphaned: Vec<TriggerKey> = inner
            .triggers
            .values()
            .filter(|t| {
                matches!(t.state, TriggerState::Acquired | TriggerState::Executing)
                    && t.claimed_at.map_or(false, |at| at < stale_before)
                    && !t
                        .claimed_by
                        .as_ref()
                        .and_then(|id| inner.heartbeats.get(id))
                        .map_or(false, |beat| *beat >= stale_before)
            })
            .map(|t| t.key.clone())
            .collect();

        for key in &orphaned {
            if let Some(trigger) = inner.triggers.get_mut(key) {
                trigger.state = TriggerState::Waiting;
                trigger.claimed_by = None;
                trigger.claimed_at = None;
            }
            let now = Utc::now();
            for record in inner
                .fire_records
                .iter_mut()
                .filter(|r| &r.trigger_key == key && r.outcome == FireOutcome::InProgress)
            {
                record.outcome = FireOutcome::Failure;
                record.error = Some("scheduler instance lost".to_string());
                record.completed_at = Some(now);
            }
        }

        Ok(orphaned.len() as u64)
    }
}
