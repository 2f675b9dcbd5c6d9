// Job store: durable repository of jobs, triggers and fire state.
//
// The store exclusively owns persisted scheduling state. Every mutation of
// trigger state passes through these operations; no component is allowed to
// read-modify-write outside them. Claim exclusivity across cluster members
// is a store capability, not an in-process lock.

pub mod memory;
pub mod postgres;

use crate::errors::StoreError;
use crate::models::{
    FireOutcome, FireRecord, JobDetail, JobKey, Trigger, TriggerKey, TriggerState,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

pub use memory::MemoryJobStore;
pub use postgres::PostgresJobStore;

/// New scheduling position written when a trigger leaves its fire cycle.
#[derive(Debug, Clone)]
pub struct TriggerRelease {
    pub state: TriggerState,
    pub next_fire_time: Option<DateTime<Utc>>,
    pub prev_fire_time: Option<DateTime<Utc>>,
    pub remaining_repeats: i32,
    /// Misfire policies that fire "from now" re-anchor the schedule here.
    pub start_time: DateTime<Utc>,
}

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert or replace a job definition.
    /// Fails with `DuplicateKey` when the job exists and `replace` is false.
    async fn put_job(&self, job: &JobDetail, replace: bool) -> Result<(), StoreError>;

    async fn get_job(&self, key: &JobKey) -> Result<Option<JobDetail>, StoreError>;

    /// Remove a job and all of its triggers. Returns whether it existed.
    async fn remove_job(&self, key: &JobKey) -> Result<bool, StoreError>;

    /// Insert or replace a trigger.
    /// Fails with `UnknownJob` when the owning job is absent and with
    /// `DuplicateKey` when the trigger exists and `replace` is false.
    async fn put_trigger(&self, trigger: &Trigger, replace: bool) -> Result<(), StoreError>;

    async fn get_trigger(&self, key: &TriggerKey) -> Result<Option<Trigger>, StoreError>;

    async fn trigger_state(&self, key: &TriggerKey) -> Result<TriggerState, StoreError>;

    /// Atomically claim up to `max_count` waiting triggers due at or before
    /// `before`, moving them to `acquired` tagged with `instance_id`.
    ///
    /// Ordered by next fire time ascending, priority descending, trigger key
    /// lexicographic. Exclusive across concurrent callers: no trigger is
    /// ever returned to two of them.
    async fn acquire_next_triggers(
        &self,
        before: DateTime<Utc>,
        max_count: usize,
        instance_id: &str,
    ) -> Result<Vec<Trigger>, StoreError>;

    /// Move an acquired trigger to `executing`, keeping the claim tag.
    async fn mark_executing(&self, key: &TriggerKey, instance_id: &str) -> Result<(), StoreError>;

    /// Transition out of acquired/executing and persist the recomputed
    /// scheduling position.
    async fn release_trigger(
        &self,
        key: &TriggerKey,
        release: TriggerRelease,
    ) -> Result<(), StoreError>;

    /// Pause a waiting trigger; it is skipped by claims until resumed.
    async fn pause_trigger(&self, key: &TriggerKey) -> Result<(), StoreError>;

    /// Resume a paused trigger with a freshly computed next fire time.
    async fn resume_trigger(
        &self,
        key: &TriggerKey,
        next_fire_time: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError>;

    /// Remove a trigger. An in-flight trigger (acquired/executing) is marked
    /// for cancellation instead and removed when its fire settles. The
    /// owning job cascades away with its last trigger unless durable.
    /// Returns whether the trigger existed.
    async fn unschedule_trigger(&self, key: &TriggerKey) -> Result<bool, StoreError>;

    /// Whether an unschedule request is pending for this trigger.
    async fn is_cancel_requested(&self, key: &TriggerKey) -> Result<bool, StoreError>;

    /// Drop a trigger that was pending cancellation, cascading the owning
    /// job if non-durable.
    async fn remove_cancelled_trigger(&self, key: &TriggerKey) -> Result<(), StoreError>;

    async fn insert_fire_record(&self, record: &FireRecord) -> Result<(), StoreError>;

    async fn finalize_fire_record(
        &self,
        id: Uuid,
        outcome: FireOutcome,
        error: Option<&str>,
        completed_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    async fn fire_records_for_trigger(
        &self,
        key: &TriggerKey,
    ) -> Result<Vec<FireRecord>, StoreError>;

    /// Refresh this instance's liveness row.
    async fn record_heartbeat(&self, instance_id: &str, at: DateTime<Utc>)
        -> Result<(), StoreError>;

    /// Reset triggers claimed by instances whose heartbeat is older than
    /// `stale_before` back to `waiting` and fail their dangling fire
    /// records. Returns the number of triggers recovered; the regular
    /// misfire handling re-evaluates them on the next poll.
    async fn recover_orphaned(&self, stale_before: DateTime<Utc>) -> Result<u64, StoreError>;
}
