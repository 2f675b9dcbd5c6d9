// Postgres-backed job store.
//
// Claim exclusivity rides on `FOR UPDATE SKIP LOCKED` inside a single
// UPDATE, so competing scheduler instances never receive the same trigger
// even though they poll concurrently. No advisory locks, no external lock
// service.

use crate::db::DbPool;
use crate::errors::StoreError;
use crate::models::{
    FireOutcome, FireRecord, JobDataMap, JobDetail, JobKey, Schedule, Trigger, TriggerKey,
    TriggerState,
};
use crate::store::{JobStore, TriggerRelease};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::Row;
use tracing::{debug, info, instrument};
use uuid::Uuid;

pub struct PostgresJobStore {
    pool: DbPool,
}

impl PostgresJobStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    fn job_from_row(row: &PgRow) -> Result<JobDetail, StoreError> {
        let data_json: serde_json::Value = row.try_get("job_data").map_err(StoreError::from)?;
        let data: JobDataMap = serde_json::from_value(data_json)
            .map_err(|e| StoreError::Corrupt(format!("failed to parse job_data: {e}")))?;

        Ok(JobDetail {
            key: JobKey::new(
                row.try_get::<String, _>("job_name")?,
                row.try_get::<String, _>("job_group")?,
            ),
            handler: row.try_get("handler")?,
            description: row.try_get("description")?,
            data,
            durable: row.try_get("durable")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn trigger_from_row(row: &PgRow) -> Result<Trigger, StoreError> {
        let schedule_json: serde_json::Value = row.try_get("schedule")?;
        let schedule: Schedule = serde_json::from_value(schedule_json)
            .map_err(|e| StoreError::Corrupt(format!("failed to parse schedule: {e}")))?;

        let state: TriggerState = row
            .try_get::<String, _>("state")?
            .parse()
            .map_err(StoreError::Corrupt)?;
        let misfire_policy = row
            .try_get::<String, _>("misfire_policy")?
            .parse()
            .map_err(StoreError::Corrupt)?;

        Ok(Trigger {
            key: TriggerKey::new(
                row.try_get::<String, _>("trigger_name")?,
                row.try_get::<String, _>("trigger_group")?,
            ),
            job_key: JobKey::new(
                row.try_get::<String, _>("job_name")?,
                row.try_get::<String, _>("job_group")?,
            ),
            description: row.try_get("description")?,
            schedule,
            start_time: row.try_get("start_time")?,
            end_time: row.try_get("end_time")?,
            misfire_policy,
            state,
            priority: row.try_get("priority")?,
            next_fire_time: row.try_get("next_fire_time")?,
            prev_fire_time: row.try_get("prev_fire_time")?,
            remaining_repeats: row.try_get("remaining_repeats")?,
            claimed_by: row.try_get("claimed_by")?,
            claimed_at: row.try_get("claimed_at")?,
            cancel_requested: row.try_get("cancel_requested")?,
        })
    }

    fn fire_record_from_row(row: &PgRow) -> Result<FireRecord, StoreError> {
        let outcome: FireOutcome = row
            .try_get::<String, _>("outcome")?
            .parse()
            .map_err(StoreError::Corrupt)?;

        Ok(FireRecord {
            id: row.try_get("id")?,
            trigger_key: TriggerKey::new(
                row.try_get::<String, _>("trigger_name")?,
                row.try_get::<String, _>("trigger_group")?,
            ),
            scheduled_time: row.try_get("scheduled_time")?,
            fired_at: row.try_get("fired_at")?,
            completed_at: row.try_get("completed_at")?,
            outcome,
            error: row.try_get("error")?,
            instance_id: row.try_get("instance_id")?,
        })
    }

    /// Delete a trigger row and cascade the owning job when it was the last
    /// trigger of a non-durable job.
    async fn delete_trigger_cascade(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        key: &TriggerKey,
        job_key: &JobKey,
    ) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM triggers WHERE trigger_name = $1 AND trigger_group = $2")
            .bind(&key.name)
            .bind(&key.group)
            .execute(&mut **tx)
            .await?;

        sqlx::query(
            r#"
            DELETE FROM jobs j
            WHERE j.job_name = $1 AND j.job_group = $2
              AND j.durable = FALSE
              AND NOT EXISTS (
                  SELECT 1 FROM triggers t
                  WHERE t.job_name = j.job_name AND t.job_group = j.job_group
              )
            "#,
        )
        .bind(&job_key.name)
        .bind(&job_key.group)
        .execute(&mut **tx)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    #[instrument(skip(self, job), fields(job_key = %job.key))]
    async fn put_job(&self, job: &JobDetail, replace: bool) -> Result<(), StoreError> {
        let data_json = serde_json::to_value(&job.data)
            .map_err(|e| StoreError::Corrupt(format!("failed to serialize job_data: {e}")))?;

        let query = if replace {
            r#"
            INSERT INTO jobs (job_name, job_group, handler, description, job_data, durable, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (job_name, job_group) DO UPDATE SET
                handler = EXCLUDED.handler,
                description = EXCLUDED.description,
                job_data = EXCLUDED.job_data,
                durable = EXCLUDED.durable,
                updated_at = EXCLUDED.updated_at
            "#
        } else {
            r#"
            INSERT INTO jobs (job_name, job_group, handler, description, job_data, durable, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#
        };

        sqlx::query(query)
            .bind(&job.key.name)
            .bind(&job.key.group)
            .bind(&job.handler)
            .bind(&job.description)
            .bind(data_json)
            .bind(job.durable)
            .bind(job.created_at)
            .bind(job.updated_at)
            .execute(self.pool.pool())
            .await?;

        debug!(job_key = %job.key, "Job stored");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_job(&self, key: &JobKey) -> Result<Option<JobDetail>, StoreError> {
        let row = sqlx::query("SELECT * FROM jobs WHERE job_name = $1 AND job_group = $2")
            .bind(&key.name)
            .bind(&key.group)
            .fetch_optional(self.pool.pool())
            .await?;

        row.as_ref().map(Self::job_from_row).transpose()
    }

    #[instrument(skip(self))]
    async fn remove_job(&self, key: &JobKey) -> Result<bool, StoreError> {
        let mut tx = self.pool.pool().begin().await?;

        sqlx::query("DELETE FROM triggers WHERE job_name = $1 AND job_group = $2")
            .bind(&key.name)
            .bind(&key.group)
            .execute(&mut *tx)
            .await?;

        let result = sqlx::query("DELETE FROM jobs WHERE job_name = $1 AND job_group = $2")
            .bind(&key.name)
            .bind(&key.group)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self, trigger), fields(trigger_key = %trigger.key))]
    async fn put_trigger(&self, trigger: &Trigger, replace: bool) -> Result<(), StoreError> {
        let exists = sqlx::query("SELECT 1 FROM jobs WHERE job_name = $1 AND job_group = $2")
            .bind(&trigger.job_key.name)
            .bind(&trigger.job_key.group)
            .fetch_optional(self.pool.pool())
            .await?;
        if exists.is_none() {
            return Err(StoreError::UnknownJob(trigger.job_key.clone()));
        }

        let schedule_json = serde_json::to_value(&trigger.schedule)
            .map_err(|e| StoreError::Corrupt(format!("failed to serialize schedule: {e}")))?;

        let query = if replace {
            r#"
            INSERT INTO triggers (
                trigger_name, trigger_group, job_name, job_group, description,
                schedule, start_time, end_time, misfire_policy, state, priority,
                next_fire_time, prev_fire_time, remaining_repeats,
                claimed_by, claimed_at, cancel_requested
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
            ON CONFLICT (trigger_name, trigger_group) DO UPDATE SET
                job_name = EXCLUDED.job_name,
                job_group = EXCLUDED.job_group,
                description = EXCLUDED.description,
                schedule = EXCLUDED.schedule,
                start_time = EXCLUDED.start_time,
                end_time = EXCLUDED.end_time,
                misfire_policy = EXCLUDED.misfire_policy,
                state = EXCLUDED.state,
                priority = EXCLUDED.priority,
                next_fire_time = EXCLUDED.next_fire_time,
                prev_fire_time = EXCLUDED.prev_fire_time,
                remaining_repeats = EXCLUDED.remaining_repeats,
                claimed_by = EXCLUDED.claimed_by,
                claimed_at = EXCLUDED.claimed_at,
                cancel_requested = EXCLUDED.cancel_requested
            "#
        } else {
            r#"
            INSERT INTO triggers (
                trigger_name, trigger_group, job_name, job_group, description,
                schedule, start_time, end_time, misfire_policy, state, priority,
                next_fire_time, prev_fire_time, remaining_repeats,
                claimed_by, claimed_at, cancel_requested
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
            "#
        };

        sqlx::query(query)
            .bind(&trigger.key.name)
            .bind(&trigger.key.group)
            .bind(&trigger.job_key.name)
            .bind(&trigger.job_key.group)
            .bind(&trigger.description)
            .bind(schedule_json)
            .bind(trigger.start_time)
            .bind(trigger.end_time)
            .bind(trigger.misfire_policy.as_str())
            .bind(trigger.state.as_str())
            .bind(trigger.priority)
            .bind(trigger.next_fire_time)
            .bind(trigger.prev_fire_time)
            .bind(trigger.remaining_repeats)
            .bind(&trigger.claimed_by)
            .bind(trigger.claimed_at)
            .bind(trigger.cancel_requested)
            .execute(self.pool.pool())
            .await?;

        debug!(trigger_key = %trigger.key, "Trigger stored");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_trigger(&self, key: &TriggerKey) -> Result<Option<Trigger>, StoreError> {
        let row =
            sqlx::query("SELECT * FROM triggers WHERE trigger_name = $1 AND trigger_group = $2")
                .bind(&key.name)
                .bind(&key.group)
                .fetch_optional(self.pool.pool())
                .await?;

        row.as_ref().map(Self::trigger_from_row).transpose()
    }

    #[instrument(skip(self))]
    async fn trigger_state(&self, key: &TriggerKey) -> Result<TriggerState, StoreError> {
        let row = sqlx::query(
            "SELECT state FROM triggers WHERE trigger_name = $1 AND trigger_group = $2",
        )
        .bind(&key.name)
        .bind(&key.group)
        .fetch_optional(self.pool.pool())
        .await?
        .ok_or_else(|| StoreError::UnknownTrigger(key.clone()))?;

        row.try_get::<String, _>("state")?
            .parse()
            .map_err(StoreError::Corrupt)
    }

    #[instrument(skip(self), fields(instance_id = %instance_id))]
    async fn acquire_next_triggers(
        &self,
        before: DateTime<Utc>,
        max_count: usize,
        instance_id: &str,
    ) -> Result<Vec<Trigger>, StoreError> {
        // SKIP LOCKED keeps competing claimers from blocking on each other;
        // the UPDATE makes claim and state transition one atomic step.
        let rows = sqlx::query(
            r#"
            UPDATE triggers SET state = 'acquired', claimed_by = $1, claimed_at = $2
            WHERE (trigger_name, trigger_group) IN (
                SELECT trigger_name, trigger_group FROM triggers
                WHERE state = 'waiting'
                  AND next_fire_time IS NOT NULL
                  AND next_fire_time <= $3
                ORDER BY next_fire_time ASC, priority DESC, trigger_group ASC, trigger_name ASC
                LIMIT $4
                FOR UPDATE SKIP LOCKED
            )
            RETURNING *
            "#,
        )
        .bind(instance_id)
        .bind(Utc::now())
        .bind(before)
        .bind(max_count as i64)
        .fetch_all(self.pool.pool())
        .await?;

        let mut triggers = rows
            .iter()
            .map(Self::trigger_from_row)
            .collect::<Result<Vec<_>, _>>()?;

        // RETURNING does not guarantee order; re-sort for determinism.
        triggers.sort_by(|a, b| {
            a.next_fire_time
                .cmp(&b.next_fire_time)
                .then(b.priority.cmp(&a.priority))
                .then(a.key.cmp(&b.key))
        });

        debug!(count = triggers.len(), "Triggers acquired");
        Ok(triggers)
    }

    #[instrument(skip(self))]
    async fn mark_executing(&self, key: &TriggerKey, instance_id: &str) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE triggers SET state = 'executing'
            WHERE trigger_name = $1 AND trigger_group = $2
              AND state = 'acquired' AND claimed_by = $3
            "#,
        )
        .bind(&key.name)
        .bind(&key.group)
        .bind(instance_id)
        .execute(self.pool.pool())
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!(
                "trigger {key} is not acquired by {instance_id}"
            )));
        }
        Ok(())
    }

    #[instrument(skip(self, release), fields(new_state = release.state.as_str()))]
    async fn release_trigger(
        &self,
        key: &TriggerKey,
        release: TriggerRelease,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE triggers SET
                state = $3,
                next_fire_time = $4,
                prev_fire_time = $5,
                remaining_repeats = $6,
                start_time = $7,
                claimed_by = NULL,
                claimed_at = NULL
            WHERE trigger_name = $1 AND trigger_group = $2
              AND state IN ('acquired', 'executing')
            "#,
        )
        .bind(&key.name)
        .bind(&key.group)
        .bind(release.state.as_str())
        .bind(release.next_fire_time)
        .bind(release.prev_fire_time)
        .bind(release.remaining_repeats)
        .bind(release.start_time)
        .execute(self.pool.pool())
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::UnknownTrigger(key.clone()));
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn pause_trigger(&self, key: &TriggerKey) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE triggers SET state = 'paused'
            WHERE trigger_name = $1 AND trigger_group = $2
              AND state IN ('waiting', 'blocked')
            "#,
        )
        .bind(&key.name)
        .bind(&key.group)
        .execute(self.pool.pool())
        .await?;

        if result.rows_affected() == 0 {
            // Distinguish a missing trigger from one in the wrong state.
            let state = self.trigger_state(key).await?;
            return Err(StoreError::Corrupt(format!(
                "trigger {key} cannot be paused from state {}",
                state.as_str()
            )));
        }
        info!(trigger_key = %key, "Trigger paused");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn resume_trigger(
        &self,
        key: &TriggerKey,
        next_fire_time: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        let new_state = if next_fire_time.is_some() {
            TriggerState::Waiting
        } else {
            TriggerState::Complete
        };
        let result = sqlx::query(
            r#"
            UPDATE triggers SET state = $3, next_fire_time = $4
            WHERE trigger_name = $1 AND trigger_group = $2 AND state = 'paused'
            "#,
        )
        .bind(&key.name)
        .bind(&key.group)
        .bind(new_state.as_str())
        .bind(next_fire_time)
        .execute(self.pool.pool())
        .await?;

        if result.rows_affected() == 0 {
            let state = self.trigger_state(key).await?;
            return Err(StoreError::Corrupt(format!(
                "trigger {key} cannot be resumed from state {}",
                state.as_str()
            )));
        }
        info!(trigger_key = %key, "Trigger resumed");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn unschedule_trigger(&self, key: &TriggerKey) -> Result<bool, StoreError> {
        let mut tx = self.pool.pool().begin().await?;

        let row = sqlx::query(
            r#"
            SELECT state, job_name, job_group FROM triggers
            WHERE trigger_name = $1 AND trigger_group = $2
            FOR UPDATE
            "#,
        )
        .bind(&key.name)
        .bind(&key.group)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            return Ok(false);
        };

        let state: TriggerState = row
            .try_get::<String, _>("state")?
            .parse()
            .map_err(StoreError::Corrupt)?;

        if matches!(state, TriggerState::Acquired | TriggerState::Executing) {
            // In-flight: flag for cooperative cancellation; the engine
            // removes the trigger when the fire settles.
            sqlx::query(
                r#"
                UPDATE triggers SET cancel_requested = TRUE
                WHERE trigger_name = $1 AND trigger_group = $2
                "#,
            )
            .bind(&key.name)
            .bind(&key.group)
            .execute(&mut *tx)
            .await?;
        } else {
            let job_key = JobKey::new(
                row.try_get::<String, _>("job_name")?,
                row.try_get::<String, _>("job_group")?,
            );
            Self::delete_trigger_cascade(&mut tx, key, &job_key).await?;
        }

        tx.commit().await?;
        info!(trigger_key = %key, "Trigger unscheduled");
        Ok(true)
    }

    #[instrument(skip(self))]
    async fn is_cancel_requested(&self, key: &TriggerKey) -> Result<bool, StoreError> {
        let row = sqlx::query(
            "SELECT cancel_requested FROM triggers WHERE trigger_name = $1 AND trigger_group = $2",
        )
        .bind(&key.name)
        .bind(&key.group)
        .fetch_optional(self.pool.pool())
        .await?;

        // A trigger deleted out from under an in-flight fire counts as cancelled.
        Ok(row
            .map(|r| r.try_get("cancel_requested"))
            .transpose()?
            .unwrap_or(true))
    }

    #[instrument(skip(self))]
    async fn remove_cancelled_trigger(&self, key: &TriggerKey) -> Result<(), StoreError> {
        let mut tx = self.pool.pool().begin().await?;

        let row = sqlx::query(
            r#"
            SELECT job_name, job_group FROM triggers
            WHERE trigger_name = $1 AND trigger_group = $2
            FOR UPDATE
            "#,
        )
        .bind(&key.name)
        .bind(&key.group)
        .fetch_optional(&mut *tx)
        .await?;

        if let Some(row) = row {
            let job_key = JobKey::new(
                row.try_get::<String, _>("job_name")?,
                row.try_get::<String, _>("job_group")?,
            );
            Self::delete_trigger_cascade(&mut tx, key, &job_key).await?;
        }

        tx.commit().await?;
        Ok(())
    }

    #[instrument(skip(self, record), fields(trigger_key = %record.trigger_key))]
    async fn insert_fire_record(&self, record: &FireRecord) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO fire_records (
                id, trigger_name, trigger_group, scheduled_time, fired_at,
                completed_at, outcome, error, instance_id
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(record.id)
        .bind(&record.trigger_key.name)
        .bind(&record.trigger_key.group)
        .bind(record.scheduled_time)
        .bind(record.fired_at)
        .bind(record.completed_at)
        .bind(record.outcome.as_str())
        .bind(&record.error)
        .bind(&record.instance_id)
        .execute(self.pool.pool())
        .await?;

        Ok(())
    }

    #[instrument(skip(self))]
    async fn finalize_fire_record(
        &self,
        id: Uuid,
        outcome: FireOutcome,
        error: Option<&str>,
        completed_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE fire_records SET outcome = $2, error = $3, completed_at = $4
            WHERE id = $1 AND outcome = 'in_progress'
            "#,
        )
        .bind(id)
        .bind(outcome.as_str())
        .bind(error)
        .bind(completed_at)
        .execute(self.pool.pool())
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!(
                "open fire record {id} not found"
            )));
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn fire_records_for_trigger(
        &self,
        key: &TriggerKey,
    ) -> Result<Vec<FireRecord>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM fire_records
            WHERE trigger_name = $1 AND trigger_group = $2
            ORDER BY scheduled_time ASC, fired_at ASC
            "#,
        )
        .bind(&key.name)
        .bind(&key.group)
        .fetch_all(self.pool.pool())
        .await?;

        rows.iter().map(Self::fire_record_from_row).collect()
    }

    #[instrument(skip(self))]
    async fn record_heartbeat(
        &self,
        instance_id: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO heartbeats (instance_id, last_beat)
            VALUES ($1, $2)
            ON CONFLICT (instance_id) DO UPDATE SET last_beat = EXCLUDED.last_beat
            "#,
        )
        .bind(instance_id)
        .bind(at)
        .execute(self.pool.pool())
        .await?;

        Ok(())
    }

    #[instrument(skip(self))]
    async fn recover_orphaned(&self, stale_before: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut tx = self.pool.pool().begin().await?;

        // claimed_at guards against reclaiming fresh claims from instances
        // that have not written a heartbeat yet.
        let rows = sqlx::query(
            r#"
            UPDATE triggers t
            SET state = 'waiting', claimed_by = NULL, claimed_at = NULL
            WHERE (t.trigger_name, t.trigger_group) IN (
                SELECT s.trigger_name, s.trigger_group FROM triggers s
                WHERE s.state IN ('acquired', 'executing')
                  AND s.claimed_at < $1
                  AND NOT EXISTS (
                      SELECT 1 FROM heartbeats h
                      WHERE h.instance_id = s.claimed_by AND h.last_beat >= $1
                  )
                FOR UPDATE SKIP LOCKED
            )
            RETURNING t.trigger_name, t.trigger_group
            "#,
        )
        .bind(stale_before)
        .fetch_all(&mut *tx)
        .await?;

        for row in &rows {
            let name: String = row.try_get("trigger_name")?;
            let group: String = row.try_get("trigger_group")?;
            sqlx::query(
                r#"
                UPDATE fire_records
                SET outcome = 'failure', error = 'scheduler instance lost', completed_at = $3
                WHERE trigger_name = $1 AND trigger_group = $2 AND outcome = 'in_progress'
                "#,
            )
            .bind(&name)
            .bind(&group)
            .bind(Utc::now())
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        let recovered = rows.len() as u64;
        if recovered > 0 {
            info!(recovered, "Orphaned triggers reset to waiting");
        }
        Ok(recovered)
    }
}
