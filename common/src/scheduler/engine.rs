// Dispatch engine: the poll -> claim -> dispatch -> settle cycle.
//
// Each cycle claims due triggers through the store (which guarantees
// cluster-wide exclusivity), resolves misfires, hands job bodies to the
// executor and, once a body finishes, settles the trigger back to waiting
// or complete with a freshly computed fire time. Transient store errors
// are retried with capped exponential backoff; caller errors surface
// immediately.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use metrics::{counter, gauge, histogram};
use rand::Rng;
use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::config::SchedulerSettings;
use crate::errors::{ExecutionError, ScheduleError, SchedulerError, StoreError};
use crate::executor::{CancelFlag, Executor, JobContext, JobOutcome, JobRegistry};
use crate::models::{
    FireOutcome, FireRecord, JobDetail, JobSpec, Trigger, TriggerKey, TriggerSpec, TriggerState,
};
use crate::retry::{ExponentialBackoff, RetryStrategy};
use crate::schedule::{validate_schedule, FireTimeEvaluator};
use crate::scheduler::misfire::{resolve_misfire, MisfireAction};
use crate::store::{JobStore, TriggerRelease};

/// Tuning knobs for the dispatch loop.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub poll_interval: Duration,
    /// Random delay added to each poll so cluster members do not contend
    /// on the same instant.
    pub poll_jitter_ms: u64,
    pub max_triggers_per_poll: usize,
    /// A trigger further past its fire time than this is a misfire.
    pub misfire_threshold_seconds: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            poll_jitter_ms: 500,
            max_triggers_per_poll: 20,
            misfire_threshold_seconds: 60,
        }
    }
}

impl From<&SchedulerSettings> for SchedulerConfig {
    fn from(settings: &SchedulerSettings) -> Self {
        Self {
            poll_interval: Duration::from_secs(settings.poll_interval_seconds),
            poll_jitter_ms: settings.poll_jitter_ms,
            max_triggers_per_poll: settings.max_triggers_per_poll,
            misfire_threshold_seconds: settings.misfire_threshold_seconds,
        }
    }
}

pub struct SchedulerEngine {
    config: SchedulerConfig,
    instance_id: String,
    store: Arc<dyn JobStore>,
    registry: Arc<JobRegistry>,
    executor: Arc<Executor>,
    backoff: ExponentialBackoff,
    shutdown: broadcast::Sender<()>,
}

impl SchedulerEngine {
    pub fn new(
        config: SchedulerConfig,
        instance_id: impl Into<String>,
        store: Arc<dyn JobStore>,
        registry: Arc<JobRegistry>,
        executor: Arc<Executor>,
    ) -> Self {
        let (shutdown, _) = broadcast::channel(1);
        Self {
            config,
            instance_id: instance_id.into(),
            store,
            registry,
            executor,
            backoff: ExponentialBackoff::new(),
            shutdown,
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Receiver resolving when `stop` is called; shared with the cluster
    /// membership loop so both wind down together.
    pub fn subscribe_shutdown(&self) -> broadcast::Receiver<()> {
        self.shutdown.subscribe()
    }

    // ------------------------------------------------------------------
    // Submission API
    // ------------------------------------------------------------------

    /// Persist a job and its trigger, computing the first fire time.
    ///
    /// The trigger key is generated when the spec does not name one. Fails
    /// with `DuplicateKey` when the job or trigger already exists, and with
    /// an invalid-configuration error when the schedule can never fire
    /// (for example an end time before the first occurrence).
    #[instrument(skip(self, job, trigger), fields(job_key = %job.key))]
    pub async fn submit(
        &self,
        job: JobSpec,
        trigger: TriggerSpec,
    ) -> Result<TriggerKey, SchedulerError> {
        validate_schedule(&trigger.schedule)?;

        let now = Utc::now();
        let key = trigger
            .key
            .clone()
            .unwrap_or_else(|| TriggerKey::of(Uuid::new_v4().to_string()));
        let start = trigger.start_time.unwrap_or(now);

        // One second back so a first fire exactly at the start time counts.
        let first_fire = trigger
            .schedule
            .next_fire_time(start, start - ChronoDuration::seconds(1))?
            .filter(|t| trigger.end_time.map_or(true, |end| *t <= end))
            .ok_or_else(|| {
                ScheduleError::InvalidConfiguration(
                    "trigger would never fire within its start/end window".to_string(),
                )
            })?;

        let detail = JobDetail {
            key: job.key.clone(),
            handler: job.handler,
            description: job.description,
            data: job.data,
            durable: job.durable,
            created_at: now,
            updated_at: now,
        };
        self.store.put_job(&detail, false).await?;

        let row = Trigger {
            key: key.clone(),
            job_key: detail.key,
            description: trigger.description,
            schedule: trigger.schedule.clone(),
            start_time: start,
            end_time: trigger.end_time,
            misfire_policy: trigger.misfire_policy,
            state: TriggerState::Waiting,
            priority: trigger.priority,
            next_fire_time: Some(first_fire),
            prev_fire_time: None,
            remaining_repeats: trigger.schedule.initial_repeats(),
            claimed_by: None,
            claimed_at: None,
            cancel_requested: false,
        };
        if let Err(err) = self.store.put_trigger(&row, false).await {
            // The job row above belongs to this submit; take it back out so
            // a failed submit leaves no triggerless job behind.
            if let Err(cleanup) = self.store.remove_job(&row.job_key).await {
                warn!(
                    job_key = %row.job_key,
                    error = %cleanup,
                    "Failed to remove job after trigger insert failed"
                );
            }
            return Err(err.into());
        }

        counter!("scheduler_triggers_submitted_total").increment(1);
        info!(trigger_key = %key, next_fire_time = %first_fire, "Trigger scheduled");
        Ok(key)
    }

    /// Pause a waiting trigger; the claim query skips paused triggers.
    pub async fn pause(&self, key: &TriggerKey) -> Result<(), SchedulerError> {
        self.store.pause_trigger(key).await?;
        info!(trigger_key = %key, "Trigger paused");
        Ok(())
    }

    /// Resume a paused trigger. The next fire time is recomputed from now,
    /// so occurrences that fell inside the pause are not replayed.
    pub async fn resume(&self, key: &TriggerKey) -> Result<(), SchedulerError> {
        let trigger = self
            .store
            .get_trigger(key)
            .await?
            .ok_or_else(|| StoreError::UnknownTrigger(key.clone()))?;
        let next = if trigger.remaining_repeats == 0 {
            None
        } else {
            trigger.next_fire_after(Utc::now())?
        };
        self.store.resume_trigger(key, next).await?;
        info!(trigger_key = %key, "Trigger resumed");
        Ok(())
    }

    /// Remove a trigger. An in-flight fire is flagged for cooperative
    /// cancellation and the trigger is dropped when it settles; the owning
    /// job cascades away with its last trigger unless durable. Returns
    /// whether the trigger existed.
    pub async fn unschedule(&self, key: &TriggerKey) -> Result<bool, SchedulerError> {
        let existed = self.store.unschedule_trigger(key).await?;
        if existed && self.executor.request_cancel(key) {
            info!(trigger_key = %key, "Cancellation requested for in-flight trigger");
        }
        Ok(existed)
    }

    pub async fn status(&self, key: &TriggerKey) -> Result<TriggerState, SchedulerError> {
        Ok(self.store.trigger_state(key).await?)
    }

    /// Execution history for a trigger, newest first.
    pub async fn fire_records(
        &self,
        key: &TriggerKey,
    ) -> Result<Vec<FireRecord>, SchedulerError> {
        Ok(self.store.fire_records_for_trigger(key).await?)
    }

    // ------------------------------------------------------------------
    // Poll loop
    // ------------------------------------------------------------------

    /// Run the dispatch loop until `stop` is called.
    pub async fn run(self: Arc<Self>) {
        let mut shutdown_rx = self.shutdown.subscribe();
        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(instance_id = %self.instance_id, "Dispatch loop started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if self.config.poll_jitter_ms > 0 {
                        let jitter = rand::thread_rng().gen_range(0..=self.config.poll_jitter_ms);
                        tokio::time::sleep(Duration::from_millis(jitter)).await;
                    }
                    let started = Instant::now();
                    match Arc::clone(&self).poll_once().await {
                        Ok(0) => {}
                        Ok(claimed) => debug!(claimed, "Poll cycle dispatched triggers"),
                        Err(err) => error!(error = %err, "Poll cycle failed"),
                    }
                    histogram!("scheduler_poll_duration_seconds")
                        .record(started.elapsed().as_secs_f64());
                    gauge!("scheduler_running_jobs").set(self.executor.running_count() as f64);
                }
                _ = shutdown_rx.recv() => {
                    info!(instance_id = %self.instance_id, "Dispatch loop stopping");
                    break;
                }
            }
        }
    }

    /// Signal shutdown and wait for in-flight job bodies to drain.
    pub async fn stop(&self, drain_timeout: Duration) {
        let _ = self.shutdown.send(());
        let deadline = Instant::now() + drain_timeout;
        while self.executor.running_count() > 0 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        let still_running = self.executor.running_count();
        if still_running > 0 {
            warn!(still_running, "Shutdown drain timed out with jobs in flight");
        }
    }

    /// One claim-and-dispatch cycle. Returns the number of triggers claimed.
    async fn poll_once(self: Arc<Self>) -> Result<usize, StoreError> {
        let now = Utc::now();
        let triggers = self
            .with_retry("acquire_next_triggers", || {
                self.store.acquire_next_triggers(
                    now,
                    self.config.max_triggers_per_poll,
                    &self.instance_id,
                )
            })
            .await?;
        let claimed = triggers.len();

        for trigger in triggers {
            let key = trigger.key.clone();
            if let Err(err) = Arc::clone(&self).dispatch(trigger).await {
                // One bad trigger must not stall the rest of the batch.
                error!(trigger_key = %key, error = %err, "Failed to dispatch trigger");
            }
        }
        Ok(claimed)
    }

    /// Misfire-check one claimed trigger and hand its job body to the
    /// executor. Settling happens in a detached task once the body returns.
    #[instrument(skip(self, trigger), fields(trigger_key = %trigger.key))]
    async fn dispatch(self: Arc<Self>, trigger: Trigger) -> Result<(), StoreError> {
        let key = trigger.key.clone();

        // Unscheduled while waiting: drop it instead of firing.
        if trigger.cancel_requested {
            self.store.remove_cancelled_trigger(&key).await?;
            debug!(trigger_key = %key, "Dropped trigger pending cancellation");
            return Ok(());
        }

        let Some(scheduled) = trigger.next_fire_time else {
            warn!(trigger_key = %key, "Claimed trigger has no fire time");
            return self.park_in_error(&trigger, trigger.remaining_repeats).await;
        };

        let now = Utc::now();
        let mut remaining = trigger.remaining_repeats;
        let mut reanchor = false;

        let overdue = now.signed_duration_since(scheduled);
        if overdue > ChronoDuration::seconds(self.config.misfire_threshold_seconds as i64) {
            counter!("scheduler_misfires_total").increment(1);
            match resolve_misfire(trigger.misfire_policy, remaining) {
                MisfireAction::FireOnSchedule => {}
                MisfireAction::FireNow { consume_missed } => {
                    reanchor = true;
                    if consume_missed && remaining > 0 {
                        remaining -= 1;
                    }
                }
                MisfireAction::Skip { consume_missed } => {
                    if consume_missed && remaining > 0 {
                        remaining -= 1;
                    }
                    return self.skip_misfired(trigger, remaining, now).await;
                }
            }
        }

        let fire_time = now;
        match self.store.mark_executing(&key, &self.instance_id).await {
            Ok(()) => {}
            Err(StoreError::NotFound(_)) => {
                // Claim was lost (recovery or unschedule raced us).
                warn!(trigger_key = %key, "Claim lost before execution");
                return Ok(());
            }
            Err(err) => return Err(err),
        }

        let Some(job) = self.store.get_job(&trigger.job_key).await? else {
            warn!(trigger_key = %key, job_key = %trigger.job_key, "Owning job missing");
            return self.park_in_error(&trigger, remaining).await;
        };

        let record = FireRecord::open(key.clone(), scheduled, fire_time, &self.instance_id);
        let record_id = record.id;
        self.store.insert_fire_record(&record).await?;

        let Some(handler) = self.registry.get(&job.handler) else {
            let err = ExecutionError::UnknownHandler(job.handler.clone());
            warn!(trigger_key = %key, handler = %job.handler, "No handler registered");
            self.store
                .finalize_fire_record(record_id, FireOutcome::Failure, Some(&err.to_string()), Utc::now())
                .await?;
            return self.park_in_error(&trigger, remaining).await;
        };

        let cancel = CancelFlag::new();
        let ctx = JobContext::new(
            job.key.clone(),
            key.clone(),
            job.data.clone(),
            scheduled,
            fire_time,
            cancel,
        );

        // Awaiting the slot here backpressures claiming: a saturated pool
        // stops the loop from pulling further triggers off the store.
        let permit = self.executor.acquire_slot().await;
        counter!("scheduler_triggers_fired_total").increment(1);
        let handle = self.executor.spawn(handler, ctx, permit);

        let mut settled = trigger;
        settled.remaining_repeats = remaining;
        if reanchor {
            settled.start_time = fire_time;
        }
        let engine = Arc::clone(&self);
        tokio::spawn(async move {
            let outcome = match handle.await {
                Ok(outcome) => outcome,
                Err(_) => JobOutcome::Failure("executor task aborted".to_string()),
            };
            let key = settled.key.clone();
            if let Err(err) = engine.settle(settled, scheduled, record_id, outcome).await {
                error!(trigger_key = %key, error = %err, "Failed to settle fire");
            }
        });
        Ok(())
    }

    /// Finalize the fire record and move the trigger to its next position.
    async fn settle(
        &self,
        trigger: Trigger,
        scheduled: DateTime<Utc>,
        record_id: Uuid,
        outcome: JobOutcome,
    ) -> Result<(), StoreError> {
        let key = trigger.key.clone();
        let (fire_outcome, error) = match &outcome {
            JobOutcome::Success => (FireOutcome::Success, None),
            JobOutcome::Vetoed => (FireOutcome::Vetoed, None),
            JobOutcome::Failure(reason) => (FireOutcome::Failure, Some(reason.clone())),
        };
        match fire_outcome {
            FireOutcome::Success => counter!("scheduler_fires_succeeded_total").increment(1),
            FireOutcome::Vetoed => counter!("scheduler_fires_vetoed_total").increment(1),
            _ => counter!("scheduler_fires_failed_total").increment(1),
        }
        self.with_retry("finalize_fire_record", || {
            self.store
                .finalize_fire_record(record_id, fire_outcome, error.as_deref(), Utc::now())
        })
        .await?;

        // Unscheduled mid-flight: drop the trigger now that its fire ended.
        if self
            .with_retry("is_cancel_requested", || self.store.is_cancel_requested(&key))
            .await?
        {
            self.with_retry("remove_cancelled_trigger", || {
                self.store.remove_cancelled_trigger(&key)
            })
            .await?;
            info!(trigger_key = %key, "Cancelled trigger removed after its final fire");
            return Ok(());
        }

        let remaining = match trigger.remaining_repeats {
            -1 => -1,
            0 => 0,
            n => n - 1,
        };
        // For a re-anchored trigger the start time was moved to the actual
        // fire time, so `after` lands on the new anchor; otherwise the
        // schedule advances from the scheduled instant, preserving the grid.
        let after = scheduled.max(trigger.start_time);
        let next = if remaining == 0 {
            None
        } else {
            match trigger.next_fire_after(after) {
                Ok(next) => next,
                Err(err) => {
                    error!(trigger_key = %key, error = %err, "Next fire computation failed");
                    return self.park_in_error(&trigger, remaining).await;
                }
            }
        };
        let state = if next.is_some() {
            TriggerState::Waiting
        } else {
            TriggerState::Complete
        };
        self.with_retry("release_trigger", || {
            self.store.release_trigger(
                &key,
                TriggerRelease {
                    state,
                    next_fire_time: next,
                    prev_fire_time: Some(after),
                    remaining_repeats: remaining,
                    start_time: trigger.start_time,
                },
            )
        })
        .await?;
        debug!(trigger_key = %key, state = %state.as_str(), "Fire settled");
        Ok(())
    }

    /// Misfire policy said skip: recompute the next occurrence after now
    /// without firing.
    async fn skip_misfired(
        &self,
        trigger: Trigger,
        remaining: i32,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let key = trigger.key.clone();
        let next = if remaining == 0 {
            None
        } else {
            match trigger.next_fire_after(now) {
                Ok(next) => next,
                Err(err) => {
                    error!(trigger_key = %key, error = %err, "Next fire computation failed");
                    return self.park_in_error(&trigger, remaining).await;
                }
            }
        };
        let state = if next.is_some() {
            TriggerState::Waiting
        } else {
            TriggerState::Complete
        };
        info!(
            trigger_key = %key,
            policy = %trigger.misfire_policy.as_str(),
            "Misfired trigger moved to its next occurrence"
        );
        self.store
            .release_trigger(
                &key,
                TriggerRelease {
                    state,
                    next_fire_time: next,
                    prev_fire_time: trigger.prev_fire_time,
                    remaining_repeats: remaining,
                    start_time: trigger.start_time,
                },
            )
            .await
    }

    /// Park a trigger in the error state; it stays out of the claim query
    /// until an operator resumes it.
    async fn park_in_error(&self, trigger: &Trigger, remaining: i32) -> Result<(), StoreError> {
        self.store
            .release_trigger(
                &trigger.key,
                TriggerRelease {
                    state: TriggerState::Error,
                    next_fire_time: trigger.next_fire_time,
                    prev_fire_time: trigger.prev_fire_time,
                    remaining_repeats: remaining,
                    start_time: trigger.start_time,
                },
            )
            .await
    }

    /// Retry transient store errors with exponential backoff before giving
    /// up; caller errors pass straight through.
    async fn with_retry<T, F, Fut>(&self, op: &str, mut f: F) -> Result<T, StoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let mut attempt = 0;
        loop {
            match f().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() => match self.backoff.next_delay(attempt) {
                    Some(delay) => {
                        warn!(
                            op,
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            error = %err,
                            "Transient store error, retrying"
                        );
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                    }
                    None => return Err(err),
                },
                Err(err) => return Err(err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::JobHandler;
    use crate::models::{JobKey, MisfirePolicy, Schedule};
    use crate::store::MemoryJobStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting {
        count: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl JobHandler for Counting {
        async fn execute(&self, _ctx: JobContext) -> JobOutcome {
            self.count.fetch_add(1, Ordering::SeqCst);
            JobOutcome::Success
        }
    }

    struct Vetoing;

    #[async_trait]
    impl JobHandler for Vetoing {
        async fn execute(&self, _ctx: JobContext) -> JobOutcome {
            JobOutcome::Vetoed
        }
    }

    struct SlowCancellable;

    #[async_trait]
    impl JobHandler for SlowCancellable {
        async fn execute(&self, ctx: JobContext) -> JobOutcome {
            for _ in 0..400 {
                if ctx.is_cancelled() {
                    return JobOutcome::Failure("cancelled".to_string());
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            JobOutcome::Success
        }
    }

    fn test_engine(registry: Arc<JobRegistry>) -> (Arc<SchedulerEngine>, Arc<MemoryJobStore>) {
        let store = Arc::new(MemoryJobStore::new());
        let config = SchedulerConfig {
            poll_interval: Duration::from_millis(50),
            poll_jitter_ms: 0,
            max_triggers_per_poll: 10,
            misfire_threshold_seconds: 60,
        };
        let engine = Arc::new(SchedulerEngine::new(
            config,
            "test-node",
            store.clone() as Arc<dyn JobStore>,
            registry,
            Arc::new(Executor::new(4)),
        ));
        (engine, store)
    }

    async fn wait_for_state(
        store: &MemoryJobStore,
        key: &TriggerKey,
        wanted: TriggerState,
    ) -> TriggerState {
        let mut state = TriggerState::Acquired;
        for _ in 0..200 {
            state = store.trigger_state(key).await.unwrap();
            if state == wanted {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        state
    }

    #[tokio::test]
    async fn test_submit_computes_first_fire() {
        let (engine, store) = test_engine(Arc::new(JobRegistry::new()));
        let start = Utc::now() + ChronoDuration::seconds(30);
        let key = engine
            .submit(
                JobSpec::new("report", "reporter"),
                TriggerSpec::every_seconds_forever(10)
                    .with_identity("report-every-10s", "tests")
                    .start_at(start),
            )
            .await
            .unwrap();

        let trigger = store.get_trigger(&key).await.unwrap().unwrap();
        assert_eq!(trigger.state, TriggerState::Waiting);
        assert_eq!(trigger.next_fire_time, Some(start));
        assert_eq!(trigger.remaining_repeats, -1);
    }

    #[tokio::test]
    async fn test_submit_rejects_window_that_never_fires() {
        let (engine, _) = test_engine(Arc::new(JobRegistry::new()));
        let start = Utc::now() + ChronoDuration::seconds(60);
        let result = engine
            .submit(
                JobSpec::new("never", "noop"),
                TriggerSpec::every_seconds_forever(10)
                    .start_at(start)
                    .end_at(start - ChronoDuration::seconds(30)),
            )
            .await;
        assert!(matches!(
            result,
            Err(SchedulerError::Schedule(ScheduleError::InvalidConfiguration(_)))
        ));
    }

    #[tokio::test]
    async fn test_submit_duplicate_job_fails() {
        let (engine, _) = test_engine(Arc::new(JobRegistry::new()));
        engine
            .submit(
                JobSpec::new("dup", "noop"),
                TriggerSpec::every_seconds_forever(10),
            )
            .await
            .unwrap();
        let result = engine
            .submit(
                JobSpec::new("dup", "noop"),
                TriggerSpec::every_seconds_forever(10),
            )
            .await;
        assert!(matches!(
            result,
            Err(SchedulerError::Store(StoreError::DuplicateKey(_)))
        ));
    }

    #[tokio::test]
    async fn test_failed_submit_leaves_no_job_behind() {
        let (engine, store) = test_engine(Arc::new(JobRegistry::new()));
        engine
            .submit(
                JobSpec::new("job-a", "noop"),
                TriggerSpec::every_seconds_forever(10).with_identity("shared", "tests"),
            )
            .await
            .unwrap();

        // Same trigger identity, different job: the trigger insert fails
        // and the job inserted first must be rolled back with it.
        let result = engine
            .submit(
                JobSpec::new("job-b", "noop"),
                TriggerSpec::every_seconds_forever(10).with_identity("shared", "tests"),
            )
            .await;
        assert!(matches!(
            result,
            Err(SchedulerError::Store(StoreError::DuplicateKey(_)))
        ));
        assert!(store.get_job(&JobKey::of("job-b")).await.unwrap().is_none());
        assert!(store.get_job(&JobKey::of("job-a")).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_fire_once_then_complete() {
        let registry = Arc::new(JobRegistry::new());
        let count = Arc::new(AtomicUsize::new(0));
        registry.register("counter", Arc::new(Counting { count: count.clone() }));
        let (engine, store) = test_engine(registry);

        let key = engine
            .submit(
                JobSpec::new("count-job", "counter"),
                TriggerSpec::new(Schedule::Interval {
                    every_seconds: 1,
                    repeat_count: 1,
                })
                .with_identity("once", "tests")
                .start_at(Utc::now() - ChronoDuration::seconds(1)),
            )
            .await
            .unwrap();

        assert_eq!(engine.clone().poll_once().await.unwrap(), 1);
        assert_eq!(wait_for_state(&store, &key, TriggerState::Complete).await, TriggerState::Complete);
        assert_eq!(count.load(Ordering::SeqCst), 1);

        let records = store.fire_records_for_trigger(&key).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].outcome, FireOutcome::Success);
        assert!(records[0].completed_at.is_some());
    }

    #[tokio::test]
    async fn test_repeat_count_consumed_one_per_fire() {
        let registry = Arc::new(JobRegistry::new());
        let count = Arc::new(AtomicUsize::new(0));
        registry.register("counter", Arc::new(Counting { count }));
        let (engine, store) = test_engine(registry);

        let key = engine
            .submit(
                JobSpec::new("thrice", "counter"),
                TriggerSpec::new(Schedule::Interval {
                    every_seconds: 3600,
                    repeat_count: 3,
                })
                .with_identity("thrice", "tests")
                .start_at(Utc::now() - ChronoDuration::seconds(1)),
            )
            .await
            .unwrap();

        engine.clone().poll_once().await.unwrap();
        assert_eq!(wait_for_state(&store, &key, TriggerState::Waiting).await, TriggerState::Waiting);

        let trigger = store.get_trigger(&key).await.unwrap().unwrap();
        assert_eq!(trigger.remaining_repeats, 2);
        assert!(trigger.prev_fire_time.is_some());
        assert!(trigger.next_fire_time.unwrap() > Utc::now());
    }

    // An overdue reschedule-next trigger skips to the next grid point
    // without firing and without touching its repeat count.
    #[tokio::test]
    async fn test_misfire_skip_preserves_count_and_grid() {
        let registry = Arc::new(JobRegistry::new());
        let count = Arc::new(AtomicUsize::new(0));
        registry.register("counter", Arc::new(Counting { count: count.clone() }));
        let (engine, store) = test_engine(registry);

        let start = Utc::now() - ChronoDuration::minutes(10);
        let key = engine
            .submit(
                JobSpec::new("gridded", "counter"),
                TriggerSpec::new(Schedule::Interval {
                    every_seconds: 60,
                    repeat_count: 10,
                })
                .with_identity("gridded", "tests")
                .with_misfire_policy(MisfirePolicy::RescheduleNextExistingCount)
                .start_at(start),
            )
            .await
            .unwrap();

        engine.clone().poll_once().await.unwrap();

        let trigger = store.get_trigger(&key).await.unwrap().unwrap();
        assert_eq!(trigger.state, TriggerState::Waiting);
        assert_eq!(trigger.remaining_repeats, 10);
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert!(store.fire_records_for_trigger(&key).await.unwrap().is_empty());

        let next = trigger.next_fire_time.unwrap();
        let now = Utc::now();
        assert!(next > now);
        assert!(next <= now + ChronoDuration::seconds(60));
        // Still on the grid anchored at the original start.
        assert_eq!((next - start).num_seconds() % 60, 0);
    }

    // An overdue fire-now trigger fires exactly once and re-anchors its
    // schedule at the actual fire time, dropping the backlog.
    #[tokio::test]
    async fn test_misfire_fire_now_reanchors() {
        let registry = Arc::new(JobRegistry::new());
        let count = Arc::new(AtomicUsize::new(0));
        registry.register("counter", Arc::new(Counting { count: count.clone() }));
        let (engine, store) = test_engine(registry);

        let scheduled = Utc::now() - ChronoDuration::minutes(10);
        let key = engine
            .submit(
                JobSpec::new("overdue", "counter"),
                TriggerSpec::every_seconds_forever(60)
                    .with_identity("overdue", "tests")
                    .with_misfire_policy(MisfirePolicy::FireNow)
                    .start_at(scheduled),
            )
            .await
            .unwrap();

        engine.clone().poll_once().await.unwrap();
        assert_eq!(wait_for_state(&store, &key, TriggerState::Waiting).await, TriggerState::Waiting);
        assert_eq!(count.load(Ordering::SeqCst), 1);

        let trigger = store.get_trigger(&key).await.unwrap().unwrap();
        let next = trigger.next_fire_time.unwrap();
        let now = Utc::now();
        // Re-anchored: roughly one interval out from now, not from the
        // ten-minute-old grid.
        assert!(next > now);
        assert!(next <= now + ChronoDuration::seconds(61));
        assert!(trigger.prev_fire_time.unwrap() > scheduled);
    }

    #[tokio::test]
    async fn test_veto_advances_trigger() {
        let registry = Arc::new(JobRegistry::new());
        registry.register("veto", Arc::new(Vetoing));
        let (engine, store) = test_engine(registry);

        let key = engine
            .submit(
                JobSpec::new("vetoed", "veto"),
                TriggerSpec::every_seconds_forever(3600)
                    .with_identity("vetoed", "tests")
                    .start_at(Utc::now() - ChronoDuration::seconds(1)),
            )
            .await
            .unwrap();

        engine.clone().poll_once().await.unwrap();
        assert_eq!(wait_for_state(&store, &key, TriggerState::Waiting).await, TriggerState::Waiting);

        let records = store.fire_records_for_trigger(&key).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].outcome, FireOutcome::Vetoed);
        let trigger = store.get_trigger(&key).await.unwrap().unwrap();
        assert!(trigger.next_fire_time.unwrap() > Utc::now());
    }

    #[tokio::test]
    async fn test_unknown_handler_parks_trigger_in_error() {
        let (engine, store) = test_engine(Arc::new(JobRegistry::new()));

        let key = engine
            .submit(
                JobSpec::new("ghost-job", "ghost"),
                TriggerSpec::every_seconds_forever(3600)
                    .with_identity("ghost", "tests")
                    .start_at(Utc::now() - ChronoDuration::seconds(1)),
            )
            .await
            .unwrap();

        engine.clone().poll_once().await.unwrap();
        assert_eq!(store.trigger_state(&key).await.unwrap(), TriggerState::Error);

        let records = store.fire_records_for_trigger(&key).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].outcome, FireOutcome::Failure);
        assert!(records[0].error.as_deref().unwrap().contains("ghost"));
    }

    #[tokio::test]
    async fn test_unschedule_in_flight_cancels_and_removes() {
        let registry = Arc::new(JobRegistry::new());
        registry.register("slow", Arc::new(SlowCancellable));
        let (engine, store) = test_engine(registry);

        let key = engine
            .submit(
                JobSpec::new("slow-job", "slow"),
                TriggerSpec::every_seconds_forever(3600)
                    .with_identity("slow", "tests")
                    .start_at(Utc::now() - ChronoDuration::seconds(1)),
            )
            .await
            .unwrap();

        engine.clone().poll_once().await.unwrap();
        assert_eq!(
            wait_for_state(&store, &key, TriggerState::Executing).await,
            TriggerState::Executing
        );

        assert!(engine.unschedule(&key).await.unwrap());

        // The body notices the flag, settles, and the trigger plus its
        // non-durable job cascade away.
        let mut gone = false;
        for _ in 0..200 {
            if store.get_trigger(&key).await.unwrap().is_none() {
                gone = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(gone);
        assert!(store.get_job(&JobKey::of("slow-job")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_pause_skips_claims_and_resume_recomputes() {
        let registry = Arc::new(JobRegistry::new());
        let count = Arc::new(AtomicUsize::new(0));
        registry.register("counter", Arc::new(Counting { count: count.clone() }));
        let (engine, store) = test_engine(registry);

        let key = engine
            .submit(
                JobSpec::new("pausable", "counter"),
                TriggerSpec::every_seconds_forever(1)
                    .with_identity("pausable", "tests")
                    .start_at(Utc::now() - ChronoDuration::seconds(1)),
            )
            .await
            .unwrap();

        engine.pause(&key).await.unwrap();
        assert_eq!(engine.clone().poll_once().await.unwrap(), 0);
        assert_eq!(count.load(Ordering::SeqCst), 0);

        engine.resume(&key).await.unwrap();
        let trigger = store.get_trigger(&key).await.unwrap().unwrap();
        assert_eq!(trigger.state, TriggerState::Waiting);
        assert!(trigger.next_fire_time.unwrap() > Utc::now());
    }
}
