// Property-based tests for job store claim semantics, exercised against the
// in-memory store which mirrors the Postgres implementation.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use common::models::{
    FireOutcome, FireRecord, JobDetail, JobKey, MisfirePolicy, Schedule, Trigger, TriggerKey,
    TriggerState, DEFAULT_PRIORITY,
};
use common::store::{JobStore, MemoryJobStore, TriggerRelease};
use proptest::prelude::*;

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(4)
        .enable_all()
        .build()
        .expect("tokio runtime")
}

async fn seed_job(store: &MemoryJobStore, name: &str) -> JobKey {
    let now = Utc::now();
    let detail = JobDetail {
        key: JobKey::of(name),
        handler: "noop".to_string(),
        description: None,
        data: Default::default(),
        durable: false,
        created_at: now,
        updated_at: now,
    };
    store.put_job(&detail, false).await.unwrap();
    detail.key
}

fn waiting_trigger(
    name: &str,
    job_key: JobKey,
    next_fire_time: DateTime<Utc>,
    priority: i32,
) -> Trigger {
    Trigger {
        key: TriggerKey::new(name, "props"),
        job_key,
        description: None,
        schedule: Schedule::Interval {
            every_seconds: 60,
            repeat_count: -1,
        },
        start_time: next_fire_time,
        end_time: None,
        misfire_policy: MisfirePolicy::SmartDefault,
        state: TriggerState::Waiting,
        priority,
        next_fire_time: Some(next_fire_time),
        prev_fire_time: None,
        remaining_repeats: -1,
        claimed_by: None,
        claimed_at: None,
        cancel_requested: false,
    }
}

/// **Property: claims are exclusive under contention.**
///
/// *For any* number of due triggers and concurrent claimers, every due
/// trigger is claimed by exactly one claimer and none is handed out twice.
#[test]
fn property_concurrent_claims_are_disjoint() {
    proptest!(|(
        trigger_count in 1usize..12,
        claimer_count in 2usize..6,
    )| {
        let rt = runtime();
        rt.block_on(async {
            let store = Arc::new(MemoryJobStore::new());
            let job_key = seed_job(&store, "contended").await;
            let now = Utc::now();

            for i in 0..trigger_count {
                let trigger = waiting_trigger(
                    &format!("t{i}"),
                    job_key.clone(),
                    now - Duration::seconds(30),
                    DEFAULT_PRIORITY,
                );
                store.put_trigger(&trigger, false).await.unwrap();
            }

            let mut handles = Vec::new();
            for c in 0..claimer_count {
                let store = Arc::clone(&store);
                handles.push(tokio::spawn(async move {
                    store
                        .acquire_next_triggers(Utc::now(), 100, &format!("node-{c}"))
                        .await
                        .unwrap()
                }));
            }

            let mut seen = HashSet::new();
            for handle in handles {
                for trigger in handle.await.unwrap() {
                    prop_assert!(
                        seen.insert(trigger.key.clone()),
                        "trigger {} claimed twice",
                        trigger.key
                    );
                }
            }
            prop_assert_eq!(seen.len(), trigger_count);
            Ok(())
        }).unwrap();
    });
}

/// **Property: claim order is fire time ascending, then priority
/// descending.**
#[test]
fn property_claim_ordering() {
    proptest!(|(offsets in prop::collection::vec((0i64..300, 0i32..10), 2..10))| {
        let rt = runtime();
        rt.block_on(async {
            let store = MemoryJobStore::new();
            let job_key = seed_job(&store, "ordered").await;
            let base = Utc::now() - Duration::seconds(400);

            for (i, (offset, priority)) in offsets.iter().enumerate() {
                let trigger = waiting_trigger(
                    &format!("t{i}"),
                    job_key.clone(),
                    base + Duration::seconds(*offset),
                    *priority,
                );
                store.put_trigger(&trigger, false).await.unwrap();
            }

            let claimed = store
                .acquire_next_triggers(Utc::now(), 100, "node-a")
                .await
                .unwrap();
            prop_assert_eq!(claimed.len(), offsets.len());
            for pair in claimed.windows(2) {
                let (a, b) = (&pair[0], &pair[1]);
                let (ta, tb) = (a.next_fire_time.unwrap(), b.next_fire_time.unwrap());
                prop_assert!(
                    ta < tb || (ta == tb && a.priority >= b.priority),
                    "claim order violated: {} before {}",
                    a.key,
                    b.key
                );
            }
            Ok(())
        }).unwrap();
    });
}

/// **Property: max_count caps a claim batch and leaves the rest claimable.**
#[test]
fn property_claim_batch_capped() {
    proptest!(|(trigger_count in 1usize..15, max_count in 1usize..15)| {
        let rt = runtime();
        rt.block_on(async {
            let store = MemoryJobStore::new();
            let job_key = seed_job(&store, "capped").await;
            let now = Utc::now();

            for i in 0..trigger_count {
                let trigger = waiting_trigger(
                    &format!("t{i}"),
                    job_key.clone(),
                    now - Duration::seconds(10),
                    DEFAULT_PRIORITY,
                );
                store.put_trigger(&trigger, false).await.unwrap();
            }

            let first = store
                .acquire_next_triggers(now, max_count, "node-a")
                .await
                .unwrap();
            prop_assert_eq!(first.len(), trigger_count.min(max_count));

            let rest = store
                .acquire_next_triggers(now, 100, "node-b")
                .await
                .unwrap();
            prop_assert_eq!(first.len() + rest.len(), trigger_count);
            Ok(())
        }).unwrap();
    });
}

/// A claim stranded by a dead instance is recovered exactly once and the
/// trigger fires exactly once for its scheduled time afterwards.
#[tokio::test]
async fn test_recovery_produces_single_fire() {
    let store = Arc::new(MemoryJobStore::new());
    let job_key = seed_job(&store, "recovered").await;
    let scheduled = Utc::now() - Duration::seconds(30);

    let trigger = waiting_trigger("orphan", job_key, scheduled, DEFAULT_PRIORITY);
    let key = trigger.key.clone();
    store.put_trigger(&trigger, false).await.unwrap();

    // Dead node claims, opens a fire record, never settles.
    let claimed = store
        .acquire_next_triggers(Utc::now(), 10, "dead-node")
        .await
        .unwrap();
    assert_eq!(claimed.len(), 1);
    store.mark_executing(&key, "dead-node").await.unwrap();
    let dangling = FireRecord::open(key.clone(), scheduled, Utc::now(), "dead-node");
    store.insert_fire_record(&dangling).await.unwrap();

    // Survivors sweep concurrently; the trigger is recovered exactly once.
    let mut recovered_total = 0;
    for _ in 0..3 {
        recovered_total += store
            .recover_orphaned(Utc::now() + Duration::seconds(1))
            .await
            .unwrap();
    }
    assert_eq!(recovered_total, 1);
    assert_eq!(store.trigger_state(&key).await.unwrap(), TriggerState::Waiting);

    // The dangling record was failed, not left open.
    let records = store.fire_records_for_trigger(&key).await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].outcome, FireOutcome::Failure);

    // A survivor re-claims and completes the fire; one success record for
    // the scheduled time.
    let reclaimed = store
        .acquire_next_triggers(Utc::now(), 10, "survivor")
        .await
        .unwrap();
    assert_eq!(reclaimed.len(), 1);
    store.mark_executing(&key, "survivor").await.unwrap();
    let record = FireRecord::open(key.clone(), scheduled, Utc::now(), "survivor");
    store.insert_fire_record(&record).await.unwrap();
    store
        .finalize_fire_record(record.id, FireOutcome::Success, None, Utc::now())
        .await
        .unwrap();
    store
        .release_trigger(
            &key,
            TriggerRelease {
                state: TriggerState::Waiting,
                next_fire_time: Some(Utc::now() + Duration::seconds(60)),
                prev_fire_time: Some(scheduled),
                remaining_repeats: -1,
                start_time: reclaimed[0].start_time,
            },
        )
        .await
        .unwrap();

    let records = store.fire_records_for_trigger(&key).await.unwrap();
    let successes = records
        .iter()
        .filter(|r| r.scheduled_time == scheduled && r.outcome == FireOutcome::Success)
        .count();
    assert_eq!(successes, 1);
}
