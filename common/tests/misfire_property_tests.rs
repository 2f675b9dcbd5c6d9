// Property-based tests for misfire policy resolution.

use common::models::MisfirePolicy;
use common::scheduler::{resolve_misfire, MisfireAction, SMART_FIRE_NOW_MAX_REMAINING};
use proptest::prelude::*;

fn any_policy() -> impl Strategy<Value = MisfirePolicy> {
    prop::sample::select(vec![
        MisfirePolicy::Ignore,
        MisfirePolicy::FireNow,
        MisfirePolicy::RescheduleNextExistingCount,
        MisfirePolicy::RescheduleNextRemainingCount,
        MisfirePolicy::RescheduleNowExistingCount,
        MisfirePolicy::RescheduleNowRemainingCount,
        MisfirePolicy::SmartDefault,
    ])
}

/// **Property: resolution is total and count-preserving policies never
/// consume a repeat.**
#[test]
fn property_existing_count_policies_never_consume() {
    proptest!(|(policy in any_policy(), remaining in -1i32..10_000)| {
        let action = resolve_misfire(policy, remaining);
        let consumes = matches!(
            action,
            MisfireAction::FireNow { consume_missed: true }
                | MisfireAction::Skip { consume_missed: true }
        );
        match policy {
            MisfirePolicy::RescheduleNextRemainingCount
            | MisfirePolicy::RescheduleNowRemainingCount => prop_assert!(consumes),
            _ => prop_assert!(!consumes),
        }
    });
}

/// **Property: only the ignore policy preserves the original schedule
/// anchor while still firing.**
#[test]
fn property_only_ignore_replays_backlog() {
    proptest!(|(policy in any_policy(), remaining in -1i32..10_000)| {
        let action = resolve_misfire(policy, remaining);
        prop_assert_eq!(
            action == MisfireAction::FireOnSchedule,
            policy == MisfirePolicy::Ignore
        );
    });
}

/// **Property: the smart default fires immediately exactly when few
/// repeats remain.**
#[test]
fn property_smart_default_threshold() {
    proptest!(|(remaining in -1i32..10_000)| {
        let action = resolve_misfire(MisfirePolicy::SmartDefault, remaining);
        let fires_now = matches!(action, MisfireAction::FireNow { .. });
        prop_assert_eq!(
            fires_now,
            (0..=SMART_FIRE_NOW_MAX_REMAINING).contains(&remaining)
        );
    });
}
