// Property-based tests for fire time evaluation.

use chrono::{DateTime, Datelike, Duration, TimeZone, Utc};
use chrono_tz::Tz;
use common::models::{CalendarUnit, Schedule};
use common::schedule::{validate_schedule, FireTimeEvaluator};
use proptest::prelude::*;

fn ts(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).single().expect("valid timestamp")
}

/// **Property: interval fire times advance strictly and stay on the grid.**
///
/// *For any* anchor, step and query instant at or past the anchor, the next
/// fire is strictly after the query instant, at most one step away, and an
/// exact multiple of the step from the anchor.
#[test]
fn property_interval_next_fire_on_grid() {
    proptest!(|(
        start_secs in 1_500_000_000i64..1_900_000_000i64,
        every_seconds in 1u32..86_400u32,
        offset_secs in 0i64..10_000_000i64,
    )| {
        let schedule = Schedule::Interval { every_seconds, repeat_count: -1 };
        let start = ts(start_secs);
        let after = start + Duration::seconds(offset_secs);

        let next = schedule.next_fire_time(start, after).unwrap().unwrap();
        prop_assert!(next > after);
        prop_assert!(next - after <= Duration::seconds(i64::from(every_seconds)));
        prop_assert_eq!((next - start).num_seconds() % i64::from(every_seconds), 0);
    });
}

/// **Property: a query before the anchor yields the anchor itself.**
#[test]
fn property_interval_first_fire_is_the_anchor() {
    proptest!(|(
        start_secs in 1_500_000_000i64..1_900_000_000i64,
        every_seconds in 1u32..86_400u32,
        lead_secs in 1i64..10_000_000i64,
    )| {
        let schedule = Schedule::Interval { every_seconds, repeat_count: -1 };
        let start = ts(start_secs);
        let next = schedule
            .next_fire_time(start, start - Duration::seconds(lead_secs))
            .unwrap()
            .unwrap();
        prop_assert_eq!(next, start);
    });
}

/// **Property: repeated evaluation yields a strictly increasing chain.**
///
/// *For any* schedule kind, feeding each fire time back in as the query
/// instant produces strictly later fire times with no fixpoints.
#[test]
fn property_fire_times_strictly_increase() {
    let tz: Tz = "UTC".parse().unwrap();
    let schedules = vec![
        Schedule::Interval { every_seconds: 90, repeat_count: -1 },
        Schedule::CalendarInterval { unit: CalendarUnit::Day, amount: 1, timezone: tz },
        Schedule::CalendarInterval { unit: CalendarUnit::Month, amount: 1, timezone: tz },
        Schedule::Cron { expression: "0 30 9 * * *".to_string(), timezone: tz },
        Schedule::Cron { expression: "0 */5 * * * *".to_string(), timezone: tz },
    ];
    proptest!(|(
        schedule_idx in 0usize..5,
        start_secs in 1_500_000_000i64..1_700_000_000i64,
        steps in 1usize..40,
    )| {
        let schedule = &schedules[schedule_idx];
        let start = ts(start_secs);
        let mut cursor = start;
        for _ in 0..steps {
            let next = schedule.next_fire_time(start, cursor).unwrap().unwrap();
            prop_assert!(next > cursor);
            cursor = next;
        }
    });
}

/// **Property: monthly steps clamp to month length without losing the
/// anchor day.**
///
/// *For any* month-end anchor day and number of steps, each occurrence
/// lands on the anchor day when the month has it and on the month's last
/// day otherwise; the chain never drifts to a shorter day permanently.
#[test]
fn property_calendar_month_clamps_to_month_length() {
    let tz: Tz = "UTC".parse().unwrap();
    proptest!(|(
        day in 28u32..=31u32,
        steps in 1usize..36,
    )| {
        let start = Utc.with_ymd_and_hms(2025, 1, day, 8, 0, 0).single().unwrap();
        let schedule = Schedule::CalendarInterval {
            unit: CalendarUnit::Month,
            amount: 1,
            timezone: tz,
        };

        let mut cursor = start;
        for _ in 0..steps {
            let next = schedule.next_fire_time(start, cursor).unwrap().unwrap();
            prop_assert!(next > cursor);

            let days_in_month = {
                let first = next.date_naive().with_day(1).unwrap();
                let next_month = if first.month() == 12 {
                    first.with_year(first.year() + 1).unwrap().with_month(1).unwrap()
                } else {
                    first.with_month(first.month() + 1).unwrap()
                };
                (next_month - first).num_days() as u32
            };
            prop_assert_eq!(next.day(), day.min(days_in_month));
            cursor = next;
        }
    });
}

/// Jan 31 -> Feb 28 -> Mar 31 -> Apr 30 on a one-month interval in a
/// non-leap year.
#[test]
fn test_month_end_chain_2025() {
    let tz: Tz = "UTC".parse().unwrap();
    let schedule = Schedule::CalendarInterval {
        unit: CalendarUnit::Month,
        amount: 1,
        timezone: tz,
    };
    let start = Utc.with_ymd_and_hms(2025, 1, 31, 12, 0, 0).single().unwrap();

    let feb = schedule.next_fire_time(start, start).unwrap().unwrap();
    assert_eq!((feb.month(), feb.day()), (2, 28));
    let mar = schedule.next_fire_time(start, feb).unwrap().unwrap();
    assert_eq!((mar.month(), mar.day()), (3, 31));
    let apr = schedule.next_fire_time(start, mar).unwrap().unwrap();
    assert_eq!((apr.month(), apr.day()), (4, 30));
}

/// **Property: cron fire times satisfy their fixed-field constraints.**
#[test]
fn property_cron_fields_match() {
    use chrono::Timelike;
    let tz: Tz = "UTC".parse().unwrap();
    proptest!(|(
        minute in 0u32..60,
        hour in 0u32..24,
        start_secs in 1_500_000_000i64..1_800_000_000i64,
    )| {
        let schedule = Schedule::Cron {
            expression: format!("0 {minute} {hour} * * *"),
            timezone: tz,
        };
        let start = ts(start_secs);
        let next = schedule.next_fire_time(start, start).unwrap().unwrap();
        prop_assert!(next > start);
        prop_assert_eq!(next.minute(), minute);
        prop_assert_eq!(next.hour(), hour);
        prop_assert_eq!(next.second(), 0);
    });
}

/// **Property: invalid schedules are rejected up front.**
#[test]
fn property_zero_steps_rejected() {
    proptest!(|(repeat_count in -1i32..100)| {
        let schedule = Schedule::Interval { every_seconds: 0, repeat_count };
        prop_assert!(validate_schedule(&schedule).is_err());
    });
    let tz: Tz = "UTC".parse().unwrap();
    assert!(validate_schedule(&Schedule::CalendarInterval {
        unit: CalendarUnit::Week,
        amount: 0,
        timezone: tz,
    })
    .is_err());
    assert!(validate_schedule(&Schedule::Cron {
        expression: "not a cron line".to_string(),
        timezone: tz,
    })
    .is_err());
}
