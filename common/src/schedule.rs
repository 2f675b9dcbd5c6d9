// Trigger evaluator: pure mapping from a schedule spec and a reference
// instant to the next fire time. No side effects and no I/O, so the same
// function serves live dispatch, "what if" queries and crash recovery.

use crate::errors::ScheduleError;
use crate::models::{CalendarUnit, Schedule, Trigger};
use chrono::{DateTime, Duration, LocalResult, Months, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use cron::Schedule as CronSchedule;
use std::str::FromStr;

/// Interface for computing fire times from a reference instant.
pub trait FireTimeEvaluator {
    /// Smallest fire instant strictly greater than `after`, anchored at
    /// `start`. `None` means the schedule has no further fires.
    fn next_fire_time(
        &self,
        start: DateTime<Utc>,
        after: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>, ScheduleError>;
}

impl FireTimeEvaluator for Schedule {
    fn next_fire_time(
        &self,
        start: DateTime<Utc>,
        after: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>, ScheduleError> {
        match self {
            Schedule::Interval { every_seconds, .. } => {
                next_aligned_instant(start, after, i64::from(*every_seconds))
            }

            Schedule::CalendarInterval {
                unit,
                amount,
                timezone,
            } => next_calendar_instant(start, after, *unit, *amount, *timezone),

            Schedule::Cron {
                expression,
                timezone,
            } => next_cron_instant(expression, *timezone, start, after),
        }
    }
}

impl Trigger {
    /// Next fire strictly after `after`, honoring the trigger's end time.
    pub fn next_fire_after(
        &self,
        after: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>, ScheduleError> {
        let next = self.schedule.next_fire_time(self.start_time, after)?;
        Ok(next.filter(|t| self.end_time.map_or(true, |end| *t <= end)))
    }
}

/// Validate a schedule spec at submission time.
///
/// The cron day-of-month/day-of-week mutual restriction is a specification
/// error and is rejected here, never evaluated at runtime.
pub fn validate_schedule(schedule: &Schedule) -> Result<(), ScheduleError> {
    match schedule {
        Schedule::Interval {
            every_seconds,
            repeat_count,
        } => {
            if *every_seconds == 0 {
                return Err(ScheduleError::InvalidConfiguration(
                    "interval must be at least one second".to_string(),
                ));
            }
            if *repeat_count == 0 || *repeat_count < -1 {
                return Err(ScheduleError::InvalidConfiguration(
                    "repeat count must be positive or -1 for indefinite".to_string(),
                ));
            }
            Ok(())
        }
        Schedule::CalendarInterval { amount, .. } => {
            if *amount == 0 {
                return Err(ScheduleError::InvalidConfiguration(
                    "calendar interval amount must be at least one".to_string(),
                ));
            }
            Ok(())
        }
        Schedule::Cron { expression, .. } => {
            parse_cron_expression(expression)?;
            reject_double_day_restriction(expression)
        }
    }
}

/// Parse and validate a cron expression (second precision, optional year).
pub fn parse_cron_expression(expression: &str) -> Result<CronSchedule, ScheduleError> {
    CronSchedule::from_str(expression).map_err(|e| ScheduleError::InvalidCronExpression {
        expression: expression.to_string(),
        reason: e.to_string(),
    })
}

/// Day-of-month and day-of-week may not both be restricted; one must be a
/// wildcard (`*` or `?`).
fn reject_double_day_restriction(expression: &str) -> Result<(), ScheduleError> {
    let fields: Vec<&str> = expression.split_whitespace().collect();
    if fields.len() < 6 {
        // Field count problems are reported by the parser.
        return Ok(());
    }
    let wildcard = |f: &str| f == "*" || f == "?";
    if !wildcard(fields[3]) && !wildcard(fields[5]) {
        return Err(ScheduleError::InvalidCronExpression {
            expression: expression.to_string(),
            reason: "day-of-month and day-of-week may not both be restricted".to_string(),
        });
    }
    Ok(())
}

/// Next boundary of a fixed-length interval grid anchored at `start`.
fn next_aligned_instant(
    start: DateTime<Utc>,
    after: DateTime<Utc>,
    step_seconds: i64,
) -> Result<Option<DateTime<Utc>>, ScheduleError> {
    if step_seconds <= 0 {
        return Err(ScheduleError::InvalidConfiguration(
            "interval must be at least one second".to_string(),
        ));
    }
    if after < start {
        return Ok(Some(start));
    }
    let elapsed = (after - start).num_seconds();
    let k = elapsed / step_seconds + 1;
    Ok(Some(start + Duration::seconds(k * step_seconds)))
}

fn next_calendar_instant(
    start: DateTime<Utc>,
    after: DateTime<Utc>,
    unit: CalendarUnit,
    amount: u32,
    tz: Tz,
) -> Result<Option<DateTime<Utc>>, ScheduleError> {
    // Minutes and hours are fixed-length; plain instant arithmetic applies.
    match unit {
        CalendarUnit::Minute => return next_aligned_instant(start, after, i64::from(amount) * 60),
        CalendarUnit::Hour => return next_aligned_instant(start, after, i64::from(amount) * 3600),
        _ => {}
    }

    if after < start {
        return Ok(Some(start));
    }

    // Candidates are always derived from the original start anchor with the
    // total offset, so a monthly trigger starting Jan 31 fires Feb 28 (or 29)
    // and then Mar 31 again, instead of drifting to the 28th forever.
    let start_local = start.with_timezone(&tz).naive_local();
    let approx_step = approx_unit_seconds(unit) * i64::from(amount);
    let mut n = ((after - start).num_seconds() / approx_step).max(0);

    // The estimate can land on either side of `after`; walk to the smallest
    // strictly-greater candidate.
    while n > 0 && calendar_candidate(start_local, unit, amount, n - 1, tz)? > after {
        n -= 1;
    }
    let mut candidate = calendar_candidate(start_local, unit, amount, n, tz)?;
    while candidate <= after {
        n += 1;
        candidate = calendar_candidate(start_local, unit, amount, n, tz)?;
    }
    Ok(Some(candidate))
}

fn approx_unit_seconds(unit: CalendarUnit) -> i64 {
    match unit {
        CalendarUnit::Minute => 60,
        CalendarUnit::Hour => 3_600,
        CalendarUnit::Day => 86_400,
        CalendarUnit::Week => 604_800,
        CalendarUnit::Month => 2_629_800,
        CalendarUnit::Year => 31_557_600,
    }
}

/// The n-th calendar occurrence after the anchor, in UTC.
fn calendar_candidate(
    anchor: NaiveDateTime,
    unit: CalendarUnit,
    amount: u32,
    n: i64,
    tz: Tz,
) -> Result<DateTime<Utc>, ScheduleError> {
    let total = n
        .checked_mul(i64::from(amount))
        .ok_or_else(|| ScheduleError::CalculationFailed("interval overflow".to_string()))?;

    let local = match unit {
        CalendarUnit::Day => anchor
            .checked_add_signed(Duration::days(total))
            .ok_or_else(|| ScheduleError::CalculationFailed("date overflow".to_string()))?,
        CalendarUnit::Week => anchor
            .checked_add_signed(Duration::days(total * 7))
            .ok_or_else(|| ScheduleError::CalculationFailed("date overflow".to_string()))?,
        CalendarUnit::Month | CalendarUnit::Year => {
            let months = if unit == CalendarUnit::Year {
                total * 12
            } else {
                total
            };
            let months = u32::try_from(months)
                .map_err(|_| ScheduleError::CalculationFailed("date overflow".to_string()))?;
            // checked_add_months clamps the day to the end of a shorter month
            let date = anchor
                .date()
                .checked_add_months(Months::new(months))
                .ok_or_else(|| ScheduleError::CalculationFailed("date overflow".to_string()))?;
            date.and_time(anchor.time())
        }
        CalendarUnit::Minute | CalendarUnit::Hour => {
            return Err(ScheduleError::CalculationFailed(
                "fixed-length unit in calendar path".to_string(),
            ))
        }
    };

    Ok(resolve_local(tz, local).with_timezone(&Utc))
}

/// Map a local wall-clock time to an instant, resolving DST edges: the
/// earlier instant on fall-back overlaps, shifted forward across
/// spring-forward gaps.
fn resolve_local(tz: Tz, naive: NaiveDateTime) -> DateTime<Tz> {
    match tz.from_local_datetime(&naive) {
        LocalResult::Single(dt) => dt,
        LocalResult::Ambiguous(earliest, _) => earliest,
        LocalResult::None => tz
            .from_local_datetime(&(naive + Duration::hours(1)))
            .earliest()
            .unwrap_or_else(|| tz.from_utc_datetime(&naive)),
    }
}

fn next_cron_instant(
    expression: &str,
    tz: Tz,
    start: DateTime<Utc>,
    after: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>, ScheduleError> {
    let parsed = parse_cron_expression(expression)?;
    // Before the start time the first matching instant at or after start
    // applies; afterwards, strictly greater than `after`.
    let reference = if after < start {
        start - Duration::seconds(1)
    } else {
        after
    };
    let reference_in_tz = reference.with_timezone(&tz);
    Ok(parsed
        .after(&reference_in_tz)
        .next()
        .map(|next| next.with_timezone(&Utc)))
}
