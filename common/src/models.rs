use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

// Helper functions for Tz serialization
fn serialize_tz<S>(tz: &Tz, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(&tz.to_string())
}

fn deserialize_tz<'de, D>(deserializer: D) -> Result<Tz, D::Error>
where
    D: Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    Tz::from_str(&s).map_err(serde::de::Error::custom)
}

/// Group used when a job or trigger is registered without an explicit group.
pub const DEFAULT_GROUP: &str = "DEFAULT";

/// Arbitrary key/value payload handed to the job body on every fire.
pub type JobDataMap = HashMap<String, serde_json::Value>;

// ============================================================================
// Keys
// ============================================================================

macro_rules! scheduler_key {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name {
            pub name: String,
            pub group: String,
        }

        impl $name {
            pub fn new(name: impl Into<String>, group: impl Into<String>) -> Self {
                Self {
                    name: name.into(),
                    group: group.into(),
                }
            }

            /// Key in the default group.
            pub fn of(name: impl Into<String>) -> Self {
                Self::new(name, DEFAULT_GROUP)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}.{}", self.group, self.name)
            }
        }
    };
}

scheduler_key!(JobKey);
scheduler_key!(TriggerKey);

// ============================================================================
// Jobs
// ============================================================================

/// A persisted job definition.
///
/// `handler` names the job body in the instance's registry; the same
/// definition can therefore be shared by every node in the cluster without
/// shipping code through the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobDetail {
    pub key: JobKey,
    pub handler: String,
    pub description: Option<String>,
    pub data: JobDataMap,
    /// Durable jobs survive the removal of their last trigger.
    pub durable: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ============================================================================
// Schedules
// ============================================================================

/// Calendar unit for calendar-interval schedules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CalendarUnit {
    Minute,
    Hour,
    Day,
    Week,
    Month,
    Year,
}

/// Schedule defines when a trigger should fire.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Schedule {
    /// Fixed interval anchored at the trigger start time.
    /// `repeat_count` is the total number of fires; -1 repeats indefinitely.
    Interval {
        every_seconds: u32,
        repeat_count: i32,
    },
    /// Calendar-aware interval: adding one month to Jan 31 lands on the last
    /// valid day of February, DST transitions follow the given timezone.
    CalendarInterval {
        unit: CalendarUnit,
        amount: u32,
        #[serde(serialize_with = "serialize_tz", deserialize_with = "deserialize_tz")]
        timezone: Tz,
    },
    /// Cron field pattern (second, minute, hour, day-of-month, month,
    /// day-of-week, optional year) with lists, ranges and steps.
    Cron {
        expression: String,
        #[serde(serialize_with = "serialize_tz", deserialize_with = "deserialize_tz")]
        timezone: Tz,
    },
}

impl Schedule {
    /// Initial remaining-repeat counter for a fresh trigger.
    pub fn initial_repeats(&self) -> i32 {
        match self {
            Schedule::Interval { repeat_count, .. } => *repeat_count,
            _ => -1,
        }
    }
}

// ============================================================================
// Triggers
// ============================================================================

/// Lifecycle state of a trigger.
///
/// Transitions within one fire cycle are monotonic:
/// waiting -> acquired -> executing -> waiting | complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerState {
    Waiting,
    Acquired,
    Executing,
    Paused,
    Complete,
    Error,
    Blocked,
}

impl TriggerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerState::Waiting => "waiting",
            TriggerState::Acquired => "acquired",
            TriggerState::Executing => "executing",
            TriggerState::Paused => "paused",
            TriggerState::Complete => "complete",
            TriggerState::Error => "error",
            TriggerState::Blocked => "blocked",
        }
    }
}

impl FromStr for TriggerState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "waiting" => Ok(TriggerState::Waiting),
            "acquired" => Ok(TriggerState::Acquired),
            "executing" => Ok(TriggerState::Executing),
            "paused" => Ok(TriggerState::Paused),
            "complete" => Ok(TriggerState::Complete),
            "error" => Ok(TriggerState::Error),
            "blocked" => Ok(TriggerState::Blocked),
            other => Err(format!("unknown trigger state '{other}'")),
        }
    }
}

/// What to do with a trigger whose scheduled fire time passed without it
/// being evaluated in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MisfirePolicy {
    /// Fire now as if on time, keep the schedule unchanged.
    Ignore,
    /// Fire exactly once immediately, then compute the next fire from now.
    FireNow,
    /// Skip to the next scheduled occurrence, repeat count unchanged.
    RescheduleNextExistingCount,
    /// Skip to the next scheduled occurrence, repeat count decremented for
    /// the skipped fire.
    RescheduleNextRemainingCount,
    /// Fire now, repeat count unchanged.
    RescheduleNowExistingCount,
    /// Fire now, repeat count decremented.
    RescheduleNowRemainingCount,
    /// FireNow when only a few repeats remain, else skip to next occurrence.
    SmartDefault,
}

impl MisfirePolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            MisfirePolicy::Ignore => "ignore",
            MisfirePolicy::FireNow => "fire_now",
            MisfirePolicy::RescheduleNextExistingCount => "reschedule_next_existing_count",
            MisfirePolicy::RescheduleNextRemainingCount => "reschedule_next_remaining_count",
            MisfirePolicy::RescheduleNowExistingCount => "reschedule_now_existing_count",
            MisfirePolicy::RescheduleNowRemainingCount => "reschedule_now_remaining_count",
            MisfirePolicy::SmartDefault => "smart_default",
        }
    }
}

impl FromStr for MisfirePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ignore" => Ok(MisfirePolicy::Ignore),
            "fire_now" => Ok(MisfirePolicy::FireNow),
            "reschedule_next_existing_count" => Ok(MisfirePolicy::RescheduleNextExistingCount),
            "reschedule_next_remaining_count" => Ok(MisfirePolicy::RescheduleNextRemainingCount),
            "reschedule_now_existing_count" => Ok(MisfirePolicy::RescheduleNowExistingCount),
            "reschedule_now_remaining_count" => Ok(MisfirePolicy::RescheduleNowRemainingCount),
            "smart_default" => Ok(MisfirePolicy::SmartDefault),
            other => Err(format!("unknown misfire policy '{other}'")),
        }
    }
}

/// Default trigger priority; higher fires first among ties on fire time.
pub const DEFAULT_PRIORITY: i32 = 5;

/// A persisted trigger: the rule describing when its job fires, plus the
/// live scheduling position (next/prev fire time, remaining repeats, claim).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trigger {
    pub key: TriggerKey,
    pub job_key: JobKey,
    pub description: Option<String>,
    pub schedule: Schedule,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub misfire_policy: MisfirePolicy,
    pub state: TriggerState,
    pub priority: i32,
    pub next_fire_time: Option<DateTime<Utc>>,
    pub prev_fire_time: Option<DateTime<Utc>>,
    /// Fires still allowed after the current one; -1 means indefinite.
    pub remaining_repeats: i32,
    /// Instance holding the claim while acquired/executing.
    pub claimed_by: Option<String>,
    pub claimed_at: Option<DateTime<Utc>>,
    /// Set when the trigger is unscheduled mid-flight; the executor checks
    /// this cooperatively and the engine skips misfire rescheduling.
    pub cancel_requested: bool,
}

// ============================================================================
// Fire records
// ============================================================================

/// Outcome of a single execution attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FireOutcome {
    InProgress,
    Success,
    Failure,
    Vetoed,
}

impl FireOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            FireOutcome::InProgress => "in_progress",
            FireOutcome::Success => "success",
            FireOutcome::Failure => "failure",
            FireOutcome::Vetoed => "vetoed",
        }
    }
}

impl FromStr for FireOutcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "in_progress" => Ok(FireOutcome::InProgress),
            "success" => Ok(FireOutcome::Success),
            "failure" => Ok(FireOutcome::Failure),
            "vetoed" => Ok(FireOutcome::Vetoed),
            other => Err(format!("unknown fire outcome '{other}'")),
        }
    }
}

/// One row per actual execution attempt, created at claim time and
/// finalized at completion. Retained for audit and idempotence checks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FireRecord {
    pub id: Uuid,
    pub trigger_key: TriggerKey,
    pub scheduled_time: DateTime<Utc>,
    pub fired_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub outcome: FireOutcome,
    pub error: Option<String>,
    pub instance_id: String,
}

impl FireRecord {
    pub fn open(
        trigger_key: TriggerKey,
        scheduled_time: DateTime<Utc>,
        fired_at: DateTime<Utc>,
        instance_id: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            trigger_key,
            scheduled_time,
            fired_at,
            completed_at: None,
            outcome: FireOutcome::InProgress,
            error: None,
            instance_id: instance_id.into(),
        }
    }
}

// ============================================================================
// Submission specs (builder-style construction)
// ============================================================================

/// Job definition as submitted by the embedding application.
#[derive(Debug, Clone)]
pub struct JobSpec {
    pub key: JobKey,
    pub handler: String,
    pub description: Option<String>,
    pub data: JobDataMap,
    pub durable: bool,
}

impl JobSpec {
    pub fn new(name: impl Into<String>, handler: impl Into<String>) -> Self {
        Self {
            key: JobKey::of(name),
            handler: handler.into(),
            description: None,
            data: JobDataMap::new(),
            durable: false,
        }
    }

    pub fn in_group(mut self, group: impl Into<String>) -> Self {
        self.key.group = group.into();
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_data(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }

    /// Keep the job definition even when its last trigger is removed.
    pub fn store_durably(mut self) -> Self {
        self.durable = true;
        self
    }
}

/// Trigger definition as submitted by the embedding application.
#[derive(Debug, Clone)]
pub struct TriggerSpec {
    pub key: Option<TriggerKey>,
    pub description: Option<String>,
    pub schedule: Schedule,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub misfire_policy: MisfirePolicy,
    pub priority: i32,
}

impl TriggerSpec {
    pub fn new(schedule: Schedule) -> Self {
        Self {
            key: None,
            description: None,
            schedule,
            start_time: None,
            end_time: None,
            misfire_policy: MisfirePolicy::SmartDefault,
            priority: DEFAULT_PRIORITY,
        }
    }

    /// Interval schedule repeating indefinitely.
    pub fn every_seconds_forever(seconds: u32) -> Self {
        Self::new(Schedule::Interval {
            every_seconds: seconds,
            repeat_count: -1,
        })
    }

    pub fn with_identity(mut self, name: impl Into<String>, group: impl Into<String>) -> Self {
        self.key = Some(TriggerKey::new(name, group));
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn start_at(mut self, at: DateTime<Utc>) -> Self {
        self.start_time = Some(at);
        self
    }

    pub fn end_at(mut self, at: DateTime<Utc>) -> Self {
        self.end_time = Some(at);
        self
    }

    pub fn with_misfire_policy(mut self, policy: MisfirePolicy) -> Self {
        self.misfire_policy = policy;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}
