// Misfire policy resolution.
//
// A misfire is not an error, it is a policy branch: the dispatch loop asks
// this pure function what to do with a trigger found past its misfire
// threshold and acts on the answer.

use crate::models::MisfirePolicy;

/// SmartDefault fires overdue triggers immediately only when this few
/// repeats remain; otherwise it skips to the next occurrence.
pub const SMART_FIRE_NOW_MAX_REMAINING: i32 = 5;

/// What the dispatch loop should do with a misfired trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MisfireAction {
    /// Fire immediately as if on time; the schedule anchor is unchanged, so
    /// a long outage replays its backlog.
    FireOnSchedule,
    /// Fire immediately once and re-anchor the schedule at the actual fire
    /// time; the backlog is dropped.
    FireNow {
        /// Consume one repeat for the missed occurrence, on top of the
        /// fire itself.
        consume_missed: bool,
    },
    /// Do not fire; move to the next occurrence strictly after now.
    Skip { consume_missed: bool },
}

/// Resolve a trigger's misfire policy against its remaining repeat count.
pub fn resolve_misfire(policy: MisfirePolicy, remaining_repeats: i32) -> MisfireAction {
    match policy {
        MisfirePolicy::Ignore => MisfireAction::FireOnSchedule,
        MisfirePolicy::FireNow => MisfireAction::FireNow {
            consume_missed: false,
        },
        MisfirePolicy::RescheduleNextExistingCount => MisfireAction::Skip {
            consume_missed: false,
        },
        MisfirePolicy::RescheduleNextRemainingCount => MisfireAction::Skip {
            consume_missed: true,
        },
        MisfirePolicy::RescheduleNowExistingCount => MisfireAction::FireNow {
            consume_missed: false,
        },
        MisfirePolicy::RescheduleNowRemainingCount => MisfireAction::FireNow {
            consume_missed: true,
        },
        MisfirePolicy::SmartDefault => {
            // Indefinite (-1) counts as "many".
            if (0..=SMART_FIRE_NOW_MAX_REMAINING).contains(&remaining_repeats) {
                MisfireAction::FireNow {
                    consume_missed: false,
                }
            } else {
                MisfireAction::Skip {
                    consume_missed: false,
                }
            }
        }
    }
}
