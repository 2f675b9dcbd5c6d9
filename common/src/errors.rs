// Error taxonomy for the scheduler core.
//
// Caller errors (DuplicateKey, UnknownJob, UnknownTrigger) surface
// immediately and are never retried. Unavailable is transient and the
// dispatch loop retries it with capped exponential backoff.

use thiserror::Error;

use crate::models::{JobKey, TriggerKey};

/// Schedule-related errors
#[derive(Error, Debug)]
pub enum ScheduleError {
    #[error("invalid cron expression '{expression}': {reason}")]
    InvalidCronExpression { expression: String, reason: String },

    #[error("invalid schedule configuration: {0}")]
    InvalidConfiguration(String),

    #[error("schedule calculation failed: {0}")]
    CalculationFailed(String),
}

/// Job store errors
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("duplicate key: {0}")]
    DuplicateKey(String),

    #[error("unknown job: {0}")]
    UnknownJob(JobKey),

    #[error("unknown trigger: {0}")]
    UnknownTrigger(TriggerKey),

    #[error("record not found: {0}")]
    NotFound(String),

    #[error("invalid stored state: {0}")]
    Corrupt(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    /// Transient errors are worth retrying; caller errors are not.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

/// Job execution errors, captured in fire records
#[derive(Error, Debug)]
pub enum ExecutionError {
    #[error("no handler registered under '{0}'")]
    UnknownHandler(String),

    #[error("job body panicked")]
    Panicked,

    #[error("scheduler is shutting down")]
    SchedulerShutdown,
}

/// Errors surfaced by the scheduler instance API
#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error(transparent)]
    Schedule(#[from] ScheduleError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Execution(#[from] ExecutionError),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => StoreError::NotFound("record not found".to_string()),
            sqlx::Error::Database(db_err) => {
                // Postgres error codes: 23505 unique violation, 23503 FK violation
                if let Some(code) = db_err.code() {
                    match code.as_ref() {
                        "23505" => StoreError::DuplicateKey(db_err.message().to_string()),
                        "23503" => StoreError::Corrupt(db_err.message().to_string()),
                        _ => StoreError::Unavailable(db_err.message().to_string()),
                    }
                } else {
                    StoreError::Unavailable(db_err.message().to_string())
                }
            }
            sqlx::Error::PoolTimedOut => {
                StoreError::Unavailable("connection pool timed out".to_string())
            }
            _ => StoreError::Unavailable(err.to_string()),
        }
    }
}
