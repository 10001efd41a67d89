//! Scheduler errors.

use thiserror::Error;

use jobd_store::StoreError;

#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Cron expression failed to parse; the message names the field.
    #[error("Invalid cron expression: {0}")]
    InvalidCron(String),

    #[error("Invalid timezone: {0}")]
    InvalidTimezone(String),

    /// The next occurrence of an interval job does not fit a timestamp.
    #[error("Interval of {0}s is out of range")]
    IntervalOutOfRange(u64),

    /// Listing or updating scheduled jobs failed.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// The scheduler task has exited and its command channel is closed.
    #[error("Scheduler is not running")]
    NotRunning,
}
