//! Job scheduling for the jobd daemon.
//!
//! This crate decides *when* jobs are due; it never runs them. Both
//! schedulers emit [`DueJob`] events on a channel consumed by the daemon's
//! dispatcher.
//!
//! # Features
//!
//! - Five-field cron evaluation with a 30 second firing window per minute
//! - Timezone-aware evaluation via chrono-tz
//! - [`LegacyScheduler`]: fixed tick, linear scan of the job store
//! - [`PriorityScheduler`]: min-heap keyed by next due time with adaptive
//!   wakeups, driven through a cloneable [`PriorityHandle`]
//! - Graceful shutdown via CancellationToken
//!
//! # Example
//!
//! ```ignore
//! use jobd_scheduler::{PriorityScheduler, SchedulerConfig};
//!
//! let (scheduler, handle) = PriorityScheduler::new(store.clone(), SchedulerConfig::default())?;
//! let (due_tx, mut due_rx) = tokio::sync::mpsc::channel(64);
//! tokio::spawn(scheduler.run(due_tx, shutdown.clone()));
//!
//! handle.add_job(&job)?;
//! while let Some(due) = due_rx.recv().await {
//!     dispatcher.trigger_due(&due.job_id);
//! }
//! ```

mod config;
pub mod cron;
mod error;
mod legacy;
mod metrics;
mod priority;

pub use config::SchedulerConfig;
pub use cron::{matches, matches_in, validate_cron_expression, CronExpr, FIRING_WINDOW_SECS};
pub use error::SchedulerError;
pub use legacy::LegacyScheduler;
pub use metrics::{MetricsSnapshot, SchedulerMetrics};
pub use priority::{DueQueue, PriorityHandle, PriorityScheduler, SchedulerCommand};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Emitted when a job's scheduled time has arrived.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DueJob {
    pub job_id: String,
    /// The occurrence this event stands for
    pub due_at: DateTime<Utc>,
}
