//! Scheduler observability counters.
//!
//! Counters are lock-free so the status handler can read them while the
//! scheduler task owns the queue. They are informational only.

use std::sync::atomic::{AtomicI64, AtomicU64, AtomicUsize, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Live counters shared between a scheduler task and its readers.
#[derive(Debug, Default)]
pub struct SchedulerMetrics {
    total_scheduled: AtomicUsize,
    due_checks: AtomicU64,
    jobs_fired: AtomicU64,
    /// Milliseconds since the epoch, 0 = never woke
    last_wake_ms: AtomicI64,
}

/// Point-in-time copy of [`SchedulerMetrics`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub total_scheduled_jobs: usize,
    pub due_checks: u64,
    pub jobs_fired: u64,
    pub last_wake: Option<DateTime<Utc>>,
}

impl SchedulerMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_total_scheduled(&self, count: usize) {
        self.total_scheduled.store(count, Ordering::Relaxed);
    }

    /// Record one wake/tick at `now`.
    pub fn record_check(&self, now: DateTime<Utc>) {
        self.due_checks.fetch_add(1, Ordering::Relaxed);
        self.last_wake_ms
            .store(now.timestamp_millis(), Ordering::Relaxed);
    }

    pub fn record_fired(&self, count: usize) {
        self.jobs_fired.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let last_wake_ms = self.last_wake_ms.load(Ordering::Relaxed);
        MetricsSnapshot {
            total_scheduled_jobs: self.total_scheduled.load(Ordering::Relaxed),
            due_checks: self.due_checks.load(Ordering::Relaxed),
            jobs_fired: self.jobs_fired.load(Ordering::Relaxed),
            last_wake: (last_wake_ms != 0)
                .then(|| DateTime::from_timestamp_millis(last_wake_ms))
                .flatten(),
        }
    }
}
