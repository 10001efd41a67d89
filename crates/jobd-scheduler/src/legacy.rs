//! Fixed-tick linear scheduler.
//!
//! Every tick lists all schedulable jobs from the store and checks each one.
//! O(n) per tick; kept as the baseline and fallback behaviour.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use jobd_store::JobStore;
use jobd_types::{interval_after, minute_of, Job, JobFilter, JobStatus, Schedule};

use crate::cron::CronExpr;
use crate::metrics::SchedulerMetrics;
use crate::{DueJob, SchedulerConfig, SchedulerError};

/// Scans the store on a fixed interval.
pub struct LegacyScheduler {
    store: Arc<dyn JobStore>,
    config: SchedulerConfig,
    tz: Tz,
    /// Job id -> minute (seconds since epoch / 60) in which it last fired.
    /// Backed by `Job::last_fired_at`, which survives scheduler rebuilds.
    last_fired: HashMap<String, i64>,
    metrics: Arc<SchedulerMetrics>,
}

impl LegacyScheduler {
    /// Create a scanner over `store`.
    ///
    /// # Errors
    ///
    /// Returns `SchedulerError::InvalidTimezone` for a bad configured timezone.
    pub fn new(store: Arc<dyn JobStore>, config: SchedulerConfig) -> Result<Self, SchedulerError> {
        let tz = config.parse_timezone()?;
        Ok(Self {
            store,
            config,
            tz,
            last_fired: HashMap::new(),
            metrics: Arc::new(SchedulerMetrics::new()),
        })
    }

    pub fn metrics(&self) -> Arc<SchedulerMetrics> {
        self.metrics.clone()
    }

    /// Run one scan at `now` and return the jobs that became due.
    ///
    /// A job that cannot be checked is logged and skipped; it never stops
    /// the scan.
    pub fn tick(&mut self, now: DateTime<Utc>) -> Vec<DueJob> {
        self.metrics.record_check(now);

        let jobs = match self.store.list(&JobFilter::schedulable()) {
            Ok(jobs) => jobs,
            Err(e) => {
                warn!(error = %e, "Failed to list schedulable jobs");
                return Vec::new();
            }
        };
        self.metrics.set_total_scheduled(jobs.len());

        let mut due = Vec::new();
        for job in &jobs {
            match self.check_job(job, now) {
                Ok(Some(event)) => due.push(event),
                Ok(None) => {}
                Err(e) => warn!(job_id = %job.id, error = %e, "Failed to schedule job"),
            }
        }

        // Only the current minute matters. A job that is running during this
        // tick keeps its entry so it cannot refire when it finishes.
        let minute = minute_of(now);
        self.last_fired.retain(|_, fired| *fired >= minute);

        self.metrics.record_fired(due.len());
        if !due.is_empty() {
            debug!(count = due.len(), scanned = jobs.len(), "Jobs due");
        }
        due
    }

    fn check_job(&mut self, job: &Job, now: DateTime<Utc>) -> Result<Option<DueJob>, SchedulerError> {
        match &job.schedule {
            Some(Schedule::Cron { expression }) => {
                let cron = CronExpr::parse(expression)?;
                if !cron.is_due(now, self.tz) {
                    return Ok(None);
                }
                let minute = minute_of(now);
                if self.last_fired.get(&job.id) == Some(&minute) || job.fired_in_minute(minute) {
                    return Ok(None);
                }

                self.store.modify(&job.id, &mut |job| {
                    if job.status == JobStatus::Completed {
                        job.reset_for_rerun()?;
                    }
                    job.last_fired_at = Some(now);
                    Ok(())
                })?;
                self.last_fired.insert(job.id.clone(), minute);
                Ok(Some(DueJob {
                    job_id: job.id.clone(),
                    due_at: now,
                }))
            }
            Some(Schedule::Interval { every_secs, next_run }) => {
                if next_run.is_some_and(|next| now < next) {
                    return Ok(None);
                }

                let next = interval_after(now, *every_secs)
                    .ok_or(SchedulerError::IntervalOutOfRange(*every_secs))?;
                self.store.modify(&job.id, &mut |job| {
                    if job.status == JobStatus::Completed {
                        job.reset_for_rerun()?;
                    }
                    if let Some(Schedule::Interval { next_run, .. }) = &mut job.schedule {
                        *next_run = Some(next);
                    }
                    job.last_fired_at = Some(now);
                    Ok(())
                })?;
                Ok(Some(DueJob {
                    job_id: job.id.clone(),
                    due_at: next_run.unwrap_or(now),
                }))
            }
            None => Ok(None),
        }
    }

    /// Tick until `shutdown` is cancelled, sending due jobs to `due_tx`.
    pub async fn run(mut self, due_tx: mpsc::Sender<DueJob>, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.legacy_tick());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(tick_ms = self.config.legacy_tick_ms, "Legacy scheduler started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    for due in self.tick(Utc::now()) {
                        if due_tx.send(due).await.is_err() {
                            warn!("Due-job receiver dropped, stopping legacy scheduler");
                            return;
                        }
                    }
                }
            }
        }

        info!("Legacy scheduler stopped");
    }
}
