//! Priority-queue scheduler with adaptive wakeups.
//!
//! The scheduler task owns a [`DueQueue`] (min-heap keyed by next due time)
//! and sleeps for `clamp(next_due - now, min_check, max_check)`. On wake it
//! pops everything due within `now + due_buffer`, emits a [`DueJob`] per
//! entry and reinserts recurring jobs at their next occurrence. Commands
//! from other tasks arrive through a [`PriorityHandle`].

use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Timelike, Utc};
use chrono_tz::Tz;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use jobd_store::JobStore;
use jobd_types::{interval_after, minute_of, Job, JobFilter, JobStatus, Schedule};

use crate::cron::CronExpr;
use crate::metrics::SchedulerMetrics;
use crate::{DueJob, SchedulerConfig, SchedulerError};

#[derive(Debug, Clone, PartialEq, Eq)]
struct HeapEntry {
    due: DateTime<Utc>,
    generation: u64,
    job_id: String,
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.due
            .cmp(&other.due)
            .then(self.generation.cmp(&other.generation))
    }
}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Min-heap of `(next_due, job_id)`.
///
/// Removal and rescheduling are lazy: the live due time of each job is kept
/// in `tracked` with a generation number, and heap entries whose generation
/// no longer matches are discarded when they reach the top.
#[derive(Debug, Default)]
pub struct DueQueue {
    heap: BinaryHeap<Reverse<HeapEntry>>,
    tracked: HashMap<String, (DateTime<Utc>, u64)>,
    next_generation: u64,
}

impl DueQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track `job_id` as due at `due`, replacing any previous entry.
    pub fn insert(&mut self, job_id: &str, due: DateTime<Utc>) {
        self.next_generation += 1;
        let generation = self.next_generation;
        self.tracked.insert(job_id.to_string(), (due, generation));
        self.heap.push(Reverse(HeapEntry {
            due,
            generation,
            job_id: job_id.to_string(),
        }));
        self.maybe_compact();
    }

    /// Stop tracking `job_id`. Returns `false` if it was not tracked.
    pub fn remove(&mut self, job_id: &str) -> bool {
        let removed = self.tracked.remove(job_id).is_some();
        self.maybe_compact();
        removed
    }

    pub fn contains(&self, job_id: &str) -> bool {
        self.tracked.contains_key(job_id)
    }

    pub fn due_time(&self, job_id: &str) -> Option<DateTime<Utc>> {
        self.tracked.get(job_id).map(|(due, _)| *due)
    }

    pub fn len(&self) -> usize {
        self.tracked.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracked.is_empty()
    }

    /// Earliest due time among tracked jobs.
    pub fn peek_due(&mut self) -> Option<DateTime<Utc>> {
        self.discard_stale_top();
        self.heap.peek().map(|Reverse(entry)| entry.due)
    }

    /// Pop every tracked job due at or before `until`, earliest first.
    pub fn pop_due(&mut self, until: DateTime<Utc>) -> Vec<(String, DateTime<Utc>)> {
        let mut due = Vec::new();
        loop {
            self.discard_stale_top();
            match self.heap.peek() {
                Some(Reverse(entry)) if entry.due <= until => {}
                _ => break,
            }
            if let Some(Reverse(entry)) = self.heap.pop() {
                self.tracked.remove(&entry.job_id);
                due.push((entry.job_id, entry.due));
            }
        }
        due
    }

    fn is_live(&self, entry: &HeapEntry) -> bool {
        self.tracked
            .get(&entry.job_id)
            .is_some_and(|(_, generation)| *generation == entry.generation)
    }

    fn discard_stale_top(&mut self) {
        while let Some(Reverse(top)) = self.heap.peek() {
            if self.is_live(top) {
                break;
            }
            self.heap.pop();
        }
    }

    /// Rebuild the heap once stale entries dominate it.
    fn maybe_compact(&mut self) {
        if self.heap.len() <= 2 * self.tracked.len() + 64 {
            return;
        }
        let entries: Vec<_> = std::mem::take(&mut self.heap)
            .into_iter()
            .filter(|Reverse(entry)| self.is_live(entry))
            .collect();
        self.heap = entries.into_iter().collect();
    }
}

/// Requests accepted by a running [`PriorityScheduler`].
#[derive(Debug, Clone)]
pub enum SchedulerCommand {
    /// Track (or re-track) a job using its current schedule
    Add(Job),
    /// Stop tracking a job
    Remove(String),
    /// A run finished; re-read the job and track it again if recurring
    JobFinished(String),
}

/// Cloneable handle used by the daemon to talk to the scheduler task.
#[derive(Clone)]
pub struct PriorityHandle {
    commands: mpsc::UnboundedSender<SchedulerCommand>,
    metrics: Arc<SchedulerMetrics>,
}

impl PriorityHandle {
    fn send(&self, command: SchedulerCommand) -> Result<(), SchedulerError> {
        self.commands
            .send(command)
            .map_err(|_| SchedulerError::NotRunning)
    }

    pub fn add_job(&self, job: &Job) -> Result<(), SchedulerError> {
        self.send(SchedulerCommand::Add(job.clone()))
    }

    /// Removing a job that is not queued (e.g. already popped and
    /// executing) is a no-op.
    pub fn remove_job(&self, job_id: &str) -> Result<(), SchedulerError> {
        self.send(SchedulerCommand::Remove(job_id.to_string()))
    }

    pub fn job_finished(&self, job_id: &str) -> Result<(), SchedulerError> {
        self.send(SchedulerCommand::JobFinished(job_id.to_string()))
    }

    pub fn metrics(&self) -> Arc<SchedulerMetrics> {
        self.metrics.clone()
    }
}

/// Heap-driven scheduler task.
pub struct PriorityScheduler {
    store: Arc<dyn JobStore>,
    config: SchedulerConfig,
    tz: Tz,
    queue: DueQueue,
    metrics: Arc<SchedulerMetrics>,
    commands: mpsc::UnboundedReceiver<SchedulerCommand>,
}

impl PriorityScheduler {
    /// Create the scheduler and the handle used to command it.
    ///
    /// # Errors
    ///
    /// Returns `SchedulerError::InvalidTimezone` for a bad configured timezone.
    pub fn new(
        store: Arc<dyn JobStore>,
        config: SchedulerConfig,
    ) -> Result<(Self, PriorityHandle), SchedulerError> {
        let tz = config.parse_timezone()?;
        let (tx, rx) = mpsc::unbounded_channel();
        let metrics = Arc::new(SchedulerMetrics::new());
        let handle = PriorityHandle {
            commands: tx,
            metrics: metrics.clone(),
        };
        Ok((
            Self {
                store,
                config,
                tz,
                queue: DueQueue::new(),
                metrics,
                commands: rx,
            },
            handle,
        ))
    }

    pub fn queue(&self) -> &DueQueue {
        &self.queue
    }

    /// Seed the queue from every schedulable job in the store.
    pub fn load(&mut self, now: DateTime<Utc>) -> Result<usize, SchedulerError> {
        let jobs = self.store.list(&JobFilter::schedulable())?;
        for job in &jobs {
            self.track(job, now);
        }
        self.metrics.set_total_scheduled(self.queue.len());
        info!(count = self.queue.len(), "Priority scheduler loaded jobs");
        Ok(self.queue.len())
    }

    /// First due time for a job being (re)tracked at `now`.
    ///
    /// A cron job whose current minute matches and is still inside the
    /// firing window is due at the start of this minute, unless it already
    /// fired in this minute (before a pause, resume or daemon restart).
    pub fn initial_due(&self, job: &Job, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match job.schedule.as_ref()? {
            Schedule::Cron { expression } => {
                let cron = parse_logged(expression, &job.id)?;
                if cron.is_due(now, self.tz) && !job.fired_in_minute(minute_of(now)) {
                    now.with_second(0).and_then(|t| t.with_nanosecond(0))
                } else {
                    cron.next_after(now, self.tz)
                }
            }
            Schedule::Interval { next_run, .. } => Some(next_run.unwrap_or(now)),
        }
    }

    fn track(&mut self, job: &Job, now: DateTime<Utc>) {
        if !job.is_schedulable() {
            self.queue.remove(&job.id);
            return;
        }
        match self.initial_due(job, now) {
            Some(due) => self.queue.insert(&job.id, due),
            None => {
                self.queue.remove(&job.id);
            }
        }
    }

    /// Apply one command at `now`.
    pub fn apply(&mut self, command: SchedulerCommand, now: DateTime<Utc>) {
        match command {
            SchedulerCommand::Add(job) => {
                debug!(job_id = %job.id, "Tracking job");
                self.track(&job, now);
            }
            SchedulerCommand::Remove(job_id) => {
                if self.queue.remove(&job_id) {
                    debug!(job_id = %job_id, "Untracked job");
                }
            }
            SchedulerCommand::JobFinished(job_id) => {
                if self.queue.contains(&job_id) {
                    return;
                }
                match self.store.get(&job_id) {
                    Ok(Some(job)) if job.is_schedulable() => {
                        let next = match &job.schedule {
                            Some(Schedule::Cron { expression }) => {
                                parse_logged(expression, &job.id).and_then(|c| c.next_after(now, self.tz))
                            }
                            _ => self.initial_due(&job, now),
                        };
                        if let Some(next) = next {
                            self.queue.insert(&job.id, next);
                        }
                    }
                    Ok(_) => {}
                    Err(e) => warn!(job_id = %job_id, error = %e, "Failed to reload finished job"),
                }
            }
        }
        self.metrics.set_total_scheduled(self.queue.len());
    }

    /// Delay until the next wake: `clamp(next_due - now, min, max)`.
    pub fn next_delay(&mut self, now: DateTime<Utc>) -> Duration {
        let min = self.config.min_check_interval();
        let max = self.config.max_check_interval();
        match self.queue.peek_due() {
            Some(due) => (due - now).to_std().unwrap_or(Duration::ZERO).clamp(min, max),
            None => max,
        }
    }

    /// Pop and emit everything due within `now + due_buffer`.
    pub fn wake(&mut self, now: DateTime<Utc>) -> Vec<DueJob> {
        self.metrics.record_check(now);
        let mut fired = Vec::new();

        for (job_id, due_at) in self.queue.pop_due(now + self.config.due_buffer()) {
            let job = match self.store.get(&job_id) {
                Ok(Some(job)) => job,
                Ok(None) => {
                    debug!(job_id = %job_id, "Due job no longer exists");
                    continue;
                }
                Err(e) => {
                    warn!(job_id = %job_id, error = %e, "Failed to load due job");
                    continue;
                }
            };

            match job.status {
                JobStatus::Created | JobStatus::Completed => {
                    let is_cron = matches!(job.schedule, Some(Schedule::Cron { .. }));
                    if is_cron && job.fired_in_minute(minute_of(due_at)) {
                        debug!(job_id = %job.id, "Occurrence already fired");
                    } else if let Err(e) = self.store.modify(&job.id, &mut |job| {
                        job.last_fired_at = Some(due_at);
                        Ok(())
                    }) {
                        warn!(job_id = %job.id, error = %e, "Failed to record fire time");
                    } else {
                        fired.push(DueJob {
                            job_id: job.id.clone(),
                            due_at,
                        });
                    }
                }
                // Previous run still active: skip this occurrence.
                JobStatus::Running => {
                    debug!(job_id = %job.id, "Skipping occurrence, job still running");
                }
                JobStatus::Failed | JobStatus::Paused | JobStatus::Stopped | JobStatus::Cancelled => {
                    debug!(job_id = %job.id, status = %job.status, "Dropping job from queue");
                    continue;
                }
            }

            if let Err(e) = self.reschedule(&job, due_at, now) {
                warn!(job_id = %job.id, error = %e, "Failed to reschedule job");
            }
        }

        self.metrics.set_total_scheduled(self.queue.len());
        self.metrics.record_fired(fired.len());
        fired
    }

    fn reschedule(
        &mut self,
        job: &Job,
        due_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<(), SchedulerError> {
        match &job.schedule {
            Some(Schedule::Cron { expression }) => {
                let cron = CronExpr::parse(expression)?;
                if let Some(next) = cron.next_after(due_at.max(now), self.tz) {
                    self.queue.insert(&job.id, next);
                }
            }
            Some(Schedule::Interval { every_secs, .. }) => {
                let next = interval_after(now, *every_secs)
                    .ok_or(SchedulerError::IntervalOutOfRange(*every_secs))?;
                self.store.modify(&job.id, &mut |job| {
                    if let Some(Schedule::Interval { next_run, .. }) = &mut job.schedule {
                        *next_run = Some(next);
                    }
                    Ok(())
                })?;
                self.queue.insert(&job.id, next);
            }
            None => {}
        }
        Ok(())
    }

    /// Seed from the store, then serve commands and wakeups until
    /// `shutdown` is cancelled.
    pub async fn run(mut self, due_tx: mpsc::Sender<DueJob>, shutdown: CancellationToken) {
        if let Err(e) = self.load(Utc::now()) {
            warn!(error = %e, "Failed to load jobs into priority scheduler");
        }
        info!(
            min_ms = self.config.min_check_interval_ms,
            max_ms = self.config.max_check_interval_ms,
            "Priority scheduler started"
        );

        loop {
            let delay = self.next_delay(Utc::now());
            tokio::select! {
                _ = shutdown.cancelled() => break,
                command = self.commands.recv() => match command {
                    Some(command) => self.apply(command, Utc::now()),
                    None => break,
                },
                _ = tokio::time::sleep(delay) => {
                    for due in self.wake(Utc::now()) {
                        if due_tx.send(due).await.is_err() {
                            warn!("Due-job receiver dropped, stopping priority scheduler");
                            return;
                        }
                    }
                }
            }
        }

        info!("Priority scheduler stopped");
    }
}

fn parse_logged(expression: &str, job_id: &str) -> Option<CronExpr> {
    match CronExpr::parse(expression) {
        Ok(cron) => Some(cron),
        Err(e) => {
            warn!(job_id = %job_id, error = %e, "Job has a malformed cron expression");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobd_store::Store;
    use jobd_types::JobSpec;
    use proptest::prelude::*;

    fn at(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    fn config() -> SchedulerConfig {
        SchedulerConfig {
            min_check_interval_ms: 100,
            max_check_interval_ms: 10_000,
            due_buffer_ms: 500,
            ..Default::default()
        }
    }

    fn setup() -> (Arc<Store>, PriorityScheduler, PriorityHandle) {
        let store = Arc::new(Store::in_memory());
        let (scheduler, handle) = PriorityScheduler::new(store.clone(), config()).unwrap();
        (store, scheduler, handle)
    }

    #[test]
    fn test_queue_peek_is_minimum() {
        let mut queue = DueQueue::new();
        queue.insert("b", at("2024-01-01T00:02:00Z"));
        queue.insert("a", at("2024-01-01T00:01:00Z"));
        queue.insert("c", at("2024-01-01T00:03:00Z"));
        assert_eq!(queue.peek_due(), Some(at("2024-01-01T00:01:00Z")));

        queue.remove("a");
        assert_eq!(queue.peek_due(), Some(at("2024-01-01T00:02:00Z")));
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_queue_reinsert_replaces() {
        let mut queue = DueQueue::new();
        queue.insert("a", at("2024-01-01T00:01:00Z"));
        queue.insert("a", at("2024-01-01T00:05:00Z"));
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.peek_due(), Some(at("2024-01-01T00:05:00Z")));

        let popped = queue.pop_due(at("2024-01-01T00:10:00Z"));
        assert_eq!(popped, vec![("a".to_string(), at("2024-01-01T00:05:00Z"))]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_queue_remove_unknown_is_noop() {
        let mut queue = DueQueue::new();
        assert!(!queue.remove("ghost"));
        queue.insert("a", at("2024-01-01T00:01:00Z"));
        queue.pop_due(at("2024-01-01T00:01:00Z"));
        // Already popped
        assert!(!queue.remove("a"));
        assert_eq!(queue.peek_due(), None);
    }

    #[test]
    fn test_queue_pop_in_due_order() {
        let mut queue = DueQueue::new();
        queue.insert("late", at("2024-01-01T00:03:00Z"));
        queue.insert("early", at("2024-01-01T00:01:00Z"));
        queue.insert("future", at("2024-01-01T01:00:00Z"));

        let ids: Vec<String> = queue
            .pop_due(at("2024-01-01T00:05:00Z"))
            .into_iter()
            .map(|(id, _)| id)
            .collect();
        assert_eq!(ids, vec!["early", "late"]);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_past_due_job_fires_on_next_wake() {
        let (store, mut scheduler, _handle) = setup();
        let now = at("2024-01-01T12:00:00Z");
        let mut job = Job::from_spec(JobSpec::new("overdue", "true").with_interval(60), now);
        if let Some(Schedule::Interval { next_run, .. }) = &mut job.schedule {
            *next_run = Some(now - chrono::Duration::hours(3));
        }
        let job = store.create(job).unwrap();

        scheduler.apply(SchedulerCommand::Add(job.clone()), now);
        assert_eq!(scheduler.next_delay(now), Duration::from_millis(100));

        let due = scheduler.wake(now);
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].job_id, job.id);

        // Rescheduled one interval after the wake, in the queue and the store
        let next = now + chrono::Duration::seconds(60);
        assert_eq!(scheduler.queue().due_time(&job.id), Some(next));
        let stored = store.get(&job.id).unwrap().unwrap();
        assert_eq!(stored.schedule.unwrap().next_run(), Some(next));
    }

    #[test]
    fn test_cron_job_reinserted_at_next_occurrence() {
        let (store, mut scheduler, _handle) = setup();
        let now = at("2024-01-01T00:00:10Z");
        let job = store
            .create(Job::from_spec(
                JobSpec::new("midnight", "true").with_cron("0 0 * * *"),
                now,
            ))
            .unwrap();

        scheduler.apply(SchedulerCommand::Add(job.clone()), now);
        assert_eq!(scheduler.queue().due_time(&job.id), Some(at("2024-01-01T00:00:00Z")));

        assert_eq!(scheduler.wake(now).len(), 1);
        assert_eq!(scheduler.queue().due_time(&job.id), Some(at("2024-01-02T00:00:00Z")));
        // Same minute, nothing left to fire
        assert!(scheduler.wake(at("2024-01-01T00:00:20Z")).is_empty());
    }

    #[test]
    fn test_resumed_cron_job_not_refired_in_same_minute() {
        let (store, mut scheduler, _handle) = setup();
        let now = at("2024-01-01T00:00:03Z");
        let job = store
            .create(Job::from_spec(
                JobSpec::new("midnight", "true").with_cron("0 0 * * *"),
                now,
            ))
            .unwrap();
        scheduler.apply(SchedulerCommand::Add(job.clone()), now);
        assert_eq!(scheduler.wake(now).len(), 1);

        // Runs, gets paused, then is resumed within the same minute
        store
            .modify(&job.id, &mut |job| {
                job.transition(JobStatus::Running)?;
                job.transition(JobStatus::Completed)?;
                job.transition(JobStatus::Paused)?;
                Ok(job.transition(JobStatus::Created)?)
            })
            .unwrap();
        scheduler.apply(SchedulerCommand::Remove(job.id.clone()), now);
        let resumed = store.get(&job.id).unwrap().unwrap();
        let later = at("2024-01-01T00:00:20Z");
        scheduler.apply(SchedulerCommand::Add(resumed), later);

        assert_eq!(scheduler.queue().due_time(&job.id), Some(at("2024-01-02T00:00:00Z")));
        assert!(scheduler.wake(later).is_empty());
    }

    #[test]
    fn test_reloaded_scheduler_not_refired_in_same_minute() {
        let (store, mut scheduler, _handle) = setup();
        let now = at("2024-01-01T00:00:03Z");
        let job = store
            .create(Job::from_spec(
                JobSpec::new("midnight", "true").with_cron("0 0 * * *"),
                now,
            ))
            .unwrap();
        scheduler.load(now).unwrap();
        assert_eq!(scheduler.wake(now).len(), 1);
        assert_eq!(
            store.get(&job.id).unwrap().unwrap().last_fired_at,
            Some(at("2024-01-01T00:00:00Z"))
        );

        let (mut restarted, _handle) = PriorityScheduler::new(store.clone(), config()).unwrap();
        let later = at("2024-01-01T00:00:25Z");
        restarted.load(later).unwrap();
        assert_eq!(restarted.queue().due_time(&job.id), Some(at("2024-01-02T00:00:00Z")));
        assert!(restarted.wake(later).is_empty());
    }

    #[test]
    fn test_stale_cron_entry_does_not_refire() {
        let (store, mut scheduler, _handle) = setup();
        let now = at("2024-01-01T00:00:03Z");
        let mut job = Job::from_spec(JobSpec::new("midnight", "true").with_cron("0 0 * * *"), now);
        job.last_fired_at = Some(at("2024-01-01T00:00:01Z"));
        let job = store.create(job).unwrap();

        // Queued directly at this minute, as an entry from before the fire
        scheduler.queue.insert(&job.id, at("2024-01-01T00:00:00Z"));
        assert!(scheduler.wake(now).is_empty());
        assert_eq!(scheduler.queue().due_time(&job.id), Some(at("2024-01-02T00:00:00Z")));
    }

    #[test]
    fn test_out_of_range_interval_not_rescheduled() {
        let (store, mut scheduler, _handle) = setup();
        let now = at("2024-01-01T00:00:00Z");
        let mut job = Job::from_spec(JobSpec::new("forever", "true"), now);
        job.schedule = Some(Schedule::Interval {
            every_secs: u64::MAX,
            next_run: None,
        });
        let job = store.create(job).unwrap();

        let err = scheduler.reschedule(&job, now, now).unwrap_err();
        assert!(matches!(err, SchedulerError::IntervalOutOfRange(u64::MAX)));
        assert!(!scheduler.queue().contains(&job.id));
    }

    #[test]
    fn test_delay_is_clamped() {
        let (store, mut scheduler, _handle) = setup();
        let now = at("2024-01-01T00:00:00Z");
        assert_eq!(scheduler.next_delay(now), Duration::from_secs(10));

        let soon = store
            .create(Job::from_spec(JobSpec::new("soon", "true").with_interval(2), now))
            .unwrap();
        scheduler.apply(SchedulerCommand::Add(soon.clone()), now);
        assert_eq!(scheduler.next_delay(now), Duration::from_secs(2));

        let far = store
            .create(Job::from_spec(JobSpec::new("far", "true").with_interval(86_400), now))
            .unwrap();
        scheduler.apply(SchedulerCommand::Remove(soon.id), now);
        scheduler.apply(SchedulerCommand::Add(far), now);
        assert_eq!(scheduler.next_delay(now), Duration::from_secs(10));
    }

    #[test]
    fn test_running_job_skipped_but_kept() {
        let (store, mut scheduler, _handle) = setup();
        let now = at("2024-01-01T00:00:00Z");
        let job = store
            .create(Job::from_spec(JobSpec::new("busy", "true").with_cron("* * * * *"), now))
            .unwrap();
        scheduler.apply(SchedulerCommand::Add(job.clone()), now);
        store
            .modify(&job.id, &mut |job| Ok(job.transition(JobStatus::Running)?))
            .unwrap();

        assert!(scheduler.wake(now).is_empty());
        assert_eq!(scheduler.queue().due_time(&job.id), Some(at("2024-01-01T00:01:00Z")));
    }

    #[test]
    fn test_paused_and_removed_jobs_dropped() {
        let (store, mut scheduler, _handle) = setup();
        let now = at("2024-01-01T00:00:00Z");
        let paused = store
            .create(Job::from_spec(JobSpec::new("p", "true").with_cron("* * * * *"), now))
            .unwrap();
        let removed = store
            .create(Job::from_spec(JobSpec::new("r", "true").with_cron("* * * * *"), now))
            .unwrap();
        scheduler.load(now).unwrap();
        assert_eq!(scheduler.queue().len(), 2);

        store
            .modify(&paused.id, &mut |job| Ok(job.transition(JobStatus::Paused)?))
            .unwrap();
        store.remove(&removed.id).unwrap();

        assert!(scheduler.wake(now).is_empty());
        assert!(scheduler.queue().is_empty());
    }

    #[test]
    fn test_job_finished_retracks_recurring_job() {
        let (store, mut scheduler, _handle) = setup();
        let now = at("2024-01-01T00:00:05Z");
        let job = store
            .create(Job::from_spec(JobSpec::new("hourly", "true").with_cron("0 * * * *"), now))
            .unwrap();
        store
            .modify(&job.id, &mut |job| {
                job.transition(JobStatus::Running)?;
                Ok(job.transition(JobStatus::Completed)?)
            })
            .unwrap();

        scheduler.apply(SchedulerCommand::JobFinished(job.id.clone()), now);
        assert_eq!(scheduler.queue().due_time(&job.id), Some(at("2024-01-01T01:00:00Z")));
    }

    #[test]
    fn test_metrics_track_queue() {
        let (store, mut scheduler, handle) = setup();
        let now = at("2024-01-01T00:00:00Z");
        store
            .create(Job::from_spec(JobSpec::new("a", "true").with_cron("* * * * *"), now))
            .unwrap();
        scheduler.load(now).unwrap();
        scheduler.wake(now);

        let snap = handle.metrics().snapshot();
        assert_eq!(snap.total_scheduled_jobs, 1);
        assert_eq!(snap.due_checks, 1);
        assert_eq!(snap.jobs_fired, 1);
        assert_eq!(snap.last_wake, Some(now));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_serves_handle_commands() {
        let store = Arc::new(Store::in_memory());
        let (scheduler, handle) = PriorityScheduler::new(store.clone(), config()).unwrap();
        let (tx, mut rx) = mpsc::channel(8);
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(scheduler.run(tx, shutdown.clone()));

        let mut job = Job::from_spec(JobSpec::new("now", "true").with_interval(3600), Utc::now());
        if let Some(Schedule::Interval { next_run, .. }) = &mut job.schedule {
            *next_run = Some(Utc::now());
        }
        let job = store.create(job).unwrap();
        handle.add_job(&job).unwrap();

        let due = rx.recv().await.unwrap();
        assert_eq!(due.job_id, job.id);

        // Removing an in-flight job is a no-op
        handle.remove_job(&job.id).unwrap();
        handle.remove_job("does-not-exist").unwrap();

        shutdown.cancel();
        task.await.unwrap();
        assert!(matches!(handle.add_job(&job), Err(SchedulerError::NotRunning)));
    }

    #[derive(Debug, Clone)]
    enum Op {
        Add(u8, i64),
        Remove(u8),
        Pop(i64),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0u8..16, 0i64..10_000).prop_map(|(id, t)| Op::Add(id, t)),
            (0u8..16).prop_map(Op::Remove),
            (0i64..10_000).prop_map(Op::Pop),
        ]
    }

    proptest! {
        /// Property: peek always equals the minimum due time among tracked jobs.
        #[test]
        fn peek_equals_tracked_minimum(ops in proptest::collection::vec(op(), 1..200)) {
            let base = at("2024-01-01T00:00:00Z");
            let mut queue = DueQueue::new();
            let mut model: HashMap<String, DateTime<Utc>> = HashMap::new();

            for op in ops {
                match op {
                    Op::Add(id, t) => {
                        let due = base + chrono::Duration::seconds(t);
                        queue.insert(&id.to_string(), due);
                        model.insert(id.to_string(), due);
                    }
                    Op::Remove(id) => {
                        prop_assert_eq!(queue.remove(&id.to_string()), model.remove(&id.to_string()).is_some());
                    }
                    Op::Pop(t) => {
                        let until = base + chrono::Duration::seconds(t);
                        let popped = queue.pop_due(until);
                        for (id, due) in &popped {
                            prop_assert!(*due <= until);
                            prop_assert_eq!(model.remove(id), Some(*due));
                        }
                        prop_assert!(model.values().all(|due| *due > until));
                    }
                }
                prop_assert_eq!(queue.peek_due(), model.values().min().copied());
                prop_assert_eq!(queue.len(), model.len());
            }
        }
    }
}
