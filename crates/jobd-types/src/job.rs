//! Job records and their status lifecycle.
//!
//! A job moves through `created → running → {completed, failed}`. Recurring
//! jobs are reset from `completed`/`failed` back to `created` so they can fire
//! again. `paused`, `stopped` and `cancelled` are reachable from the control
//! plane. Every transition goes through [`JobStatus::can_transition_to`].

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::TypesError;

/// Metadata key carrying the owning workflow execution id.
pub const META_EXECUTION_ID: &str = "workflow.execution_id";
/// Metadata key carrying the human-readable workflow run id.
pub const META_RUN_ID: &str = "workflow.run_id";
/// Metadata key carrying the workflow node id that produced the job.
pub const META_NODE_ID: &str = "workflow.node_id";

/// Longest accepted repeat interval (100 years).
pub const MAX_INTERVAL_SECS: u64 = 100 * 365 * 24 * 60 * 60;

/// `now + every_secs`, or `None` when the sum does not fit a timestamp.
pub fn interval_after(now: DateTime<Utc>, every_secs: u64) -> Option<DateTime<Utc>> {
    let secs = i64::try_from(every_secs).ok()?;
    now.checked_add_signed(chrono::Duration::try_seconds(secs)?)
}

/// Minute index (seconds since the epoch / 60) containing `t`.
pub fn minute_of(t: DateTime<Utc>) -> i64 {
    t.timestamp().div_euclid(60)
}

/// Status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Created,
    Running,
    Completed,
    Failed,
    Paused,
    Stopped,
    Cancelled,
}

impl JobStatus {
    /// All statuses, in lifecycle order.
    pub const ALL: [JobStatus; 7] = [
        JobStatus::Created,
        JobStatus::Running,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Paused,
        JobStatus::Stopped,
        JobStatus::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Created => "created",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Paused => "paused",
            JobStatus::Stopped => "stopped",
            JobStatus::Cancelled => "cancelled",
        }
    }

    /// Whether a run has finished (successfully or not).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Stopped | JobStatus::Cancelled
        )
    }

    /// Check whether moving from `self` to `next` is a legal transition.
    ///
    /// Forward moves are monotonic. The only backward edges are the resets to
    /// `created` used for recurrence, retries, manual re-runs and resume.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Created, Running | Paused | Cancelled)
                | (Running, Completed | Failed | Stopped | Cancelled)
                | (Completed, Created | Paused)
                | (Failed, Created | Paused)
                | (Stopped, Created)
                | (Cancelled, Created)
                | (Paused, Created | Cancelled)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = TypesError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| TypesError::InvalidInput(format!("unknown job status '{}'", s)))
    }
}

/// How the command is launched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    /// Run through `sh -c`, args are appended as positional parameters.
    #[default]
    Shell,
    /// Spawn the program directly with the given args.
    Exec,
}

/// When a job should run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Schedule {
    /// Five-field cron expression.
    Cron { expression: String },
    /// Fixed repeat interval.
    Interval {
        every_secs: u64,
        #[serde(default)]
        next_run: Option<DateTime<Utc>>,
    },
}

impl Schedule {
    pub fn cron_expression(&self) -> Option<&str> {
        match self {
            Schedule::Cron { expression } => Some(expression),
            Schedule::Interval { .. } => None,
        }
    }

    pub fn interval(&self) -> Option<Duration> {
        match self {
            Schedule::Interval { every_secs, .. } => Some(Duration::from_secs(*every_secs)),
            Schedule::Cron { .. } => None,
        }
    }

    pub fn next_run(&self) -> Option<DateTime<Utc>> {
        match self {
            Schedule::Interval { next_run, .. } => *next_run,
            Schedule::Cron { .. } => None,
        }
    }
}

/// Request payload used to create a job.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default, rename = "type")]
    pub job_type: JobType,
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub max_memory_mb: Option<u64>,
    #[serde(default)]
    pub max_cpu_percent: Option<u32>,
    /// Cron expression (mutually exclusive with `interval_secs`)
    #[serde(default)]
    pub cron: Option<String>,
    /// Repeat interval in seconds (mutually exclusive with `cron`)
    #[serde(default)]
    pub interval_secs: Option<u64>,
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl JobSpec {
    /// Create a minimal shell job spec.
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            ..Default::default()
        }
    }

    pub fn with_cron(mut self, expression: impl Into<String>) -> Self {
        self.cron = Some(expression.into());
        self
    }

    pub fn with_interval(mut self, every_secs: u64) -> Self {
        self.interval_secs = Some(every_secs);
        self
    }

    /// Structural validation.
    ///
    /// Cron syntax and command policy are checked by the scheduler and the
    /// dispatcher respectively; this only rejects records that can never run.
    pub fn validate(&self) -> Result<(), TypesError> {
        if self.command.trim().is_empty() {
            return Err(TypesError::InvalidInput(
                "command must not be empty".to_string(),
            ));
        }
        if self.name.trim().is_empty() {
            return Err(TypesError::InvalidInput("name must not be empty".to_string()));
        }
        if self.cron.is_some() && self.interval_secs.is_some() {
            return Err(TypesError::InvalidInput(
                "cron and interval schedules are mutually exclusive".to_string(),
            ));
        }
        match self.interval_secs {
            Some(0) => {
                return Err(TypesError::InvalidInput(
                    "interval_secs must be > 0".to_string(),
                ))
            }
            Some(every) if every > MAX_INTERVAL_SECS => {
                return Err(TypesError::InvalidInput(format!(
                    "interval_secs must be at most {}",
                    MAX_INTERVAL_SECS
                )))
            }
            _ => {}
        }
        if self.timeout_secs == Some(0) {
            return Err(TypesError::InvalidInput("timeout_secs must be > 0".to_string()));
        }
        Ok(())
    }

    fn schedule(&self, now: DateTime<Utc>) -> Option<Schedule> {
        if let Some(expression) = &self.cron {
            return Some(Schedule::Cron {
                expression: expression.trim().to_string(),
            });
        }
        self.interval_secs.map(|every_secs| Schedule::Interval {
            every_secs,
            next_run: interval_after(now, every_secs),
        })
    }
}

/// A schedulable unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default, rename = "type")]
    pub job_type: JobType,
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub max_memory_mb: Option<u64>,
    #[serde(default)]
    pub max_cpu_percent: Option<u32>,
    #[serde(default)]
    pub schedule: Option<Schedule>,
    pub status: JobStatus,

    // Runtime fields
    #[serde(default)]
    pub pid: Option<u32>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    #[serde(default)]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default)]
    pub last_error: Option<String>,
    /// When a scheduler last fired this job. Survives reruns and daemon
    /// restarts so a cron job fires at most once per matching minute.
    #[serde(default)]
    pub last_fired_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Build a new `created` job from a validated spec.
    pub fn from_spec(spec: JobSpec, now: DateTime<Utc>) -> Self {
        let schedule = spec.schedule(now);
        Self {
            id: crate::new_id(),
            name: spec.name,
            command: spec.command,
            args: spec.args,
            job_type: spec.job_type,
            cwd: spec.cwd,
            env: spec.env,
            timeout_secs: spec.timeout_secs,
            max_memory_mb: spec.max_memory_mb,
            max_cpu_percent: spec.max_cpu_percent,
            schedule,
            status: JobStatus::Created,
            pid: None,
            started_at: None,
            completed_at: None,
            stdout: String::new(),
            stderr: String::new(),
            exit_code: None,
            retry_count: 0,
            max_retries: spec.max_retries,
            last_error: None,
            last_fired_at: None,
            metadata: spec.metadata,
            created_at: now,
            updated_at: now,
        }
    }

    /// Move to `next`, rejecting illegal transitions.
    pub fn transition(&mut self, next: JobStatus) -> Result<(), TypesError> {
        if !self.status.can_transition_to(next) {
            return Err(TypesError::InvalidTransition {
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        self.status = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Reset a finished job to `created`, clearing the previous run.
    pub fn reset_for_rerun(&mut self) -> Result<(), TypesError> {
        self.transition(JobStatus::Created)?;
        self.pid = None;
        self.started_at = None;
        self.completed_at = None;
        self.exit_code = None;
        self.stdout.clear();
        self.stderr.clear();
        Ok(())
    }

    /// Whether a scheduler already fired this job in `minute`.
    pub fn fired_in_minute(&self, minute: i64) -> bool {
        self.last_fired_at.map(minute_of) == Some(minute)
    }

    pub fn is_recurring(&self) -> bool {
        self.schedule.is_some()
    }

    /// Whether the schedulers should consider this job at all.
    pub fn is_schedulable(&self) -> bool {
        self.is_recurring() && matches!(self.status, JobStatus::Created | JobStatus::Completed)
    }

    /// The workflow execution that owns this job, if any.
    pub fn execution_id(&self) -> Option<&str> {
        self.metadata.get(META_EXECUTION_ID).map(String::as_str)
    }
}

/// Filter for listing jobs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobFilter {
    /// Only jobs in one of these statuses
    #[serde(default)]
    pub statuses: Option<Vec<JobStatus>>,
    /// Only jobs with (true) or without (false) a schedule
    #[serde(default)]
    pub scheduled: Option<bool>,
    /// Case-insensitive substring of the job name
    #[serde(default)]
    pub name_contains: Option<String>,
}

impl JobFilter {
    /// Jobs the schedulers scan on every tick.
    pub fn schedulable() -> Self {
        Self {
            statuses: Some(vec![JobStatus::Created, JobStatus::Completed]),
            scheduled: Some(true),
            name_contains: None,
        }
    }

    pub fn with_status(status: JobStatus) -> Self {
        Self {
            statuses: Some(vec![status]),
            ..Default::default()
        }
    }

    pub fn matches(&self, job: &Job) -> bool {
        if let Some(statuses) = &self.statuses {
            if !statuses.contains(&job.status) {
                return false;
            }
        }
        if let Some(scheduled) = self.scheduled {
            if job.schedule.is_some() != scheduled {
                return false;
            }
        }
        if let Some(needle) = &self.name_contains {
            if !job.name.to_lowercase().contains(&needle.to_lowercase()) {
                return false;
            }
        }
        true
    }
}
