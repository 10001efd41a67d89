//! Job control-plane errors and job creation.

use chrono::{DateTime, Utc};
use thiserror::Error;

use jobd_scheduler::SchedulerError;
use jobd_store::StoreError;
use jobd_types::{Job, JobSpec, TypesError};

use crate::policy::{CommandPolicy, PolicyViolation};

/// Errors returned by job operations. The `Display` text is what IPC
/// clients see.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("Invalid job: {0}")]
    Invalid(String),

    #[error("Job not found: {0}")]
    NotFound(String),

    #[error("Job {0} is running; stop it first or remove with force")]
    Running(String),

    #[error("Job {0} is not running")]
    NotRunning(String),

    #[error("Job {0} is already running")]
    AlreadyRunning(String),

    #[error("Job {0} is paused")]
    Paused(String),

    #[error("Command rejected: {0}")]
    Policy(#[from] PolicyViolation),

    #[error("Failed to spawn job {id}: {reason}")]
    Spawn { id: String, reason: String },

    #[error("Unsupported signal: {0}")]
    Signal(String),

    #[error(transparent)]
    Store(StoreError),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
}

impl From<StoreError> for JobError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => JobError::NotFound(id),
            StoreError::Invalid(e) => JobError::Invalid(e.to_string()),
            other => JobError::Store(other),
        }
    }
}

impl From<TypesError> for JobError {
    fn from(err: TypesError) -> Self {
        JobError::Invalid(err.to_string())
    }
}

/// Validate `spec` and build the record to insert.
///
/// Rejects empty commands and names, conflicting schedules, malformed cron
/// expressions and commands the policy refuses.
pub fn prepare_job(
    spec: JobSpec,
    policy: &CommandPolicy,
    now: DateTime<Utc>,
) -> Result<Job, JobError> {
    spec.validate()?;
    if let Some(expression) = &spec.cron {
        jobd_scheduler::validate_cron_expression(expression)
            .map_err(|e| JobError::Invalid(e.to_string()))?;
    }
    let job = Job::from_spec(spec, now);
    policy.check(&job)?;
    Ok(job)
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobd_types::{JobStatus, Schedule};

    fn policy() -> CommandPolicy {
        CommandPolicy::new(false, 4096)
    }

    #[test]
    fn test_empty_command_rejected() {
        let err = prepare_job(JobSpec::new("empty", ""), &policy(), Utc::now()).unwrap_err();
        assert!(matches!(err, JobError::Invalid(_)));
        assert!(err.to_string().contains("command"));
    }

    #[test]
    fn test_bad_cron_rejected() {
        let spec = JobSpec::new("c", "true").with_cron("* * * *");
        assert!(matches!(
            prepare_job(spec, &policy(), Utc::now()),
            Err(JobError::Invalid(_))
        ));
    }

    #[test]
    fn test_dangerous_command_rejected() {
        let spec = JobSpec::new("wipe", "rm -rf /");
        assert!(matches!(
            prepare_job(spec, &policy(), Utc::now()),
            Err(JobError::Policy(PolicyViolation::Dangerous(_)))
        ));
    }

    #[test]
    fn test_valid_spec_builds_created_job() {
        let now = Utc::now();
        let job = prepare_job(JobSpec::new("tick", "date").with_cron("*/5 * * * *"), &policy(), now)
            .unwrap();
        assert_eq!(job.status, JobStatus::Created);
        assert_eq!(
            job.schedule,
            Some(Schedule::Cron {
                expression: "*/5 * * * *".to_string()
            })
        );
        assert_eq!(job.created_at, now);
    }

    #[test]
    fn test_store_not_found_maps_to_not_found() {
        let err = JobError::from(StoreError::NotFound("abc".to_string()));
        assert_eq!(err.to_string(), "Job not found: abc");
    }
}
