//! # jobd-types
//!
//! Shared domain types for the jobd daemon.
//!
//! This crate defines the core data structures used throughout the system:
//! - Jobs: Schedulable units of work with an explicit status lifecycle
//! - Workflows: DAG definitions, executions and per-node state
//! - Settings: Layered daemon configuration
//!
//! ## Usage
//!
//! ```rust
//! use jobd_types::{JobSpec, JobStatus};
//!
//! let spec = JobSpec::new("nightly-backup", "tar czf /tmp/backup.tgz /srv/data");
//! assert!(spec.validate().is_ok());
//! assert!(JobStatus::Created.can_transition_to(JobStatus::Running));
//! ```

pub mod config;
pub mod error;
pub mod job;
pub mod workflow;

pub use config::{SchedulerKind, Settings};
pub use error::TypesError;
pub use job::{
    interval_after, minute_of, Job, JobFilter, JobSpec, JobStatus, JobType, Schedule,
    MAX_INTERVAL_SECS,
};
pub use workflow::{
    ExecutionStatus, NodeState, NodeStatus, NodeType, RetryPolicy, WorkflowDefinition,
    WorkflowExecution, WorkflowNode,
};

/// Generate a new sortable identifier.
pub fn new_id() -> String {
    ulid::Ulid::new().to_string()
}
