//! Error types for workflow validation and execution.

use thiserror::Error;

use jobd_store::StoreError;
use jobd_types::TypesError;

/// Errors raised by the workflow engine.
#[derive(Debug, Error)]
pub enum WorkflowError {
    /// The dependency graph contains a cycle; the path closes on its first id
    #[error("Cycle detected: {0}")]
    CycleDetected(String),

    /// A node depends on an id that is not in the definition
    #[error("Node '{node}' depends on unknown node '{dependency}'")]
    UnknownDependency { node: String, dependency: String },

    #[error("Duplicate node id: {0}")]
    DuplicateNode(String),

    /// Structurally invalid definition or node config
    #[error("Invalid workflow definition: {0}")]
    InvalidDefinition(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// `max_concurrent_runs` reached for the definition
    #[error("Workflow '{workflow_id}' already has {limit} running executions")]
    ConcurrencyLimit { workflow_id: String, limit: u32 },

    /// Definition cannot be deleted while executions are in flight
    #[error("Workflow '{workflow_id}' has {count} active executions")]
    ActiveRuns { workflow_id: String, count: usize },

    /// Execution is not in memory or already finished
    #[error("Execution is not active: {0}")]
    NotActive(String),

    /// Condition expression failed to parse
    #[error("Condition error: {0}")]
    Condition(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Submitting or cancelling a backing job failed
    #[error("Launcher error: {0}")]
    Launcher(String),
}

impl From<TypesError> for WorkflowError {
    fn from(err: TypesError) -> Self {
        WorkflowError::InvalidDefinition(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = WorkflowError::CycleDetected("a -> b -> a".to_string());
        assert_eq!(err.to_string(), "Cycle detected: a -> b -> a");

        let err = WorkflowError::UnknownDependency {
            node: "b".to_string(),
            dependency: "zz".to_string(),
        };
        assert!(err.to_string().contains("unknown node 'zz'"));

        let err = WorkflowError::ConcurrencyLimit {
            workflow_id: "wf".to_string(),
            limit: 2,
        };
        assert!(err.to_string().contains("2 running executions"));

        let err = WorkflowError::from(StoreError::NotFound("x".to_string()));
        assert!(err.to_string().starts_with("Store error"));
    }
}
