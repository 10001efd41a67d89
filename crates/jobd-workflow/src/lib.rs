//! Workflow orchestration for the jobd daemon.
//!
//! A workflow is a DAG of `job`, `condition`, `parallel` and `wait` nodes.
//! This crate validates definitions, evaluates condition expressions and
//! drives executions: ready nodes start as soon as every dependency is
//! `completed` or `skipped`, failed job nodes retry with exponential backoff,
//! and a permanent failure cancels the rest of the run.
//!
//! Jobs are not run here. The engine hands them to a [`JobLauncher`] and
//! waits for [`EngineEvent::JobFinished`].
//!
//! # Example
//!
//! ```ignore
//! use jobd_workflow::{EngineConfig, WorkflowEngine};
//!
//! let (engine, events) = WorkflowEngine::new(store, launcher, EngineConfig::default())?;
//! tokio::spawn(engine.clone().run(events, shutdown.clone()));
//!
//! let definition = engine.create_workflow(definition).await?;
//! let execution = engine.execute_workflow(&definition.id, params).await?;
//! ```

pub mod condition;
mod engine;
mod error;
pub mod validate;

pub use condition::Condition;
pub use engine::{
    find_ready_nodes, EngineConfig, EngineEvent, JobLauncher, WorkflowEngine,
};
pub use error::WorkflowError;
pub use validate::validate_definition;
