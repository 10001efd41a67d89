//! Record store for the jobd daemon.
//!
//! The scheduling and workflow engines treat the store as the single source
//! of truth for job records, workflow definitions and executions. They only
//! see the [`JobStore`] and [`WorkflowStore`] traits; [`Store`] is the
//! reference implementation:
//! - In-memory maps ordered by ULID (creation order)
//! - Optional JSON snapshot file rewritten atomically on every mutation
//! - Explicit `persist` as part of the public contract

pub mod db;
pub mod error;

pub use db::{JobStore, Store, StoreStats, WorkflowStore};
pub use error::StoreError;
