//! Store traits and the reference snapshot-file implementation.
//!
//! Provides:
//! - Job CRUD with filtered listing
//! - Read-modify-write of a single job under the store lock
//! - Workflow definition and execution records
//! - Atomic snapshot writes (temp file + rename); fsync only on `persist`

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use jobd_types::{Job, JobFilter, JobStatus, WorkflowDefinition, WorkflowExecution};

use crate::error::StoreError;

/// Durable collection of job records.
pub trait JobStore: Send + Sync {
    /// Insert a new job. Fails if the id is already taken.
    fn create(&self, job: Job) -> Result<Job, StoreError>;

    fn get(&self, id: &str) -> Result<Option<Job>, StoreError>;

    /// Jobs matching `filter`, in creation order.
    fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, StoreError>;

    /// Replace an existing job record.
    fn update(&self, job: &Job) -> Result<(), StoreError>;

    /// Apply `f` to the stored job under the store lock.
    ///
    /// If `f` fails the record is left untouched.
    fn modify(
        &self,
        id: &str,
        f: &mut dyn FnMut(&mut Job) -> Result<(), StoreError>,
    ) -> Result<Job, StoreError>;

    /// Remove a job. Returns `false` when no such job exists.
    fn remove(&self, id: &str) -> Result<bool, StoreError>;

    /// Flush all records to durable storage.
    fn persist(&self) -> Result<(), StoreError>;
}

/// Durable collection of workflow definitions and executions.
pub trait WorkflowStore: Send + Sync {
    fn save_definition(&self, definition: &WorkflowDefinition) -> Result<(), StoreError>;

    fn get_definition(&self, id: &str) -> Result<Option<WorkflowDefinition>, StoreError>;

    fn list_definitions(&self) -> Result<Vec<WorkflowDefinition>, StoreError>;

    fn delete_definition(&self, id: &str) -> Result<bool, StoreError>;

    fn save_execution(&self, execution: &WorkflowExecution) -> Result<(), StoreError>;

    fn get_execution(&self, id: &str) -> Result<Option<WorkflowExecution>, StoreError>;

    /// Executions, optionally restricted to one workflow, oldest first.
    fn list_executions(
        &self,
        workflow_id: Option<&str>,
    ) -> Result<Vec<WorkflowExecution>, StoreError>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Snapshot {
    #[serde(default)]
    jobs: BTreeMap<String, Job>,
    #[serde(default)]
    definitions: BTreeMap<String, WorkflowDefinition>,
    #[serde(default)]
    executions: BTreeMap<String, WorkflowExecution>,
}

/// Record counts, used by the status payload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreStats {
    pub job_count: usize,
    pub jobs_by_status: BTreeMap<String, usize>,
    pub definition_count: usize,
    pub execution_count: usize,
}

/// Reference store: in-memory maps with an optional snapshot file.
pub struct Store {
    path: Option<PathBuf>,
    state: RwLock<Snapshot>,
}

impl Store {
    /// Volatile store, nothing is written to disk.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            state: RwLock::new(Snapshot::default()),
        }
    }

    /// Open (or create) a store backed by the snapshot file at `path`.
    ///
    /// A snapshot that cannot be parsed is reported as
    /// [`StoreError::Corrupt`] rather than silently discarded.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        info!("Opening store at {:?}", path);

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let snapshot = if path.exists() {
            let bytes = fs::read(path)?;
            if bytes.iter().all(u8::is_ascii_whitespace) {
                Snapshot::default()
            } else {
                serde_json::from_slice(&bytes).map_err(|e| StoreError::Corrupt {
                    path: path.display().to_string(),
                    reason: e.to_string(),
                })?
            }
        } else {
            Snapshot::default()
        };

        debug!(
            jobs = snapshot.jobs.len(),
            definitions = snapshot.definitions.len(),
            executions = snapshot.executions.len(),
            "Store loaded"
        );

        Ok(Self {
            path: Some(path.to_path_buf()),
            state: RwLock::new(snapshot),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Record counts for status reporting.
    pub fn stats(&self) -> Result<StoreStats, StoreError> {
        let state = self.read()?;
        let mut jobs_by_status: BTreeMap<String, usize> = JobStatus::ALL
            .iter()
            .map(|s| (s.to_string(), 0))
            .collect();
        for job in state.jobs.values() {
            *jobs_by_status.entry(job.status.to_string()).or_default() += 1;
        }
        Ok(StoreStats {
            job_count: state.jobs.len(),
            jobs_by_status,
            definition_count: state.definitions.len(),
            execution_count: state.executions.len(),
        })
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Snapshot>, StoreError> {
        self.state.read().map_err(|_| StoreError::Poisoned)
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Snapshot>, StoreError> {
        self.state.write().map_err(|_| StoreError::Poisoned)
    }

    /// Write the snapshot while the caller still holds the write lock, so
    /// concurrent mutations are serialised onto disk in order.
    ///
    /// Routine mutations write compact JSON and rely on the rename for
    /// atomicity; `sync` additionally fsyncs the file before the rename.
    fn flush(&self, snapshot: &Snapshot, sync: bool) -> Result<(), StoreError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let bytes = serde_json::to_vec(snapshot)?;
        let tmp = path.with_extension("json.tmp");
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(&bytes)?;
            if sync {
                file.sync_all()?;
            }
        }
        fs::rename(&tmp, path)?;
        Ok(())
    }
}

impl JobStore for Store {
    fn create(&self, job: Job) -> Result<Job, StoreError> {
        let mut state = self.write()?;
        if state.jobs.contains_key(&job.id) {
            return Err(StoreError::AlreadyExists(job.id));
        }
        state.jobs.insert(job.id.clone(), job.clone());
        self.flush(&state, false)?;
        debug!(job_id = %job.id, name = %job.name, "Job created");
        Ok(job)
    }

    fn get(&self, id: &str) -> Result<Option<Job>, StoreError> {
        Ok(self.read()?.jobs.get(id).cloned())
    }

    fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, StoreError> {
        Ok(self
            .read()?
            .jobs
            .values()
            .filter(|job| filter.matches(job))
            .cloned()
            .collect())
    }

    fn update(&self, job: &Job) -> Result<(), StoreError> {
        let mut state = self.write()?;
        match state.jobs.get_mut(&job.id) {
            Some(existing) => *existing = job.clone(),
            None => return Err(StoreError::NotFound(job.id.clone())),
        }
        self.flush(&state, false)
    }

    fn modify(
        &self,
        id: &str,
        f: &mut dyn FnMut(&mut Job) -> Result<(), StoreError>,
    ) -> Result<Job, StoreError> {
        let mut state = self.write()?;
        let existing = state
            .jobs
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        let mut candidate = existing.clone();
        f(&mut candidate)?;
        *existing = candidate.clone();
        self.flush(&state, false)?;
        Ok(candidate)
    }

    fn remove(&self, id: &str) -> Result<bool, StoreError> {
        let mut state = self.write()?;
        let removed = state.jobs.remove(id).is_some();
        if removed {
            self.flush(&state, false)?;
            debug!(job_id = %id, "Job removed");
        }
        Ok(removed)
    }

    fn persist(&self) -> Result<(), StoreError> {
        let state = self.write()?;
        self.flush(&state, true)
    }
}

impl WorkflowStore for Store {
    fn save_definition(&self, definition: &WorkflowDefinition) -> Result<(), StoreError> {
        let mut state = self.write()?;
        state
            .definitions
            .insert(definition.id.clone(), definition.clone());
        self.flush(&state, false)
    }

    fn get_definition(&self, id: &str) -> Result<Option<WorkflowDefinition>, StoreError> {
        Ok(self.read()?.definitions.get(id).cloned())
    }

    fn list_definitions(&self) -> Result<Vec<WorkflowDefinition>, StoreError> {
        Ok(self.read()?.definitions.values().cloned().collect())
    }

    fn delete_definition(&self, id: &str) -> Result<bool, StoreError> {
        let mut state = self.write()?;
        let removed = state.definitions.remove(id).is_some();
        if removed {
            self.flush(&state, false)?;
        }
        Ok(removed)
    }

    fn save_execution(&self, execution: &WorkflowExecution) -> Result<(), StoreError> {
        let mut state = self.write()?;
        state
            .executions
            .insert(execution.id.clone(), execution.clone());
        self.flush(&state, false)
    }

    fn get_execution(&self, id: &str) -> Result<Option<WorkflowExecution>, StoreError> {
        Ok(self.read()?.executions.get(id).cloned())
    }

    fn list_executions(
        &self,
        workflow_id: Option<&str>,
    ) -> Result<Vec<WorkflowExecution>, StoreError> {
        Ok(self
            .read()?
            .executions
            .values()
            .filter(|e| workflow_id.map_or(true, |id| e.workflow_id == id))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use jobd_types::{JobSpec, NodeType, WorkflowNode};
    use tempfile::TempDir;

    fn new_job(name: &str) -> Job {
        Job::from_spec(JobSpec::new(name, "echo hi"), Utc::now())
    }

    #[test]
    fn test_create_get_remove() {
        let store = Store::in_memory();
        let job = store.create(new_job("a")).unwrap();

        assert_eq!(store.get(&job.id).unwrap().unwrap().name, "a");
        assert!(store.remove(&job.id).unwrap());
        assert!(store.get(&job.id).unwrap().is_none());
    }

    #[test]
    fn test_remove_missing_returns_false() {
        let store = Store::in_memory();
        assert!(!store.remove("no-such-job").unwrap());
    }

    #[test]
    fn test_duplicate_create_rejected() {
        let store = Store::in_memory();
        let job = store.create(new_job("a")).unwrap();
        let result = store.create(job);
        assert!(matches!(result, Err(StoreError::AlreadyExists(_))));
    }

    #[test]
    fn test_update_missing_is_not_found() {
        let store = Store::in_memory();
        let result = store.update(&new_job("ghost"));
        assert!(matches!(result, Err(StoreError::NotFound(_))));
    }

    #[test]
    fn test_list_filter_and_order() {
        let store = Store::in_memory();
        let first = store.create(new_job("first")).unwrap();
        let second = store.create(new_job("second")).unwrap();
        store
            .modify(&second.id, &mut |job| Ok(job.transition(JobStatus::Running)?))
            .unwrap();

        let all = store.list(&JobFilter::default()).unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].id, first.id);

        let running = store
            .list(&JobFilter::with_status(JobStatus::Running))
            .unwrap();
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].id, second.id);
    }

    #[test]
    fn test_modify_error_leaves_record_untouched() {
        let store = Store::in_memory();
        let job = store.create(new_job("a")).unwrap();

        // created -> completed is illegal
        let result = store.modify(&job.id, &mut |job| {
            job.stdout = "changed".to_string();
            Ok(job.transition(JobStatus::Completed)?)
        });
        assert!(matches!(result, Err(StoreError::Invalid(_))));

        let stored = store.get(&job.id).unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Created);
        assert!(stored.stdout.is_empty());
    }

    #[test]
    fn test_snapshot_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("store.json");

        let job_id = {
            let store = Store::open(&path).unwrap();
            let job = store.create(new_job("durable")).unwrap();
            let mut def = WorkflowDefinition::new(
                "wf",
                vec![WorkflowNode::new("a", NodeType::Parallel)],
            );
            def.id = "wf-1".to_string();
            store.save_definition(&def).unwrap();
            job.id
        };

        let store = Store::open(&path).unwrap();
        assert_eq!(store.get(&job_id).unwrap().unwrap().name, "durable");
        assert!(store.get_definition("wf-1").unwrap().is_some());
    }

    #[test]
    fn test_snapshot_written_compact() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("store.json");
        let store = Store::open(&path).unwrap();
        let job = store.create(new_job("compact")).unwrap();
        store
            .modify(&job.id, &mut |job| Ok(job.transition(JobStatus::Running)?))
            .unwrap();

        let raw = fs::read_to_string(&path).unwrap();
        assert!(!raw.contains('\n'));
        assert!(!path.with_extension("json.tmp").exists());

        store.persist().unwrap();
        let reopened = Store::open(&path).unwrap();
        assert_eq!(reopened.get(&job.id).unwrap().unwrap().status, JobStatus::Running);
    }

    #[test]
    fn test_corrupt_snapshot_reported() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("store.json");
        fs::write(&path, "{ not json").unwrap();

        let result = Store::open(&path);
        assert!(matches!(result, Err(StoreError::Corrupt { .. })));
    }

    #[test]
    fn test_stats_counts_statuses() {
        let store = Store::in_memory();
        store.create(new_job("a")).unwrap();
        let b = store.create(new_job("b")).unwrap();
        store
            .modify(&b.id, &mut |job| Ok(job.transition(JobStatus::Paused)?))
            .unwrap();

        let stats = store.stats().unwrap();
        assert_eq!(stats.job_count, 2);
        assert_eq!(stats.jobs_by_status["created"], 1);
        assert_eq!(stats.jobs_by_status["paused"], 1);
        assert_eq!(stats.jobs_by_status["running"], 0);
    }

    #[test]
    fn test_list_executions_by_workflow() {
        let store = Store::in_memory();
        let mut def = WorkflowDefinition::new(
            "wf",
            vec![WorkflowNode::new("a", NodeType::Parallel)],
        );
        def.id = "wf-1".to_string();
        let exec = WorkflowExecution::new(&def, Default::default(), Utc::now());
        store.save_execution(&exec).unwrap();

        assert_eq!(store.list_executions(Some("wf-1")).unwrap().len(), 1);
        assert_eq!(store.list_executions(Some("wf-2")).unwrap().len(), 0);
        assert_eq!(store.list_executions(None).unwrap().len(), 1);
    }
}
