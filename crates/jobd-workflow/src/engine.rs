//! Workflow execution engine.
//!
//! All mutable engine state (definitions, active executions and the
//! job → node index) sits behind one `tokio::sync::Mutex`. Every entry point
//! takes the lock for the whole operation, including the `JobLauncher`
//! calls, so a job that finishes instantly cannot race the bookkeeping of
//! its own submission. Launchers must therefore never call back into the
//! engine synchronously; completions arrive as [`EngineEvent`]s.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};
use tokio::sync::{mpsc, Mutex};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use jobd_store::WorkflowStore;
use jobd_types::job::{META_EXECUTION_ID, META_NODE_ID, META_RUN_ID};
use jobd_types::{
    ExecutionStatus, Job, JobSpec, NodeStatus, NodeType, Settings, WorkflowDefinition,
    WorkflowExecution, WorkflowNode,
};

use crate::validate::{condition_source, validate_definition};
use crate::{condition, WorkflowError};

/// Starts and kills the jobs behind `job` nodes.
#[async_trait]
pub trait JobLauncher: Send + Sync {
    /// Persist and start `job`, returning its id.
    async fn submit(&self, job: Job) -> Result<String, WorkflowError>;

    /// Kill a job started through `submit`. Unknown or finished jobs are
    /// not an error.
    async fn cancel(&self, job_id: &str) -> Result<(), WorkflowError>;
}

/// Inputs that advance executions.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    /// A job submitted by the engine reached a terminal state
    JobFinished {
        job_id: String,
        success: bool,
        error: Option<String>,
        result: Option<Value>,
    },
    /// Backoff for retry `attempt` of a node has elapsed
    RetryDue {
        execution_id: String,
        node_id: String,
        attempt: u32,
    },
    /// A `wait` node's delay has elapsed
    WaitElapsed {
        execution_id: String,
        node_id: String,
        attempt: u32,
    },
    /// A node exceeded `timeout_ms` during `attempt`
    NodeTimedOut {
        execution_id: String,
        node_id: String,
        attempt: u32,
    },
}

/// Engine tuning.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// How long finished executions stay in memory
    pub retention: Duration,
    /// How often the run loop evicts expired executions
    pub eviction_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            retention: Duration::from_secs(3600),
            eviction_interval: Duration::from_secs(60),
        }
    }
}

impl EngineConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            retention: Duration::from_secs(settings.execution_retention_secs),
            ..Default::default()
        }
    }
}

struct ActiveRun {
    /// Definition as it was when the run started
    definition: Arc<WorkflowDefinition>,
    execution: WorkflowExecution,
}

#[derive(Default)]
struct EngineState {
    definitions: HashMap<String, Arc<WorkflowDefinition>>,
    active: HashMap<String, ActiveRun>,
    /// job id -> (execution id, node id)
    job_index: HashMap<String, (String, String)>,
}

impl EngineState {
    fn node_in(&self, execution_id: &str, node_id: &str, status: NodeStatus, attempt: u32) -> bool {
        self.active
            .get(execution_id)
            .filter(|run| !run.execution.status.is_terminal())
            .and_then(|run| run.execution.node_states.get(node_id))
            .is_some_and(|ns| ns.status == status && ns.retry_count == attempt)
    }

    fn running_count(&self, workflow_id: &str) -> usize {
        self.active
            .values()
            .filter(|run| {
                run.execution.workflow_id == workflow_id && !run.execution.status.is_terminal()
            })
            .count()
    }
}

/// Per-run values copied out of the state before a node starts.
struct RunContext {
    execution_id: String,
    run_id: String,
    workflow_name: String,
    parameters: Map<String, Value>,
}

/// Drives workflow executions.
pub struct WorkflowEngine {
    store: Arc<dyn WorkflowStore>,
    launcher: Arc<dyn JobLauncher>,
    config: EngineConfig,
    events: mpsc::UnboundedSender<EngineEvent>,
    state: Mutex<EngineState>,
}

impl WorkflowEngine {
    /// Load definitions from `store` and fail executions left unfinished
    /// by a previous daemon.
    ///
    /// Returns the engine and the receiver its [`run`](Self::run) loop
    /// consumes.
    pub fn new(
        store: Arc<dyn WorkflowStore>,
        launcher: Arc<dyn JobLauncher>,
        config: EngineConfig,
    ) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<EngineEvent>), WorkflowError> {
        let mut state = EngineState::default();
        for definition in store.list_definitions()? {
            state
                .definitions
                .insert(definition.id.clone(), Arc::new(definition));
        }

        let now = Utc::now();
        for mut execution in store.list_executions(None)? {
            if execution.status.is_terminal() {
                continue;
            }
            for ns in execution.node_states.values_mut() {
                if !ns.status.is_terminal() && ns.status != NodeStatus::Pending {
                    ns.status = NodeStatus::Cancelled;
                    ns.completed_at = Some(now);
                }
            }
            execution.status = ExecutionStatus::Failed;
            execution.error = Some("interrupted by daemon restart".to_string());
            execution.completed_at = Some(now);
            execution.updated_at = now;
            store.save_execution(&execution)?;
            warn!(execution_id = %execution.id, "Marked interrupted execution as failed");
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let engine = Arc::new(Self {
            store,
            launcher,
            config,
            events: tx,
            state: Mutex::new(state),
        });
        Ok((engine, rx))
    }

    /// Sender for [`EngineEvent`]s, used by the dispatcher to report job
    /// completions.
    pub fn sender(&self) -> mpsc::UnboundedSender<EngineEvent> {
        self.events.clone()
    }

    /// Process events and evict expired executions until `shutdown`.
    pub async fn run(
        self: Arc<Self>,
        mut events: mpsc::UnboundedReceiver<EngineEvent>,
        shutdown: CancellationToken,
    ) {
        let mut eviction = tokio::time::interval(self.config.eviction_interval);
        eviction.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!("Workflow engine started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => self.handle_event(event).await,
                    None => break,
                },
                _ = eviction.tick() => {
                    self.evict_terminal(Utc::now()).await;
                }
            }
        }

        info!("Workflow engine stopped");
    }

    // ------------------------------------------------------------------
    // Definitions
    // ------------------------------------------------------------------

    /// Validate and store a new definition. An empty id is assigned.
    pub async fn create_workflow(
        &self,
        mut definition: WorkflowDefinition,
    ) -> Result<WorkflowDefinition, WorkflowError> {
        validate_definition(&definition)?;
        let mut state = self.state.lock().await;

        if definition.id.is_empty() {
            definition.id = jobd_types::new_id();
        } else if state.definitions.contains_key(&definition.id) {
            return Err(WorkflowError::AlreadyExists(definition.id));
        }
        let now = Utc::now();
        definition.version = 1;
        definition.created_at = now;
        definition.updated_at = now;

        self.store.save_definition(&definition)?;
        state
            .definitions
            .insert(definition.id.clone(), Arc::new(definition.clone()));
        info!(workflow_id = %definition.id, name = %definition.name, nodes = definition.nodes.len(), "Workflow created");
        Ok(definition)
    }

    /// Replace a definition, bumping its version. Running executions keep
    /// the version they started with.
    pub async fn update_workflow(
        &self,
        id: &str,
        mut definition: WorkflowDefinition,
    ) -> Result<WorkflowDefinition, WorkflowError> {
        validate_definition(&definition)?;
        let mut state = self.state.lock().await;
        let current = state
            .definitions
            .get(id)
            .ok_or_else(|| WorkflowError::NotFound(format!("workflow {}", id)))?;

        definition.id = id.to_string();
        definition.version = current.version + 1;
        definition.created_at = current.created_at;
        definition.updated_at = Utc::now();

        self.store.save_definition(&definition)?;
        state
            .definitions
            .insert(definition.id.clone(), Arc::new(definition.clone()));
        info!(workflow_id = %id, version = definition.version, "Workflow updated");
        Ok(definition)
    }

    pub async fn get_workflow(&self, id: &str) -> Result<WorkflowDefinition, WorkflowError> {
        let state = self.state.lock().await;
        state
            .definitions
            .get(id)
            .map(|d| d.as_ref().clone())
            .ok_or_else(|| WorkflowError::NotFound(format!("workflow {}", id)))
    }

    /// All definitions, sorted by name.
    pub async fn list_workflows(&self) -> Vec<WorkflowDefinition> {
        let state = self.state.lock().await;
        let mut definitions: Vec<WorkflowDefinition> =
            state.definitions.values().map(|d| d.as_ref().clone()).collect();
        definitions.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
        definitions
    }

    /// Delete a definition. Refused while it has unfinished executions.
    pub async fn delete_workflow(&self, id: &str) -> Result<(), WorkflowError> {
        let mut state = self.state.lock().await;
        if !state.definitions.contains_key(id) {
            return Err(WorkflowError::NotFound(format!("workflow {}", id)));
        }
        let count = state.running_count(id);
        if count > 0 {
            return Err(WorkflowError::ActiveRuns {
                workflow_id: id.to_string(),
                count,
            });
        }
        self.store.delete_definition(id)?;
        state.definitions.remove(id);
        info!(workflow_id = %id, "Workflow deleted");
        Ok(())
    }

    /// `(workflow id, cron expression)` for every scheduled definition.
    pub async fn scheduled_workflows(&self) -> Vec<(String, String)> {
        let state = self.state.lock().await;
        state
            .definitions
            .values()
            .filter_map(|d| d.schedule.as_ref().map(|s| (d.id.clone(), s.clone())))
            .collect()
    }

    // ------------------------------------------------------------------
    // Executions
    // ------------------------------------------------------------------

    /// Start a run of `workflow_id`.
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown definition, `ConcurrencyLimit` once
    /// `max_concurrent_runs` executions are unfinished.
    pub async fn execute_workflow(
        &self,
        workflow_id: &str,
        parameters: Map<String, Value>,
    ) -> Result<WorkflowExecution, WorkflowError> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;

        let definition = state
            .definitions
            .get(workflow_id)
            .cloned()
            .ok_or_else(|| WorkflowError::NotFound(format!("workflow {}", workflow_id)))?;
        if state.running_count(workflow_id) >= definition.max_concurrent_runs as usize {
            return Err(WorkflowError::ConcurrencyLimit {
                workflow_id: workflow_id.to_string(),
                limit: definition.max_concurrent_runs,
            });
        }

        let mut execution = WorkflowExecution::new(&definition, parameters, Utc::now());
        execution.status = ExecutionStatus::Running;
        self.store.save_execution(&execution)?;

        let execution_id = execution.id.clone();
        info!(
            execution_id = %execution_id,
            run_id = %execution.run_id,
            workflow = %definition.name,
            "Workflow execution started"
        );
        state.active.insert(
            execution_id.clone(),
            ActiveRun {
                definition,
                execution,
            },
        );

        self.advance(state, &execution_id).await;
        state
            .active
            .get(&execution_id)
            .map(|run| run.execution.clone())
            .ok_or(WorkflowError::NotActive(execution_id))
    }

    /// Cancel every unfinished node of an execution and kill backing jobs.
    pub async fn cancel_execution(
        &self,
        execution_id: &str,
    ) -> Result<WorkflowExecution, WorkflowError> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;

        match state.active.get(execution_id) {
            Some(run) if !run.execution.status.is_terminal() => {}
            _ => return Err(WorkflowError::NotActive(execution_id.to_string())),
        }
        self.terminate(
            state,
            execution_id,
            ExecutionStatus::Cancelled,
            Some("cancelled by request".to_string()),
        )
        .await;
        self.persist(state, execution_id);
        info!(execution_id = %execution_id, "Workflow execution cancelled");

        state
            .active
            .get(execution_id)
            .map(|run| run.execution.clone())
            .ok_or_else(|| WorkflowError::NotActive(execution_id.to_string()))
    }

    /// In-memory state if the execution is still held, otherwise the
    /// persisted record.
    pub async fn get_execution(&self, execution_id: &str) -> Result<WorkflowExecution, WorkflowError> {
        {
            let state = self.state.lock().await;
            if let Some(run) = state.active.get(execution_id) {
                return Ok(run.execution.clone());
            }
        }
        self.store
            .get_execution(execution_id)?
            .ok_or_else(|| WorkflowError::NotFound(format!("execution {}", execution_id)))
    }

    /// Persisted executions, oldest first.
    pub async fn list_executions(
        &self,
        workflow_id: Option<&str>,
    ) -> Result<Vec<WorkflowExecution>, WorkflowError> {
        Ok(self.store.list_executions(workflow_id)?)
    }

    /// Executions held in memory that have not finished.
    pub async fn active_executions(&self) -> usize {
        let state = self.state.lock().await;
        state
            .active
            .values()
            .filter(|run| !run.execution.status.is_terminal())
            .count()
    }

    /// Drop finished executions whose retention has expired. Their
    /// persisted records stay queryable.
    pub async fn evict_terminal(&self, now: DateTime<Utc>) -> usize {
        let retention = chrono::Duration::from_std(self.config.retention)
            .unwrap_or_else(|_| chrono::Duration::days(365));
        let mut state = self.state.lock().await;
        let before = state.active.len();
        state.active.retain(|_, run| {
            let expired = run.execution.status.is_terminal()
                && run
                    .execution
                    .completed_at
                    .is_some_and(|done| done + retention <= now);
            !expired
        });
        let evicted = before - state.active.len();
        if evicted > 0 {
            debug!(evicted, "Evicted finished executions");
        }
        evicted
    }

    // ------------------------------------------------------------------
    // Event handling
    // ------------------------------------------------------------------

    /// Apply one event and advance the affected execution.
    pub async fn handle_event(&self, event: EngineEvent) {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;

        let execution_id = match event {
            EngineEvent::JobFinished {
                job_id,
                success,
                error,
                result,
            } => {
                let Some((execution_id, node_id)) = state.job_index.remove(&job_id) else {
                    debug!(job_id = %job_id, "Ignoring completion of untracked job");
                    return;
                };
                let current = state
                    .active
                    .get(&execution_id)
                    .filter(|run| !run.execution.status.is_terminal())
                    .and_then(|run| run.execution.node_states.get(&node_id))
                    .is_some_and(|ns| {
                        ns.status == NodeStatus::Running && ns.job_id.as_deref() == Some(job_id.as_str())
                    });
                if !current {
                    return;
                }
                if success {
                    finish_node(state, &execution_id, &node_id, NodeStatus::Completed, result);
                } else {
                    let reason = error.unwrap_or_else(|| format!("job {} failed", job_id));
                    self.node_failed(state, &execution_id, &node_id, reason).await;
                }
                execution_id
            }
            EngineEvent::RetryDue {
                execution_id,
                node_id,
                attempt,
            } => {
                if !state.node_in(&execution_id, &node_id, NodeStatus::Waiting, attempt) {
                    return;
                }
                let node = state
                    .active
                    .get(&execution_id)
                    .and_then(|run| run.definition.node(&node_id).cloned());
                if let Some(node) = node {
                    info!(execution_id = %execution_id, node_id = %node_id, attempt, "Retrying node");
                    self.start_node(state, &execution_id, &node).await;
                }
                execution_id
            }
            EngineEvent::WaitElapsed {
                execution_id,
                node_id,
                attempt,
            } => {
                if !state.node_in(&execution_id, &node_id, NodeStatus::Running, attempt) {
                    return;
                }
                finish_node(state, &execution_id, &node_id, NodeStatus::Completed, None);
                execution_id
            }
            EngineEvent::NodeTimedOut {
                execution_id,
                node_id,
                attempt,
            } => {
                if !state.node_in(&execution_id, &node_id, NodeStatus::Running, attempt) {
                    return;
                }
                let timeout_ms = state
                    .active
                    .get(&execution_id)
                    .and_then(|run| run.definition.node(&node_id))
                    .and_then(|node| node.timeout_ms)
                    .unwrap_or_default();
                let job_id = state
                    .active
                    .get(&execution_id)
                    .and_then(|run| run.execution.node_states.get(&node_id))
                    .and_then(|ns| ns.job_id.clone());
                if let Some(job_id) = job_id {
                    state.job_index.remove(&job_id);
                    if let Err(e) = self.launcher.cancel(&job_id).await {
                        warn!(job_id = %job_id, error = %e, "Failed to cancel timed out job");
                    }
                }
                warn!(execution_id = %execution_id, node_id = %node_id, timeout_ms, "Node timed out");
                self.node_failed(
                    state,
                    &execution_id,
                    &node_id,
                    format!("timed out after {} ms", timeout_ms),
                )
                .await;
                execution_id
            }
        };

        self.advance(state, &execution_id).await;
    }

    /// Start every ready node until none is left, then settle the
    /// execution status and persist it.
    async fn advance(&self, state: &mut EngineState, execution_id: &str) {
        loop {
            let Some(run) = state.active.get(execution_id) else {
                return;
            };
            if run.execution.status.is_terminal() {
                break;
            }
            let definition = run.definition.clone();
            let ready = find_ready_nodes(&definition, &run.execution);
            if ready.is_empty() {
                break;
            }
            for node_id in ready {
                let still_running = state
                    .active
                    .get(execution_id)
                    .is_some_and(|run| !run.execution.status.is_terminal());
                if !still_running {
                    break;
                }
                if let Some(node) = definition.node(&node_id) {
                    self.start_node(state, execution_id, node).await;
                }
            }
        }

        if let Some(run) = state.active.get_mut(execution_id) {
            if !run.execution.status.is_terminal() && run.execution.all_nodes_satisfied() {
                let now = Utc::now();
                run.execution.status = ExecutionStatus::Completed;
                run.execution.completed_at = Some(now);
                run.execution.updated_at = now;
                info!(
                    execution_id = %execution_id,
                    run_id = %run.execution.run_id,
                    "Workflow execution completed"
                );
            }
        }
        self.persist(state, execution_id);
    }

    async fn start_node(&self, state: &mut EngineState, execution_id: &str, node: &WorkflowNode) {
        let now = Utc::now();
        let Some(run) = state.active.get_mut(execution_id) else {
            return;
        };
        let ctx = RunContext {
            execution_id: execution_id.to_string(),
            run_id: run.execution.run_id.clone(),
            workflow_name: run.execution.workflow_name.clone(),
            parameters: run.execution.parameters.clone(),
        };
        let ns = run.execution.node_states.entry(node.id.clone()).or_default();
        ns.status = NodeStatus::Running;
        ns.started_at = Some(now);
        ns.completed_at = None;
        ns.next_retry_at = None;
        ns.job_id = None;
        let attempt = ns.retry_count;
        run.execution.updated_at = now;
        debug!(execution_id = %execution_id, node_id = %node.id, node_type = ?node.node_type, attempt, "Starting node");

        match node.node_type {
            NodeType::Job => {
                let submitted = match build_job(node, &ctx, now) {
                    Ok(job) => self.launcher.submit(job).await,
                    Err(e) => Err(e),
                };
                match submitted {
                    Ok(job_id) => {
                        if let Some(ns) = state
                            .active
                            .get_mut(execution_id)
                            .and_then(|run| run.execution.node_states.get_mut(&node.id))
                        {
                            ns.job_id = Some(job_id.clone());
                        }
                        state
                            .job_index
                            .insert(job_id, (execution_id.to_string(), node.id.clone()));
                        self.arm_timeout(execution_id, node, attempt);
                    }
                    Err(e) => {
                        error!(execution_id = %execution_id, node_id = %node.id, error = %e, "Failed to submit node job");
                        self.node_failed(state, execution_id, &node.id, e.to_string()).await;
                    }
                }
            }
            NodeType::Condition => {
                let outcome = condition_source(node)
                    .ok_or_else(|| WorkflowError::Condition("missing condition".to_string()))
                    .and_then(|source| condition::evaluate(source, &ctx.parameters));
                match outcome {
                    Ok(true) => {
                        finish_node(state, execution_id, &node.id, NodeStatus::Completed, Some(json!(true)))
                    }
                    Ok(false) => {
                        debug!(execution_id = %execution_id, node_id = %node.id, "Condition false, skipping");
                        finish_node(state, execution_id, &node.id, NodeStatus::Skipped, Some(json!(false)))
                    }
                    Err(e) => self.node_failed(state, execution_id, &node.id, e.to_string()).await,
                }
            }
            NodeType::Parallel => {
                finish_node(state, execution_id, &node.id, NodeStatus::Completed, None);
            }
            NodeType::Wait => {
                let delay_ms = node
                    .config
                    .get("delay_ms")
                    .and_then(Value::as_u64)
                    .unwrap_or_default();
                if delay_ms == 0 {
                    finish_node(state, execution_id, &node.id, NodeStatus::Completed, None);
                } else {
                    self.schedule(
                        Duration::from_millis(delay_ms),
                        EngineEvent::WaitElapsed {
                            execution_id: execution_id.to_string(),
                            node_id: node.id.clone(),
                            attempt,
                        },
                    );
                    self.arm_timeout(execution_id, node, attempt);
                }
            }
        }
    }

    /// Retry the node if its policy allows, otherwise fail the execution.
    /// A node that is no longer running is left alone, so repeated
    /// failure reports for one attempt are harmless.
    async fn node_failed(
        &self,
        state: &mut EngineState,
        execution_id: &str,
        node_id: &str,
        reason: String,
    ) {
        let now = Utc::now();
        let Some(run) = state.active.get_mut(execution_id) else {
            return;
        };
        if run.execution.status.is_terminal() {
            return;
        }
        let policy = run
            .definition
            .node(node_id)
            .and_then(|node| node.retry_policy.clone());
        let Some(ns) = run.execution.node_states.get_mut(node_id) else {
            return;
        };
        if ns.status != NodeStatus::Running {
            return;
        }
        ns.error = Some(reason.clone());

        if let Some(policy) = policy.filter(|p| p.allows_retry(ns.retry_count)) {
            ns.retry_count += 1;
            let delay = policy.delay_for_attempt(ns.retry_count);
            ns.status = NodeStatus::Waiting;
            ns.next_retry_at = chrono::Duration::from_std(delay).ok().map(|d| now + d);
            run.execution.updated_at = now;
            warn!(
                execution_id = %execution_id,
                node_id = %node_id,
                attempt = ns.retry_count,
                max_retries = policy.max_retries,
                delay_ms = delay.as_millis() as u64,
                error = %reason,
                "Node failed, scheduling retry"
            );
            let attempt = ns.retry_count;
            self.schedule(
                delay,
                EngineEvent::RetryDue {
                    execution_id: execution_id.to_string(),
                    node_id: node_id.to_string(),
                    attempt,
                },
            );
            return;
        }

        ns.status = NodeStatus::Failed;
        ns.completed_at = Some(now);
        run.execution.failed_nodes.push(node_id.to_string());
        error!(execution_id = %execution_id, node_id = %node_id, error = %reason, "Node failed permanently");

        self.terminate(
            state,
            execution_id,
            ExecutionStatus::Failed,
            Some(format!("node '{}' failed: {}", node_id, reason)),
        )
        .await;
    }

    /// Move an execution to a terminal status, cancelling nodes and
    /// killing their jobs. `Failed` cancels running, waiting and ready
    /// nodes; `Cancelled` cancels every unfinished node.
    async fn terminate(
        &self,
        state: &mut EngineState,
        execution_id: &str,
        status: ExecutionStatus,
        reason: Option<String>,
    ) {
        let now = Utc::now();
        let mut jobs = Vec::new();
        {
            let Some(run) = state.active.get_mut(execution_id) else {
                return;
            };
            if run.execution.status.is_terminal() {
                return;
            }
            for ns in run.execution.node_states.values_mut() {
                let cancel = match status {
                    ExecutionStatus::Cancelled => !ns.status.is_terminal(),
                    _ => matches!(
                        ns.status,
                        NodeStatus::Running | NodeStatus::Waiting | NodeStatus::Ready
                    ),
                };
                if !cancel {
                    continue;
                }
                if ns.status == NodeStatus::Running {
                    if let Some(job_id) = &ns.job_id {
                        jobs.push(job_id.clone());
                    }
                }
                ns.status = NodeStatus::Cancelled;
                ns.completed_at = Some(now);
            }
            run.execution.status = status;
            run.execution.error = reason;
            run.execution.completed_at = Some(now);
            run.execution.updated_at = now;
        }

        for job_id in jobs {
            state.job_index.remove(&job_id);
            if let Err(e) = self.launcher.cancel(&job_id).await {
                warn!(job_id = %job_id, error = %e, "Failed to cancel node job");
            }
        }
    }

    fn arm_timeout(&self, execution_id: &str, node: &WorkflowNode, attempt: u32) {
        if let Some(timeout_ms) = node.timeout_ms {
            self.schedule(
                Duration::from_millis(timeout_ms),
                EngineEvent::NodeTimedOut {
                    execution_id: execution_id.to_string(),
                    node_id: node.id.clone(),
                    attempt,
                },
            );
        }
    }

    /// Deliver `event` to the run loop after `delay`. Stale timers are
    /// filtered by the attempt number when they fire.
    fn schedule(&self, delay: Duration, event: EngineEvent) {
        let events = self.events.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = events.send(event);
        });
    }

    fn persist(&self, state: &EngineState, execution_id: &str) {
        if let Some(run) = state.active.get(execution_id) {
            if let Err(e) = self.store.save_execution(&run.execution) {
                error!(execution_id = %execution_id, error = %e, "Failed to persist execution");
            }
        }
    }
}

fn finish_node(
    state: &mut EngineState,
    execution_id: &str,
    node_id: &str,
    status: NodeStatus,
    result: Option<Value>,
) {
    let now = Utc::now();
    if let Some(run) = state.active.get_mut(execution_id) {
        if let Some(ns) = run.execution.node_states.get_mut(node_id) {
            ns.status = status;
            ns.completed_at = Some(now);
            ns.result = result;
            ns.error = None;
        }
        run.execution.updated_at = now;
    }
}

/// Nodes that are `pending` and whose dependencies are all `completed` or
/// `skipped`, in definition order.
pub fn find_ready_nodes(
    definition: &WorkflowDefinition,
    execution: &WorkflowExecution,
) -> Vec<String> {
    definition
        .nodes
        .iter()
        .filter(|node| execution.node_status(&node.id) == Some(NodeStatus::Pending))
        .filter(|node| {
            node.dependencies.iter().all(|dep| {
                execution
                    .node_status(dep)
                    .is_some_and(|status| status.is_satisfied())
            })
        })
        .map(|node| node.id.clone())
        .collect()
}

fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn env_key(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}

/// Job for a `job` node: `config.command` plus optional `args`, `cwd`,
/// `env`, `timeout_secs` and `type`. Execution parameters are exported as
/// `PARAM_<NAME>` environment variables.
fn build_job(node: &WorkflowNode, ctx: &RunContext, now: DateTime<Utc>) -> Result<Job, WorkflowError> {
    let config = &node.config;
    let command = config
        .get("command")
        .and_then(Value::as_str)
        .unwrap_or_default();

    let mut spec = JobSpec::new(format!("{}.{}", ctx.workflow_name, node.id), command);
    spec.args = config
        .get("args")
        .and_then(Value::as_array)
        .map(|args| args.iter().map(value_to_string).collect())
        .unwrap_or_default();
    spec.cwd = config.get("cwd").and_then(Value::as_str).map(str::to_string);
    spec.timeout_secs = config.get("timeout_secs").and_then(Value::as_u64);
    if let Some(job_type) = config.get("type") {
        spec.job_type = serde_json::from_value(job_type.clone()).map_err(|e| {
            WorkflowError::InvalidDefinition(format!("node '{}': bad job type: {}", node.id, e))
        })?;
    }

    if let Some(env) = config.get("env").and_then(Value::as_object) {
        for (key, value) in env {
            spec.env.insert(key.clone(), value_to_string(value));
        }
    }
    for (key, value) in &ctx.parameters {
        spec.env
            .insert(format!("PARAM_{}", env_key(key)), value_to_string(value));
    }
    spec.env
        .insert("WORKFLOW_RUN_ID".to_string(), ctx.run_id.clone());
    spec.env
        .insert("WORKFLOW_EXECUTION_ID".to_string(), ctx.execution_id.clone());

    spec.metadata
        .insert(META_EXECUTION_ID.to_string(), ctx.execution_id.clone());
    spec.metadata
        .insert(META_RUN_ID.to_string(), ctx.run_id.clone());
    spec.metadata
        .insert(META_NODE_ID.to_string(), node.id.clone());

    spec.validate()?;
    Ok(Job::from_spec(spec, now))
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobd_store::Store;
    use jobd_types::RetryPolicy;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::collections::HashSet;
    use tokio::time::Instant;

    #[derive(Default)]
    struct RecordingLauncher {
        submitted: std::sync::Mutex<Vec<(Job, Instant)>>,
        cancelled: std::sync::Mutex<Vec<String>>,
    }

    impl RecordingLauncher {
        fn jobs(&self) -> Vec<Job> {
            self.submitted.lock().unwrap().iter().map(|(j, _)| j.clone()).collect()
        }

        fn nodes(&self) -> Vec<String> {
            self.jobs()
                .iter()
                .map(|j| j.metadata[META_NODE_ID].clone())
                .collect()
        }

        fn latest_for(&self, node: &str) -> String {
            self.jobs()
                .iter()
                .rev()
                .find(|j| j.metadata[META_NODE_ID] == node)
                .map(|j| j.id.clone())
                .unwrap()
        }

        fn submitted_at(&self, index: usize) -> Instant {
            self.submitted.lock().unwrap()[index].1
        }

        fn cancelled(&self) -> Vec<String> {
            self.cancelled.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl JobLauncher for RecordingLauncher {
        async fn submit(&self, job: Job) -> Result<String, WorkflowError> {
            let id = job.id.clone();
            self.submitted.lock().unwrap().push((job, Instant::now()));
            Ok(id)
        }

        async fn cancel(&self, job_id: &str) -> Result<(), WorkflowError> {
            self.cancelled.lock().unwrap().push(job_id.to_string());
            Ok(())
        }
    }

    fn setup() -> (
        Arc<WorkflowEngine>,
        Arc<RecordingLauncher>,
        Arc<Store>,
        mpsc::UnboundedReceiver<EngineEvent>,
    ) {
        let store = Arc::new(Store::in_memory());
        let launcher = Arc::new(RecordingLauncher::default());
        let (engine, events) =
            WorkflowEngine::new(store.clone(), launcher.clone(), EngineConfig::default()).unwrap();
        (engine, launcher, store, events)
    }

    fn job(id: &str) -> WorkflowNode {
        WorkflowNode::new(id, NodeType::Job).with_config(json!({"command": format!("echo {}", id)}))
    }

    async fn finish(engine: &WorkflowEngine, job_id: String, success: bool) {
        engine
            .handle_event(EngineEvent::JobFinished {
                job_id,
                success,
                error: (!success).then(|| "exit code 1".to_string()),
                result: None,
            })
            .await;
    }

    async fn wait_for_submissions(launcher: &RecordingLauncher, count: usize) {
        for _ in 0..10_000 {
            if launcher.jobs().len() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("expected {} submissions", count);
    }

    fn params(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    #[tokio::test]
    async fn test_diamond_runs_in_dependency_order() {
        let (engine, launcher, _store, _events) = setup();
        let def = engine
            .create_workflow(WorkflowDefinition::new(
                "diamond",
                vec![
                    job("A"),
                    job("B").depends_on(["A"]),
                    job("C").depends_on(["A"]),
                    job("D").depends_on(["B", "C"]),
                ],
            ))
            .await
            .unwrap();
        assert_eq!(def.version, 1);

        let exec = engine.execute_workflow(&def.id, Map::new()).await.unwrap();
        assert_eq!(exec.status, ExecutionStatus::Running);
        assert_eq!(launcher.nodes(), vec!["A"]);

        finish(&engine, launcher.latest_for("A"), true).await;
        assert_eq!(launcher.nodes(), vec!["A", "B", "C"]);
        let snapshot = engine.get_execution(&exec.id).await.unwrap();
        assert_eq!(snapshot.node_status("B"), Some(NodeStatus::Running));
        assert_eq!(snapshot.node_status("C"), Some(NodeStatus::Running));
        assert_eq!(snapshot.node_status("D"), Some(NodeStatus::Pending));

        finish(&engine, launcher.latest_for("B"), true).await;
        assert_eq!(launcher.jobs().len(), 3);

        finish(&engine, launcher.latest_for("C"), true).await;
        assert_eq!(launcher.nodes(), vec!["A", "B", "C", "D"]);

        finish(&engine, launcher.latest_for("D"), true).await;
        let done = engine.get_execution(&exec.id).await.unwrap();
        assert_eq!(done.status, ExecutionStatus::Completed);
        assert!(done.completed_at.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_backoff_then_single_failure() {
        let (engine, launcher, _store, events) = setup();
        let shutdown = CancellationToken::new();
        tokio::spawn(engine.clone().run(events, shutdown.clone()));

        let def = engine
            .create_workflow(WorkflowDefinition::new(
                "flaky",
                vec![job("A").with_retry(RetryPolicy::new(2, 1000, 2.0))],
            ))
            .await
            .unwrap();
        let exec = engine.execute_workflow(&def.id, Map::new()).await.unwrap();

        let t0 = Instant::now();
        finish(&engine, launcher.latest_for("A"), false).await;
        let snapshot = engine.get_execution(&exec.id).await.unwrap();
        assert_eq!(snapshot.status, ExecutionStatus::Running);
        assert_eq!(snapshot.node_states["A"].status, NodeStatus::Waiting);
        assert_eq!(snapshot.node_states["A"].retry_count, 1);
        assert!(snapshot.node_states["A"].next_retry_at.is_some());

        wait_for_submissions(&launcher, 2).await;
        assert_eq!(launcher.submitted_at(1) - t0, Duration::from_millis(1000));

        let t1 = Instant::now();
        finish(&engine, launcher.latest_for("A"), false).await;
        wait_for_submissions(&launcher, 3).await;
        assert_eq!(launcher.submitted_at(2) - t1, Duration::from_millis(2000));
        assert_eq!(
            engine.get_execution(&exec.id).await.unwrap().status,
            ExecutionStatus::Running
        );

        let last = launcher.latest_for("A");
        finish(&engine, last.clone(), false).await;
        let failed = engine.get_execution(&exec.id).await.unwrap();
        assert_eq!(failed.status, ExecutionStatus::Failed);
        assert_eq!(failed.failed_nodes, vec!["A"]);
        assert!(failed.error.unwrap().contains("node 'A' failed"));

        // A duplicate report changes nothing
        finish(&engine, last, false).await;
        let again = engine.get_execution(&exec.id).await.unwrap();
        assert_eq!(again.failed_nodes.len(), 1);
        assert_eq!(launcher.jobs().len(), 3);

        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_failure_cancels_running_siblings() {
        let (engine, launcher, _store, _events) = setup();
        let def = engine
            .create_workflow(WorkflowDefinition::new(
                "fanout",
                vec![job("A"), job("B"), job("C").depends_on(["A", "B"])],
            ))
            .await
            .unwrap();
        let exec = engine.execute_workflow(&def.id, Map::new()).await.unwrap();
        let b_job = launcher.latest_for("B");

        finish(&engine, launcher.latest_for("A"), false).await;
        let failed = engine.get_execution(&exec.id).await.unwrap();
        assert_eq!(failed.status, ExecutionStatus::Failed);
        assert_eq!(failed.node_status("A"), Some(NodeStatus::Failed));
        assert_eq!(failed.node_status("B"), Some(NodeStatus::Cancelled));
        assert_eq!(failed.node_status("C"), Some(NodeStatus::Pending));
        assert_eq!(launcher.cancelled(), vec![b_job.clone()]);

        // The killed job reporting back is ignored
        finish(&engine, b_job, false).await;
        assert_eq!(engine.get_execution(&exec.id).await.unwrap().failed_nodes, vec!["A"]);
    }

    #[tokio::test]
    async fn test_condition_false_skips_and_satisfies_dependents() {
        let (engine, launcher, _store, _events) = setup();
        let def = engine
            .create_workflow(WorkflowDefinition::new(
                "gated",
                vec![
                    WorkflowNode::new("is_prod", NodeType::Condition)
                        .with_condition("params.env == 'prod'"),
                    WorkflowNode::new("join", NodeType::Parallel).depends_on(["is_prod"]),
                    job("deploy").depends_on(["join"]),
                ],
            ))
            .await
            .unwrap();

        let exec = engine
            .execute_workflow(&def.id, params(json!({"env": "dev"})))
            .await
            .unwrap();
        assert_eq!(exec.node_status("is_prod"), Some(NodeStatus::Skipped));
        assert_eq!(exec.node_status("join"), Some(NodeStatus::Completed));
        assert_eq!(launcher.nodes(), vec!["deploy"]);

        let exec = engine
            .execute_workflow(&def.id, params(json!({"env": "prod"})))
            .await
            .unwrap();
        assert_eq!(exec.node_status("is_prod"), Some(NodeStatus::Completed));
        assert_eq!(exec.node_states["is_prod"].result, Some(json!(true)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_node_delays_dependents() {
        let (engine, launcher, _store, events) = setup();
        let shutdown = CancellationToken::new();
        tokio::spawn(engine.clone().run(events, shutdown.clone()));

        let def = engine
            .create_workflow(WorkflowDefinition::new(
                "delayed",
                vec![
                    WorkflowNode::new("pause", NodeType::Wait).with_config(json!({"delay_ms": 500})),
                    job("after").depends_on(["pause"]),
                ],
            ))
            .await
            .unwrap();

        let start = Instant::now();
        let exec = engine.execute_workflow(&def.id, Map::new()).await.unwrap();
        assert_eq!(exec.node_status("pause"), Some(NodeStatus::Running));
        assert!(launcher.jobs().is_empty());

        wait_for_submissions(&launcher, 1).await;
        assert_eq!(launcher.submitted_at(0) - start, Duration::from_millis(500));
        shutdown.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_node_timeout_fails_and_kills_job() {
        let (engine, launcher, _store, events) = setup();
        let shutdown = CancellationToken::new();
        tokio::spawn(engine.clone().run(events, shutdown.clone()));

        let mut slow = job("slow");
        slow.timeout_ms = Some(200);
        let def = engine
            .create_workflow(WorkflowDefinition::new("timeouts", vec![slow]))
            .await
            .unwrap();
        let exec = engine.execute_workflow(&def.id, Map::new()).await.unwrap();
        let job_id = launcher.latest_for("slow");

        let mut status = ExecutionStatus::Running;
        for _ in 0..100 {
            status = engine.get_execution(&exec.id).await.unwrap().status;
            if status.is_terminal() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(status, ExecutionStatus::Failed);
        let failed = engine.get_execution(&exec.id).await.unwrap();
        assert!(failed.node_states["slow"].error.as_deref().unwrap().contains("timed out"));
        assert_eq!(launcher.cancelled(), vec![job_id]);
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_concurrency_cap() {
        let (engine, launcher, _store, _events) = setup();
        let mut def = WorkflowDefinition::new("single", vec![job("only")]);
        def.max_concurrent_runs = 1;
        let def = engine.create_workflow(def).await.unwrap();

        engine.execute_workflow(&def.id, Map::new()).await.unwrap();
        let err = engine.execute_workflow(&def.id, Map::new()).await.unwrap_err();
        assert!(matches!(err, WorkflowError::ConcurrencyLimit { limit: 1, .. }));

        finish(&engine, launcher.latest_for("only"), true).await;
        assert!(engine.execute_workflow(&def.id, Map::new()).await.is_ok());
    }

    #[tokio::test]
    async fn test_cancel_execution() {
        let (engine, launcher, _store, _events) = setup();
        let def = engine
            .create_workflow(WorkflowDefinition::new(
                "cancel-me",
                vec![job("A"), job("B").depends_on(["A"])],
            ))
            .await
            .unwrap();
        let exec = engine.execute_workflow(&def.id, Map::new()).await.unwrap();
        let a_job = launcher.latest_for("A");

        let cancelled = engine.cancel_execution(&exec.id).await.unwrap();
        assert_eq!(cancelled.status, ExecutionStatus::Cancelled);
        assert!(cancelled
            .node_states
            .values()
            .all(|ns| ns.status == NodeStatus::Cancelled));
        assert_eq!(launcher.cancelled(), vec![a_job.clone()]);

        assert!(matches!(
            engine.cancel_execution(&exec.id).await,
            Err(WorkflowError::NotActive(_))
        ));
        finish(&engine, a_job, true).await;
        assert_eq!(launcher.jobs().len(), 1);
    }

    #[tokio::test]
    async fn test_definition_crud() {
        let (engine, _launcher, _store, _events) = setup();
        let def = engine
            .create_workflow(WorkflowDefinition::new("crud", vec![job("a")]))
            .await
            .unwrap();
        assert!(!def.id.is_empty());

        let err = engine
            .create_workflow(def.clone())
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::AlreadyExists(_)));

        let updated = engine
            .update_workflow(&def.id, WorkflowDefinition::new("crud", vec![job("a"), job("b").depends_on(["a"])]))
            .await
            .unwrap();
        assert_eq!(updated.version, 2);
        assert_eq!(updated.created_at, def.created_at);

        let cyclic = WorkflowDefinition::new("crud", vec![job("a").depends_on(["b"]), job("b").depends_on(["a"])]);
        assert!(matches!(
            engine.update_workflow(&def.id, cyclic).await,
            Err(WorkflowError::CycleDetected(_))
        ));
        assert_eq!(engine.get_workflow(&def.id).await.unwrap().nodes.len(), 2);

        assert_eq!(engine.list_workflows().await.len(), 1);
        engine.delete_workflow(&def.id).await.unwrap();
        assert!(matches!(engine.get_workflow(&def.id).await, Err(WorkflowError::NotFound(_))));
        assert!(matches!(engine.delete_workflow(&def.id).await, Err(WorkflowError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_delete_refused_while_running() {
        let (engine, _launcher, _store, _events) = setup();
        let def = engine
            .create_workflow(WorkflowDefinition::new("busy", vec![job("a")]))
            .await
            .unwrap();
        let exec = engine.execute_workflow(&def.id, Map::new()).await.unwrap();

        assert!(matches!(
            engine.delete_workflow(&def.id).await,
            Err(WorkflowError::ActiveRuns { count: 1, .. })
        ));
        engine.cancel_execution(&exec.id).await.unwrap();
        engine.delete_workflow(&def.id).await.unwrap();
    }

    #[tokio::test]
    async fn test_eviction_keeps_persisted_record() {
        let (engine, launcher, _store, _events) = setup();
        let def = engine
            .create_workflow(WorkflowDefinition::new("short", vec![job("a")]))
            .await
            .unwrap();
        let exec = engine.execute_workflow(&def.id, Map::new()).await.unwrap();
        finish(&engine, launcher.latest_for("a"), true).await;

        assert_eq!(engine.evict_terminal(Utc::now()).await, 0);
        let later = Utc::now() + chrono::Duration::hours(2);
        assert_eq!(engine.evict_terminal(later).await, 1);

        let persisted = engine.get_execution(&exec.id).await.unwrap();
        assert_eq!(persisted.status, ExecutionStatus::Completed);
        assert_eq!(engine.list_executions(Some(&def.id)).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_restart_fails_interrupted_executions() {
        let store = Arc::new(Store::in_memory());
        let def = WorkflowDefinition {
            id: "wf-1".to_string(),
            ..WorkflowDefinition::new("old", vec![job("a")])
        };
        store.save_definition(&def).unwrap();
        let mut exec = WorkflowExecution::new(&def, Map::new(), Utc::now());
        exec.status = ExecutionStatus::Running;
        exec.node_states.get_mut("a").unwrap().status = NodeStatus::Running;
        store.save_execution(&exec).unwrap();

        let launcher = Arc::new(RecordingLauncher::default());
        let (engine, _events) =
            WorkflowEngine::new(store.clone(), launcher, EngineConfig::default()).unwrap();

        let recovered = engine.get_execution(&exec.id).await.unwrap();
        assert_eq!(recovered.status, ExecutionStatus::Failed);
        assert_eq!(recovered.node_status("a"), Some(NodeStatus::Cancelled));
        assert_eq!(engine.list_workflows().await.len(), 1);
    }

    #[tokio::test]
    async fn test_job_built_from_node_config() {
        let (engine, launcher, _store, _events) = setup();
        let node = WorkflowNode::new("build", NodeType::Job).with_config(json!({
            "command": "make",
            "args": ["all", 4],
            "cwd": "/srv/app",
            "env": {"CC": "clang"},
            "timeout_secs": 90,
            "type": "exec"
        }));
        let def = engine
            .create_workflow(WorkflowDefinition::new("Release Build", vec![node]))
            .await
            .unwrap();
        let exec = engine
            .execute_workflow(&def.id, params(json!({"git-ref": "v1.2", "dry_run": true})))
            .await
            .unwrap();

        let jobs = launcher.jobs();
        let job = &jobs[0];
        assert_eq!(job.name, "Release Build.build");
        assert_eq!(job.command, "make");
        assert_eq!(job.args, vec!["all", "4"]);
        assert_eq!(job.cwd.as_deref(), Some("/srv/app"));
        assert_eq!(job.timeout_secs, Some(90));
        assert_eq!(job.job_type, jobd_types::JobType::Exec);
        assert_eq!(job.env["CC"], "clang");
        assert_eq!(job.env["PARAM_GIT_REF"], "v1.2");
        assert_eq!(job.env["PARAM_DRY_RUN"], "true");
        assert_eq!(job.env["WORKFLOW_RUN_ID"], exec.run_id);
        assert_eq!(job.metadata[META_EXECUTION_ID], exec.id);
        assert_eq!(job.metadata[META_NODE_ID], "build");
        assert!(exec.run_id.starts_with("release-build-"));
    }

    /// Random DAGs with random completion order: a node never starts before
    /// all of its dependencies are satisfied.
    #[tokio::test]
    async fn test_random_dags_respect_dependencies() {
        for seed in 0..40u64 {
            let mut rng = StdRng::seed_from_u64(seed);
            let (engine, launcher, _store, _events) = setup();

            let n = rng.gen_range(2..14);
            let nodes: Vec<WorkflowNode> = (0..n)
                .map(|i| {
                    let deps: Vec<String> = (0..i)
                        .filter(|_| rng.gen_bool(0.3))
                        .map(|d| format!("n{}", d))
                        .collect();
                    job(&format!("n{}", i)).depends_on(deps)
                })
                .collect();
            let def = engine
                .create_workflow(WorkflowDefinition::new(format!("dag-{}", seed), nodes.clone()))
                .await
                .unwrap();
            let exec = engine.execute_workflow(&def.id, Map::new()).await.unwrap();

            let mut finished: HashSet<String> = HashSet::new();
            loop {
                let snapshot = engine.get_execution(&exec.id).await.unwrap();
                for node in &nodes {
                    let status = snapshot.node_status(&node.id).unwrap();
                    if matches!(status, NodeStatus::Running | NodeStatus::Completed) {
                        for dep in &node.dependencies {
                            assert!(
                                snapshot.node_status(dep).unwrap().is_satisfied(),
                                "seed {}: {} started before {}",
                                seed,
                                node.id,
                                dep
                            );
                        }
                    }
                }
                if snapshot.status.is_terminal() {
                    assert_eq!(snapshot.status, ExecutionStatus::Completed);
                    break;
                }

                let outstanding: Vec<String> = launcher
                    .jobs()
                    .into_iter()
                    .map(|j| j.id)
                    .filter(|id| !finished.contains(id))
                    .collect();
                assert!(!outstanding.is_empty(), "seed {}: execution stalled", seed);
                let pick = outstanding[rng.gen_range(0..outstanding.len())].clone();
                finished.insert(pick.clone());
                finish(&engine, pick, true).await;
            }

            assert_eq!(launcher.jobs().len(), n);
        }
    }
}
