//! Workflow definitions, executions and per-node state.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Kind of step a node performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    /// Submit a job and wait for its completion event.
    Job,
    /// Evaluate a boolean expression; false skips the node.
    Condition,
    /// Synchronisation marker, completes immediately.
    Parallel,
    /// Complete after `config.delay_ms`.
    Wait,
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

/// Retry behaviour for a failing node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, backoff_ms: u64, backoff_multiplier: f64) -> Self {
        Self {
            max_retries,
            backoff_ms,
            backoff_multiplier,
        }
    }

    /// Delay before retry attempt `attempt` (1-based):
    /// `backoff_ms * backoff_multiplier^(attempt - 1)`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 || self.backoff_ms == 0 {
            return Duration::ZERO;
        }
        let factor = self.backoff_multiplier.max(0.0).powi(attempt as i32 - 1);
        Duration::from_millis((self.backoff_ms as f64 * factor) as u64)
    }

    /// Whether another attempt is allowed after `retry_count` retries.
    pub fn allows_retry(&self, retry_count: u32) -> bool {
        retry_count < self.max_retries
    }
}

/// One step of a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowNode {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type")]
    pub node_type: NodeType,
    #[serde(default)]
    pub config: Value,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub retry_policy: Option<RetryPolicy>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// Boolean expression for `condition` nodes
    #[serde(default)]
    pub condition: Option<String>,
}

impl WorkflowNode {
    pub fn new(id: impl Into<String>, node_type: NodeType) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            node_type,
            config: Value::Null,
            dependencies: Vec::new(),
            retry_policy: None,
            timeout_ms: None,
            condition: None,
        }
    }

    pub fn depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_config(mut self, config: Value) -> Self {
        self.config = config;
        self
    }

    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    pub fn with_condition(mut self, expression: impl Into<String>) -> Self {
        self.condition = Some(expression.into());
        self
    }
}

fn default_max_concurrent_runs() -> u32 {
    5
}

/// A named, versioned DAG of nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// Assigned on create when empty
    #[serde(default)]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub version: u32,
    pub nodes: Vec<WorkflowNode>,
    /// Optional cron expression that launches a run
    #[serde(default)]
    pub schedule: Option<String>,
    #[serde(default = "default_max_concurrent_runs")]
    pub max_concurrent_runs: u32,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub owner: Option<String>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl WorkflowDefinition {
    pub fn new(name: impl Into<String>, nodes: Vec<WorkflowNode>) -> Self {
        let now = Utc::now();
        Self {
            id: String::new(),
            name: name.into(),
            description: None,
            version: 0,
            nodes,
            schedule: None,
            max_concurrent_runs: default_max_concurrent_runs(),
            tags: Vec::new(),
            owner: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn node(&self, id: &str) -> Option<&WorkflowNode> {
        self.nodes.iter().find(|n| n.id == id)
    }
}

/// Status of a node within one execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    #[default]
    Pending,
    /// Waiting for a retry timer
    Waiting,
    Ready,
    Running,
    Completed,
    Failed,
    Skipped,
    Cancelled,
}

impl NodeStatus {
    /// Satisfies downstream dependencies.
    pub fn is_satisfied(&self) -> bool {
        matches!(self, NodeStatus::Completed | NodeStatus::Skipped)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            NodeStatus::Completed | NodeStatus::Failed | NodeStatus::Skipped | NodeStatus::Cancelled
        )
    }
}

/// Runtime state of one node.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeState {
    pub status: NodeStatus,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub next_retry_at: Option<DateTime<Utc>>,
    /// Backing job for `job` nodes
    #[serde(default)]
    pub job_id: Option<String>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Status of a workflow execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Cancelled
        )
    }
}

/// One run of a workflow definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowExecution {
    pub id: String,
    pub run_id: String,
    pub workflow_id: String,
    pub workflow_name: String,
    pub workflow_version: u32,
    pub status: ExecutionStatus,
    #[serde(default)]
    pub parameters: Map<String, Value>,
    pub node_states: BTreeMap<String, NodeState>,
    #[serde(default)]
    pub failed_nodes: Vec<String>,
    #[serde(default)]
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowExecution {
    /// Create a `pending` execution with every node `pending`.
    pub fn new(
        definition: &WorkflowDefinition,
        parameters: Map<String, Value>,
        now: DateTime<Utc>,
    ) -> Self {
        let node_states = definition
            .nodes
            .iter()
            .map(|node| (node.id.clone(), NodeState::default()))
            .collect();
        Self {
            id: crate::new_id(),
            run_id: run_id(&definition.name, now),
            workflow_id: definition.id.clone(),
            workflow_name: definition.name.clone(),
            workflow_version: definition.version,
            status: ExecutionStatus::Pending,
            parameters,
            node_states,
            failed_nodes: Vec::new(),
            error: None,
            started_at: now,
            completed_at: None,
            updated_at: now,
        }
    }

    pub fn node_status(&self, node_id: &str) -> Option<NodeStatus> {
        self.node_states.get(node_id).map(|s| s.status)
    }

    /// Every node completed or skipped.
    pub fn all_nodes_satisfied(&self) -> bool {
        self.node_states.values().all(|s| s.status.is_satisfied())
    }
}

/// Build a human-readable run id: `<slug>-<YYYYMMDDHHMMSS>-<6 hex>`.
pub fn run_id(name: &str, now: DateTime<Utc>) -> String {
    let mut slug: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect();
    while slug.contains("--") {
        slug = slug.replace("--", "-");
    }
    let slug = slug.trim_matches('-');
    let slug = if slug.is_empty() { "workflow" } else { slug };
    let suffix: u32 = rand::thread_rng().gen_range(0..0x100_0000);
    format!("{}-{}-{:06x}", slug, now.format("%Y%m%d%H%M%S"), suffix)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn test_backoff_delay_per_attempt() {
        let policy = RetryPolicy::new(2, 1000, 2.0);
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(1000));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(2000));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(4000));
        assert_eq!(policy.delay_for_attempt(0), Duration::ZERO);
    }

    #[test]
    fn test_backoff_multiplier_one_is_constant() {
        let policy = RetryPolicy::new(5, 250, 1.0);
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(250));
    }

    #[test]
    fn test_allows_retry() {
        let policy = RetryPolicy::new(2, 10, 2.0);
        assert!(policy.allows_retry(0));
        assert!(policy.allows_retry(1));
        assert!(!policy.allows_retry(2));
    }

    #[test]
    fn test_run_id_format() {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 12, 30, 5).unwrap();
        let id = run_id("Nightly ETL / Sales", now);
        assert!(id.starts_with("nightly-etl-sales-20240101123005-"), "{}", id);
        let suffix = id.rsplit('-').next().unwrap();
        assert_eq!(suffix.len(), 6);
        assert!(suffix.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_run_id_empty_name() {
        let id = run_id("***", Utc::now());
        assert!(id.starts_with("workflow-"));
    }

    #[test]
    fn test_node_deserialize_defaults() {
        let node: WorkflowNode = serde_json::from_value(json!({
            "id": "a",
            "type": "job",
            "config": {"command": "echo a"},
            "retry_policy": {"max_retries": 2, "backoff_ms": 1000}
        }))
        .unwrap();
        assert_eq!(node.node_type, NodeType::Job);
        assert!(node.dependencies.is_empty());
        assert_eq!(node.retry_policy.unwrap().backoff_multiplier, 2.0);
    }

    #[test]
    fn test_new_execution_all_pending() {
        let mut def = WorkflowDefinition::new(
            "etl",
            vec![
                WorkflowNode::new("a", NodeType::Parallel),
                WorkflowNode::new("b", NodeType::Parallel).depends_on(["a"]),
            ],
        );
        def.id = "wf-1".to_string();
        let exec = WorkflowExecution::new(&def, Map::new(), Utc::now());
        assert_eq!(exec.status, ExecutionStatus::Pending);
        assert_eq!(exec.node_states.len(), 2);
        assert_eq!(exec.node_status("a"), Some(NodeStatus::Pending));
        assert!(!exec.all_nodes_satisfied());
    }
}
