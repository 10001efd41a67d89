//! Structural validation of workflow definitions.
//!
//! Runs on create and update. A definition that passes can always be
//! executed to completion if every node succeeds.

use std::collections::{HashMap, HashSet};

use jobd_types::{NodeType, WorkflowDefinition, WorkflowNode};

use crate::{Condition, WorkflowError};

/// Reject malformed definitions.
///
/// Checks, in order: non-empty name and node list, unique node ids,
/// dependency existence (no self-dependency), per-type node config, the
/// optional cron schedule, and finally acyclicity.
pub fn validate_definition(definition: &WorkflowDefinition) -> Result<(), WorkflowError> {
    if definition.name.trim().is_empty() {
        return Err(WorkflowError::InvalidDefinition(
            "name must not be empty".to_string(),
        ));
    }
    if definition.nodes.is_empty() {
        return Err(WorkflowError::InvalidDefinition(
            "workflow must have at least one node".to_string(),
        ));
    }
    if definition.max_concurrent_runs == 0 {
        return Err(WorkflowError::InvalidDefinition(
            "max_concurrent_runs must be > 0".to_string(),
        ));
    }

    let mut ids = HashSet::new();
    for node in &definition.nodes {
        if node.id.trim().is_empty() {
            return Err(WorkflowError::InvalidDefinition(
                "node id must not be empty".to_string(),
            ));
        }
        if !ids.insert(node.id.as_str()) {
            return Err(WorkflowError::DuplicateNode(node.id.clone()));
        }
    }

    for node in &definition.nodes {
        for dep in &node.dependencies {
            if dep == &node.id {
                return Err(WorkflowError::CycleDetected(format!("{} -> {}", dep, dep)));
            }
            if !ids.contains(dep.as_str()) {
                return Err(WorkflowError::UnknownDependency {
                    node: node.id.clone(),
                    dependency: dep.clone(),
                });
            }
        }
        validate_node(node)?;
    }

    if let Some(schedule) = &definition.schedule {
        jobd_scheduler::validate_cron_expression(schedule)
            .map_err(|e| WorkflowError::InvalidDefinition(e.to_string()))?;
    }

    detect_cycle(&definition.nodes)
}

fn validate_node(node: &WorkflowNode) -> Result<(), WorkflowError> {
    let invalid = |reason: &str| {
        WorkflowError::InvalidDefinition(format!("node '{}': {}", node.id, reason))
    };
    match node.node_type {
        NodeType::Job => {
            let command = node.config.get("command").and_then(|v| v.as_str());
            if command.map_or(true, |c| c.trim().is_empty()) {
                return Err(invalid("job node requires a non-empty config.command"));
            }
        }
        NodeType::Condition => {
            let expression = condition_source(node).ok_or_else(|| invalid("missing condition"))?;
            Condition::parse(expression)?;
        }
        NodeType::Wait => {
            if let Some(delay) = node.config.get("delay_ms") {
                if !delay.is_u64() {
                    return Err(invalid("config.delay_ms must be a non-negative integer"));
                }
            }
        }
        NodeType::Parallel => {}
    }
    if node.timeout_ms == Some(0) {
        return Err(invalid("timeout_ms must be > 0"));
    }
    Ok(())
}

/// Expression of a `condition` node: the `condition` field, falling back to
/// `config.expression`.
pub fn condition_source(node: &WorkflowNode) -> Option<&str> {
    node.condition
        .as_deref()
        .or_else(|| node.config.get("expression").and_then(|v| v.as_str()))
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Visiting,
    Done,
}

/// Depth-first search with a recursion stack. A node reached again while it
/// is still on the stack closes a cycle.
fn detect_cycle(nodes: &[WorkflowNode]) -> Result<(), WorkflowError> {
    let deps: HashMap<&str, &[String]> = nodes
        .iter()
        .map(|n| (n.id.as_str(), n.dependencies.as_slice()))
        .collect();
    let mut marks: HashMap<&str, Mark> = HashMap::new();

    for node in nodes {
        if marks.contains_key(node.id.as_str()) {
            continue;
        }
        // Explicit stack of (node, next dependency index) to avoid recursion
        // depth limits on long chains.
        let mut stack: Vec<(&str, usize)> = vec![(node.id.as_str(), 0)];
        marks.insert(node.id.as_str(), Mark::Visiting);

        while let Some(&(current, next)) = stack.last() {
            let current_deps = deps.get(current).copied().unwrap_or(&[]);
            if let Some(dep) = current_deps.get(next) {
                if let Some(top) = stack.last_mut() {
                    top.1 += 1;
                }
                match marks.get(dep.as_str()) {
                    Some(Mark::Visiting) => {
                        let start = stack
                            .iter()
                            .position(|(id, _)| *id == dep.as_str())
                            .unwrap_or(0);
                        let mut path: Vec<&str> = stack[start..].iter().map(|(id, _)| *id).collect();
                        path.push(dep.as_str());
                        return Err(WorkflowError::CycleDetected(path.join(" -> ")));
                    }
                    Some(Mark::Done) => {}
                    None => {
                        marks.insert(dep.as_str(), Mark::Visiting);
                        stack.push((dep.as_str(), 0));
                    }
                }
            } else {
                marks.insert(current, Mark::Done);
                stack.pop();
            }
        }
    }
    Ok(())
}
