// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory execution DAG of one workflow instance.
//!
//! Built once from the definition when the instance starts, consulted on
//! every task completion to find what can run next, and dropped when the
//! instance finishes. Only the owning workflow actor touches it, so there is
//! no locking here.

use std::collections::{HashMap, HashSet, VecDeque};

use flowmaster_core::CoreError;
use flowmaster_core::model::{BranchOutcome, TaskDefinition, TaskKind, WorkflowDefinition};

/// Execution state of a DAG node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    /// Not triggered yet.
    Pending,
    /// A runnable exists for the given attempt.
    Active(i64),
    /// Finished successfully.
    Success,
    /// Failed for good.
    Failure,
    /// Skipped without running.
    Skipped,
    /// Killed.
    Killed,
    /// Paused before dispatch.
    Paused,
}

impl NodeState {
    /// Whether successors may look past this node.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            NodeState::Success | NodeState::Failure | NodeState::Skipped | NodeState::Killed
        )
    }

    /// Whether the node counts as failed for its successors.
    pub fn is_failed(&self) -> bool {
        matches!(self, NodeState::Failure | NodeState::Killed)
    }
}

/// One node with its edges.
#[derive(Debug, Clone)]
pub struct DagNode {
    /// The node's definition.
    pub definition: TaskDefinition,
    /// Direct upstream nodes.
    pub predecessors: Vec<String>,
    /// Direct downstream nodes.
    pub successors: Vec<String>,
    /// Skipped without running when triggered.
    pub skip: bool,
    /// Result of evaluating a condition node.
    pub condition_result: Option<BranchOutcome>,
    /// Current state.
    pub state: NodeState,
}

/// Adjacency structure of a workflow instance.
#[derive(Debug, Clone)]
pub struct WorkflowDag {
    nodes: HashMap<String, DagNode>,
    order: Vec<String>,
}

impl WorkflowDag {
    /// Build and validate the DAG of a definition.
    ///
    /// Rejects duplicate node names, relations naming unknown nodes, and
    /// cycles. Forbidden nodes start skip-flagged.
    pub fn build(definition: &WorkflowDefinition) -> Result<Self, CoreError> {
        let invalid = |reason: String| CoreError::InvalidDefinition {
            code: definition.code,
            reason,
        };

        let mut nodes: HashMap<String, DagNode> = HashMap::with_capacity(definition.tasks.len());
        for task in &definition.tasks {
            let node = DagNode {
                definition: task.clone(),
                predecessors: Vec::new(),
                successors: Vec::new(),
                skip: task.forbidden,
                condition_result: None,
                state: NodeState::Pending,
            };
            if nodes.insert(task.name.clone(), node).is_some() {
                return Err(invalid(format!("duplicate task name '{}'", task.name)));
            }
        }

        let mut seen = HashSet::new();
        for relation in &definition.relations {
            for name in [&relation.pre, &relation.post] {
                if !nodes.contains_key(name) {
                    return Err(invalid(format!("relation references unknown task '{}'", name)));
                }
            }
            if relation.pre == relation.post {
                return Err(invalid(format!("task '{}' depends on itself", relation.pre)));
            }
            if !seen.insert((relation.pre.as_str(), relation.post.as_str())) {
                continue;
            }
            if let Some(pre) = nodes.get_mut(&relation.pre) {
                pre.successors.push(relation.post.clone());
            }
            if let Some(post) = nodes.get_mut(&relation.post) {
                post.predecessors.push(relation.pre.clone());
            }
        }

        for task in &definition.tasks {
            if let TaskKind::Condition {
                success_branch,
                failure_branch,
            } = &task.kind
            {
                for branch in success_branch.iter().chain(failure_branch) {
                    let is_successor = nodes
                        .get(&task.name)
                        .is_some_and(|n| n.successors.contains(branch));
                    if !is_successor {
                        return Err(invalid(format!(
                            "condition '{}' branches to '{}' which is not a direct successor",
                            task.name, branch
                        )));
                    }
                }
            }
        }

        // Kahn's algorithm, seeded in definition order for stable output.
        let mut in_degree: HashMap<&str, usize> = nodes
            .iter()
            .map(|(name, node)| (name.as_str(), node.predecessors.len()))
            .collect();
        let mut ready: VecDeque<&str> = definition
            .tasks
            .iter()
            .map(|t| t.name.as_str())
            .filter(|name| in_degree.get(name) == Some(&0))
            .collect();
        let mut order = Vec::with_capacity(nodes.len());
        while let Some(name) = ready.pop_front() {
            order.push(name.to_string());
            if let Some(node) = nodes.get(name) {
                for successor in &node.successors {
                    if let Some(degree) = in_degree.get_mut(successor.as_str()) {
                        *degree -= 1;
                        if *degree == 0 {
                            ready.push_back(successor.as_str());
                        }
                    }
                }
            }
        }
        if order.len() != nodes.len() {
            let stuck = definition
                .tasks
                .iter()
                .find(|t| !order.contains(&t.name))
                .map(|t| t.name.clone())
                .unwrap_or_default();
            return Err(invalid(format!("cycle detected at '{}'", stuck)));
        }

        Ok(Self { nodes, order })
    }

    /// Nodes with no predecessors, in definition order.
    pub fn start_nodes(&self) -> Vec<String> {
        self.order
            .iter()
            .filter(|name| self.predecessors(name).is_empty())
            .cloned()
            .collect()
    }

    /// Node names in topological order.
    pub fn topological_order(&self) -> &[String] {
        &self.order
    }

    /// Direct successors of a node.
    pub fn successors(&self, name: &str) -> &[String] {
        self.nodes
            .get(name)
            .map(|n| n.successors.as_slice())
            .unwrap_or(&[])
    }

    /// Direct predecessors of a node.
    pub fn predecessors(&self, name: &str) -> &[String] {
        self.nodes
            .get(name)
            .map(|n| n.predecessors.as_slice())
            .unwrap_or(&[])
    }

    /// Whether every predecessor is terminal.
    pub fn is_triggerable(&self, name: &str) -> bool {
        self.nodes.contains_key(name)
            && self
                .predecessors(name)
                .iter()
                .all(|p| self.state_of(p).is_some_and(|s| s.is_terminal()))
    }

    /// Combined outcome of a node's predecessors.
    ///
    /// `None` while any predecessor is not terminal. A node without
    /// predecessors sees `Success`.
    pub fn predecessor_outcome(&self, name: &str) -> Option<BranchOutcome> {
        let mut outcome = BranchOutcome::Success;
        for predecessor in self.predecessors(name) {
            let state = self.state_of(predecessor)?;
            if !state.is_terminal() {
                return None;
            }
            if state.is_failed() {
                outcome = BranchOutcome::Failure;
            }
        }
        Some(outcome)
    }

    /// Whether the node has predecessors and all of them were skipped.
    pub fn all_predecessors_skipped(&self, name: &str) -> bool {
        let predecessors = self.predecessors(name);
        !predecessors.is_empty()
            && predecessors
                .iter()
                .all(|p| self.state_of(p) == Some(NodeState::Skipped))
    }

    /// Look up a node.
    pub fn node(&self, name: &str) -> Option<&DagNode> {
        self.nodes.get(name)
    }

    /// Look up a node for mutation.
    pub fn node_mut(&mut self, name: &str) -> Option<&mut DagNode> {
        self.nodes.get_mut(name)
    }

    /// Current state of a node.
    pub fn state_of(&self, name: &str) -> Option<NodeState> {
        self.nodes.get(name).map(|n| n.state)
    }

    /// Set a node's state; unknown names are ignored.
    pub fn set_state(&mut self, name: &str, state: NodeState) {
        if let Some(node) = self.nodes.get_mut(name) {
            node.state = state;
        }
    }

    /// Skip-flag a node.
    pub fn mark_skip(&mut self, name: &str) {
        if let Some(node) = self.nodes.get_mut(name) {
            node.skip = true;
        }
    }

    /// Node whose live attempt is `task_instance_id`.
    pub fn node_by_attempt(&self, task_instance_id: i64) -> Option<&DagNode> {
        self.nodes
            .values()
            .find(|n| n.state == NodeState::Active(task_instance_id))
    }

    /// Iterate all nodes in topological order.
    pub fn nodes(&self) -> impl Iterator<Item = &DagNode> {
        self.order.iter().filter_map(|name| self.nodes.get(name))
    }

    /// Number of nodes.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the DAG has no nodes.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}
