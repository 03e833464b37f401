// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Workflow definitions.
//!
//! A definition is the blueprint of a DAG: a set of named tasks plus
//! `pre -> post` relations. Definitions are stored as JSON and turned into
//! an in-memory DAG by the master when an instance starts.

use serde::{Deserialize, Serialize};

use super::workflow::FailureStrategy;

/// Outcome of a node's predecessors, as seen by condition and blocking nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BranchOutcome {
    /// Every predecessor succeeded (or was skipped).
    Success,
    /// At least one predecessor failed.
    Failure,
}

/// What a task timeout does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutStrategy {
    /// Send an alert only.
    Warn,
    /// Kill the task and fail it.
    Failed,
    /// Alert, then kill and fail.
    WarnFailed,
}

text_enum!(TimeoutStrategy {
    Warn => "warn",
    Failed => "failed",
    WarnFailed => "warn_failed",
});

impl TimeoutStrategy {
    /// Whether the strategy alerts.
    pub fn warns(&self) -> bool {
        matches!(self, Self::Warn | Self::WarnFailed)
    }

    /// Whether the strategy kills the task.
    pub fn fails(&self) -> bool {
        matches!(self, Self::Failed | Self::WarnFailed)
    }
}

/// Task timeout policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskTimeout {
    /// Seconds after dispatch before the timeout fires.
    pub secs: i64,
    /// What to do when it fires.
    pub strategy: TimeoutStrategy,
}

/// How a node is executed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskKind {
    /// Dispatched to a worker through the uniform "execute task" contract.
    Normal {
        /// Plugin type understood by the worker (shell, sql, ...).
        task_type: String,
    },
    /// Evaluated by the master; selects one branch and skips the other.
    Condition {
        /// Successors run when the predecessors succeeded.
        success_branch: Vec<String>,
        /// Successors run when a predecessor failed.
        failure_branch: Vec<String>,
    },
    /// Evaluated by the master; blocks the workflow on a matching outcome.
    Blocking {
        /// Predecessor outcome that blocks the workflow.
        block_on: BranchOutcome,
    },
}

impl TaskKind {
    /// Type label recorded on task instances.
    pub fn type_label(&self) -> &str {
        match self {
            TaskKind::Normal { task_type } => task_type,
            TaskKind::Condition { .. } => "CONDITIONS",
            TaskKind::Blocking { .. } => "BLOCKING",
        }
    }

    /// Whether the master evaluates the node itself instead of dispatching it.
    pub fn is_local(&self) -> bool {
        !matches!(self, TaskKind::Normal { .. })
    }
}

/// One node of a workflow definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDefinition {
    /// Task code.
    pub code: i64,
    /// Task version.
    pub version: i32,
    /// Node name, unique within the workflow.
    pub name: String,
    /// Execution kind.
    pub kind: TaskKind,
    /// Retries after the first failed attempt.
    #[serde(default)]
    pub max_retry_times: i32,
    /// Seconds between a failure and the next attempt.
    #[serde(default)]
    pub retry_interval_secs: i64,
    /// Optional timeout policy.
    #[serde(default)]
    pub timeout: Option<TaskTimeout>,
    /// Optional task group limiting concurrency.
    #[serde(default)]
    pub task_group_id: Option<i64>,
    /// Forbidden nodes are skipped without running.
    #[serde(default)]
    pub forbidden: bool,
    /// Opaque parameters for the worker-side plugin.
    #[serde(default)]
    pub params: serde_json::Value,
}

impl TaskDefinition {
    /// A worker-dispatched task.
    pub fn normal(code: i64, name: impl Into<String>, task_type: impl Into<String>) -> Self {
        Self {
            code,
            version: 1,
            name: name.into(),
            kind: TaskKind::Normal {
                task_type: task_type.into(),
            },
            max_retry_times: 0,
            retry_interval_secs: 0,
            timeout: None,
            task_group_id: None,
            forbidden: false,
            params: serde_json::Value::Null,
        }
    }

    /// A condition node choosing between two successor branches.
    pub fn condition(
        code: i64,
        name: impl Into<String>,
        success_branch: Vec<String>,
        failure_branch: Vec<String>,
    ) -> Self {
        Self {
            kind: TaskKind::Condition {
                success_branch,
                failure_branch,
            },
            ..Self::normal(code, name, "")
        }
    }

    /// A blocking node.
    pub fn blocking(code: i64, name: impl Into<String>, block_on: BranchOutcome) -> Self {
        Self {
            kind: TaskKind::Blocking { block_on },
            ..Self::normal(code, name, "")
        }
    }

    /// Sets the retry policy.
    pub fn with_retries(mut self, max_retry_times: i32, retry_interval_secs: i64) -> Self {
        self.max_retry_times = max_retry_times;
        self.retry_interval_secs = retry_interval_secs;
        self
    }

    /// Sets the timeout policy.
    pub fn with_timeout(mut self, secs: i64, strategy: TimeoutStrategy) -> Self {
        self.timeout = Some(TaskTimeout { secs, strategy });
        self
    }

    /// Puts the task in a task group.
    pub fn with_task_group(mut self, group_id: i64) -> Self {
        self.task_group_id = Some(group_id);
        self
    }

    /// Marks the task forbidden (always skipped).
    pub fn forbidden(mut self) -> Self {
        self.forbidden = true;
        self
    }
}

/// A `pre -> post` edge.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskRelation {
    /// Upstream node name.
    pub pre: String,
    /// Downstream node name.
    pub post: String,
}

/// A versioned workflow definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// Definition code.
    pub code: i64,
    /// Definition version.
    pub version: i32,
    /// Human-readable name.
    pub name: String,
    /// Workflow timeout in seconds; 0 disables it.
    #[serde(default)]
    pub timeout_secs: i64,
    /// Default failure strategy.
    #[serde(default)]
    pub failure_strategy: FailureStrategy,
    /// Nodes.
    pub tasks: Vec<TaskDefinition>,
    /// Edges.
    #[serde(default)]
    pub relations: Vec<TaskRelation>,
}

impl WorkflowDefinition {
    /// An empty definition.
    pub fn new(code: i64, version: i32, name: impl Into<String>) -> Self {
        Self {
            code,
            version,
            name: name.into(),
            timeout_secs: 0,
            failure_strategy: FailureStrategy::End,
            tasks: Vec::new(),
            relations: Vec::new(),
        }
    }

    /// Adds a node.
    pub fn task(mut self, task: TaskDefinition) -> Self {
        self.tasks.push(task);
        self
    }

    /// Adds an edge.
    pub fn relation(mut self, pre: impl Into<String>, post: impl Into<String>) -> Self {
        self.relations.push(TaskRelation {
            pre: pre.into(),
            post: post.into(),
        });
        self
    }

    /// Sets the workflow timeout.
    pub fn with_timeout_secs(mut self, secs: i64) -> Self {
        self.timeout_secs = secs;
        self
    }

    /// Sets the failure strategy.
    pub fn with_failure_strategy(mut self, strategy: FailureStrategy) -> Self {
        self.failure_strategy = strategy;
        self
    }

    /// Looks up a node by name.
    pub fn find_task(&self, name: &str) -> Option<&TaskDefinition> {
        self.tasks.iter().find(|t| t.name == name)
    }
}
