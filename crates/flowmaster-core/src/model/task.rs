// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Task instances.
//!
//! A task instance is one execution attempt of a DAG node. Attempts are
//! never reused: a retry or a failover inserts a fresh row for the same node
//! and flips the previous one to `active = false`.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::definition::{TaskDefinition, TimeoutStrategy};

/// Lifecycle state of a task instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Created, waiting for a task-group slot or dispatch.
    Submitted,
    /// Sent to a worker, not yet acknowledged as running.
    Dispatch,
    /// Running on a worker.
    Running,
    /// Finished successfully.
    Success,
    /// Finished with an error.
    Failure,
    /// Killed.
    Kill,
    /// Marked successful by an operator.
    ForcedSuccess,
    /// Paused before it was dispatched.
    Pause,
    /// Orphaned by a dead worker; superseded by a new attempt.
    NeedFaultTolerance,
}

text_enum!(TaskState {
    Submitted => "submitted",
    Dispatch => "dispatch",
    Running => "running",
    Success => "success",
    Failure => "failure",
    Kill => "kill",
    ForcedSuccess => "forced_success",
    Pause => "pause",
    NeedFaultTolerance => "need_fault_tolerance",
});

impl TaskState {
    /// Whether the attempt is over.
    pub fn is_finished(&self) -> bool {
        !matches!(self, Self::Submitted | Self::Dispatch | Self::Running)
    }

    /// Whether the attempt counts as a success for DAG purposes.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success | Self::ForcedSuccess)
    }

    /// Whether a worker may currently hold the attempt.
    pub fn is_on_worker(&self) -> bool {
        matches!(self, Self::Dispatch | Self::Running)
    }
}

/// One execution attempt of a DAG node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskInstance {
    /// Attempt id (0 until inserted).
    pub id: i64,
    /// Owning workflow instance.
    pub workflow_instance_id: i64,
    /// Node name within the DAG.
    pub name: String,
    /// Task code.
    pub task_code: i64,
    /// Task version.
    pub task_version: i32,
    /// Plugin type label.
    pub task_type: String,
    /// Current state.
    pub state: TaskState,
    /// Worker the attempt was dispatched to.
    pub host: Option<String>,
    /// Retries consumed before this attempt.
    pub retry_times: i32,
    /// Retry budget.
    pub max_retry_times: i32,
    /// Seconds between a failure and the next attempt.
    pub retry_interval_secs: i64,
    /// Optional task group.
    pub task_group_id: Option<i64>,
    /// Timeout in seconds; 0 disables it.
    pub timeout_secs: i64,
    /// What a timeout does.
    pub timeout_strategy: Option<TimeoutStrategy>,
    /// When the attempt was created.
    pub submit_time: DateTime<Utc>,
    /// When the worker started it.
    pub start_time: Option<DateTime<Utc>>,
    /// When it finished.
    pub end_time: Option<DateTime<Utc>>,
    /// False once superseded by a newer attempt.
    pub active: bool,
    /// Plugin parameters.
    pub params: serde_json::Value,
}

impl TaskInstance {
    /// A fresh, not yet inserted attempt for `task`.
    pub fn new(
        workflow_instance_id: i64,
        task: &TaskDefinition,
        retry_times: i32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: 0,
            workflow_instance_id,
            name: task.name.clone(),
            task_code: task.code,
            task_version: task.version,
            task_type: task.kind.type_label().to_string(),
            state: TaskState::Submitted,
            host: None,
            retry_times,
            max_retry_times: task.max_retry_times,
            retry_interval_secs: task.retry_interval_secs,
            task_group_id: task.task_group_id,
            timeout_secs: task.timeout.map(|t| t.secs).unwrap_or(0),
            timeout_strategy: task.timeout.map(|t| t.strategy),
            submit_time: now,
            start_time: None,
            end_time: None,
            active: true,
            params: task.params.clone(),
        }
    }

    /// Whether another attempt is allowed after a failure.
    pub fn can_retry(&self) -> bool {
        self.retry_times < self.max_retry_times
    }

    /// Delay before the next attempt.
    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.retry_interval_secs.max(0) as u64)
    }

    /// The task timeout, if one is configured.
    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_secs > 0).then(|| Duration::from_secs(self.timeout_secs as u64))
    }
}
