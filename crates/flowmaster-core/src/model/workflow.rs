// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Workflow instances.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::command::CommandType;
use super::definition::WorkflowDefinition;

/// Lifecycle state of a workflow instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowState {
    /// Created by command intake, not yet started by the engine.
    Submitted,
    /// Tasks are being driven by the owning master.
    Running,
    /// Every reachable node succeeded or was skipped.
    Success,
    /// A node failed and the failure strategy did not absorb it.
    Failure,
    /// Paused by an operator; resumable.
    Paused,
    /// A blocking node requires manual intervention.
    Blocked,
    /// Stopped (killed) by an operator.
    Stopped,
}

text_enum!(WorkflowState {
    Submitted => "submitted",
    Running => "running",
    Success => "success",
    Failure => "failure",
    Paused => "paused",
    Blocked => "blocked",
    Stopped => "stopped",
});

impl WorkflowState {
    /// Whether no further progress happens without a new command.
    pub fn is_finished(&self) -> bool {
        !matches!(self, Self::Submitted | Self::Running)
    }

    /// States a master still drives (candidates for failover).
    pub fn unfinished() -> &'static [WorkflowState] {
        &[WorkflowState::Submitted, WorkflowState::Running]
    }
}

/// What happens to the rest of the DAG when a task fails for good.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureStrategy {
    /// Kill the remaining active tasks and finish.
    #[default]
    End,
    /// Keep running independent branches; the instance still ends failed.
    Continue,
}

text_enum!(FailureStrategy {
    End => "end",
    Continue => "continue",
});

/// Which workflow-level terminal alerts an instance emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarningPolicy {
    /// No workflow-level alerts.
    #[default]
    None,
    /// Alert on success only.
    Success,
    /// Alert on failure only.
    Failure,
    /// Alert on both.
    All,
}

text_enum!(WarningPolicy {
    None => "none",
    Success => "success",
    Failure => "failure",
    All => "all",
});

impl WarningPolicy {
    /// Whether a success alert should be sent.
    pub fn notifies_success(&self) -> bool {
        matches!(self, Self::Success | Self::All)
    }

    /// Whether a failure alert should be sent.
    pub fn notifies_failure(&self) -> bool {
        matches!(self, Self::Failure | Self::All)
    }
}

/// One run of a workflow definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowInstance {
    /// Instance id (0 until inserted).
    pub id: i64,
    /// Display name, derived from the definition.
    pub name: String,
    /// Definition code.
    pub workflow_code: i64,
    /// Definition version.
    pub workflow_version: i32,
    /// Current state.
    pub state: WorkflowState,
    /// The command that (re)started this instance.
    pub command_type: CommandType,
    /// Owning master. `None` means not owned and eligible for pickup.
    pub host: Option<String>,
    /// When the instance was first started.
    pub start_time: DateTime<Utc>,
    /// When ownership last moved (recovery or failover).
    pub restart_time: Option<DateTime<Utc>>,
    /// When the instance reached a finished state.
    pub end_time: Option<DateTime<Utc>>,
    /// Workflow timeout in seconds; 0 disables the check.
    pub timeout_secs: i64,
    /// Failure strategy in effect.
    pub failure_strategy: FailureStrategy,
    /// Alert filter.
    pub warning_policy: WarningPolicy,
    /// Whether this instance runs as a sub-workflow of another.
    pub is_sub_workflow: bool,
    /// How many times the instance has been (re)started.
    pub run_times: i32,
    /// Parameters copied from the command.
    pub params: serde_json::Value,
}

impl WorkflowInstance {
    /// A fresh, not yet inserted instance of `definition` owned by `host`.
    pub fn new(definition: &WorkflowDefinition, host: &str, now: DateTime<Utc>) -> Self {
        Self {
            id: 0,
            name: format!("{}-{}", definition.name, now.format("%Y%m%d%H%M%S%3f")),
            workflow_code: definition.code,
            workflow_version: definition.version,
            state: WorkflowState::Submitted,
            command_type: CommandType::Start,
            host: Some(host.to_string()),
            start_time: now,
            restart_time: None,
            end_time: None,
            timeout_secs: definition.timeout_secs,
            failure_strategy: definition.failure_strategy,
            warning_policy: WarningPolicy::None,
            is_sub_workflow: false,
            run_times: 1,
            params: serde_json::Value::Null,
        }
    }

    /// The workflow timeout, if one is configured.
    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_secs > 0).then(|| Duration::from_secs(self.timeout_secs as u64))
    }

    /// Whether the instance is owned by `host`.
    pub fn is_owned_by(&self, host: &str) -> bool {
        self.host.as_deref() == Some(host)
    }
}
