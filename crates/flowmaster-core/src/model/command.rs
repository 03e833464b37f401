// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Commands: queued requests to start or resume a workflow.
//!
//! A command is consumed exactly once, by whichever master owns its slot
//! (`id mod master_count`). Successful conversion deletes it in the same
//! transaction that writes the workflow instance; failed conversion moves it
//! to the error table.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::workflow::{FailureStrategy, WarningPolicy};

/// What a command asks the master to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandType {
    /// Start a new instance of a definition.
    Start,
    /// Start a new instance on behalf of a schedule.
    Scheduled,
    /// Re-run an existing (finished) instance from scratch.
    Repeat,
    /// Re-run the failed/killed nodes of an instance, keeping its successes.
    RecoverFailed,
    /// Resume a paused instance.
    RecoverSuspended,
    /// Resume an instance orphaned by a crashed master.
    RecoverFaultTolerance,
}

text_enum!(CommandType {
    Start => "start",
    Scheduled => "scheduled",
    Repeat => "repeat",
    RecoverFailed => "recover_failed",
    RecoverSuspended => "recover_suspended",
    RecoverFaultTolerance => "recover_fault_tolerance",
});

impl CommandType {
    /// Whether the command resumes an existing instance instead of creating one.
    pub fn is_recovery(&self) -> bool {
        matches!(
            self,
            Self::Repeat
                | Self::RecoverFailed
                | Self::RecoverSuspended
                | Self::RecoverFaultTolerance
        )
    }
}

/// A queued command as stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    /// Monotonic id; also the slot hashing key.
    pub id: i64,
    /// Requested operation.
    pub command_type: CommandType,
    /// Definition code.
    pub workflow_code: i64,
    /// Definition version.
    pub workflow_version: i32,
    /// Target instance for recovery commands.
    pub workflow_instance_id: Option<i64>,
    /// Which workflow-level alerts the instance emits.
    pub warning_policy: WarningPolicy,
    /// Overrides the definition's failure strategy when set.
    pub failure_strategy: Option<FailureStrategy>,
    /// Free-form scheduling parameters.
    pub params: serde_json::Value,
    /// When the command was queued.
    pub created_at: DateTime<Utc>,
}

/// A command to be queued.
#[derive(Debug, Clone, PartialEq)]
pub struct NewCommand {
    /// Requested operation.
    pub command_type: CommandType,
    /// Definition code.
    pub workflow_code: i64,
    /// Definition version.
    pub workflow_version: i32,
    /// Target instance for recovery commands.
    pub workflow_instance_id: Option<i64>,
    /// Which workflow-level alerts the instance emits.
    pub warning_policy: WarningPolicy,
    /// Overrides the definition's failure strategy when set.
    pub failure_strategy: Option<FailureStrategy>,
    /// Free-form scheduling parameters.
    pub params: serde_json::Value,
}

impl NewCommand {
    /// A `start` command for a definition.
    pub fn start(workflow_code: i64, workflow_version: i32) -> Self {
        Self {
            command_type: CommandType::Start,
            workflow_code,
            workflow_version,
            workflow_instance_id: None,
            warning_policy: WarningPolicy::None,
            failure_strategy: None,
            params: serde_json::Value::Null,
        }
    }

    /// A recovery command targeting an existing instance.
    pub fn recover(
        command_type: CommandType,
        workflow_code: i64,
        workflow_version: i32,
        workflow_instance_id: i64,
    ) -> Self {
        Self {
            command_type,
            workflow_instance_id: Some(workflow_instance_id),
            ..Self::start(workflow_code, workflow_version)
        }
    }

    /// Sets the warning policy.
    pub fn with_warning_policy(mut self, policy: WarningPolicy) -> Self {
        self.warning_policy = policy;
        self
    }

    /// Overrides the failure strategy.
    pub fn with_failure_strategy(mut self, strategy: FailureStrategy) -> Self {
        self.failure_strategy = Some(strategy);
        self
    }
}

/// A command that failed conversion, kept for operators.
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorCommand {
    /// The original command.
    pub command: Command,
    /// Failure reason (error text).
    pub message: String,
    /// When the command was moved to the error table.
    pub failed_at: DateTime<Utc>,
}
