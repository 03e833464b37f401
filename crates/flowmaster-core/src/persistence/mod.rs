// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Persistence interfaces and backends for flowmaster.
//!
//! This module defines the persistence abstraction shared by every master
//! replica. Every write that two masters could race on is expressed as a
//! single conditional statement (or a transaction around one), never as a
//! read-then-write in application code.

pub mod sqlite;

pub use self::sqlite::SqlitePersistence;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::CoreError;
use crate::model::{
    AcquireOutcome, Command, ErrorCommand, Lookup, NewCommand, TaskGroup, TaskGroupClaim,
    TaskInstance, WorkflowDefinition, WorkflowInstance,
};

/// Persistence interface used by the master.
#[async_trait]
pub trait Persistence: Send + Sync {
    // ========================================================================
    // Commands
    // ========================================================================

    /// Queue a command; returns its id.
    async fn insert_command(&self, command: &NewCommand) -> Result<i64, CoreError>;

    /// Page through pending commands whose `id mod slot_count == slot_index`,
    /// oldest first.
    async fn find_pending_commands(
        &self,
        page_size: i64,
        page_no: i64,
        slot_count: i64,
        slot_index: i64,
    ) -> Result<Vec<Command>, CoreError>;

    /// Move a command to the error table with the failure reason.
    async fn move_to_error_command(&self, command: &Command, reason: &str)
    -> Result<(), CoreError>;

    /// Commands that failed conversion, oldest first.
    async fn list_error_commands(&self) -> Result<Vec<ErrorCommand>, CoreError>;

    /// Atomically write the instance produced by a command and delete the
    /// command.
    ///
    /// An instance with `id == 0` is inserted; otherwise the existing row is
    /// updated. Returns `Conflict` (and writes nothing) when the command row
    /// is already gone, which means another master consumed it.
    async fn consume_command(
        &self,
        command_id: i64,
        instance: &WorkflowInstance,
    ) -> Result<Lookup<i64>, CoreError>;

    // ========================================================================
    // Definitions
    // ========================================================================

    /// Insert or replace a definition version.
    async fn save_workflow_definition(
        &self,
        definition: &WorkflowDefinition,
    ) -> Result<(), CoreError>;

    /// Load a definition version.
    async fn find_workflow_definition(
        &self,
        code: i64,
        version: i32,
    ) -> Result<Option<WorkflowDefinition>, CoreError>;

    // ========================================================================
    // Workflow instances
    // ========================================================================

    /// Load a workflow instance.
    async fn find_workflow_instance(
        &self,
        workflow_instance_id: i64,
    ) -> Result<Option<WorkflowInstance>, CoreError>;

    /// Insert an instance directly (sub-workflows and tooling); returns its id.
    async fn insert_workflow_instance(&self, instance: &WorkflowInstance)
    -> Result<i64, CoreError>;

    /// Persist every mutable column of a workflow instance.
    async fn update_workflow_instance(&self, instance: &WorkflowInstance)
    -> Result<(), CoreError>;

    /// Unfinished instances owned by `host`.
    async fn find_unfinished_instances_by_host(
        &self,
        host: &str,
    ) -> Result<Vec<WorkflowInstance>, CoreError>;

    /// Distinct hosts that own at least one unfinished instance.
    async fn list_unfinished_instance_hosts(&self) -> Result<Vec<String>, CoreError>;

    /// Move ownership of an instance from `expected_host` to `new_host`.
    ///
    /// Returns false when the instance is no longer owned by `expected_host`
    /// (someone else already took it over).
    async fn transfer_workflow_instance_host(
        &self,
        workflow_instance_id: i64,
        expected_host: &str,
        new_host: &str,
        restart_time: DateTime<Utc>,
    ) -> Result<bool, CoreError>;

    // ========================================================================
    // Task instances
    // ========================================================================

    /// Insert an attempt; returns its id.
    async fn insert_task_instance(&self, task: &TaskInstance) -> Result<i64, CoreError>;

    /// Persist every mutable column of an attempt.
    async fn update_task_instance(&self, task: &TaskInstance) -> Result<(), CoreError>;

    /// Load an attempt.
    async fn find_task_instance(
        &self,
        task_instance_id: i64,
    ) -> Result<Option<TaskInstance>, CoreError>;

    /// All attempts of a workflow instance, oldest first.
    async fn list_task_instances(
        &self,
        workflow_instance_id: i64,
    ) -> Result<Vec<TaskInstance>, CoreError>;

    /// Active attempts in `dispatch`/`running` on a worker.
    async fn find_worker_task_instances(
        &self,
        worker_host: &str,
    ) -> Result<Vec<TaskInstance>, CoreError>;

    /// Distinct workers holding at least one active `dispatch`/`running` attempt.
    async fn list_busy_worker_hosts(&self) -> Result<Vec<String>, CoreError>;

    // ========================================================================
    // Task groups
    // ========================================================================

    /// Create a task group; returns its id.
    async fn create_task_group(&self, name: &str, capacity: i32) -> Result<i64, CoreError>;

    /// Load a task group.
    async fn find_task_group(&self, group_id: i64) -> Result<Option<TaskGroup>, CoreError>;

    /// Claim a slot for a task instance.
    ///
    /// The capacity check and the increment are one conditional update, so
    /// acquired claims never exceed capacity even across masters. A task that
    /// already holds a live claim gets that claim's state back. Returns
    /// `NotFound` when the group does not exist.
    async fn acquire_task_group_slot(
        &self,
        group_id: i64,
        workflow_instance_id: i64,
        task_instance_id: i64,
    ) -> Result<Lookup<AcquireOutcome>, CoreError>;

    /// Release a task instance's claim.
    ///
    /// Releasing an acquired claim hands its unit of capacity to the oldest
    /// queued claim of the same group, which is returned. Releasing a queued
    /// claim just drops it.
    async fn release_task_group_slot(
        &self,
        task_instance_id: i64,
    ) -> Result<Option<TaskGroupClaim>, CoreError>;

    /// All claims of a group, in queue order.
    async fn list_task_group_claims(&self, group_id: i64)
    -> Result<Vec<TaskGroupClaim>, CoreError>;

    // ========================================================================
    // Health
    // ========================================================================

    /// Cheap connectivity check.
    async fn health_check_db(&self) -> Result<bool, CoreError>;
}
