// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Task group limiter.
//!
//! Thin layer over the persisted claim queue. All counting happens in
//! storage with conditional updates, because waiters may live on other
//! masters; this type adds logging and a uniform error type.

use std::sync::Arc;

use flowmaster_core::Lookup;
use flowmaster_core::model::{AcquireOutcome, TaskGroupClaim};
use flowmaster_core::persistence::Persistence;
use tracing::{debug, info};

use crate::error::Result;

/// Per-group counting semaphore with a FIFO wait queue.
pub struct TaskGroupLimiter {
    persistence: Arc<dyn Persistence>,
}

impl TaskGroupLimiter {
    /// Create a limiter over the shared claim queue.
    pub fn new(persistence: Arc<dyn Persistence>) -> Self {
        Self { persistence }
    }

    /// Claim a slot in `group_id` for a task attempt.
    ///
    /// `NotFound` means the group does not exist.
    pub async fn acquire(
        &self,
        group_id: i64,
        workflow_instance_id: i64,
        task_instance_id: i64,
    ) -> Result<Lookup<AcquireOutcome>> {
        let outcome = self
            .persistence
            .acquire_task_group_slot(group_id, workflow_instance_id, task_instance_id)
            .await?;
        debug!(
            group_id,
            workflow_instance_id,
            task_instance_id,
            outcome = ?outcome,
            "Task group acquire"
        );
        Ok(outcome)
    }

    /// Release an attempt's claim. Returns the claim promoted in its place.
    pub async fn release(&self, task_instance_id: i64) -> Result<Option<TaskGroupClaim>> {
        let promoted = self
            .persistence
            .release_task_group_slot(task_instance_id)
            .await?;
        if let Some(claim) = &promoted {
            info!(
                group_id = claim.group_id,
                released_task_instance_id = task_instance_id,
                workflow_instance_id = claim.workflow_instance_id,
                task_instance_id = claim.task_instance_id,
                "Task group claim promoted"
            );
        }
        Ok(promoted)
    }
}
