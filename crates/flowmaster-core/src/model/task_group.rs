// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Task groups: named counting semaphores shared across workflow instances.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A named concurrency limiter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskGroup {
    /// Group id.
    pub id: i64,
    /// Unique group name.
    pub name: String,
    /// Maximum concurrently acquired claims.
    pub capacity: i32,
    /// Currently acquired claims.
    pub use_size: i32,
}

/// State of a claim in the group queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClaimState {
    /// Waiting for capacity, FIFO by enqueue order.
    Queued,
    /// Holding one unit of capacity.
    Acquired,
    /// Done; no longer counted.
    Released,
}

text_enum!(ClaimState {
    Queued => "queued",
    Acquired => "acquired",
    Released => "released",
});

/// A (group, workflow instance, task instance) claim record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskGroupClaim {
    /// Queue position (monotonic).
    pub id: i64,
    /// Group being claimed.
    pub group_id: i64,
    /// Workflow instance owning the task.
    pub workflow_instance_id: i64,
    /// Claiming task instance.
    pub task_instance_id: i64,
    /// Claim state.
    pub state: ClaimState,
    /// When the claim was enqueued.
    pub created_at: DateTime<Utc>,
    /// Last state change.
    pub updated_at: DateTime<Utc>,
}

/// Result of asking a group for a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AcquireOutcome {
    /// The task may be dispatched now.
    Acquired,
    /// The task waits until a release promotes it.
    Queued,
}

impl ClaimState {
    /// The acquire outcome a claim in this state represents.
    pub fn as_outcome(&self) -> Option<AcquireOutcome> {
        match self {
            ClaimState::Queued => Some(AcquireOutcome::Queued),
            ClaimState::Acquired => Some(AcquireOutcome::Acquired),
            ClaimState::Released => None,
        }
    }
}
