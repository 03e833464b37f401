// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Remoting collaborator: calls from this master to workers and to other
//! masters, and the messages that flow back.
//!
//! Outbound calls are request/response with a correlation id; callers wrap
//! them in a timeout and treat a timeout as a failed call. Inbound traffic
//! (worker task reports, master-to-master events) is delivered to the
//! engine through [`InboundMessage`].

pub mod loopback;
pub mod selector;

pub use loopback::LoopbackRemoting;
pub use selector::RoundRobinSelector;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use flowmaster_core::model::TaskInstance;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Errors from remote calls.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RemotingError {
    /// The peer could not be reached.
    #[error("Host {0} is unreachable")]
    Unreachable(String),

    /// The peer did not answer in time.
    #[error("Call to {host} timed out")]
    Timeout {
        /// Peer address.
        host: String,
    },

    /// The peer answered with an error.
    #[error("Host {host} rejected the request: {message}")]
    Rejected {
        /// Peer address.
        host: String,
        /// Reason given by the peer.
        message: String,
    },
}

/// "Execute task" request sent to a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDispatchRequest {
    /// Correlates the response and later reports with this call.
    pub correlation_id: Uuid,
    /// Master the worker must report back to.
    pub master_host: String,
    /// The attempt to execute.
    pub task: TaskInstance,
}

/// What a worker reports about a task attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskReportKind {
    /// The worker started executing the attempt.
    Running {
        /// Worker address.
        worker_host: String,
    },
    /// The attempt finished successfully.
    Success,
    /// The attempt finished with an error.
    Failure {
        /// Error text from the plugin.
        message: String,
    },
    /// The attempt was killed on the worker.
    Killed,
}

/// Worker callback for one task attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskReport {
    /// Owning workflow instance.
    pub workflow_instance_id: i64,
    /// Attempt the report is about.
    pub task_instance_id: i64,
    /// What happened.
    pub kind: TaskReportKind,
    /// When it happened on the worker.
    pub at: DateTime<Utc>,
}

impl TaskReport {
    /// A report stamped now.
    pub fn new(workflow_instance_id: i64, task_instance_id: i64, kind: TaskReportKind) -> Self {
        Self {
            workflow_instance_id,
            task_instance_id,
            kind,
            at: Utc::now(),
        }
    }
}

/// One-way event between masters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MasterEvent {
    /// A task-group release promoted a queued claim owned by the receiver.
    TaskGroupWakeup {
        /// Owning workflow instance.
        workflow_instance_id: i64,
        /// Promoted attempt.
        task_instance_id: i64,
    },
    /// The attempt's worker died; the receiver must re-run the node.
    TaskFailover {
        /// Owning workflow instance.
        workflow_instance_id: i64,
        /// Orphaned attempt.
        task_instance_id: i64,
    },
}

impl MasterEvent {
    /// Workflow instance the event is addressed to.
    pub fn workflow_instance_id(&self) -> i64 {
        match self {
            MasterEvent::TaskGroupWakeup {
                workflow_instance_id,
                ..
            }
            | MasterEvent::TaskFailover {
                workflow_instance_id,
                ..
            } => *workflow_instance_id,
        }
    }
}

/// Inbound traffic for a master.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundMessage {
    /// Worker callback.
    Task(TaskReport),
    /// Event from another master (or from this one, for uniform routing).
    Master(MasterEvent),
}

/// Remoting collaborator.
#[async_trait]
pub trait Remoting: Send + Sync {
    /// Ask a worker to execute an attempt. Success means the worker accepted it.
    async fn dispatch(&self, worker_host: &str, request: TaskDispatchRequest)
    -> Result<(), RemotingError>;

    /// Ask a worker to kill an attempt.
    async fn kill(&self, worker_host: &str, task_instance_id: i64) -> Result<(), RemotingError>;

    /// Tell a worker that an attempt now reports to `new_master_host`.
    async fn notify_host_changed(
        &self,
        worker_host: &str,
        task_instance_id: i64,
        new_master_host: &str,
    ) -> Result<(), RemotingError>;

    /// Deliver an event to another master.
    async fn send_master_event(
        &self,
        master_host: &str,
        event: MasterEvent,
    ) -> Result<(), RemotingError>;
}
