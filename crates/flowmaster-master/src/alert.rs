// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Alert collaborator.
//!
//! Terminal-state notifications are a closed set of [`AlertEvent`]s. Handlers
//! are registered per [`AlertKind`] when the runtime is built; dispatch is
//! fire-and-forget and a failing handler never affects workflow state.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Discriminant of an [`AlertEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    /// Workflow finished successfully.
    WorkflowSuccess,
    /// Workflow finished with a failure.
    WorkflowFailure,
    /// Workflow stopped on a blocking node.
    WorkflowBlocked,
    /// Workflow ran past its timeout.
    WorkflowTimeout,
    /// Workflow was taken over from a dead master.
    WorkflowFaultTolerance,
    /// Task failed for good (retries exhausted).
    TaskFailure,
    /// Task ran past its timeout.
    TaskTimeout,
    /// Task was re-run because its worker died.
    TaskFaultTolerance,
}

impl AlertKind {
    /// Every kind, for handlers that want all of them.
    pub const ALL: [AlertKind; 8] = [
        AlertKind::WorkflowSuccess,
        AlertKind::WorkflowFailure,
        AlertKind::WorkflowBlocked,
        AlertKind::WorkflowTimeout,
        AlertKind::WorkflowFaultTolerance,
        AlertKind::TaskFailure,
        AlertKind::TaskTimeout,
        AlertKind::TaskFaultTolerance,
    ];
}

/// A terminal-state notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AlertEvent {
    /// Workflow finished successfully.
    WorkflowSuccess {
        /// Instance id.
        workflow_instance_id: i64,
        /// Instance name.
        name: String,
    },
    /// Workflow finished with a failure.
    WorkflowFailure {
        /// Instance id.
        workflow_instance_id: i64,
        /// Instance name.
        name: String,
    },
    /// Workflow stopped on a blocking node.
    WorkflowBlocked {
        /// Instance id.
        workflow_instance_id: i64,
        /// Instance name.
        name: String,
        /// Blocking node.
        task_name: String,
    },
    /// Workflow ran past its timeout.
    WorkflowTimeout {
        /// Instance id.
        workflow_instance_id: i64,
        /// Instance name.
        name: String,
        /// Configured timeout.
        timeout_secs: i64,
    },
    /// Workflow was taken over from a dead master.
    WorkflowFaultTolerance {
        /// Instance id.
        workflow_instance_id: i64,
        /// Instance name.
        name: String,
        /// The dead master.
        from_host: String,
        /// The master that took over.
        to_host: String,
    },
    /// Task failed for good.
    TaskFailure {
        /// Owning instance.
        workflow_instance_id: i64,
        /// Attempt id.
        task_instance_id: i64,
        /// Node name.
        task_name: String,
    },
    /// Task ran past its timeout.
    TaskTimeout {
        /// Owning instance.
        workflow_instance_id: i64,
        /// Attempt id.
        task_instance_id: i64,
        /// Node name.
        task_name: String,
        /// Configured timeout.
        timeout_secs: i64,
    },
    /// Task was re-run because its worker died.
    TaskFaultTolerance {
        /// Owning instance.
        workflow_instance_id: i64,
        /// Orphaned attempt id.
        task_instance_id: i64,
        /// The dead worker.
        worker_host: String,
    },
}

impl AlertEvent {
    /// The event's discriminant.
    pub fn kind(&self) -> AlertKind {
        match self {
            AlertEvent::WorkflowSuccess { .. } => AlertKind::WorkflowSuccess,
            AlertEvent::WorkflowFailure { .. } => AlertKind::WorkflowFailure,
            AlertEvent::WorkflowBlocked { .. } => AlertKind::WorkflowBlocked,
            AlertEvent::WorkflowTimeout { .. } => AlertKind::WorkflowTimeout,
            AlertEvent::WorkflowFaultTolerance { .. } => AlertKind::WorkflowFaultTolerance,
            AlertEvent::TaskFailure { .. } => AlertKind::TaskFailure,
            AlertEvent::TaskTimeout { .. } => AlertKind::TaskTimeout,
            AlertEvent::TaskFaultTolerance { .. } => AlertKind::TaskFaultTolerance,
        }
    }

    /// Workflow instance the event is about.
    pub fn workflow_instance_id(&self) -> i64 {
        match self {
            AlertEvent::WorkflowSuccess {
                workflow_instance_id,
                ..
            }
            | AlertEvent::WorkflowFailure {
                workflow_instance_id,
                ..
            }
            | AlertEvent::WorkflowBlocked {
                workflow_instance_id,
                ..
            }
            | AlertEvent::WorkflowTimeout {
                workflow_instance_id,
                ..
            }
            | AlertEvent::WorkflowFaultTolerance {
                workflow_instance_id,
                ..
            }
            | AlertEvent::TaskFailure {
                workflow_instance_id,
                ..
            }
            | AlertEvent::TaskTimeout {
                workflow_instance_id,
                ..
            }
            | AlertEvent::TaskFaultTolerance {
                workflow_instance_id,
                ..
            } => *workflow_instance_id,
        }
    }
}

/// Receives alert events of the kinds it was registered for.
#[async_trait]
pub trait AlertHandler: Send + Sync {
    /// Handler name used in logs.
    fn name(&self) -> &str;

    /// Deliver one event.
    async fn handle(&self, event: &AlertEvent) -> crate::error::Result<()>;
}

/// Registration table from alert kind to handlers.
#[derive(Clone, Default)]
pub struct AlertDispatcher {
    handlers: HashMap<AlertKind, Vec<Arc<dyn AlertHandler>>>,
}

impl AlertDispatcher {
    /// A dispatcher with no handlers (alerts are dropped).
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `kind`.
    pub fn register(mut self, kind: AlertKind, handler: Arc<dyn AlertHandler>) -> Self {
        self.handlers.entry(kind).or_default().push(handler);
        self
    }

    /// Register `handler` for every kind.
    pub fn register_all(mut self, handler: Arc<dyn AlertHandler>) -> Self {
        for kind in AlertKind::ALL {
            self = self.register(kind, handler.clone());
        }
        self
    }

    /// Number of handlers registered for `kind`.
    pub fn handler_count(&self, kind: AlertKind) -> usize {
        self.handlers.get(&kind).map_or(0, Vec::len)
    }

    /// Hand `event` to its handlers in the background.
    pub fn dispatch(&self, event: AlertEvent) {
        let Some(handlers) = self.handlers.get(&event.kind()) else {
            return;
        };
        let handlers = handlers.clone();
        tokio::spawn(async move {
            for handler in handlers {
                if let Err(e) = handler.handle(&event).await {
                    warn!(
                        handler = handler.name(),
                        kind = ?event.kind(),
                        workflow_instance_id = event.workflow_instance_id(),
                        error = %e,
                        "Alert handler failed"
                    );
                }
            }
        });
    }
}

/// Handler that writes alerts to the log.
pub struct LogAlertHandler;

#[async_trait]
impl AlertHandler for LogAlertHandler {
    fn name(&self) -> &str {
        "log"
    }

    async fn handle(&self, event: &AlertEvent) -> crate::error::Result<()> {
        info!(
            kind = ?event.kind(),
            workflow_instance_id = event.workflow_instance_id(),
            event = %serde_json::to_string(event).unwrap_or_default(),
            "Alert"
        );
        Ok(())
    }
}
