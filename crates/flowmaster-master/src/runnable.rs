// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Task execution runnable.
//!
//! One runnable drives one task attempt through
//! `submitted -> (task group wait) -> dispatch -> running -> terminal`.
//! It is owned by the workflow actor and only ever called from it, so its
//! methods take `&mut self` and never lock. Remote calls are spawned with a
//! timeout and report back through the actor's mailbox; a runnable never
//! blocks the actor on the network.
//!
//! Every method returns a [`Transition`] telling the actor what changed.

use chrono::Utc;
use flowmaster_core::Lookup;
use flowmaster_core::model::{AcquireOutcome, TaskGroupClaim, TaskInstance, TaskState};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::engine::{EngineContext, WorkflowEvent};
use crate::remoting::{RemotingError, TaskDispatchRequest, TaskReport, TaskReportKind};

/// What a runnable operation changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// Nothing the actor needs to react to.
    Unchanged,
    /// The worker started the attempt.
    Running,
    /// The attempt reached a terminal state.
    Finished {
        /// Terminal state.
        state: TaskState,
        /// Task-group claim promoted by releasing this attempt's claim.
        promoted: Option<TaskGroupClaim>,
    },
}

/// Per-attempt state machine.
#[derive(Debug)]
pub struct TaskExecutionRunnable {
    task: TaskInstance,
    waiting_group: bool,
    retry_pending: bool,
}

impl TaskExecutionRunnable {
    /// Wrap an inserted attempt.
    pub fn new(task: TaskInstance) -> Self {
        Self {
            task,
            waiting_group: false,
            retry_pending: false,
        }
    }

    /// The attempt.
    pub fn task(&self) -> &TaskInstance {
        &self.task
    }

    /// Whether the attempt is queued on its task group.
    pub fn is_waiting_group(&self) -> bool {
        self.waiting_group
    }

    /// Whether the attempt failed and a retry is scheduled.
    pub fn is_retry_pending(&self) -> bool {
        self.retry_pending
    }

    pub(crate) fn set_retry_pending(&mut self) {
        self.retry_pending = true;
    }

    pub(crate) fn into_task(self) -> TaskInstance {
        self.task
    }

    /// Start the attempt: claim its task group (if any), then dispatch.
    pub async fn run(
        &mut self,
        ctx: &EngineContext,
        events: &mpsc::UnboundedSender<WorkflowEvent>,
    ) -> Transition {
        if let Some(group_id) = self.task.task_group_id {
            match ctx
                .limiter
                .acquire(group_id, self.task.workflow_instance_id, self.task.id)
                .await
            {
                Ok(Lookup::Found(AcquireOutcome::Acquired)) => {}
                Ok(Lookup::Found(AcquireOutcome::Queued)) => {
                    info!(
                        workflow_instance_id = self.task.workflow_instance_id,
                        task_instance_id = self.task.id,
                        group_id,
                        "Task queued on task group"
                    );
                    self.waiting_group = true;
                    return Transition::Unchanged;
                }
                Ok(Lookup::NotFound) | Ok(Lookup::Conflict(_)) => {
                    warn!(
                        task_instance_id = self.task.id,
                        group_id, "Task group not found, dispatching without limit"
                    );
                    self.task.task_group_id = None;
                }
                Err(e) => {
                    error!(
                        task_instance_id = self.task.id,
                        group_id,
                        error = %e,
                        "Task group acquire failed"
                    );
                    return self.finish(ctx, TaskState::Failure).await;
                }
            }
        }
        self.dispatch(ctx, events).await
    }

    /// A queued task-group claim was promoted; dispatch now.
    pub async fn on_task_group_wakeup(
        &mut self,
        ctx: &EngineContext,
        events: &mpsc::UnboundedSender<WorkflowEvent>,
    ) -> Transition {
        if !self.waiting_group || self.task.state.is_finished() {
            debug!(task_instance_id = self.task.id, "Ignoring stale task group wakeup");
            return Transition::Unchanged;
        }
        self.waiting_group = false;
        self.dispatch(ctx, events).await
    }

    /// Outcome of the spawned dispatch call.
    pub async fn on_dispatch_result(
        &mut self,
        ctx: &EngineContext,
        result: Result<(), String>,
    ) -> Transition {
        if self.task.state != TaskState::Dispatch {
            return Transition::Unchanged;
        }
        match result {
            Ok(()) => Transition::Unchanged,
            Err(message) => {
                warn!(
                    workflow_instance_id = self.task.workflow_instance_id,
                    task_instance_id = self.task.id,
                    worker = ?self.task.host,
                    error = %message,
                    "Task dispatch failed"
                );
                self.finish(ctx, TaskState::Failure).await
            }
        }
    }

    /// Apply a worker callback.
    pub async fn on_worker_event(&mut self, ctx: &EngineContext, report: TaskReport) -> Transition {
        if !self.task.state.is_on_worker() {
            debug!(
                task_instance_id = self.task.id,
                state = %self.task.state,
                "Ignoring report for attempt not on a worker"
            );
            return Transition::Unchanged;
        }
        match report.kind {
            TaskReportKind::Running { worker_host } => {
                if self.task.state == TaskState::Running {
                    return Transition::Unchanged;
                }
                self.task.state = TaskState::Running;
                self.task.host = Some(worker_host);
                self.task.start_time = Some(report.at);
                self.persist(ctx).await;
                Transition::Running
            }
            TaskReportKind::Success => self.finish(ctx, TaskState::Success).await,
            TaskReportKind::Failure { message } => {
                info!(
                    workflow_instance_id = self.task.workflow_instance_id,
                    task_instance_id = self.task.id,
                    error = %message,
                    "Task reported failure"
                );
                self.finish(ctx, TaskState::Failure).await
            }
            TaskReportKind::Killed => self.finish(ctx, TaskState::Kill).await,
        }
    }

    /// Kill the attempt. The worker is told best-effort; the local state
    /// moves to `kill` immediately.
    pub async fn kill(&mut self, ctx: &EngineContext) -> Transition {
        if self.task.state.is_finished() {
            return Transition::Unchanged;
        }
        if self.task.state.is_on_worker()
            && let Some(worker) = self.task.host.clone()
        {
            spawn_kill(ctx, worker, self.task.id);
        }
        self.finish(ctx, TaskState::Kill).await
    }

    /// Pause the attempt if it has not been dispatched yet.
    pub async fn pause(&mut self, ctx: &EngineContext) -> Transition {
        if self.task.state != TaskState::Submitted {
            return Transition::Unchanged;
        }
        self.finish(ctx, TaskState::Pause).await
    }

    async fn dispatch(
        &mut self,
        ctx: &EngineContext,
        events: &mpsc::UnboundedSender<WorkflowEvent>,
    ) -> Transition {
        let worker = match ctx.selector.select().await {
            Ok(Some(worker)) => worker,
            Ok(None) => {
                warn!(
                    task_instance_id = self.task.id,
                    "No live worker to dispatch to"
                );
                return self.finish(ctx, TaskState::Failure).await;
            }
            Err(e) => {
                warn!(task_instance_id = self.task.id, error = %e, "Worker selection failed");
                return self.finish(ctx, TaskState::Failure).await;
            }
        };

        self.task.state = TaskState::Dispatch;
        self.task.host = Some(worker.clone());
        self.persist(ctx).await;
        ctx.state_wheel.add_task_4_timeout_check(&self.task);

        let request = TaskDispatchRequest {
            correlation_id: Uuid::new_v4(),
            master_host: ctx.host.clone(),
            task: self.task.clone(),
        };
        debug!(
            task_instance_id = self.task.id,
            worker = %worker,
            correlation_id = %request.correlation_id,
            "Dispatching task"
        );

        let remoting = ctx.remoting.clone();
        let timeout = ctx.rpc_timeout;
        let events = events.clone();
        let task_instance_id = self.task.id;
        tokio::spawn(async move {
            let outcome = tokio::time::timeout(timeout, remoting.dispatch(&worker, request)).await;
            let result = match outcome {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(e.to_string()),
                Err(_) => Err(RemotingError::Timeout { host: worker }.to_string()),
            };
            // The actor may already be gone; nothing left to update then.
            let _ = events.send(WorkflowEvent::DispatchResult {
                task_instance_id,
                result,
            });
        });
        Transition::Unchanged
    }

    async fn finish(&mut self, ctx: &EngineContext, state: TaskState) -> Transition {
        self.task.state = state;
        self.task.end_time = Some(Utc::now());
        self.waiting_group = false;
        self.persist(ctx).await;
        ctx.state_wheel.remove_task(self.task.id);

        let promoted = match self.task.task_group_id {
            Some(_) => match ctx.limiter.release(self.task.id).await {
                Ok(promoted) => promoted,
                Err(e) => {
                    error!(task_instance_id = self.task.id, error = %e, "Task group release failed");
                    None
                }
            },
            None => None,
        };
        Transition::Finished { state, promoted }
    }

    async fn persist(&self, ctx: &EngineContext) {
        if let Err(e) = ctx.persistence.update_task_instance(&self.task).await {
            error!(
                workflow_instance_id = self.task.workflow_instance_id,
                task_instance_id = self.task.id,
                state = %self.task.state,
                error = %e,
                "Failed to persist task instance"
            );
        }
    }
}

/// Best-effort kill on a worker; failures are only logged.
pub(crate) fn spawn_kill(ctx: &EngineContext, worker: String, task_instance_id: i64) {
    let remoting = ctx.remoting.clone();
    let timeout = ctx.rpc_timeout;
    tokio::spawn(async move {
        let outcome = tokio::time::timeout(timeout, remoting.kill(&worker, task_instance_id)).await;
        match outcome {
            Ok(Ok(())) => debug!(worker = %worker, task_instance_id, "Kill sent"),
            Ok(Err(e)) => warn!(worker = %worker, task_instance_id, error = %e, "Kill failed"),
            Err(_) => warn!(worker = %worker, task_instance_id, "Kill timed out"),
        }
    });
}
