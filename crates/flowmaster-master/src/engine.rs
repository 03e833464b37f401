// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! DAG execution engine.
//!
//! Every running workflow instance is an actor: one tokio task that owns the
//! instance's [`WorkflowDag`] and its task runnables, and consumes
//! [`WorkflowEvent`]s from an unbounded mailbox strictly in order. Worker
//! callbacks, dispatch results, timeouts, retries, failover and operator
//! actions all arrive as events, so nothing ever locks a DAG while many
//! instances progress in parallel.
//!
//! ```text
//!   intake / failover ──submit──► WorkflowEngine ──spawn──► actor(instance)
//!                                      │                        ▲
//!   worker reports / master events ────┴──── mailbox ───────────┘
//!   timing wheel ──────────────────────────────┘
//! ```
//!
//! The [`WorkflowInstanceCache`] maps instance ids to mailboxes; an instance
//! is "running on this master" exactly while it is in the cache.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use flowmaster_core::CoreError;
use flowmaster_core::model::{
    BranchOutcome, CommandType, FailureStrategy, TaskDefinition, TaskGroupClaim, TaskInstance,
    TaskKind, TaskState, WorkflowInstance, WorkflowState,
};
use flowmaster_core::persistence::Persistence;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::alert::{AlertDispatcher, AlertEvent};
use crate::cache::{InstanceHandle, WorkflowInstanceCache};
use crate::dag::{NodeState, WorkflowDag};
use crate::registry::{NodeType, Registry};
use crate::remoting::{InboundMessage, MasterEvent, Remoting, RoundRobinSelector, TaskReport};
use crate::runnable::{TaskExecutionRunnable, Transition, spawn_kill};
use crate::state_wheel::{StateWheel, TimeoutEvent, TimeoutListener};
use crate::task_group::TaskGroupLimiter;

/// Result of submitting a workflow instance to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkflowSubmitStatus {
    /// An actor was started for the instance.
    Success,
    /// The instance could not be prepared; it was marked failed.
    Failed,
    /// The instance is already running on this master.
    DuplicatedSubmitted,
}

/// Events consumed by a workflow actor.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkflowEvent {
    /// Start (or resume) triggering.
    Start,
    /// Worker callback for one attempt.
    TaskReport(TaskReport),
    /// Outcome of a spawned dispatch call.
    DispatchResult {
        /// Attempt id.
        task_instance_id: i64,
        /// Error text on failure.
        result: Result<(), String>,
    },
    /// A task attempt timed out.
    TaskTimeout {
        /// Attempt id.
        task_instance_id: i64,
    },
    /// The workflow timed out.
    WorkflowTimeout,
    /// Re-run a failed attempt whose retry interval elapsed.
    RetryTask {
        /// The failed attempt.
        task_instance_id: i64,
    },
    /// The attempt's worker died; run the node again.
    FailoverTask {
        /// The orphaned attempt.
        task_instance_id: i64,
    },
    /// A queued task-group claim was promoted.
    TaskGroupWakeup {
        /// The promoted attempt.
        task_instance_id: i64,
    },
    /// Operator pause: finish running tasks, trigger nothing new.
    Pause,
    /// Operator stop: kill everything.
    Stop,
}

/// Collaborators and shared state of one master's engine.
pub struct EngineContext {
    /// This master's address.
    pub host: String,
    /// Shared storage.
    pub persistence: Arc<dyn Persistence>,
    /// Cluster membership.
    pub registry: Arc<dyn Registry>,
    /// Calls to workers and other masters.
    pub remoting: Arc<dyn Remoting>,
    /// Worker selection.
    pub selector: RoundRobinSelector,
    /// Task group limiter.
    pub limiter: TaskGroupLimiter,
    /// Timeout wheels.
    pub state_wheel: Arc<StateWheel>,
    /// Instances running on this master.
    pub cache: WorkflowInstanceCache,
    /// Alert registration table.
    pub alerts: AlertDispatcher,
    /// Timeout for dispatch, kill and notify calls.
    pub rpc_timeout: Duration,
}

impl EngineContext {
    /// Wire an engine context.
    pub fn new(
        host: impl Into<String>,
        persistence: Arc<dyn Persistence>,
        registry: Arc<dyn Registry>,
        remoting: Arc<dyn Remoting>,
        state_wheel: Arc<StateWheel>,
        alerts: AlertDispatcher,
        rpc_timeout: Duration,
    ) -> Self {
        Self {
            host: host.into(),
            selector: RoundRobinSelector::new(registry.clone()),
            limiter: TaskGroupLimiter::new(persistence.clone()),
            persistence,
            registry,
            remoting,
            state_wheel,
            cache: WorkflowInstanceCache::new(),
            alerts,
            rpc_timeout,
        }
    }

    /// Release a retired attempt's task-group claim and wake the claim
    /// promoted in its place. A queued claim is simply dropped.
    pub(crate) async fn release_task_group(&self, task: &TaskInstance) {
        if task.task_group_id.is_none() {
            return;
        }
        match self.limiter.release(task.id).await {
            Ok(Some(claim)) => self.route_wakeup(claim).await,
            Ok(None) => {}
            Err(e) => error!(task_instance_id = task.id, error = %e, "Task group release failed"),
        }
    }

    /// Deliver a task-group wakeup to whichever master drives the promoted
    /// claim's workflow.
    pub(crate) async fn route_wakeup(&self, claim: TaskGroupClaim) {
        let task_instance_id = claim.task_instance_id;
        if let Some(handle) = self.cache.get(claim.workflow_instance_id) {
            let _ = handle
                .sender
                .send(WorkflowEvent::TaskGroupWakeup { task_instance_id });
            return;
        }

        let owner = match self
            .persistence
            .find_workflow_instance(claim.workflow_instance_id)
            .await
        {
            Ok(Some(instance)) => instance.host,
            Ok(None) => None,
            Err(e) => {
                error!(
                    workflow_instance_id = claim.workflow_instance_id,
                    error = %e,
                    "Cannot resolve owner for task group wakeup"
                );
                return;
            }
        };
        // Not running anywhere: the claim is released when its instance is
        // taken over.
        let Some(owner) = owner.filter(|h| *h != self.host) else {
            debug!(
                workflow_instance_id = claim.workflow_instance_id,
                task_instance_id, "Wakeup target not running, dropped"
            );
            return;
        };
        let event = MasterEvent::TaskGroupWakeup {
            workflow_instance_id: claim.workflow_instance_id,
            task_instance_id,
        };
        let remoting = self.remoting.clone();
        let timeout = self.rpc_timeout;
        tokio::spawn(async move {
            let outcome = tokio::time::timeout(timeout, remoting.send_master_event(&owner, event)).await;
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(master = %owner, task_instance_id, error = %e, "Wakeup not delivered"),
                Err(_) => warn!(master = %owner, task_instance_id, "Wakeup timed out"),
            }
        });
    }
}

/// Entry point to the per-instance actors of one master.
#[derive(Clone)]
pub struct WorkflowEngine {
    ctx: Arc<EngineContext>,
}

impl WorkflowEngine {
    /// Create an engine over a context.
    pub fn new(ctx: EngineContext) -> Self {
        Self { ctx: Arc::new(ctx) }
    }

    /// Shared context.
    pub fn context(&self) -> &Arc<EngineContext> {
        &self.ctx
    }

    /// Start driving a workflow instance on this master.
    ///
    /// The instance must already be persisted and owned by this master.
    /// A second submission of an id that is still running is rejected and
    /// leaves the stored row alone: that row belongs to the live actor, and
    /// marking it failed would overwrite the state the actor keeps writing.
    pub async fn submit(&self, instance: WorkflowInstance) -> WorkflowSubmitStatus {
        let workflow_instance_id = instance.id;
        let (sender, receiver) = mpsc::unbounded_channel();
        let handle = InstanceHandle {
            sender: sender.clone(),
        };
        if !self.ctx.cache.try_insert(workflow_instance_id, handle) {
            warn!(workflow_instance_id, "Workflow instance already running, submission discarded");
            return WorkflowSubmitStatus::DuplicatedSubmitted;
        }

        match WorkflowActor::prepare(self.ctx.clone(), instance.clone(), sender.clone()).await {
            Ok(actor) => {
                self.ctx.state_wheel.add_process_4_timeout_check(&instance);
                // Receiver is alive: it moves into the actor below.
                let _ = sender.send(WorkflowEvent::Start);
                tokio::spawn(actor.run(receiver));
                info!(
                    workflow_instance_id,
                    command_type = %instance.command_type,
                    "Workflow instance submitted"
                );
                WorkflowSubmitStatus::Success
            }
            Err(e) => {
                error!(workflow_instance_id, error = %e, "Failed to prepare workflow instance");
                let mut failed = instance;
                failed.state = WorkflowState::Failure;
                failed.end_time = Some(Utc::now());
                if let Err(e) = self.ctx.persistence.update_workflow_instance(&failed).await {
                    error!(workflow_instance_id, error = %e, "Failed to persist failed instance");
                }
                self.ctx.cache.remove(workflow_instance_id);
                WorkflowSubmitStatus::Failed
            }
        }
    }

    /// Deliver an event to a running instance. False when it is not running
    /// here.
    pub fn send(&self, workflow_instance_id: i64, event: WorkflowEvent) -> bool {
        match self.ctx.cache.get(workflow_instance_id) {
            Some(handle) => handle.sender.send(event).is_ok(),
            None => {
                debug!(workflow_instance_id, ?event, "Instance not running here, event dropped");
                false
            }
        }
    }

    /// Pause a running instance.
    pub fn pause(&self, workflow_instance_id: i64) -> bool {
        self.send(workflow_instance_id, WorkflowEvent::Pause)
    }

    /// Stop a running instance.
    pub fn stop(&self, workflow_instance_id: i64) -> bool {
        self.send(workflow_instance_id, WorkflowEvent::Stop)
    }

    /// Route a worker callback to its instance.
    pub fn report_task_event(&self, report: TaskReport) -> bool {
        self.send(report.workflow_instance_id, WorkflowEvent::TaskReport(report))
    }

    /// Route an event from another master to its instance.
    pub fn handle_master_event(&self, event: MasterEvent) -> bool {
        let workflow_instance_id = event.workflow_instance_id();
        let event = match event {
            MasterEvent::TaskGroupWakeup {
                task_instance_id, ..
            } => WorkflowEvent::TaskGroupWakeup { task_instance_id },
            MasterEvent::TaskFailover {
                task_instance_id, ..
            } => WorkflowEvent::FailoverTask { task_instance_id },
        };
        self.send(workflow_instance_id, event)
    }

    /// Route any inbound message.
    pub fn handle_inbound(&self, message: InboundMessage) -> bool {
        match message {
            InboundMessage::Task(report) => self.report_task_event(report),
            InboundMessage::Master(event) => self.handle_master_event(event),
        }
    }

    /// Whether an instance runs on this master.
    pub fn is_running(&self, workflow_instance_id: i64) -> bool {
        self.ctx.cache.contains(workflow_instance_id)
    }

    /// Ids of instances running on this master.
    pub fn running_instances(&self) -> Vec<i64> {
        self.ctx.cache.ids()
    }
}

impl TimeoutListener for WorkflowEngine {
    fn on_timeout(&self, event: TimeoutEvent) {
        match event {
            TimeoutEvent::Workflow {
                workflow_instance_id,
            } => {
                self.send(workflow_instance_id, WorkflowEvent::WorkflowTimeout);
            }
            TimeoutEvent::Task {
                workflow_instance_id,
                task_instance_id,
            } => {
                self.send(
                    workflow_instance_id,
                    WorkflowEvent::TaskTimeout { task_instance_id },
                );
            }
        }
    }
}

/// Why triggering stopped before the DAG was exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Halt {
    Paused,
    Stopped,
    Blocked,
    FailedEnd,
}

struct WorkflowActor {
    ctx: Arc<EngineContext>,
    instance: WorkflowInstance,
    dag: WorkflowDag,
    attempts: Vec<TaskInstance>,
    runnables: HashMap<i64, TaskExecutionRunnable>,
    finished: VecDeque<(i64, TaskState, Option<TaskGroupClaim>)>,
    unstarted: VecDeque<String>,
    events: mpsc::UnboundedSender<WorkflowEvent>,
    halt: Option<Halt>,
    failed: bool,
    blocked_by: Option<String>,
    done: bool,
}

impl WorkflowActor {
    async fn prepare(
        ctx: Arc<EngineContext>,
        instance: WorkflowInstance,
        events: mpsc::UnboundedSender<WorkflowEvent>,
    ) -> Result<Self, CoreError> {
        let definition = ctx
            .persistence
            .find_workflow_definition(instance.workflow_code, instance.workflow_version)
            .await?
            .ok_or(CoreError::WorkflowDefinitionNotFound {
                code: instance.workflow_code,
                version: instance.workflow_version,
            })?;
        let dag = WorkflowDag::build(&definition)?;
        let attempts = if instance.command_type.is_recovery() {
            ctx.persistence.list_task_instances(instance.id).await?
        } else {
            Vec::new()
        };

        Ok(Self {
            ctx,
            instance,
            dag,
            attempts,
            runnables: HashMap::new(),
            finished: VecDeque::new(),
            unstarted: VecDeque::new(),
            events,
            halt: None,
            failed: false,
            blocked_by: None,
            done: false,
        })
    }

    async fn run(mut self, mut mailbox: mpsc::UnboundedReceiver<WorkflowEvent>) {
        let workflow_instance_id = self.instance.id;
        while let Some(event) = mailbox.recv().await {
            self.handle(event).await;
            self.drain_finished().await;
            if self.runnables.is_empty() && self.instance.state == WorkflowState::Running {
                self.finalize().await;
            }
            if self.done {
                break;
            }
        }
        debug!(workflow_instance_id, "Workflow actor exited");
    }

    async fn handle(&mut self, event: WorkflowEvent) {
        match event {
            WorkflowEvent::Start => self.start().await,
            WorkflowEvent::TaskReport(report) => {
                let task_instance_id = report.task_instance_id;
                let Some(runnable) = self.runnables.get_mut(&task_instance_id) else {
                    debug!(
                        workflow_instance_id = self.instance.id,
                        task_instance_id, "Report for unknown attempt ignored"
                    );
                    return;
                };
                let transition = runnable.on_worker_event(&self.ctx, report).await;
                self.record(task_instance_id, transition);
            }
            WorkflowEvent::DispatchResult {
                task_instance_id,
                result,
            } => {
                if let Some(runnable) = self.runnables.get_mut(&task_instance_id) {
                    let transition = runnable.on_dispatch_result(&self.ctx, result).await;
                    self.record(task_instance_id, transition);
                }
            }
            WorkflowEvent::TaskTimeout { task_instance_id } => {
                self.task_timeout(task_instance_id).await
            }
            WorkflowEvent::WorkflowTimeout => {
                if !self.instance.state.is_finished() {
                    warn!(workflow_instance_id = self.instance.id, "Workflow timed out");
                    self.ctx.alerts.dispatch(AlertEvent::WorkflowTimeout {
                        workflow_instance_id: self.instance.id,
                        name: self.instance.name.clone(),
                        timeout_secs: self.instance.timeout_secs,
                    });
                }
            }
            WorkflowEvent::RetryTask { task_instance_id } => self.retry_task(task_instance_id).await,
            WorkflowEvent::FailoverTask { task_instance_id } => {
                self.failover_task(task_instance_id).await
            }
            WorkflowEvent::TaskGroupWakeup { task_instance_id } => {
                if let Some(runnable) = self.runnables.get_mut(&task_instance_id) {
                    let transition = runnable
                        .on_task_group_wakeup(&self.ctx, &self.events)
                        .await;
                    self.record(task_instance_id, transition);
                } else {
                    debug!(task_instance_id, "Wakeup for unknown attempt ignored");
                }
            }
            WorkflowEvent::Pause => {
                if self.halt.is_none() {
                    info!(workflow_instance_id = self.instance.id, "Pausing workflow");
                    self.halt = Some(Halt::Paused);
                    self.pause_all_task().await;
                }
            }
            WorkflowEvent::Stop => {
                if !matches!(self.halt, Some(Halt::Stopped)) {
                    info!(workflow_instance_id = self.instance.id, "Stopping workflow");
                    self.halt = Some(Halt::Stopped);
                    self.kill_all_task().await;
                }
            }
        }
    }

    async fn start(&mut self) {
        if self.instance.state == WorkflowState::Running {
            return;
        }
        self.instance.state = WorkflowState::Running;
        self.persist_instance().await;

        if self.instance.command_type.is_recovery() {
            self.restore_nodes().await;
        }
        let order = self.dag.topological_order().to_vec();
        self.trigger_tasks(order).await;
    }

    /// Rebuild node states from persisted attempts of a resumed instance.
    async fn restore_nodes(&mut self) {
        let live_workers: HashSet<String> =
            match self.ctx.registry.list_live_nodes(NodeType::Worker).await {
                Ok(nodes) => nodes.into_iter().map(|n| n.host).collect(),
                Err(e) => {
                    warn!(error = %e, "Cannot list workers, treating all as dead");
                    HashSet::new()
                }
            };
        let repeat = self.instance.command_type == CommandType::Repeat;

        let mut latest: HashMap<String, TaskInstance> = HashMap::new();
        for attempt in std::mem::take(&mut self.attempts) {
            if attempt.active {
                latest.insert(attempt.name.clone(), attempt);
            }
        }

        for (name, mut attempt) in latest {
            let is_local = self
                .dag
                .node(&name)
                .is_some_and(|n| n.definition.kind.is_local());
            let keep = !repeat && !is_local && self.dag.node(&name).is_some();
            match attempt.state {
                TaskState::Success | TaskState::ForcedSuccess if keep => {
                    self.dag.set_state(&name, NodeState::Success);
                    continue;
                }
                TaskState::Dispatch | TaskState::Running if keep => {
                    let worker_alive = attempt
                        .host
                        .as_ref()
                        .is_some_and(|h| live_workers.contains(h));
                    if worker_alive {
                        info!(
                            task_instance_id = attempt.id,
                            worker = ?attempt.host,
                            "Reattaching running task"
                        );
                        self.ctx.state_wheel.add_task_4_timeout_check(&attempt);
                        self.dag.set_state(&name, NodeState::Active(attempt.id));
                        self.runnables
                            .insert(attempt.id, TaskExecutionRunnable::new(attempt));
                        continue;
                    }
                    if let Some(worker) = attempt.host.clone() {
                        spawn_kill(&self.ctx, worker, attempt.id);
                    }
                    attempt.state = TaskState::NeedFaultTolerance;
                }
                _ => {}
            }
            if attempt.state.is_on_worker() {
                attempt.state = TaskState::Kill;
                attempt.end_time = Some(Utc::now());
            }
            attempt.active = false;
            if let Err(e) = self.ctx.persistence.update_task_instance(&attempt).await {
                error!(task_instance_id = attempt.id, error = %e, "Failed to retire attempt");
            }
            self.ctx.release_task_group(&attempt).await;
        }
    }

    /// Evaluate nodes breadth-first. Nodes that finish locally (skip,
    /// condition, blocking) enqueue their successors.
    async fn trigger_tasks(&mut self, seeds: Vec<String>) {
        let mut queue: VecDeque<String> = seeds.into();
        while let Some(name) = queue.pop_front() {
            if self.trigger_task(&name).await {
                queue.extend(self.dag.successors(&name).iter().cloned());
            }
        }
    }

    async fn trigger_next_tasks(&mut self, name: &str) {
        let successors = self.dag.successors(name).to_vec();
        self.trigger_tasks(successors).await;
    }

    /// Returns true when the node finished without a runnable.
    async fn trigger_task(&mut self, name: &str) -> bool {
        if self.halt.is_some() {
            return false;
        }
        let Some(node) = self.dag.node(name) else {
            return false;
        };
        if node.state != NodeState::Pending || !self.dag.is_triggerable(name) {
            return false;
        }
        if node.skip || self.dag.all_predecessors_skipped(name) {
            debug!(workflow_instance_id = self.instance.id, task = %name, "Task skipped");
            self.dag.set_state(name, NodeState::Skipped);
            return true;
        }
        let Some(outcome) = self.dag.predecessor_outcome(name) else {
            return false;
        };
        let definition = node.definition.clone();

        match &definition.kind {
            TaskKind::Condition {
                success_branch,
                failure_branch,
            } => {
                let skipped = match outcome {
                    BranchOutcome::Success => failure_branch,
                    BranchOutcome::Failure => success_branch,
                };
                for branch in skipped {
                    self.dag.mark_skip(branch);
                }
                if let Some(node) = self.dag.node_mut(name) {
                    node.condition_result = Some(outcome);
                }
                info!(
                    workflow_instance_id = self.instance.id,
                    task = %name,
                    outcome = ?outcome,
                    "Condition evaluated"
                );
                self.record_local_attempt(&definition).await;
                self.dag.set_state(name, NodeState::Success);
                true
            }
            TaskKind::Blocking { block_on } => {
                self.record_local_attempt(&definition).await;
                self.dag.set_state(name, NodeState::Success);
                if outcome == *block_on {
                    info!(
                        workflow_instance_id = self.instance.id,
                        task = %name,
                        "Workflow blocked"
                    );
                    self.halt = Some(Halt::Blocked);
                    self.blocked_by = Some(name.to_string());
                    return false;
                }
                true
            }
            TaskKind::Normal { .. } => {
                if outcome == BranchOutcome::Failure {
                    // Failed upstream; the node never runs.
                    return false;
                }
                self.start_attempt(&definition, 0).await;
                false
            }
        }
    }

    async fn start_attempt(&mut self, definition: &TaskDefinition, retry_times: i32) {
        let mut task = TaskInstance::new(self.instance.id, definition, retry_times, Utc::now());
        match self.ctx.persistence.insert_task_instance(&task).await {
            Ok(id) => task.id = id,
            Err(e) => {
                error!(
                    workflow_instance_id = self.instance.id,
                    task = %definition.name,
                    error = %e,
                    "Failed to create task instance"
                );
                self.dag.set_state(&definition.name, NodeState::Failure);
                self.unstarted.push_back(definition.name.clone());
                return;
            }
        }
        let task_instance_id = task.id;
        debug!(
            workflow_instance_id = self.instance.id,
            task_instance_id,
            task = %definition.name,
            retry_times,
            "Task triggered"
        );
        self.dag
            .set_state(&definition.name, NodeState::Active(task_instance_id));
        let mut runnable = TaskExecutionRunnable::new(task);
        let transition = runnable.run(&self.ctx, &self.events).await;
        self.runnables.insert(task_instance_id, runnable);
        self.record(task_instance_id, transition);
    }

    async fn record_local_attempt(&self, definition: &TaskDefinition) {
        let now = Utc::now();
        let mut task = TaskInstance::new(self.instance.id, definition, 0, now);
        task.state = TaskState::Success;
        task.start_time = Some(now);
        task.end_time = Some(now);
        task.host = Some(self.ctx.host.clone());
        if let Err(e) = self.ctx.persistence.insert_task_instance(&task).await {
            error!(task = %definition.name, error = %e, "Failed to record local task");
        }
    }

    fn record(&mut self, task_instance_id: i64, transition: Transition) {
        if let Transition::Finished { state, promoted } = transition {
            self.finished.push_back((task_instance_id, state, promoted));
        }
    }

    /// Settle finished attempts and nodes that failed to start. Handlers may
    /// trigger successors, which can queue more of either.
    async fn drain_finished(&mut self) {
        loop {
            if let Some((task_instance_id, state, promoted)) = self.finished.pop_front() {
                if let Some(claim) = promoted {
                    self.route_wakeup(claim).await;
                }
                self.on_task_finished(task_instance_id, state).await;
            } else if let Some(name) = self.unstarted.pop_front() {
                self.on_final_failure(&name, None).await;
            } else {
                break;
            }
        }
    }

    async fn on_task_finished(&mut self, task_instance_id: i64, state: TaskState) {
        let Some(runnable) = self.runnables.get_mut(&task_instance_id) else {
            return;
        };
        let name = runnable.task().name.clone();
        debug!(
            workflow_instance_id = self.instance.id,
            task_instance_id,
            task = %name,
            state = %state,
            "Task finished"
        );

        match state {
            TaskState::Success | TaskState::ForcedSuccess => {
                self.runnables.remove(&task_instance_id);
                self.dag.set_state(&name, NodeState::Success);
                self.trigger_next_tasks(&name).await;
            }
            TaskState::Failure if runnable.task().can_retry() && self.halt.is_none() => {
                runnable.set_retry_pending();
                let delay = runnable.task().retry_interval();
                info!(
                    workflow_instance_id = self.instance.id,
                    task_instance_id,
                    retry_times = runnable.task().retry_times + 1,
                    delay_secs = delay.as_secs(),
                    "Task failed, retry scheduled"
                );
                let events = self.events.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = events.send(WorkflowEvent::RetryTask { task_instance_id });
                });
            }
            TaskState::Failure | TaskState::Kill => {
                let runnable = self.runnables.remove(&task_instance_id);
                let node_state = if state == TaskState::Kill {
                    NodeState::Killed
                } else {
                    NodeState::Failure
                };
                self.dag.set_state(&name, node_state);
                if self.halt == Some(Halt::Stopped) {
                    return;
                }
                self.on_final_failure(&name, runnable.map(|r| r.task().id)).await;
            }
            TaskState::Pause => {
                self.runnables.remove(&task_instance_id);
                self.dag.set_state(&name, NodeState::Paused);
            }
            other => {
                warn!(task_instance_id, state = %other, "Unexpected terminal task state");
                self.runnables.remove(&task_instance_id);
                self.dag.set_state(&name, NodeState::Failure);
            }
        }
    }

    async fn on_final_failure(&mut self, name: &str, task_instance_id: Option<i64>) {
        let handled_by_condition = self.dag.successors(name).iter().any(|s| {
            self.dag
                .node(s)
                .is_some_and(|n| matches!(n.definition.kind, TaskKind::Condition { .. }))
        });
        if handled_by_condition {
            self.trigger_next_tasks(name).await;
            return;
        }

        self.failed = true;
        if let Some(task_instance_id) = task_instance_id {
            self.ctx.alerts.dispatch(AlertEvent::TaskFailure {
                workflow_instance_id: self.instance.id,
                task_instance_id,
                task_name: name.to_string(),
            });
        }
        if self.instance.failure_strategy == FailureStrategy::End && self.halt.is_none() {
            info!(
                workflow_instance_id = self.instance.id,
                task = %name,
                "Task failed, ending workflow"
            );
            self.halt = Some(Halt::FailedEnd);
            self.kill_all_task().await;
        }
    }

    async fn task_timeout(&mut self, task_instance_id: i64) {
        let Some(runnable) = self.runnables.get_mut(&task_instance_id) else {
            return;
        };
        if runnable.task().state.is_finished() || runnable.is_retry_pending() {
            return;
        }
        let strategy = runnable.task().timeout_strategy;
        let task = runnable.task().clone();
        warn!(
            workflow_instance_id = self.instance.id,
            task_instance_id,
            task = %task.name,
            "Task timed out"
        );
        if strategy.is_some_and(|s| s.warns()) {
            self.ctx.alerts.dispatch(AlertEvent::TaskTimeout {
                workflow_instance_id: self.instance.id,
                task_instance_id,
                task_name: task.name.clone(),
                timeout_secs: task.timeout_secs,
            });
        }
        if strategy.is_some_and(|s| s.fails()) {
            let transition = runnable.kill(&self.ctx).await;
            self.record(task_instance_id, transition);
        }
    }

    async fn retry_task(&mut self, task_instance_id: i64) {
        let retry_ready = self
            .runnables
            .get(&task_instance_id)
            .is_some_and(|r| r.is_retry_pending());
        if !retry_ready {
            debug!(task_instance_id, "Retry for unknown attempt ignored");
            return;
        }
        let Some(runnable) = self.runnables.remove(&task_instance_id) else {
            return;
        };
        let mut previous = runnable.into_task();
        if self.halt.is_some() {
            self.dag.set_state(&previous.name, NodeState::Failure);
            return;
        }
        previous.active = false;
        if let Err(e) = self.ctx.persistence.update_task_instance(&previous).await {
            error!(task_instance_id, error = %e, "Failed to retire attempt");
        }
        let Some(definition) = self.dag.node(&previous.name).map(|n| n.definition.clone()) else {
            return;
        };
        self.start_attempt(&definition, previous.retry_times + 1).await;
    }

    /// Re-run a node whose attempt was orphaned by a dead worker.
    async fn failover_task(&mut self, task_instance_id: i64) {
        let orphaned = self
            .runnables
            .get(&task_instance_id)
            .is_some_and(|r| r.task().state.is_on_worker());
        if !orphaned {
            debug!(task_instance_id, "Failover for attempt not on a worker ignored");
            return;
        }
        let Some(runnable) = self.runnables.remove(&task_instance_id) else {
            return;
        };
        let mut orphan = runnable.into_task();
        info!(
            workflow_instance_id = self.instance.id,
            task_instance_id,
            worker = ?orphan.host,
            "Re-running task after worker failover"
        );
        self.ctx.state_wheel.remove_task(task_instance_id);
        self.ctx.release_task_group(&orphan).await;
        orphan.state = TaskState::NeedFaultTolerance;
        orphan.active = false;
        orphan.end_time.get_or_insert_with(Utc::now);
        if let Err(e) = self.ctx.persistence.update_task_instance(&orphan).await {
            error!(task_instance_id, error = %e, "Failed to retire orphaned attempt");
        }
        self.dag.set_state(&orphan.name, NodeState::Pending);
        if self.halt.is_some() {
            return;
        }
        let Some(definition) = self.dag.node(&orphan.name).map(|n| n.definition.clone()) else {
            return;
        };
        self.start_attempt(&definition, orphan.retry_times).await;
    }

    async fn pause_all_task(&mut self) {
        let ids: Vec<i64> = self.runnables.keys().copied().collect();
        for task_instance_id in ids {
            let Some(runnable) = self.runnables.get_mut(&task_instance_id) else {
                continue;
            };
            if runnable.is_retry_pending() {
                let name = runnable.task().name.clone();
                self.runnables.remove(&task_instance_id);
                self.dag.set_state(&name, NodeState::Paused);
                continue;
            }
            let transition = runnable.pause(&self.ctx).await;
            self.record(task_instance_id, transition);
        }
    }

    async fn kill_all_task(&mut self) {
        let ids: Vec<i64> = self.runnables.keys().copied().collect();
        for task_instance_id in ids {
            let Some(runnable) = self.runnables.get_mut(&task_instance_id) else {
                continue;
            };
            if runnable.is_retry_pending() {
                let name = runnable.task().name.clone();
                self.runnables.remove(&task_instance_id);
                self.dag.set_state(&name, NodeState::Failure);
                continue;
            }
            let transition = runnable.kill(&self.ctx).await;
            self.record(task_instance_id, transition);
        }
    }

    async fn route_wakeup(&self, claim: TaskGroupClaim) {
        if claim.workflow_instance_id == self.instance.id {
            let _ = self.events.send(WorkflowEvent::TaskGroupWakeup {
                task_instance_id: claim.task_instance_id,
            });
            return;
        }
        self.ctx.route_wakeup(claim).await;
    }

    async fn finalize(&mut self) {
        let any_paused = self.dag.nodes().any(|n| n.state == NodeState::Paused);
        let state = match self.halt {
            Some(Halt::Stopped) => WorkflowState::Stopped,
            Some(Halt::Paused) => WorkflowState::Paused,
            Some(Halt::Blocked) => WorkflowState::Blocked,
            _ if self.failed => WorkflowState::Failure,
            _ if any_paused => WorkflowState::Paused,
            _ => WorkflowState::Success,
        };

        self.instance.state = state;
        self.instance.end_time = Some(Utc::now());
        self.persist_instance().await;
        self.ctx.state_wheel.remove_process(self.instance.id);

        info!(
            workflow_instance_id = self.instance.id,
            state = %state,
            "Workflow instance finished"
        );

        let policy = self.instance.warning_policy;
        let id = self.instance.id;
        let name = self.instance.name.clone();
        match state {
            WorkflowState::Success if policy.notifies_success() => {
                self.ctx.alerts.dispatch(AlertEvent::WorkflowSuccess {
                    workflow_instance_id: id,
                    name,
                })
            }
            WorkflowState::Failure | WorkflowState::Stopped if policy.notifies_failure() => {
                self.ctx.alerts.dispatch(AlertEvent::WorkflowFailure {
                    workflow_instance_id: id,
                    name,
                })
            }
            WorkflowState::Blocked if policy.notifies_failure() => {
                self.ctx.alerts.dispatch(AlertEvent::WorkflowBlocked {
                    workflow_instance_id: id,
                    name,
                    task_name: self.blocked_by.clone().unwrap_or_default(),
                })
            }
            _ => {}
        }

        self.ctx.cache.remove(id);
        self.done = true;
    }

    async fn persist_instance(&self) {
        if let Err(e) = self
            .ctx
            .persistence
            .update_workflow_instance(&self.instance)
            .await
        {
            error!(
                workflow_instance_id = self.instance.id,
                state = %self.instance.state,
                error = %e,
                "Failed to persist workflow instance"
            );
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::registry::{InMemoryRegistry, NodeInfo};
    use crate::remoting::{LoopbackRemoting, TaskReportKind};
    use crate::state_wheel::StateWheelConfig;
    use flowmaster_core::model::WorkflowDefinition;
    use flowmaster_core::persistence::SqlitePersistence;

    pub(crate) struct TestBed {
        pub ctx: EngineContext,
        pub remoting: Arc<LoopbackRemoting>,
    }

    pub(crate) async fn test_bed() -> TestBed {
        let persistence = Arc::new(SqlitePersistence::in_memory().await.unwrap());
        let registry = Arc::new(InMemoryRegistry::new());
        let remoting = Arc::new(LoopbackRemoting::new());
        let ctx = EngineContext::new(
            "m1",
            persistence,
            registry,
            remoting.clone(),
            Arc::new(StateWheel::new(StateWheelConfig::default())),
            AlertDispatcher::new(),
            Duration::from_millis(500),
        );
        TestBed { ctx, remoting }
    }

    async fn engine_with_workers() -> (WorkflowEngine, Arc<LoopbackRemoting>) {
        let bed = test_bed().await;
        bed.ctx
            .registry
            .register(NodeInfo::new(NodeType::Worker, "w1"))
            .await
            .unwrap();
        (WorkflowEngine::new(bed.ctx), bed.remoting)
    }

    async fn persisted_instance(
        engine: &WorkflowEngine,
        definition: &WorkflowDefinition,
    ) -> WorkflowInstance {
        let persistence = &engine.context().persistence;
        persistence.save_workflow_definition(definition).await.unwrap();
        let mut instance = WorkflowInstance::new(definition, "m1", Utc::now());
        instance.id = persistence.insert_workflow_instance(&instance).await.unwrap();
        instance
    }

    async fn wait_finished(engine: &WorkflowEngine, id: i64) -> WorkflowInstance {
        for _ in 0..200 {
            if !engine.is_running(id) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!engine.is_running(id), "instance {} still running", id);
        engine
            .context()
            .persistence
            .find_workflow_instance(id)
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_missing_definition_fails_submission() {
        let (engine, _) = engine_with_workers().await;
        let definition = WorkflowDefinition::new(1, 1, "ghost");
        let mut instance = WorkflowInstance::new(&definition, "m1", Utc::now());
        instance.id = engine
            .context()
            .persistence
            .insert_workflow_instance(&instance)
            .await
            .unwrap();

        assert_eq!(engine.submit(instance.clone()).await, WorkflowSubmitStatus::Failed);
        assert!(!engine.is_running(instance.id));
        let stored = engine
            .context()
            .persistence
            .find_workflow_instance(instance.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.state, WorkflowState::Failure);
        assert!(stored.end_time.is_some());
    }

    #[tokio::test]
    async fn test_linear_success() {
        let (engine, remoting) = engine_with_workers().await;
        let _inbox = remoting.connect_master("m1");
        let definition = WorkflowDefinition::new(1, 1, "linear")
            .task(TaskDefinition::normal(1, "A", "shell"))
            .task(TaskDefinition::normal(2, "B", "shell"))
            .relation("A", "B");
        let instance = persisted_instance(&engine, &definition).await;
        let id = instance.id;

        assert_eq!(engine.submit(instance).await, WorkflowSubmitStatus::Success);

        let first = remoting.wait_for_dispatches(1, Duration::from_secs(2)).await.unwrap();
        assert_eq!(first[0].request.task.name, "A");
        let task_instance_id = first[0].request.task.id;
        engine.report_task_event(TaskReport::new(id, task_instance_id, TaskReportKind::Success));

        let both = remoting.wait_for_dispatches(2, Duration::from_secs(2)).await.unwrap();
        assert_eq!(both[1].request.task.name, "B");
        let task_instance_id = both[1].request.task.id;
        engine.report_task_event(TaskReport::new(id, task_instance_id, TaskReportKind::Success));

        let finished = wait_finished(&engine, id).await;
        assert_eq!(finished.state, WorkflowState::Success);
    }

    #[tokio::test]
    async fn test_no_worker_fails_workflow() {
        let bed = test_bed().await;
        let engine = WorkflowEngine::new(bed.ctx);
        let definition = WorkflowDefinition::new(1, 1, "lonely")
            .task(TaskDefinition::normal(1, "A", "shell"));
        let instance = persisted_instance(&engine, &definition).await;
        let id = instance.id;

        engine.submit(instance).await;
        let finished = wait_finished(&engine, id).await;
        assert_eq!(finished.state, WorkflowState::Failure);
    }
}
