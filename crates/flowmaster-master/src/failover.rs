// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Failover service.
//!
//! Liveness comes from the registry only. A sweep looks for unfinished
//! workflow instances owned by this master (left over from a previous
//! incarnation) or by a master the registry no longer lists, and for task
//! attempts still marked on a worker the registry no longer lists. Each
//! host is handled under a registry lock keyed by its address, so only one
//! master fails a given host over even when several detect it at once.
//!
//! Every step is safe to repeat: ownership moves with a conditional update,
//! and [`is_eligible_for_failover`] rejects instances already taken over.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use flowmaster_core::model::{CommandType, TaskState, WorkflowInstance, WorkflowState};
use tokio::sync::{Notify, broadcast};
use tracing::{debug, error, info, instrument, warn};

use crate::alert::AlertEvent;
use crate::cache::WorkflowInstanceCache;
use crate::engine::{WorkflowEngine, WorkflowEvent, WorkflowSubmitStatus};
use crate::error::Result;
use crate::registry::{MembershipEvent, NodeType, failover_lock_path, with_lock};
use crate::remoting::{MasterEvent, Remoting};

/// Failover service configuration.
#[derive(Debug, Clone)]
pub struct FailoverConfig {
    /// Period of the sweep.
    pub interval: Duration,
    /// How long to wait for a host's failover lock.
    pub lock_timeout: Duration,
    /// Timeout for kill, notify and master-event calls.
    pub rpc_timeout: Duration,
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            lock_timeout: Duration::from_secs(5),
            rpc_timeout: Duration::from_secs(5),
        }
    }
}

/// What one sweep did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FailoverReport {
    /// Master hosts whose instances were examined under lock.
    pub masters: Vec<String>,
    /// Worker hosts whose attempts were examined under lock.
    pub workers: Vec<String>,
    /// Workflow instances resubmitted on this master.
    pub instances_resubmitted: usize,
    /// Orphaned task attempts handed back to their workflow.
    pub tasks_failed_over: usize,
}

/// Whether an instance owned by `host` should be taken over.
///
/// `startup_time` is the startup time of the host's live incarnation, or
/// `None` when the host is not live. Instances started or restarted after
/// that time belong to the live incarnation.
pub fn is_eligible_for_failover(
    instance: &WorkflowInstance,
    host: &str,
    startup_time: Option<DateTime<Utc>>,
    cache: &WorkflowInstanceCache,
) -> bool {
    if instance.host.as_deref() != Some(host) {
        return false;
    }
    if let Some(startup_time) = startup_time {
        if instance.start_time > startup_time {
            return false;
        }
        if instance.restart_time.is_some_and(|t| t > startup_time) {
            return false;
        }
    }
    !cache.contains(instance.id)
}

/// Periodic failover worker.
pub struct FailoverService {
    engine: WorkflowEngine,
    config: FailoverConfig,
    shutdown: Arc<Notify>,
}

impl FailoverService {
    /// Create a failover service for the engine's master.
    pub fn new(engine: WorkflowEngine, config: FailoverConfig) -> Self {
        Self {
            engine,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Sweep periodically and whenever the registry reports a node removed.
    pub async fn run(self) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            "Failover service started"
        );
        let mut membership = self.engine.context().registry.subscribe();

        loop {
            if let Err(e) = self.failover_once().await {
                error!(error = %e, "Failover sweep failed");
            }

            tokio::select! {
                _ = self.shutdown.notified() => {
                    info!("Failover service shutting down");
                    break;
                }
                _ = tokio::time::sleep(self.config.interval) => {}
                _ = wait_for_removal(&mut membership) => {
                    debug!("Node removed, sweeping early");
                }
            }
        }
    }

    /// One sweep over dead masters, then dead workers.
    #[instrument(skip(self), fields(host = %self.engine.context().host))]
    pub async fn failover_once(&self) -> Result<FailoverReport> {
        let ctx = self.engine.context();
        let mut report = FailoverReport::default();

        let live_masters: HashMap<String, DateTime<Utc>> = ctx
            .registry
            .list_live_nodes(NodeType::Master)
            .await?
            .into_iter()
            .map(|n| (n.host, n.startup_time))
            .collect();

        for host in ctx.persistence.list_unfinished_instance_hosts().await? {
            if host != ctx.host && live_masters.contains_key(&host) {
                continue;
            }
            let startup_time = live_masters.get(&host).copied();
            let path = failover_lock_path(NodeType::Master, &host);
            match with_lock(ctx.registry.as_ref(), &path, self.config.lock_timeout, || {
                self.failover_master(&host, startup_time)
            })
            .await
            {
                Ok(count) => {
                    report.instances_resubmitted += count;
                    report.masters.push(host);
                }
                Err(e) => warn!(master = %host, error = %e, "Skipping master failover this cycle"),
            }
        }

        let live_workers: HashSet<String> = ctx
            .registry
            .list_live_nodes(NodeType::Worker)
            .await?
            .into_iter()
            .map(|n| n.host)
            .collect();

        for host in ctx.persistence.list_busy_worker_hosts().await? {
            if live_workers.contains(&host) {
                continue;
            }
            let path = failover_lock_path(NodeType::Worker, &host);
            match with_lock(ctx.registry.as_ref(), &path, self.config.lock_timeout, || {
                self.failover_worker(&host)
            })
            .await
            {
                Ok(count) => {
                    report.tasks_failed_over += count;
                    report.workers.push(host);
                }
                Err(e) => warn!(worker = %host, error = %e, "Skipping worker failover this cycle"),
            }
        }

        if report.instances_resubmitted > 0 || report.tasks_failed_over > 0 {
            info!(
                instances = report.instances_resubmitted,
                tasks = report.tasks_failed_over,
                "Failover sweep recovered work"
            );
        }
        Ok(report)
    }

    /// Take over the eligible instances of a master. Returns how many were
    /// resubmitted here. Failures are per instance.
    pub async fn failover_master(&self, host: &str, startup_time: Option<DateTime<Utc>>) -> usize {
        let ctx = self.engine.context();
        let instances = match ctx.persistence.find_unfinished_instances_by_host(host).await {
            Ok(instances) => instances,
            Err(e) => {
                error!(master = %host, error = %e, "Failed to list instances for failover");
                return 0;
            }
        };

        let live_workers: HashSet<String> =
            match ctx.registry.list_live_nodes(NodeType::Worker).await {
                Ok(nodes) => nodes.into_iter().map(|n| n.host).collect(),
                Err(e) => {
                    warn!(error = %e, "Cannot list workers, treating all as dead");
                    HashSet::new()
                }
            };

        let mut resubmitted = 0;
        for instance in instances {
            if !is_eligible_for_failover(&instance, host, startup_time, &ctx.cache) {
                debug!(workflow_instance_id = instance.id, "Instance not eligible for failover");
                continue;
            }
            let workflow_instance_id = instance.id;
            match self.take_over(instance, host, &live_workers).await {
                Ok(true) => resubmitted += 1,
                Ok(false) => {}
                Err(e) => error!(
                    workflow_instance_id,
                    master = %host,
                    error = %e,
                    "Workflow instance failover failed"
                ),
            }
        }
        resubmitted
    }

    async fn take_over(
        &self,
        mut instance: WorkflowInstance,
        from_host: &str,
        live_workers: &HashSet<String>,
    ) -> Result<bool> {
        let ctx = self.engine.context();
        let now = Utc::now();
        let transferred = ctx
            .persistence
            .transfer_workflow_instance_host(instance.id, from_host, &ctx.host, now)
            .await?;
        if !transferred {
            debug!(workflow_instance_id = instance.id, "Instance already taken over");
            return Ok(false);
        }
        info!(
            workflow_instance_id = instance.id,
            from = %from_host,
            "Taking over workflow instance"
        );

        let original = instance.clone();
        if let Err(e) = self.prepare_takeover(&mut instance, live_workers, now).await {
            self.revert_transfer(&original, from_host).await;
            return Err(e);
        }

        let workflow_instance_id = instance.id;
        let name = instance.name.clone();
        let status = self.engine.submit(instance).await;
        if status != WorkflowSubmitStatus::Success {
            warn!(workflow_instance_id, status = ?status, "Failed-over instance not resubmitted");
            return Ok(false);
        }
        ctx.alerts.dispatch(AlertEvent::WorkflowFaultTolerance {
            workflow_instance_id,
            name,
            from_host: from_host.to_string(),
            to_host: ctx.host.clone(),
        });
        Ok(true)
    }

    /// Point live workers at this master, retire attempts on dead ones and
    /// mark the instance for resubmission.
    async fn prepare_takeover(
        &self,
        instance: &mut WorkflowInstance,
        live_workers: &HashSet<String>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let ctx = self.engine.context();
        for mut task in ctx.persistence.list_task_instances(instance.id).await? {
            if !task.active || !task.state.is_on_worker() {
                continue;
            }
            let Some(worker) = task.host.clone() else {
                continue;
            };
            if live_workers.contains(&worker) {
                let notified = tokio::time::timeout(
                    self.config.rpc_timeout,
                    ctx.remoting
                        .notify_host_changed(&worker, task.id, &ctx.host),
                )
                .await;
                match notified {
                    Ok(Ok(())) => continue,
                    Ok(Err(e)) => warn!(
                        worker = %worker,
                        task_instance_id = task.id,
                        error = %e,
                        "Host change not delivered"
                    ),
                    Err(_) => warn!(
                        worker = %worker,
                        task_instance_id = task.id,
                        "Host change timed out"
                    ),
                }
            }
            self.kill_best_effort(&worker, task.id);
            task.state = TaskState::NeedFaultTolerance;
            task.active = false;
            task.end_time = Some(now);
            ctx.persistence.update_task_instance(&task).await?;
            ctx.release_task_group(&task).await;
        }

        instance.host = Some(ctx.host.clone());
        instance.restart_time = Some(now);
        instance.state = WorkflowState::Submitted;
        instance.command_type = CommandType::RecoverFaultTolerance;
        ctx.persistence.update_workflow_instance(instance).await?;
        Ok(())
    }

    /// Hand a half taken-over instance back to its previous owner so the
    /// next sweep retries it.
    async fn revert_transfer(&self, original: &WorkflowInstance, from_host: &str) {
        let ctx = self.engine.context();
        // Must not be later than the previous owner's startup, or the
        // instance stops being eligible.
        let restart_time = original.restart_time.unwrap_or(original.start_time);
        match ctx
            .persistence
            .transfer_workflow_instance_host(original.id, &ctx.host, from_host, restart_time)
            .await
        {
            Ok(true) => warn!(
                workflow_instance_id = original.id,
                master = %from_host,
                "Takeover reverted"
            ),
            Ok(false) => warn!(
                workflow_instance_id = original.id,
                "Takeover not reverted, instance no longer owned here"
            ),
            Err(e) => error!(
                workflow_instance_id = original.id,
                error = %e,
                "Failed to revert takeover"
            ),
        }
    }

    /// Hand the attempts stranded on a dead worker back to their workflows.
    /// Returns how many attempts were handled.
    pub async fn failover_worker(&self, worker: &str) -> usize {
        let ctx = self.engine.context();
        let tasks = match ctx.persistence.find_worker_task_instances(worker).await {
            Ok(tasks) => tasks,
            Err(e) => {
                error!(worker = %worker, error = %e, "Failed to list tasks for failover");
                return 0;
            }
        };

        let mut handled = 0;
        for mut task in tasks {
            let workflow_instance_id = task.workflow_instance_id;
            let task_instance_id = task.id;
            self.kill_best_effort(worker, task_instance_id);

            task.state = TaskState::NeedFaultTolerance;
            task.active = false;
            task.end_time = Some(Utc::now());
            if let Err(e) = ctx.persistence.update_task_instance(&task).await {
                error!(task_instance_id, error = %e, "Failed to mark orphaned task");
                continue;
            }
            ctx.release_task_group(&task).await;

            let event = WorkflowEvent::FailoverTask { task_instance_id };
            if !self.engine.send(workflow_instance_id, event) {
                self.notify_owner(workflow_instance_id, task_instance_id).await;
            }
            ctx.alerts.dispatch(AlertEvent::TaskFaultTolerance {
                workflow_instance_id,
                task_instance_id,
                worker_host: worker.to_string(),
            });
            handled += 1;
        }
        handled
    }

    /// Forward a task failover to the master driving its workflow.
    async fn notify_owner(&self, workflow_instance_id: i64, task_instance_id: i64) {
        let ctx = self.engine.context();
        let owner = match ctx.persistence.find_workflow_instance(workflow_instance_id).await {
            Ok(Some(instance)) if !instance.state.is_finished() => instance.host,
            Ok(_) => None,
            Err(e) => {
                error!(workflow_instance_id, error = %e, "Cannot resolve workflow owner");
                None
            }
        };
        // An owner that is itself dead resumes the node through master failover.
        let Some(owner) = owner.filter(|h| *h != ctx.host) else {
            return;
        };
        let event = MasterEvent::TaskFailover {
            workflow_instance_id,
            task_instance_id,
        };
        let sent = tokio::time::timeout(
            self.config.rpc_timeout,
            ctx.remoting.send_master_event(&owner, event),
        )
        .await;
        match sent {
            Ok(Ok(())) => debug!(master = %owner, task_instance_id, "Task failover forwarded"),
            Ok(Err(e)) => warn!(master = %owner, task_instance_id, error = %e, "Task failover not delivered"),
            Err(_) => warn!(master = %owner, task_instance_id, "Task failover timed out"),
        }
    }

    fn kill_best_effort(&self, worker: &str, task_instance_id: i64) {
        let remoting: Arc<dyn Remoting> = self.engine.context().remoting.clone();
        let worker = worker.to_string();
        let timeout = self.config.rpc_timeout;
        tokio::spawn(async move {
            if let Ok(Err(e)) =
                tokio::time::timeout(timeout, remoting.kill(&worker, task_instance_id)).await
            {
                debug!(worker = %worker, task_instance_id, error = %e, "Kill on dead worker failed");
            }
        });
    }
}

/// Resolves when the registry reports a removed node.
async fn wait_for_removal(events: &mut broadcast::Receiver<MembershipEvent>) {
    loop {
        match events.recv().await {
            Ok(MembershipEvent::Removed { .. }) => return,
            Ok(MembershipEvent::Added(_)) => continue,
            Err(broadcast::error::RecvError::Lagged(_)) => return,
            Err(broadcast::error::RecvError::Closed) => std::future::pending::<()>().await,
        }
    }
}
