// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-process remoting.
//!
//! Simulates the worker fleet and the master-to-master channel for masters
//! that share one process. Every outbound call is recorded so callers can
//! inspect what was sent; worker reports are routed to whichever master an
//! attempt currently reports to (the dispatching master, or the one named in
//! the latest `notify_host_changed`).

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{Notify, mpsc};
use tokio::time::Instant;
use tracing::debug;

use super::{
    InboundMessage, MasterEvent, Remoting, RemotingError, TaskDispatchRequest, TaskReport,
    TaskReportKind,
};

/// A dispatch as seen by the simulated worker.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchRecord {
    /// Worker the attempt was sent to.
    pub worker_host: String,
    /// The request.
    pub request: TaskDispatchRequest,
}

/// Remoting between masters and simulated workers in one process.
#[derive(Default)]
pub struct LoopbackRemoting {
    inboxes: DashMap<String, mpsc::UnboundedSender<InboundMessage>>,
    routes: DashMap<i64, (i64, String)>,
    dispatched: Mutex<Vec<DispatchRecord>>,
    kills: Mutex<Vec<(String, i64)>>,
    host_changes: Mutex<Vec<(String, i64, String)>>,
    unreachable: Mutex<HashSet<String>>,
    auto_complete: AtomicBool,
    dispatch_seen: Notify,
}

impl LoopbackRemoting {
    /// Remoting where dispatched attempts wait for an explicit report.
    pub fn new() -> Self {
        Self::default()
    }

    /// Remoting where every accepted dispatch immediately reports
    /// `Running` then `Success`.
    pub fn auto_completing() -> Self {
        let remoting = Self::default();
        remoting.auto_complete.store(true, Ordering::SeqCst);
        remoting
    }

    /// Register a master and return its inbound stream.
    pub fn connect_master(&self, host: &str) -> mpsc::UnboundedReceiver<InboundMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inboxes.insert(host.to_string(), tx);
        rx
    }

    /// Drop a master's inbound stream (simulated crash).
    pub fn disconnect_master(&self, host: &str) {
        self.inboxes.remove(host);
    }

    /// Make calls to `host` fail with `Unreachable`.
    pub fn set_unreachable(&self, host: &str, unreachable: bool) {
        let mut hosts = self
            .unreachable
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if unreachable {
            hosts.insert(host.to_string());
        } else {
            hosts.remove(host);
        }
    }

    /// All dispatches so far, in call order.
    pub fn dispatched(&self) -> Vec<DispatchRecord> {
        self.dispatched
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// All kill requests so far as `(worker, task_instance_id)`.
    pub fn kills(&self) -> Vec<(String, i64)> {
        self.kills
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// All host-change notices as `(worker, task_instance_id, new_master)`.
    pub fn host_changes(&self) -> Vec<(String, i64, String)> {
        self.host_changes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Wait until at least `count` dispatches were recorded.
    pub async fn wait_for_dispatches(
        &self,
        count: usize,
        timeout: Duration,
    ) -> Option<Vec<DispatchRecord>> {
        let deadline = Instant::now() + timeout;
        loop {
            let seen = self.dispatch_seen.notified();
            let dispatched = self.dispatched();
            if dispatched.len() >= count {
                return Some(dispatched);
            }
            if tokio::time::timeout_at(deadline, seen).await.is_err() {
                return None;
            }
        }
    }

    /// Deliver a worker report to the master the attempt reports to.
    pub fn report(&self, report: TaskReport) -> Result<(), RemotingError> {
        let master = self
            .routes
            .get(&report.task_instance_id)
            .map(|route| route.1.clone())
            .ok_or_else(|| {
                RemotingError::Unreachable(format!("route for task {}", report.task_instance_id))
            })?;
        self.deliver(&master, InboundMessage::Task(report))
    }

    /// Report `Running` and then the final outcome for a dispatched attempt.
    pub fn complete(&self, task_instance_id: i64, success: bool) -> Result<(), RemotingError> {
        let (workflow_instance_id, worker_host) = self.route_of(task_instance_id)?;
        self.report(TaskReport::new(
            workflow_instance_id,
            task_instance_id,
            TaskReportKind::Running { worker_host },
        ))?;
        let kind = if success {
            TaskReportKind::Success
        } else {
            TaskReportKind::Failure {
                message: "simulated failure".to_string(),
            }
        };
        self.report(TaskReport::new(workflow_instance_id, task_instance_id, kind))
    }

    fn route_of(&self, task_instance_id: i64) -> Result<(i64, String), RemotingError> {
        let workflow_instance_id = self
            .routes
            .get(&task_instance_id)
            .map(|route| route.0)
            .ok_or_else(|| RemotingError::Unreachable(format!("task {}", task_instance_id)))?;
        let worker_host = self
            .dispatched()
            .into_iter()
            .rev()
            .find(|d| d.request.task.id == task_instance_id)
            .map(|d| d.worker_host)
            .ok_or_else(|| RemotingError::Unreachable(format!("task {}", task_instance_id)))?;
        Ok((workflow_instance_id, worker_host))
    }

    fn check_reachable(&self, host: &str) -> Result<(), RemotingError> {
        let hosts = self
            .unreachable
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if hosts.contains(host) {
            return Err(RemotingError::Unreachable(host.to_string()));
        }
        Ok(())
    }

    fn deliver(&self, master_host: &str, message: InboundMessage) -> Result<(), RemotingError> {
        self.check_reachable(master_host)?;
        let inbox = self
            .inboxes
            .get(master_host)
            .ok_or_else(|| RemotingError::Unreachable(master_host.to_string()))?;
        inbox
            .send(message)
            .map_err(|_| RemotingError::Unreachable(master_host.to_string()))
    }
}

#[async_trait]
impl Remoting for LoopbackRemoting {
    async fn dispatch(
        &self,
        worker_host: &str,
        request: TaskDispatchRequest,
    ) -> Result<(), RemotingError> {
        self.check_reachable(worker_host)?;

        let task_instance_id = request.task.id;
        let workflow_instance_id = request.task.workflow_instance_id;
        self.routes.insert(
            task_instance_id,
            (workflow_instance_id, request.master_host.clone()),
        );
        self.dispatched
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(DispatchRecord {
                worker_host: worker_host.to_string(),
                request,
            });
        self.dispatch_seen.notify_waiters();
        debug!(worker = %worker_host, task_instance_id, "Loopback dispatch");

        if self.auto_complete.load(Ordering::SeqCst)
            && let Err(e) = self.complete(task_instance_id, true)
        {
            debug!(task_instance_id, error = %e, "Loopback auto-complete not delivered");
        }
        Ok(())
    }

    async fn kill(&self, worker_host: &str, task_instance_id: i64) -> Result<(), RemotingError> {
        self.check_reachable(worker_host)?;
        self.kills
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((worker_host.to_string(), task_instance_id));
        Ok(())
    }

    async fn notify_host_changed(
        &self,
        worker_host: &str,
        task_instance_id: i64,
        new_master_host: &str,
    ) -> Result<(), RemotingError> {
        self.check_reachable(worker_host)?;
        if let Some(mut route) = self.routes.get_mut(&task_instance_id) {
            route.1 = new_master_host.to_string();
        }
        self.host_changes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((
                worker_host.to_string(),
                task_instance_id,
                new_master_host.to_string(),
            ));
        Ok(())
    }

    async fn send_master_event(
        &self,
        master_host: &str,
        event: MasterEvent,
    ) -> Result<(), RemotingError> {
        self.deliver(master_host, InboundMessage::Master(event))
    }
}
