// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for flowmaster-master integration tests.
//!
//! Provides [`Cluster`]: one shared store, one in-process registry and one
//! loopback remoting, with any number of masters and workers attached.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use flowmaster_core::CoreError;
use flowmaster_core::model::{
    AcquireOutcome, Command, ErrorCommand, Lookup, NewCommand, TaskGroup, TaskGroupClaim,
    TaskInstance, WorkflowDefinition, WorkflowInstance,
};
use flowmaster_core::persistence::{Persistence, SqlitePersistence};
use flowmaster_master::alert::{AlertDispatcher, AlertEvent, AlertHandler};
use flowmaster_master::engine::{EngineContext, WorkflowEngine};
use flowmaster_master::failover::{FailoverConfig, FailoverService};
use flowmaster_master::intake::{CommandIntake, CommandIntakeConfig};
use flowmaster_master::load::{LoadMonitor, LoadSample};
use flowmaster_master::registry::{InMemoryRegistry, NodeInfo, NodeType, Registry};
use flowmaster_master::remoting::LoopbackRemoting;
use flowmaster_master::slot::SlotManager;
use flowmaster_master::state_wheel::{StateWheel, StateWheelConfig};

/// Alert handler that keeps every event.
#[derive(Default)]
pub struct RecordingAlerts {
    events: Mutex<Vec<AlertEvent>>,
}

impl RecordingAlerts {
    pub fn events(&self) -> Vec<AlertEvent> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl AlertHandler for RecordingAlerts {
    fn name(&self) -> &str {
        "recording"
    }

    async fn handle(&self, event: &AlertEvent) -> flowmaster_master::Result<()> {
        self.events.lock().unwrap().push(event.clone());
        Ok(())
    }
}

/// A host that is never overloaded.
pub struct IdleLoad;

impl LoadMonitor for IdleLoad {
    fn sample(&self) -> LoadSample {
        LoadSample {
            cpu_usage: 0.0,
            memory_usage: 0.0,
        }
    }
}

/// Store that delegates to SQLite but can be told to fail task reads or
/// task inserts.
pub struct FlakyPersistence {
    inner: Arc<SqlitePersistence>,
    fail_task_listing: AtomicBool,
    fail_task_inserts: AtomicBool,
}

impl FlakyPersistence {
    pub fn new(inner: Arc<SqlitePersistence>) -> Self {
        Self {
            inner,
            fail_task_listing: AtomicBool::new(false),
            fail_task_inserts: AtomicBool::new(false),
        }
    }

    pub fn fail_task_listing(&self, fail: bool) {
        self.fail_task_listing.store(fail, Ordering::SeqCst);
    }

    pub fn fail_task_inserts(&self, fail: bool) {
        self.fail_task_inserts.store(fail, Ordering::SeqCst);
    }
}

fn unavailable(operation: &str) -> CoreError {
    CoreError::DatabaseError {
        operation: operation.to_string(),
        details: "connection reset".to_string(),
    }
}

#[async_trait]
impl Persistence for FlakyPersistence {
    async fn insert_command(&self, command: &NewCommand) -> Result<i64, CoreError> {
        self.inner.insert_command(command).await
    }

    async fn find_pending_commands(
        &self,
        page_size: i64,
        page_no: i64,
        slot_count: i64,
        slot_index: i64,
    ) -> Result<Vec<Command>, CoreError> {
        self.inner
            .find_pending_commands(page_size, page_no, slot_count, slot_index)
            .await
    }

    async fn move_to_error_command(&self, command: &Command, reason: &str) -> Result<(), CoreError> {
        self.inner.move_to_error_command(command, reason).await
    }

    async fn list_error_commands(&self) -> Result<Vec<ErrorCommand>, CoreError> {
        self.inner.list_error_commands().await
    }

    async fn consume_command(
        &self,
        command_id: i64,
        instance: &WorkflowInstance,
    ) -> Result<Lookup<i64>, CoreError> {
        self.inner.consume_command(command_id, instance).await
    }

    async fn save_workflow_definition(&self, definition: &WorkflowDefinition) -> Result<(), CoreError> {
        self.inner.save_workflow_definition(definition).await
    }

    async fn find_workflow_definition(
        &self,
        code: i64,
        version: i32,
    ) -> Result<Option<WorkflowDefinition>, CoreError> {
        self.inner.find_workflow_definition(code, version).await
    }

    async fn find_workflow_instance(
        &self,
        workflow_instance_id: i64,
    ) -> Result<Option<WorkflowInstance>, CoreError> {
        self.inner.find_workflow_instance(workflow_instance_id).await
    }

    async fn insert_workflow_instance(&self, instance: &WorkflowInstance) -> Result<i64, CoreError> {
        self.inner.insert_workflow_instance(instance).await
    }

    async fn update_workflow_instance(&self, instance: &WorkflowInstance) -> Result<(), CoreError> {
        self.inner.update_workflow_instance(instance).await
    }

    async fn find_unfinished_instances_by_host(
        &self,
        host: &str,
    ) -> Result<Vec<WorkflowInstance>, CoreError> {
        self.inner.find_unfinished_instances_by_host(host).await
    }

    async fn list_unfinished_instance_hosts(&self) -> Result<Vec<String>, CoreError> {
        self.inner.list_unfinished_instance_hosts().await
    }

    async fn transfer_workflow_instance_host(
        &self,
        workflow_instance_id: i64,
        expected_host: &str,
        new_host: &str,
        restart_time: DateTime<Utc>,
    ) -> Result<bool, CoreError> {
        self.inner
            .transfer_workflow_instance_host(workflow_instance_id, expected_host, new_host, restart_time)
            .await
    }

    async fn insert_task_instance(&self, task: &TaskInstance) -> Result<i64, CoreError> {
        if self.fail_task_inserts.load(Ordering::SeqCst) {
            return Err(unavailable("insert_task_instance"));
        }
        self.inner.insert_task_instance(task).await
    }

    async fn update_task_instance(&self, task: &TaskInstance) -> Result<(), CoreError> {
        self.inner.update_task_instance(task).await
    }

    async fn find_task_instance(&self, task_instance_id: i64) -> Result<Option<TaskInstance>, CoreError> {
        self.inner.find_task_instance(task_instance_id).await
    }

    async fn list_task_instances(
        &self,
        workflow_instance_id: i64,
    ) -> Result<Vec<TaskInstance>, CoreError> {
        if self.fail_task_listing.load(Ordering::SeqCst) {
            return Err(unavailable("list_task_instances"));
        }
        self.inner.list_task_instances(workflow_instance_id).await
    }

    async fn find_worker_task_instances(&self, worker_host: &str) -> Result<Vec<TaskInstance>, CoreError> {
        self.inner.find_worker_task_instances(worker_host).await
    }

    async fn list_busy_worker_hosts(&self) -> Result<Vec<String>, CoreError> {
        self.inner.list_busy_worker_hosts().await
    }

    async fn create_task_group(&self, name: &str, capacity: i32) -> Result<i64, CoreError> {
        self.inner.create_task_group(name, capacity).await
    }

    async fn find_task_group(&self, group_id: i64) -> Result<Option<TaskGroup>, CoreError> {
        self.inner.find_task_group(group_id).await
    }

    async fn acquire_task_group_slot(
        &self,
        group_id: i64,
        workflow_instance_id: i64,
        task_instance_id: i64,
    ) -> Result<Lookup<AcquireOutcome>, CoreError> {
        self.inner
            .acquire_task_group_slot(group_id, workflow_instance_id, task_instance_id)
            .await
    }

    async fn release_task_group_slot(
        &self,
        task_instance_id: i64,
    ) -> Result<Option<TaskGroupClaim>, CoreError> {
        self.inner.release_task_group_slot(task_instance_id).await
    }

    async fn list_task_group_claims(&self, group_id: i64) -> Result<Vec<TaskGroupClaim>, CoreError> {
        self.inner.list_task_group_claims(group_id).await
    }

    async fn health_check_db(&self) -> Result<bool, CoreError> {
        self.inner.health_check_db().await
    }
}

/// One master wired into a [`Cluster`].
pub struct TestMaster {
    pub host: String,
    pub engine: WorkflowEngine,
    pub slots: Arc<SlotManager>,
    pub intake: CommandIntake,
    pub failover: FailoverService,
    pub alerts: Arc<RecordingAlerts>,
}

/// Shared collaborators for a set of masters.
pub struct Cluster {
    pub persistence: Arc<SqlitePersistence>,
    pub registry: Arc<InMemoryRegistry>,
    pub remoting: Arc<LoopbackRemoting>,
}

impl Cluster {
    /// A cluster whose workers wait for explicit reports.
    pub async fn new() -> Self {
        Self::with_remoting(LoopbackRemoting::new()).await
    }

    /// A cluster whose workers succeed every task at once.
    pub async fn auto_completing() -> Self {
        Self::with_remoting(LoopbackRemoting::auto_completing()).await
    }

    async fn with_remoting(remoting: LoopbackRemoting) -> Self {
        Self {
            persistence: Arc::new(SqlitePersistence::in_memory().await.unwrap()),
            registry: Arc::new(InMemoryRegistry::new()),
            remoting: Arc::new(remoting),
        }
    }

    pub async fn add_worker(&self, host: &str) {
        self.registry
            .register(NodeInfo::new(NodeType::Worker, host))
            .await
            .unwrap();
    }

    pub async fn remove_worker(&self, host: &str) {
        self.registry
            .unregister(NodeType::Worker, host)
            .await
            .unwrap();
    }

    /// Register a master and wire its components. Inbound messages are
    /// forwarded to its engine.
    pub async fn master(&self, host: &str) -> TestMaster {
        self.master_over(host, self.persistence.clone()).await
    }

    /// Like [`Cluster::master`], with the master's engine using `persistence`.
    pub async fn master_over(&self, host: &str, persistence: Arc<dyn Persistence>) -> TestMaster {
        self.registry
            .register(NodeInfo::new(NodeType::Master, host))
            .await
            .unwrap();

        let alerts = Arc::new(RecordingAlerts::default());
        let wheel = Arc::new(StateWheel::new(StateWheelConfig {
            tick_interval: Duration::from_millis(50),
            wheel_size: 16,
        }));
        let engine = WorkflowEngine::new(EngineContext::new(
            host,
            persistence,
            self.registry.clone(),
            self.remoting.clone(),
            wheel,
            AlertDispatcher::new().register_all(alerts.clone()),
            Duration::from_millis(500),
        ));

        let mut inbound = self.remoting.connect_master(host);
        let forward = engine.clone();
        tokio::spawn(async move {
            while let Some(message) = inbound.recv().await {
                forward.handle_inbound(message);
            }
        });

        let slots = Arc::new(SlotManager::new(host, self.registry.clone()));
        slots.refresh().await.unwrap();
        let intake = CommandIntake::new(
            engine.clone(),
            slots.clone(),
            Arc::new(IdleLoad),
            CommandIntakeConfig::default(),
        );
        let failover = FailoverService::new(
            engine.clone(),
            FailoverConfig {
                interval: Duration::from_millis(100),
                lock_timeout: Duration::from_millis(500),
                rpc_timeout: Duration::from_millis(500),
            },
        );

        TestMaster {
            host: host.to_string(),
            engine,
            slots,
            intake,
            failover,
            alerts,
        }
    }

    pub async fn save(&self, definition: &WorkflowDefinition) {
        self.persistence
            .save_workflow_definition(definition)
            .await
            .unwrap();
    }

    /// Persist a fresh instance of `definition` owned by `host`.
    pub async fn new_instance(&self, definition: &WorkflowDefinition, host: &str) -> WorkflowInstance {
        let mut instance = WorkflowInstance::new(definition, host, Utc::now());
        instance.id = self
            .persistence
            .insert_workflow_instance(&instance)
            .await
            .unwrap();
        instance
    }

    pub async fn instance(&self, id: i64) -> WorkflowInstance {
        self.persistence
            .find_workflow_instance(id)
            .await
            .unwrap()
            .unwrap()
    }

    /// Wait until an instance reaches a finished state.
    pub async fn wait_finished(&self, id: i64) -> WorkflowInstance {
        for _ in 0..300 {
            let instance = self.instance(id).await;
            if instance.state.is_finished() {
                return instance;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("workflow instance {} did not finish", id);
    }
}

/// Poll `condition` until it holds or two seconds pass.
pub async fn wait_until<F>(mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

/// Names of dispatched tasks, in dispatch order.
pub fn dispatched_names(remoting: &LoopbackRemoting) -> Vec<String> {
    remoting
        .dispatched()
        .into_iter()
        .map(|d| d.request.task.name)
        .collect()
}

/// Attempt id of the latest dispatch of `name`.
pub fn attempt_of(remoting: &LoopbackRemoting, name: &str) -> i64 {
    remoting
        .dispatched()
        .into_iter()
        .rev()
        .find(|d| d.request.task.name == name)
        .map(|d| d.request.task.id)
        .unwrap_or_else(|| panic!("task {} was not dispatched", name))
}
