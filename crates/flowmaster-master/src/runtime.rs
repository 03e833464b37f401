// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable runtime for flowmaster-master.
//!
//! [`MasterRuntime`] wires the collaborators together, registers the master
//! in the registry and spawns the background workers: command intake,
//! failover sweep, timing-wheel ticker, slot watcher and the inbound
//! message forwarder.
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use flowmaster_core::persistence::SqlitePersistence;
//! use flowmaster_master::registry::InMemoryRegistry;
//! use flowmaster_master::remoting::LoopbackRemoting;
//! use flowmaster_master::runtime::MasterRuntime;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let persistence = Arc::new(SqlitePersistence::from_path("flowmaster.db").await?);
//!     let remoting = Arc::new(LoopbackRemoting::new());
//!     let inbound = remoting.connect_master("127.0.0.1:5678");
//!
//!     let runtime = MasterRuntime::builder()
//!         .persistence(persistence)
//!         .registry(Arc::new(InMemoryRegistry::new()))
//!         .remoting(remoting)
//!         .inbound(inbound)
//!         .build()?
//!         .start()
//!         .await?;
//!
//!     // ... run your application ...
//!
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```

use std::sync::Arc;

use anyhow::Result;
use flowmaster_core::persistence::Persistence;
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::alert::{AlertDispatcher, AlertHandler, AlertKind};
use crate::config::MasterConfig;
use crate::engine::{EngineContext, WorkflowEngine};
use crate::failover::FailoverService;
use crate::intake::CommandIntake;
use crate::load::{LoadMonitor, SystemLoadMonitor};
use crate::registry::{NodeInfo, NodeType, Registry};
use crate::remoting::{InboundMessage, Remoting};
use crate::slot::SlotManager;
use crate::state_wheel::{StateWheel, TimeoutListener};

/// Builder for creating a [`MasterRuntime`].
#[derive(Default)]
pub struct MasterRuntimeBuilder {
    config: MasterConfig,
    persistence: Option<Arc<dyn Persistence>>,
    registry: Option<Arc<dyn Registry>>,
    remoting: Option<Arc<dyn Remoting>>,
    inbound: Option<mpsc::UnboundedReceiver<InboundMessage>>,
    load_monitor: Option<Arc<dyn LoadMonitor>>,
    alerts: AlertDispatcher,
}

impl MasterRuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a loaded configuration.
    pub fn config(mut self, config: MasterConfig) -> Self {
        self.config = config;
        self
    }

    /// Set this master's address.
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.config.host = host.into();
        self
    }

    /// Set the shared persistence (required).
    pub fn persistence(mut self, persistence: Arc<dyn Persistence>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    /// Set the registry (required).
    pub fn registry(mut self, registry: Arc<dyn Registry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Set the remoting collaborator (required).
    pub fn remoting(mut self, remoting: Arc<dyn Remoting>) -> Self {
        self.remoting = Some(remoting);
        self
    }

    /// Feed worker reports and master events from this channel to the engine.
    pub fn inbound(mut self, inbound: mpsc::UnboundedReceiver<InboundMessage>) -> Self {
        self.inbound = Some(inbound);
        self
    }

    /// Replace the host load monitor used by intake back-pressure.
    pub fn load_monitor(mut self, monitor: Arc<dyn LoadMonitor>) -> Self {
        self.load_monitor = Some(monitor);
        self
    }

    /// Register an alert handler for one kind.
    pub fn alert_handler(mut self, kind: AlertKind, handler: Arc<dyn AlertHandler>) -> Self {
        self.alerts = self.alerts.register(kind, handler);
        self
    }

    /// Register an alert handler for every kind.
    pub fn alert_handler_all(mut self, handler: Arc<dyn AlertHandler>) -> Self {
        self.alerts = self.alerts.register_all(handler);
        self
    }

    /// Build the runtime configuration.
    ///
    /// Returns an error if required fields are missing.
    pub fn build(self) -> Result<MasterRuntimeConfig> {
        let persistence = self
            .persistence
            .ok_or_else(|| anyhow::anyhow!("persistence is required"))?;
        let registry = self
            .registry
            .ok_or_else(|| anyhow::anyhow!("registry is required"))?;
        let remoting = self
            .remoting
            .ok_or_else(|| anyhow::anyhow!("remoting is required"))?;
        if self.config.host.is_empty() {
            anyhow::bail!("host must not be empty");
        }

        Ok(MasterRuntimeConfig {
            config: self.config,
            persistence,
            registry,
            remoting,
            inbound: self.inbound,
            load_monitor: self
                .load_monitor
                .unwrap_or_else(|| Arc::new(SystemLoadMonitor::new())),
            alerts: self.alerts,
        })
    }
}

/// Configuration for a [`MasterRuntime`].
pub struct MasterRuntimeConfig {
    config: MasterConfig,
    persistence: Arc<dyn Persistence>,
    registry: Arc<dyn Registry>,
    remoting: Arc<dyn Remoting>,
    inbound: Option<mpsc::UnboundedReceiver<InboundMessage>>,
    load_monitor: Arc<dyn LoadMonitor>,
    alerts: AlertDispatcher,
}

impl MasterRuntimeConfig {
    /// Register the master and spawn its background workers.
    pub async fn start(self) -> Result<MasterRuntime> {
        let host = self.config.host.clone();
        info!(host = %host, "Starting flowmaster master");

        let node = NodeInfo::new(NodeType::Master, host.clone());
        self.registry.register(node).await?;

        let state_wheel = Arc::new(StateWheel::new(self.config.state_wheel_config()));
        let engine = WorkflowEngine::new(EngineContext::new(
            host.clone(),
            self.persistence.clone(),
            self.registry.clone(),
            self.remoting.clone(),
            state_wheel.clone(),
            self.alerts,
            self.config.dispatch_timeout,
        ));

        let slots = Arc::new(SlotManager::new(host.clone(), self.registry.clone()));
        match slots.refresh().await {
            Ok(slot) => info!(
                slot_index = slot.slot_index,
                master_count = slot.master_count,
                "Initial slot assignment"
            ),
            Err(e) => warn!(error = %e, "Initial slot refresh failed"),
        }

        let intake = CommandIntake::new(
            engine.clone(),
            slots.clone(),
            self.load_monitor,
            self.config.intake_config(),
        );
        let intake_shutdown = intake.shutdown_handle();
        let intake_handle = tokio::spawn(intake.run());

        let failover = FailoverService::new(engine.clone(), self.config.failover_config());
        let failover_shutdown = failover.shutdown_handle();
        let failover_handle = tokio::spawn(failover.run());

        let wheel_shutdown = Arc::new(Notify::new());
        let wheel_handle = {
            let wheel = state_wheel.clone();
            let listener: Arc<dyn TimeoutListener> = Arc::new(engine.clone());
            let shutdown = wheel_shutdown.clone();
            tokio::spawn(async move { wheel.run(listener, shutdown).await })
        };

        let slot_shutdown = Arc::new(Notify::new());
        let slot_handle = {
            let slots = slots.clone();
            let shutdown = slot_shutdown.clone();
            tokio::spawn(async move { slots.watch(shutdown).await })
        };

        let inbound_shutdown = Arc::new(Notify::new());
        let inbound_handle = self.inbound.map(|inbound| {
            tokio::spawn(forward_inbound(
                engine.clone(),
                inbound,
                inbound_shutdown.clone(),
            ))
        });

        info!(host = %host, "Flowmaster master started");

        Ok(MasterRuntime {
            host,
            registry: self.registry,
            engine,
            slots,
            intake_shutdown,
            intake_handle,
            failover_shutdown,
            failover_handle,
            wheel_shutdown,
            wheel_handle,
            slot_shutdown,
            slot_handle,
            inbound_shutdown,
            inbound_handle,
        })
    }
}

/// Deliver inbound messages to the engine until shutdown or disconnect.
async fn forward_inbound(
    engine: WorkflowEngine,
    mut inbound: mpsc::UnboundedReceiver<InboundMessage>,
    shutdown: Arc<Notify>,
) {
    loop {
        tokio::select! {
            _ = shutdown.notified() => break,
            message = inbound.recv() => {
                let Some(message) = message else {
                    debug!("Inbound channel closed");
                    break;
                };
                if !engine.handle_inbound(message.clone()) {
                    debug!(?message, "Inbound message for instance not running here");
                }
            }
        }
    }
}

/// A running master.
pub struct MasterRuntime {
    host: String,
    registry: Arc<dyn Registry>,
    engine: WorkflowEngine,
    slots: Arc<SlotManager>,
    intake_shutdown: Arc<Notify>,
    intake_handle: JoinHandle<()>,
    failover_shutdown: Arc<Notify>,
    failover_handle: JoinHandle<()>,
    wheel_shutdown: Arc<Notify>,
    wheel_handle: JoinHandle<()>,
    slot_shutdown: Arc<Notify>,
    slot_handle: JoinHandle<()>,
    inbound_shutdown: Arc<Notify>,
    inbound_handle: Option<JoinHandle<()>>,
}

impl MasterRuntime {
    /// Create a new builder.
    pub fn builder() -> MasterRuntimeBuilder {
        MasterRuntimeBuilder::new()
    }

    /// This master's address.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// The engine, for operator actions and direct submission.
    pub fn engine(&self) -> &WorkflowEngine {
        &self.engine
    }

    /// Current slot assignment.
    pub fn slots(&self) -> &Arc<SlotManager> {
        &self.slots
    }

    /// Stop the background workers and leave the registry.
    ///
    /// Running workflow actors are not stopped; their instances stay owned
    /// by this host and are picked up by failover.
    pub async fn shutdown(self) -> Result<()> {
        info!(host = %self.host, "MasterRuntime shutting down...");

        self.intake_shutdown.notify_one();
        self.failover_shutdown.notify_one();
        self.wheel_shutdown.notify_one();
        self.slot_shutdown.notify_one();
        self.inbound_shutdown.notify_one();

        if let Err(e) = self.intake_handle.await {
            error!("Command intake task panicked: {}", e);
        }
        if let Err(e) = self.failover_handle.await {
            error!("Failover service task panicked: {}", e);
        }
        if let Err(e) = self.wheel_handle.await {
            error!("State wheel task panicked: {}", e);
        }
        if let Err(e) = self.slot_handle.await {
            error!("Slot watcher task panicked: {}", e);
        }
        if let Some(handle) = self.inbound_handle
            && let Err(e) = handle.await
        {
            error!("Inbound forwarder task panicked: {}", e);
        }

        self.registry
            .unregister(NodeType::Master, &self.host)
            .await?;
        info!("MasterRuntime shutdown complete");
        Ok(())
    }

    /// Check if the background workers are still running.
    pub fn is_running(&self) -> bool {
        let inbound_running = self
            .inbound_handle
            .as_ref()
            .is_none_or(|h| !h.is_finished());

        !self.intake_handle.is_finished()
            && !self.failover_handle.is_finished()
            && !self.wheel_handle.is_finished()
            && !self.slot_handle.is_finished()
            && inbound_running
    }
}
