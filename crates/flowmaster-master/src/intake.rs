// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Command intake loop.
//!
//! Polls the commands in this master's slot, converts each into a workflow
//! instance and hands it to the engine. A page is fanned out to a bounded
//! pool and the loop waits for the whole page before fetching the next one.
//! A command whose conversion fails is moved to the error table and never
//! retried in place.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use flowmaster_core::model::{Command, CommandType, WorkflowInstance, WorkflowState};
use flowmaster_core::persistence::Persistence;
use flowmaster_core::{CoreError, Lookup};
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};

use crate::engine::{WorkflowEngine, WorkflowSubmitStatus};
use crate::error::Result;
use crate::load::LoadMonitor;
use crate::slot::{SlotCheck, SlotManager};

/// Command intake configuration.
#[derive(Debug, Clone)]
pub struct CommandIntakeConfig {
    /// Commands fetched per cycle.
    pub page_size: i64,
    /// Concurrent conversions.
    pub exec_threads: usize,
    /// Sleep after an empty or skipped cycle.
    pub poll_interval: Duration,
    /// CPU usage fraction above which a cycle is skipped.
    pub max_cpu_usage: f32,
    /// Memory usage fraction above which a cycle is skipped.
    pub max_memory_usage: f32,
    /// Whether the load check runs.
    pub load_protection_enabled: bool,
}

impl Default for CommandIntakeConfig {
    fn default() -> Self {
        Self {
            page_size: 10,
            exec_threads: 10,
            poll_interval: Duration::from_secs(1),
            max_cpu_usage: 0.7,
            max_memory_usage: 0.7,
            load_protection_enabled: true,
        }
    }
}

/// What happened to one command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOutcome {
    /// Converted and handed to the engine.
    Submitted(WorkflowSubmitStatus),
    /// Slot ownership changed since the fetch; left for its owner.
    NotOwned(SlotCheck),
    /// Another master consumed the command first.
    Conflict,
    /// Moved to the error table.
    Rejected(String),
}

/// Counters for one intake cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleOutcome {
    /// The cycle was skipped because the host is overloaded.
    pub overloaded: bool,
    /// Commands fetched.
    pub fetched: usize,
    /// Commands submitted to the engine.
    pub submitted: usize,
    /// Commands left alone (foreign slot or consumed elsewhere).
    pub skipped: usize,
    /// Commands moved to the error table.
    pub rejected: usize,
}

/// Turns commands into persisted workflow instances.
#[derive(Clone)]
pub struct CommandConverter {
    host: String,
    persistence: Arc<dyn Persistence>,
}

impl CommandConverter {
    /// Create a converter that stamps instances with `host`.
    pub fn new(host: impl Into<String>, persistence: Arc<dyn Persistence>) -> Self {
        Self {
            host: host.into(),
            persistence,
        }
    }

    /// Convert and consume a command.
    ///
    /// Start commands create a new instance; recovery commands take over the
    /// instance they reference. The instance write and the command delete
    /// are one transaction: `Conflict` means another master got there first
    /// and nothing was written. `NotFound` means a recovery target is gone.
    pub async fn convert(&self, command: &Command) -> Result<Lookup<WorkflowInstance>> {
        let now = Utc::now();
        let mut instance = if command.command_type.is_recovery() {
            let Some(workflow_instance_id) = command.workflow_instance_id else {
                return Err(CoreError::ValidationError {
                    field: "workflow_instance_id".to_string(),
                    message: format!("{} command has no target instance", command.command_type),
                }
                .into());
            };
            let Some(mut instance) = self
                .persistence
                .find_workflow_instance(workflow_instance_id)
                .await?
            else {
                return Ok(Lookup::NotFound);
            };
            check_recoverable(command.command_type, &instance)?;

            instance.host = Some(self.host.clone());
            instance.restart_time = Some(now);
            instance.end_time = None;
            instance.state = WorkflowState::Submitted;
            instance.run_times += 1;
            instance
        } else {
            let definition = self
                .persistence
                .find_workflow_definition(command.workflow_code, command.workflow_version)
                .await?
                .ok_or(CoreError::WorkflowDefinitionNotFound {
                    code: command.workflow_code,
                    version: command.workflow_version,
                })?;
            let mut instance = WorkflowInstance::new(&definition, &self.host, now);
            instance.params = command.params.clone();
            instance
        };

        instance.command_type = command.command_type;
        instance.warning_policy = command.warning_policy;
        if let Some(strategy) = command.failure_strategy {
            instance.failure_strategy = strategy;
        }

        match self.persistence.consume_command(command.id, &instance).await? {
            Lookup::Found(id) => {
                instance.id = id;
                Ok(Lookup::Found(instance))
            }
            Lookup::NotFound => Ok(Lookup::Conflict("command already consumed".to_string())),
            Lookup::Conflict(reason) => Ok(Lookup::Conflict(reason)),
        }
    }
}

/// Whether `command_type` may resume an instance in its current state.
fn check_recoverable(command_type: CommandType, instance: &WorkflowInstance) -> Result<()> {
    let (allowed, expected) = match command_type {
        CommandType::Repeat => (instance.state.is_finished(), "a finished state"),
        CommandType::RecoverFailed => (
            matches!(instance.state, WorkflowState::Failure | WorkflowState::Stopped),
            "failure or stopped",
        ),
        CommandType::RecoverSuspended => (instance.state == WorkflowState::Paused, "paused"),
        CommandType::RecoverFaultTolerance => {
            (!instance.state.is_finished(), "an unfinished state")
        }
        CommandType::Start | CommandType::Scheduled => (true, ""),
    };
    if allowed {
        Ok(())
    } else {
        Err(CoreError::InvalidState {
            entity: format!("workflow instance {}", instance.id),
            expected: expected.to_string(),
            actual: instance.state.to_string(),
        }
        .into())
    }
}

/// The intake background worker.
#[derive(Clone)]
pub struct CommandIntake {
    persistence: Arc<dyn Persistence>,
    converter: CommandConverter,
    engine: WorkflowEngine,
    slots: Arc<SlotManager>,
    load: Arc<dyn LoadMonitor>,
    config: CommandIntakeConfig,
    shutdown: Arc<Notify>,
}

impl CommandIntake {
    /// Create an intake loop for the engine's master.
    pub fn new(
        engine: WorkflowEngine,
        slots: Arc<SlotManager>,
        load: Arc<dyn LoadMonitor>,
        config: CommandIntakeConfig,
    ) -> Self {
        let ctx = engine.context();
        Self {
            persistence: ctx.persistence.clone(),
            converter: CommandConverter::new(ctx.host.clone(), ctx.persistence.clone()),
            engine,
            slots,
            load,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the intake loop until shutdown.
    pub async fn run(self) {
        info!(
            page_size = self.config.page_size,
            exec_threads = self.config.exec_threads,
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            "Command intake started"
        );

        loop {
            let idle = match self.run_cycle().await {
                Ok(outcome) => outcome.overloaded || outcome.fetched == 0,
                Err(e) => {
                    error!(error = %e, "Command intake cycle failed");
                    true
                }
            };
            let pause = if idle {
                self.config.poll_interval
            } else {
                Duration::ZERO
            };

            tokio::select! {
                _ = self.shutdown.notified() => {
                    info!("Command intake shutting down");
                    break;
                }
                _ = tokio::time::sleep(pause) => {}
            }
        }
    }

    /// One poll: load check, slot refresh, fetch, fan out, wait for the page.
    #[instrument(skip(self))]
    pub async fn run_cycle(&self) -> Result<CycleOutcome> {
        let mut outcome = CycleOutcome::default();
        if self.config.load_protection_enabled
            && self
                .load
                .is_overloaded(self.config.max_cpu_usage, self.config.max_memory_usage)
        {
            warn!("Host overloaded, skipping command intake cycle");
            outcome.overloaded = true;
            return Ok(outcome);
        }

        let slot = self.slots.refresh().await?;
        if slot.master_count <= 0 {
            debug!("Master membership not resolved yet");
            return Ok(outcome);
        }

        let commands = self
            .persistence
            .find_pending_commands(self.config.page_size, 0, slot.master_count, slot.slot_index)
            .await?;
        outcome.fetched = commands.len();
        if commands.is_empty() {
            return Ok(outcome);
        }
        debug!(
            count = commands.len(),
            slot_index = slot.slot_index,
            master_count = slot.master_count,
            "Fetched commands"
        );

        let permits = Arc::new(Semaphore::new(self.config.exec_threads.max(1)));
        let mut page = JoinSet::new();
        for command in commands {
            let permits = permits.clone();
            let intake = self.clone();
            page.spawn(async move {
                let _permit = permits.acquire_owned().await;
                intake.handle_command(command).await
            });
        }

        while let Some(joined) = page.join_next().await {
            match joined {
                Ok(CommandOutcome::Submitted(_)) => outcome.submitted += 1,
                Ok(CommandOutcome::NotOwned(_)) | Ok(CommandOutcome::Conflict) => {
                    outcome.skipped += 1
                }
                Ok(CommandOutcome::Rejected(_)) => outcome.rejected += 1,
                Err(e) => error!(error = %e, "Command handler panicked"),
            }
        }
        Ok(outcome)
    }

    /// Re-check ownership, convert and submit one command.
    #[instrument(skip(self, command), fields(command_id = command.id, command_type = %command.command_type))]
    pub async fn handle_command(&self, command: Command) -> CommandOutcome {
        let check = self.slots.check(command.id);
        if check != SlotCheck::Pass {
            debug!(check = ?check, "Command no longer in this master's slot");
            return CommandOutcome::NotOwned(check);
        }

        match self.converter.convert(&command).await {
            Ok(Lookup::Found(instance)) => {
                let status = self.engine.submit(instance).await;
                CommandOutcome::Submitted(status)
            }
            Ok(Lookup::Conflict(reason)) => {
                debug!(reason = %reason, "Command consumed elsewhere");
                CommandOutcome::Conflict
            }
            Ok(Lookup::NotFound) => self.reject(&command, "target workflow instance not found").await,
            Err(e) => self.reject(&command, &e.to_string()).await,
        }
    }

    async fn reject(&self, command: &Command, reason: &str) -> CommandOutcome {
        warn!(command_id = command.id, reason = %reason, "Command conversion failed");
        if let Err(e) = self.persistence.move_to_error_command(command, reason).await {
            error!(command_id = command.id, error = %e, "Failed to move command to error table");
        }
        CommandOutcome::Rejected(reason.to_string())
    }
}
