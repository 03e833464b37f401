// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Timeout checking with timing wheels.
//!
//! A [`TimingWheel`] is a ring of buckets indexed by `deadline_tick mod
//! size`. Add and remove are O(1): the id index is the source of truth, and
//! a bucket slot left behind by a removed or re-added id is discarded when
//! its bucket next comes round. A tick only looks at one bucket, so the
//! per-tick cost is bounded by that bucket's size rather than by the number
//! of registered entities. Entries whose deadline is more than one
//! revolution away stay in their bucket until their round comes.
//!
//! [`StateWheel`] holds two wheels, one for workflow timeouts and one for
//! task timeouts, and turns due entries into [`TimeoutEvent`]s.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use flowmaster_core::model::{TaskInstance, WorkflowInstance};
use tokio::sync::Notify;
use tracing::{debug, info};

/// Timing wheel settings.
#[derive(Debug, Clone)]
pub struct StateWheelConfig {
    /// Duration of one tick.
    pub tick_interval: Duration,
    /// Buckets per wheel.
    pub wheel_size: usize,
}

impl Default for StateWheelConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(1000),
            wheel_size: 60,
        }
    }
}

/// A bucketed delay queue keyed by entity id.
#[derive(Debug)]
pub struct TimingWheel<K, V> {
    buckets: Vec<Vec<(K, u64)>>,
    index: HashMap<K, Entry<V>>,
    current_tick: u64,
    next_generation: u64,
}

#[derive(Debug)]
struct Entry<V> {
    deadline: u64,
    generation: u64,
    value: V,
}

impl<K, V> TimingWheel<K, V>
where
    K: Copy + Eq + Hash,
{
    /// A wheel with `size` buckets.
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            buckets: (0..size).map(|_| Vec::new()).collect(),
            index: HashMap::new(),
            current_tick: 0,
            next_generation: 0,
        }
    }

    /// Register `key` to fire after `ticks` ticks (at least one).
    ///
    /// Re-adding a key replaces its previous deadline.
    pub fn add(&mut self, key: K, value: V, ticks: u64) {
        let deadline = self.current_tick + ticks.max(1);
        let generation = self.next_generation;
        self.next_generation += 1;
        self.index.insert(
            key,
            Entry {
                deadline,
                generation,
                value,
            },
        );
        let slot = self.slot_of(deadline);
        self.buckets[slot].push((key, generation));
    }

    /// Unregister `key`; returns its value if it was pending.
    pub fn remove(&mut self, key: &K) -> Option<V> {
        self.index.remove(key).map(|entry| entry.value)
    }

    /// Whether `key` is pending.
    pub fn contains(&self, key: &K) -> bool {
        self.index.contains_key(key)
    }

    /// Number of pending entries.
    pub fn len(&self) -> usize {
        self.index.len()
    }

    /// Whether nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Advance one tick and drain the entries that are now due.
    pub fn tick(&mut self) -> Vec<(K, V)> {
        self.current_tick += 1;
        let now = self.current_tick;
        let slot = self.slot_of(now);

        let bucket = std::mem::take(&mut self.buckets[slot]);
        let mut due = Vec::new();
        for (key, generation) in bucket {
            match self.index.get(&key) {
                Some(entry) if entry.generation != generation => {}
                Some(entry) if entry.deadline <= now => {
                    if let Some(entry) = self.index.remove(&key) {
                        due.push((key, entry.value));
                    }
                }
                Some(_) => self.buckets[slot].push((key, generation)),
                None => {}
            }
        }
        due
    }

    fn slot_of(&self, tick: u64) -> usize {
        (tick % self.buckets.len() as u64) as usize
    }
}

/// A timeout that fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutEvent {
    /// A workflow instance ran past its timeout.
    Workflow {
        /// Instance id.
        workflow_instance_id: i64,
    },
    /// A task attempt ran past its timeout.
    Task {
        /// Owning instance.
        workflow_instance_id: i64,
        /// Attempt id.
        task_instance_id: i64,
    },
}

/// Receives fired timeouts.
pub trait TimeoutListener: Send + Sync {
    /// Handle one fired timeout. Must be a no-op for entities that already
    /// finished.
    fn on_timeout(&self, event: TimeoutEvent);
}

struct Wheels {
    process: TimingWheel<i64, ()>,
    task: TimingWheel<i64, i64>,
}

/// Workflow and task timeout wheels shared by one master.
pub struct StateWheel {
    config: StateWheelConfig,
    wheels: Mutex<Wheels>,
}

impl StateWheel {
    /// Create both wheels.
    pub fn new(config: StateWheelConfig) -> Self {
        let wheels = Wheels {
            process: TimingWheel::new(config.wheel_size),
            task: TimingWheel::new(config.wheel_size),
        };
        Self {
            config,
            wheels: Mutex::new(wheels),
        }
    }

    /// Wheel settings.
    pub fn config(&self) -> &StateWheelConfig {
        &self.config
    }

    /// Watch a workflow instance; ignored when it has no timeout.
    pub fn add_process_4_timeout_check(&self, instance: &WorkflowInstance) {
        let Some(timeout) = instance.timeout() else {
            return;
        };
        let ticks = self.ticks_for(timeout);
        self.lock().process.add(instance.id, (), ticks);
        debug!(
            workflow_instance_id = instance.id,
            ticks, "Workflow timeout registered"
        );
    }

    /// Watch a task attempt; ignored when it has no timeout.
    pub fn add_task_4_timeout_check(&self, task: &TaskInstance) {
        let Some(timeout) = task.timeout() else {
            return;
        };
        let ticks = self.ticks_for(timeout);
        self.lock()
            .task
            .add(task.id, task.workflow_instance_id, ticks);
        debug!(
            workflow_instance_id = task.workflow_instance_id,
            task_instance_id = task.id,
            ticks,
            "Task timeout registered"
        );
    }

    /// Stop watching a workflow instance.
    pub fn remove_process(&self, workflow_instance_id: i64) -> bool {
        self.lock().process.remove(&workflow_instance_id).is_some()
    }

    /// Stop watching a task attempt.
    pub fn remove_task(&self, task_instance_id: i64) -> bool {
        self.lock().task.remove(&task_instance_id).is_some()
    }

    /// Whether a workflow instance is watched.
    pub fn contains_process(&self, workflow_instance_id: i64) -> bool {
        self.lock().process.contains(&workflow_instance_id)
    }

    /// Whether a task attempt is watched.
    pub fn contains_task(&self, task_instance_id: i64) -> bool {
        self.lock().task.contains(&task_instance_id)
    }

    /// Advance both wheels one tick and collect what fired.
    pub fn tick(&self) -> Vec<TimeoutEvent> {
        let mut wheels = self.lock();
        let mut fired: Vec<TimeoutEvent> = wheels
            .process
            .tick()
            .into_iter()
            .map(|(workflow_instance_id, ())| TimeoutEvent::Workflow {
                workflow_instance_id,
            })
            .collect();
        fired.extend(wheels.task.tick().into_iter().map(
            |(task_instance_id, workflow_instance_id)| TimeoutEvent::Task {
                workflow_instance_id,
                task_instance_id,
            },
        ));
        fired
    }

    /// Tick on the configured interval, handing fired timeouts to `listener`,
    /// until `shutdown`.
    pub async fn run(&self, listener: Arc<dyn TimeoutListener>, shutdown: Arc<Notify>) {
        info!(
            tick_ms = self.config.tick_interval.as_millis() as u64,
            wheel_size = self.config.wheel_size,
            "State wheel started"
        );
        let mut interval = tokio::time::interval(self.config.tick_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick of an interval completes immediately.
        interval.tick().await;

        loop {
            tokio::select! {
                biased;
                _ = shutdown.notified() => {
                    info!("State wheel shutting down");
                    break;
                }
                _ = interval.tick() => {
                    for event in self.tick() {
                        debug!(?event, "Timeout fired");
                        listener.on_timeout(event);
                    }
                }
            }
        }
    }

    fn ticks_for(&self, timeout: Duration) -> u64 {
        let interval = self.config.tick_interval.as_millis().max(1);
        timeout.as_millis().div_ceil(interval).max(1) as u64
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Wheels> {
        self.wheels.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
