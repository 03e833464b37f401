// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Live workflow instance cache.
//!
//! Maps an instance id to the mailbox of the actor driving it on this
//! master. Membership here is what "running on this master" means: the
//! engine rejects duplicate submissions with it and failover skips any
//! instance found here.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::mpsc;

use crate::engine::WorkflowEvent;

/// Handle to a running workflow actor.
#[derive(Debug, Clone)]
pub struct InstanceHandle {
    /// Actor mailbox.
    pub sender: mpsc::UnboundedSender<WorkflowEvent>,
}

/// Concurrent map of running instances on this master.
#[derive(Debug, Default)]
pub struct WorkflowInstanceCache {
    instances: DashMap<i64, InstanceHandle>,
}

impl WorkflowInstanceCache {
    /// An empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert unless the id is already present. Returns false on duplicates.
    pub fn try_insert(&self, workflow_instance_id: i64, handle: InstanceHandle) -> bool {
        match self.instances.entry(workflow_instance_id) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(handle);
                true
            }
        }
    }

    /// Mailbox of a running instance.
    pub fn get(&self, workflow_instance_id: i64) -> Option<InstanceHandle> {
        self.instances
            .get(&workflow_instance_id)
            .map(|entry| entry.value().clone())
    }

    /// Evict an instance.
    pub fn remove(&self, workflow_instance_id: i64) -> Option<InstanceHandle> {
        self.instances
            .remove(&workflow_instance_id)
            .map(|(_, handle)| handle)
    }

    /// Whether an instance runs on this master.
    pub fn contains(&self, workflow_instance_id: i64) -> bool {
        self.instances.contains_key(&workflow_instance_id)
    }

    /// Number of running instances.
    pub fn len(&self) -> usize {
        self.instances.len()
    }

    /// Whether nothing is running.
    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    /// Ids of running instances.
    pub fn ids(&self) -> Vec<i64> {
        self.instances.iter().map(|entry| *entry.key()).collect()
    }
}
