// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Slot calculator.
//!
//! Masters share the command backlog by partitioning the id space: a master
//! owns command `id` when `id mod master_count == slot_index`, where its slot
//! index is its position among live masters ordered by host. Ownership is
//! recomputed from the registry on every poll, so scale-out and scale-in
//! redistribute commands without any rebalancing protocol.

use std::sync::{Arc, PoisonError, RwLock};

use tokio::sync::{Notify, broadcast};
use tracing::{debug, info, warn};

use crate::registry::{NodeType, Registry, RegistryError};

/// Whether a command belongs to a slot.
///
/// Never true while `master_count <= 0`: membership is not known yet and
/// every command must be treated as foreign.
pub fn is_owned(command_id: i64, slot_index: i64, master_count: i64) -> bool {
    if master_count <= 0 {
        return false;
    }
    command_id.rem_euclid(master_count) == slot_index
}

/// Result of re-validating a fetched command before processing it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotCheck {
    /// The command still belongs to this master.
    Pass,
    /// The command now belongs to another master.
    Inject,
    /// Membership is unresolved; nothing is owned.
    Change,
}

/// This master's view of the slot table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SlotSnapshot {
    /// Position of this master among live masters.
    pub slot_index: i64,
    /// Number of live masters; 0 until this master sees itself registered.
    pub master_count: i64,
}

/// Tracks this master's slot from registry membership.
pub struct SlotManager {
    host: String,
    registry: Arc<dyn Registry>,
    state: RwLock<SlotSnapshot>,
}

impl SlotManager {
    /// Create a manager for `host`. The slot table starts unresolved.
    pub fn new(host: impl Into<String>, registry: Arc<dyn Registry>) -> Self {
        Self {
            host: host.into(),
            registry,
            state: RwLock::new(SlotSnapshot::default()),
        }
    }

    /// Re-read live masters and recompute this master's slot.
    pub async fn refresh(&self) -> Result<SlotSnapshot, RegistryError> {
        let masters = self.registry.list_live_nodes(NodeType::Master).await?;
        let snapshot = match masters.iter().position(|node| node.host == self.host) {
            Some(index) => SlotSnapshot {
                slot_index: index as i64,
                master_count: masters.len() as i64,
            },
            None => SlotSnapshot::default(),
        };

        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if *state != snapshot {
            info!(
                host = %self.host,
                slot_index = snapshot.slot_index,
                master_count = snapshot.master_count,
                "Slot assignment changed"
            );
        }
        *state = snapshot;
        Ok(snapshot)
    }

    /// The last computed slot.
    pub fn snapshot(&self) -> SlotSnapshot {
        *self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Re-validate a command against the current slot.
    pub fn check(&self, command_id: i64) -> SlotCheck {
        let snapshot = self.snapshot();
        if snapshot.master_count <= 0 {
            SlotCheck::Change
        } else if is_owned(command_id, snapshot.slot_index, snapshot.master_count) {
            SlotCheck::Pass
        } else {
            SlotCheck::Inject
        }
    }

    /// Refresh the slot whenever master membership changes, until `shutdown`.
    pub async fn watch(&self, shutdown: Arc<Notify>) {
        let mut events = self.registry.subscribe();
        loop {
            tokio::select! {
                biased;
                _ = shutdown.notified() => {
                    debug!("Slot watcher shutting down");
                    break;
                }
                event = events.recv() => {
                    match event {
                        Ok(event) if event.node_type() != NodeType::Master => continue,
                        Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {
                            if let Err(e) = self.refresh().await {
                                warn!(error = %e, "Failed to refresh slot assignment");
                            }
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        }
    }
}
