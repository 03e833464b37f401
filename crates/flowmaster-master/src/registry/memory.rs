// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-process registry.
//!
//! Shared by every master embedded in one process (tests, single-node
//! deployments). Membership is a sorted map; locks are a set of held paths
//! with a [`Notify`] to wake waiters on release.

use std::collections::{BTreeMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Notify, broadcast};
use tokio::time::Instant;
use tracing::debug;

use super::{MembershipEvent, NodeInfo, NodeType, Registry, RegistryError};

const EVENT_CAPACITY: usize = 256;

/// Registry kept in process memory.
pub struct InMemoryRegistry {
    nodes: Mutex<BTreeMap<(NodeType, String), NodeInfo>>,
    locks: Mutex<HashSet<String>>,
    lock_released: Notify,
    events: broadcast::Sender<MembershipEvent>,
}

impl Default for InMemoryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            nodes: Mutex::new(BTreeMap::new()),
            locks: Mutex::new(HashSet::new()),
            lock_released: Notify::new(),
            events,
        }
    }

    /// Whether a lock path is currently held.
    pub fn is_locked(&self, path: &str) -> bool {
        self.locks
            .lock()
            .map(|locks| locks.contains(path))
            .unwrap_or(false)
    }

    fn try_lock(&self, path: &str) -> Result<bool, RegistryError> {
        let mut locks = self
            .locks
            .lock()
            .map_err(|_| RegistryError::Unavailable("lock table poisoned".to_string()))?;
        Ok(locks.insert(path.to_string()))
    }
}

#[async_trait]
impl Registry for InMemoryRegistry {
    async fn register(&self, node: NodeInfo) -> Result<(), RegistryError> {
        {
            let mut nodes = self
                .nodes
                .lock()
                .map_err(|_| RegistryError::Unavailable("node table poisoned".to_string()))?;
            nodes.insert((node.node_type, node.host.clone()), node.clone());
        }
        debug!(host = %node.host, node_type = node.node_type.as_str(), "Node registered");
        // No subscribers is fine.
        let _ = self.events.send(MembershipEvent::Added(node));
        Ok(())
    }

    async fn unregister(&self, node_type: NodeType, host: &str) -> Result<(), RegistryError> {
        let removed = {
            let mut nodes = self
                .nodes
                .lock()
                .map_err(|_| RegistryError::Unavailable("node table poisoned".to_string()))?;
            nodes.remove(&(node_type, host.to_string())).is_some()
        };
        if removed {
            debug!(host = %host, node_type = node_type.as_str(), "Node unregistered");
            let _ = self.events.send(MembershipEvent::Removed {
                node_type,
                host: host.to_string(),
            });
        }
        Ok(())
    }

    async fn list_live_nodes(&self, node_type: NodeType) -> Result<Vec<NodeInfo>, RegistryError> {
        let nodes = self
            .nodes
            .lock()
            .map_err(|_| RegistryError::Unavailable("node table poisoned".to_string()))?;
        Ok(nodes
            .iter()
            .filter(|((kind, _), _)| *kind == node_type)
            .map(|(_, node)| node.clone())
            .collect())
    }

    async fn acquire_lock(&self, path: &str, timeout: Duration) -> Result<(), RegistryError> {
        let deadline = Instant::now() + timeout;
        loop {
            // Register for wakeups before checking so a release between the
            // check and the wait is not missed.
            let released = self.lock_released.notified();
            if self.try_lock(path)? {
                return Ok(());
            }
            if tokio::time::timeout_at(deadline, released).await.is_err() {
                return Err(RegistryError::LockTimeout {
                    path: path.to_string(),
                    timeout,
                });
            }
        }
    }

    async fn release_lock(&self, path: &str) -> Result<(), RegistryError> {
        let removed = {
            let mut locks = self
                .locks
                .lock()
                .map_err(|_| RegistryError::Unavailable("lock table poisoned".to_string()))?;
            locks.remove(path)
        };
        if !removed {
            return Err(RegistryError::LockNotHeld(path.to_string()));
        }
        self.lock_released.notify_waiters();
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<MembershipEvent> {
        self.events.subscribe()
    }
}
