// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Worker selection.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::registry::{NodeType, Registry, RegistryError};

/// Picks workers round-robin from the registry's live set.
pub struct RoundRobinSelector {
    registry: Arc<dyn Registry>,
    next: AtomicUsize,
}

impl RoundRobinSelector {
    /// Create a selector over the registry's workers.
    pub fn new(registry: Arc<dyn Registry>) -> Self {
        Self {
            registry,
            next: AtomicUsize::new(0),
        }
    }

    /// Next worker, or `None` when no worker is alive.
    pub async fn select(&self) -> Result<Option<String>, RegistryError> {
        let workers = self.registry.list_live_nodes(NodeType::Worker).await?;
        if workers.is_empty() {
            return Ok(None);
        }
        let index = self.next.fetch_add(1, Ordering::Relaxed) % workers.len();
        Ok(Some(workers[index].host.clone()))
    }
}
