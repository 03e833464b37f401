// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Registry collaborator: cluster membership, liveness and mutual exclusion.
//!
//! The master never decides liveness itself. A node is alive exactly when
//! the registry lists it; failover and slot assignment both read from here.

pub mod memory;

pub use memory::InMemoryRegistry;

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::warn;

/// Kind of cluster node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    /// Scheduler node running this crate.
    Master,
    /// Task executor.
    Worker,
}

impl NodeType {
    /// Path segment used in lock paths.
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeType::Master => "master",
            NodeType::Worker => "worker",
        }
    }
}

/// A live node as published in the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    /// `ip:port` address.
    pub host: String,
    /// Node kind.
    pub node_type: NodeType,
    /// When the node process started.
    pub startup_time: DateTime<Utc>,
}

impl NodeInfo {
    /// A node that started now.
    pub fn new(node_type: NodeType, host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            node_type,
            startup_time: Utc::now(),
        }
    }
}

/// Membership change notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MembershipEvent {
    /// A node joined.
    Added(NodeInfo),
    /// A node left or its session expired.
    Removed {
        /// Node kind.
        node_type: NodeType,
        /// Node address.
        host: String,
    },
}

impl MembershipEvent {
    /// Node kind of the changed member.
    pub fn node_type(&self) -> NodeType {
        match self {
            MembershipEvent::Added(node) => node.node_type,
            MembershipEvent::Removed { node_type, .. } => *node_type,
        }
    }
}

/// Errors from registry operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RegistryError {
    /// The lock was not acquired within the timeout.
    #[error("Timed out after {timeout:?} waiting for lock {path}")]
    LockTimeout {
        /// Lock path.
        path: String,
        /// Timeout that elapsed.
        timeout: Duration,
    },

    /// Releasing a lock that is not held.
    #[error("Lock {0} is not held")]
    LockNotHeld(String),

    /// Registry backend is unreachable.
    #[error("Registry unavailable: {0}")]
    Unavailable(String),
}

/// Registry collaborator.
#[async_trait]
pub trait Registry: Send + Sync {
    /// Publish a node as live.
    async fn register(&self, node: NodeInfo) -> Result<(), RegistryError>;

    /// Remove a node (graceful shutdown or session loss).
    async fn unregister(&self, node_type: NodeType, host: &str) -> Result<(), RegistryError>;

    /// Live nodes of a kind, ordered by host.
    async fn list_live_nodes(&self, node_type: NodeType) -> Result<Vec<NodeInfo>, RegistryError>;

    /// Acquire a mutual-exclusion lock, waiting at most `timeout`.
    async fn acquire_lock(&self, path: &str, timeout: Duration) -> Result<(), RegistryError>;

    /// Release a lock acquired with [`Registry::acquire_lock`].
    async fn release_lock(&self, path: &str) -> Result<(), RegistryError>;

    /// Subscribe to membership changes.
    fn subscribe(&self) -> broadcast::Receiver<MembershipEvent>;
}

/// Failover lock path for a host.
pub fn failover_lock_path(node_type: NodeType, host: &str) -> String {
    format!("/lock/failover/{}/{}", node_type.as_str(), host)
}

/// Run `f` while holding the lock at `path`.
///
/// The lock is released whether `f` completes or panics; a panic is
/// resumed after the release.
pub async fn with_lock<F, Fut, T>(
    registry: &dyn Registry,
    path: &str,
    timeout: Duration,
    f: F,
) -> Result<T, RegistryError>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = T>,
{
    registry.acquire_lock(path, timeout).await?;

    let outcome = AssertUnwindSafe(f()).catch_unwind().await;

    if let Err(e) = registry.release_lock(path).await {
        warn!(path = %path, error = %e, "Failed to release registry lock");
    }

    match outcome {
        Ok(value) => Ok(value),
        Err(panic) => std::panic::resume_unwind(panic),
    }
}
