// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Flowmaster Master - Execution and Fault-Tolerance Engine
//!
//! Several masters run side by side over one shared store. None of them is
//! a leader: the command backlog is partitioned by slot, each workflow
//! instance is driven by exactly one master, and any master can take over
//! the work of a dead one.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                     Registry (membership, locks)                      │
//! └──────────────────────────────────────────────────────────────────────┘
//!        │ masters              │ workers                │ node removed
//!        ▼                      ▼                        ▼
//! ┌─────────────┐   ┌──────────────────────────┐   ┌──────────────────┐
//! │ SlotManager │   │       WorkflowEngine      │   │ FailoverService  │
//! │  (slot.rs)  │   │ actor per instance + DAG  │◄──│ dead masters and │
//! └─────────────┘   │ TaskExecutionRunnable     │   │ dead workers     │
//!        │          └──────────────────────────┘   └──────────────────┘
//!        ▼              ▲       │        ▲   ▲
//! ┌─────────────┐       │       │        │   │ timeouts
//! │CommandIntake│───────┘       │        │ ┌──────────────┐
//! │ page + pool │               │        │ │  StateWheel  │
//! └─────────────┘               ▼        │ └──────────────┘
//!                      ┌──────────────────┐
//!                      │ Remoting         │ dispatch / kill / reports
//!                      │ (workers, peers) │
//!                      └──────────────────┘
//! ```
//!
//! # Guarantees
//!
//! | Concern | Mechanism |
//! |---------|-----------|
//! | Exactly-once command consumption | instance write and command delete in one transaction |
//! | One live driver per instance | [`cache::WorkflowInstanceCache`] admission in [`engine::WorkflowEngine::submit`] |
//! | Task group capacity | conditional updates on the persisted claim queue |
//! | Single failover per dead host | registry lock per host plus conditional ownership transfer |
//!
//! # Configuration
//!
//! See [`config::MasterConfig`] for the environment variables.

#![deny(missing_docs)]

/// Alert events and handler registration.
pub mod alert;

/// Running-instance cache.
pub mod cache;

/// Configuration loaded from the environment.
pub mod config;

/// In-memory DAG of a workflow definition.
pub mod dag;

/// Per-instance workflow actors.
pub mod engine;

/// Error types.
pub mod error;

/// Dead master and worker recovery.
pub mod failover;

/// Command polling and conversion.
pub mod intake;

/// Host load sampling.
pub mod load;

/// Cluster membership and distributed locks.
pub mod registry;

/// Calls to workers and other masters.
pub mod remoting;

/// Task attempt state machine.
pub mod runnable;

/// Embeddable runtime.
pub mod runtime;

/// Command slot partitioning.
pub mod slot;

/// Timeout timing wheels.
pub mod state_wheel;

/// Task group limiter.
pub mod task_group;

pub use config::MasterConfig;
pub use engine::{WorkflowEngine, WorkflowEvent, WorkflowSubmitStatus};
pub use error::{Error, Result};
pub use runtime::MasterRuntime;
