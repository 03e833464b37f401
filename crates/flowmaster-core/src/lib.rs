// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Flowmaster Core - Data Model and Persistence
//!
//! This crate holds everything the master nodes share through storage: the
//! command backlog, workflow definitions, workflow and task instances, and
//! task-group claims. It deliberately knows nothing about scheduling; the
//! execution engine lives in `flowmaster-master`.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                       API layer (out of scope)                        │
//! │                 inserts commands, saves definitions                   │
//! └──────────────────────────────────────────────────────────────────────┘
//!                                   │
//!                                   ▼
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                    flowmaster-core (This Crate)                       │
//! │   Command │ WorkflowDefinition │ WorkflowInstance │ TaskInstance      │
//! │                  Persistence trait + SQLite backend                   │
//! └──────────────────────────────────────────────────────────────────────┘
//!                                   ▲
//!                                   │ shared by every master replica
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                        flowmaster-master × N                          │
//! │     command intake │ DAG engine │ task groups │ timeouts │ failover   │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Ownership Marker
//!
//! A workflow instance's `host` column names the master that currently
//! drives it. Failover moves ownership with a conditional update
//! (`transfer_workflow_instance_host`) so two masters can never both claim
//! the same orphan.
//!
//! # Workflow Instance States
//!
//! ```text
//!   SUBMITTED ──► RUNNING ──┬──► SUCCESS
//!                           ├──► FAILURE
//!                           ├──► PAUSED   (recover_suspended ──► SUBMITTED)
//!                           ├──► STOPPED
//!                           └──► BLOCKED
//! ```
//!
//! # Modules
//!
//! - [`error`]: Error types with stable error codes
//! - [`model`]: Commands, definitions, instances, task groups
//! - [`persistence`]: Persistence trait and SQLite backend

#![deny(missing_docs)]

/// Error types for persistence and model validation.
pub mod error;

/// Domain model shared by all master replicas.
pub mod model;

/// Persistence interfaces and backends.
pub mod persistence;

pub use error::{CoreError, Result};
pub use model::Lookup;
