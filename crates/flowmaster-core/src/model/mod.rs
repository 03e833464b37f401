// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Domain model shared by all master replicas.

/// Implements `as_str`, `Display` and `FromStr` for a fieldless enum stored
/// as text.
macro_rules! text_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            /// Storage representation.
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $name {
            type Err = crate::error::CoreError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(crate::error::CoreError::ValidationError {
                        field: stringify!($name).to_string(),
                        message: format!("unknown value '{}'", other),
                    }),
                }
            }
        }
    };
}

/// Queued start/resume requests.
pub mod command;

/// Workflow and task definitions (the DAG blueprint).
pub mod definition;

/// Task instances (one execution attempt of a DAG node).
pub mod task;

/// Task-group concurrency limiter records.
pub mod task_group;

/// Workflow instances (one run of a definition).
pub mod workflow;

pub use command::{Command, CommandType, ErrorCommand, NewCommand};
pub use definition::{
    BranchOutcome, TaskDefinition, TaskKind, TaskRelation, TaskTimeout, TimeoutStrategy,
    WorkflowDefinition,
};
pub use task::{TaskInstance, TaskState};
pub use task_group::{AcquireOutcome, ClaimState, TaskGroup, TaskGroupClaim};
pub use workflow::{FailureStrategy, WarningPolicy, WorkflowInstance, WorkflowState};

/// Outcome of a lookup or a conditional write.
///
/// "Not there" and "someone else got there first" are ordinary outcomes in a
/// multi-master cluster, so they are values rather than errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup<T> {
    /// The entity exists (or the write was applied).
    Found(T),
    /// The entity does not exist.
    NotFound,
    /// The entity exists but is owned or consumed by someone else.
    Conflict(String),
}

impl<T> Lookup<T> {
    /// Returns the found value, discarding the other outcomes.
    pub fn found(self) -> Option<T> {
        match self {
            Lookup::Found(value) => Some(value),
            _ => None,
        }
    }

    /// Returns true for [`Lookup::Found`].
    pub fn is_found(&self) -> bool {
        matches!(self, Lookup::Found(_))
    }

    /// Maps the found value.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Lookup<U> {
        match self {
            Lookup::Found(value) => Lookup::Found(f(value)),
            Lookup::NotFound => Lookup::NotFound,
            Lookup::Conflict(reason) => Lookup::Conflict(reason),
        }
    }
}
