// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for flowmaster-core.
//!
//! Provides a unified error type with stable machine-readable codes.

use std::fmt;

/// Result type using CoreError
pub type Result<T> = std::result::Result<T, CoreError>;

/// Core errors raised by the model and the persistence layer.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum CoreError {
    /// Workflow definition was not found.
    WorkflowDefinitionNotFound {
        /// Definition code.
        code: i64,
        /// Definition version.
        version: i32,
    },

    /// Workflow instance was not found.
    WorkflowInstanceNotFound {
        /// The instance ID that was not found.
        workflow_instance_id: i64,
    },

    /// Task instance was not found.
    TaskInstanceNotFound {
        /// The task instance ID that was not found.
        task_instance_id: i64,
    },

    /// Task group was not found.
    TaskGroupNotFound {
        /// The task group ID that was not found.
        group_id: i64,
    },

    /// Entity is in an invalid state for the requested operation.
    InvalidState {
        /// Entity description (e.g. "workflow instance 12").
        entity: String,
        /// The expected state.
        expected: String,
        /// The actual state.
        actual: String,
    },

    /// Workflow definition cannot be turned into a DAG.
    InvalidDefinition {
        /// Definition code.
        code: i64,
        /// What is wrong with it.
        reason: String,
    },

    /// Input validation failed.
    ValidationError {
        /// The field that failed validation.
        field: String,
        /// The validation error message.
        message: String,
    },

    /// Database operation failed.
    DatabaseError {
        /// The operation that failed.
        operation: String,
        /// Error details.
        details: String,
    },
}

impl CoreError {
    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::WorkflowDefinitionNotFound { .. } => "WORKFLOW_DEFINITION_NOT_FOUND",
            Self::WorkflowInstanceNotFound { .. } => "WORKFLOW_INSTANCE_NOT_FOUND",
            Self::TaskInstanceNotFound { .. } => "TASK_INSTANCE_NOT_FOUND",
            Self::TaskGroupNotFound { .. } => "TASK_GROUP_NOT_FOUND",
            Self::InvalidState { .. } => "INVALID_STATE",
            Self::InvalidDefinition { .. } => "INVALID_DEFINITION",
            Self::ValidationError { .. } => "VALIDATION_ERROR",
            Self::DatabaseError { .. } => "DATABASE_ERROR",
        }
    }

    pub(crate) fn database(operation: &str, details: impl fmt::Display) -> Self {
        Self::DatabaseError {
            operation: operation.to_string(),
            details: details.to_string(),
        }
    }
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WorkflowDefinitionNotFound { code, version } => {
                write!(
                    f,
                    "Workflow definition {} (version {}) not found",
                    code, version
                )
            }
            Self::WorkflowInstanceNotFound {
                workflow_instance_id,
            } => {
                write!(f, "Workflow instance {} not found", workflow_instance_id)
            }
            Self::TaskInstanceNotFound { task_instance_id } => {
                write!(f, "Task instance {} not found", task_instance_id)
            }
            Self::TaskGroupNotFound { group_id } => {
                write!(f, "Task group {} not found", group_id)
            }
            Self::InvalidState {
                entity,
                expected,
                actual,
            } => {
                write!(
                    f,
                    "{} is in invalid state: expected '{}', got '{}'",
                    entity, expected, actual
                )
            }
            Self::InvalidDefinition { code, reason } => {
                write!(f, "Workflow definition {} is invalid: {}", code, reason)
            }
            Self::ValidationError { field, message } => {
                write!(f, "Validation error for '{}': {}", field, message)
            }
            Self::DatabaseError { operation, details } => {
                write!(f, "Database error during '{}': {}", operation, details)
            }
        }
    }
}

impl std::error::Error for CoreError {}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        CoreError::database("query", err)
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::database("json", err)
    }
}
