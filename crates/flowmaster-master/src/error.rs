// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for flowmaster-master.

use thiserror::Error;

/// Master errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Configuration loading failed.
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Core persistence or model operation failed.
    #[error("Core error: {0}")]
    Core(#[from] flowmaster_core::CoreError),

    /// Registry (membership, locks) operation failed.
    #[error("Registry error: {0}")]
    Registry(#[from] crate::registry::RegistryError),

    /// Remote call to a worker or another master failed.
    #[error("Remoting error: {0}")]
    Remoting(#[from] crate::remoting::RemotingError),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

/// Result type using master Error.
pub type Result<T> = std::result::Result<T, Error>;
