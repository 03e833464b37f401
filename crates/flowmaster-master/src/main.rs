// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Flowmaster Master - standalone node
//!
//! Runs one master over a SQLite store with the in-process registry and
//! loopback remoting. Useful for single-node deployments and local testing;
//! clustered deployments embed [`MasterRuntime`] with real collaborators.

use std::sync::Arc;
use tracing::{info, warn};

use flowmaster_core::persistence::SqlitePersistence;
use flowmaster_master::alert::LogAlertHandler;
use flowmaster_master::config::MasterConfig;
use flowmaster_master::registry::{InMemoryRegistry, NodeInfo, NodeType, Registry};
use flowmaster_master::remoting::LoopbackRemoting;
use flowmaster_master::runtime::MasterRuntime;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "flowmaster_master=info".into()),
        )
        .init();

    // Load .env file if present
    if let Err(e) = dotenvy::dotenv() {
        warn!("No .env file loaded: {}", e);
    }

    let config = MasterConfig::from_env()?;
    info!(
        host = %config.host,
        database_url = %config.database_url,
        "Starting Flowmaster master"
    );

    let persistence = if config.database_url.starts_with("sqlite:") {
        SqlitePersistence::connect(&config.database_url, 5).await?
    } else {
        SqlitePersistence::from_path(&config.database_url).await?
    };
    info!("Connected to database");

    // Single-node mode: an in-process worker completes every dispatched task.
    let registry = Arc::new(InMemoryRegistry::new());
    registry
        .register(NodeInfo::new(NodeType::Worker, "local-worker"))
        .await?;
    let remoting = Arc::new(LoopbackRemoting::auto_completing());
    let inbound = remoting.connect_master(&config.host);

    let runtime = MasterRuntime::builder()
        .config(config)
        .persistence(Arc::new(persistence))
        .registry(registry)
        .remoting(remoting)
        .inbound(inbound)
        .alert_handler_all(Arc::new(LogAlertHandler))
        .build()?
        .start()
        .await?;

    info!(host = %runtime.host(), "Master ready");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    runtime.shutdown().await?;

    info!("Flowmaster master shut down");

    Ok(())
}
