// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! esb agent - per-host worker lifecycle server
//!
//! A QUIC server responsible for:
//! - Worker creation, teardown, pause and resume
//! - CNI networking for supervisor workers
//! - Reaping idle and orphaned workers

use tokio::signal::unix::{SignalKind, signal};
use tracing::{error, info, warn};

use esb_agent::bootstrap;
use esb_agent::config::{Config, env_lookup};
use esb_agent::identity::Identity;
use esb_agent::logging;
use esb_agent::runtime::AgentRuntimeBuilder;
use esb_agent::server::build_server;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    let dotenv = dotenvy::dotenv();

    logging::init(env_lookup);

    if let Err(e) = dotenv {
        warn!("No .env file loaded: {}", e);
    }

    let config = Config::from_env()?;

    let identity = match Identity::resolve(env_lookup) {
        Ok(identity) => identity,
        Err(e) => {
            error!(error = %e, "Failed to resolve brand identity");
            std::process::exit(1);
        }
    };

    info!(
        bind_addr = %config.bind_addr,
        runtime = config.runtime.as_str(),
        brand = %identity,
        identity_source = identity.source().env_var(),
        env = %config.env_name,
        "Starting esb agent"
    );

    let resolver = bootstrap::image_resolver(&config, &identity, env_lookup)?;
    let backend = bootstrap::build_backend(&config, &identity, resolver)?;
    let server = build_server(&config)?;

    let runtime = AgentRuntimeBuilder::from_config(&config)
        .backend(backend)
        .brand(identity.slug())
        .server(server)
        .build()?
        .start()
        .await?;

    info!(addr = %runtime.bind_addr(), "Agent server ready");

    // Wait for shutdown signal
    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Received SIGINT"),
        _ = sigterm.recv() => info!("Received SIGTERM"),
    }

    // Graceful shutdown
    runtime.shutdown().await?;

    info!("esb agent shut down");

    Ok(())
}
