// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! accelrt-service daemon
//!
//! Serves published core-ops over gRPC and reaps clients that stop
//! sending keep-alives.

use anyhow::Context;
use clap::Parser;
use tracing::info;

use accelrt_service::{ServiceArgs, ServiceConfig, ServiceState};

fn main() -> anyhow::Result<()> {
    let args = ServiceArgs::parse();
    let config = ServiceConfig::resolve(&args).context("failed to resolve service configuration")?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .or_else(|_| tracing_subscriber::EnvFilter::try_new(&config.log))
                .context("invalid log filter")?,
        )
        .init();

    info!(
        "[Service] Starting accelrt service v{} (PID: {})",
        accelrt_service::VERSION,
        std::process::id()
    );
    info!(
        "[Service] Keep-alive scan every {:?}, liveness window {:?}",
        config.keepalive_interval(),
        config.liveness_window()
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to create tokio runtime")?;

    runtime.block_on(async {
        let state = ServiceState::new();
        let reaper = accelrt_service::spawn_reaper(
            state.clone(),
            config.keepalive_interval(),
            config.liveness_window(),
        );

        let shutdown = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("[Service] Failed to listen for Ctrl+C: {}", e);
                std::future::pending::<()>().await;
            }
            info!("[Service] Shutting down");
        };

        let result = accelrt_service::serve(state, config.listen_addr, shutdown).await;
        reaper.abort();
        result
    })
}
