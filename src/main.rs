// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use storage_upgrade::{
    constants::{SHUTDOWN_GRACE_PERIOD_SECS, TOKIO_WORKER_THREADS},
    metrics::gather_metrics,
    upgrade::upgrade,
};
use tracing::{debug, error, info, warn};

/// Upgrade the cluster-resident storage state to this release.
#[derive(Debug, Parser)]
#[command(name = "storage-upgrade", version, about)]
struct Cli {
    /// Path to a kubeconfig file; in-cluster configuration is used when unset
    #[arg(long, env = "KUBECONFIG")]
    kubeconfig: Option<PathBuf>,

    /// Identity of this replica in the upgrade election
    #[arg(long, env = "NODE_NAME")]
    node_id: String,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Build Tokio runtime with custom thread names
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(TOKIO_WORKER_THREADS)
        .thread_name("storage-upgrade")
        .enable_all()
        .build()?;

    runtime.block_on(async_main(cli))
}

async fn async_main(cli: Cli) -> Result<()> {
    // Respects RUST_LOG if set, otherwise defaults to INFO level.
    // RUST_LOG_FORMAT=json switches to structured output.
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let log_format = std::env::var("RUST_LOG_FORMAT").unwrap_or_else(|_| "text".to_string());

    match log_format.to_lowercase().as_str() {
        "json" => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_file(true)
                .with_line_number(true)
                .with_thread_names(true)
                .with_target(false)
                .json()
                .init();
        }
        _ => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_file(true)
                .with_line_number(true)
                .with_thread_names(true)
                .with_target(false)
                .with_ansi(true)
                .compact()
                .init();
        }
    }

    info!(node_id = %cli.node_id, "Starting storage upgrade");

    let result = tokio::select! {
        result = upgrade(cli.kubeconfig.as_deref(), &cli.node_id) => {
            result.map(|run| {
                info!(
                    leader = %run.leader,
                    steps = run.completed_steps.len(),
                    "Storage upgrade completed"
                );
            }).map_err(anyhow::Error::from)
        }
        signal = shutdown_signal() => {
            warn!("Received {}, abandoning the upgrade", signal);
            // The dropped election handle releases the lease in the background
            tokio::time::sleep(Duration::from_secs(SHUTDOWN_GRACE_PERIOD_SECS)).await;
            Err(anyhow::anyhow!("upgrade interrupted by {signal}"))
        }
    };

    match gather_metrics() {
        Ok(metrics) => debug!("Upgrade metrics:\n{}", metrics),
        Err(e) => debug!("Failed to gather metrics: {}", e),
    }

    if let Err(e) = &result {
        error!("Storage upgrade failed: {:#}", e);
    }
    result
}

/// Wait for SIGINT, or SIGTERM on Unix; returns the signal name.
async fn shutdown_signal() -> &'static str {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => "SIGINT",
                    _ = sigterm.recv() => "SIGTERM",
                }
            }
            Err(e) => {
                warn!("Cannot install SIGTERM handler: {}", e);
                let _ = tokio::signal::ctrl_c().await;
                "SIGINT"
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        "SIGINT"
    }
}
