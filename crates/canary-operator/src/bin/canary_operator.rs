/*
 * 5D Labs Canary Operator - Reconciliation Service
 * Copyright (C) 2025 5D Labs
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published
 * by the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program. If not, see <https://www.gnu.org/licenses/>.
 */

//! Canary Operator - periodic fleet scan
//!
//! Admits eligible nodes, launches their remediation and watcher jobs, repairs
//! partial launches, and serves `/health`, `/ready` and `/status`.

use anyhow::Context;
use canary_operator::config::CONFIG_PATH_ENV;
use canary_operator::health::{self, HealthState};
use canary_operator::{rbac, telemetry, CanaryConfig, KubeCluster, Reconciler};
use clap::Parser;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "canary-operator")]
#[command(about = "Phased canary remediation of fleet nodes", long_about = None)]
#[command(version)]
struct Args {
    /// Configuration file (YAML)
    #[arg(long, env = CONFIG_PATH_ENV)]
    config: Option<String>,

    /// Kubeconfig used when not running inside a cluster
    #[arg(long, env = "KUBECONFIG")]
    kubeconfig: Option<String>,

    /// Override the HTTP bind address
    #[arg(long)]
    bind: Option<String>,

    /// Run a single fleet scan and exit
    #[arg(long)]
    once: bool,
}

fn load_config(args: &Args) -> anyhow::Result<CanaryConfig> {
    let mut config = match args.config.as_deref() {
        Some(path) => {
            let mut cfg = CanaryConfig::from_mounted_file(path)?;
            cfg.apply_env();
            info!(path = %path, "Loaded canary configuration");
            cfg
        }
        None => CanaryConfig::load()?,
    };
    if let Some(bind) = &args.bind {
        config.server.bind_address.clone_from(bind);
    }
    config
        .validate_for_operator()
        .context("invalid operator configuration")?;
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    telemetry::init_tracing();
    let args = Args::parse();

    info!(
        "Starting 5D Labs Canary Operator v{}",
        env!("CARGO_PKG_VERSION")
    );

    let config = Arc::new(load_config(&args)?);
    let client = canary_operator::cluster::connect(args.kubeconfig.as_deref())
        .await
        .context("failed to build Kubernetes client")?;
    info!("Connected to Kubernetes cluster");
    let cluster = Arc::new(KubeCluster::new(client));

    if config.rbac.provision {
        let report = rbac::ensure_rbac(cluster.as_ref(), &config)
            .await
            .context("failed to provision watcher RBAC")?;
        info!(?report, "Watcher RBAC in place");
    }

    let reconciler = Arc::new(Reconciler::new(cluster, config.clone()));

    if args.once {
        let report = reconciler.run_once().await;
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    let (stop_tx, stop_rx) = watch::channel(false);

    let loop_handle = {
        let reconciler = reconciler.clone();
        let stop = stop_rx.clone();
        tokio::spawn(async move { reconciler.run(stopped(stop)).await })
    };

    let app = health::router(HealthState {
        last_scan: reconciler.status_handle(),
    });
    let listener = tokio::net::TcpListener::bind(&config.server.bind_address)
        .await
        .with_context(|| format!("failed to bind {}", config.server.bind_address))?;
    info!(address = %config.server.bind_address, "Canary operator HTTP server listening");

    let server = axum::serve(listener, app).with_graceful_shutdown(stopped(stop_rx));
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = stop_tx.send(true);
    });

    server.await?;
    if let Err(e) = loop_handle.await {
        error!(error = %e, "Reconciliation loop task failed");
    }
    info!("Canary operator stopped");
    Ok(())
}

/// Resolves once shutdown has been requested
async fn stopped(mut rx: watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received Ctrl+C, shutting down gracefully");
        },
        () = terminate => {
            info!("Received SIGTERM, shutting down gracefully");
        },
    }
}
