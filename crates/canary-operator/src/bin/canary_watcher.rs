/*
 * 5D Labs Canary Operator - Completion Watcher
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

//! Canary Watcher - runs inside the watcher job of one admission
//!
//! Waits for the node's remediation job to finish and then lifts the exclusion
//! taint. Exits 0 only when the node was finalized. Marker keys, timing and
//! retry budgets arrive as `CANARY_*` variables set by the operator on the job;
//! the pod never restarts, so a non-zero exit is reported once.

use anyhow::Context;
use canary_operator::config::{ENV_ADMISSION, ENV_NAMESPACE, ENV_NODE_NAME};
use canary_operator::{
    node_state, telemetry, CanaryConfig, ClusterApi, CompletionWatcher, Error, KubeCluster,
    WatchTarget,
};
use clap::Parser;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "canary-watcher")]
#[command(about = "Watch a node's remediation job and finalize the node", long_about = None)]
#[command(version)]
struct Args {
    /// Node this watcher is bound to
    #[arg(long, env = ENV_NODE_NAME)]
    node: String,

    /// Admission counter of the jobs to watch; read from the node when absent
    #[arg(long, env = ENV_ADMISSION)]
    admission: Option<u64>,

    /// Namespace of the remediation job
    #[arg(long, env = ENV_NAMESPACE)]
    namespace: Option<String>,

    #[arg(long, env = "KUBECONFIG")]
    kubeconfig: Option<String>,
}

fn exit_code(err: &Error) -> ExitCode {
    match err {
        Error::JobFailed { .. } => ExitCode::from(2),
        Error::Stuck { .. } => ExitCode::from(3),
        Error::Invariant { .. } => ExitCode::from(4),
        _ => ExitCode::FAILURE,
    }
}

async fn resolve_admission(
    cluster: &dyn ClusterApi,
    config: &CanaryConfig,
    node: &str,
    explicit: Option<u64>,
) -> anyhow::Result<Option<u64>> {
    if explicit.is_some() {
        return Ok(explicit);
    }
    let current = cluster
        .get_node(node)
        .await
        .with_context(|| format!("failed to read node {node}"))?;
    let counter = node_state::admission_counter(&current, &config.markers)?;
    if counter == 0 {
        warn!(node = %node, "No admission counter on node; watching all remediation jobs of the node");
        return Ok(None);
    }
    Ok(Some(counter))
}

async fn run(args: Args) -> anyhow::Result<Result<(), Error>> {
    let mut config = CanaryConfig::load()?;
    if let Some(namespace) = args.namespace.filter(|ns| !ns.trim().is_empty()) {
        config.jobs.namespace = namespace;
    }
    config.validate().context("invalid watcher configuration")?;

    let client = canary_operator::cluster::connect(args.kubeconfig.as_deref())
        .await
        .context("failed to build Kubernetes client")?;
    let cluster: Arc<dyn ClusterApi> = Arc::new(KubeCluster::new(client));

    let admission = resolve_admission(cluster.as_ref(), &config, &args.node, args.admission).await?;
    let watcher = CompletionWatcher::new(
        cluster,
        &config,
        WatchTarget {
            node: args.node,
            admission,
            namespace: config.jobs.namespace.clone(),
        },
    );

    Ok(watcher.run().await.map(|report| {
        info!(
            node = %report.node,
            job = %report.job,
            elapsed_secs = report.elapsed.as_secs(),
            transitions = report.transitions,
            "Watcher finished"
        );
    }))
}

#[tokio::main]
async fn main() -> ExitCode {
    telemetry::init_tracing();
    let args = Args::parse();

    info!(
        node = %args.node,
        "Starting 5D Labs Canary Watcher v{}",
        env!("CARGO_PKG_VERSION")
    );

    match run(args).await {
        Ok(Ok(())) => ExitCode::SUCCESS,
        Ok(Err(e)) => {
            error!(error = %e, "Watch ended without finalizing the node");
            exit_code(&e)
        }
        Err(e) => {
            error!(error = %format!("{e:#}"), "Watcher could not start");
            ExitCode::FAILURE
        }
    }
}
