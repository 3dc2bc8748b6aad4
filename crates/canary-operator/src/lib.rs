/*
 * 5D Labs Canary Operator - phased node remediation for Kubernetes fleets
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

#![allow(clippy::missing_errors_doc, clippy::missing_panics_doc, clippy::doc_markdown)]

//! Canary operator core library
//!
//! Admits fleet nodes one at a time into a remediation workflow: taint and
//! label the node, run a node-pinned remediation job, watch it to completion
//! and lift the taint again. All node writes are compare-and-set, so any
//! number of operator replicas and watchers can share the fleet.

pub mod admission;
pub mod cluster;
pub mod config;
pub mod error;
pub mod finalize;
pub mod health;
pub mod launcher;
pub mod naming;
pub mod node_state;
pub mod rbac;
pub mod reconcile;
pub mod retry;
pub mod telemetry;
pub mod watcher;

// Re-export commonly used types
pub use admission::{AdmissionWriter, AdmitOutcome, AdmittedNode};
pub use cluster::{ClusterApi, KubeCluster};
pub use config::CanaryConfig;
pub use error::{Error, Result};
pub use finalize::{FinalizationWriter, FinalizeOutcome};
pub use launcher::{JobLauncher, JobRef, JobRole, LaunchReport};
pub use node_state::Phase;
pub use reconcile::{Reconciler, ScanReport};
pub use retry::RetryPolicy;
pub use watcher::{CompletionWatcher, JobPhase, WatchReport, WatchState, WatchTarget};
