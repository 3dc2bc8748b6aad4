//! `Eligible → Admitted` transition.
//!
//! The node object is the only lock. Every attempt re-reads the node, re-derives
//! eligibility from that fresh copy and submits a replace conditional on the
//! version it read. Losing that race is reported as a conflict; the caller then
//! re-reads and decides again instead of replaying the stale write, which is
//! what keeps admission at-most-once per node across replicas.

use k8s_openapi::api::core::v1::{Node, NodeSpec};
use kube::ResourceExt;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::cluster::ClusterApi;
use crate::config::MarkerConfig;
use crate::error::{Error, Result};
use crate::node_state::{self, Phase, IN_PROGRESS};
use crate::retry::RetryPolicy;

/// A node this process admitted
#[derive(Debug, Clone)]
pub struct AdmittedNode {
    pub name: String,
    /// Committed admission counter, used as the job suffix
    pub admission: u64,
    /// Node as returned by the successful update
    pub node: Node,
}

#[derive(Debug, Clone)]
pub enum AdmitOutcome {
    Admitted(AdmittedNode),
    /// Fresh read showed the node is not eligible; nothing was written
    Skipped { name: String, phase: Phase },
}

pub struct AdmissionWriter {
    cluster: Arc<dyn ClusterApi>,
    markers: MarkerConfig,
    retry: RetryPolicy,
    conflict_retries: u32,
}

impl AdmissionWriter {
    #[must_use]
    pub fn new(
        cluster: Arc<dyn ClusterApi>,
        markers: MarkerConfig,
        retry: RetryPolicy,
        conflict_retries: u32,
    ) -> Self {
        Self {
            cluster,
            markers,
            retry,
            conflict_retries,
        }
    }

    /// One read-decide-write round.
    ///
    /// Returns [`Error::Conflict`] if another writer changed the node between
    /// the read and the write.
    pub async fn admit(&self, name: &str) -> Result<AdmitOutcome> {
        let current = self
            .retry
            .run("get node", || self.cluster.get_node(name))
            .await?;

        let phase = node_state::classify_strict(&current, &self.markers)?;
        if phase != Phase::Eligible {
            debug!(node = %name, phase = %phase, "Node no longer eligible, skipping admission");
            return Ok(AdmitOutcome::Skipped {
                name: name.to_string(),
                phase,
            });
        }

        let (desired, admission) = prepare_admission(current, &self.markers)?;

        let updated = self
            .retry
            .run("replace node", || self.cluster.replace_node(&desired))
            .await?;

        info!(
            node = %name,
            admission,
            taint = %self.markers.taint_key,
            "Admitted node: tainted and labeled {}",
            IN_PROGRESS
        );

        Ok(AdmitOutcome::Admitted(AdmittedNode {
            name: name.to_string(),
            admission,
            node: updated,
        }))
    }

    /// Admit, re-reading and re-deciding after every lost race
    pub async fn admit_until_decided(&self, name: &str) -> Result<AdmitOutcome> {
        let mut conflicts = 0;
        loop {
            match self.admit(name).await {
                Err(e) if e.is_conflict() && conflicts < self.conflict_retries => {
                    conflicts += 1;
                    warn!(
                        node = %name,
                        conflicts,
                        "Admission lost a concurrent update, re-evaluating from a fresh read"
                    );
                }
                other => return other,
            }
        }
    }
}

/// Build the admitted form of an eligible node.
///
/// The exclusion taint is deduplicated by key so a retried admission can never
/// stack a second taint. The admission counter is bumped in the same write, so
/// two admissions can never commit the same suffix.
pub fn prepare_admission(mut node: Node, markers: &MarkerConfig) -> Result<(Node, u64)> {
    let admission = node_state::admission_counter(&node, markers)? + 1;
    let taints = node_state::with_exclusion_taint(node_state::taints(&node), markers);

    node.spec.get_or_insert_with(NodeSpec::default).taints = Some(taints);

    let labels = node.labels_mut();
    labels.insert(markers.status_label.clone(), IN_PROGRESS.to_string());
    labels.insert(markers.admission_label.clone(), admission.to_string());

    if node.metadata.resource_version.is_none() {
        return Err(Error::Invariant {
            node: node.name_any(),
            message: "fetched node carries no resourceVersion".to_string(),
        });
    }

    Ok((node, admission))
}
