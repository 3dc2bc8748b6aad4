//! `Admitted → Done` transition.
//!
//! Unlike admission, finalization converges to the same end state from any
//! starting point (taint removed by key, label `complete`), so after a lost
//! race it simply re-reads and applies the same removal again. It also repairs
//! the inconsistent pairings: `complete` with a leftover taint, or `in-progress`
//! without one.

use k8s_openapi::api::core::v1::{Node, NodeSpec};
use kube::ResourceExt;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::cluster::ClusterApi;
use crate::config::MarkerConfig;
use crate::error::{Error, Result};
use crate::node_state::{self, COMPLETE};
use crate::retry::RetryPolicy;

#[derive(Debug, Clone)]
pub enum FinalizeOutcome {
    /// This call lifted the exclusion and set `complete`
    Finalized(Node),
    /// The node was already converged; nothing was written
    AlreadyDone(Node),
}

impl FinalizeOutcome {
    pub fn node(&self) -> &Node {
        match self {
            Self::Finalized(node) | Self::AlreadyDone(node) => node,
        }
    }
}

pub struct FinalizationWriter {
    cluster: Arc<dyn ClusterApi>,
    markers: MarkerConfig,
    retry: RetryPolicy,
    conflict_retries: u32,
}

impl FinalizationWriter {
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

    /// Lift the exclusion and mark the node complete
    pub async fn finalize(&self, name: &str) -> Result<FinalizeOutcome> {
        let mut conflicts = 0;
        loop {
            let current = self
                .retry
                .run("get node", || self.cluster.get_node(name))
                .await?;

            let Some(desired) = prepare_finalization(&current, &self.markers) else {
                debug!(node = %name, "Node already finalized");
                return Ok(FinalizeOutcome::AlreadyDone(current));
            };

            match self
                .retry
                .run("replace node", || self.cluster.replace_node(&desired))
                .await
            {
                Ok(updated) => {
                    info!(
                        node = %name,
                        taint = %self.markers.taint_key,
                        "Finalized node: taint removed and labeled {}",
                        COMPLETE
                    );
                    return Ok(FinalizeOutcome::Finalized(updated));
                }
                Err(e) if e.is_conflict() => {
                    conflicts += 1;
                    if conflicts > self.conflict_retries {
                        return Err(Error::Conflict {
                            kind: "Node",
                            name: name.to_string(),
                        });
                    }
                    warn!(node = %name, conflicts, "Finalization lost a concurrent update, retrying");
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// The finalized form of a node, or `None` when it is already converged
pub fn prepare_finalization(node: &Node, markers: &MarkerConfig) -> Option<Node> {
    let labeled_complete =
        node.labels().get(&markers.status_label).map(String::as_str) == Some(COMPLETE);
    if labeled_complete && !node_state::has_exclusion_taint(node, markers) {
        return None;
    }

    let mut desired = node.clone();
    let taints = node_state::without_exclusion_taint(node_state::taints(node), markers);
    desired.spec.get_or_insert_with(NodeSpec::default).taints = Some(taints);
    desired
        .labels_mut()
        .insert(markers.status_label.clone(), COMPLETE.to_string());
    Some(desired)
}
