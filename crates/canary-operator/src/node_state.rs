//! Canary phase derivation.
//!
//! A node's phase is never stored directly; it is derived from the status label
//! and the exclusion taint. Everything in this module is pure so the writers can
//! re-derive the decision from every fresh read.

use k8s_openapi::api::core::v1::{Node, Taint};
use kube::ResourceExt;
use std::fmt;

use crate::config::MarkerConfig;
use crate::error::{Error, Result};

/// Status label value while remediation is running
pub const IN_PROGRESS: &str = "in-progress";

/// Status label value once the exclusion has been lifted
pub const COMPLETE: &str = "complete";

/// Effect of the exclusion taint
pub const NO_SCHEDULE: &str = "NoSchedule";

/// Canary phase of a node
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Phase {
    /// No status label: the node may be admitted
    Eligible,
    /// Status `in-progress`: excluded and under remediation
    Admitted,
    /// Status `complete`: remediation finished, exclusion lifted
    Done,
    /// Any other status value; never admitted
    Unknown(String),
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Eligible => write!(f, "eligible"),
            Self::Admitted => write!(f, "admitted"),
            Self::Done => write!(f, "done"),
            Self::Unknown(value) => write!(f, "unknown({value})"),
        }
    }
}

/// Classify a node from its label snapshot
pub fn classify(node: &Node, markers: &MarkerConfig) -> Phase {
    match node.labels().get(&markers.status_label).map(String::as_str) {
        None => Phase::Eligible,
        Some(IN_PROGRESS) => Phase::Admitted,
        Some(COMPLETE) => Phase::Done,
        Some(other) => Phase::Unknown(other.to_string()),
    }
}

/// Like [`classify`] but surfaces an unrecognised label as a data-integrity error
pub fn classify_strict(node: &Node, markers: &MarkerConfig) -> Result<Phase> {
    match classify(node, markers) {
        Phase::Unknown(value) => Err(Error::UnknownPhase {
            node: node.name_any(),
            value,
        }),
        phase => Ok(phase),
    }
}

pub fn taints(node: &Node) -> &[Taint] {
    node.spec
        .as_ref()
        .and_then(|spec| spec.taints.as_deref())
        .unwrap_or_default()
}

pub fn has_exclusion_taint(node: &Node, markers: &MarkerConfig) -> bool {
    taints(node).iter().any(|t| t.key == markers.taint_key)
}

/// The label/taint pairing holds: tainted iff admitted
pub fn is_consistent(node: &Node, markers: &MarkerConfig) -> bool {
    let tainted = has_exclusion_taint(node, markers);
    match classify(node, markers) {
        Phase::Admitted => tainted,
        Phase::Done => !tainted,
        Phase::Eligible | Phase::Unknown(_) => true,
    }
}

/// Last committed admission counter; zero when the node was never admitted
pub fn admission_counter(node: &Node, markers: &MarkerConfig) -> Result<u64> {
    match node.labels().get(&markers.admission_label) {
        None => Ok(0),
        Some(raw) => raw.parse::<u64>().map_err(|_| Error::Invariant {
            node: node.name_any(),
            message: format!(
                "admission label {} has non-numeric value '{raw}'",
                markers.admission_label
            ),
        }),
    }
}

pub fn exclusion_taint(markers: &MarkerConfig) -> Taint {
    Taint {
        key: markers.taint_key.clone(),
        effect: NO_SCHEDULE.to_string(),
        ..Default::default()
    }
}

/// Taints with exactly one exclusion taint appended, deduplicated by key
pub fn with_exclusion_taint(current: &[Taint], markers: &MarkerConfig) -> Vec<Taint> {
    let mut taints = without_exclusion_taint(current, markers);
    taints.push(exclusion_taint(markers));
    taints
}

/// Taints with every exclusion-keyed entry removed, order of the rest preserved
pub fn without_exclusion_taint(current: &[Taint], markers: &MarkerConfig) -> Vec<Taint> {
    current
        .iter()
        .filter(|t| t.key != markers.taint_key)
        .cloned()
        .collect()
}
