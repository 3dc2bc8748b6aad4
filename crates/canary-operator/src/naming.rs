//! Naming conventions for canary jobs.
//!
//! Jobs follow the pattern `canary-{role}-{node}-{admission}`, e.g.
//! `canary-remediate-win-01-3`. The admission counter is the per-admission
//! suffix, so a fresh admission never reuses a name that may still belong to a
//! terminating job from an earlier one.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

const MAX_K8S_NAME_LENGTH: usize = 63;
const MAX_LABEL_VALUE_LENGTH: usize = 63;
const HASH_LENGTH: usize = 8;

pub const REMEDIATION_JOB_PREFIX: &str = "canary-remediate-";
pub const WATCHER_JOB_PREFIX: &str = "canary-watch-";

/// `app` label value on remediation jobs
pub const REMEDIATION_APP: &str = "canary-remediation";

/// `app` label value on watcher jobs
pub const WATCHER_APP: &str = "canary-watcher";

pub const LABEL_APP: &str = "app";
pub const LABEL_NODE: &str = "canary-node";
pub const LABEL_ADMISSION: &str = "canary-admission";

pub struct JobNaming;

impl JobNaming {
    pub fn remediation_job_name(node: &str, admission: u64) -> String {
        Self::job_name(REMEDIATION_JOB_PREFIX, node, admission)
    }

    pub fn watcher_job_name(node: &str, admission: u64) -> String {
        Self::job_name(WATCHER_JOB_PREFIX, node, admission)
    }

    /// Label value identifying the target node on a job
    pub fn node_label_value(node: &str) -> String {
        let sanitized: String = node
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                    c
                } else {
                    '-'
                }
            })
            .collect();

        let sanitized = if sanitized.len() > MAX_LABEL_VALUE_LENGTH {
            let keep = MAX_LABEL_VALUE_LENGTH - HASH_LENGTH - 1;
            format!("{}-{}", &sanitized[..keep], Self::hash_string(node))
        } else {
            sanitized
        };

        sanitized
            .trim_matches(|c: char| !c.is_ascii_alphanumeric())
            .to_string()
    }

    /// Selector for the remediation job(s) of a node, optionally narrowed to
    /// one admission
    pub fn remediation_selector(node: &str, admission: Option<u64>) -> String {
        Self::selector(REMEDIATION_APP, node, admission)
    }

    pub fn watcher_selector(node: &str, admission: Option<u64>) -> String {
        Self::selector(WATCHER_APP, node, admission)
    }

    fn selector(app: &str, node: &str, admission: Option<u64>) -> String {
        let mut selector = format!(
            "{LABEL_APP}={app},{LABEL_NODE}={}",
            Self::node_label_value(node)
        );
        if let Some(admission) = admission {
            selector.push_str(&format!(",{LABEL_ADMISSION}={admission}"));
        }
        selector
    }

    fn job_name(prefix: &str, node: &str, admission: u64) -> String {
        let node_part: String = node
            .to_lowercase()
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
            .collect();
        let suffix = format!("-{admission}");
        let available = MAX_K8S_NAME_LENGTH - prefix.len() - suffix.len();

        // `win.01` and `win-01` sanitize alike, so any rewrite is disambiguated too
        let node_part = if node_part.len() > available || node_part != node {
            // Keep a readable prefix of the node name and disambiguate with a hash
            let keep = available
                .saturating_sub(HASH_LENGTH + 1)
                .min(node_part.len());
            format!(
                "{}-{}",
                node_part[..keep].trim_end_matches('-'),
                Self::hash_string(node)
            )
        } else {
            node_part
        };

        format!("{prefix}{node_part}{suffix}")
    }

    fn hash_string(input: &str) -> String {
        let mut hasher = DefaultHasher::new();
        input.hash(&mut hasher);
        format!("{:016x}", hasher.finish())[..HASH_LENGTH].to_string()
    }
}
