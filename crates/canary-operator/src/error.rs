//! Error taxonomy for the canary workflow.
//!
//! Every per-node failure maps onto one of these variants so the reconciliation
//! loop can decide whether to retry, re-evaluate, or report and skip the node.

use thiserror::Error;

/// Errors produced by the canary admission, launch, watch and finalize steps
#[derive(Error, Debug)]
pub enum Error {
    /// Transport or server-side failure talking to the API server
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    /// Conditional update lost against a concurrent writer
    #[error("Version conflict updating {kind} {name}")]
    Conflict { kind: &'static str, name: String },

    #[error("{kind} {name} already exists")]
    AlreadyExists { kind: &'static str, name: String },

    #[error("{kind} {name} not found")]
    NotFound { kind: &'static str, name: String },

    /// Canary label carries a value this operator does not recognise
    #[error("Node {node} has unrecognised canary label value '{value}'")]
    UnknownPhase { node: String, value: String },

    /// Zero or several jobs where exactly one was expected, corrupt counters, etc.
    #[error("Invariant violated for node {node}: {message}")]
    Invariant { node: String, message: String },

    #[error("Remediation job {job} for node {node} failed")]
    JobFailed { node: String, job: String },

    #[error("Gave up waiting on remediation job for node {node} after {waited_secs}s")]
    Stuck { node: String, waited_secs: u64 },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Whether retrying the same call after a pause can reasonably succeed.
    ///
    /// Conflicts are not transient: the caller must re-read and
    /// re-decide instead of replaying the write.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Kube(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Result alias used throughout the crate
pub type Result<T, E = Error> = std::result::Result<T, E>;
