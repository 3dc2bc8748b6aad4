//! One-time provisioning of the identity the watcher jobs run as.
//!
//! The watcher needs to read and update nodes (cluster scoped) and read jobs.
//! Every object is created once; `AlreadyExists` counts as provisioned.

use k8s_openapi::api::core::v1::ServiceAccount;
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding};
use serde_json::json;
use tracing::info;

use crate::cluster::ClusterApi;
use crate::config::CanaryConfig;
use crate::error::{Error, Result};

/// What `ensure_rbac` found or created
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RbacReport {
    pub service_account_created: bool,
    pub cluster_role_created: bool,
    pub binding_created: bool,
}

fn managed_labels() -> serde_json::Value {
    json!({ "app.kubernetes.io/managed-by": "canary-operator" })
}

pub fn build_service_account(config: &CanaryConfig) -> Result<ServiceAccount> {
    serde_json::from_value(json!({
        "apiVersion": "v1",
        "kind": "ServiceAccount",
        "metadata": {
            "name": config.jobs.watcher.service_account_name,
            "namespace": config.jobs.namespace,
            "labels": managed_labels()
        }
    }))
    .map_err(Error::from)
}

pub fn build_cluster_role(config: &CanaryConfig) -> Result<ClusterRole> {
    serde_json::from_value(json!({
        "apiVersion": "rbac.authorization.k8s.io/v1",
        "kind": "ClusterRole",
        "metadata": {
            "name": config.rbac.cluster_role_name,
            "labels": managed_labels()
        },
        "rules": [
            {
                "apiGroups": [""],
                "resources": ["nodes"],
                "verbs": ["get", "list", "update", "patch"]
            },
            {
                "apiGroups": ["batch"],
                "resources": ["jobs"],
                "verbs": ["get", "list"]
            }
        ]
    }))
    .map_err(Error::from)
}

pub fn build_cluster_role_binding(config: &CanaryConfig) -> Result<ClusterRoleBinding> {
    serde_json::from_value(json!({
        "apiVersion": "rbac.authorization.k8s.io/v1",
        "kind": "ClusterRoleBinding",
        "metadata": {
            "name": config.rbac.cluster_role_binding_name,
            "labels": managed_labels()
        },
        "roleRef": {
            "apiGroup": "rbac.authorization.k8s.io",
            "kind": "ClusterRole",
            "name": config.rbac.cluster_role_name
        },
        "subjects": [{
            "kind": "ServiceAccount",
            "name": config.jobs.watcher.service_account_name,
            "namespace": config.jobs.namespace
        }]
    }))
    .map_err(Error::from)
}

fn created_or_existing<T>(result: Result<T>, kind: &str, name: &str) -> Result<bool> {
    match result {
        Ok(_) => {
            info!(kind, name, "Created RBAC object");
            Ok(true)
        }
        Err(e) if e.is_already_exists() => {
            info!(kind, name, "RBAC object already exists");
            Ok(false)
        }
        Err(e) => Err(e),
    }
}

/// Create the watcher ServiceAccount, its ClusterRole and the binding
pub async fn ensure_rbac(cluster: &dyn ClusterApi, config: &CanaryConfig) -> Result<RbacReport> {
    let namespace = &config.jobs.namespace;
    let account = build_service_account(config)?;
    let role = build_cluster_role(config)?;
    let binding = build_cluster_role_binding(config)?;

    let service_account_created = created_or_existing(
        cluster.create_service_account(namespace, &account).await,
        "ServiceAccount",
        &config.jobs.watcher.service_account_name,
    )?;
    let cluster_role_created = created_or_existing(
        cluster.create_cluster_role(&role).await,
        "ClusterRole",
        &config.rbac.cluster_role_name,
    )?;
    let binding_created = created_or_existing(
        cluster.create_cluster_role_binding(&binding).await,
        "ClusterRoleBinding",
        &config.rbac.cluster_role_binding_name,
    )?;

    Ok(RbacReport {
        service_account_created,
        cluster_role_created,
        binding_created,
    })
}
