//! Cluster control-plane seam.
//!
//! The workflow only ever talks to the API server through [`ClusterApi`], which
//! keeps the compare-and-set semantics explicit and lets tests substitute a mock
//! or an in-memory cluster.

use async_trait::async_trait;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{Node, ServiceAccount};
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding};
use kube::api::{Api, ListParams, PostParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config, ResourceExt};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// Operations the canary workflow needs from the control plane
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// List nodes matching a label selector
    async fn list_nodes(&self, label_selector: &str) -> Result<Vec<Node>>;

    async fn get_node(&self, name: &str) -> Result<Node>;

    /// Replace a node, conditional on `metadata.resourceVersion`.
    ///
    /// Returns [`Error::Conflict`] when another writer got there first.
    async fn replace_node(&self, node: &Node) -> Result<Node>;

    async fn list_jobs(&self, namespace: &str, label_selector: &str) -> Result<Vec<Job>>;

    async fn get_job(&self, namespace: &str, name: &str) -> Result<Job>;

    /// Create a job; [`Error::AlreadyExists`] if the name is taken
    async fn create_job(&self, namespace: &str, job: &Job) -> Result<Job>;

    async fn create_service_account(
        &self,
        namespace: &str,
        account: &ServiceAccount,
    ) -> Result<ServiceAccount>;

    async fn create_cluster_role(&self, role: &ClusterRole) -> Result<ClusterRole>;

    async fn create_cluster_role_binding(
        &self,
        binding: &ClusterRoleBinding,
    ) -> Result<ClusterRoleBinding>;
}

/// [`ClusterApi`] backed by a live `kube::Client`
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
}

impl KubeCluster {
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }
}

/// Translate API status codes into the workflow's error taxonomy
fn classify_kube_error(err: kube::Error, kind: &'static str, name: &str) -> Error {
    match err {
        kube::Error::Api(ae) if ae.code == 409 && ae.reason == "AlreadyExists" => {
            Error::AlreadyExists {
                kind,
                name: name.to_string(),
            }
        }
        kube::Error::Api(ae) if ae.code == 409 => Error::Conflict {
            kind,
            name: name.to_string(),
        },
        kube::Error::Api(ae) if ae.code == 404 => Error::NotFound {
            kind,
            name: name.to_string(),
        },
        other => Error::Kube(other),
    }
}

#[async_trait]
impl ClusterApi for KubeCluster {
    async fn list_nodes(&self, label_selector: &str) -> Result<Vec<Node>> {
        let nodes: Api<Node> = Api::all(self.client.clone());
        let list = nodes
            .list(&ListParams::default().labels(label_selector))
            .await
            .map_err(|e| classify_kube_error(e, "NodeList", label_selector))?;
        debug!(selector = %label_selector, count = list.items.len(), "Listed nodes");
        Ok(list.items)
    }

    async fn get_node(&self, name: &str) -> Result<Node> {
        let nodes: Api<Node> = Api::all(self.client.clone());
        nodes
            .get(name)
            .await
            .map_err(|e| classify_kube_error(e, "Node", name))
    }

    async fn replace_node(&self, node: &Node) -> Result<Node> {
        let name = node.name_any();
        if node.metadata.resource_version.is_none() {
            // An update without a version token would be an unconditional overwrite
            return Err(Error::Invariant {
                node: name,
                message: "refusing to update node without a resourceVersion".to_string(),
            });
        }
        let nodes: Api<Node> = Api::all(self.client.clone());
        nodes
            .replace(&name, &PostParams::default(), node)
            .await
            .map_err(|e| classify_kube_error(e, "Node", &name))
    }

    async fn list_jobs(&self, namespace: &str, label_selector: &str) -> Result<Vec<Job>> {
        let jobs: Api<Job> = Api::namespaced(self.client.clone(), namespace);
        let list = jobs
            .list(&ListParams::default().labels(label_selector))
            .await
            .map_err(|e| classify_kube_error(e, "JobList", label_selector))?;
        Ok(list.items)
    }

    async fn get_job(&self, namespace: &str, name: &str) -> Result<Job> {
        let jobs: Api<Job> = Api::namespaced(self.client.clone(), namespace);
        jobs.get(name)
            .await
            .map_err(|e| classify_kube_error(e, "Job", name))
    }

    async fn create_job(&self, namespace: &str, job: &Job) -> Result<Job> {
        let name = job.name_any();
        let jobs: Api<Job> = Api::namespaced(self.client.clone(), namespace);
        jobs.create(&PostParams::default(), job)
            .await
            .map_err(|e| classify_kube_error(e, "Job", &name))
    }

    async fn create_service_account(
        &self,
        namespace: &str,
        account: &ServiceAccount,
    ) -> Result<ServiceAccount> {
        let name = account.name_any();
        let accounts: Api<ServiceAccount> = Api::namespaced(self.client.clone(), namespace);
        accounts
            .create(&PostParams::default(), account)
            .await
            .map_err(|e| classify_kube_error(e, "ServiceAccount", &name))
    }

    async fn create_cluster_role(&self, role: &ClusterRole) -> Result<ClusterRole> {
        let name = role.name_any();
        let roles: Api<ClusterRole> = Api::all(self.client.clone());
        roles
            .create(&PostParams::default(), role)
            .await
            .map_err(|e| classify_kube_error(e, "ClusterRole", &name))
    }

    async fn create_cluster_role_binding(
        &self,
        binding: &ClusterRoleBinding,
    ) -> Result<ClusterRoleBinding> {
        let name = binding.name_any();
        let bindings: Api<ClusterRoleBinding> = Api::all(self.client.clone());
        bindings
            .create(&PostParams::default(), binding)
            .await
            .map_err(|e| classify_kube_error(e, "ClusterRoleBinding", &name))
    }
}

/// Build a client: in-cluster first, then the explicit kubeconfig override,
/// then the usual inference chain.
///
/// Failure here is the only fatal authorization/configuration error; it only
/// happens at process startup.
pub async fn connect(kubeconfig_override: Option<&str>) -> Result<Client> {
    let config = match Config::incluster() {
        Ok(config) => {
            info!("Using in-cluster Kubernetes configuration");
            config
        }
        Err(incluster_err) => {
            warn!(error = %incluster_err, "Not running inside a cluster");
            match kubeconfig_override.filter(|p| !p.trim().is_empty()) {
                Some(path) => {
                    info!(path = %path, "Loading kubeconfig override");
                    let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
                        Error::Config(format!("Failed to read kubeconfig {path}: {e}"))
                    })?;
                    Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                        .await
                        .map_err(|e| {
                            Error::Config(format!("Invalid kubeconfig {path}: {e}"))
                        })?
                }
                None => Config::infer()
                    .await
                    .map_err(|e| Error::Config(format!("Failed to infer kube config: {e}")))?,
            }
        }
    };

    Ok(Client::try_from(config)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::ErrorResponse;

    fn api_error(code: u16, reason: &str) -> kube::Error {
        kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: "test".to_string(),
            reason: reason.to_string(),
            code,
        })
    }

    #[test]
    fn maps_status_codes() {
        assert!(classify_kube_error(api_error(409, "Conflict"), "Node", "n").is_conflict());
        assert!(
            classify_kube_error(api_error(409, "AlreadyExists"), "Job", "j").is_already_exists()
        );
        assert!(classify_kube_error(api_error(404, "NotFound"), "Job", "j").is_not_found());
        assert!(classify_kube_error(api_error(503, "ServiceUnavailable"), "Node", "n").is_transient());
    }
}
