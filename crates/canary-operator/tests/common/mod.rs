//! In-memory cluster with real compare-and-set semantics on nodes.

#![allow(dead_code)]

use async_trait::async_trait;
use canary_operator::{ClusterApi, Error, Result};
use k8s_openapi::api::batch::v1::{Job, JobStatus};
use k8s_openapi::api::core::v1::{Node, NodeSpec, ServiceAccount, Taint};
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding};
use kube::api::ObjectMeta;
use kube::ResourceExt;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

type ReplaceHook = Box<dyn FnOnce(&mut Node) + Send>;

#[derive(Default)]
struct State {
    nodes: BTreeMap<String, Node>,
    jobs: BTreeMap<(String, String), Job>,
    rbac: BTreeSet<String>,
    version: u64,
    node_writes: Vec<String>,
    conflicts: usize,
    failing_job_prefixes: BTreeSet<String>,
    list_nodes_fails: bool,
}

impl State {
    fn next_version(&mut self) -> String {
        self.version += 1;
        self.version.to_string()
    }
}

#[derive(Clone, Default)]
pub struct FakeCluster {
    state: Arc<Mutex<State>>,
    replace_hooks: Arc<Mutex<Vec<ReplaceHook>>>,
}

fn selector_matches(labels: &BTreeMap<String, String>, selector: &str) -> bool {
    selector
        .split(',')
        .filter(|term| !term.is_empty())
        .all(|term| match term.split_once('=') {
            Some((key, value)) => labels.get(key).map(String::as_str) == Some(value),
            None => labels.contains_key(term),
        })
}

fn api_unavailable() -> Error {
    Error::Kube(kube::Error::Api(kube::core::ErrorResponse {
        status: "Failure".to_string(),
        message: "etcdserver: request timed out".to_string(),
        reason: "ServiceUnavailable".to_string(),
        code: 503,
    }))
}

impl FakeCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a fleet node with the given labels and taint keys
    pub fn add_node(&self, name: &str, labels: &[(&str, &str)], taint_keys: &[&str]) {
        let mut all_labels: BTreeMap<String, String> = BTreeMap::new();
        all_labels.insert("kubernetes.io/os".to_string(), "windows".to_string());
        for (k, v) in labels {
            all_labels.insert((*k).to_string(), (*v).to_string());
        }
        let taints = taint_keys
            .iter()
            .map(|key| Taint {
                key: (*key).to_string(),
                effect: "NoSchedule".to_string(),
                ..Default::default()
            })
            .collect();

        let mut state = self.state.lock().unwrap();
        let version = state.next_version();
        state.nodes.insert(
            name.to_string(),
            Node {
                metadata: ObjectMeta {
                    name: Some(name.to_string()),
                    labels: Some(all_labels),
                    resource_version: Some(version),
                    ..Default::default()
                },
                spec: Some(NodeSpec {
                    taints: Some(taints),
                    ..Default::default()
                }),
                status: None,
            },
        );
    }

    pub fn node(&self, name: &str) -> Node {
        self.state.lock().unwrap().nodes[name].clone()
    }

    pub fn taint_keys(&self, name: &str) -> Vec<String> {
        self.node(name)
            .spec
            .and_then(|s| s.taints)
            .unwrap_or_default()
            .into_iter()
            .map(|t| t.key)
            .collect()
    }

    pub fn label(&self, name: &str, key: &str) -> Option<String> {
        self.node(name).labels().get(key).cloned()
    }

    /// Out-of-band edit by an operator or another tool; bumps the version
    pub fn edit_node(&self, name: &str, edit: impl FnOnce(&mut Node)) {
        let mut state = self.state.lock().unwrap();
        let version = state.next_version();
        if let Some(node) = state.nodes.get_mut(name) {
            edit(node);
            node.metadata.resource_version = Some(version);
        }
    }

    /// Run `edit` as a concurrent writer just before the next node replace lands
    pub fn before_next_replace(&self, edit: impl FnOnce(&mut Node) + Send + 'static) {
        self.replace_hooks.lock().unwrap().push(Box::new(edit));
    }

    /// Successful node writes, by node name, in order
    pub fn node_writes(&self) -> Vec<String> {
        self.state.lock().unwrap().node_writes.clone()
    }

    pub fn conflicts(&self) -> usize {
        self.state.lock().unwrap().conflicts
    }

    pub fn jobs(&self) -> Vec<Job> {
        self.state.lock().unwrap().jobs.values().cloned().collect()
    }

    pub fn job_names(&self) -> Vec<String> {
        self.jobs().iter().map(ResourceExt::name_any).collect()
    }

    pub fn set_job_status(&self, name: &str, status: JobStatus) {
        let mut state = self.state.lock().unwrap();
        for ((_, job_name), job) in &mut state.jobs {
            if job_name == name {
                job.status = Some(status.clone());
            }
        }
    }

    pub fn delete_job(&self, name: &str) {
        self.state
            .lock()
            .unwrap()
            .jobs
            .retain(|(_, job_name), _| job_name != name);
    }

    /// Make job creation fail for names starting with `prefix`
    pub fn fail_job_creates(&self, prefix: &str) {
        self.state
            .lock()
            .unwrap()
            .failing_job_prefixes
            .insert(prefix.to_string());
    }

    pub fn clear_job_failures(&self) {
        self.state.lock().unwrap().failing_job_prefixes.clear();
    }

    pub fn set_list_nodes_fails(&self, fails: bool) {
        self.state.lock().unwrap().list_nodes_fails = fails;
    }

    pub fn rbac_objects(&self) -> Vec<String> {
        self.state.lock().unwrap().rbac.iter().cloned().collect()
    }

    fn create_rbac(&self, kind: &'static str, name: String) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if !state.rbac.insert(format!("{kind}/{name}")) {
            return Err(Error::AlreadyExists { kind, name });
        }
        Ok(())
    }
}

#[async_trait]
impl ClusterApi for FakeCluster {
    async fn list_nodes(&self, label_selector: &str) -> Result<Vec<Node>> {
        let state = self.state.lock().unwrap();
        if state.list_nodes_fails {
            return Err(api_unavailable());
        }
        Ok(state
            .nodes
            .values()
            .filter(|n| selector_matches(n.labels(), label_selector))
            .cloned()
            .collect())
    }

    async fn get_node(&self, name: &str) -> Result<Node> {
        // Snapshot first, then yield, so concurrent readers can hold the same version
        let snapshot = self
            .state
            .lock()
            .unwrap()
            .nodes
            .get(name)
            .cloned()
            .ok_or_else(|| Error::NotFound {
                kind: "Node",
                name: name.to_string(),
            });
        tokio::task::yield_now().await;
        snapshot
    }

    async fn replace_node(&self, node: &Node) -> Result<Node> {
        let name = node.name_any();
        let hook = self.replace_hooks.lock().unwrap().pop();
        let mut state = self.state.lock().unwrap();

        if let Some(hook) = hook {
            let version = state.next_version();
            if let Some(stored) = state.nodes.get_mut(&name) {
                hook(stored);
                stored.metadata.resource_version = Some(version);
            }
        }

        let stored_version = state
            .nodes
            .get(&name)
            .ok_or_else(|| Error::NotFound {
                kind: "Node",
                name: name.clone(),
            })?
            .metadata
            .resource_version
            .clone();

        if node.metadata.resource_version != stored_version {
            state.conflicts += 1;
            return Err(Error::Conflict { kind: "Node", name });
        }

        let mut updated = node.clone();
        updated.metadata.resource_version = Some(state.next_version());
        state.nodes.insert(name.clone(), updated.clone());
        state.node_writes.push(name);
        Ok(updated)
    }

    async fn list_jobs(&self, namespace: &str, label_selector: &str) -> Result<Vec<Job>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .jobs
            .iter()
            .filter(|((ns, _), job)| ns == namespace && selector_matches(job.labels(), label_selector))
            .map(|(_, job)| job.clone())
            .collect())
    }

    async fn get_job(&self, namespace: &str, name: &str) -> Result<Job> {
        self.state
            .lock()
            .unwrap()
            .jobs
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| Error::NotFound {
                kind: "Job",
                name: name.to_string(),
            })
    }

    async fn create_job(&self, namespace: &str, job: &Job) -> Result<Job> {
        let name = job.name_any();
        let mut state = self.state.lock().unwrap();
        if state
            .failing_job_prefixes
            .iter()
            .any(|prefix| name.starts_with(prefix.as_str()))
        {
            return Err(Error::NotFound {
                kind: "ServiceAccount",
                name: "canary-operator".to_string(),
            });
        }
        let key = (namespace.to_string(), name.clone());
        if state.jobs.contains_key(&key) {
            return Err(Error::AlreadyExists { kind: "Job", name });
        }
        let mut created = job.clone();
        created.metadata.resource_version = Some(state.next_version());
        created.status = Some(JobStatus::default());
        state.jobs.insert(key, created.clone());
        Ok(created)
    }

    async fn create_service_account(
        &self,
        _namespace: &str,
        account: &ServiceAccount,
    ) -> Result<ServiceAccount> {
        self.create_rbac("ServiceAccount", account.name_any())?;
        Ok(account.clone())
    }

    async fn create_cluster_role(&self, role: &ClusterRole) -> Result<ClusterRole> {
        self.create_rbac("ClusterRole", role.name_any())?;
        Ok(role.clone())
    }

    async fn create_cluster_role_binding(
        &self,
        binding: &ClusterRoleBinding,
    ) -> Result<ClusterRoleBinding> {
        self.create_rbac("ClusterRoleBinding", binding.name_any())?;
        Ok(binding.clone())
    }
}
