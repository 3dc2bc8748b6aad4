//! Remediation and watcher job creation.
//!
//! Both jobs are pinned to the admitted node and tolerate the exclusion taint.
//! Creation is idempotent per `(node, admission)`: the names are deterministic,
//! so an `AlreadyExists` answer means the job is already there and is treated as
//! success once its labels confirm it belongs to the same node and admission.
//! That is what lets the reconciliation consistency check relaunch a missing
//! half without duplicating the other.

use k8s_openapi::api::batch::v1::Job;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{error, info};

use crate::cluster::ClusterApi;
use crate::config::{CanaryConfig, ENV_ADMISSION, ENV_NODE_NAME};
use crate::error::{Error, Result};
use crate::naming::{
    JobNaming, LABEL_ADMISSION, LABEL_APP, LABEL_NODE, REMEDIATION_APP, WATCHER_APP,
};
use crate::retry::RetryPolicy;

/// Which of the two jobs of an admission
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobRole {
    Remediation,
    Watcher,
}

impl JobRole {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Remediation => "remediation",
            Self::Watcher => "watcher",
        }
    }
}

/// Reference to a job owned by one admission
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRef {
    pub name: String,
    pub namespace: String,
    /// `false` when the job already existed
    pub created: bool,
}

/// Outcome of launching both jobs. Either half may fail independently.
#[derive(Debug)]
pub struct LaunchReport {
    pub node: String,
    pub admission: u64,
    pub remediation: Result<JobRef>,
    pub watcher: Result<JobRef>,
}

impl LaunchReport {
    pub fn is_complete(&self) -> bool {
        self.remediation.is_ok() && self.watcher.is_ok()
    }

    /// Collapse into both refs, or the first failure
    pub fn into_refs(self) -> Result<(JobRef, JobRef)> {
        Ok((self.remediation?, self.watcher?))
    }
}

pub struct JobLauncher {
    cluster: Arc<dyn ClusterApi>,
    config: Arc<CanaryConfig>,
    retry: RetryPolicy,
}

impl JobLauncher {
    #[must_use]
    pub fn new(cluster: Arc<dyn ClusterApi>, config: Arc<CanaryConfig>, retry: RetryPolicy) -> Self {
        Self {
            cluster,
            config,
            retry,
        }
    }

    /// Create the remediation job and the completion watcher job for one admission
    pub async fn launch(&self, node: &str, admission: u64) -> LaunchReport {
        let remediation = self.launch_role(JobRole::Remediation, node, admission).await;
        let watcher = self.launch_role(JobRole::Watcher, node, admission).await;

        let report = LaunchReport {
            node: node.to_string(),
            admission,
            remediation,
            watcher,
        };

        if !report.is_complete() {
            error!(
                node = %node,
                admission,
                remediation_ok = report.remediation.is_ok(),
                watcher_ok = report.watcher.is_ok(),
                "Partial job launch; the consistency check will relaunch the missing job"
            );
        }

        report
    }

    /// Create one of the two jobs, treating an existing job of the same name as success
    pub async fn launch_role(&self, role: JobRole, node: &str, admission: u64) -> Result<JobRef> {
        let job = match role {
            JobRole::Remediation => self.build_remediation_job(node, admission)?,
            JobRole::Watcher => self.build_watcher_job(node, admission)?,
        };
        let name = job.metadata.name.clone().unwrap_or_default();
        let namespace = self.config.jobs.namespace.clone();

        let created = self
            .retry
            .run("create job", || self.cluster.create_job(&namespace, &job))
            .await;

        match created {
            Ok(_) => {
                info!(node = %node, job = %name, role = role.as_str(), admission, "Created job");
                Ok(JobRef {
                    name,
                    namespace,
                    created: true,
                })
            }
            Err(e) if e.is_already_exists() => {
                self.verify_existing(node, admission, &namespace, &name).await?;
                info!(node = %node, job = %name, role = role.as_str(), "Job already exists");
                Ok(JobRef {
                    name,
                    namespace,
                    created: false,
                })
            }
            Err(e) => {
                error!(node = %node, job = %name, role = role.as_str(), error = %e, "Failed to create job");
                Err(e)
            }
        }
    }

    /// An existing job only counts when it was launched for this node and admission
    async fn verify_existing(
        &self,
        node: &str,
        admission: u64,
        namespace: &str,
        name: &str,
    ) -> Result<()> {
        let existing = self
            .retry
            .run("get job", || self.cluster.get_job(namespace, name))
            .await?;
        let labels = existing.metadata.labels.unwrap_or_default();
        let owner = labels.get(LABEL_NODE).map(String::as_str);
        let owner_admission = labels.get(LABEL_ADMISSION).map(String::as_str);

        if owner == Some(JobNaming::node_label_value(node).as_str())
            && owner_admission == Some(admission.to_string().as_str())
        {
            return Ok(());
        }

        error!(
            node = %node,
            job = %name,
            owner = owner.unwrap_or("<none>"),
            owner_admission = owner_admission.unwrap_or("<none>"),
            "Existing job belongs to another node or admission"
        );
        Err(Error::Invariant {
            node: node.to_string(),
            message: format!(
                "job {name} already exists for node {} admission {}",
                owner.unwrap_or("<none>"),
                owner_admission.unwrap_or("<none>")
            ),
        })
    }

    fn job_labels(app: &str, node: &str, admission: u64) -> BTreeMap<String, String> {
        let mut labels = BTreeMap::new();
        labels.insert(LABEL_APP.to_string(), app.to_string());
        labels.insert(LABEL_NODE.to_string(), JobNaming::node_label_value(node));
        labels.insert(LABEL_ADMISSION.to_string(), admission.to_string());
        labels.insert(
            "app.kubernetes.io/managed-by".to_string(),
            "canary-operator".to_string(),
        );
        labels
    }

    /// Pin to the node by identity and tolerate the exclusion taint
    fn placement(&self, node: &str) -> serde_json::Value {
        json!({
            "nodeSelector": self.config.jobs.extra_node_selector,
            "affinity": {
                "nodeAffinity": {
                    "requiredDuringSchedulingIgnoredDuringExecution": {
                        "nodeSelectorTerms": [{
                            "matchFields": [{
                                "key": "metadata.name",
                                "operator": "In",
                                "values": [node]
                            }]
                        }]
                    }
                }
            },
            "tolerations": [{
                "key": self.config.markers.taint_key,
                "operator": "Exists",
                "effect": crate::node_state::NO_SCHEDULE
            }]
        })
    }

    pub fn build_remediation_job(&self, node: &str, admission: u64) -> Result<Job> {
        let name = JobNaming::remediation_job_name(node, admission);
        let labels = Self::job_labels(REMEDIATION_APP, node, admission);
        let remediation = &self.config.jobs.remediation;

        let mut container = json!({
            "name": "remediate",
            "image": remediation.image,
            "command": remediation.command,
            "args": remediation.args,
        });
        if remediation.host_process {
            container["securityContext"] = json!({
                "windowsOptions": {
                    "hostProcess": true,
                    "runAsUserName": remediation.run_as_user_name
                }
            });
        }

        let mut pod_spec = self.placement(node);
        pod_spec["restartPolicy"] = json!("OnFailure");
        pod_spec["containers"] = json!([container]);
        if remediation.host_process {
            // HostProcess pods must share the host network namespace
            pod_spec["hostNetwork"] = json!(true);
        }

        self.job_from_spec(&name, &labels, self.config.jobs.backoff_limit, pod_spec)
    }

    /// The watcher runs once: a restart would start a fresh `max_wait` and
    /// report the same terminal outcome again.
    pub fn build_watcher_job(&self, node: &str, admission: u64) -> Result<Job> {
        let name = JobNaming::watcher_job_name(node, admission);
        let labels = Self::job_labels(WATCHER_APP, node, admission);
        let watcher = &self.config.jobs.watcher;

        let mut env = vec![
            json!({ "name": ENV_NODE_NAME, "value": node }),
            json!({ "name": ENV_ADMISSION, "value": admission.to_string() }),
        ];
        env.extend(
            self.config
                .watcher_env()
                .into_iter()
                .map(|(name, value)| json!({ "name": name, "value": value })),
        );

        let container = json!({
            "name": "watch",
            "image": watcher.image,
            "env": env
        });

        let mut pod_spec = self.placement(node);
        pod_spec["restartPolicy"] = json!("Never");
        pod_spec["serviceAccountName"] = json!(watcher.service_account_name);
        pod_spec["containers"] = json!([container]);

        self.job_from_spec(&name, &labels, 0, pod_spec)
    }

    fn job_from_spec(
        &self,
        name: &str,
        labels: &BTreeMap<String, String>,
        backoff_limit: i32,
        pod_spec: serde_json::Value,
    ) -> Result<Job> {
        let job_spec = json!({
            "apiVersion": "batch/v1",
            "kind": "Job",
            "metadata": {
                "name": name,
                "namespace": self.config.jobs.namespace,
                "labels": labels
            },
            "spec": {
                "backoffLimit": backoff_limit,
                "template": {
                    "metadata": { "labels": labels },
                    "spec": pod_spec
                }
            }
        });

        serde_json::from_value(job_spec).map_err(Error::from)
    }
}
