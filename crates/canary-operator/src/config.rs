//! Operator Configuration
//!
//! Configuration is read from a mounted YAML file (normally `/config/config.yaml`),
//! falls back to defaults when the file is absent, and is then overlaid with the
//! environment inputs the Helm chart injects into the operator and watcher pods.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

use crate::error::{Error, Result};

/// Default mount point for the configuration file
pub const DEFAULT_CONFIG_PATH: &str = "/config/config.yaml";

/// Environment variable that overrides [`DEFAULT_CONFIG_PATH`]
pub const CONFIG_PATH_ENV: &str = "CANARY_CONFIG_PATH";

pub const ENV_SERVICE_ACCOUNT: &str = "CONTROLLER_SERVICE_ACCOUNT";
pub const ENV_CONTROLLER_IMAGE: &str = "CONTROLLER_IMAGE";
pub const ENV_NAMESPACE: &str = "CANARY_NAMESPACE";
pub const ENV_NODE_NAME: &str = "NODE_NAME";
pub const ENV_ADMISSION: &str = "CANARY_ADMISSION";

// Operator settings handed to the watcher pod, which mounts no config file
pub const ENV_STATUS_LABEL: &str = "CANARY_STATUS_LABEL";
pub const ENV_ADMISSION_LABEL: &str = "CANARY_ADMISSION_LABEL";
pub const ENV_TAINT_KEY: &str = "CANARY_TAINT_KEY";
pub const ENV_POLL_INTERVAL: &str = "CANARY_POLL_INTERVAL_SECONDS";
pub const ENV_JOB_WAIT_INTERVAL: &str = "CANARY_JOB_WAIT_INTERVAL_SECONDS";
pub const ENV_RETRY_BACKOFF: &str = "CANARY_RETRY_BACKOFF_SECONDS";
pub const ENV_MAX_WAIT: &str = "CANARY_MAX_WAIT_SECONDS";
pub const ENV_RETRY_ATTEMPTS: &str = "CANARY_RETRY_ATTEMPTS";
pub const ENV_RETRY_BACKOFF_MILLIS: &str = "CANARY_RETRY_BACKOFF_MILLIS";
pub const ENV_CONFLICT_RETRIES: &str = "CANARY_CONFLICT_RETRIES";

const DEFAULT_REMEDIATION_IMAGE: &str =
    "mcr.microsoft.com/oss/kubernetes/windows-host-process-containers-base-image:v1.0.0";

/// Main operator configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CanaryConfig {
    /// Label and taint keys that encode the canary phase on a node
    pub markers: MarkerConfig,

    /// Which nodes are scanned and how often
    pub fleet: FleetConfig,

    /// Remediation and watcher job templates
    pub jobs: JobsConfig,

    /// Completion watcher timing
    pub watcher: WatcherConfig,

    /// Retry policy for transient API errors and write conflicts
    pub retry: RetryConfig,

    /// One-time RBAC provisioning for the watcher identity
    pub rbac: RbacConfig,

    /// Health endpoint server
    pub server: ServerConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MarkerConfig {
    /// Label carrying `in-progress` / `complete`
    pub status_label: String,

    /// Label carrying the per-node admission counter
    pub admission_label: String,

    /// Key of the `NoSchedule` exclusion taint
    pub taint_key: String,
}

impl Default for MarkerConfig {
    fn default() -> Self {
        Self {
            status_label: "canary-status".to_string(),
            admission_label: "canary-admission".to_string(),
            taint_key: "canary".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct FleetConfig {
    /// Label selector choosing the fleet (e.g. `kubernetes.io/os=windows`)
    pub node_selector: String,

    /// Pause between fleet scans
    pub scan_interval_seconds: u64,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            node_selector: "kubernetes.io/os=windows".to_string(),
            scan_interval_seconds: 60,
        }
    }
}

impl FleetConfig {
    pub fn scan_interval(&self) -> Duration {
        Duration::from_secs(self.scan_interval_seconds)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct JobsConfig {
    /// Namespace the remediation and watcher jobs are created in
    pub namespace: String,

    /// Job `backoffLimit` for both jobs
    pub backoff_limit: i32,

    /// Extra node selector terms added next to the node affinity pin
    pub extra_node_selector: BTreeMap<String, String>,

    pub remediation: RemediationJobConfig,

    pub watcher: WatcherJobConfig,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            namespace: "default".to_string(),
            backoff_limit: 3,
            extra_node_selector: BTreeMap::new(),
            remediation: RemediationJobConfig::default(),
            watcher: WatcherJobConfig::default(),
        }
    }
}

/// Payload executed on the node. Its content is opaque to the operator.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RemediationJobConfig {
    pub image: String,
    pub command: Vec<String>,
    pub args: Vec<String>,

    /// Run as a Windows HostProcess container
    pub host_process: bool,

    /// Windows identity for HostProcess containers
    pub run_as_user_name: Option<String>,
}

impl Default for RemediationJobConfig {
    fn default() -> Self {
        Self {
            image: DEFAULT_REMEDIATION_IMAGE.to_string(),
            command: vec!["powershell".to_string()],
            args: vec![
                "reg add 'HKEY_LOCAL_MACHINE\\SOFTWARE\\Microsoft\\Windows Defender\\Signature Updates' /v FallbackOrder /t REG_SZ /d 'FileShares' /f;".to_string(),
                "reg add 'HKEY_LOCAL_MACHINE\\SOFTWARE\\Microsoft\\Windows Defender\\Signature Updates' /v SignatureUpdateInterval /t REG_DWORD /d 0 /f;".to_string(),
            ],
            host_process: true,
            run_as_user_name: Some("NT AUTHORITY\\SYSTEM".to_string()),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct WatcherJobConfig {
    /// Image containing the `canary-watcher` binary
    pub image: String,

    /// Identity the watcher uses to lift the taint
    pub service_account_name: String,
}

impl Default for WatcherJobConfig {
    fn default() -> Self {
        Self {
            image: String::new(),
            service_account_name: "canary-operator".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct WatcherConfig {
    /// Interval between job status polls
    pub poll_interval_seconds: u64,

    /// Interval between lookups while the job is not yet visible
    pub job_wait_interval_seconds: u64,

    /// Pause after a failed API call before resuming
    pub retry_backoff_seconds: u64,

    /// Upper bound on the whole watch before reporting the node stuck
    pub max_wait_seconds: u64,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval_seconds: 10,
            job_wait_interval_seconds: 15,
            retry_backoff_seconds: 30,
            max_wait_seconds: 4 * 60 * 60,
        }
    }
}

impl WatcherConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_seconds)
    }

    pub fn job_wait_interval(&self) -> Duration {
        Duration::from_secs(self.job_wait_interval_seconds)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_secs(self.retry_backoff_seconds)
    }

    pub fn max_wait(&self) -> Duration {
        Duration::from_secs(self.max_wait_seconds)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RetryConfig {
    /// Attempts per API call for transient errors (including the first)
    pub attempts: u32,

    /// Fixed pause between attempts
    pub backoff_millis: u64,

    /// Re-read/re-decide rounds after losing a conditional update
    pub conflict_retries: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff_millis: 2_000,
            conflict_retries: 5,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RbacConfig {
    /// Create the watcher ServiceAccount, ClusterRole and binding at startup
    pub provision: bool,
    pub cluster_role_name: String,
    pub cluster_role_binding_name: String,
}

impl Default for RbacConfig {
    fn default() -> Self {
        Self {
            provision: false,
            cluster_role_name: "canary-node-finalizer".to_string(),
            cluster_role_binding_name: "canary-node-finalizer".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ServerConfig {
    pub bind_address: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
        }
    }
}

impl CanaryConfig {
    /// Load configuration from a mounted file
    pub fn from_mounted_file(config_path: &str) -> Result<Self> {
        let config_str = std::fs::read_to_string(config_path)
            .map_err(|e| Error::Config(format!("Failed to read config file {config_path}: {e}")))?;

        serde_yaml::from_str(&config_str)
            .map_err(|e| Error::Config(format!("Failed to parse config YAML: {e}")))
    }

    /// Load from `CANARY_CONFIG_PATH` or the default mount, using defaults when
    /// neither exists, then apply environment overrides.
    pub fn load() -> Result<Self> {
        let override_path = std::env::var(CONFIG_PATH_ENV).ok();
        let config_path = override_path.as_deref().unwrap_or(DEFAULT_CONFIG_PATH);

        let mut config = if Path::new(config_path).exists() {
            let cfg = Self::from_mounted_file(config_path)?;
            info!(path = %config_path, "Loaded canary configuration");
            cfg
        } else {
            warn!(path = %config_path, "Configuration file not found, using defaults");
            Self::default()
        };

        config.apply_env();
        Ok(config)
    }

    /// Overlay the environment inputs injected by the deployment
    pub fn apply_env(&mut self) {
        self.apply_overrides(non_empty_env);
    }

    /// Overlay values from `lookup`, keyed by the `ENV_*` names. Blank values
    /// are ignored, as are numbers that do not parse.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let lookup = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(account) = lookup(ENV_SERVICE_ACCOUNT) {
            self.jobs.watcher.service_account_name = account;
        }
        if let Some(image) = lookup(ENV_CONTROLLER_IMAGE) {
            self.jobs.watcher.image = image;
        }
        if let Some(namespace) = lookup(ENV_NAMESPACE) {
            self.jobs.namespace = namespace;
        }

        if let Some(label) = lookup(ENV_STATUS_LABEL) {
            self.markers.status_label = label;
        }
        if let Some(label) = lookup(ENV_ADMISSION_LABEL) {
            self.markers.admission_label = label;
        }
        if let Some(key) = lookup(ENV_TAINT_KEY) {
            self.markers.taint_key = key;
        }

        let watcher = &mut self.watcher;
        override_number(&lookup, ENV_POLL_INTERVAL, &mut watcher.poll_interval_seconds);
        override_number(&lookup, ENV_JOB_WAIT_INTERVAL, &mut watcher.job_wait_interval_seconds);
        override_number(&lookup, ENV_RETRY_BACKOFF, &mut watcher.retry_backoff_seconds);
        override_number(&lookup, ENV_MAX_WAIT, &mut watcher.max_wait_seconds);

        let retry = &mut self.retry;
        override_number(&lookup, ENV_RETRY_ATTEMPTS, &mut retry.attempts);
        override_number(&lookup, ENV_RETRY_BACKOFF_MILLIS, &mut retry.backoff_millis);
        override_number(&lookup, ENV_CONFLICT_RETRIES, &mut retry.conflict_retries);
    }

    /// Environment for the watcher pod, so it finalizes with the same markers,
    /// timing and retry budgets as the operator that admitted the node
    pub fn watcher_env(&self) -> Vec<(&'static str, String)> {
        vec![
            (ENV_NAMESPACE, self.jobs.namespace.clone()),
            (ENV_STATUS_LABEL, self.markers.status_label.clone()),
            (ENV_ADMISSION_LABEL, self.markers.admission_label.clone()),
            (ENV_TAINT_KEY, self.markers.taint_key.clone()),
            (ENV_POLL_INTERVAL, self.watcher.poll_interval_seconds.to_string()),
            (
                ENV_JOB_WAIT_INTERVAL,
                self.watcher.job_wait_interval_seconds.to_string(),
            ),
            (ENV_RETRY_BACKOFF, self.watcher.retry_backoff_seconds.to_string()),
            (ENV_MAX_WAIT, self.watcher.max_wait_seconds.to_string()),
            (ENV_RETRY_ATTEMPTS, self.retry.attempts.to_string()),
            (ENV_RETRY_BACKOFF_MILLIS, self.retry.backoff_millis.to_string()),
            (ENV_CONFLICT_RETRIES, self.retry.conflict_retries.to_string()),
        ]
    }

    /// Check the fields the operator cannot work without
    pub fn validate(&self) -> Result<()> {
        let markers = &self.markers;
        for (field, value) in [
            ("markers.statusLabel", &markers.status_label),
            ("markers.admissionLabel", &markers.admission_label),
            ("markers.taintKey", &markers.taint_key),
            ("jobs.namespace", &self.jobs.namespace),
            ("jobs.remediation.image", &self.jobs.remediation.image),
        ] {
            if value.trim().is_empty() {
                return Err(Error::Config(format!("{field} must not be empty")));
            }
        }

        if markers.status_label == markers.admission_label {
            return Err(Error::Config(
                "markers.statusLabel and markers.admissionLabel must differ".to_string(),
            ));
        }

        if self.retry.attempts == 0 {
            return Err(Error::Config("retry.attempts must be at least 1".to_string()));
        }

        if self.watcher.poll_interval_seconds == 0 {
            return Err(Error::Config(
                "watcher.pollIntervalSeconds must be greater than zero".to_string(),
            ));
        }

        Ok(())
    }

    /// Additional checks for the admitting operator, which must be able to
    /// launch the watcher job
    pub fn validate_for_operator(&self) -> Result<()> {
        self.validate()?;

        if self.jobs.watcher.image.trim().is_empty() {
            return Err(Error::Config(format!(
                "jobs.watcher.image is not set; provide it in the config file or via {ENV_CONTROLLER_IMAGE}"
            )));
        }
        if self.jobs.watcher.service_account_name.trim().is_empty() {
            return Err(Error::Config(format!(
                "jobs.watcher.serviceAccountName is not set; provide it via {ENV_SERVICE_ACCOUNT}"
            )));
        }

        Ok(())
    }
}

fn override_number<T: std::str::FromStr>(
    lookup: impl Fn(&str) -> Option<String>,
    key: &str,
    target: &mut T,
) {
    let Some(raw) = lookup(key) else {
        return;
    };
    match raw.trim().parse() {
        Ok(value) => *target = value,
        Err(_) => warn!(key = %key, value = %raw, "Ignoring non-numeric override"),
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}
