//! Completion watcher state machine.
//!
//! Runs inside the watcher job bound to one node. It resolves the single
//! remediation job of the admission, polls it to a terminal phase and then
//! finalizes the node:
//!
//! ```text
//! WaitingForJob ──1 match──▶ Polling ──succeeded──▶ Succeeded ──▶ Finalized
//!      │  ▲                    │  ▲                     │
//!      └──┘ 0 matches          └──┘ still running       │
//!      │                       │                        │
//!      ├─ >1 matches ─▶ InvariantViolation              │
//!      │                       └─ failed ─▶ Failed      │
//!      └────── any API error ─▶ RetryBackoff ◀──────────┘ (resumes where it was)
//! ```
//!
//! The whole watch is bounded by `max_wait`; exceeding it ends in `Stuck`.

use k8s_openapi::api::batch::v1::Job;
use kube::ResourceExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::cluster::ClusterApi;
use crate::config::{CanaryConfig, WatcherConfig};
use crate::error::{Error, Result};
use crate::finalize::FinalizationWriter;
use crate::naming::JobNaming;
use crate::retry::RetryPolicy;

/// Externally observed phase of a remediation job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl JobPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

/// Derive the phase from a job's status block
pub fn job_phase(job: &Job) -> JobPhase {
    let Some(status) = job.status.as_ref() else {
        return JobPhase::Pending;
    };

    let condition = |kind: &str| {
        status
            .conditions
            .as_deref()
            .unwrap_or_default()
            .iter()
            .any(|c| c.type_ == kind && c.status == "True")
    };

    if status.succeeded.unwrap_or(0) > 0 || condition("Complete") {
        return JobPhase::Succeeded;
    }
    if condition("Failed") {
        return JobPhase::Failed;
    }
    let backoff_limit = job
        .spec
        .as_ref()
        .and_then(|spec| spec.backoff_limit)
        .unwrap_or(6);
    if status.failed.unwrap_or(0) > backoff_limit {
        return JobPhase::Failed;
    }
    if status.active.unwrap_or(0) > 0 {
        return JobPhase::Running;
    }
    JobPhase::Pending
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchState {
    WaitingForJob,
    Polling { job: String },
    Succeeded { job: String },
    /// An API call failed; resume `resume` after the backoff
    RetryBackoff { resume: Box<WatchState>, error: String },
    Finalized { job: String },
    Failed { job: String },
    Stuck,
    InvariantViolation { matches: Vec<String> },
}

impl WatchState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Finalized { .. } | Self::Failed { .. } | Self::Stuck | Self::InvariantViolation { .. }
        )
    }

    /// A succeeded job whose node is being finalized, possibly between retries
    fn is_finalizing(&self) -> bool {
        match self {
            Self::Succeeded { .. } => true,
            Self::RetryBackoff { resume, .. } => resume.is_finalizing(),
            _ => false,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Self::WaitingForJob => "waiting-for-job",
            Self::Polling { .. } => "polling",
            Self::Succeeded { .. } => "succeeded",
            Self::RetryBackoff { .. } => "retry-backoff",
            Self::Finalized { .. } => "finalized",
            Self::Failed { .. } => "failed",
            Self::Stuck => "stuck",
            Self::InvariantViolation { .. } => "invariant-violation",
        }
    }
}

/// Node (and optionally admission) a watcher instance is bound to
#[derive(Debug, Clone)]
pub struct WatchTarget {
    pub node: String,
    pub admission: Option<u64>,
    pub namespace: String,
}

/// Summary of a successful watch
#[derive(Debug, Clone)]
pub struct WatchReport {
    pub node: String,
    pub job: String,
    pub elapsed: Duration,
    pub transitions: u32,
}

/// Steps allowed past `max_wait`: one last look at the job, then finishing the
/// finalization of a job seen succeeded
const OVERTIME_STEPS: u32 = 6;

pub struct CompletionWatcher {
    cluster: Arc<dyn ClusterApi>,
    finalizer: FinalizationWriter,
    timing: WatcherConfig,
    target: WatchTarget,
}

impl CompletionWatcher {
    #[must_use]
    pub fn new(cluster: Arc<dyn ClusterApi>, config: &CanaryConfig, target: WatchTarget) -> Self {
        // The watcher owns its retry loop, so the finalizer's calls are single attempts
        let finalizer = FinalizationWriter::new(
            cluster.clone(),
            config.markers.clone(),
            RetryPolicy::none(),
            config.retry.conflict_retries,
        );
        Self {
            cluster,
            finalizer,
            timing: config.watcher.clone(),
            target,
        }
    }

    /// Perform one transition. Never sleeps.
    pub async fn step(&self, state: WatchState) -> WatchState {
        let node = &self.target.node;
        match state {
            WatchState::WaitingForJob => {
                let selector = JobNaming::remediation_selector(node, self.target.admission);
                match self.cluster.list_jobs(&self.target.namespace, &selector).await {
                    Ok(jobs) => self.resolve_job(jobs),
                    Err(e) => Self::backoff(WatchState::WaitingForJob, &e),
                }
            }
            WatchState::Polling { job } => {
                match self.cluster.get_job(&self.target.namespace, &job).await {
                    Ok(current) => Self::after_poll(job, job_phase(&current)),
                    Err(e) => Self::backoff(WatchState::Polling { job }, &e),
                }
            }
            WatchState::Succeeded { job } => match self.finalizer.finalize(node).await {
                Ok(_) => WatchState::Finalized { job },
                Err(e) => Self::backoff(WatchState::Succeeded { job }, &e),
            },
            WatchState::RetryBackoff { resume, .. } => *resume,
            terminal => terminal,
        }
    }

    fn resolve_job(&self, jobs: Vec<Job>) -> WatchState {
        match jobs.as_slice() {
            [] => {
                debug!(node = %self.target.node, "Remediation job not visible yet");
                WatchState::WaitingForJob
            }
            [job] => {
                let name = job.name_any();
                info!(node = %self.target.node, job = %name, "Resolved remediation job");
                Self::after_poll(name, job_phase(job))
            }
            many => WatchState::InvariantViolation {
                matches: many.iter().map(ResourceExt::name_any).collect(),
            },
        }
    }

    fn after_poll(job: String, phase: JobPhase) -> WatchState {
        match phase {
            JobPhase::Succeeded => WatchState::Succeeded { job },
            JobPhase::Failed => WatchState::Failed { job },
            JobPhase::Pending | JobPhase::Running => WatchState::Polling { job },
        }
    }

    fn backoff(resume: WatchState, error: &Error) -> WatchState {
        WatchState::RetryBackoff {
            resume: Box::new(resume),
            error: error.to_string(),
        }
    }

    /// Pause before acting on `state`
    fn delay_before(&self, state: &WatchState) -> Duration {
        match state {
            WatchState::WaitingForJob => self.timing.job_wait_interval(),
            WatchState::Polling { .. } => self.timing.poll_interval(),
            WatchState::RetryBackoff { .. } => self.timing.retry_backoff(),
            _ => Duration::ZERO,
        }
    }

    /// Drive the state machine to a terminal state
    pub async fn run(&self) -> Result<WatchReport> {
        let node = self.target.node.clone();
        let started = Instant::now();
        let max_wait = self.timing.max_wait();
        let mut state = WatchState::WaitingForJob;
        let mut transitions = 0u32;
        let mut consecutive_errors = 0u32;
        let mut overtime_steps = 0u32;

        info!(
            node = %node,
            admission = ?self.target.admission,
            namespace = %self.target.namespace,
            "Watching remediation job"
        );

        while !state.is_terminal() {
            let overtime = started.elapsed() >= max_wait;
            if overtime {
                overtime_steps += 1;
                if overtime_steps > OVERTIME_STEPS {
                    state = WatchState::Stuck;
                    break;
                }
            }

            let previous = state.name();
            state = self.step(state).await;
            transitions += 1;

            if let WatchState::RetryBackoff { error, .. } = &state {
                consecutive_errors += 1;
                warn!(node = %node, from = previous, consecutive_errors, error = %error, "API error, backing off");
            } else {
                consecutive_errors = 0;
                if previous != state.name() {
                    info!(node = %node, from = previous, to = state.name(), "Watcher transition");
                }
            }

            if overtime && !state.is_terminal() && !state.is_finalizing() {
                state = WatchState::Stuck;
                break;
            }

            if !state.is_terminal() {
                let delay = self.delay_before(&state);
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
            }
        }

        match state {
            WatchState::Finalized { job } => {
                info!(node = %node, job = %job, "Remediation complete, node finalized");
                Ok(WatchReport {
                    node,
                    job,
                    elapsed: started.elapsed(),
                    transitions,
                })
            }
            WatchState::Failed { job } => {
                error!(
                    node = %node,
                    job = %job,
                    "Remediation job failed; node stays excluded until an operator intervenes"
                );
                Err(Error::JobFailed { node, job })
            }
            WatchState::InvariantViolation { matches } => {
                error!(node = %node, jobs = ?matches, "Multiple remediation jobs match this node");
                Err(Error::Invariant {
                    node,
                    message: format!(
                        "expected exactly one remediation job, found {}: {}",
                        matches.len(),
                        matches.join(", ")
                    ),
                })
            }
            _ => {
                let waited_secs = started.elapsed().as_secs();
                error!(node = %node, waited_secs, "Gave up waiting for the remediation job");
                Err(Error::Stuck { node, waited_secs })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::MockClusterApi;
    use crate::node_state::fixtures::node;
    use k8s_openapi::api::batch::v1::{JobCondition, JobSpec, JobStatus};
    use kube::api::ObjectMeta;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn job(name: &str, status: JobStatus) -> Job {
        Job {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            spec: Some(JobSpec {
                backoff_limit: Some(3),
                ..Default::default()
            }),
            status: Some(status),
        }
    }

    fn running() -> JobStatus {
        JobStatus {
            active: Some(1),
            ..Default::default()
        }
    }

    fn succeeded() -> JobStatus {
        JobStatus {
            succeeded: Some(1),
            ..Default::default()
        }
    }

    fn watcher(mock: MockClusterApi, max_wait_seconds: u64) -> CompletionWatcher {
        let mut config = CanaryConfig::default();
        config.watcher.max_wait_seconds = max_wait_seconds;
        CompletionWatcher::new(
            Arc::new(mock),
            &config,
            WatchTarget {
                node: "win-01".to_string(),
                admission: Some(1),
                namespace: "default".to_string(),
            },
        )
    }

    #[test]
    fn phase_from_status() {
        assert_eq!(job_phase(&job("j", JobStatus::default())), JobPhase::Pending);
        assert_eq!(job_phase(&job("j", running())), JobPhase::Running);
        assert_eq!(job_phase(&job("j", succeeded())), JobPhase::Succeeded);
        let failed_condition = JobStatus {
            conditions: Some(vec![JobCondition {
                type_: "Failed".to_string(),
                status: "True".to_string(),
                ..Default::default()
            }]),
            ..Default::default()
        };
        assert_eq!(job_phase(&job("j", failed_condition)), JobPhase::Failed);
        let retries_exhausted = JobStatus {
            failed: Some(4),
            ..Default::default()
        };
        assert_eq!(job_phase(&job("j", retries_exhausted)), JobPhase::Failed);
        let retrying = JobStatus {
            failed: Some(2),
            active: Some(1),
            ..Default::default()
        };
        assert_eq!(job_phase(&job("j", retrying)), JobPhase::Running);
    }

    #[tokio::test(start_paused = true)]
    async fn waits_for_job_then_finalizes() {
        let lists = AtomicU32::new(0);
        let mut mock = MockClusterApi::new();
        mock.expect_list_jobs()
            .withf(|ns, sel| {
                ns == "default"
                    && sel == "app=canary-remediation,canary-node=win-01,canary-admission=1"
            })
            .returning(move |_, _| {
                if lists.fetch_add(1, Ordering::SeqCst) == 0 {
                    Ok(vec![])
                } else {
                    Ok(vec![job("canary-remediate-win-01-1", running())])
                }
            });
        let polls = AtomicU32::new(0);
        mock.expect_get_job().returning(move |_, name| {
            if polls.fetch_add(1, Ordering::SeqCst) < 2 {
                Ok(job(name, running()))
            } else {
                Ok(job(name, succeeded()))
            }
        });
        mock.expect_get_node()
            .returning(|name| Ok(node(name, &[("canary-status", "in-progress")], &["canary"])));
        mock.expect_replace_node()
            .times(1)
            .returning(|n| Ok(n.clone()));

        let report = watcher(mock, 3600).run().await.unwrap();
        assert_eq!(report.job, "canary-remediate-win-01-1");
        assert_eq!(report.node, "win-01");
    }

    #[tokio::test(start_paused = true)]
    async fn multiple_jobs_are_an_invariant_violation() {
        let mut mock = MockClusterApi::new();
        mock.expect_list_jobs().returning(|_, _| {
            Ok(vec![
                job("canary-remediate-win-01-1", succeeded()),
                job("canary-remediate-win-01-1b", succeeded()),
            ])
        });
        mock.expect_replace_node().never();

        let err = watcher(mock, 3600).run().await.unwrap_err();
        assert!(matches!(err, Error::Invariant { ref node, .. } if node == "win-01"));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_job_is_reported_without_finalizing() {
        let mut mock = MockClusterApi::new();
        mock.expect_list_jobs().returning(|_, _| {
            Ok(vec![job(
                "canary-remediate-win-01-1",
                JobStatus {
                    failed: Some(4),
                    ..Default::default()
                },
            )])
        });
        mock.expect_get_node().never();
        mock.expect_replace_node().never();

        let err = watcher(mock, 3600).run().await.unwrap_err();
        match err {
            Error::JobFailed { node, job } => {
                assert_eq!(node, "win-01");
                assert_eq!(job, "canary-remediate-win-01-1");
            }
            other => panic!("expected JobFailed, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_wait() {
        let mut mock = MockClusterApi::new();
        mock.expect_list_jobs()
            .returning(|_, _| Ok(vec![job("canary-remediate-win-01-1", running())]));
        mock.expect_get_job().returning(|_, name| Ok(job(name, running())));
        mock.expect_replace_node().never();

        let err = watcher(mock, 120).run().await.unwrap_err();
        assert!(matches!(err, Error::Stuck { waited_secs, .. } if waited_secs >= 120));
    }

    #[tokio::test]
    async fn api_errors_back_off_and_resume() {
        let mut mock = MockClusterApi::new();
        mock.expect_get_job().returning(|_, name| {
            Err(Error::NotFound {
                kind: "Job",
                name: name.to_string(),
            })
        });
        let w = watcher(mock, 3600);

        let polling = WatchState::Polling {
            job: "canary-remediate-win-01-1".to_string(),
        };
        let next = w.step(polling.clone()).await;
        assert!(matches!(next, WatchState::RetryBackoff { .. }));
        assert_eq!(w.step(next).await, polling);
    }

    #[tokio::test(start_paused = true)]
    async fn success_seen_at_the_deadline_is_still_finalized() {
        let mut mock = MockClusterApi::new();
        mock.expect_list_jobs()
            .returning(|_, _| Ok(vec![job("canary-remediate-win-01-1", running())]));
        let polls = AtomicU32::new(0);
        // Running at 10s, succeeded on the poll at the 20s deadline
        mock.expect_get_job().returning(move |_, name| {
            if polls.fetch_add(1, Ordering::SeqCst) == 0 {
                Ok(job(name, running()))
            } else {
                Ok(job(name, succeeded()))
            }
        });
        mock.expect_get_node()
            .returning(|name| Ok(node(name, &[("canary-status", "in-progress")], &["canary"])));
        mock.expect_replace_node().times(1).returning(|n| Ok(n.clone()));

        let report = watcher(mock, 20).run().await.unwrap();
        assert_eq!(report.job, "canary-remediate-win-01-1");
    }

    #[tokio::test(start_paused = true)]
    async fn finalization_backoff_past_the_deadline_completes() {
        let mut mock = MockClusterApi::new();
        mock.expect_list_jobs()
            .returning(|_, _| Ok(vec![job("canary-remediate-win-01-1", succeeded())]));
        mock.expect_get_node()
            .returning(|name| Ok(node(name, &[("canary-status", "in-progress")], &["canary"])));
        let writes = AtomicU32::new(0);
        // First write hits an unavailable API server; the 30s backoff overruns max_wait
        mock.expect_replace_node().times(2).returning(move |n| {
            if writes.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(Error::Kube(kube::Error::Api(kube::core::ErrorResponse {
                    status: "Failure".to_string(),
                    message: "unavailable".to_string(),
                    reason: "ServiceUnavailable".to_string(),
                    code: 503,
                })))
            } else {
                Ok(n.clone())
            }
        });

        let report = watcher(mock, 20).run().await.unwrap();
        assert!(report.elapsed >= Duration::from_secs(30));
    }
}
