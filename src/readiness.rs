//! Readiness and absence gates built on [`crate::poll`].
//!
//! The watcher answers two questions the migration asks over and over: "is
//! this workload serving?" and "is this pod gone?". Neither treats a missing
//! object as an error; it is simply not ready (or already absent).

use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::Pod;
use tracing::{debug, info, warn};

use crate::cluster::ClusterClient;
use crate::context::RunContext;
use crate::poll::{poll, Attempt, PollBudget, PollOutcome, PollStatus};
use crate::Result;

/// Default budget for a replica set to become fully ready
pub const REPLICA_SET_READY_BUDGET: PollBudget =
    PollBudget::timeout(Duration::from_secs(600), Duration::from_secs(10));

/// Default budget for a replacement node to become ready
pub const NODE_READY_BUDGET: PollBudget =
    PollBudget::timeout(Duration::from_secs(300), Duration::from_secs(10));

/// Default budget for a scaled-away pod to disappear
pub const POD_ABSENT_BUDGET: PollBudget = PollBudget::attempts(30, Duration::from_secs(2));

/// What to wait on.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReadinessTarget {
    /// The ordinal replica set (StatefulSet)
    ReplicaSet {
        /// StatefulSet name
        name: String,
    },
    /// A per-node resource, observed through the pod it creates
    Node {
        /// Pod name
        pod_name: String,
    },
}

impl ReadinessTarget {
    fn name(&self) -> &str {
        match self {
            ReadinessTarget::ReplicaSet { name } => name,
            ReadinessTarget::Node { pod_name } => pod_name,
        }
    }
}

/// Desired vs ready replicas of a target
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReplicaStatus {
    /// Replicas the spec asks for
    pub desired: i32,
    /// Replicas reporting ready
    pub ready: i32,
}

impl ReplicaStatus {
    /// Ready count has caught up with desired count
    pub fn is_ready(&self) -> bool {
        self.ready == self.desired
    }

    /// Status of a StatefulSet
    pub fn of_statefulset(sts: &StatefulSet) -> Self {
        Self {
            desired: sts.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1),
            ready: sts
                .status
                .as_ref()
                .and_then(|s| s.ready_replicas)
                .unwrap_or(0),
        }
    }

    /// Status of a single-pod node
    pub fn of_pod(pod: &Pod) -> Self {
        Self {
            desired: 1,
            ready: i32::from(pod_is_available(pod)),
        }
    }
}

/// Whether a pod is running with every container ready
pub fn pod_is_available(pod: &Pod) -> bool {
    let Some(status) = pod.status.as_ref() else {
        return false;
    };
    if status.phase.as_deref() != Some("Running") {
        return false;
    }
    match status.container_statuses.as_ref() {
        Some(containers) if !containers.is_empty() => containers.iter().all(|c| c.ready),
        _ => false,
    }
}

/// One-line summary of a pod for diagnostics
pub fn describe_pod(pod: &Pod) -> String {
    let name = pod.metadata.name.as_deref().unwrap_or("<unnamed>");
    let status = pod.status.as_ref();
    let phase = status
        .and_then(|s| s.phase.as_deref())
        .unwrap_or("Unknown");
    let conditions = status
        .and_then(|s| s.conditions.as_ref())
        .map(|conds| {
            conds
                .iter()
                .map(|c| format!("{}={}", c.type_, c.status))
                .collect::<Vec<_>>()
                .join(",")
        })
        .unwrap_or_default();
    format!("{} phase={} conditions=[{}]", name, phase, conditions)
}

/// Gates migration steps on observed cluster state.
pub struct ClusterReadinessWatcher {
    cluster: Arc<dyn ClusterClient>,
    namespace: String,
    pod_selector: String,
}

impl ClusterReadinessWatcher {
    /// Create a watcher for `namespace`
    pub fn new(
        cluster: Arc<dyn ClusterClient>,
        namespace: impl Into<String>,
        pod_selector: impl Into<String>,
    ) -> Self {
        Self {
            cluster,
            namespace: namespace.into(),
            pod_selector: pod_selector.into(),
        }
    }

    /// Create a watcher from a run context
    pub fn from_context(ctx: &RunContext) -> Self {
        Self::new(
            ctx.cluster.clone(),
            ctx.namespace(),
            ctx.pod_selector.clone(),
        )
    }

    /// Current replica status, None when the target does not exist
    pub async fn replica_status(&self, target: &ReadinessTarget) -> Result<Option<ReplicaStatus>> {
        Ok(match target {
            ReadinessTarget::ReplicaSet { name } => self
                .cluster
                .get_statefulset(&self.namespace, name)
                .await?
                .map(|sts| ReplicaStatus::of_statefulset(&sts)),
            ReadinessTarget::Node { pod_name } => self
                .cluster
                .get_pod(&self.namespace, pod_name)
                .await?
                .map(|pod| ReplicaStatus::of_pod(&pod)),
        })
    }

    /// Wait until `target` reports all desired replicas ready.
    ///
    /// On the final attempt the namespace's pods are logged to help diagnose
    /// a stuck rollout.
    pub async fn await_ready(
        &self,
        target: &ReadinessTarget,
        budget: PollBudget,
    ) -> Result<PollOutcome> {
        info!(target = %target.name(), "Waiting for readiness");
        let outcome = poll(&budget, "readiness", move |attempt| {
            self.check_ready(target, attempt)
        })
        .await?;
        if outcome.is_satisfied() {
            info!(
                target = %target.name(),
                attempts = outcome.attempts(),
                "Target is ready"
            );
        }
        Ok(outcome)
    }

    async fn check_ready(&self, target: &ReadinessTarget, attempt: Attempt) -> Result<PollStatus> {
        let status = self.replica_status(target).await?;
        let ready = match status {
            Some(status) => {
                debug!(
                    target = %target.name(),
                    desired = status.desired,
                    ready = status.ready,
                    attempt = attempt.number,
                    "Replica status"
                );
                status.is_ready()
            }
            None => {
                debug!(target = %target.name(), attempt = attempt.number, "Target not found yet");
                false
            }
        };

        if !ready && attempt.is_final {
            self.log_pod_diagnostics().await;
        }
        Ok(PollStatus::from(ready))
    }

    /// Wait until the named pod no longer exists
    pub async fn await_pod_absent(&self, pod_name: &str, budget: PollBudget) -> Result<PollOutcome> {
        info!(pod = %pod_name, "Waiting for pod to be deleted");
        poll(&budget, "pod deletion", move |attempt| async move {
            let exists = self.cluster.get_pod(&self.namespace, pod_name).await?.is_some();
            if exists {
                debug!(pod = %pod_name, attempt = attempt.number, "Pod still exists");
            }
            Ok(PollStatus::from(!exists))
        })
        .await
    }

    async fn log_pod_diagnostics(&self) {
        match self
            .cluster
            .list_pods(&self.namespace, &self.pod_selector)
            .await
        {
            Ok(pods) => {
                for pod in &pods {
                    warn!(namespace = %self.namespace, "Pod state: {}", describe_pod(pod));
                }
            }
            Err(e) => warn!(error = %e, "Failed to list pods for diagnostics"),
        }
    }
}
