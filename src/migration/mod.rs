//! Node-by-node migration from a StatefulSet to per-node CrdbNode resources.
//!
//! Ordinals are migrated strictly from the highest down to 0, one at a time.
//! For each ordinal the orchestrator walks
//!
//! ```text
//! Scaling -> AwaitingPodDeletion -> ApplyingReplacement -> AwaitingReplacementReady -> Done
//! ```
//!
//! Scaling the StatefulSet to `i` replicas makes the controller delete pod
//! `i`; once it is gone the CrdbNode for `i` is applied and its pod must
//! become ready before ordinal `i - 1` is touched. Quorum is therefore never
//! reduced by more than one node.
//!
//! There is no automatic rollback. A failure stops the run with
//! [`Error::Migration`]; re-running picks up where it stopped (see
//! [`NodeMigrationOrchestrator::plan`]).

use std::fmt;

use k8s_openapi::api::core::v1::Pod;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::context::RunContext;
use crate::descriptor::NodeIndex;
use crate::manifests::MigrationManifestSet;
use crate::poll::PollBudget;
use crate::readiness::{
    pod_is_available, ClusterReadinessWatcher, ReadinessTarget, NODE_READY_BUDGET,
    POD_ABSENT_BUDGET, REPLICA_SET_READY_BUDGET,
};
use crate::retry::{retry_transient, RetryConfig};
use crate::{Error, Result};

/// Where a single ordinal is in its migration.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MigrationPhase {
    /// Scaling the StatefulSet down to exclude this ordinal
    Scaling,
    /// Waiting for the StatefulSet pod to be deleted
    AwaitingPodDeletion,
    /// Applying the per-node manifest
    ApplyingReplacement,
    /// Waiting for the replacement pod to become ready
    AwaitingReplacementReady,
    /// Ordinal fully migrated
    Done,
}

impl MigrationPhase {
    /// The phase that follows this one
    pub fn next(self) -> Self {
        match self {
            MigrationPhase::Scaling => MigrationPhase::AwaitingPodDeletion,
            MigrationPhase::AwaitingPodDeletion => MigrationPhase::ApplyingReplacement,
            MigrationPhase::ApplyingReplacement => MigrationPhase::AwaitingReplacementReady,
            MigrationPhase::AwaitingReplacementReady | MigrationPhase::Done => {
                MigrationPhase::Done
            }
        }
    }
}

impl fmt::Display for MigrationPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MigrationPhase::Scaling => "scaling",
            MigrationPhase::AwaitingPodDeletion => "awaiting-pod-deletion",
            MigrationPhase::ApplyingReplacement => "applying-replacement",
            MigrationPhase::AwaitingReplacementReady => "awaiting-replacement-ready",
            MigrationPhase::Done => "done",
        };
        f.write_str(s)
    }
}

/// Wait budgets used by the orchestrator.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MigrationBudgets {
    /// StatefulSet readiness before the first mutation
    pub preflight: PollBudget,
    /// Pod deletion after scaling
    pub pod_deletion: PollBudget,
    /// Replacement pod readiness after apply
    pub replacement_ready: PollBudget,
}

impl Default for MigrationBudgets {
    fn default() -> Self {
        Self {
            preflight: REPLICA_SET_READY_BUDGET,
            pod_deletion: POD_ABSENT_BUDGET,
            replacement_ready: NODE_READY_BUDGET,
        }
    }
}

/// One ordinal to migrate and the phase to enter it at.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PlannedStep {
    /// Ordinal
    pub ordinal: NodeIndex,
    /// Phase to start from
    pub start: MigrationPhase,
}

/// Result of a completed migration.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MigrationReport {
    /// Ordinals migrated by this run, in processing order
    pub migrated: Vec<NodeIndex>,
    /// Ordinals found already migrated by an earlier run
    pub skipped: Vec<NodeIndex>,
}

/// Drives the per-ordinal state machine.
pub struct NodeMigrationOrchestrator<'a> {
    ctx: &'a RunContext,
    watcher: ClusterReadinessWatcher,
    budgets: MigrationBudgets,
    retry: RetryConfig,
}

impl<'a> NodeMigrationOrchestrator<'a> {
    /// Create an orchestrator with default budgets
    pub fn new(ctx: &'a RunContext) -> Self {
        Self {
            ctx,
            watcher: ClusterReadinessWatcher::from_context(ctx),
            budgets: MigrationBudgets::default(),
            retry: RetryConfig::default(),
        }
    }

    /// Override wait budgets
    pub fn with_budgets(mut self, budgets: MigrationBudgets) -> Self {
        self.budgets = budgets;
        self
    }

    /// Override the retry policy for cluster mutations
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Migrate every remaining ordinal.
    pub async fn run(&self, manifests: &MigrationManifestSet) -> Result<MigrationReport> {
        let descriptor = &self.ctx.descriptor;
        descriptor.validate()?;
        if manifests.node_count() != descriptor.desired_nodes {
            return Err(Error::validation_for(
                manifests.dir().display().to_string(),
                format!(
                    "manifest set has {} node manifests but the cluster wants {} nodes",
                    manifests.node_count(),
                    descriptor.desired_nodes
                ),
            ));
        }

        let replicas = self.current_replicas().await?;
        if replicas > 0 {
            self.watcher
                .await_ready(
                    &ReadinessTarget::ReplicaSet {
                        name: descriptor.statefulset_name.clone(),
                    },
                    self.budgets.preflight,
                )
                .await?
                .into_result("replica set readiness", &descriptor.statefulset_name)?;
        }

        let (steps, skipped) = self.plan(replicas).await?;
        if steps.is_empty() {
            info!(
                statefulset = %descriptor.statefulset_name,
                "Nothing to migrate, every ordinal is already served by a CrdbNode"
            );
        }

        let mut report = MigrationReport {
            migrated: Vec::with_capacity(steps.len()),
            skipped,
        };
        for step in steps {
            if let Err((phase, source)) = self.migrate_ordinal(step, manifests).await {
                error!(
                    ordinal = step.ordinal,
                    phase = %phase,
                    error = %source,
                    "Migration stopped; fix the cause and re-run to resume from this ordinal"
                );
                return Err(Error::Migration {
                    ordinal: step.ordinal,
                    phase,
                    migrated: report.migrated,
                    source: Box::new(source),
                });
            }
            report.migrated.push(step.ordinal);
        }

        info!(
            statefulset = %descriptor.statefulset_name,
            migrated = ?report.migrated,
            "Migration complete"
        );
        Ok(report)
    }

    async fn current_replicas(&self) -> Result<u32> {
        let descriptor = &self.ctx.descriptor;
        let sts = self
            .ctx
            .cluster
            .get_statefulset(&descriptor.namespace, &descriptor.statefulset_name)
            .await?
            .ok_or_else(|| {
                Error::validation_for(&descriptor.statefulset_name, "statefulset not found")
            })?;

        let replicas = sts.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
        let replicas = u32::try_from(replicas).map_err(|_| {
            Error::validation_for(&descriptor.statefulset_name, "negative replica count")
        })?;
        if replicas > descriptor.desired_nodes {
            return Err(Error::validation_for(
                &descriptor.statefulset_name,
                format!(
                    "statefulset has {} replicas but only {} nodes are expected",
                    replicas, descriptor.desired_nodes
                ),
            ));
        }
        Ok(replicas)
    }

    /// Work out which ordinals remain and where each one starts.
    ///
    /// Ordinals below the current replica count start from `Scaling`. An
    /// ordinal at or above it was handled by an earlier run; its pod tells
    /// how far that run got:
    ///
    /// - pod absent: the StatefulSet pod is gone, apply the replacement
    /// - pod still owned by the StatefulSet: wait for it to terminate
    /// - replacement pod not yet available: wait for it
    /// - replacement pod available: already migrated
    pub async fn plan(&self, replicas: u32) -> Result<(Vec<PlannedStep>, Vec<NodeIndex>)> {
        let descriptor = &self.ctx.descriptor;
        let mut steps = Vec::new();
        let mut skipped = Vec::new();

        for ordinal in (replicas..descriptor.desired_nodes).rev() {
            let pod_name = descriptor.pod_name(ordinal);
            let pod = self
                .ctx
                .cluster
                .get_pod(&descriptor.namespace, &pod_name)
                .await?;
            let start = match pod {
                None => Some(MigrationPhase::ApplyingReplacement),
                Some(ref pod) if is_statefulset_pod(pod) => {
                    Some(MigrationPhase::AwaitingPodDeletion)
                }
                Some(ref pod) if !pod_is_available(pod) => {
                    Some(MigrationPhase::AwaitingReplacementReady)
                }
                Some(_) => None,
            };
            match start {
                Some(start) => {
                    warn!(
                        ordinal = ordinal,
                        phase = %start,
                        "Resuming interrupted migration"
                    );
                    steps.push(PlannedStep { ordinal, start });
                }
                None => skipped.push(ordinal),
            }
        }
        if !skipped.is_empty() {
            info!(skipped = ?skipped, "Ordinals already migrated by an earlier run");
        }

        steps.extend((0..replicas).rev().map(|ordinal| PlannedStep {
            ordinal,
            start: MigrationPhase::Scaling,
        }));
        Ok((steps, skipped))
    }

    async fn migrate_ordinal(
        &self,
        step: PlannedStep,
        manifests: &MigrationManifestSet,
    ) -> std::result::Result<(), (MigrationPhase, Error)> {
        let mut phase = step.start;
        while phase != MigrationPhase::Done {
            info!(ordinal = step.ordinal, phase = %phase, "Migration phase");
            self.run_phase(step.ordinal, phase, manifests)
                .await
                .map_err(|e| (phase, e))?;
            phase = phase.next();
        }
        info!(ordinal = step.ordinal, "Ordinal migrated");
        Ok(())
    }

    async fn run_phase(
        &self,
        ordinal: NodeIndex,
        phase: MigrationPhase,
        manifests: &MigrationManifestSet,
    ) -> Result<()> {
        let descriptor = &self.ctx.descriptor;
        let namespace = descriptor.namespace.as_str();
        let pod_name = descriptor.pod_name(ordinal);
        let cluster = self.ctx.cluster.as_ref();

        match phase {
            MigrationPhase::Scaling => {
                let statefulset = descriptor.statefulset_name.as_str();
                let replicas = i32::try_from(ordinal).map_err(|_| {
                    Error::validation_for(statefulset, "ordinal exceeds replica range")
                })?;
                retry_transient(&self.retry, "scale-statefulset", move || {
                    cluster.scale_statefulset(namespace, statefulset, replicas)
                })
                .await
            }
            MigrationPhase::AwaitingPodDeletion => self
                .watcher
                .await_pod_absent(&pod_name, self.budgets.pod_deletion)
                .await?
                .into_result("pod deletion", &pod_name),
            MigrationPhase::ApplyingReplacement => {
                for object in manifests.node_objects(ordinal).await? {
                    let object = &object;
                    retry_transient(&self.retry, "apply-crdbnode", move || {
                        cluster.apply(namespace, object)
                    })
                    .await?;
                    info!(ordinal = ordinal, resource = %object.reference(), "Applied replacement");
                }
                Ok(())
            }
            MigrationPhase::AwaitingReplacementReady => self
                .watcher
                .await_ready(
                    &ReadinessTarget::Node {
                        pod_name: pod_name.clone(),
                    },
                    self.budgets.replacement_ready,
                )
                .await?
                .into_result("replacement readiness", &pod_name),
            MigrationPhase::Done => Ok(()),
        }
    }
}

/// Whether the pod is still controlled by the StatefulSet
fn is_statefulset_pod(pod: &Pod) -> bool {
    pod.metadata
        .owner_references
        .as_ref()
        .map(|owners| owners.iter().any(|o| o.kind == "StatefulSet"))
        .unwrap_or(false)
}

/// Migrate every remaining ordinal of the run's cluster using default budgets.
pub async fn run_migration(
    ctx: &RunContext,
    manifests: &MigrationManifestSet,
) -> Result<MigrationReport> {
    NodeMigrationOrchestrator::new(ctx).run(manifests).await
}
