//! In-memory [`ClusterClient`] that records every mutation.
//!
//! Pods terminate and become ready over a configurable number of reads,
//! which lets paused-clock tests drive the migration state machine end to end
//! and then assert on the recorded event order.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment, StatefulSet, StatefulSetSpec, StatefulSetStatus};
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{
    ContainerStatus, Pod, PodCondition, PodStatus, Secret, Service,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};

use super::{ClusterClient, ManifestObject};
use crate::{Error, Result};

/// Mutations and observations recorded by the fake, in order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum ClusterEvent {
    Scaled { statefulset: String, replicas: i32 },
    PodAbsent(String),
    Applied { kind: String, name: String },
    BudgetDeleted(String),
    JobCreated(String),
    JobDeleted(String),
    NamespaceEnsured(String),
    NamespaceDeleted(String),
}

#[derive(Clone, Debug)]
struct FakePod {
    owner: &'static str,
    ready: bool,
    ready_in: u32,
    terminating: Option<u32>,
}

#[derive(Default)]
struct FakeState {
    statefulsets: BTreeMap<String, (i32, i32)>,
    pods: BTreeMap<String, FakePod>,
    budgets: BTreeSet<String>,
    secrets: BTreeMap<String, Secret>,
    jobs: BTreeMap<String, Job>,
    deployments: BTreeMap<String, Deployment>,
    services: BTreeMap<String, Service>,
    namespaces: BTreeSet<String>,
    applied: Vec<ManifestObject>,
    events: Vec<ClusterEvent>,
    stuck_pods: BTreeSet<String>,
    never_ready: BTreeSet<String>,
    node_read_errors: BTreeMap<String, (u32, u16)>,
    deletion_reads: u32,
    ready_reads: u32,
}

/// In-memory cluster for tests
#[derive(Default)]
pub(crate) struct FakeCluster {
    state: Mutex<FakeState>,
}

impl FakeCluster {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// A ready StatefulSet `name` with pods `{name}-0..replicas`
    pub(crate) fn with_statefulset(self, name: &str, replicas: i32) -> Self {
        {
            let mut state = self.lock();
            state
                .statefulsets
                .insert(name.to_string(), (replicas, replicas));
            for i in 0..replicas {
                state.pods.insert(
                    format!("{}-{}", name, i),
                    FakePod {
                        owner: "StatefulSet",
                        ready: true,
                        ready_in: 0,
                        terminating: None,
                    },
                );
            }
        }
        self
    }

    /// A ready pod created by an already-applied CrdbNode
    pub(crate) fn with_migrated_node(self, pod: &str) -> Self {
        self.lock().pods.insert(
            pod.to_string(),
            FakePod {
                owner: "CrdbNode",
                ready: true,
                ready_in: 0,
                terminating: None,
            },
        );
        self
    }

    /// Number of reads a scaled-away pod survives before disappearing
    pub(crate) fn with_deletion_reads(self, reads: u32) -> Self {
        self.lock().deletion_reads = reads;
        self
    }

    /// Number of reads a newly created pod takes to become ready
    pub(crate) fn with_ready_reads(self, reads: u32) -> Self {
        self.lock().ready_reads = reads;
        self
    }

    /// The named pod never terminates
    pub(crate) fn with_stuck_pod(self, pod: &str) -> Self {
        self.lock().stuck_pods.insert(pod.to_string());
        self
    }

    /// The named replacement pod never becomes ready
    pub(crate) fn with_never_ready_pod(self, pod: &str) -> Self {
        self.lock().never_ready.insert(pod.to_string());
        self
    }

    /// The next `count` reads of the named CrdbNode pod fail with HTTP `code`
    pub(crate) fn with_failing_node_reads(self, pod: &str, count: u32, code: u16) -> Self {
        self.lock()
            .node_read_errors
            .insert(pod.to_string(), (count, code));
        self
    }

    pub(crate) fn with_budget(self, name: &str) -> Self {
        self.lock().budgets.insert(name.to_string());
        self
    }

    pub(crate) fn with_secret(self, secret: Secret) -> Self {
        let name = secret.metadata.name.clone().unwrap_or_default();
        self.lock().secrets.insert(name, secret);
        self
    }

    pub(crate) fn with_service(self, name: &str, service: Service) -> Self {
        self.lock().services.insert(name.to_string(), service);
        self
    }

    pub(crate) fn with_deployment(self, name: &str, deployment: Deployment) -> Self {
        self.lock().deployments.insert(name.to_string(), deployment);
        self
    }

    /// Replace the status of a job (simulating the job controller)
    pub(crate) fn set_job(&self, job: Job) {
        let name = job.metadata.name.clone().unwrap_or_default();
        self.lock().jobs.insert(name, job);
    }

    pub(crate) fn remove_secret(&self, name: &str) {
        self.lock().secrets.remove(name);
    }

    pub(crate) fn events(&self) -> Vec<ClusterEvent> {
        self.lock().events.clone()
    }

    pub(crate) fn applied(&self) -> Vec<ManifestObject> {
        self.lock().applied.clone()
    }

    pub(crate) fn has_budget(&self, name: &str) -> bool {
        self.lock().budgets.contains(name)
    }

    pub(crate) fn pod_is_ready(&self, name: &str) -> bool {
        self.lock().pods.get(name).map(|p| p.ready).unwrap_or(false)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Build a pod object in the given phase with all containers `ready`
pub(crate) fn pod(name: &str, phase: &str, ready: bool) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        ..owned_pod(name, phase, ready, "StatefulSet")
    }
}

/// Build a pod owned by a controller of `owner_kind`
pub(crate) fn owned_pod(name: &str, phase: &str, ready: bool, owner_kind: &str) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            owner_references: Some(vec![OwnerReference {
                api_version: "v1".to_string(),
                kind: owner_kind.to_string(),
                name: "owner".to_string(),
                uid: "0000".to_string(),
                controller: Some(true),
                ..Default::default()
            }]),
            ..Default::default()
        },
        status: Some(PodStatus {
            phase: Some(phase.to_string()),
            conditions: Some(vec![PodCondition {
                type_: "Ready".to_string(),
                status: if ready { "True" } else { "False" }.to_string(),
                ..Default::default()
            }]),
            container_statuses: Some(vec![ContainerStatus {
                name: "db".to_string(),
                ready,
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Build a StatefulSet with desired and ready replica counts
pub(crate) fn statefulset(name: &str, replicas: i32, ready: i32) -> StatefulSet {
    StatefulSet {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        spec: Some(StatefulSetSpec {
            replicas: Some(replicas),
            ..Default::default()
        }),
        status: Some(StatefulSetStatus {
            replicas,
            ready_replicas: Some(ready),
            ..Default::default()
        }),
    }
}

/// An API server error response with the given HTTP status
pub(crate) fn api_error(code: u16) -> Error {
    Error::Kube {
        source: kube::Error::Api(kube::error::ErrorResponse {
            status: "Failure".to_string(),
            message: format!("injected failure ({})", code),
            reason: if code >= 500 { "ServiceUnavailable" } else { "Forbidden" }.to_string(),
            code,
        }),
    }
}

fn ordinal_of(pod: &str, statefulset: &str) -> Option<i32> {
    pod.strip_prefix(statefulset)?
        .strip_prefix('-')?
        .parse()
        .ok()
}

#[async_trait]
impl ClusterClient for FakeCluster {
    async fn get_statefulset(&self, _namespace: &str, name: &str) -> Result<Option<StatefulSet>> {
        let state = self.lock();
        Ok(state
            .statefulsets
            .get(name)
            .map(|(replicas, ready)| statefulset(name, *replicas, *ready)))
    }

    async fn scale_statefulset(&self, _namespace: &str, name: &str, replicas: i32) -> Result<()> {
        let mut guard = self.lock();
        let state = &mut *guard;
        let Some(entry) = state.statefulsets.get_mut(name) else {
            return Err(Error::internal_with_context(
                "fake",
                format!("statefulset {} not found", name),
            ));
        };
        entry.0 = replicas;
        entry.1 = entry.1.min(replicas);

        let deletion_reads = state.deletion_reads;
        let victims: Vec<String> = state
            .pods
            .iter()
            .filter(|(_, p)| p.owner == "StatefulSet")
            .map(|(pod, _)| pod)
            .filter(|pod| ordinal_of(pod, name).map(|i| i >= replicas).unwrap_or(false))
            .cloned()
            .collect();
        for victim in victims {
            let stuck = state.stuck_pods.contains(&victim);
            if let Some(pod) = state.pods.get_mut(&victim) {
                if pod.terminating.is_none() {
                    pod.terminating = Some(if stuck { u32::MAX } else { deletion_reads });
                }
            }
        }
        state.events.push(ClusterEvent::Scaled {
            statefulset: name.to_string(),
            replicas,
        });
        Ok(())
    }

    async fn get_pod(&self, _namespace: &str, name: &str) -> Result<Option<Pod>> {
        let mut guard = self.lock();
        let state = &mut *guard;
        let never_ready = state.never_ready.contains(name);

        match state.pods.get(name).map(|p| p.terminating) {
            None => {
                state.events.push(ClusterEvent::PodAbsent(name.to_string()));
                return Ok(None);
            }
            Some(Some(0)) => {
                state.pods.remove(name);
                state.events.push(ClusterEvent::PodAbsent(name.to_string()));
                return Ok(None);
            }
            _ => {}
        }

        let Some(fake) = state.pods.get_mut(name) else {
            return Ok(None);
        };
        if fake.owner == "CrdbNode" {
            if let Some((remaining, code)) = state.node_read_errors.get_mut(name) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(api_error(*code));
                }
            }
        }
        if let Some(reads) = fake.terminating.as_mut() {
            if *reads != u32::MAX {
                *reads -= 1;
            }
        }
        if !fake.ready && !never_ready {
            if fake.ready_in == 0 {
                fake.ready = true;
            } else {
                fake.ready_in -= 1;
            }
        }

        let phase = if fake.ready { "Running" } else { "Pending" };
        Ok(Some(owned_pod(name, phase, fake.ready, fake.owner)))
    }

    async fn list_pods(&self, _namespace: &str, _label_selector: &str) -> Result<Vec<Pod>> {
        let state = self.lock();
        Ok(state
            .pods
            .iter()
            .map(|(name, p)| {
                let phase = if p.ready { "Running" } else { "Pending" };
                owned_pod(name, phase, p.ready, p.owner)
            })
            .collect())
    }

    async fn apply(&self, _namespace: &str, object: &ManifestObject) -> Result<()> {
        let mut state = self.lock();
        if object.kind == "CrdbNode" {
            let ready_in = state.ready_reads;
            state.pods.insert(
                object.name.clone(),
                FakePod {
                    owner: "CrdbNode",
                    ready: false,
                    ready_in,
                    terminating: None,
                },
            );
        }
        state.applied.push(object.clone());
        state.events.push(ClusterEvent::Applied {
            kind: object.kind.clone(),
            name: object.name.clone(),
        });
        Ok(())
    }

    async fn delete_pod_disruption_budget(&self, _namespace: &str, name: &str) -> Result<bool> {
        let mut state = self.lock();
        let existed = state.budgets.remove(name);
        if existed {
            state.events.push(ClusterEvent::BudgetDeleted(name.to_string()));
        }
        Ok(existed)
    }

    async fn get_secret(&self, _namespace: &str, name: &str) -> Result<Option<Secret>> {
        Ok(self.lock().secrets.get(name).cloned())
    }

    async fn create_job(&self, _namespace: &str, job: &Job) -> Result<()> {
        let mut state = self.lock();
        let name = job.metadata.name.clone().unwrap_or_default();
        if state.jobs.contains_key(&name) {
            return Err(Error::validation_for(name, "job already exists"));
        }
        state.jobs.insert(name.clone(), job.clone());
        state.events.push(ClusterEvent::JobCreated(name));
        Ok(())
    }

    async fn get_job(&self, _namespace: &str, name: &str) -> Result<Option<Job>> {
        Ok(self.lock().jobs.get(name).cloned())
    }

    async fn delete_job(&self, _namespace: &str, name: &str) -> Result<bool> {
        let mut state = self.lock();
        let existed = state.jobs.remove(name).is_some();
        if existed {
            state.events.push(ClusterEvent::JobDeleted(name.to_string()));
        }
        Ok(existed)
    }

    async fn get_deployment(&self, _namespace: &str, name: &str) -> Result<Option<Deployment>> {
        Ok(self.lock().deployments.get(name).cloned())
    }

    async fn get_service(&self, _namespace: &str, name: &str) -> Result<Option<Service>> {
        Ok(self.lock().services.get(name).cloned())
    }

    async fn ensure_namespace(&self, name: &str) -> Result<()> {
        let mut state = self.lock();
        state.namespaces.insert(name.to_string());
        state
            .events
            .push(ClusterEvent::NamespaceEnsured(name.to_string()));
        Ok(())
    }

    async fn delete_namespace(&self, name: &str) -> Result<bool> {
        let mut state = self.lock();
        let existed = state.namespaces.remove(name);
        state
            .events
            .push(ClusterEvent::NamespaceDeleted(name.to_string()));
        Ok(existed)
    }
}
