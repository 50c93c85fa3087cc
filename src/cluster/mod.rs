//! Cluster access for the migration.
//!
//! [`ClusterClient`] is the full set of Kubernetes operations the crate
//! performs. Everything above this module talks to the trait, so tests can
//! substitute a mock or the in-memory fake and never need an API server.

mod kube_client;
pub mod manifest;

#[cfg(test)]
pub(crate) mod fake;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{Pod, Secret, Service};
#[cfg(test)]
use mockall::automock;

pub use kube_client::{create_client, create_client_with_timeout, KubeClusterClient};
pub use manifest::{parse_documents, ManifestObject};

use crate::Result;

/// Field manager used for every server-side apply
pub const FIELD_MANAGER: &str = "crdb-migrator";

/// The "Available" condition type for deployments
pub const CONDITION_AVAILABLE: &str = "Available";
/// The "True" status value for conditions
pub const STATUS_TRUE: &str = "True";

/// Kubernetes operations used by the migration, certificate and install flows.
///
/// Getters return `Ok(None)` when the object does not exist. Deletes return
/// whether anything was deleted.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Get a StatefulSet
    async fn get_statefulset(&self, namespace: &str, name: &str) -> Result<Option<StatefulSet>>;

    /// Set a StatefulSet's desired replica count
    async fn scale_statefulset(&self, namespace: &str, name: &str, replicas: i32) -> Result<()>;

    /// Get a Pod
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>>;

    /// List Pods, optionally filtered by a label selector (empty for all)
    async fn list_pods(&self, namespace: &str, label_selector: &str) -> Result<Vec<Pod>>;

    /// Server-side apply a manifest object.
    ///
    /// Namespaced objects without their own namespace land in `namespace`.
    async fn apply(&self, namespace: &str, object: &ManifestObject) -> Result<()>;

    /// Delete a PodDisruptionBudget
    async fn delete_pod_disruption_budget(&self, namespace: &str, name: &str) -> Result<bool>;

    /// Get a Secret
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>>;

    /// Create a Job
    async fn create_job(&self, namespace: &str, job: &Job) -> Result<()>;

    /// Get a Job
    async fn get_job(&self, namespace: &str, name: &str) -> Result<Option<Job>>;

    /// Delete a Job and its pods
    async fn delete_job(&self, namespace: &str, name: &str) -> Result<bool>;

    /// Get a Deployment
    async fn get_deployment(&self, namespace: &str, name: &str) -> Result<Option<Deployment>>;

    /// Get a Service
    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Service>>;

    /// Ensure a namespace exists (idempotent)
    async fn ensure_namespace(&self, name: &str) -> Result<()>;

    /// Delete a namespace
    async fn delete_namespace(&self, name: &str) -> Result<bool>;
}

/// Check whether a list of conditions has `condition_type` set to "True"
pub fn has_condition<'a, I>(conditions: I, condition_type: &str) -> bool
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    conditions
        .into_iter()
        .any(|(type_, status)| type_ == condition_type && status == STATUS_TRUE)
}

/// Whether a Deployment reports the Available condition
pub fn deployment_is_available(deployment: &Deployment) -> bool {
    let conditions = deployment
        .status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .map(|c| c.as_slice())
        .unwrap_or_default();
    has_condition(
        conditions
            .iter()
            .map(|c| (c.type_.as_str(), c.status.as_str())),
        CONDITION_AVAILABLE,
    )
}

/// Whether a Service can receive traffic.
///
/// LoadBalancer services need an ingress address; other types are available
/// as soon as they exist.
pub fn service_is_available(service: &Service) -> bool {
    let is_load_balancer = service
        .spec
        .as_ref()
        .and_then(|s| s.type_.as_deref())
        .map(|t| t == "LoadBalancer")
        .unwrap_or(false);
    if !is_load_balancer {
        return true;
    }
    service
        .status
        .as_ref()
        .and_then(|s| s.load_balancer.as_ref())
        .and_then(|lb| lb.ingress.as_ref())
        .map(|ingress| !ingress.is_empty())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::apps::v1::{DeploymentCondition, DeploymentStatus};
    use k8s_openapi::api::core::v1::{
        LoadBalancerIngress, LoadBalancerStatus, ServiceSpec, ServiceStatus,
    };

    #[test]
    fn test_deployment_available_condition() {
        let mut deployment = Deployment::default();
        assert!(!deployment_is_available(&deployment));

        deployment.status = Some(DeploymentStatus {
            conditions: Some(vec![DeploymentCondition {
                type_: "Available".to_string(),
                status: "True".to_string(),
                ..Default::default()
            }]),
            ..Default::default()
        });
        assert!(deployment_is_available(&deployment));
    }

    #[test]
    fn test_cluster_ip_service_is_available_once_it_exists() {
        let service = Service {
            spec: Some(ServiceSpec {
                type_: Some("ClusterIP".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(service_is_available(&service));
    }

    #[test]
    fn test_load_balancer_needs_ingress() {
        let mut service = Service {
            spec: Some(ServiceSpec {
                type_: Some("LoadBalancer".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(!service_is_available(&service));

        service.status = Some(ServiceStatus {
            load_balancer: Some(LoadBalancerStatus {
                ingress: Some(vec![LoadBalancerIngress {
                    ip: Some("10.0.0.10".to_string()),
                    ..Default::default()
                }]),
            }),
            ..Default::default()
        });
        assert!(service_is_available(&service));
    }
}
