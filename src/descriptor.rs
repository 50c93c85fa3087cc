//! Identity of the cluster being migrated.
//!
//! A [`ClusterDescriptor`] names every resource the migration touches. It is
//! fixed for the duration of one run.

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Fixed name of the PodDisruptionBudget suffix the Helm chart creates
const BUDGET_SUFFIX: &str = "budget";

/// Ordinal of a node in the replica set, in `[0, desired_nodes)`.
pub type NodeIndex = u32;

/// The CockroachDB cluster a run operates on.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterDescriptor {
    /// Namespace the cluster lives in
    pub namespace: String,
    /// Name of the StatefulSet being migrated away from
    pub statefulset_name: String,
    /// Helm release that owns the StatefulSet
    pub release_name: String,
    /// Secret holding the client certificate
    pub client_secret: String,
    /// Secret holding the node certificate
    pub node_secret: String,
    /// Secret holding the CA certificate; empty for an insecure cluster
    pub ca_secret: String,
    /// The CA was supplied by the user rather than the chart's self-signer
    #[serde(default)]
    pub ca_is_external: bool,
    /// Number of nodes the cluster should have
    pub desired_nodes: u32,
}

impl ClusterDescriptor {
    /// Build a descriptor using the Helm chart's naming conventions.
    pub fn for_release(
        release: impl Into<String>,
        namespace: impl Into<String>,
        desired_nodes: u32,
    ) -> Self {
        let release_name = release.into();
        let statefulset_name = format!("{}-cockroachdb", release_name);
        Self {
            namespace: namespace.into(),
            client_secret: format!("{}-client-secret", statefulset_name),
            node_secret: format!("{}-node-secret", statefulset_name),
            ca_secret: format!("{}-ca-secret", statefulset_name),
            statefulset_name,
            release_name,
            ca_is_external: false,
            desired_nodes,
        }
    }

    /// Whether the cluster runs with TLS
    pub fn is_secure(&self) -> bool {
        !self.ca_secret.is_empty()
    }

    /// Name of the pod for `ordinal`
    pub fn pod_name(&self, ordinal: NodeIndex) -> String {
        format!("{}-{}", self.statefulset_name, ordinal)
    }

    /// Name of the chart's public service
    pub fn public_service_name(&self) -> String {
        format!("{}-public", self.statefulset_name)
    }

    /// Name of the chart's PodDisruptionBudget
    pub fn disruption_budget_name(&self) -> String {
        format!("{}-{}", self.statefulset_name, BUDGET_SUFFIX)
    }

    /// Service account used by certificate rotation jobs
    pub fn rotation_service_account(&self) -> String {
        format!("{}-rotate-self-signer", self.statefulset_name)
    }

    /// Stable DNS name of the first pod inside the cluster
    pub fn first_pod_host(&self) -> String {
        format!(
            "{}.{}.{}.svc.cluster.local",
            self.pod_name(0),
            self.statefulset_name,
            self.namespace
        )
    }

    /// Check that the descriptor is usable before any cluster call.
    pub fn validate(&self) -> Result<()> {
        if self.namespace.is_empty() {
            return Err(Error::validation_for("descriptor", "namespace is empty"));
        }
        if self.statefulset_name.is_empty() {
            return Err(Error::validation_for(
                "descriptor",
                "statefulset name is empty",
            ));
        }
        if self.desired_nodes == 0 {
            return Err(Error::validation_for(
                &self.statefulset_name,
                "desired node count must be at least 1",
            ));
        }
        if self.is_secure() && (self.client_secret.is_empty() || self.node_secret.is_empty()) {
            return Err(Error::validation_for(
                &self.statefulset_name,
                "secure clusters need client and node secret names",
            ));
        }
        Ok(())
    }
}
