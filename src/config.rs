//! File-based configuration
//!
//! Every field has a default, so an empty file (or no file) describes a
//! three-node `crdb` release in `default`. CLI flags override the file.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::descriptor::ClusterDescriptor;
use crate::migration::MigrationBudgets;
use crate::poll::PollBudget;
use crate::probe::{DEFAULT_SQL_PORT, DEFAULT_SQL_USER};
use crate::rotation::RotationSettings;
use crate::{Error, Result};

/// Top-level configuration.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MigratorConfig {
    /// The cluster being operated on
    pub cluster: ClusterConfig,
    /// Migration manifest generation
    pub manifests: ManifestsConfig,
    /// Certificate issuance and rotation
    pub certificates: CertificatesConfig,
    /// Helm chart
    pub chart: ChartConfig,
    /// Operator deployment
    pub operator: OperatorConfig,
    /// Which installer to use
    pub installer: InstallerConfig,
    /// SQL probe
    pub sql: SqlConfig,
    /// Wait budgets
    pub timeouts: TimeoutsConfig,
}

impl MigratorConfig {
    /// Load from `path`, or defaults when no path is given
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config = match path {
            Some(path) => {
                let content = std::fs::read_to_string(path)
                    .map_err(|e| Error::io(path.display().to_string(), e))?;
                Self::from_yaml(&content)?
            }
            None => Self::default(),
        };
        config.validate()?;
        Ok(config)
    }

    /// Parse YAML content; an empty document yields defaults
    pub fn from_yaml(content: &str) -> Result<Self> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(content)
            .map_err(|e| Error::serialization_for("MigratorConfig", e.to_string()))
    }

    /// Reject configurations no command can run with
    pub fn validate(&self) -> Result<()> {
        if self.cluster.release.is_empty() {
            return Err(Error::validation_for("cluster.release", "must not be empty"));
        }
        if self.timeouts.poll_interval_secs == 0 || self.timeouts.pod_deletion_interval_secs == 0 {
            return Err(Error::validation_for(
                "timeouts",
                "poll intervals must be at least one second",
            ));
        }
        self.descriptor().validate()
    }

    /// Descriptor of the configured cluster
    pub fn descriptor(&self) -> ClusterDescriptor {
        self.cluster.descriptor()
    }
}

/// Identity of the cluster.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClusterConfig {
    /// Helm release name
    pub release: String,
    /// Namespace of the release
    pub namespace: String,
    /// Number of nodes
    pub desired_nodes: u32,
    /// StatefulSet name, defaults to `{release}-cockroachdb`
    pub statefulset_name: Option<String>,
    /// Client certificate secret override
    pub client_secret: Option<String>,
    /// Node certificate secret override
    pub node_secret: Option<String>,
    /// CA secret override
    pub ca_secret: Option<String>,
    /// The CA is user-supplied
    pub ca_is_external: bool,
    /// The cluster runs without TLS
    pub insecure: bool,
    /// Label selector for pod diagnostics
    pub pod_selector: String,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            release: "crdb".to_string(),
            namespace: "default".to_string(),
            desired_nodes: 3,
            statefulset_name: None,
            client_secret: None,
            node_secret: None,
            ca_secret: None,
            ca_is_external: false,
            insecure: false,
            pod_selector: "app.kubernetes.io/name=cockroachdb".to_string(),
        }
    }
}

impl ClusterConfig {
    /// Build the descriptor, applying name overrides
    pub fn descriptor(&self) -> ClusterDescriptor {
        let mut descriptor =
            ClusterDescriptor::for_release(&self.release, &self.namespace, self.desired_nodes);
        if let Some(name) = &self.statefulset_name {
            descriptor.statefulset_name = name.clone();
        }
        if let Some(name) = &self.client_secret {
            descriptor.client_secret = name.clone();
        }
        if let Some(name) = &self.node_secret {
            descriptor.node_secret = name.clone();
        }
        if let Some(name) = &self.ca_secret {
            descriptor.ca_secret = name.clone();
        }
        if self.insecure {
            descriptor.ca_secret = String::new();
        }
        descriptor.ca_is_external = self.ca_is_external;
        descriptor
    }
}

/// Where migration manifests come from.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ManifestsConfig {
    /// Directory the manifests are written to and read from
    pub output_dir: PathBuf,
    /// Path of the migration helper binary
    pub helper_binary: PathBuf,
    /// Cloud provider recorded in node manifests
    pub cloud_provider: String,
    /// Cloud region recorded in node manifests
    pub cloud_region: String,
}

impl Default for ManifestsConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("manifests"),
            helper_binary: PathBuf::from("migration-helper"),
            cloud_provider: "k3d".to_string(),
            cloud_region: "us-east1".to_string(),
        }
    }
}

/// Certificate issuance and rotation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CertificatesConfig {
    /// Script that issues the initial certificates
    pub issuer_script: PathBuf,
    /// Rotation job settings
    #[serde(flatten)]
    pub rotation: RotationSettings,
}

impl Default for CertificatesConfig {
    fn default() -> Self {
        Self {
            issuer_script: PathBuf::from("generate-certs.sh"),
            rotation: RotationSettings::default(),
        }
    }
}

/// The CockroachDB Helm chart.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ChartConfig {
    /// Chart path or reference
    pub path: String,
    /// `--set` overrides used on install
    pub set_values: BTreeMap<String, String>,
}

impl Default for ChartConfig {
    fn default() -> Self {
        Self {
            path: "cockroachdb/cockroachdb".to_string(),
            set_values: BTreeMap::new(),
        }
    }
}

impl ChartConfig {
    /// Whether the chart issues its own certificates.
    ///
    /// Both `tls.enabled` and `tls.certs.selfSigner.enabled` default to on.
    pub fn self_signer_enabled(&self) -> bool {
        let on = |key: &str| {
            self.set_values
                .get(key)
                .map(|v| v.is_empty() || v == "true")
                .unwrap_or(true)
        };
        on("tls.enabled") && on("tls.certs.selfSigner.enabled")
    }
}

/// The CockroachDB operator.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OperatorConfig {
    /// Multi-document operator manifest
    pub manifest_path: PathBuf,
    /// Namespace the operator runs in
    pub namespace: String,
    /// Operator Deployment name
    pub deployment: String,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            manifest_path: PathBuf::from("operator.yaml"),
            namespace: "cockroach-operator-system".to_string(),
            deployment: "cockroach-operator-manager".to_string(),
        }
    }
}

/// Installer implementation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstallerKind {
    /// Install the database with the Helm chart
    #[default]
    Helm,
    /// Install the operator
    Operator,
}

/// Installer selection.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct InstallerConfig {
    /// Which installer to run
    pub kind: InstallerKind,
}

/// SQL probe connection.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SqlConfig {
    /// Host to connect to, defaults to the first pod's DNS name
    pub host: Option<String>,
    /// SQL port
    pub port: u16,
    /// SQL user
    pub user: String,
    /// Database the probe writes to
    pub database: String,
    /// Rows the probe expects
    pub expected_rows: usize,
}

impl Default for SqlConfig {
    fn default() -> Self {
        Self {
            host: None,
            port: DEFAULT_SQL_PORT,
            user: DEFAULT_SQL_USER.to_string(),
            database: "testdb".to_string(),
            expected_rows: 2,
        }
    }
}

/// Wait budgets, in seconds unless noted.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TimeoutsConfig {
    /// Attempts to observe a scaled-away pod gone
    pub pod_deletion_attempts: u32,
    /// Interval between pod deletion checks
    pub pod_deletion_interval_secs: u64,
    /// Replacement node readiness
    pub replacement_ready_secs: u64,
    /// StatefulSet readiness
    pub replica_set_ready_secs: u64,
    /// Rotation job completion
    pub rotation_secs: u64,
    /// Interval for the timeout-bounded waits
    pub poll_interval_secs: u64,
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            pod_deletion_attempts: 30,
            pod_deletion_interval_secs: 2,
            replacement_ready_secs: 300,
            replica_set_ready_secs: 600,
            rotation_secs: 600,
            poll_interval_secs: 10,
        }
    }
}

impl TimeoutsConfig {
    fn interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    /// Budgets for the migration orchestrator
    pub fn migration_budgets(&self) -> MigrationBudgets {
        MigrationBudgets {
            preflight: self.replica_set_ready(),
            pod_deletion: PollBudget::attempts(
                self.pod_deletion_attempts,
                Duration::from_secs(self.pod_deletion_interval_secs),
            ),
            replacement_ready: PollBudget::timeout(
                Duration::from_secs(self.replacement_ready_secs),
                self.interval(),
            ),
        }
    }

    /// Budget for StatefulSet readiness
    pub fn replica_set_ready(&self) -> PollBudget {
        PollBudget::timeout(Duration::from_secs(self.replica_set_ready_secs), self.interval())
    }

    /// Budget for a rotation job
    pub fn rotation(&self) -> PollBudget {
        PollBudget::timeout(Duration::from_secs(self.rotation_secs), self.interval())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::readiness::{NODE_READY_BUDGET, POD_ABSENT_BUDGET, REPLICA_SET_READY_BUDGET};
    use crate::rotation::ROTATION_BUDGET;

    #[test]
    fn test_defaults_match_built_in_budgets() {
        let timeouts = TimeoutsConfig::default();
        assert_eq!(timeouts.migration_budgets(), MigrationBudgets::default());
        assert_eq!(timeouts.migration_budgets().pod_deletion, POD_ABSENT_BUDGET);
        assert_eq!(timeouts.migration_budgets().replacement_ready, NODE_READY_BUDGET);
        assert_eq!(timeouts.replica_set_ready(), REPLICA_SET_READY_BUDGET);
        assert_eq!(timeouts.rotation(), ROTATION_BUDGET);
    }

    #[test]
    fn test_empty_file_is_default() {
        assert_eq!(
            MigratorConfig::from_yaml("").unwrap(),
            MigratorConfig::default()
        );
    }

    #[test]
    fn test_partial_yaml() {
        let config = MigratorConfig::from_yaml(
            r#"
cluster:
  release: prod
  namespace: cockroach
  desiredNodes: 5
  caIsExternal: true
certificates:
  imageTag: "1.7"
  schedule: "*/1 * * * *"
installer:
  kind: operator
chart:
  setValues:
    tls.enabled: "true"
    tls.certs.selfSigner.enabled: "false"
"#,
        )
        .unwrap();

        let descriptor = config.descriptor();
        assert_eq!(descriptor.statefulset_name, "prod-cockroachdb");
        assert_eq!(descriptor.desired_nodes, 5);
        assert!(descriptor.ca_is_external);
        assert_eq!(config.certificates.rotation.image_tag, "1.7");
        assert_eq!(config.certificates.rotation.schedule, "*/1 * * * *");
        assert_eq!(config.certificates.rotation.ca_duration, "43800h");
        assert_eq!(config.installer.kind, InstallerKind::Operator);
        assert!(!config.chart.self_signer_enabled());
        assert_eq!(config.sql.port, 26257);
    }

    #[test]
    fn test_insecure_clears_ca_secret() {
        let cluster = ClusterConfig {
            insecure: true,
            ..Default::default()
        };
        assert!(!cluster.descriptor().is_secure());
    }

    #[test]
    fn test_name_overrides() {
        let cluster = ClusterConfig {
            statefulset_name: Some("legacy".to_string()),
            ca_secret: Some("my-ca".to_string()),
            ..Default::default()
        };
        let descriptor = cluster.descriptor();
        assert_eq!(descriptor.statefulset_name, "legacy");
        assert_eq!(descriptor.ca_secret, "my-ca");
        assert_eq!(descriptor.node_secret, "crdb-cockroachdb-node-secret");
    }

    #[test]
    fn test_self_signer_defaults_on() {
        assert!(ChartConfig::default().self_signer_enabled());
    }

    #[test]
    fn test_zero_interval_is_rejected() {
        let mut config = MigratorConfig::default();
        config.timeouts.poll_interval_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_missing_file_is_io_error() {
        let err = MigratorConfig::load(Some(Path::new("/nonexistent/crdb.yaml"))).unwrap_err();
        assert!(matches!(err, Error::Io { .. }));
    }
}
