//! Migration manifests and the tool that generates them.
//!
//! The migration consumes a directory produced by an external generator. It
//! holds one `crdbnode-{i}.yaml` per ordinal, the `public-service.yaml` that
//! replaces the chart's public service, and the `values.yaml` overlay that
//! switches the Helm release into operator mode.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use tracing::info;

use crate::cluster::{parse_documents, ManifestObject};
use crate::descriptor::NodeIndex;
use crate::process::{run_checked, CommandRunner, ExternalCommand};
use crate::{Error, Result};

/// File name of the public service manifest
pub const PUBLIC_SERVICE_FILE: &str = "public-service.yaml";
/// File name of the Helm values overlay
pub const VALUES_FILE: &str = "values.yaml";

/// File name of the per-node manifest for `ordinal`
pub fn node_manifest_file(ordinal: NodeIndex) -> String {
    format!("crdbnode-{}.yaml", ordinal)
}

/// A validated, read-only directory of migration manifests.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MigrationManifestSet {
    dir: PathBuf,
    node_count: u32,
}

impl MigrationManifestSet {
    /// Load a manifest directory, checking that every expected file exists.
    ///
    /// Returns a validation error listing all missing files.
    pub fn load(dir: impl Into<PathBuf>, node_count: u32) -> Result<Self> {
        let dir = dir.into();
        let expected = (0..node_count)
            .map(node_manifest_file)
            .chain([PUBLIC_SERVICE_FILE.to_string(), VALUES_FILE.to_string()]);
        let missing: Vec<String> = expected.filter(|f| !dir.join(f).is_file()).collect();

        if !missing.is_empty() {
            return Err(Error::validation_for(
                dir.display().to_string(),
                format!("missing migration manifests: {}", missing.join(", ")),
            ));
        }
        Ok(Self { dir, node_count })
    }

    /// Directory holding the manifests
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Number of per-node manifests
    pub fn node_count(&self) -> u32 {
        self.node_count
    }

    /// Path of the per-node manifest for `ordinal`
    pub fn node_manifest_path(&self, ordinal: NodeIndex) -> PathBuf {
        self.dir.join(node_manifest_file(ordinal))
    }

    /// Path of the public service manifest
    pub fn public_service_path(&self) -> PathBuf {
        self.dir.join(PUBLIC_SERVICE_FILE)
    }

    /// Path of the Helm values overlay
    pub fn values_path(&self) -> PathBuf {
        self.dir.join(VALUES_FILE)
    }

    /// Parsed objects of the per-node manifest for `ordinal`
    pub async fn node_objects(&self, ordinal: NodeIndex) -> Result<Vec<ManifestObject>> {
        if ordinal >= self.node_count {
            return Err(Error::validation_for(
                node_manifest_file(ordinal),
                format!("ordinal out of range for {} nodes", self.node_count),
            ));
        }
        read_objects(&self.node_manifest_path(ordinal)).await
    }

    /// Parsed objects of the public service manifest
    pub async fn public_service_objects(&self) -> Result<Vec<ManifestObject>> {
        read_objects(&self.public_service_path()).await
    }
}

/// Read and parse every document of a manifest file.
pub async fn read_objects(path: &Path) -> Result<Vec<ManifestObject>> {
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| Error::io(path.display().to_string(), e))?;
    let objects = parse_documents(&content)?;
    if objects.is_empty() {
        return Err(Error::validation_for(
            path.display().to_string(),
            "manifest contains no objects",
        ));
    }
    Ok(objects)
}

/// Inputs for generating a manifest set.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ManifestRequest {
    /// StatefulSet being migrated
    pub statefulset_name: String,
    /// Namespace of the StatefulSet
    pub namespace: String,
    /// Number of per-node manifests to expect
    pub node_count: u32,
    /// Cloud provider recorded in the node manifests (e.g. "k3d", "gcp")
    pub cloud_provider: String,
    /// Cloud region recorded in the node manifests
    pub cloud_region: String,
    /// Directory to write into
    pub output_dir: PathBuf,
}

/// Produces migration manifests for a running StatefulSet.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ManifestGenerator: Send + Sync {
    /// Generate manifests and return the validated set
    async fn generate(&self, request: &ManifestRequest) -> Result<MigrationManifestSet>;
}

/// [`ManifestGenerator`] that shells out to the `migration-helper` binary.
pub struct MigrationHelperGenerator {
    binary: PathBuf,
    runner: Arc<dyn CommandRunner>,
}

impl MigrationHelperGenerator {
    /// Use `binary` as the migration helper
    pub fn new(binary: impl Into<PathBuf>, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            binary: binary.into(),
            runner,
        }
    }

    /// The command line for a request
    pub fn command(&self, request: &ManifestRequest) -> ExternalCommand {
        ExternalCommand::new(self.binary.display().to_string()).args([
            "build-manifest".to_string(),
            "helm".to_string(),
            format!("--statefulset-name={}", request.statefulset_name),
            format!("--namespace={}", request.namespace),
            format!("--cloud-provider={}", request.cloud_provider),
            format!("--cloud-region={}", request.cloud_region),
            format!("--output-dir={}", request.output_dir.display()),
        ])
    }
}

#[async_trait]
impl ManifestGenerator for MigrationHelperGenerator {
    async fn generate(&self, request: &ManifestRequest) -> Result<MigrationManifestSet> {
        tokio::fs::create_dir_all(&request.output_dir)
            .await
            .map_err(|e| Error::io(request.output_dir.display().to_string(), e))?;

        info!(
            statefulset = %request.statefulset_name,
            output_dir = %request.output_dir.display(),
            "Generating migration manifests"
        );
        run_checked(self.runner.as_ref(), &self.command(request)).await?;
        MigrationManifestSet::load(&request.output_dir, request.node_count)
    }
}

/// Write a minimal manifest set for tests
#[cfg(test)]
pub(crate) fn write_test_manifests(dir: &Path, statefulset: &str, nodes: u32) {
    for i in 0..nodes {
        std::fs::write(
            dir.join(node_manifest_file(i)),
            format!(
                "apiVersion: crdb.cockroachlabs.com/v1alpha1\nkind: CrdbNode\nmetadata:\n  name: {}-{}\nspec:\n  nodeName: node-{}\n",
                statefulset, i, i
            ),
        )
        .unwrap();
    }
    std::fs::write(
        dir.join(PUBLIC_SERVICE_FILE),
        format!(
            "apiVersion: v1\nkind: Service\nmetadata:\n  name: {}-public\nspec:\n  ports:\n  - name: grpc\n    port: 26257\n",
            statefulset
        ),
    )
    .unwrap();
    std::fs::write(dir.join(VALUES_FILE), "operator:\n  enabled: true\n").unwrap();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::{MockCommandRunner, ProcessOutput};

    fn request(dir: &Path) -> ManifestRequest {
        ManifestRequest {
            statefulset_name: "crdb-test-cockroachdb".to_string(),
            namespace: "cockroach".to_string(),
            node_count: 3,
            cloud_provider: "k3d".to_string(),
            cloud_region: "us-east1".to_string(),
            output_dir: dir.to_path_buf(),
        }
    }

    #[test]
    fn test_load_reports_every_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("crdbnode-0.yaml"), "").unwrap();

        let err = MigrationManifestSet::load(dir.path(), 2).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("crdbnode-1.yaml"));
        assert!(msg.contains("public-service.yaml"));
        assert!(msg.contains("values.yaml"));
        assert!(!msg.contains("crdbnode-0.yaml"));
    }

    #[tokio::test]
    async fn test_node_objects_reads_the_ordinal_file() {
        let dir = tempfile::tempdir().unwrap();
        write_test_manifests(dir.path(), "crdb", 3);
        let set = MigrationManifestSet::load(dir.path(), 3).unwrap();

        let objects = set.node_objects(1).await.unwrap();
        assert_eq!(objects.len(), 1);
        assert_eq!(objects[0].name, "crdb-1");
        assert!(set.node_objects(3).await.is_err());
    }

    #[test]
    fn test_helper_command_line() {
        let runner = MockCommandRunner::new();
        let generator = MigrationHelperGenerator::new("bin/migration-helper", Arc::new(runner));
        let cmd = generator.command(&request(Path::new("/tmp/manifests")));
        assert_eq!(
            cmd.display(),
            "bin/migration-helper build-manifest helm --statefulset-name=crdb-test-cockroachdb \
             --namespace=cockroach --cloud-provider=k3d --cloud-region=us-east1 \
             --output-dir=/tmp/manifests"
        );
    }

    #[tokio::test]
    async fn test_generate_validates_output() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().to_path_buf();

        let mut runner = MockCommandRunner::new();
        let target = out.clone();
        runner.expect_run().times(1).returning(move |_| {
            write_test_manifests(&target, "crdb-test-cockroachdb", 3);
            Ok(ProcessOutput {
                status: Some(0),
                ..Default::default()
            })
        });

        let generator = MigrationHelperGenerator::new("migration-helper", Arc::new(runner));
        let set = generator.generate(&request(&out)).await.unwrap();
        assert_eq!(set.node_count(), 3);
        assert_eq!(set.values_path(), out.join("values.yaml"));
    }

    #[tokio::test]
    async fn test_generator_failure_is_external_tool_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut runner = MockCommandRunner::new();
        runner.expect_run().returning(|_| {
            Ok(ProcessOutput {
                stdout: String::new(),
                stderr: "statefulset not found".to_string(),
                status: Some(1),
            })
        });

        let generator = MigrationHelperGenerator::new("migration-helper", Arc::new(runner));
        let err = generator.generate(&request(dir.path())).await.unwrap_err();
        assert!(matches!(err, Error::ExternalTool { .. }));
    }
}
