//! Helm release management.
//!
//! [`ReleaseManager`] is the seam between the cutover/installer logic and the
//! `helm` binary; [`HelmCli`] runs it through a [`CommandRunner`].

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use tracing::{info, warn};

use crate::process::{run_checked, CommandRunner, ExternalCommand};
use crate::{Error, Result};

/// stderr fragment helm prints when `--wait` gives up on resource deletion
const HELM_WAIT_TIMEOUT: &str = "timed out waiting for the condition";

/// A Helm release and the values it is rendered with.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HelmRelease {
    /// Release name
    pub name: String,
    /// Chart reference (path or repo/chart)
    pub chart: String,
    /// Namespace of the release
    pub namespace: String,
    /// `--set key=value` overrides, rendered in key order
    pub set_values: BTreeMap<String, String>,
    /// `--values` files, rendered in order
    pub values_files: Vec<PathBuf>,
}

impl HelmRelease {
    /// A release with no overrides
    pub fn new(
        name: impl Into<String>,
        chart: impl Into<String>,
        namespace: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            chart: chart.into(),
            namespace: namespace.into(),
            ..Default::default()
        }
    }

    /// Add a values file
    pub fn with_values_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.values_files.push(path.into());
        self
    }

    /// Add a `--set` override
    pub fn with_set(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.set_values.insert(key.into(), value.into());
        self
    }

    fn value_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        for (key, value) in &self.set_values {
            args.push("--set".to_string());
            args.push(format!("{}={}", key, value));
        }
        for file in &self.values_files {
            args.push("--values".to_string());
            args.push(file.display().to_string());
        }
        args
    }
}

/// Installs, upgrades and removes Helm releases.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ReleaseManager: Send + Sync {
    /// Install a release
    async fn install(&self, release: &HelmRelease) -> Result<()>;

    /// Upgrade an existing release in place
    async fn upgrade(&self, release: &HelmRelease) -> Result<()>;

    /// Uninstall a release and wait for its resources to go away
    async fn uninstall(&self, name: &str, namespace: &str) -> Result<()>;
}

/// [`ReleaseManager`] that shells out to the `helm` binary.
pub struct HelmCli {
    binary: String,
    runner: Arc<dyn CommandRunner>,
    kubeconfig: Option<PathBuf>,
}

impl HelmCli {
    /// Use `helm` from PATH
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            binary: "helm".to_string(),
            runner,
            kubeconfig: None,
        }
    }

    /// Point helm at a specific kubeconfig
    pub fn with_kubeconfig(mut self, kubeconfig: Option<PathBuf>) -> Self {
        self.kubeconfig = kubeconfig;
        self
    }

    fn base(&self, verb: &str, name: &str, namespace: &str) -> ExternalCommand {
        let mut cmd = ExternalCommand::new(&self.binary)
            .args([verb, name])
            .args(["--namespace", namespace]);
        if let Some(path) = &self.kubeconfig {
            cmd = cmd.args(["--kubeconfig".to_string(), path.display().to_string()]);
        }
        cmd
    }

    /// Command line for `helm install`
    pub fn install_command(&self, release: &HelmRelease) -> ExternalCommand {
        self.base("install", &release.name, &release.namespace)
            .arg(&release.chart)
            .args(release.value_args())
    }

    /// Command line for `helm upgrade`
    pub fn upgrade_command(&self, release: &HelmRelease) -> ExternalCommand {
        self.base("upgrade", &release.name, &release.namespace)
            .arg(&release.chart)
            .args(release.value_args())
    }

    /// Command line for `helm uninstall`
    pub fn uninstall_command(&self, name: &str, namespace: &str) -> ExternalCommand {
        self.base("uninstall", name, namespace).arg("--wait")
    }
}

#[async_trait]
impl ReleaseManager for HelmCli {
    async fn install(&self, release: &HelmRelease) -> Result<()> {
        info!(release = %release.name, chart = %release.chart, "Installing Helm release");
        run_checked(self.runner.as_ref(), &self.install_command(release)).await?;
        Ok(())
    }

    async fn upgrade(&self, release: &HelmRelease) -> Result<()> {
        info!(release = %release.name, chart = %release.chart, "Upgrading Helm release");
        run_checked(self.runner.as_ref(), &self.upgrade_command(release)).await?;
        Ok(())
    }

    async fn uninstall(&self, name: &str, namespace: &str) -> Result<()> {
        info!(release = %name, "Uninstalling Helm release");
        match run_checked(self.runner.as_ref(), &self.uninstall_command(name, namespace)).await {
            Ok(_) => Ok(()),
            Err(Error::ExternalTool { stderr, .. }) if stderr.contains(HELM_WAIT_TIMEOUT) => {
                warn!(release = %name, "Helm gave up waiting for resource deletion, continuing");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}
