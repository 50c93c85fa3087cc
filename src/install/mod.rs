//! Installing and tearing down the database or the operator
//!
//! Both flows go through the [`Installer`] trait so commands do not care
//! which one the configuration selected:
//!
//! - [`HelmChartInstaller`] installs the CockroachDB chart, then validates
//!   certificates, readiness and SQL
//! - [`OperatorInstaller`] applies the operator manifests and waits for its
//!   Deployment

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use serde_json::json;
use tracing::info;

use crate::cluster::{deployment_is_available, service_is_available, ManifestObject};
use crate::config::{ChartConfig, InstallerKind, OperatorConfig, SqlConfig};
use crate::context::RunContext;
use crate::helm::{HelmRelease, ReleaseManager};
use crate::manifests::read_objects;
use crate::pki::validate_certificates;
use crate::poll::{poll, PollBudget, PollStatus};
use crate::probe::{DatabaseFunctionalProbe, PgConnector, SqlConnector};
use crate::readiness::{ClusterReadinessWatcher, ReadinessTarget, REPLICA_SET_READY_BUDGET};
use crate::{Error, Result};

/// PriorityClass the operator's pods run with
pub const PRIORITY_CLASS_NAME: &str = "crdb-critical";
/// Value of [`PRIORITY_CLASS_NAME`]
pub const PRIORITY_CLASS_VALUE: i64 = 500_000_000;

/// Budget for the public service to become available after install
pub const SERVICE_READY_BUDGET: PollBudget = PollBudget::attempts(30, Duration::from_secs(2));

/// Budget for the operator Deployment to become available
pub const OPERATOR_READY_BUDGET: PollBudget =
    PollBudget::timeout(Duration::from_secs(300), Duration::from_secs(10));

/// Installs, validates and removes a component.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Installer: Send + Sync {
    /// Install the component
    async fn install(&self, ctx: &RunContext) -> Result<()>;

    /// Check the installed component works
    async fn validate(&self, ctx: &RunContext) -> Result<()>;

    /// Remove the component and everything it created
    async fn uninstall(&self, ctx: &RunContext) -> Result<()>;
}

/// Pick the installer named by `kind`
pub fn installer_for(
    kind: InstallerKind,
    releases: Arc<dyn ReleaseManager>,
    chart: &ChartConfig,
    operator: &OperatorConfig,
    sql: &SqlConfig,
) -> Box<dyn Installer> {
    match kind {
        InstallerKind::Helm => Box::new(HelmChartInstaller::new(releases, chart.clone(), sql.clone())),
        InstallerKind::Operator => Box::new(OperatorInstaller::new(operator.clone())),
    }
}

/// Installs the CockroachDB Helm chart.
pub struct HelmChartInstaller {
    releases: Arc<dyn ReleaseManager>,
    chart: ChartConfig,
    sql: SqlConfig,
    connector: Option<Arc<dyn SqlConnector>>,
}

impl HelmChartInstaller {
    /// Create an installer for `chart`
    pub fn new(releases: Arc<dyn ReleaseManager>, chart: ChartConfig, sql: SqlConfig) -> Self {
        Self {
            releases,
            chart,
            sql,
            connector: None,
        }
    }

    /// Use a specific SQL connector instead of connecting to the first pod
    pub fn with_connector(mut self, connector: Arc<dyn SqlConnector>) -> Self {
        self.connector = Some(connector);
        self
    }

    fn release(&self, ctx: &RunContext) -> HelmRelease {
        self.chart.set_values.iter().fold(
            HelmRelease::new(
                &ctx.descriptor.release_name,
                &self.chart.path,
                ctx.namespace(),
            ),
            |release, (key, value)| release.with_set(key, value),
        )
    }

    async fn connector(&self, ctx: &RunContext) -> Result<Arc<dyn SqlConnector>> {
        if let Some(connector) = &self.connector {
            return Ok(connector.clone());
        }
        let connector = PgConnector::from_context(ctx, self.sql.host.clone(), self.sql.port)
            .await?
            .with_user(&self.sql.user);
        Ok(Arc::new(connector))
    }

    async fn assert_secret_absent(&self, ctx: &RunContext, name: &str) -> Result<()> {
        if ctx.cluster.get_secret(ctx.namespace(), name).await?.is_some() {
            return Err(Error::assertion(
                format!("secret {} removed on uninstall", name),
                "absent",
                "present",
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl Installer for HelmChartInstaller {
    async fn install(&self, ctx: &RunContext) -> Result<()> {
        let namespace = ctx.namespace();
        ctx.cluster.ensure_namespace(namespace).await?;
        self.releases.install(&self.release(ctx)).await?;

        let service = ctx.descriptor.public_service_name();
        let cluster = ctx.cluster.as_ref();
        let name = service.as_str();
        poll(&SERVICE_READY_BUDGET, "service availability", move |_| async move {
            let available = cluster
                .get_service(namespace, name)
                .await?
                .map(|s| service_is_available(&s))
                .unwrap_or(false);
            Ok(PollStatus::from(available))
        })
        .await?
        .into_result("service availability", name)?;

        info!(release = %ctx.descriptor.release_name, service = %service, "Chart installed");
        Ok(())
    }

    async fn validate(&self, ctx: &RunContext) -> Result<()> {
        if ctx.descriptor.is_secure() && self.chart.self_signer_enabled() {
            validate_certificates(ctx).await?;
        }

        let statefulset = &ctx.descriptor.statefulset_name;
        ClusterReadinessWatcher::from_context(ctx)
            .await_ready(
                &ReadinessTarget::ReplicaSet {
                    name: statefulset.clone(),
                },
                REPLICA_SET_READY_BUDGET,
            )
            .await?
            .into_result("replica set readiness", statefulset)?;

        DatabaseFunctionalProbe::new(self.connector(ctx).await?)
            .probe_functionality(&self.sql.database, self.sql.expected_rows)
            .await
    }

    async fn uninstall(&self, ctx: &RunContext) -> Result<()> {
        let descriptor = &ctx.descriptor;
        let namespace = ctx.namespace();
        self.releases
            .uninstall(&descriptor.release_name, namespace)
            .await?;

        if descriptor.is_secure() && self.chart.self_signer_enabled() {
            self.assert_secret_absent(ctx, &descriptor.client_secret).await?;
            self.assert_secret_absent(ctx, &descriptor.node_secret).await?;
            if descriptor.ca_is_external {
                if ctx
                    .cluster
                    .get_secret(namespace, &descriptor.ca_secret)
                    .await?
                    .is_none()
                {
                    return Err(Error::assertion(
                        format!("external CA secret {} kept on uninstall", descriptor.ca_secret),
                        "present",
                        "absent",
                    ));
                }
            } else {
                self.assert_secret_absent(ctx, &descriptor.ca_secret).await?;
            }
        }

        ctx.cluster.delete_namespace(namespace).await?;
        info!(release = %descriptor.release_name, namespace = %namespace, "Chart uninstalled");
        Ok(())
    }
}

/// Installs the CockroachDB operator from a manifest file.
pub struct OperatorInstaller {
    operator: OperatorConfig,
}

impl OperatorInstaller {
    /// Create an installer for `operator`
    pub fn new(operator: OperatorConfig) -> Self {
        Self { operator }
    }
}

/// The PriorityClass operator pods are scheduled with
pub fn priority_class() -> Result<ManifestObject> {
    ManifestObject::from_value(json!({
        "apiVersion": "scheduling.k8s.io/v1",
        "kind": "PriorityClass",
        "metadata": { "name": PRIORITY_CLASS_NAME },
        "value": PRIORITY_CLASS_VALUE,
        "globalDefault": false,
        "description": "Priority for CockroachDB operator and nodes",
    }))
}

#[async_trait]
impl Installer for OperatorInstaller {
    async fn install(&self, ctx: &RunContext) -> Result<()> {
        let namespace = self.operator.namespace.as_str();
        ctx.cluster.apply(namespace, &priority_class()?).await?;

        let objects = read_objects(&self.operator.manifest_path).await?;
        for object in &objects {
            ctx.cluster.apply(namespace, object).await?;
        }
        info!(
            manifest = %self.operator.manifest_path.display(),
            objects = objects.len(),
            "Operator manifests applied"
        );
        Ok(())
    }

    async fn validate(&self, ctx: &RunContext) -> Result<()> {
        let cluster = ctx.cluster.as_ref();
        let namespace = self.operator.namespace.as_str();
        let name = self.operator.deployment.as_str();
        poll(&OPERATOR_READY_BUDGET, "operator availability", move |_| async move {
            let available = cluster
                .get_deployment(namespace, name)
                .await?
                .map(|d| deployment_is_available(&d))
                .unwrap_or(false);
            Ok(PollStatus::from(available))
        })
        .await?
        .into_result("operator availability", name)?;
        info!(deployment = %name, "Operator is available");
        Ok(())
    }

    async fn uninstall(&self, ctx: &RunContext) -> Result<()> {
        ctx.cluster.delete_namespace(&self.operator.namespace).await?;
        info!(namespace = %self.operator.namespace, "Operator removed");
        Ok(())
    }
}
