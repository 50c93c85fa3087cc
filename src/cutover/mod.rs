//! Final hand-over from the Helm StatefulSet to the operator
//!
//! Runs once every ordinal is served by a CrdbNode. Each step is idempotent so
//! a cutover interrupted half way can simply be re-run.

use tracing::info;

use crate::context::RunContext;
use crate::helm::{HelmRelease, ReleaseManager};
use crate::manifests::MigrationManifestSet;
use crate::retry::{retry_transient, RetryConfig};
use crate::Result;

/// What a cutover changed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CutoverReport {
    /// Objects applied from the public service manifest
    pub services_applied: usize,
    /// Whether the StatefulSet's disruption budget was removed by this run
    pub budget_deleted: bool,
}

/// Switches serving and ownership over to the operator.
pub struct ServiceCutoverManager<'a> {
    ctx: &'a RunContext,
    releases: &'a dyn ReleaseManager,
    chart: String,
    retry: RetryConfig,
}

impl<'a> ServiceCutoverManager<'a> {
    /// Create a manager upgrading the release to `chart`
    pub fn new(
        ctx: &'a RunContext,
        releases: &'a dyn ReleaseManager,
        chart: impl Into<String>,
    ) -> Self {
        Self {
            ctx,
            releases,
            chart: chart.into(),
            retry: RetryConfig::default(),
        }
    }

    /// Override the retry policy for cluster mutations
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Apply the public service, drop the disruption budget and upgrade the
    /// release with the operator values.
    pub async fn cutover(&self, manifests: &MigrationManifestSet) -> Result<CutoverReport> {
        let descriptor = &self.ctx.descriptor;
        let namespace = self.ctx.namespace();
        let cluster = self.ctx.cluster.as_ref();

        let services = manifests.public_service_objects().await?;
        for object in &services {
            retry_transient(&self.retry, "apply-public-service", move || {
                cluster.apply(namespace, object)
            })
            .await?;
            info!(resource = %object.reference(), "Applied public service");
        }

        let budget = descriptor.disruption_budget_name();
        let budget_deleted = cluster
            .delete_pod_disruption_budget(namespace, &budget)
            .await?;
        if budget_deleted {
            info!(budget = %budget, "Deleted StatefulSet disruption budget");
        } else {
            info!(budget = %budget, "Disruption budget already gone");
        }

        let release = HelmRelease::new(&descriptor.release_name, &self.chart, namespace)
            .with_values_file(manifests.values_path());
        self.releases.upgrade(&release).await?;
        info!(release = %descriptor.release_name, "Release switched to operator mode");

        Ok(CutoverReport {
            services_applied: services.len(),
            budget_deleted,
        })
    }
}
