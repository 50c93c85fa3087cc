//! `generate-manifests`, `migrate` and `probe`

use clap::Args;
use tracing::info;

use super::Session;
use crate::cutover::ServiceCutoverManager;
use crate::manifests::{ManifestGenerator, MigrationHelperGenerator, MigrationManifestSet};
use crate::migration::NodeMigrationOrchestrator;
use crate::probe::probe_functionality;
use crate::Result;

/// Arguments for `migrate`
#[derive(Args, Debug)]
pub struct MigrateArgs {
    /// Generate manifests before migrating instead of loading existing ones
    #[arg(long)]
    pub generate: bool,

    /// Stop after the last ordinal, leaving the service and release untouched
    #[arg(long)]
    pub skip_cutover: bool,

    /// Skip seeding the probe table before and verifying it after the run
    #[arg(long)]
    pub skip_data_check: bool,
}

/// Arguments for `probe`
#[derive(Args, Debug)]
pub struct ProbeArgs {
    /// Only read existing rows, never create or seed
    #[arg(long)]
    pub verify_only: bool,
}

/// Run the migration helper for the configured cluster
pub async fn generate(session: &Session) -> Result<MigrationManifestSet> {
    let config = &session.config.manifests;
    let generator =
        MigrationHelperGenerator::new(&config.helper_binary, session.ctx.commands.clone());
    let manifests = generator.generate(&session.manifest_request()).await?;
    info!(
        dir = %manifests.dir().display(),
        nodes = manifests.node_count(),
        "Manifests generated"
    );
    Ok(manifests)
}

/// Seed the probe table, migrate every remaining ordinal, cut over, then
/// check the seeded rows survived
pub async fn run(session: &Session, args: &MigrateArgs) -> Result<()> {
    let config = &session.config;
    let ctx = &session.ctx;

    let manifests = if args.generate {
        generate(session).await?
    } else {
        MigrationManifestSet::load(&config.manifests.output_dir, config.cluster.desired_nodes)?
    };

    let probe = if args.skip_data_check {
        info!("Skipping data check");
        None
    } else {
        let probe = session.probe().await?;
        probe_functionality(&probe, &config.sql.database, config.sql.expected_rows).await?;
        Some(probe)
    };

    let report = NodeMigrationOrchestrator::new(ctx)
        .with_budgets(config.timeouts.migration_budgets())
        .run(&manifests)
        .await?;
    info!(
        migrated = ?report.migrated,
        skipped = ?report.skipped,
        "All ordinals served by CrdbNodes"
    );

    if args.skip_cutover {
        info!("Skipping cutover");
    } else {
        let helm = session.helm();
        let cutover = ServiceCutoverManager::new(ctx, helm.as_ref(), &config.chart.path)
            .cutover(&manifests)
            .await?;
        info!(
            services = cutover.services_applied,
            budget_deleted = cutover.budget_deleted,
            "Cutover complete"
        );
    }

    if let Some(probe) = probe {
        probe
            .verify_existing(&config.sql.database, config.sql.expected_rows)
            .await?;
    }
    Ok(())
}

/// Seed and assert the probe table, or only verify it
pub async fn probe(session: &Session, args: &ProbeArgs) -> Result<()> {
    let sql = &session.config.sql;
    let probe = session.probe().await?;
    if args.verify_only {
        probe.verify_existing(&sql.database, sql.expected_rows).await
    } else {
        probe_functionality(&probe, &sql.database, sql.expected_rows).await
    }
}
