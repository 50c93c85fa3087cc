//! Migration of a live Helm-installed cluster

use std::sync::Arc;

use crdb_migrator::cutover::ServiceCutoverManager;
use crdb_migrator::manifests::{ManifestGenerator, ManifestRequest, MigrationHelperGenerator};
use crdb_migrator::migration::{run_migration, NodeMigrationOrchestrator};
use crdb_migrator::probe::{probe_functionality, DatabaseFunctionalProbe, PgConnector};
use crdb_migrator::readiness::{ClusterReadinessWatcher, ReadinessTarget, NODE_READY_BUDGET};

use super::helpers::{cleanup, helm, install_chart, test_config, test_context};

/// Story: A three node cluster moves to CrdbNodes without losing data
///
/// The chart is installed and seeded, manifests are generated, every ordinal
/// is migrated from the highest down, and the release is handed over to the
/// operator. The seeded rows must survive unchanged.
#[tokio::test]
#[ignore = "requires a cluster with helm and migration-helper - run with: cargo test --test kind -- --ignored"]
async fn story_helm_cluster_migrates_to_crdb_nodes() {
    let config = test_config("crdb-migrate-e2e");
    let ctx = test_context(&config).await;
    let installer = install_chart(&ctx, &config).await;

    let sql = &config.sql;
    let connector = PgConnector::from_context(&ctx, sql.host.clone(), sql.port)
        .await
        .expect("failed to build SQL connector");
    let probe = DatabaseFunctionalProbe::new(Arc::new(connector));
    probe_functionality(&probe, &sql.database, sql.expected_rows)
        .await
        .expect("seeding failed");

    let request = ManifestRequest {
        statefulset_name: ctx.descriptor.statefulset_name.clone(),
        namespace: ctx.namespace().to_string(),
        node_count: config.cluster.desired_nodes,
        cloud_provider: config.manifests.cloud_provider.clone(),
        cloud_region: config.manifests.cloud_region.clone(),
        output_dir: tempfile::tempdir().unwrap().keep(),
    };
    let manifests = MigrationHelperGenerator::new(&config.manifests.helper_binary, ctx.commands.clone())
        .generate(&request)
        .await
        .expect("manifest generation failed");

    let report = run_migration(&ctx, &manifests)
        .await
        .expect("migration failed");
    assert_eq!(report.migrated, vec![2, 1, 0]);

    let watcher = ClusterReadinessWatcher::from_context(&ctx);
    for ordinal in 0..config.cluster.desired_nodes {
        let outcome = watcher
            .await_ready(
                &ReadinessTarget::Node {
                    pod_name: ctx.descriptor.pod_name(ordinal),
                },
                NODE_READY_BUDGET,
            )
            .await
            .unwrap();
        assert!(outcome.is_satisfied(), "node {} not ready", ordinal);
    }

    // A second run finds every ordinal migrated and does nothing.
    let rerun = NodeMigrationOrchestrator::new(&ctx)
        .run(&manifests)
        .await
        .expect("re-run failed");
    assert!(rerun.migrated.is_empty());

    let releases = helm();
    ServiceCutoverManager::new(&ctx, releases.as_ref(), &config.chart.path)
        .cutover(&manifests)
        .await
        .expect("cutover failed");

    probe
        .verify_existing(&sql.database, sql.expected_rows)
        .await
        .expect("data changed during migration");

    cleanup(&ctx, &installer).await;
}
