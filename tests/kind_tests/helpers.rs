//! Shared setup for the cluster-backed tests

use std::path::PathBuf;
use std::sync::{Arc, Once};

use crdb_migrator::cluster::create_client;
use crdb_migrator::config::MigratorConfig;
use crdb_migrator::context::RunContext;
use crdb_migrator::helm::HelmCli;
use crdb_migrator::install::{HelmChartInstaller, Installer};
use crdb_migrator::process::TokioCommandRunner;

/// Config file used by every test, from `CRDB_MIGRATOR_TEST_CONFIG`
pub const CONFIG_ENV: &str = "CRDB_MIGRATOR_TEST_CONFIG";

static INIT: Once = Once::new();

fn init() {
    INIT.call_once(|| {
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
        let _ = tracing_subscriber::fmt()
            .with_env_filter("info,crdb_migrator=debug")
            .with_test_writer()
            .try_init();
    });
}

/// Load the test configuration, scoped to `namespace`
pub fn test_config(namespace: &str) -> MigratorConfig {
    let path = std::env::var(CONFIG_ENV).ok().map(PathBuf::from);
    let mut config = MigratorConfig::load(path.as_deref()).expect("failed to load test config");
    config.cluster.namespace = namespace.to_string();
    config
}

/// Connect to the test cluster and build a context for `config`
pub async fn test_context(config: &MigratorConfig) -> RunContext {
    init();
    let client = create_client(None)
        .await
        .expect("failed to connect to test cluster");
    RunContext::builder(client, config.descriptor())
        .pod_selector(config.cluster.pod_selector.clone())
        .build()
}

/// Helm client running real `helm`
pub fn helm() -> Arc<HelmCli> {
    Arc::new(HelmCli::new(Arc::new(TokioCommandRunner)))
}

/// Chart installer for `config`
pub fn chart_installer(config: &MigratorConfig) -> HelmChartInstaller {
    HelmChartInstaller::new(helm(), config.chart.clone(), config.sql.clone())
}

/// Install the chart and wait until it validates
pub async fn install_chart(ctx: &RunContext, config: &MigratorConfig) -> HelmChartInstaller {
    let installer = chart_installer(config);
    installer.install(ctx).await.expect("chart install failed");
    installer.validate(ctx).await.expect("chart validation failed");
    installer
}

/// Best-effort removal of everything a test installed
pub async fn cleanup(ctx: &RunContext, installer: &HelmChartInstaller) {
    if let Err(e) = installer.uninstall(ctx).await {
        eprintln!("cleanup failed: {}", e);
        let _ = ctx.cluster.delete_namespace(ctx.namespace()).await;
    }
}
