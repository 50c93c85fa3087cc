//! Operator installation on a live cluster

use crdb_migrator::install::{Installer, OperatorInstaller};

use super::helpers::{test_config, test_context};

/// Story: The operator installs from its manifest and becomes available
#[tokio::test]
#[ignore = "requires a cluster and the operator manifest - run with: cargo test --test kind -- --ignored"]
async fn story_operator_installs_and_uninstalls() {
    let config = test_config("crdb-operator-e2e");
    let ctx = test_context(&config).await;
    let installer = OperatorInstaller::new(config.operator.clone());

    installer.install(&ctx).await.expect("operator install failed");
    installer.validate(&ctx).await.expect("operator never became available");
    installer.uninstall(&ctx).await.expect("operator uninstall failed");
}
