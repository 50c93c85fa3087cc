//! Certificate validation and rotation on a live cluster

use crdb_migrator::pki::validate_certificates;
use crdb_migrator::rotation::{await_rotation, rotate_certificates, RotationKind};

use super::helpers::{cleanup, install_chart, test_config, test_context};

/// Story: Rotating client and node certificates replaces them in place
///
/// After the rotation job succeeds the secrets carry new certificates that
/// still chain to the same CA and still match their annotations.
#[tokio::test]
#[ignore = "requires a cluster with helm - run with: cargo test --test kind -- --ignored"]
async fn story_client_node_rotation_issues_new_certificates() {
    let config = test_config("crdb-rotate-client");
    let ctx = test_context(&config).await;
    let installer = install_chart(&ctx, &config).await;

    let before = validate_certificates(&ctx).await.expect("initial validation failed");

    let job = rotate_certificates(&ctx, RotationKind::ClientNode, &config.certificates.rotation)
        .await
        .expect("submit failed");
    let outcome = await_rotation(&ctx, &job, config.timeouts.rotation())
        .await
        .unwrap();
    assert!(outcome.is_satisfied(), "rotation job did not finish");

    let after = validate_certificates(&ctx).await.expect("validation after rotation failed");
    assert!(after.node.not_before >= before.node.not_before);
    assert_eq!(after.node.issuer, before.node.issuer);

    cleanup(&ctx, &installer).await;
}

/// Story: Rotating the CA keeps the old CA trusted until leaves move over
#[tokio::test]
#[ignore = "requires a cluster with helm - run with: cargo test --test kind -- --ignored"]
async fn story_ca_rotation_keeps_leaves_valid() {
    let config = test_config("crdb-rotate-ca");
    let ctx = test_context(&config).await;
    let installer = install_chart(&ctx, &config).await;

    let job = rotate_certificates(&ctx, RotationKind::Ca, &config.certificates.rotation)
        .await
        .expect("submit failed");
    assert!(await_rotation(&ctx, &job, config.timeouts.rotation())
        .await
        .unwrap()
        .is_satisfied());

    validate_certificates(&ctx)
        .await
        .expect("leaves no longer chain to the rotated bundle");

    // Submitting again replaces the finished job rather than conflicting.
    rotate_certificates(&ctx, RotationKind::Ca, &config.certificates.rotation)
        .await
        .expect("resubmit failed");

    cleanup(&ctx, &installer).await;
}
