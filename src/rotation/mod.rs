//! On-demand certificate rotation
//!
//! The chart rotates certificates from a CronJob. To rotate now, the same
//! self-signer image is run as a one-shot Job with the cron expression set so
//! that the next tick falls inside the run. The Job is fire-and-forget; the
//! caller waits for it with [`await_rotation`] and then re-validates the
//! secrets.

use std::fmt;
use std::time::Duration;

use clap::ValueEnum;
use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{Container, EnvVar, PodSpec, PodTemplateSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::context::RunContext;
use crate::poll::{poll, PollBudget, PollOutcome, PollStatus};
use crate::{Error, Result};

/// Job name used for CA rotation
pub const CA_ROTATION_JOB: &str = "ca-certificate-rotate";
/// Job name used for client and node rotation
pub const CLIENT_NODE_ROTATION_JOB: &str = "client-node-certificate-rotate";
/// Self-signer image repository
pub const SELF_SIGNER_IMAGE: &str = "gcr.io/cockroachlabs-helm-charts/cockroach-self-signer-cert";

const CONTAINER_NAME: &str = "cert-rotate-job";

/// Default wait for a rotation job
pub const ROTATION_BUDGET: PollBudget =
    PollBudget::timeout(Duration::from_secs(600), Duration::from_secs(10));

/// Budget for a deleted job to disappear before it is recreated
const JOB_DELETION_BUDGET: PollBudget = PollBudget::attempts(30, Duration::from_secs(2));

/// Which certificates to rotate.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum RotationKind {
    /// The CA certificate
    Ca,
    /// Client and node certificates
    ClientNode,
}

impl RotationKind {
    /// Fixed job name for this kind
    pub fn job_name(self) -> &'static str {
        match self {
            RotationKind::Ca => CA_ROTATION_JOB,
            RotationKind::ClientNode => CLIENT_NODE_ROTATION_JOB,
        }
    }
}

impl fmt::Display for RotationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RotationKind::Ca => f.write_str("ca"),
            RotationKind::ClientNode => f.write_str("client-node"),
        }
    }
}

/// Durations, schedule and image for a rotation.
///
/// Durations are passed to the self-signer verbatim (Go duration syntax).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RotationSettings {
    /// Self-signer image tag
    pub image_tag: String,
    /// CA certificate lifetime
    pub ca_duration: String,
    /// How long before expiry the CA is rotated
    pub ca_expiry: String,
    /// Client certificate lifetime
    pub client_duration: String,
    /// How long before expiry client certificates are rotated
    pub client_expiry: String,
    /// Node certificate lifetime
    pub node_duration: String,
    /// How long before expiry node certificates are rotated
    pub node_expiry: String,
    /// Cron schedule passed through to the job
    pub schedule: String,
    /// How long the job waits for pods to become ready between restarts
    pub readiness_wait: String,
    /// Kubernetes cluster domain
    pub cluster_domain: String,
}

impl Default for RotationSettings {
    fn default() -> Self {
        Self {
            image_tag: "1.5".to_string(),
            ca_duration: "43800h".to_string(),
            ca_expiry: "648h".to_string(),
            client_duration: "672h".to_string(),
            client_expiry: "48h".to_string(),
            node_duration: "8760h".to_string(),
            node_expiry: "168h".to_string(),
            schedule: "0 0 1 */11 *".to_string(),
            readiness_wait: "30s".to_string(),
            cluster_domain: "cluster.local".to_string(),
        }
    }
}

impl RotationSettings {
    /// Full image reference
    pub fn image(&self) -> String {
        format!("{}:{}", SELF_SIGNER_IMAGE, self.image_tag)
    }

    /// Container arguments for `kind`
    pub fn args(&self, kind: RotationKind) -> Vec<String> {
        match kind {
            RotationKind::Ca => vec![
                "rotate".to_string(),
                "--ca".to_string(),
                format!("--ca-duration={}", self.ca_duration),
                format!("--ca-expiry={}", self.ca_expiry),
                format!("--ca-cron=\"{}\"", self.schedule),
                format!("--readiness-wait={}", self.readiness_wait),
            ],
            RotationKind::ClientNode => vec![
                "rotate".to_string(),
                format!("--ca-duration={}", self.ca_duration),
                format!("--ca-expiry={}", self.ca_expiry),
                "--client".to_string(),
                format!("--client-duration={}", self.client_duration),
                format!("--client-expiry={}", self.client_expiry),
                "--node".to_string(),
                format!("--node-duration={}", self.node_duration),
                format!("--node-expiry={}", self.node_expiry),
                format!("--node-client-cron=\"{}\"", self.schedule),
                format!("--readiness-wait={}", self.readiness_wait),
            ],
        }
    }
}

/// Build the one-shot rotation Job for a StatefulSet.
pub fn build_rotation_job(
    kind: RotationKind,
    statefulset: &str,
    namespace: &str,
    service_account: &str,
    settings: &RotationSettings,
) -> Job {
    let env = [
        ("STATEFULSET_NAME", statefulset),
        ("NAMESPACE", namespace),
        ("CLUSTER_DOMAIN", settings.cluster_domain.as_str()),
    ]
    .into_iter()
    .map(|(name, value)| EnvVar {
        name: name.to_string(),
        value: Some(value.to_string()),
        ..Default::default()
    })
    .collect();

    Job {
        metadata: ObjectMeta {
            name: Some(kind.job_name().to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        spec: Some(JobSpec {
            backoff_limit: Some(1),
            template: PodTemplateSpec {
                metadata: None,
                spec: Some(PodSpec {
                    restart_policy: Some("Never".to_string()),
                    service_account_name: Some(service_account.to_string()),
                    containers: vec![Container {
                        name: CONTAINER_NAME.to_string(),
                        image: Some(settings.image()),
                        args: Some(settings.args(kind)),
                        env: Some(env),
                        ..Default::default()
                    }],
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        status: None,
    }
}

/// Handle to a submitted rotation job.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RotationJob {
    /// Job name
    pub name: String,
    /// Namespace the job runs in
    pub namespace: String,
    /// What is being rotated
    pub kind: RotationKind,
}

/// Observed job counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct JobProgress {
    /// Pods currently running
    pub active: i32,
    /// Pods that completed successfully
    pub succeeded: i32,
    /// Pods that failed
    pub failed: i32,
    /// A Complete or Failed condition is set
    pub terminal: bool,
}

impl JobProgress {
    /// Counters from a Job's status
    pub fn of(job: &Job) -> Self {
        let status = job.status.as_ref();
        Self {
            active: status.and_then(|s| s.active).unwrap_or(0),
            succeeded: status.and_then(|s| s.succeeded).unwrap_or(0),
            failed: status.and_then(|s| s.failed).unwrap_or(0),
            terminal: status
                .and_then(|s| s.conditions.as_ref())
                .is_some_and(|conditions| {
                    conditions.iter().any(|c| {
                        (c.type_ == "Complete" || c.type_ == "Failed") && c.status == "True"
                    })
                }),
        }
    }

    /// The job has finished successfully
    pub fn is_complete(&self) -> bool {
        self.succeeded >= 1
    }

    /// No pod of the job can still be working on the secrets
    pub fn is_finished(&self) -> bool {
        self.terminal || self.succeeded > 0 || self.failed > 0
    }
}

/// Submits rotation jobs and waits for them.
pub struct CertificateRotationScheduler<'a> {
    ctx: &'a RunContext,
}

impl<'a> CertificateRotationScheduler<'a> {
    /// Create a scheduler for the context's cluster
    pub fn new(ctx: &'a RunContext) -> Self {
        Self { ctx }
    }

    /// Create the rotation job, replacing a finished job of the same name.
    ///
    /// A job of the same name that has not finished is left alone and the
    /// submission is rejected, so two signers never race on the secrets.
    pub async fn submit(
        &self,
        kind: RotationKind,
        settings: &RotationSettings,
    ) -> Result<RotationJob> {
        let descriptor = &self.ctx.descriptor;
        let namespace = self.ctx.namespace();
        let cluster = self.ctx.cluster.as_ref();
        let name = kind.job_name();

        if let Some(previous) = cluster.get_job(namespace, name).await? {
            let progress = JobProgress::of(&previous);
            if !progress.is_finished() {
                warn!(job = %name, active = progress.active, "Previous rotation job is still running");
                return Err(Error::validation_for(name, "rotation job still running"));
            }
        }

        if cluster.delete_job(namespace, name).await? {
            info!(job = %name, "Deleted previous rotation job");
            poll(&JOB_DELETION_BUDGET, "job deletion", move |_| async move {
                Ok(PollStatus::from(cluster.get_job(namespace, name).await?.is_none()))
            })
            .await?
            .into_result("job deletion", name)?;
        }

        let job = build_rotation_job(
            kind,
            &descriptor.statefulset_name,
            namespace,
            &descriptor.rotation_service_account(),
            settings,
        );
        cluster.create_job(namespace, &job).await?;
        info!(
            job = %name,
            kind = %kind,
            schedule = %settings.schedule,
            "Submitted certificate rotation job"
        );

        Ok(RotationJob {
            name: name.to_string(),
            namespace: namespace.to_string(),
            kind,
        })
    }

    /// Wait until the job reports at least one success.
    pub async fn await_completion(
        &self,
        job: &RotationJob,
        budget: PollBudget,
    ) -> Result<PollOutcome> {
        let cluster = self.ctx.cluster.as_ref();
        let outcome = poll(&budget, "rotation", move |attempt| async move {
            let Some(observed) = cluster.get_job(&job.namespace, &job.name).await? else {
                debug!(job = %job.name, attempt = attempt.number, "Rotation job not found yet");
                return Ok(PollStatus::Pending);
            };
            let progress = JobProgress::of(&observed);
            if progress.active > 0 {
                info!(job = %job.name, attempt = attempt.number, "Waiting for certificate rotation job to complete");
            }
            if progress.failed > 0 {
                warn!(job = %job.name, failed = progress.failed, "Rotation job pod failed, relying on job backoff");
            }
            Ok(PollStatus::from(progress.is_complete()))
        })
        .await?;

        if outcome.is_satisfied() {
            info!(job = %job.name, elapsed = ?outcome.elapsed(), "Certificate rotation complete");
        } else {
            warn!(job = %job.name, attempts = outcome.attempts(), "Certificate rotation did not complete");
        }
        Ok(outcome)
    }
}

/// Submit a rotation job for the run's cluster.
pub async fn rotate_certificates(
    ctx: &RunContext,
    kind: RotationKind,
    settings: &RotationSettings,
) -> Result<RotationJob> {
    CertificateRotationScheduler::new(ctx)
        .submit(kind, settings)
        .await
}

/// Wait for a submitted rotation job.
pub async fn await_rotation(
    ctx: &RunContext,
    job: &RotationJob,
    budget: PollBudget,
) -> Result<PollOutcome> {
    CertificateRotationScheduler::new(ctx)
        .await_completion(job, budget)
        .await
}
