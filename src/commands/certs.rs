//! `validate-certs`, `issue-certs` and `rotate-certs`

use clap::Args;
use tracing::{info, warn};

use super::Session;
use crate::pki::{validate_certificates, CertificateIssuer, ScriptCertificateIssuer};
use crate::rotation::{await_rotation, rotate_certificates, RotationKind};
use crate::{Error, Result};

/// Arguments for `rotate-certs`
#[derive(Args, Debug)]
pub struct RotateArgs {
    /// Which certificates to rotate
    #[arg(long, value_enum)]
    pub kind: RotationKind,

    /// Submit the job and return without waiting or re-validating
    #[arg(long)]
    pub no_wait: bool,
}

/// Validate the certificate secrets and log what was checked
pub async fn validate(session: &Session) -> Result<()> {
    let validated = validate_certificates(&session.ctx).await?;
    for summary in [&validated.node, &validated.client]
        .into_iter()
        .chain(validated.ca.as_ref())
    {
        info!(
            secret = %summary.secret,
            subject = %summary.subject,
            not_after = %summary.not_after,
            "Certificate valid"
        );
    }
    Ok(())
}

/// Create the certificate secrets with the configured script
pub async fn issue(session: &Session) -> Result<()> {
    let ctx = &session.ctx;
    let issuer = ScriptCertificateIssuer::new(
        &session.config.certificates.issuer_script,
        ctx.commands.clone(),
    );
    issuer
        .issue(&ctx.descriptor.release_name, ctx.namespace())
        .await?;
    info!(release = %ctx.descriptor.release_name, "Certificates issued");
    Ok(())
}

/// Rotate, wait for the job, then re-validate the secrets
pub async fn rotate(session: &Session, args: &RotateArgs) -> Result<()> {
    let ctx = &session.ctx;
    let job = rotate_certificates(ctx, args.kind, &session.config.certificates.rotation).await?;
    if args.no_wait {
        return Ok(());
    }

    let outcome = await_rotation(ctx, &job, session.config.timeouts.rotation()).await?;
    if !outcome.is_satisfied() {
        warn!(job = %job.name, "Rotation job still running; certificates not re-validated");
        return Err(Error::Timeout {
            operation: "rotation".to_string(),
            resource: job.name,
            attempts: outcome.attempts(),
            elapsed: outcome.elapsed(),
        });
    }
    validate(session).await
}
