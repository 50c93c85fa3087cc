//! Initial certificate issuance for a release

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use tracing::info;

use crate::process::{run_checked, CommandRunner, ExternalCommand};
use crate::Result;

/// Issues the node, client and CA certificates for a release.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CertificateIssuer: Send + Sync {
    /// Create the certificate secrets for `release` in `namespace`
    async fn issue(&self, release: &str, namespace: &str) -> Result<()>;
}

/// [`CertificateIssuer`] backed by a shell script (e.g. `generate-certs.sh`).
///
/// The script receives the release and namespace through `RELEASE_NAME` and
/// `NAMESPACE`.
pub struct ScriptCertificateIssuer {
    script: PathBuf,
    runner: Arc<dyn CommandRunner>,
}

impl ScriptCertificateIssuer {
    /// Run `script` through `runner`
    pub fn new(script: impl Into<PathBuf>, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            script: script.into(),
            runner,
        }
    }

    /// The command line for a release
    pub fn command(&self, release: &str, namespace: &str) -> ExternalCommand {
        let mut cmd = ExternalCommand::new(self.script.display().to_string())
            .env("RELEASE_NAME", release)
            .env("NAMESPACE", namespace);
        if let Some(dir) = self.script.parent().filter(|d| !d.as_os_str().is_empty()) {
            cmd = cmd.current_dir(dir);
        }
        cmd
    }
}

#[async_trait]
impl CertificateIssuer for ScriptCertificateIssuer {
    async fn issue(&self, release: &str, namespace: &str) -> Result<()> {
        info!(release = %release, namespace = %namespace, script = %self.script.display(), "Issuing certificates");
        run_checked(self.runner.as_ref(), &self.command(release, namespace)).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::{MockCommandRunner, ProcessOutput};
    use crate::Error;

    #[tokio::test]
    async fn test_script_gets_release_and_namespace() {
        let mut runner = MockCommandRunner::new();
        runner
            .expect_run()
            .withf(|cmd| {
                let env = |key: &str| {
                    cmd.env
                        .iter()
                        .find(|(k, _)| k == key)
                        .map(|(_, v)| v.as_str())
                };
                env("RELEASE_NAME") == Some("crdb-test")
                    && env("NAMESPACE") == Some("cockroach")
                    && cmd.working_dir.as_deref() == Some(std::path::Path::new("scripts"))
            })
            .times(1)
            .returning(|_| {
                Ok(ProcessOutput {
                    status: Some(0),
                    ..Default::default()
                })
            });

        let issuer = ScriptCertificateIssuer::new("scripts/generate-certs.sh", Arc::new(runner));
        issuer.issue("crdb-test", "cockroach").await.unwrap();
    }

    #[tokio::test]
    async fn test_script_failure_keeps_output() {
        let mut runner = MockCommandRunner::new();
        runner.expect_run().returning(|_| {
            Ok(ProcessOutput {
                stdout: "creating CA".to_string(),
                stderr: "cockroach: command not found".to_string(),
                status: Some(127),
            })
        });

        let issuer = ScriptCertificateIssuer::new("generate-certs.sh", Arc::new(runner));
        match issuer.issue("crdb-test", "cockroach").await.unwrap_err() {
            Error::ExternalTool {
                status,
                stdout,
                stderr,
                ..
            } => {
                assert_eq!(status, Some(127));
                assert_eq!(stdout, "creating CA");
                assert_eq!(stderr, "cockroach: command not found");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }
}
