//! External process execution.
//!
//! Helm, the manifest generator and the certificate script all run through
//! [`CommandRunner`], which returns a typed [`ProcessOutput`] rather than a
//! raw exit status. [`run_checked`] turns a non-zero exit into
//! [`Error::ExternalTool`] carrying stdout and stderr verbatim.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use tokio::process::Command;
use tracing::{debug, info};

use crate::{Error, Result};

/// A command line to run, with optional environment and working directory.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExternalCommand {
    /// Executable name or path
    pub program: String,
    /// Arguments, passed without shell interpretation
    pub args: Vec<String>,
    /// Extra environment variables
    pub env: Vec<(String, String)>,
    /// Working directory (inherits the current one when None)
    pub working_dir: Option<PathBuf>,
}

impl ExternalCommand {
    /// Start building a command for `program`
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    /// Append one argument
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append several arguments
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Set an environment variable
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Run from `dir`
    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Human-readable command line for logs and errors
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Captured result of a finished process.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ProcessOutput {
    /// Standard output, lossily decoded
    pub stdout: String,
    /// Standard error, lossily decoded
    pub stderr: String,
    /// Exit code; None when the process was terminated by a signal
    pub status: Option<i32>,
}

impl ProcessOutput {
    /// Whether the process exited with status 0
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }
}

/// Runs external commands.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `command` to completion and capture its output.
    ///
    /// Only spawn failures are errors here; a non-zero exit is reported in
    /// [`ProcessOutput::status`].
    async fn run(&self, command: &ExternalCommand) -> Result<ProcessOutput>;
}

/// Run `command` and fail with [`Error::ExternalTool`] unless it exits 0.
pub async fn run_checked(
    runner: &dyn CommandRunner,
    command: &ExternalCommand,
) -> Result<ProcessOutput> {
    let output = runner.run(command).await?;
    if output.success() {
        Ok(output)
    } else {
        Err(Error::ExternalTool {
            command: command.display(),
            status: output.status,
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }
}

/// [`CommandRunner`] backed by `tokio::process`.
#[derive(Clone, Debug, Default)]
pub struct TokioCommandRunner;

#[async_trait]
impl CommandRunner for TokioCommandRunner {
    async fn run(&self, command: &ExternalCommand) -> Result<ProcessOutput> {
        info!(command = %command.display(), "Running external command");

        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .envs(command.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &command.working_dir {
            cmd.current_dir(dir);
        }

        let output = cmd
            .output()
            .await
            .map_err(|e| Error::io(command.program.clone(), e))?;

        let result = ProcessOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            status: output.status.code(),
        };
        debug!(
            command = %command.program,
            status = ?result.status,
            stdout_bytes = result.stdout.len(),
            stderr_bytes = result.stderr.len(),
            "External command finished"
        );
        Ok(result)
    }
}
