//! Error types for crdb-migrator
//!
//! Errors are structured with fields to aid debugging a stuck migration.
//! Each variant carries the identity of the resource involved (secret, pod,
//! ordinal, command) so an operator can pick up where the run stopped.

use std::time::Duration;

use thiserror::Error;

use crate::migration::MigrationPhase;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for migration, certificate and probe operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// A bounded wait ran out of attempts or time
    #[error(
        "timed out waiting for {operation} on {resource} after {attempts} attempts ({elapsed:?})"
    )]
    Timeout {
        /// What was being waited for (e.g. "pod deletion")
        operation: String,
        /// The resource being watched
        resource: String,
        /// Number of attempts made
        attempts: u32,
        /// Wall-clock time spent polling
        elapsed: Duration,
    },

    /// A secret field did not contain a PEM block
    #[error("secret {secret} field {field} does not contain a PEM block")]
    CertificateDecode {
        /// Secret name
        secret: String,
        /// Data key inside the secret (e.g. "tls.crt")
        field: String,
    },

    /// A PEM block did not contain a well-formed X.509 certificate
    #[error("secret {secret} field {field} is not a valid X.509 certificate: {message}")]
    CertificateParse {
        /// Secret name
        secret: String,
        /// Data key inside the secret
        field: String,
        /// Parser message
        message: String,
    },

    /// A certificate does not chain to the trusted CA
    #[error("certificate in secret {secret} failed chain verification: {message}")]
    ChainVerification {
        /// Secret name
        secret: String,
        /// Why verification failed
        message: String,
    },

    /// A validity annotation on a secret does not match the certificate
    #[error(
        "secret {secret} annotation {annotation} is {actual:?}, certificate says {expected}"
    )]
    AnnotationMismatch {
        /// Secret name
        secret: String,
        /// Annotation key
        annotation: String,
        /// Value derived from the certificate
        expected: String,
        /// Value found on the secret (None when the annotation is missing)
        actual: Option<String>,
    },

    /// A functional check observed the wrong data
    #[error("assertion failed for {check}: expected {expected}, got {actual}")]
    Assertion {
        /// The check that failed
        check: String,
        /// Expected value
        expected: String,
        /// Observed value
        actual: String,
    },

    /// An external tool exited unsuccessfully
    #[error("command `{command}` failed with status {status:?}: {stderr}")]
    ExternalTool {
        /// Rendered command line
        command: String,
        /// Exit code (None when killed by a signal)
        status: Option<i32>,
        /// Captured standard output
        stdout: String,
        /// Captured standard error
        stderr: String,
    },

    /// A fatal error while migrating a single ordinal
    #[error(
        "migration of ordinal {ordinal} failed during {phase} (already migrated: {migrated:?}): {source}"
    )]
    Migration {
        /// Ordinal that was in flight
        ordinal: u32,
        /// Phase the ordinal was in
        phase: MigrationPhase,
        /// Ordinals that completed before the failure
        migrated: Vec<u32>,
        /// Underlying cause
        #[source]
        source: Box<Error>,
    },

    /// Invalid input or cluster state that makes an operation unsafe to start
    #[error("validation error for {resource}: {message}")]
    Validation {
        /// Resource being validated
        resource: String,
        /// Description of what's invalid
        message: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The document or resource kind being processed (if known)
        kind: Option<String>,
    },

    /// SQL connection or statement error
    #[error("database error [{context}]: {message}")]
    Database {
        /// Description of what failed
        message: String,
        /// Statement or connection target
        context: String,
    },

    /// Filesystem error
    #[error("io error on {path}: {source}")]
    Io {
        /// Path being read or written
        path: String,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Where the error occurred
        context: String,
    },
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            resource: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
        }
    }

    /// Create a validation error naming the offending resource
    pub fn validation_for(resource: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            resource: resource.into(),
            message: msg.into(),
        }
    }

    /// Create a serialization error
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: None,
        }
    }

    /// Create a serialization error for a specific document kind
    pub fn serialization_for(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: Some(kind.into()),
        }
    }

    /// Create a database error
    pub fn database(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Database {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Create an io error for a path
    pub fn io(path: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Create an assertion failure
    pub fn assertion(
        check: impl Into<String>,
        expected: impl std::fmt::Display,
        actual: impl std::fmt::Display,
    ) -> Self {
        Self::Assertion {
            check: check.into(),
            expected: expected.to_string(),
            actual: actual.to_string(),
        }
    }

    /// Check if this error is retryable
    ///
    /// Transport-level API failures and internal errors may succeed on a later
    /// attempt. Certificate, assertion and validation errors never will.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => match source {
                kube::Error::Api(resp) => resp.code >= 500 || resp.code == 429,
                _ => true,
            },
            Error::Internal { .. } => true,
            Error::Migration { source, .. } => source.is_retryable(),
            _ => false,
        }
    }

    /// Return true when this error reports a certificate problem
    pub fn is_certificate_error(&self) -> bool {
        matches!(
            self,
            Error::CertificateDecode { .. }
                | Error::CertificateParse { .. }
                | Error::ChainVerification { .. }
                | Error::AnnotationMismatch { .. }
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::serialization(e.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Error::serialization_for("yaml", e.to_string())
    }
}

impl From<tokio_postgres::Error> for Error {
    fn from(e: tokio_postgres::Error) -> Self {
        Error::database("postgres", e.to_string())
    }
}
