//! crdb-migrator - moves Helm-managed CockroachDB onto per-node resources
//!
//! A Helm chart runs CockroachDB as one StatefulSet. The operator instead
//! manages one CrdbNode per database node. This crate migrates a running
//! cluster between the two, one ordinal at a time and without losing quorum,
//! and manages the certificates the cluster depends on along the way.
//!
//! # Architecture
//!
//! Every command builds a [`context::RunContext`] once and passes it down.
//! Kubernetes access, external processes, Helm and SQL sit behind traits so
//! each flow can be driven end to end against in-memory fakes.
//!
//! # Modules
//!
//! - [`migration`] - Per-ordinal migration state machine
//! - [`cutover`] - Final service, disruption budget and release hand-over
//! - [`readiness`] - Waits on StatefulSet, CrdbNode and pod state
//! - [`pki`] - Certificate secret validation and issuance
//! - [`rotation`] - On-demand certificate rotation jobs
//! - [`probe`] - SQL functional checks
//! - [`install`] - Chart and operator installers
//! - [`manifests`] - Generated migration manifests
//! - [`cluster`] - Kubernetes access
//! - [`helm`] - Helm releases
//! - [`process`] - External command execution
//! - [`poll`] / [`retry`] - Bounded waiting and transient retries
//! - [`config`], [`telemetry`], [`commands`] - Configuration, logging and CLI
//! - [`error`] - Error types

#![deny(missing_docs)]

pub mod cluster;
pub mod commands;
pub mod config;
pub mod context;
pub mod cutover;
pub mod descriptor;
pub mod error;
pub mod helm;
pub mod install;
pub mod manifests;
pub mod migration;
pub mod pki;
pub mod poll;
pub mod probe;
pub mod process;
pub mod readiness;
pub mod retry;
pub mod rotation;
pub mod telemetry;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;
