//! Command-line interface
//!
//! Every subcommand loads [`MigratorConfig`], applies the global flag
//! overrides and builds a [`Session`] holding the run's context.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{debug, info};

use crate::cluster::create_client;
use crate::config::MigratorConfig;
use crate::context::RunContext;
use crate::helm::HelmCli;
use crate::manifests::ManifestRequest;
use crate::probe::{DatabaseFunctionalProbe, PgConnector};
use crate::telemetry::LogFormat;
use crate::Result;

pub mod certs;
pub mod install;
pub mod migrate;

/// Migrate Helm-managed CockroachDB clusters to per-node resources
#[derive(Parser, Debug)]
#[command(name = "crdb-migrator", version, about, long_about = None)]
pub struct Cli {
    /// Path to kubeconfig (inferred when unset)
    #[arg(long, env = "KUBECONFIG", global = true)]
    pub kubeconfig: Option<PathBuf>,

    /// Path to the YAML configuration file
    #[arg(short = 'c', long = "config", global = true)]
    pub config: Option<PathBuf>,

    /// Namespace of the CockroachDB release (overrides the config file)
    #[arg(short = 'n', long, global = true)]
    pub namespace: Option<String>,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    pub log_format: LogFormat,

    /// Subcommand to run
    #[command(subcommand)]
    pub command: Commands,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Generate per-node manifests for the running StatefulSet
    GenerateManifests,

    /// Migrate every StatefulSet ordinal to a CrdbNode and hand over to the operator
    Migrate(migrate::MigrateArgs),

    /// Validate the node, client and CA certificate secrets
    ValidateCerts,

    /// Issue certificate secrets with the configured script
    IssueCerts,

    /// Rotate certificates now and wait for the rotation to finish
    RotateCerts(certs::RotateArgs),

    /// Seed and check the probe table
    Probe(migrate::ProbeArgs),

    /// Install the configured component
    Install,

    /// Validate the installed component
    Validate,

    /// Remove the installed component
    Uninstall,
}

impl Cli {
    /// Load the configuration with flag overrides applied
    pub fn load_config(&self) -> Result<MigratorConfig> {
        let mut config = MigratorConfig::load(self.config.as_deref())?;
        if let Some(namespace) = &self.namespace {
            config.cluster.namespace = namespace.clone();
            config.validate()?;
        }
        Ok(config)
    }

    /// Run the selected subcommand
    pub async fn run(self) -> Result<()> {
        let config = self.load_config()?;
        let session = Session::connect(self.kubeconfig.clone(), config).await?;
        match self.command {
            Commands::GenerateManifests => migrate::generate(&session).await.map(|_| ()),
            Commands::Migrate(args) => migrate::run(&session, &args).await,
            Commands::ValidateCerts => certs::validate(&session).await,
            Commands::IssueCerts => certs::issue(&session).await,
            Commands::RotateCerts(args) => certs::rotate(&session, &args).await,
            Commands::Probe(args) => migrate::probe(&session, &args).await,
            Commands::Install => install::install(&session).await,
            Commands::Validate => install::validate(&session).await,
            Commands::Uninstall => install::uninstall(&session).await,
        }
    }
}

/// Configuration plus the connected run context
pub struct Session {
    /// Effective configuration
    pub config: MigratorConfig,
    /// Context every component runs against
    pub ctx: RunContext,
    kubeconfig: Option<PathBuf>,
}

impl Session {
    /// Connect to the cluster named by `kubeconfig` (or the inferred one)
    pub async fn connect(kubeconfig: Option<PathBuf>, config: MigratorConfig) -> Result<Self> {
        let client = create_client(kubeconfig.as_deref()).await?;
        let ctx = RunContext::builder(client, config.descriptor())
            .pod_selector(config.cluster.pod_selector.clone())
            .build();
        debug!(
            namespace = %ctx.namespace(),
            release = %ctx.descriptor.release_name,
            "Connected to cluster"
        );
        Ok(Self {
            config,
            ctx,
            kubeconfig,
        })
    }

    /// Helm client using the session's kubeconfig
    pub fn helm(&self) -> Arc<HelmCli> {
        Arc::new(HelmCli::new(self.ctx.commands.clone()).with_kubeconfig(self.kubeconfig.clone()))
    }

    /// Manifest generation request for the configured cluster
    pub fn manifest_request(&self) -> ManifestRequest {
        let manifests = &self.config.manifests;
        ManifestRequest {
            statefulset_name: self.ctx.descriptor.statefulset_name.clone(),
            namespace: self.ctx.namespace().to_string(),
            node_count: self.config.cluster.desired_nodes,
            cloud_provider: manifests.cloud_provider.clone(),
            cloud_region: manifests.cloud_region.clone(),
            output_dir: manifests.output_dir.clone(),
        }
    }

    /// SQL probe against the configured host, or the first pod
    pub async fn probe(&self) -> Result<DatabaseFunctionalProbe> {
        let sql = &self.config.sql;
        let connector = PgConnector::from_context(&self.ctx, sql.host.clone(), sql.port)
            .await?
            .with_user(&sql.user);
        info!(target = %connector.target(), "Using SQL endpoint");
        Ok(DatabaseFunctionalProbe::new(Arc::new(connector)))
    }
}
