//! tokio-postgres backed [`SqlConnector`]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_postgres::config::SslMode;
use tokio_postgres::{Client, NoTls};
use tokio_postgres_rustls::MakeRustlsConnect;
use tracing::{debug, warn};

use super::{SqlConnector, SqlSession};
use crate::context::RunContext;
use crate::pki::{CertificateSecret, CA_CERT_KEY, TLS_CERT_KEY, TLS_KEY_KEY};
use crate::{Error, Result};

/// CockroachDB SQL port
pub const DEFAULT_SQL_PORT: u16 = 26257;
/// User the probe connects as
pub const DEFAULT_SQL_USER: &str = "root";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Connects to a CockroachDB node over the Postgres wire protocol.
#[derive(Clone)]
pub struct PgConnector {
    host: String,
    port: u16,
    user: String,
    tls: Option<Arc<rustls::ClientConfig>>,
}

impl PgConnector {
    /// Plaintext connector
    pub fn insecure(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            user: DEFAULT_SQL_USER.to_string(),
            tls: None,
        }
    }

    /// Connector using the cluster's client certificate for mTLS
    pub fn with_tls(host: impl Into<String>, port: u16, config: rustls::ClientConfig) -> Self {
        Self {
            tls: Some(Arc::new(config)),
            ..Self::insecure(host, port)
        }
    }

    /// Connect as a different SQL user
    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = user.into();
        self
    }

    /// Build a connector for the run's cluster.
    ///
    /// Defaults to the first pod's stable DNS name. A secure cluster uses the
    /// client secret's certificate and key and trusts the node secret's CA.
    pub async fn from_context(
        ctx: &RunContext,
        host: Option<String>,
        port: u16,
    ) -> Result<Self> {
        let descriptor = &ctx.descriptor;
        let host = host.unwrap_or_else(|| descriptor.first_pod_host());
        if !descriptor.is_secure() {
            return Ok(Self::insecure(host, port));
        }

        let load = |name: String| async move {
            ctx.cluster
                .get_secret(ctx.namespace(), &name)
                .await?
                .map(|s| CertificateSecret::from_secret(&s))
                .ok_or_else(|| Error::validation_for(name, "secret not found"))
        };
        let client = load(descriptor.client_secret.clone()).await?;
        let node = load(descriptor.node_secret.clone()).await?;

        let config = client_tls_config(
            node.field(CA_CERT_KEY)?,
            client.field(TLS_CERT_KEY)?,
            client.field(TLS_KEY_KEY)?,
        )?;
        Ok(Self::with_tls(host, port, config))
    }

    /// `host:port` for logs and errors
    pub fn target(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    fn config(&self, database: &str) -> tokio_postgres::Config {
        let mut config = tokio_postgres::Config::new();
        config
            .host(&self.host)
            .port(self.port)
            .user(&self.user)
            .dbname(database)
            .connect_timeout(CONNECT_TIMEOUT);
        if self.tls.is_some() {
            config.ssl_mode(SslMode::Require);
        }
        config
    }
}

/// rustls client configuration from PEM material
pub fn client_tls_config(
    ca_pem: &[u8],
    cert_pem: &[u8],
    key_pem: &[u8],
) -> Result<rustls::ClientConfig> {
    let tls_err = |e: &dyn std::fmt::Display| Error::database("tls", e.to_string());

    let mut roots = rustls::RootCertStore::empty();
    for cert in CertificateDer::pem_slice_iter(ca_pem) {
        roots
            .add(cert.map_err(|e| tls_err(&e))?)
            .map_err(|e| tls_err(&e))?;
    }
    let chain = CertificateDer::pem_slice_iter(cert_pem)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| tls_err(&e))?;
    let key = PrivateKeyDer::from_pem_slice(key_pem).map_err(|e| tls_err(&e))?;

    rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_client_auth_cert(chain, key)
        .map_err(|e| tls_err(&e))
}

fn spawn_connection<F>(target: String, connection: F)
where
    F: Future<Output = std::result::Result<(), tokio_postgres::Error>> + Send + 'static,
{
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            warn!(target = %target, error = %e, "SQL connection closed with error");
        }
    });
}

#[async_trait]
impl SqlConnector for PgConnector {
    async fn connect(&self, database: &str) -> Result<Box<dyn SqlSession>> {
        let config = self.config(database);
        let target = self.target();
        debug!(target = %target, database = %database, tls = self.tls.is_some(), "Connecting to SQL");

        let client = match &self.tls {
            Some(tls) => {
                let (client, connection) = config
                    .connect(MakeRustlsConnect::new(tls.as_ref().clone()))
                    .await
                    .map_err(|e| Error::database(&target, e.to_string()))?;
                spawn_connection(target, connection);
                client
            }
            None => {
                let (client, connection) = config
                    .connect(NoTls)
                    .await
                    .map_err(|e| Error::database(&target, e.to_string()))?;
                spawn_connection(target, connection);
                client
            }
        };
        Ok(Box::new(PgSession { client }))
    }
}

struct PgSession {
    client: Client,
}

#[async_trait]
impl SqlSession for PgSession {
    async fn execute(&self, statement: &str) -> Result<u64> {
        self.client
            .execute(statement, &[])
            .await
            .map_err(|e| Error::database(statement, e.to_string()))
    }

    async fn query_pairs(&self, query: &str) -> Result<Vec<(i64, i64)>> {
        let rows = self
            .client
            .query(query, &[])
            .await
            .map_err(|e| Error::database(query, e.to_string()))?;
        let mut pairs = Vec::with_capacity(rows.len());
        for row in &rows {
            pairs.push((row.try_get::<_, i64>(0)?, row.try_get::<_, i64>(1)?));
        }
        Ok(pairs)
    }
}
