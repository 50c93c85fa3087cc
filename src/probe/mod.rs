//! SQL-level functional checks
//!
//! A migration or rotation is only done when the database still serves
//! reads and writes. The probe seeds a tiny `accounts` table and asserts on
//! its contents; seeding is idempotent so the same probe can run before and
//! after a change.

mod postgres;

pub use postgres::{PgConnector, DEFAULT_SQL_PORT, DEFAULT_SQL_USER};

use std::sync::Arc;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use tracing::{debug, info};

use crate::{Error, Result};

/// Database every CockroachDB cluster has
pub const SYSTEM_DATABASE: &str = "system";

/// Rows inserted by [`DatabaseFunctionalProbe::ensure_schema`]
pub const SEEDED_ROWS: [(i64, i64); 2] = [(1, 1000), (2, 250)];

const CREATE_TABLE: &str = "CREATE TABLE IF NOT EXISTS accounts (id INT PRIMARY KEY, balance INT)";
const SEED_ROWS: &str =
    "INSERT INTO accounts (id, balance) VALUES (1, 1000), (2, 250) ON CONFLICT DO NOTHING";
const SELECT_ROWS: &str = "SELECT id, balance FROM accounts ORDER BY id";

/// An open SQL connection.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SqlSession: Send + Sync {
    /// Execute a statement, returning the number of rows affected
    async fn execute(&self, statement: &str) -> Result<u64>;

    /// Run a query whose result has two integer columns
    async fn query_pairs(&self, query: &str) -> Result<Vec<(i64, i64)>>;
}

/// Opens SQL sessions against a database.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SqlConnector: Send + Sync {
    /// Connect to `database`
    async fn connect(&self, database: &str) -> Result<Box<dyn SqlSession>>;
}

/// Reject anything that is not a plain SQL identifier
pub fn validate_identifier(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    };
    if valid {
        Ok(())
    } else {
        Err(Error::validation_for(
            name,
            "database name must be a SQL identifier",
        ))
    }
}

/// Seeds and checks the `accounts` table.
pub struct DatabaseFunctionalProbe {
    connector: Arc<dyn SqlConnector>,
}

impl DatabaseFunctionalProbe {
    /// Create a probe using `connector`
    pub fn new(connector: Arc<dyn SqlConnector>) -> Self {
        Self { connector }
    }

    /// Create the database and table and insert the seed rows.
    pub async fn ensure_schema(&self, database: &str) -> Result<()> {
        validate_identifier(database)?;

        let system = self.connector.connect(SYSTEM_DATABASE).await?;
        system
            .execute(&format!("CREATE DATABASE IF NOT EXISTS {}", database))
            .await?;

        let session = self.connector.connect(database).await?;
        session.execute(CREATE_TABLE).await?;
        let inserted = session.execute(SEED_ROWS).await?;
        info!(database = %database, inserted = inserted, "Schema ready");
        Ok(())
    }

    async fn read_rows(&self, database: &str) -> Result<Vec<(i64, i64)>> {
        validate_identifier(database)?;
        let session = self.connector.connect(database).await?;
        let rows = session.query_pairs(SELECT_ROWS).await?;
        for (id, balance) in &rows {
            debug!(database = %database, id = id, balance = balance, "accounts row");
        }
        Ok(rows)
    }

    /// Assert that `accounts` holds exactly `expected_rows` rows.
    pub async fn assert_data(&self, database: &str, expected_rows: usize) -> Result<()> {
        let rows = self.read_rows(database).await?;
        check_row_count(database, &rows, expected_rows)
    }

    /// Assert that `accounts` holds exactly the seed rows.
    pub async fn assert_seeded_rows(&self, database: &str) -> Result<()> {
        let rows = self.read_rows(database).await?;
        check_seeded(database, &rows)
    }

    /// Check existing data without writing anything.
    pub async fn verify_existing(&self, database: &str, expected_rows: usize) -> Result<()> {
        let rows = self.read_rows(database).await?;
        check_row_count(database, &rows, expected_rows)?;
        check_seeded(database, &rows)?;
        info!(database = %database, rows = rows.len(), "Existing data intact");
        Ok(())
    }

    /// Seed the schema and assert the row count.
    pub async fn probe_functionality(&self, database: &str, expected_rows: usize) -> Result<()> {
        self.ensure_schema(database).await?;
        self.assert_data(database, expected_rows).await?;
        info!(database = %database, "Database is functional");
        Ok(())
    }
}

fn check_row_count(database: &str, rows: &[(i64, i64)], expected: usize) -> Result<()> {
    if rows.len() != expected {
        return Err(Error::assertion(
            format!("row count of {}.accounts", database),
            expected,
            rows.len(),
        ));
    }
    Ok(())
}

fn check_seeded(database: &str, rows: &[(i64, i64)]) -> Result<()> {
    if rows != SEEDED_ROWS.as_slice() {
        return Err(Error::assertion(
            format!("contents of {}.accounts", database),
            format!("{:?}", SEEDED_ROWS),
            format!("{:?}", rows),
        ));
    }
    Ok(())
}

/// Seed `database` and assert it holds `expected_rows` rows.
pub async fn probe_functionality(
    probe: &DatabaseFunctionalProbe,
    database: &str,
    expected_rows: usize,
) -> Result<()> {
    probe.probe_functionality(database, expected_rows).await
}
