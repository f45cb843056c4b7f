//! On-demand PostgreSQL status check
//!
//! Every check opens its own connection, runs two queries, and closes the
//! connection again. Nothing is pooled or cached between requests.

use crate::config::Config;
use async_trait::async_trait;
use sqlx::{Connection, PgConnection};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Table whose row count is reported by the status check
pub const PROBE_TABLE: &str = "users";

const VERSION_QUERY: &str = "SELECT version()";
const ROW_COUNT_QUERY: &str = "SELECT count(*) FROM users";

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("no PostgreSQL connection string configured")]
    NotConfigured,

    #[error("failed to connect to PostgreSQL: {0}")]
    Connect(#[source] sqlx::Error),

    #[error("PostgreSQL query failed: {0}")]
    Query(#[source] sqlx::Error),

    #[error("PostgreSQL check did not finish within {0:?}")]
    Timeout(Duration),
}

/// Outcome of a successful status check
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeReport {
    /// Result of `SELECT version()`
    pub server_version: String,
    /// Number of rows in [`PROBE_TABLE`]
    pub row_count: i64,
}

/// Trait for checking the external database
///
/// Production code uses `PostgresProbe`.
/// Tests use `MockProbe` to return canned results.
#[async_trait]
pub trait DatabaseProbe: Send + Sync {
    async fn check(&self) -> Result<ProbeReport, ProbeError>;
}

/// Status check against a real PostgreSQL server
#[derive(Debug, Clone)]
pub struct PostgresProbe {
    url: Option<String>,
    timeout: Duration,
}

impl PostgresProbe {
    pub fn new(url: Option<String>, timeout: Duration) -> Self {
        Self { url, timeout }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.postgresql_url.clone(), config.postgresql_timeout)
    }

    async fn run(url: &str) -> Result<ProbeReport, ProbeError> {
        let mut conn = PgConnection::connect(url)
            .await
            .map_err(ProbeError::Connect)?;

        let result = query_status(&mut conn).await;

        // Released on both paths; a failed close only loses the goodbye message
        if let Err(e) = conn.close().await {
            debug!(error = %e, "PostgreSQL connection did not close cleanly");
        }

        result
    }
}

#[async_trait]
impl DatabaseProbe for PostgresProbe {
    async fn check(&self) -> Result<ProbeReport, ProbeError> {
        let url = self.url.as_deref().ok_or(ProbeError::NotConfigured)?;

        // Dropping the future on timeout drops the connection with it
        match tokio::time::timeout(self.timeout, Self::run(url)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(timeout = ?self.timeout, "PostgreSQL check timed out");
                Err(ProbeError::Timeout(self.timeout))
            }
        }
    }
}

async fn query_status(conn: &mut PgConnection) -> Result<ProbeReport, ProbeError> {
    let server_version: String = sqlx::query_scalar(VERSION_QUERY)
        .fetch_one(&mut *conn)
        .await
        .map_err(ProbeError::Query)?;

    // Fails when the table has not been migrated yet
    let row_count: i64 = sqlx::query_scalar(ROW_COUNT_QUERY)
        .fetch_one(&mut *conn)
        .await
        .map_err(ProbeError::Query)?;

    Ok(ProbeReport {
        server_version,
        row_count,
    })
}

/// Mock probe returning a fixed outcome
#[cfg(test)]
pub struct MockProbe {
    outcome: Result<ProbeReport, String>,
    delay: Duration,
    pub calls: std::sync::atomic::AtomicUsize,
}

#[cfg(test)]
impl MockProbe {
    pub fn success(server_version: &str, row_count: i64) -> Self {
        Self {
            outcome: Ok(ProbeReport {
                server_version: server_version.to_string(),
                row_count,
            }),
            delay: Duration::ZERO,
            calls: std::sync::atomic::AtomicUsize::new(0),
        }
    }

    pub fn failure(message: &str) -> Self {
        Self {
            outcome: Err(message.to_string()),
            delay: Duration::ZERO,
            calls: std::sync::atomic::AtomicUsize::new(0),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[cfg(test)]
#[async_trait]
impl DatabaseProbe for MockProbe {
    async fn check(&self) -> Result<ProbeReport, ProbeError> {
        self.calls
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        match &self.outcome {
            Ok(report) => Ok(report.clone()),
            Err(message) => Err(ProbeError::Query(sqlx::Error::Protocol(message.clone()))),
        }
    }
}
