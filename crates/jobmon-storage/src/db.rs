// Connection pool and error mapping.
//
// Every state-mutating repository method opens exactly one transaction and
// commits it before returning; sessions never escape their acquiring scope.

use std::time::Duration;

use jobmon_core::config::DbConfig;
use jobmon_core::{JobmonError, Result};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Build a bounded pool from configuration. Base + overflow becomes the
    /// single sqlx ceiling; the acquire timeout surfaces as a retryable
    /// Conflict rather than hanging a request.
    pub async fn from_config(config: &DbConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections())
            .acquire_timeout(Duration::from_secs(config.pool_timeout_seconds))
            .connect(&config.database_uri)
            .await
            .map_err(map_db_err)?;
        Ok(Self { pool })
    }

    /// Apply embedded migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| JobmonError::Internal(e.into()))?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// Map driver errors onto the wire error kinds. Lock timeouts, deadlocks,
/// serialization failures and unique-violation races are all retryable
/// conflicts; everything else is surfaced as-is.
pub(crate) fn map_db_err(e: sqlx::Error) -> JobmonError {
    match e {
        sqlx::Error::RowNotFound => JobmonError::not_found("row not found"),
        sqlx::Error::PoolTimedOut => JobmonError::conflict("connection pool exhausted"),
        sqlx::Error::Database(db) => match db.code().as_deref() {
            // unique_violation, lock_not_available, serialization_failure,
            // deadlock_detected
            Some("23505") | Some("55P03") | Some("40001") | Some("40P01") => {
                JobmonError::conflict(db.message().to_string())
            }
            _ => JobmonError::Internal(anyhow::anyhow!("database error: {}", db.message())),
        },
        other => JobmonError::Internal(other.into()),
    }
}
