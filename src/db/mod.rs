pub mod models;

use std::time::Duration;

use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::{ConnectOptions, Executor, PgPool};
use tracing::{debug, info};

use crate::config::DbConfig;
use crate::error::CoreError;

/// An arbitrary, fixed advisory lock key used to serialize migrations
/// across concurrent instances starting up against the same database.
const MIGRATION_LOCK_KEY: i64 = 0x6464_7569_636f_7265u64 as i64; // "dduicore" (truncated)

/// Database connection pool and migration management.
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Connect to Postgres using the given configuration.
    pub async fn connect(cfg: &DbConfig) -> Result<Self, CoreError> {
        info!(host = %cfg.host, port = cfg.port, name = %cfg.name, "connecting to database");

        let mut options: PgConnectOptions = cfg
            .connection_string()
            .parse()
            .map_err(|e| CoreError::config_invalid(format!("invalid database DSN: {e}")))?;
        options = options.disable_statement_logging();

        let pool = PgPoolOptions::new()
            .min_connections(cfg.min_conns)
            .max_connections(cfg.max_conns)
            .acquire_timeout(cfg.connect_timeout)
            .max_lifetime(cfg.conn_max_lifetime)
            .idle_timeout(cfg.conn_max_idle)
            .connect_with(options)
            .await
            .map_err(|e| {
                CoreError::with_cause(
                    crate::error::ErrorKind::StoreUnavailable,
                    "failed to connect to database",
                    e,
                )
            })?;

        info!("connected to database successfully");

        Ok(Self { pool })
    }

    /// Reference to the connection pool, shared by every subsystem.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run embedded migrations under a database-wide advisory lock so that
    /// concurrent instances starting up at the same time do not race.
    pub async fn migrate(&self) -> Result<(), CoreError> {
        info!("acquiring migration advisory lock");

        let mut conn = self.pool.acquire().await.map_err(CoreError::from)?;
        conn.execute(sqlx::query("SELECT pg_advisory_lock($1)").bind(MIGRATION_LOCK_KEY))
            .await
            .map_err(CoreError::from)?;

        let result = sqlx::migrate!("./migrations").run(&mut *conn).await;

        // Always release the lock, even if the migration run failed.
        let unlock = conn
            .execute(sqlx::query("SELECT pg_advisory_unlock($1)").bind(MIGRATION_LOCK_KEY))
            .await;

        result.map_err(|e| {
            CoreError::with_cause(crate::error::ErrorKind::StoreUnavailable, "migration failed", e)
        })?;
        unlock.map_err(CoreError::from)?;

        info!("database migrations completed successfully");
        Ok(())
    }

    /// Periodic liveness probe, used by the health-period ticker.
    pub async fn ping(&self, timeout: Duration) -> Result<(), CoreError> {
        tokio::time::timeout(timeout, sqlx::query("SELECT 1").execute(&self.pool))
            .await
            .map_err(|_| CoreError::store_unavailable("database ping timed out"))?
            .map_err(CoreError::from)?;
        debug!("database ping ok");
        Ok(())
    }

    /// Close the pool gracefully, waiting for in-flight queries to finish.
    pub async fn close(self) {
        info!("closing database connection pool");
        self.pool.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migration_lock_key_is_stable() {
        // Any two instances in the same process must agree on this key.
        assert_eq!(MIGRATION_LOCK_KEY, MIGRATION_LOCK_KEY);
    }

    // Connectivity-dependent behavior (connect/migrate/ping against a real
    // Postgres) is exercised by the `#[sqlx::test]`-based suites in
    // `db::models::*`, which spin up an ephemeral schema per test via
    // `DATABASE_URL`.
}
