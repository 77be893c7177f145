pub mod ledger;
pub mod models;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

use crate::error::AuditError;

pub use ledger::{AppendOutcome, ChainHead, LedgerStats, LedgerStore, RangeStart};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_CONNECTIONS: u32 = 8;

#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    pub async fn new(database_url: &str) -> Result<Self, AuditError> {
        if database_url.contains(":memory:") {
            return Self::new_in_memory().await;
        }

        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(|e| AuditError::Config(format!("Invalid database URL '{}': {}", database_url, e)))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(BUSY_TIMEOUT);

        let pool = SqlitePoolOptions::new()
            .max_connections(MAX_CONNECTIONS)
            .connect_with(options)
            .await?;

        info!("Connected to audit database {}", database_url);
        Ok(Database { pool })
    }

    /// Open an existing ledger for inspection. The file is never created
    /// and the connection refuses writes.
    pub async fn open_read_only(database_url: &str) -> Result<Self, AuditError> {
        if database_url.contains(":memory:") {
            return Err(AuditError::Config(
                "An in-memory ledger cannot be opened read-only".to_string(),
            ));
        }

        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(|e| AuditError::Config(format!("Invalid database URL '{}': {}", database_url, e)))?
            .create_if_missing(false)
            .read_only(true)
            .busy_timeout(BUSY_TIMEOUT);

        let pool = SqlitePoolOptions::new()
            .max_connections(MAX_CONNECTIONS)
            .connect_with(options)
            .await?;

        info!("Opened audit database {} read-only", database_url);
        Ok(Database { pool })
    }

    /// Migrated in-memory database for tests.
    ///
    /// Pinned to a single connection that never expires, since every
    /// SQLite in-memory connection is its own database.
    pub async fn new_in_memory() -> Result<Self, AuditError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| AuditError::Config(format!("Invalid in-memory URL: {}", e)))?;

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let database = Database { pool };
        database.run_migrations().await?;
        Ok(database)
    }

    pub async fn run_migrations(&self) -> Result<(), AuditError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        debug!("Audit database migrations applied");
        Ok(())
    }

    /// Connectivity check behind `/health`.
    pub async fn ping(&self) -> Result<(), AuditError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn ledger(&self) -> LedgerStore {
        LedgerStore::new(self.pool.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_in_memory_database_is_migrated() {
        let db = Database::new_in_memory().await.unwrap();
        db.ping().await.unwrap();

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM audit_entries")
            .fetch_one(db.pool())
            .await
            .unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn test_file_database_created_on_demand() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("ledger.db").display());

        let db = Database::new(&url).await.unwrap();
        db.run_migrations().await.unwrap();
        db.ping().await.unwrap();
        assert!(dir.path().join("ledger.db").exists());
    }

    #[tokio::test]
    async fn test_read_only_open_never_creates_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.db");
        let url = format!("sqlite://{}", path.display());

        assert!(Database::open_read_only(&url).await.is_err());
        assert!(!path.exists());
        assert!(Database::open_read_only("sqlite::memory:").await.is_err());
    }

    #[tokio::test]
    async fn test_read_only_open_reads_but_refuses_writes() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("ledger.db").display());
        let writer = Database::new(&url).await.unwrap();
        writer.run_migrations().await.unwrap();

        let reader = Database::open_read_only(&url).await.unwrap();
        assert!(reader.ledger().head().await.unwrap().is_none());

        let insert = sqlx::query("CREATE TABLE scratch (id INTEGER)")
            .execute(reader.pool())
            .await;
        assert!(insert.is_err());
    }
}
