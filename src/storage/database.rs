use crate::core::config::AppConfig;
use crate::core::error::StorageError;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::sync::Arc;

use super::session_store::ChangeBus;

#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
    bus: Arc<ChangeBus>,
}

impl Database {
    pub async fn open(config: &AppConfig) -> Result<Self, StorageError> {
        let db_dir = config.data_path();
        std::fs::create_dir_all(&db_dir).map_err(|e| StorageError::Database(e.to_string()))?;

        let db_path = db_dir.join("negotiator.db");
        let options = SqliteConnectOptions::new()
            .filename(&db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| StorageError::Database(e.to_string()))?;

        Ok(Self {
            pool,
            bus: Arc::new(ChangeBus::new()),
        })
    }

    pub async fn run_migrations(&self) -> Result<(), StorageError> {
        sqlx::query(include_str!("../../migrations/001_initial.sql"))
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Migration(e.to_string()))?;
        Ok(())
    }

    /// Session store bound to `key`. Stores created from the same database
    /// share one notification bus, like tabs sharing one browser profile.
    pub fn session_store(&self, key: &str) -> super::SessionStore {
        super::SessionStore::new(self.pool.clone(), key.to_string(), Arc::clone(&self.bus))
    }
}
