use chrono::Utc;
use sqlx::{Sqlite, SqlitePool, Transaction};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};

use crate::core::error::StorageError;
use crate::core::session::{SessionRecord, SCHEMA_VERSION};

const CHANGE_CHANNEL_CAPACITY: usize = 64;

const UPSERT: &str = "INSERT INTO kv_store (key, value, revision, updated_at) VALUES (?, ?, ?, ?) \
     ON CONFLICT(key) DO UPDATE SET value = excluded.value, revision = excluded.revision, \
     updated_at = excluded.updated_at";

const UPSERT_OWNED: &str = "INSERT INTO kv_store (key, value, revision, updated_at) VALUES (?, ?, ?, ?) \
     ON CONFLICT(key) DO UPDATE SET value = excluded.value, revision = excluded.revision, \
     updated_at = excluded.updated_at \
     WHERE json_extract(kv_store.value, '$.ownerId') = ? \
     AND json_extract(kv_store.value, '$.sessionId') = ?";

/// Notification published after every write to a key. `record` is `None` when
/// the key was cleared or its payload is unreadable under the current schema.
#[derive(Debug, Clone)]
pub struct StoreChange {
    pub key: String,
    pub revision: u64,
    pub record: Option<SessionRecord>,
}

/// The identity a conditional write expects to find in the stored record.
#[derive(Debug, Clone, Copy)]
pub struct OwnerGuard<'a> {
    pub owner_id: &'a str,
    pub session_id: &'a str,
}

/// In-process fan-out of store writes. Other processes on the same database
/// see writes through the shared revision counter instead.
pub(crate) struct ChangeBus {
    tx: broadcast::Sender<StoreChange>,
    // Serializes write+publish so in-process notifications follow write order.
    write_lock: Mutex<()>,
}

impl ChangeBus {
    pub(crate) fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            tx,
            write_lock: Mutex::new(()),
        }
    }

    fn publish(&self, key: &str, revision: u64, record: Option<SessionRecord>) {
        // No subscribers is fine.
        let _ = self.tx.send(StoreChange {
            key: key.to_string(),
            revision,
            record,
        });
    }
}

/// Versioned single-record store keyed by a fixed storage key.
#[derive(Clone)]
pub struct SessionStore {
    pool: SqlitePool,
    key: String,
    bus: Arc<ChangeBus>,
}

impl SessionStore {
    pub(crate) fn new(pool: SqlitePool, key: String, bus: Arc<ChangeBus>) -> Self {
        Self { pool, key, bus }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Replace the stored record unconditionally and notify subscribers.
    /// Returns the revision assigned to this write.
    pub async fn save(&self, record: &SessionRecord) -> Result<u64, StorageError> {
        let revision = self.upsert(record, None).await?;
        revision.ok_or_else(|| StorageError::Database("unconditional save was refused".into()))
    }

    /// Replace the stored record only if the current one still carries the
    /// guard's owner and session. Returns `None`, without writing, when
    /// someone else holds the key.
    pub async fn save_owned(
        &self,
        record: &SessionRecord,
        guard: OwnerGuard<'_>,
    ) -> Result<Option<u64>, StorageError> {
        self.upsert(record, Some(guard)).await
    }

    async fn upsert(
        &self,
        record: &SessionRecord,
        guard: Option<OwnerGuard<'_>>,
    ) -> Result<Option<u64>, StorageError> {
        let mut record = record.clone();
        record.schema_version = SCHEMA_VERSION;
        let value =
            serde_json::to_string(&record).map_err(|e| StorageError::Serialization(e.to_string()))?;

        let _lock = self.bus.write_lock.lock().await;
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let revision = bump_revision(&mut tx).await?;

        let query = match guard {
            None => sqlx::query(UPSERT),
            Some(_) => sqlx::query(UPSERT_OWNED),
        }
        .bind(&self.key)
        .bind(&value)
        .bind(revision)
        .bind(Utc::now().to_rfc3339());
        let query = match guard {
            Some(g) => query.bind(g.owner_id).bind(g.session_id),
            None => query,
        };

        let result = query.execute(&mut *tx).await.map_err(db_err)?;
        if result.rows_affected() == 0 {
            tx.rollback().await.map_err(db_err)?;
            tracing::info!(key = %self.key, "save refused, record is held by another owner");
            return Ok(None);
        }
        tx.commit().await.map_err(db_err)?;

        let revision = revision as u64;
        self.bus.publish(&self.key, revision, Some(record));
        tracing::debug!(key = %self.key, revision, "session record saved");
        Ok(Some(revision))
    }

    /// Load the stored record. Records from another schema version, or that
    /// fail to decode, are reported as absent.
    pub async fn load(&self) -> Result<Option<SessionRecord>, StorageError> {
        let (_, record) = self.load_with_revision().await?;
        Ok(record)
    }

    /// The current global revision together with the record, read in one
    /// statement so the pair is consistent.
    pub async fn load_with_revision(&self) -> Result<(u64, Option<SessionRecord>), StorageError> {
        let (revision, value): (i64, Option<String>) = sqlx::query_as(
            "SELECT m.revision, k.value FROM store_meta m \
             LEFT JOIN kv_store k ON k.key = ? WHERE m.id = 1",
        )
        .bind(&self.key)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;

        Ok((revision as u64, value.and_then(|v| decode_record(&v))))
    }

    pub async fn clear(&self) -> Result<u64, StorageError> {
        let _lock = self.bus.write_lock.lock().await;
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let revision = bump_revision(&mut tx).await?;
        sqlx::query("DELETE FROM kv_store WHERE key = ?")
            .bind(&self.key)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        tx.commit().await.map_err(db_err)?;

        let revision = revision as u64;
        self.bus.publish(&self.key, revision, None);
        tracing::debug!(key = %self.key, revision, "session record cleared");
        Ok(revision)
    }

    /// Delete the record only if it still belongs to the guard's owner and
    /// session. Returns whether anything was deleted.
    pub async fn clear_owned(&self, guard: OwnerGuard<'_>) -> Result<bool, StorageError> {
        let _lock = self.bus.write_lock.lock().await;
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let revision = bump_revision(&mut tx).await?;
        let result = sqlx::query(
            "DELETE FROM kv_store WHERE key = ? \
             AND json_extract(value, '$.ownerId') = ? \
             AND json_extract(value, '$.sessionId') = ?",
        )
        .bind(&self.key)
        .bind(guard.owner_id)
        .bind(guard.session_id)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        if result.rows_affected() == 0 {
            tx.rollback().await.map_err(db_err)?;
            return Ok(false);
        }
        tx.commit().await.map_err(db_err)?;

        self.bus.publish(&self.key, revision as u64, None);
        Ok(true)
    }

    /// Write raw JSON under the key without version stamping or notification.
    /// Used to seed records produced by other releases.
    pub async fn put_raw(&self, value: &str) -> Result<(), StorageError> {
        sqlx::query(
            "INSERT INTO kv_store (key, value, updated_at) VALUES (?, ?, ?) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
        )
        .bind(&self.key)
        .bind(value)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreChange> {
        self.bus.tx.subscribe()
    }

    /// Latest revision written by any process sharing the database.
    pub async fn current_revision(&self) -> Result<u64, StorageError> {
        let (revision,): (i64,) = sqlx::query_as("SELECT revision FROM store_meta WHERE id = 1")
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(revision as u64)
    }
}

async fn bump_revision(tx: &mut Transaction<'_, Sqlite>) -> Result<i64, StorageError> {
    let (revision,): (i64,) =
        sqlx::query_as("UPDATE store_meta SET revision = revision + 1 WHERE id = 1 RETURNING revision")
            .fetch_one(&mut **tx)
            .await
            .map_err(db_err)?;
    Ok(revision)
}

fn db_err(e: sqlx::Error) -> StorageError {
    StorageError::Database(e.to_string())
}

fn decode_record(value: &str) -> Option<SessionRecord> {
    let raw: serde_json::Value = match serde_json::from_str(value) {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!(error = %e, "discarding unreadable session record");
            return None;
        }
    };

    let version = raw.get("schemaVersion").and_then(|v| v.as_u64());
    if version != Some(u64::from(SCHEMA_VERSION)) {
        tracing::warn!(
            found = ?version,
            expected = SCHEMA_VERSION,
            "discarding session record from another schema version"
        );
        return None;
    }

    match serde_json::from_value(raw) {
        Ok(record) => Some(record),
        Err(e) => {
            tracing::warn!(error = %e, "discarding malformed session record");
            None
        }
    }
}
