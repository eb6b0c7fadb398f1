//! SQLite-backed local store.

use serde::de::DeserializeOwned;
use sqlx::SqlitePool;
use tally_engine::{Partition, SchemaVersion, StoredRecord};

use super::migrations::{migrate, MIGRATIONS};
use super::pool::create_pool;
use crate::error::StorageError;
use crate::store::LocalStore;

/// Durable store with one table per partition.
///
/// Each table holds `(key, value, ts)` where `value` is the record as JSON
/// and `ts` its scan timestamp.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
    version: SchemaVersion,
}

impl SqliteStore {
    /// Open (creating if missing) the database at `url` and migrate it.
    pub async fn open(url: &str) -> Result<Self, StorageError> {
        let pool = create_pool(url).await?;
        Self::from_pool(pool).await
    }

    /// Wrap an existing pool, migrating it first.
    pub async fn from_pool(pool: SqlitePool) -> Result<Self, StorageError> {
        let version = migrate(&pool, MIGRATIONS).await?;
        tracing::debug!(version, "Local store ready");
        Ok(Self { pool, version })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Close every connection. Pending writes are already durable.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn decode<R: DeserializeOwned>(partition: Partition, key: &str, value: &str) -> Result<R, StorageError> {
    serde_json::from_str(value).map_err(|e| {
        StorageError::SchemaMismatch(format!("{partition} record '{key}' does not decode: {e}"))
    })
}

impl LocalStore for SqliteStore {
    async fn put<R: StoredRecord>(&self, record: &R) -> Result<(), StorageError> {
        let value = serde_json::to_string(record)?;
        let sql = format!(
            "INSERT INTO {} (key, value, ts) VALUES (?1, ?2, ?3) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, ts = excluded.ts",
            R::PARTITION.name()
        );
        sqlx::query(&sql)
            .bind(record.key())
            .bind(value)
            .bind(record.timestamp() as i64)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn insert<R: StoredRecord>(&self, record: &R) -> Result<(), StorageError> {
        let value = serde_json::to_string(record)?;
        let sql = format!(
            "INSERT INTO {} (key, value, ts) VALUES (?1, ?2, ?3)",
            R::PARTITION.name()
        );
        let result = sqlx::query(&sql)
            .bind(record.key())
            .bind(value)
            .bind(record.timestamp() as i64)
            .execute(&self.pool)
            .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                Err(StorageError::Conflict {
                    partition: R::PARTITION,
                    key: record.key().to_string(),
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn get<R: StoredRecord>(&self, key: &str) -> Result<Option<R>, StorageError> {
        let sql = format!("SELECT value FROM {} WHERE key = ?1", R::PARTITION.name());
        let row: Option<(String,)> = sqlx::query_as(&sql)
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|(value,)| decode(R::PARTITION, key, &value))
            .transpose()
    }

    async fn scan<R, F>(&self, predicate: F) -> Result<Vec<R>, StorageError>
    where
        R: StoredRecord,
        F: Fn(&R) -> bool + Send,
    {
        let sql = format!(
            "SELECT key, value FROM {} ORDER BY ts, key",
            R::PARTITION.name()
        );
        let rows: Vec<(String, String)> = sqlx::query_as(&sql).fetch_all(&self.pool).await?;

        let mut records = Vec::with_capacity(rows.len());
        for (key, value) in rows {
            let record: R = decode(R::PARTITION, &key, &value)?;
            if predicate(&record) {
                records.push(record);
            }
        }
        Ok(records)
    }

    async fn count(&self, partition: Partition) -> Result<usize, StorageError> {
        let sql = format!("SELECT COUNT(*) FROM {}", partition.name());
        let (count,): (i64,) = sqlx::query_as(&sql).fetch_one(&self.pool).await?;
        Ok(count.max(0) as usize)
    }

    fn schema_version(&self) -> SchemaVersion {
        self.version
    }
}
