//! In-memory local store for tests and ephemeral sessions.

use std::sync::atomic::{AtomicUsize, Ordering};

use dashmap::{mapref::entry::Entry, DashMap};
use tally_engine::{store::sort_for_scan, Partition, SchemaVersion, StoredRecord};

use super::migrations::CURRENT_SCHEMA_VERSION;
use crate::error::StorageError;
use crate::store::LocalStore;

/// Local store held in process memory.
///
/// Records are kept as JSON, the same way [`super::SqliteStore`] keeps them,
/// so anything that does not survive serialization fails here too. An
/// optional byte quota makes [`StorageError::QuotaExceeded`] reachable in
/// tests.
#[derive(Debug)]
pub struct MemoryStore {
    outbound: DashMap<String, String>,
    inbound: DashMap<String, String>,
    quota: Option<usize>,
    used: AtomicUsize,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            outbound: DashMap::new(),
            inbound: DashMap::new(),
            quota: None,
            used: AtomicUsize::new(0),
        }
    }

    /// Limit the total size of stored values to `bytes`.
    pub fn with_quota(bytes: usize) -> Self {
        Self {
            quota: Some(bytes),
            ..Self::new()
        }
    }

    /// Bytes of stored values across both partitions.
    pub fn used_bytes(&self) -> usize {
        self.used.load(Ordering::SeqCst)
    }

    fn table(&self, partition: Partition) -> &DashMap<String, String> {
        match partition {
            Partition::Outbound => &self.outbound,
            Partition::Inbound => &self.inbound,
        }
    }

    /// Account for a value of `old` bytes being replaced by one of `new`.
    fn reserve(&self, old: usize, new: usize) -> Result<(), StorageError> {
        let quota = self.quota;
        self.used
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |used| {
                let next = used.saturating_sub(old) + new;
                match quota {
                    Some(limit) if next > limit => None,
                    _ => Some(next),
                }
            })
            .map(|_| ())
            .map_err(|used| {
                StorageError::QuotaExceeded(format!(
                    "{} bytes in use, {} more would exceed {} byte quota",
                    used,
                    new.saturating_sub(old),
                    quota.unwrap_or_default()
                ))
            })
    }

    fn write<R: StoredRecord>(&self, record: &R, replace: bool) -> Result<(), StorageError> {
        let value = serde_json::to_string(record)?;
        match self.table(R::PARTITION).entry(record.key().to_string()) {
            Entry::Occupied(mut occupied) => {
                if !replace {
                    return Err(StorageError::Conflict {
                        partition: R::PARTITION,
                        key: record.key().to_string(),
                    });
                }
                self.reserve(occupied.get().len(), value.len())?;
                occupied.insert(value);
            }
            Entry::Vacant(vacant) => {
                self.reserve(0, value.len())?;
                vacant.insert(value);
            }
        }
        Ok(())
    }
}

fn decode<R: StoredRecord>(key: &str, value: &str) -> Result<R, StorageError> {
    serde_json::from_str(value).map_err(|e| {
        StorageError::SchemaMismatch(format!("{} record '{key}' does not decode: {e}", R::PARTITION))
    })
}

impl LocalStore for MemoryStore {
    async fn put<R: StoredRecord>(&self, record: &R) -> Result<(), StorageError> {
        self.write(record, true)
    }

    async fn insert<R: StoredRecord>(&self, record: &R) -> Result<(), StorageError> {
        self.write(record, false)
    }

    async fn get<R: StoredRecord>(&self, key: &str) -> Result<Option<R>, StorageError> {
        let value = self.table(R::PARTITION).get(key).map(|v| v.value().clone());
        value.map(|v| decode(key, &v)).transpose()
    }

    async fn scan<R, F>(&self, predicate: F) -> Result<Vec<R>, StorageError>
    where
        R: StoredRecord,
        F: Fn(&R) -> bool + Send,
    {
        let rows: Vec<(String, String)> = self
            .table(R::PARTITION)
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();

        let mut records = Vec::with_capacity(rows.len());
        for (key, value) in rows {
            let record: R = decode(&key, &value)?;
            if predicate(&record) {
                records.push(record);
            }
        }
        sort_for_scan(&mut records);
        Ok(records)
    }

    async fn count(&self, partition: Partition) -> Result<usize, StorageError> {
        Ok(self.table(partition).len())
    }

    fn schema_version(&self) -> SchemaVersion {
        CURRENT_SCHEMA_VERSION
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tally_engine::{OutboundRecord, Payload};

    fn payload(reading: i64) -> Payload {
        json!({"account": "AC-1", "reading": reading})
            .as_object()
            .cloned()
            .unwrap()
    }

    #[tokio::test]
    async fn insert_and_conflict() {
        let store = MemoryStore::new();
        store
            .insert(&OutboundRecord::new("c-1", payload(1), 1))
            .await
            .unwrap();
        assert!(matches!(
            store.insert(&OutboundRecord::new("c-1", payload(2), 2)).await,
            Err(StorageError::Conflict { .. })
        ));
        let loaded: OutboundRecord = store.get("c-1").await.unwrap().unwrap();
        assert_eq!(loaded.payload, payload(1));
    }

    #[tokio::test]
    async fn scan_order_matches_sqlite() {
        let store = MemoryStore::new();
        store.put(&OutboundRecord::new("b", payload(1), 20)).await.unwrap();
        store.put(&OutboundRecord::new("z", payload(2), 10)).await.unwrap();
        store.put(&OutboundRecord::new("a", payload(3), 20)).await.unwrap();

        let all: Vec<OutboundRecord> = store.scan(|_| true).await.unwrap();
        let ids: Vec<_> = all.iter().map(|r| r.client_id.as_str()).collect();
        assert_eq!(ids, vec!["z", "a", "b"]);
    }

    #[tokio::test]
    async fn quota_refuses_and_leaves_store_unchanged() {
        let store = MemoryStore::with_quota(200);
        store
            .put(&OutboundRecord::new("c-1", payload(1), 1))
            .await
            .unwrap();
        let used = store.used_bytes();

        let mut big = Payload::new();
        big.insert("notes".into(), json!("x".repeat(500)));
        let err = store
            .put(&OutboundRecord::new("c-2", big, 2))
            .await
            .unwrap_err();

        assert!(matches!(err, StorageError::QuotaExceeded(_)));
        assert_eq!(store.used_bytes(), used);
        assert_eq!(store.count(Partition::Outbound).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn replacing_reuses_quota() {
        let store = MemoryStore::with_quota(200);
        let mut record = OutboundRecord::new("c-1", payload(1), 1);
        for _ in 0..10 {
            record.record_attempt();
            store.put(&record).await.unwrap();
        }
        assert_eq!(store.count(Partition::Outbound).await.unwrap(), 1);
    }
}
