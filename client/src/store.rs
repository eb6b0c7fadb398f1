//! The local store contract.
//!
//! Every call is atomic on its own. A sequence of calls is not: callers must
//! not assume a `get` followed by a `put` happens without anything in
//! between.

use std::future::Future;

use tally_engine::{
    snapshot::{inbound_action, outbound_action, ImportAction},
    ImportSummary, InboundCacheEntry, OutboundRecord, Partition, SchemaVersion, StoreSnapshot,
    StoredRecord,
};

use crate::error::{Result, StorageError};

/// Durable, transactional storage with one partition per record type.
pub trait LocalStore: Send + Sync + 'static {
    /// Insert or replace a record by key.
    fn put<R: StoredRecord>(
        &self,
        record: &R,
    ) -> impl Future<Output = std::result::Result<(), StorageError>> + Send;

    /// Insert a record, failing with [`StorageError::Conflict`] if its key
    /// is already taken.
    fn insert<R: StoredRecord>(
        &self,
        record: &R,
    ) -> impl Future<Output = std::result::Result<(), StorageError>> + Send;

    /// Fetch a record by key. Absence is `Ok(None)`, not an error.
    fn get<R: StoredRecord>(
        &self,
        key: &str,
    ) -> impl Future<Output = std::result::Result<Option<R>, StorageError>> + Send;

    /// Every record of the partition matching `predicate`, oldest first.
    fn scan<R, F>(
        &self,
        predicate: F,
    ) -> impl Future<Output = std::result::Result<Vec<R>, StorageError>> + Send
    where
        R: StoredRecord,
        F: Fn(&R) -> bool + Send;

    /// Number of records in a partition.
    fn count(
        &self,
        partition: Partition,
    ) -> impl Future<Output = std::result::Result<usize, StorageError>> + Send;

    /// Storage schema version this store is at.
    fn schema_version(&self) -> SchemaVersion;
}

/// Copy both partitions into a snapshot.
pub async fn export_snapshot<S: LocalStore>(store: &S) -> Result<StoreSnapshot> {
    let mut snapshot = StoreSnapshot::new(store.schema_version());
    for record in store.scan::<OutboundRecord, _>(|_| true).await? {
        snapshot.add_outbound(record);
    }
    for entry in store.scan::<InboundCacheEntry, _>(|_| true).await? {
        snapshot.add_inbound(entry);
    }
    tracing::info!(
        outbound = snapshot.outbound.len(),
        inbound = snapshot.inbound.len(),
        "Exported store snapshot"
    );
    Ok(snapshot)
}

/// Merge a snapshot into the store.
///
/// Outbound records are only ever added or moved forward to `Synced`; a
/// record whose payload differs from the local copy is left alone and
/// counted as a conflict. Inbound entries are replaced only by newer ones.
pub async fn import_snapshot<S: LocalStore>(
    store: &S,
    snapshot: &StoreSnapshot,
) -> Result<ImportSummary> {
    snapshot.validate(store.schema_version())?;

    let mut summary = ImportSummary::default();

    for incoming in snapshot.outbound.values() {
        let local = store.get::<OutboundRecord>(&incoming.client_id).await?;
        let action = outbound_action(local.as_ref(), incoming);
        apply(store, incoming, action).await?;
        if action == ImportAction::Conflict {
            tracing::warn!(
                client_id = %incoming.client_id,
                "Snapshot record differs from local copy, keeping local"
            );
        }
        summary.record(action);
    }

    for incoming in snapshot.inbound.values() {
        let local = store.get::<InboundCacheEntry>(&incoming.cache_key).await?;
        let action = inbound_action(local.as_ref(), incoming);
        apply(store, incoming, action).await?;
        summary.record(action);
    }

    tracing::info!(
        inserted = summary.inserted,
        replaced = summary.replaced,
        skipped = summary.skipped,
        conflicts = summary.conflicts,
        "Imported store snapshot"
    );
    Ok(summary)
}

async fn apply<S: LocalStore, R: StoredRecord>(
    store: &S,
    record: &R,
    action: ImportAction,
) -> std::result::Result<(), StorageError> {
    match action {
        ImportAction::Insert => store.insert(record).await,
        ImportAction::Replace => store.put(record).await,
        ImportAction::Skip | ImportAction::Conflict => Ok(()),
    }
}
