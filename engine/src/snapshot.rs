//! Snapshot types for exporting and restoring the local store.
//!
//! A snapshot is a full, deterministic JSON copy of both partitions. It is
//! used for backups and for carrying outbound records across a storage
//! rebuild. Importing is conservative: it can add records and move a record
//! forward from `Pending` to `Synced`, but it never moves one backwards and
//! never overwrites a local payload with a different one.

use crate::{
    error::Result, CacheKey, ClientId, Error, InboundCacheEntry, OutboundRecord, SchemaVersion,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Version of the snapshot format for future compatibility.
pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;

/// A point-in-time copy of the local store.
///
/// Uses BTreeMap instead of HashMap for deterministic serialization order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreSnapshot {
    /// Snapshot format version
    pub format_version: u32,
    /// Storage schema version the snapshot was taken from
    pub schema_version: SchemaVersion,
    /// Outbound records by client id
    pub outbound: BTreeMap<ClientId, OutboundRecord>,
    /// Inbound cache entries by cache key
    pub inbound: BTreeMap<CacheKey, InboundCacheEntry>,
}

/// What importing one record should do to the local copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportAction {
    /// No local copy: write it
    Insert,
    /// Local copy is behind: overwrite it
    Replace,
    /// Local copy is as new or newer: leave it
    Skip,
    /// Same id, different payload: leave the local copy and report it
    Conflict,
}

/// Counts of what an import did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportSummary {
    pub inserted: usize,
    pub replaced: usize,
    pub skipped: usize,
    pub conflicts: usize,
}

impl ImportSummary {
    pub fn record(&mut self, action: ImportAction) {
        match action {
            ImportAction::Insert => self.inserted += 1,
            ImportAction::Replace => self.replaced += 1,
            ImportAction::Skip => self.skipped += 1,
            ImportAction::Conflict => self.conflicts += 1,
        }
    }
}

impl StoreSnapshot {
    /// Create a new empty snapshot.
    pub fn new(schema_version: SchemaVersion) -> Self {
        Self {
            format_version: SNAPSHOT_FORMAT_VERSION,
            schema_version,
            outbound: BTreeMap::new(),
            inbound: BTreeMap::new(),
        }
    }

    /// Add an outbound record to the snapshot.
    pub fn add_outbound(&mut self, record: OutboundRecord) {
        self.outbound.insert(record.client_id.clone(), record);
    }

    /// Add an inbound cache entry to the snapshot.
    pub fn add_inbound(&mut self, entry: InboundCacheEntry) {
        self.inbound.insert(entry.cache_key.clone(), entry);
    }

    /// Count records still waiting for the server.
    pub fn pending_count(&self) -> usize {
        self.outbound.values().filter(|r| r.is_pending()).count()
    }

    /// Check the snapshot can be imported into a store at `schema_version`.
    ///
    /// Snapshots from older schemas are accepted; records are plain JSON and
    /// every field added since has a default.
    pub fn validate(&self, schema_version: SchemaVersion) -> Result<()> {
        if self.schema_version > schema_version {
            return Err(Error::SchemaVersionMismatch {
                expected: schema_version,
                actual: self.schema_version,
            });
        }

        for (id, record) in &self.outbound {
            if *id != record.client_id {
                return Err(Error::InvalidSnapshot(format!(
                    "outbound entry '{}' holds record '{}'",
                    id, record.client_id
                )));
            }
        }
        for (key, entry) in &self.inbound {
            if *key != entry.cache_key {
                return Err(Error::InvalidSnapshot(format!(
                    "inbound entry '{}' holds key '{}'",
                    key, entry.cache_key
                )));
            }
        }

        Ok(())
    }

    /// Serialize to JSON with deterministic ordering.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::InvalidSnapshot(e.to_string()))
    }

    /// Serialize to pretty JSON with deterministic ordering.
    pub fn to_json_pretty(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::InvalidSnapshot(e.to_string()))
    }

    /// Deserialize from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        let snapshot: Self =
            serde_json::from_str(json).map_err(|e| Error::InvalidSnapshot(e.to_string()))?;

        // Validate format version
        if snapshot.format_version > SNAPSHOT_FORMAT_VERSION {
            return Err(Error::InvalidSnapshot(format!(
                "unsupported snapshot format version: {} (max supported: {})",
                snapshot.format_version, SNAPSHOT_FORMAT_VERSION
            )));
        }

        Ok(snapshot)
    }
}

/// Decide how an outbound record from a snapshot merges with the local copy.
pub fn outbound_action(local: Option<&OutboundRecord>, incoming: &OutboundRecord) -> ImportAction {
    let Some(local) = local else {
        return ImportAction::Insert;
    };
    if local.payload != incoming.payload {
        return ImportAction::Conflict;
    }
    if local.is_pending() && !incoming.is_pending() {
        ImportAction::Replace
    } else {
        ImportAction::Skip
    }
}

/// Decide how an inbound entry from a snapshot merges with the local copy.
pub fn inbound_action(
    local: Option<&InboundCacheEntry>,
    incoming: &InboundCacheEntry,
) -> ImportAction {
    match local {
        None => ImportAction::Insert,
        Some(local) if incoming.cached_at > local.cached_at => ImportAction::Replace,
        Some(_) => ImportAction::Skip,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Payload, QueryResult};
    use serde_json::json;

    fn payload(reading: i64) -> Payload {
        json!({"account": "AC-1", "reading": reading})
            .as_object()
            .cloned()
            .unwrap()
    }

    #[test]
    fn create_empty_snapshot() {
        let snapshot = StoreSnapshot::new(3);
        assert_eq!(snapshot.format_version, SNAPSHOT_FORMAT_VERSION);
        assert_eq!(snapshot.schema_version, 3);
        assert_eq!(snapshot.pending_count(), 0);
    }

    #[test]
    fn json_roundtrip() {
        let mut snapshot = StoreSnapshot::new(3);
        snapshot.add_outbound(OutboundRecord::new("c-1", payload(1), 1000));
        let mut synced = OutboundRecord::new("c-2", payload(2), 1001);
        synced.mark_synced(Some("srv-2".into()), 2000);
        snapshot.add_outbound(synced);
        snapshot.add_inbound(InboundCacheEntry::new(
            "q1|invoices||||1|25",
            QueryResult::new(vec![json!({"id": 1})]),
            1500,
        ));

        let json = snapshot.to_json().unwrap();
        let parsed = StoreSnapshot::from_json(&json).unwrap();
        assert_eq!(snapshot, parsed);
        assert_eq!(parsed.pending_count(), 1);
    }

    #[test]
    fn deterministic_serialization() {
        let mut a = StoreSnapshot::new(1);
        a.add_outbound(OutboundRecord::new("c-2", payload(2), 2));
        a.add_outbound(OutboundRecord::new("c-1", payload(1), 1));

        let mut b = StoreSnapshot::new(1);
        b.add_outbound(OutboundRecord::new("c-1", payload(1), 1));
        b.add_outbound(OutboundRecord::new("c-2", payload(2), 2));

        assert_eq!(a.to_json().unwrap(), b.to_json().unwrap());
    }

    #[test]
    fn reject_future_format() {
        let json = r#"{"formatVersion":99,"schemaVersion":1,"outbound":{},"inbound":{}}"#;
        assert!(matches!(
            StoreSnapshot::from_json(json),
            Err(Error::InvalidSnapshot(_))
        ));
    }

    #[test]
    fn reject_newer_schema() {
        let snapshot = StoreSnapshot::new(4);
        assert!(matches!(
            snapshot.validate(3),
            Err(Error::SchemaVersionMismatch {
                expected: 3,
                actual: 4
            })
        ));
        assert!(StoreSnapshot::new(2).validate(3).is_ok());
    }

    #[test]
    fn reject_mismatched_keys() {
        let mut snapshot = StoreSnapshot::new(1);
        snapshot
            .outbound
            .insert("wrong".into(), OutboundRecord::new("c-1", payload(1), 1));
        assert!(matches!(
            snapshot.validate(1),
            Err(Error::InvalidSnapshot(_))
        ));
    }

    #[test]
    fn outbound_never_reverts() {
        let pending = OutboundRecord::new("c-1", payload(1), 1);
        let mut synced = pending.clone();
        synced.mark_synced(Some("srv-1".into()), 5);

        assert_eq!(outbound_action(None, &pending), ImportAction::Insert);
        assert_eq!(outbound_action(Some(&pending), &synced), ImportAction::Replace);
        assert_eq!(outbound_action(Some(&synced), &pending), ImportAction::Skip);
        assert_eq!(outbound_action(Some(&synced), &synced), ImportAction::Skip);
    }

    #[test]
    fn outbound_payload_conflict() {
        let local = OutboundRecord::new("c-1", payload(1), 1);
        let incoming = OutboundRecord::new("c-1", payload(999), 1);
        assert_eq!(outbound_action(Some(&local), &incoming), ImportAction::Conflict);
    }

    #[test]
    fn inbound_newer_wins() {
        let old = InboundCacheEntry::new("k", QueryResult::default(), 10);
        let new = InboundCacheEntry::new("k", QueryResult::default(), 20);
        assert_eq!(inbound_action(Some(&old), &new), ImportAction::Replace);
        assert_eq!(inbound_action(Some(&new), &old), ImportAction::Skip);
        assert_eq!(inbound_action(None, &old), ImportAction::Insert);
    }

    #[test]
    fn summary_counts() {
        let mut summary = ImportSummary::default();
        summary.record(ImportAction::Insert);
        summary.record(ImportAction::Insert);
        summary.record(ImportAction::Conflict);
        assert_eq!(summary.inserted, 2);
        assert_eq!(summary.conflicts, 1);
    }
}
