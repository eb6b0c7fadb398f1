//! Partitions of the local store and the records that live in them.
//!
//! The store itself is async and lives in `tally-client`; this module only
//! says which record type belongs to which partition, how it is keyed and
//! how a scan orders it.

use crate::{InboundCacheEntry, OutboundRecord, Timestamp};
use serde::{de::DeserializeOwned, Serialize};

/// A named partition of the local store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Partition {
    /// Pending and synced writes. Must never be silently dropped.
    Outbound,
    /// Cached reads. Disposable: can always be re-fetched.
    Inbound,
}

impl Partition {
    pub const ALL: [Partition; 2] = [Partition::Outbound, Partition::Inbound];

    /// Name used for tables and log fields.
    pub fn name(&self) -> &'static str {
        match self {
            Partition::Outbound => "outbound",
            Partition::Inbound => "inbound",
        }
    }

    /// Whether a migration may discard this partition's contents.
    pub fn is_disposable(&self) -> bool {
        matches!(self, Partition::Inbound)
    }
}

impl std::fmt::Display for Partition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// A record type that can be put into the local store.
pub trait StoredRecord: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// The partition holding records of this type.
    const PARTITION: Partition;

    /// Primary key within the partition.
    fn key(&self) -> &str;

    /// Scan order: oldest first, ties broken by key.
    fn timestamp(&self) -> Timestamp;
}

impl StoredRecord for OutboundRecord {
    const PARTITION: Partition = Partition::Outbound;

    fn key(&self) -> &str {
        &self.client_id
    }

    fn timestamp(&self) -> Timestamp {
        self.created_at
    }
}

impl StoredRecord for InboundCacheEntry {
    const PARTITION: Partition = Partition::Inbound;

    fn key(&self) -> &str {
        &self.cache_key
    }

    fn timestamp(&self) -> Timestamp {
        self.cached_at
    }
}

/// Sort records into scan order.
pub fn sort_for_scan<R: StoredRecord>(records: &mut [R]) {
    records.sort_by(|a, b| {
        a.timestamp()
            .cmp(&b.timestamp())
            .then_with(|| a.key().cmp(b.key()))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Payload, QueryResult};

    #[test]
    fn partitions_know_their_records() {
        assert_eq!(OutboundRecord::PARTITION, Partition::Outbound);
        assert_eq!(InboundCacheEntry::PARTITION, Partition::Inbound);
        assert_eq!(Partition::Outbound.to_string(), "outbound");
    }

    #[test]
    fn only_inbound_is_disposable() {
        assert!(!Partition::Outbound.is_disposable());
        assert!(Partition::Inbound.is_disposable());
    }

    #[test]
    fn keys() {
        let record = OutboundRecord::new("c-1", Payload::new(), 5);
        assert_eq!(record.key(), "c-1");
        let entry = InboundCacheEntry::new("q1|x", QueryResult::default(), 7);
        assert_eq!(entry.key(), "q1|x");
        assert_eq!(entry.timestamp(), 7);
    }

    #[test]
    fn scan_order_is_oldest_first_then_key() {
        let mut records = vec![
            OutboundRecord::new("b", Payload::new(), 20),
            OutboundRecord::new("z", Payload::new(), 10),
            OutboundRecord::new("a", Payload::new(), 20),
        ];
        sort_for_scan(&mut records);
        let ids: Vec<_> = records.iter().map(|r| r.client_id.as_str()).collect();
        assert_eq!(ids, vec!["z", "a", "b"]);
    }
}
