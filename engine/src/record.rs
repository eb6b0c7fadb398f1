//! Record types held in the local store.

use crate::{CacheKey, ClientId, QueryResult, ServerId, Staleness, Timestamp};
use serde::{Deserialize, Serialize};

/// Field name to value mapping for an outbound write.
pub type Payload = serde_json::Map<String, serde_json::Value>;

/// Sync status of an outbound record.
///
/// There is deliberately no "failed" state: a record the server rejected
/// stays `Pending` and carries the reason.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutboundStatus {
    /// Written locally, not yet acknowledged by the server
    Pending,
    /// Acknowledged by the server; final
    Synced,
}

/// A write made on this device, waiting for (or past) server confirmation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundRecord {
    /// Locally generated id, echoed to the server for correlation
    pub client_id: ClientId,
    /// Every field needed to create the entity server-side
    pub payload: Payload,
    /// Current sync status
    pub status: OutboundStatus,
    /// Local creation time (milliseconds since epoch)
    pub created_at: Timestamp,
    /// Time of confirmed server acknowledgment
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub synced_at: Option<Timestamp>,
    /// Authoritative id assigned by the server
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_id: Option<ServerId>,
    /// Reason given by the server the last time it rejected this record
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_rejection: Option<String>,
    /// Number of times the server answered a submission of this record
    #[serde(default)]
    pub attempts: u32,
}

impl OutboundRecord {
    /// Create a new pending record.
    pub fn new(client_id: impl Into<ClientId>, payload: Payload, created_at: Timestamp) -> Self {
        Self {
            client_id: client_id.into(),
            payload,
            status: OutboundStatus::Pending,
            created_at,
            synced_at: None,
            server_id: None,
            last_rejection: None,
            attempts: 0,
        }
    }

    /// Check if the record still needs to reach the server.
    pub fn is_pending(&self) -> bool {
        self.status == OutboundStatus::Pending
    }

    /// Flip `Pending` to `Synced`.
    ///
    /// Returns `false` and leaves the record untouched if it is already
    /// synced, so a duplicate acknowledgment cannot move `synced_at` or swap
    /// the server id.
    pub fn mark_synced(&mut self, server_id: Option<ServerId>, now: Timestamp) -> bool {
        if !self.is_pending() {
            return false;
        }
        self.status = OutboundStatus::Synced;
        self.synced_at = Some(now);
        self.server_id = server_id;
        self.last_rejection = None;
        true
    }

    /// Remember a server rejection. Ignored once synced.
    pub fn record_rejection(&mut self, reason: impl Into<String>) -> bool {
        if !self.is_pending() {
            return false;
        }
        self.last_rejection = Some(reason.into());
        true
    }

    /// Count one more submission attempt.
    pub fn record_attempt(&mut self) {
        self.attempts = self.attempts.saturating_add(1);
    }
}

/// A cached copy of a server read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundCacheEntry {
    /// Canonical key of the query that produced this result
    pub cache_key: CacheKey,
    /// The result exactly as the server returned it
    pub result: QueryResult,
    /// Capture time (milliseconds since epoch)
    pub cached_at: Timestamp,
}

impl InboundCacheEntry {
    pub fn new(cache_key: impl Into<CacheKey>, result: QueryResult, cached_at: Timestamp) -> Self {
        Self {
            cache_key: cache_key.into(),
            result,
            cached_at,
        }
    }

    /// How old this entry is at `now`.
    pub fn staleness(&self, now: Timestamp) -> Staleness {
        Staleness::between(self.cached_at, now)
    }
}
