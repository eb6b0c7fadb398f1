//! Wire types for the sync and query endpoints.
//!
//! A batch carries every pending record in one request. The server handles
//! each record on its own and answers with one [`RecordOutcome`] per record,
//! correlated by the client id the request echoed.

use crate::{ClientId, OutboundRecord, Payload, ServerId};
use serde::{Deserialize, Serialize};

/// One record inside a batch submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitItem {
    /// Client id, echoed back in the matching outcome
    pub client_id: ClientId,
    /// Full field set of the entity
    pub fields: Payload,
}

impl From<&OutboundRecord> for SubmitItem {
    fn from(record: &OutboundRecord) -> Self {
        Self {
            client_id: record.client_id.clone(),
            fields: record.payload.clone(),
        }
    }
}

/// Request body for the batch sync endpoint.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitBatch {
    pub records: Vec<SubmitItem>,
}

impl SubmitBatch {
    /// Build a batch from pending records, preserving their order.
    pub fn from_records<'a>(records: impl IntoIterator<Item = &'a OutboundRecord>) -> Self {
        Self {
            records: records.into_iter().map(SubmitItem::from).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Client ids in submission order.
    pub fn client_ids(&self) -> impl Iterator<Item = &ClientId> {
        self.records.iter().map(|r| &r.client_id)
    }
}

/// How the server handled one record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "lowercase")]
pub enum Outcome {
    /// Stored; carries the authoritative id
    Success {
        #[serde(rename = "serverId")]
        server_id: ServerId,
    },
    /// Explicitly rejected; retrying unchanged will not help
    Failure { reason: String },
}

/// Per-record result inside a batch response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordOutcome {
    pub client_id: ClientId,
    #[serde(flatten)]
    pub outcome: Outcome,
}

impl RecordOutcome {
    /// A success outcome.
    pub fn success(client_id: impl Into<ClientId>, server_id: impl Into<ServerId>) -> Self {
        Self {
            client_id: client_id.into(),
            outcome: Outcome::Success {
                server_id: server_id.into(),
            },
        }
    }

    /// A failure outcome.
    pub fn failure(client_id: impl Into<ClientId>, reason: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            outcome: Outcome::Failure {
                reason: reason.into(),
            },
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.outcome, Outcome::Success { .. })
    }
}

/// Response body of the batch sync endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchResponse {
    pub results: Vec<RecordOutcome>,
}

/// Result of the inbound query endpoint, stored verbatim in the read cache.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryResult {
    /// The entities matching the query
    #[serde(default)]
    pub items: Vec<serde_json::Value>,
    /// Aggregates returned alongside the items (totals, counts, ...)
    #[serde(default)]
    pub summary: serde_json::Map<String, serde_json::Value>,
}

impl QueryResult {
    pub fn new(items: Vec<serde_json::Value>) -> Self {
        Self {
            items,
            summary: serde_json::Map::new(),
        }
    }

    /// Builder-style method to attach a summary value.
    pub fn with_summary(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.summary.insert(key.into(), value);
        self
    }
}
