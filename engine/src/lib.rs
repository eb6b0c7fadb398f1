//! # Tally Engine
//!
//! The deterministic core of Tally's offline-first sync engine.
//!
//! This crate holds everything about offline sync that can be expressed
//! without touching a disk, a socket or the wall clock: the record model,
//! payload validation, canonical cache keys, staleness classification, the
//! batch wire format and the reconciliation of a batch response against the
//! locally pending records. The async runtime side (storage backends,
//! transport, connectivity and the sync coordinator) lives in `tally-client`.
//!
//! ## Design Principles
//!
//! - **No IO**: time is passed in as a [`Timestamp`] or read through [`Clock`]
//! - **Deterministic**: same inputs always produce the same outputs
//! - **Never lose writes**: nothing here can turn a pending record into
//!   anything other than a synced one
//!
//! ## Core Concepts
//!
//! ### Outbound records
//!
//! A write made on this device, waiting for the server. An
//! [`OutboundRecord`] is created `Pending` and flips to `Synced` exactly once,
//! when the server acknowledges it with an authoritative id.
//!
//! ### Inbound cache entries
//!
//! A server read kept for offline use. An [`InboundCacheEntry`] is keyed by
//! the canonical form of the query that produced it (see [`key_for`]) and is
//! served regardless of age; [`Staleness`] only tells the UI how old it is.
//!
//! ### Reconciliation
//!
//! [`reconcile`] turns a [`BatchResponse`] into a [`SyncPlan`]: which records
//! to mark synced, which were rejected and why, and which are still waiting.
//!
//! ## Quick Start
//!
//! ```rust
//! use tally_engine::{
//!     key_for, FieldDef, FieldType, OutboundRecord, QueryParams, RecordSchema,
//! };
//! use serde_json::json;
//!
//! // 1. Describe the payload the server will accept
//! let schema = RecordSchema::new(vec![
//!     FieldDef::required("account", FieldType::String).max_length(12),
//!     FieldDef::required("reading", FieldType::Int).range(0.0, 999_999.0),
//! ]);
//!
//! // 2. Validate and build a pending record
//! let payload = json!({"account": "AC-1001", "reading": 4521});
//! schema.validate_payload(&payload).unwrap();
//! let record = OutboundRecord::new(
//!     "1706745600000-abc",
//!     payload.as_object().unwrap().clone(),
//!     1706745600000,
//! );
//! assert!(record.is_pending());
//!
//! // 3. Derive a cache key; parameter order does not matter
//! let a = QueryParams::new("invoices").filter("ward", "7").filter("status", "open");
//! let b = QueryParams::new("invoices").filter("status", "open").filter("ward", "7");
//! assert_eq!(key_for(&a), key_for(&b));
//! ```

pub mod batch;
pub mod clock;
pub mod error;
pub mod query;
pub mod reconcile;
pub mod record;
pub mod schema;
pub mod snapshot;
pub mod staleness;
pub mod store;

// Re-export main types at crate root
pub use batch::{BatchResponse, Outcome, QueryResult, RecordOutcome, SubmitBatch, SubmitItem};
pub use clock::{Clock, ManualClock};
pub use error::{Error, ValidationErrors, Violation};
pub use query::{key_for, QueryParams, SortDirection, SortSpec, DEFAULT_PER_PAGE};
pub use reconcile::{reconcile, Acknowledgment, Rejection, SyncPlan};
pub use record::{InboundCacheEntry, OutboundRecord, OutboundStatus, Payload};
pub use schema::{FieldDef, FieldType, RecordSchema};
pub use snapshot::{ImportAction, ImportSummary, StoreSnapshot, SNAPSHOT_FORMAT_VERSION};
pub use staleness::{Freshness, Staleness};
pub use store::{Partition, StoredRecord};

/// Type aliases for clarity
pub type ClientId = String;
pub type ServerId = String;
pub type CacheKey = String;
pub type Timestamp = u64;
pub type SchemaVersion = u32;
