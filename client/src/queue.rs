//! The write queue: outbound records on their way to the server.
//!
//! Every write lands here first, online or not. A sync pass submits all
//! pending records in one batch and applies the server's verdicts; records
//! only ever move from `Pending` to `Synced` and are never deleted.

use std::sync::Arc;

use tally_engine::{
    reconcile, Acknowledgment, Clock, ClientId, OutboundRecord, Partition, RecordOutcome,
    RecordSchema, Rejection, ServerId, SubmitBatch,
};

use crate::error::{Result, StorageError, SyncError, TransportError};
use crate::store::LocalStore;
use crate::transport::Transport;
use crate::SystemClock;

/// Attempts at finding an unused client id before giving up.
const MAX_ID_ATTEMPTS: usize = 3;

/// What one drain of the queue did.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DrainReport {
    /// Records sent to the server
    pub submitted: usize,
    /// Records the server stored
    pub synced: Vec<Acknowledgment>,
    /// Records the server refused; still pending
    pub rejected: Vec<Rejection>,
    /// Submitted records the server did not mention; still pending
    pub unanswered: Vec<ClientId>,
    /// Outcomes for ids that were never submitted
    pub unknown: Vec<ClientId>,
    /// Pending records after the drain, including ones enqueued meanwhile
    pub remaining_pending: usize,
    /// Set when the batch never got an answer; nothing was changed
    pub transport_error: Option<TransportError>,
}

/// Outbound record queue over a [`LocalStore`].
pub struct WriteQueue<S, T> {
    store: Arc<S>,
    transport: Arc<T>,
    schema: RecordSchema,
    clock: Arc<dyn Clock>,
}

impl<S: LocalStore, T: Transport> WriteQueue<S, T> {
    pub fn new(store: Arc<S>, transport: Arc<T>, schema: RecordSchema) -> Self {
        Self::with_clock(store, transport, schema, Arc::new(SystemClock))
    }

    pub fn with_clock(
        store: Arc<S>,
        transport: Arc<T>,
        schema: RecordSchema,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            transport,
            schema,
            clock,
        }
    }

    pub fn schema(&self) -> &RecordSchema {
        &self.schema
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Validate `payload` and persist it as a new pending record.
    ///
    /// Returns the generated client id. Nothing is written if validation
    /// fails; every violation is reported, not just the first.
    pub async fn enqueue(&self, payload: serde_json::Value) -> Result<ClientId> {
        self.schema.validate_payload(&payload)?;
        let payload = match payload {
            serde_json::Value::Object(fields) => fields,
            other => return Err(SyncError::Validation(self.schema.violations(&other))),
        };

        let created_at = self.clock.now();
        let mut attempts = 0;
        loop {
            let client_id = generate_client_id(created_at);
            let record = OutboundRecord::new(client_id.clone(), payload.clone(), created_at);
            match self.store.insert(&record).await {
                Ok(()) => {
                    tracing::debug!(client_id = %client_id, "Record enqueued");
                    return Ok(client_id);
                }
                Err(StorageError::Conflict { .. }) if attempts + 1 < MAX_ID_ATTEMPTS => {
                    attempts += 1;
                    tracing::warn!(client_id = %client_id, "Client id collision, regenerating");
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    pub async fn get(&self, client_id: &str) -> Result<Option<OutboundRecord>> {
        Ok(self.store.get(client_id).await?)
    }

    /// Every pending record, oldest first.
    pub async fn list_pending(&self) -> Result<Vec<OutboundRecord>> {
        Ok(self
            .store
            .scan(|r: &OutboundRecord| r.is_pending())
            .await?)
    }

    pub async fn pending_count(&self) -> Result<usize> {
        Ok(self.list_pending().await?.len())
    }

    /// Every record in the queue, synced or not.
    pub async fn len(&self) -> Result<usize> {
        Ok(self.store.count(Partition::Outbound).await?)
    }

    /// Flip a record to `Synced`.
    ///
    /// Idempotent: returns `false` for an unknown id or a record that is
    /// already synced, and changes nothing in either case.
    pub async fn mark_synced(&self, client_id: &str, server_id: impl Into<ServerId>) -> Result<bool> {
        let server_id = server_id.into();
        let now = self.clock.now();
        self.update(client_id, |record| record.mark_synced(Some(server_id), now))
            .await
    }

    /// Remember why the server refused a record. The record stays pending.
    pub async fn record_rejection(&self, client_id: &str, reason: impl Into<String>) -> Result<bool> {
        let reason = reason.into();
        self.update(client_id, |record| record.record_rejection(reason))
            .await
    }

    /// Submit `records` in a single request and return the per-record
    /// outcomes. Does not touch the store.
    pub async fn submit_batch(
        &self,
        records: &[OutboundRecord],
    ) -> std::result::Result<Vec<RecordOutcome>, TransportError> {
        let batch = SubmitBatch::from_records(records);
        Ok(self.transport.submit_batch(&batch).await?.results)
    }

    /// Drain the queue once.
    ///
    /// A transport failure is not an error here: it is reported in the
    /// [`DrainReport`] and every record stays pending. Only local storage
    /// failures are returned as errors.
    ///
    /// Only the coordinator runs passes, so that at most one is in flight.
    pub(crate) async fn sync_pass(&self) -> Result<DrainReport> {
        let pending = self.list_pending().await?;
        if pending.is_empty() {
            tracing::debug!("Nothing pending, skipping submission");
            return Ok(DrainReport::default());
        }

        let batch = SubmitBatch::from_records(&pending);
        let mut report = DrainReport {
            submitted: batch.len(),
            ..DrainReport::default()
        };

        let response = match self.transport.submit_batch(&batch).await {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(records = batch.len(), error = %e, "Batch submission failed, records stay pending");
                report.remaining_pending = self.pending_count().await?;
                report.transport_error = Some(e);
                return Ok(report);
            }
        };

        let plan = reconcile(&batch, &response);
        let now = self.clock.now();

        for ack in &plan.synced {
            let server_id = ack.server_id.clone();
            // answered for a record that was synced meanwhile: leave it be
            self.update(&ack.client_id, |record| {
                if !record.mark_synced(Some(server_id), now) {
                    return false;
                }
                record.record_attempt();
                true
            })
            .await?;
        }

        for rejection in &plan.rejected {
            tracing::warn!(
                client_id = %rejection.client_id,
                reason = %rejection.reason,
                "Server rejected record"
            );
            let reason = rejection.reason.clone();
            self.update(&rejection.client_id, |record| {
                if !record.record_rejection(reason) {
                    return false;
                }
                record.record_attempt();
                true
            })
            .await?;
        }

        if !plan.unknown.is_empty() {
            tracing::debug!(ids = ?plan.unknown, "Ignoring outcomes for unknown records");
        }

        report.synced = plan.synced;
        report.rejected = plan.rejected;
        report.unanswered = plan.unanswered;
        report.unknown = plan.unknown;
        report.remaining_pending = self.pending_count().await?;

        tracing::info!(
            submitted = report.submitted,
            synced = report.synced.len(),
            rejected = report.rejected.len(),
            unanswered = report.unanswered.len(),
            remaining = report.remaining_pending,
            "Queue drained"
        );

        Ok(report)
    }

    /// Load a record, apply `change` and write it back if `change` says it
    /// changed anything. Unknown ids are a no-op.
    async fn update<F>(&self, client_id: &str, change: F) -> Result<bool>
    where
        F: FnOnce(&mut OutboundRecord) -> bool + Send,
    {
        let Some(mut record) = self.store.get::<OutboundRecord>(client_id).await? else {
            tracing::debug!(client_id = %client_id, "No such record, ignoring");
            return Ok(false);
        };
        if !change(&mut record) {
            return Ok(false);
        }
        self.store.put(&record).await?;
        Ok(true)
    }
}

/// `{created_at:013}-{uuid}`: sorts by creation time, unique by uuid.
fn generate_client_id(created_at: tally_engine::Timestamp) -> ClientId {
    format!("{:013}-{}", created_at, uuid::Uuid::new_v4().simple())
}

impl DrainReport {
    /// Whether the server answered and every submitted record is now synced.
    pub fn is_clean(&self) -> bool {
        self.transport_error.is_none() && self.rejected.is_empty() && self.unanswered.is_empty()
    }

    /// Server rejections as errors, for callers that surface them one by one.
    pub fn rejection_errors(&self) -> impl Iterator<Item = SyncError> + '_ {
        self.rejected.iter().map(|r| SyncError::ServerRejection {
            client_id: r.client_id.clone(),
            reason: r.reason.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryStore;
    use crate::transport::{unreachable_error, ScriptedTransport};
    use serde_json::json;
    use tally_engine::{FieldDef, FieldType, ManualClock, OutboundStatus, Violation};

    fn schema() -> RecordSchema {
        RecordSchema::new(vec![
            FieldDef::required("account", FieldType::String).max_length(10),
            FieldDef::required("reading", FieldType::Int).range(0.0, 1000.0),
        ])
    }

    fn queue(transport: ScriptedTransport) -> (WriteQueue<MemoryStore, ScriptedTransport>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        let queue = WriteQueue::with_clock(
            Arc::new(MemoryStore::new()),
            Arc::new(transport),
            schema(),
            clock.clone(),
        );
        (queue, clock)
    }

    #[tokio::test]
    async fn enqueue_persists_pending() {
        let (queue, _) = queue(ScriptedTransport::accept_all());
        let id = queue
            .enqueue(json!({"account": "AC-1", "reading": 5}))
            .await
            .unwrap();

        assert!(id.starts_with("1700000000000-"));
        let record = queue.get(&id).await.unwrap().unwrap();
        assert_eq!(record.status, OutboundStatus::Pending);
        assert_eq!(record.created_at, 1_700_000_000_000);
    }

    #[tokio::test]
    async fn enqueue_reports_every_violation() {
        let (queue, _) = queue(ScriptedTransport::accept_all());
        let err = queue
            .enqueue(json!({"account": "much too long an account", "reading": -1}))
            .await
            .unwrap_err();

        let SyncError::Validation(errors) = err else {
            panic!("expected validation error, got {err:?}");
        };
        assert_eq!(errors.len(), 2);
        assert!(matches!(errors.for_field("account").next(), Some(Violation::TooLong { .. })));
        assert!(matches!(errors.for_field("reading").next(), Some(Violation::OutOfRange { .. })));
        assert_eq!(queue.len().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn enqueue_rejects_non_objects() {
        let (queue, _) = queue(ScriptedTransport::accept_all());
        assert!(matches!(
            queue.enqueue(json!([1, 2])).await,
            Err(SyncError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn ids_are_unique_within_a_millisecond() {
        let (queue, _) = queue(ScriptedTransport::accept_all());
        let mut ids = std::collections::HashSet::new();
        for _ in 0..50 {
            let id = queue
                .enqueue(json!({"account": "AC-1", "reading": 1}))
                .await
                .unwrap();
            assert!(ids.insert(id));
        }
        assert_eq!(queue.pending_count().await.unwrap(), 50);
    }

    #[tokio::test]
    async fn mark_synced_is_idempotent() {
        let (queue, clock) = queue(ScriptedTransport::accept_all());
        let id = queue
            .enqueue(json!({"account": "AC-1", "reading": 1}))
            .await
            .unwrap();

        clock.advance(10);
        assert!(queue.mark_synced(&id, "srv-1").await.unwrap());
        clock.advance(10);
        assert!(!queue.mark_synced(&id, "srv-2").await.unwrap());
        assert!(!queue.mark_synced("no-such-id", "srv-3").await.unwrap());

        let record = queue.get(&id).await.unwrap().unwrap();
        assert_eq!(record.server_id.as_deref(), Some("srv-1"));
        assert_eq!(record.synced_at, Some(1_700_000_000_010));
    }

    #[tokio::test]
    async fn pass_applies_mixed_outcomes() {
        let (queue, _) = queue(ScriptedTransport::accept_all());
        let good = queue
            .enqueue(json!({"account": "AC-1", "reading": 1}))
            .await
            .unwrap();
        let bad = queue
            .enqueue(json!({"account": "AC-2", "reading": 2}))
            .await
            .unwrap();

        let (good_id, bad_id) = (good.clone(), bad.clone());
        queue.transport.on_batch(move |_| {
            Ok(tally_engine::BatchResponse {
                results: vec![
                    RecordOutcome::success(good_id.clone(), "srv-1"),
                    RecordOutcome::failure(bad_id.clone(), "account closed"),
                    RecordOutcome::success("stranger", "srv-x"),
                ],
            })
        });

        let report = queue.sync_pass().await.unwrap();
        assert_eq!(report.submitted, 2);
        assert_eq!(report.synced.len(), 1);
        assert_eq!(report.rejected[0].reason, "account closed");
        assert_eq!(report.unknown, vec!["stranger".to_string()]);
        assert_eq!(report.remaining_pending, 1);
        assert!(!report.is_clean());

        let bad = queue.get(&bad).await.unwrap().unwrap();
        assert!(bad.is_pending());
        assert_eq!(bad.last_rejection.as_deref(), Some("account closed"));
        assert_eq!(bad.attempts, 1);
        assert!(!queue.get(&good).await.unwrap().unwrap().is_pending());
    }

    #[tokio::test]
    async fn late_answer_for_synced_record_is_ignored() {
        let transport = Arc::new(ScriptedTransport::accept_all());
        let queue = Arc::new(WriteQueue::with_clock(
            Arc::new(MemoryStore::new()),
            Arc::clone(&transport),
            schema(),
            Arc::new(ManualClock::new(1_700_000_000_000)),
        ));
        let id = queue
            .enqueue(json!({"account": "AC-1", "reading": 1}))
            .await
            .unwrap();

        let gate = transport.hold_batches();
        let pass = tokio::spawn({
            let queue = Arc::clone(&queue);
            async move { queue.sync_pass().await }
        });
        while transport.submission_count() == 0 {
            tokio::task::yield_now().await;
        }

        // acknowledged through another path while the batch is in the air
        assert!(queue.mark_synced(&id, "srv-early").await.unwrap());
        let synced = queue.get(&id).await.unwrap().unwrap();
        gate.notify_one();

        let report = pass.await.unwrap().unwrap();
        assert_eq!(report.remaining_pending, 0);
        let after = queue.get(&id).await.unwrap().unwrap();
        assert_eq!(after, synced);
        assert_eq!(after.attempts, 0);
        assert_eq!(after.server_id.as_deref(), Some("srv-early"));
    }

    #[tokio::test]
    async fn transport_failure_changes_nothing() {
        let (queue, _) = queue(ScriptedTransport::unreachable());
        let id = queue
            .enqueue(json!({"account": "AC-1", "reading": 1}))
            .await
            .unwrap();
        let before = queue.get(&id).await.unwrap().unwrap();

        let report = queue.sync_pass().await.unwrap();
        assert_eq!(report.transport_error, Some(unreachable_error()));
        assert_eq!(report.remaining_pending, 1);
        assert_eq!(queue.get(&id).await.unwrap().unwrap(), before);
    }

    #[tokio::test]
    async fn empty_queue_sends_nothing() {
        let (queue, _) = queue(ScriptedTransport::accept_all());
        let report = queue.sync_pass().await.unwrap();
        assert_eq!(report, DrainReport::default());
        assert_eq!(queue.transport.submission_count(), 0);
    }

    #[tokio::test]
    async fn rejections_surface_as_errors() {
        let report = DrainReport {
            rejected: vec![Rejection {
                client_id: "c-1".into(),
                reason: "duplicate".into(),
            }],
            ..DrainReport::default()
        };
        let errors: Vec<_> = report.rejection_errors().collect();
        assert_eq!(errors[0].to_string(), "server rejected c-1: duplicate");
    }
}
