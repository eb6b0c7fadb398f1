//! In-process transport whose answers are scripted by the caller.

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, Mutex, PoisonError, RwLock,
};

use tally_engine::{BatchResponse, QueryParams, QueryResult, RecordOutcome, SubmitBatch};
use tokio::sync::Notify;

use super::Transport;
use crate::error::TransportError;

type BatchHandler = Arc<dyn Fn(&SubmitBatch) -> Result<BatchResponse, TransportError> + Send + Sync>;
type QueryHandler = Arc<dyn Fn(&QueryParams) -> Result<QueryResult, TransportError> + Send + Sync>;

/// A [`Transport`] for tests and demos.
///
/// Records every request it receives. Handlers can be swapped at any time,
/// and batches can be held until released to observe a pass in flight.
pub struct ScriptedTransport {
    batch: RwLock<BatchHandler>,
    query: RwLock<QueryHandler>,
    gate: Mutex<Option<Arc<Notify>>>,
    submissions: Mutex<Vec<SubmitBatch>>,
    queries: Mutex<Vec<QueryParams>>,
    batch_calls: AtomicUsize,
    query_calls: AtomicUsize,
}

impl std::fmt::Debug for ScriptedTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptedTransport")
            .field("batch_calls", &self.submission_count())
            .field("query_calls", &self.query_count())
            .finish_non_exhaustive()
    }
}

impl ScriptedTransport {
    /// Accept every record, assigning `srv-{clientId}`; answer every query
    /// with an empty result.
    pub fn accept_all() -> Self {
        Self::with_handlers(
            Arc::new(|batch: &SubmitBatch| {
                Ok(BatchResponse {
                    results: batch
                        .client_ids()
                        .map(|id| RecordOutcome::success(id.clone(), format!("srv-{id}")))
                        .collect(),
                })
            }),
            Arc::new(|_: &QueryParams| Ok(QueryResult::default())),
        )
    }

    /// Fail every request as if the server were down.
    pub fn unreachable() -> Self {
        Self::with_handlers(
            Arc::new(|_: &SubmitBatch| Err(unreachable_error())),
            Arc::new(|_: &QueryParams| Err(unreachable_error())),
        )
    }

    fn with_handlers(batch: BatchHandler, query: QueryHandler) -> Self {
        Self {
            batch: RwLock::new(batch),
            query: RwLock::new(query),
            gate: Mutex::new(None),
            submissions: Mutex::new(Vec::new()),
            queries: Mutex::new(Vec::new()),
            batch_calls: AtomicUsize::new(0),
            query_calls: AtomicUsize::new(0),
        }
    }

    /// Replace how batches are answered.
    pub fn on_batch<F>(&self, handler: F)
    where
        F: Fn(&SubmitBatch) -> Result<BatchResponse, TransportError> + Send + Sync + 'static,
    {
        *self.batch.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(handler);
    }

    /// Replace how queries are answered.
    pub fn on_query<F>(&self, handler: F)
    where
        F: Fn(&QueryParams) -> Result<QueryResult, TransportError> + Send + Sync + 'static,
    {
        *self.query.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(handler);
    }

    /// Make every following batch wait for a permit on the returned
    /// [`Notify`] before it is answered. Batches are recorded on arrival.
    pub fn hold_batches(&self) -> Arc<Notify> {
        let notify = Arc::new(Notify::new());
        *self.gate.lock().unwrap_or_else(PoisonError::into_inner) = Some(Arc::clone(&notify));
        notify
    }

    /// Stop holding batches.
    pub fn release_batches(&self) {
        if let Some(gate) = self.gate.lock().unwrap_or_else(PoisonError::into_inner).take() {
            gate.notify_waiters();
        }
    }

    /// Every batch received so far, in arrival order.
    pub fn submissions(&self) -> Vec<SubmitBatch> {
        self.submissions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn submission_count(&self) -> usize {
        self.batch_calls.load(Ordering::SeqCst)
    }

    /// Every query received so far, in arrival order.
    pub fn queries(&self) -> Vec<QueryParams> {
        self.queries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn query_count(&self) -> usize {
        self.query_calls.load(Ordering::SeqCst)
    }
}

/// The error a down server produces.
pub fn unreachable_error() -> TransportError {
    TransportError::Unreachable("connection refused".into())
}

impl Transport for ScriptedTransport {
    async fn submit_batch(&self, batch: &SubmitBatch) -> Result<BatchResponse, TransportError> {
        self.submissions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(batch.clone());
        self.batch_calls.fetch_add(1, Ordering::SeqCst);

        let gate = self
            .gate
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }

        let handler = Arc::clone(&*self.batch.read().unwrap_or_else(PoisonError::into_inner));
        handler(batch)
    }

    async fn query(&self, params: &QueryParams) -> Result<QueryResult, TransportError> {
        self.queries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(params.clone());
        self.query_calls.fetch_add(1, Ordering::SeqCst);

        let handler = Arc::clone(&*self.query.read().unwrap_or_else(PoisonError::into_inner));
        handler(params)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tally_engine::{OutboundRecord, Payload};

    #[tokio::test]
    async fn accept_all_assigns_server_ids() {
        let transport = ScriptedTransport::accept_all();
        let records = [
            OutboundRecord::new("c-1", Payload::new(), 1),
            OutboundRecord::new("c-2", Payload::new(), 2),
        ];
        let response = transport
            .submit_batch(&SubmitBatch::from_records(&records))
            .await
            .unwrap();

        assert_eq!(
            response.results,
            vec![
                RecordOutcome::success("c-1", "srv-c-1"),
                RecordOutcome::success("c-2", "srv-c-2"),
            ]
        );
        assert_eq!(transport.submission_count(), 1);
        assert_eq!(transport.submissions()[0].len(), 2);
    }

    #[tokio::test]
    async fn handlers_can_be_swapped() {
        let transport = ScriptedTransport::unreachable();
        let params = QueryParams::new("invoices");
        assert_eq!(transport.query(&params).await, Err(unreachable_error()));

        transport.on_query(|_| Ok(QueryResult::new(vec![serde_json::json!({"id": 1})])));
        assert_eq!(transport.query(&params).await.unwrap().items.len(), 1);
        assert_eq!(transport.query_count(), 2);
    }

    #[tokio::test]
    async fn held_batches_wait_for_release() {
        let transport = Arc::new(ScriptedTransport::accept_all());
        let gate = transport.hold_batches();

        let task = {
            let transport = Arc::clone(&transport);
            tokio::spawn(async move { transport.submit_batch(&SubmitBatch::default()).await })
        };

        while transport.submission_count() == 0 {
            tokio::task::yield_now().await;
        }
        assert!(!task.is_finished());

        gate.notify_one();
        assert!(task.await.unwrap().is_ok());
    }
}
