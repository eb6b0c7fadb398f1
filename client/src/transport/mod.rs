//! Transport to the sync and query endpoints.

use std::future::Future;

use tally_engine::{BatchResponse, QueryParams, QueryResult, SubmitBatch};

use crate::error::TransportError;

mod http;
#[cfg(any(test, feature = "test-util"))]
mod scripted;

pub use http::HttpTransport;
#[cfg(any(test, feature = "test-util"))]
pub use scripted::{unreachable_error, ScriptedTransport};

/// How the client reaches the server.
///
/// Any `Err` means the server's answer is unknown, so callers must leave
/// every record they submitted exactly as it was.
pub trait Transport: Send + Sync + 'static {
    /// Submit every record of `batch` in one request.
    fn submit_batch(
        &self,
        batch: &SubmitBatch,
    ) -> impl Future<Output = Result<BatchResponse, TransportError>> + Send;

    /// Run a read against the query endpoint.
    fn query(
        &self,
        params: &QueryParams,
    ) -> impl Future<Output = Result<QueryResult, TransportError>> + Send;
}
