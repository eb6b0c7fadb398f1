//! HTTP transport over reqwest.

use std::time::Duration;

use reqwest::{RequestBuilder, Url};
use tally_engine::{BatchResponse, QueryParams, QueryResult, SubmitBatch};

use super::Transport;
use crate::error::TransportError;

/// Talks JSON to `POST {base}/sync/batch` and `GET {base}/query/{resource}`.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    base: Url,
    auth_token: Option<String>,
}

impl HttpTransport {
    pub fn new(
        base_url: &str,
        timeout: Duration,
        auth_token: Option<String>,
    ) -> Result<Self, TransportError> {
        let base = Url::parse(base_url)
            .map_err(|e| TransportError::InvalidUrl(format!("{base_url}: {e}")))?;
        if base.cannot_be_a_base() {
            return Err(TransportError::InvalidUrl(format!(
                "{base_url}: not a base url"
            )));
        }

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TransportError::Unreachable(e.to_string()))?;

        Ok(Self {
            client,
            base,
            auth_token,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base
    }

    /// `base` with `segments` appended to its path.
    fn endpoint(&self, segments: &[&str]) -> Result<Url, TransportError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| TransportError::InvalidUrl(self.base.to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.auth_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

fn map_error(err: reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout
    } else if err.is_decode() {
        TransportError::Decode(err.to_string())
    } else if let Some(status) = err.status() {
        TransportError::Status(status.as_u16())
    } else {
        TransportError::Unreachable(err.to_string())
    }
}

async fn decode<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
) -> Result<T, TransportError> {
    let status = response.status();
    if !status.is_success() {
        return Err(TransportError::Status(status.as_u16()));
    }
    let body = response.bytes().await.map_err(map_error)?;
    serde_json::from_slice(&body).map_err(|e| TransportError::Decode(e.to_string()))
}

impl Transport for HttpTransport {
    async fn submit_batch(&self, batch: &SubmitBatch) -> Result<BatchResponse, TransportError> {
        let url = self.endpoint(&["sync", "batch"])?;
        tracing::debug!(url = %url, records = batch.len(), "Submitting batch");

        let response = self
            .authorize(self.client.post(url))
            .json(batch)
            .send()
            .await
            .map_err(map_error)?;

        decode(response).await
    }

    async fn query(&self, params: &QueryParams) -> Result<QueryResult, TransportError> {
        let canonical = params.canonical();
        if canonical.resource.is_empty() {
            return Err(TransportError::InvalidUrl("query without a resource".into()));
        }

        let mut url = self.endpoint(&["query", canonical.resource.as_str()])?;
        url.query_pairs_mut().extend_pairs(params.to_pairs());
        tracing::debug!(url = %url, "Running query");

        let response = self
            .authorize(self.client.get(url))
            .send()
            .await
            .map_err(map_error)?;

        decode(response).await
    }
}
