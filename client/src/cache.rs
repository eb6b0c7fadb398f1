//! The read cache: server query results kept for offline use.
//!
//! Entries are keyed by the canonical form of the query and served no
//! matter how old they are. Staleness is reported alongside, so the UI can
//! say "3 hours old" instead of showing nothing.

use std::sync::Arc;

use dashmap::DashMap;
use tally_engine::{
    key_for, CacheKey, Clock, InboundCacheEntry, QueryParams, QueryResult, Staleness,
};

use crate::error::{Result, StorageError, SyncError, TransportError};
use crate::store::LocalStore;
use crate::transport::Transport;
use crate::SystemClock;

/// Where a view's data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewSource {
    /// Fetched from the server just now
    Network,
    /// Served from the local cache
    Cache,
}

/// A query result ready for display.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedView {
    pub entry: InboundCacheEntry,
    pub staleness: Staleness,
    pub source: ViewSource,
}

impl CachedView {
    pub fn result(&self) -> &QueryResult {
        &self.entry.result
    }

    pub fn is_fresh(&self) -> bool {
        self.staleness.band == tally_engine::Freshness::Fresh
    }
}

/// Inbound cache over a [`LocalStore`].
pub struct ReadCache<S, T> {
    store: Arc<S>,
    transport: Arc<T>,
    clock: Arc<dyn Clock>,
    /// Queries currently on screen, refreshed by every sync pass
    displayed: DashMap<CacheKey, QueryParams>,
}

impl<S: LocalStore, T: Transport> ReadCache<S, T> {
    pub fn new(store: Arc<S>, transport: Arc<T>) -> Self {
        Self::with_clock(store, transport, Arc::new(SystemClock))
    }

    pub fn with_clock(store: Arc<S>, transport: Arc<T>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            transport,
            clock,
            displayed: DashMap::new(),
        }
    }

    /// Canonical cache key of a query.
    pub fn key_for(&self, params: &QueryParams) -> CacheKey {
        key_for(params)
    }

    /// Store `result` under `key`, replacing any previous entry.
    pub async fn store(
        &self,
        key: impl Into<CacheKey>,
        result: QueryResult,
    ) -> std::result::Result<InboundCacheEntry, StorageError> {
        let entry = InboundCacheEntry::new(key, result, self.clock.now());
        self.store.put(&entry).await?;
        Ok(entry)
    }

    pub async fn fetch(&self, key: &str) -> std::result::Result<Option<InboundCacheEntry>, StorageError> {
        self.store.get(key).await
    }

    /// How old `entry` is right now.
    pub fn staleness(&self, entry: &InboundCacheEntry) -> Staleness {
        entry.staleness(self.clock.now())
    }

    /// Load a query for display.
    ///
    /// When `online`, asks the server and caches the answer. When offline or
    /// the server cannot be reached, falls back to the cached entry however
    /// old it is. Fails only when there is neither.
    ///
    /// The query is remembered as displayed either way.
    pub async fn load(&self, params: &QueryParams, online: bool) -> Result<CachedView> {
        let key = key_for(params);
        self.displayed.insert(key.clone(), params.canonical());

        let network_error = if online {
            match self.transport.query(params).await {
                Ok(result) => {
                    let entry = self.store(key, result).await?;
                    return Ok(CachedView {
                        entry,
                        staleness: Staleness::fresh(),
                        source: ViewSource::Network,
                    });
                }
                Err(e) => {
                    tracing::warn!(cache_key = %key, error = %e, "Query failed, falling back to cache");
                    e
                }
            }
        } else {
            TransportError::Offline
        };

        match self.fetch(&key).await? {
            Some(entry) => {
                let staleness = self.staleness(&entry);
                tracing::debug!(cache_key = %key, age = %staleness.describe(), "Serving cached result");
                Ok(CachedView {
                    entry,
                    staleness,
                    source: ViewSource::Cache,
                })
            }
            None => Err(SyncError::Transport(network_error)),
        }
    }

    /// Re-fetch a query from the server and cache the answer.
    pub async fn refresh(&self, params: &QueryParams) -> Result<InboundCacheEntry> {
        let result = self.transport.query(params).await?;
        Ok(self.store(key_for(params), result).await?)
    }

    /// Queries currently displayed, ordered by cache key.
    pub fn displayed(&self) -> Vec<QueryParams> {
        let mut queries: Vec<(CacheKey, QueryParams)> = self
            .displayed
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        queries.sort_by(|a, b| a.0.cmp(&b.0));
        queries.into_iter().map(|(_, params)| params).collect()
    }

    /// Stop refreshing a query. Its cached entry is kept.
    pub fn forget(&self, key: &str) -> bool {
        self.displayed.remove(key).is_some()
    }
}
