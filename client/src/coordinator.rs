//! Sync coordinator.
//!
//! Decides when a sync pass runs and makes sure only one runs at a time.
//! A pass drains the write queue, then refreshes every displayed query.
//!
//! # Triggers
//!
//! ```text
//! startup ─┐
//! offline → online ─┤
//! timer (while online) ─┼─→ request_sync ─→ Idle → Syncing → Idle
//! submit (while online) ─┤
//! manual ─┘
//! ```
//!
//! A request while a pass is in flight is coalesced: it is dropped, and the
//! records it would have sent go out with the next pass. Going offline stops
//! new passes but never cancels one in flight.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tally_engine::{key_for, CacheKey, ClientId, Clock, QueryParams, RecordSchema};
use tokio::sync::{broadcast, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::cache::{CachedView, ReadCache};
use crate::error::Result;
use crate::network::NetworkMonitor;
use crate::queue::WriteQueue;
use crate::store::LocalStore;
use crate::transport::Transport;
use crate::SystemClock;

/// Capacity of the event channel; slow subscribers lag rather than block.
const EVENT_CAPACITY: usize = 64;

/// Coordinator settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    /// Time between periodic passes while online
    pub interval: Duration,
    /// Whether a pass also refreshes displayed queries
    pub refresh_displayed: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300),
            refresh_displayed: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Idle,
    Syncing,
}

/// Why a pass was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncTrigger {
    Startup,
    Online,
    Timer,
    Submit,
    Manual,
}

/// Summary of one completed pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncReport {
    pub trigger: SyncTrigger,
    pub submitted: usize,
    pub synced: usize,
    pub rejected: usize,
    pub remaining_pending: usize,
    pub refreshed: usize,
    pub refresh_failed: usize,
    /// The batch never got an answer
    pub transport_failed: bool,
}

impl SyncReport {
    fn new(trigger: SyncTrigger) -> Self {
        Self {
            trigger,
            submitted: 0,
            synced: 0,
            rejected: 0,
            remaining_pending: 0,
            refreshed: 0,
            refresh_failed: 0,
            transport_failed: false,
        }
    }
}

/// Result of asking for a pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PassOutcome {
    Completed(SyncReport),
    /// Another pass was already in flight
    Coalesced,
    /// The monitor reports no connectivity
    Offline,
}

/// Published on the coordinator's status channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    StateChanged(SyncState),
    PassCompleted(SyncReport),
    Rejected { client_id: ClientId, reason: String },
    TransportFailed(String),
    RefreshFailed { key: CacheKey, error: String },
    StorageFailed(String),
}

/// Runs sync passes over a write queue and a read cache.
pub struct SyncCoordinator<S, T> {
    queue: WriteQueue<S, T>,
    cache: ReadCache<S, T>,
    monitor: Arc<NetworkMonitor>,
    config: SyncConfig,
    in_flight: AtomicBool,
    state: watch::Sender<SyncState>,
    events: broadcast::Sender<SyncEvent>,
}

impl<S: LocalStore, T: Transport> SyncCoordinator<S, T> {
    pub fn new(
        store: Arc<S>,
        transport: Arc<T>,
        monitor: Arc<NetworkMonitor>,
        schema: RecordSchema,
        config: SyncConfig,
    ) -> Arc<Self> {
        Self::with_clock(store, transport, monitor, schema, config, Arc::new(SystemClock))
    }

    pub fn with_clock(
        store: Arc<S>,
        transport: Arc<T>,
        monitor: Arc<NetworkMonitor>,
        schema: RecordSchema,
        config: SyncConfig,
        clock: Arc<dyn Clock>,
    ) -> Arc<Self> {
        let (state, _) = watch::channel(SyncState::Idle);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Arc::new(Self {
            queue: WriteQueue::with_clock(
                Arc::clone(&store),
                Arc::clone(&transport),
                schema,
                Arc::clone(&clock),
            ),
            cache: ReadCache::with_clock(store, transport, clock),
            monitor,
            config,
            in_flight: AtomicBool::new(false),
            state,
            events,
        })
    }

    pub fn queue(&self) -> &WriteQueue<S, T> {
        &self.queue
    }

    pub fn cache(&self) -> &ReadCache<S, T> {
        &self.cache
    }

    pub fn monitor(&self) -> &Arc<NetworkMonitor> {
        &self.monitor
    }

    pub fn state(&self) -> SyncState {
        *self.state.borrow()
    }

    /// Watch the coordinator's state.
    pub fn watch_state(&self) -> watch::Receiver<SyncState> {
        self.state.subscribe()
    }

    /// Receive every event published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    /// Record a user write.
    ///
    /// The write is queued first, whatever the connectivity. When online, a
    /// pass is started in the background; its outcome arrives on the event
    /// channel, not here.
    pub async fn submit(self: &Arc<Self>, payload: serde_json::Value) -> Result<ClientId> {
        let client_id = self.queue.enqueue(payload).await?;
        if self.monitor.is_online() {
            self.spawn_pass(SyncTrigger::Submit);
        }
        Ok(client_id)
    }

    /// Load a query for display, from the server when possible and from the
    /// cache otherwise.
    pub async fn load(&self, params: &QueryParams) -> Result<CachedView> {
        self.cache.load(params, self.monitor.is_online()).await
    }

    /// Run a pass now, unless offline or one is already in flight.
    pub async fn request_sync(&self, trigger: SyncTrigger) -> PassOutcome {
        if !self.monitor.is_online() {
            tracing::debug!(?trigger, "Offline, not syncing");
            return PassOutcome::Offline;
        }
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            tracing::debug!(?trigger, "Sync pass already in flight, coalescing");
            return PassOutcome::Coalesced;
        }

        let _guard = InFlight {
            flag: &self.in_flight,
            state: &self.state,
            events: &self.events,
        };
        set_state(&self.state, &self.events, SyncState::Syncing);

        let report = self.run_pass(trigger).await;
        publish(&self.events, SyncEvent::PassCompleted(report.clone()));
        PassOutcome::Completed(report)
    }

    /// [`request_sync`](Self::request_sync) on a background task.
    pub fn spawn_pass(self: &Arc<Self>, trigger: SyncTrigger) -> JoinHandle<PassOutcome> {
        let coordinator = Arc::clone(self);
        tokio::spawn(async move { coordinator.request_sync(trigger).await })
    }

    /// Start the driver task: a pass on startup, on every offline to online
    /// transition and on every interval tick while online.
    pub fn start(self: &Arc<Self>) -> SyncHandle {
        let (shutdown, shutdown_rx) = oneshot::channel();
        let coordinator = Arc::clone(self);
        let task = tokio::spawn(async move { coordinator.drive(shutdown_rx).await });
        tracing::info!(interval = ?self.config.interval, "Sync coordinator started");
        SyncHandle { shutdown, task }
    }

    async fn drive(self: Arc<Self>, mut shutdown: oneshot::Receiver<()>) {
        let mut online = self.monitor.subscribe();
        let mut interval = tokio::time::interval(self.config.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // the first tick completes immediately
        let mut trigger = SyncTrigger::Startup;

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                changed = online.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let is_online = *online.borrow_and_update();
                    if is_online {
                        self.spawn_pass(SyncTrigger::Online);
                        interval.reset();
                    } else {
                        tracing::debug!("Offline, periodic passes suspended");
                    }
                }
                _ = interval.tick() => {
                    if self.monitor.is_online() {
                        self.spawn_pass(trigger);
                    }
                    trigger = SyncTrigger::Timer;
                }
            }
        }

        tracing::info!("Sync coordinator stopped");
    }

    async fn run_pass(&self, trigger: SyncTrigger) -> SyncReport {
        let mut report = SyncReport::new(trigger);

        match self.queue.sync_pass().await {
            Ok(drain) => {
                for rejection in &drain.rejected {
                    publish(
                        &self.events,
                        SyncEvent::Rejected {
                            client_id: rejection.client_id.clone(),
                            reason: rejection.reason.clone(),
                        },
                    );
                }
                if let Some(e) = &drain.transport_error {
                    report.transport_failed = true;
                    publish(&self.events, SyncEvent::TransportFailed(e.to_string()));
                }
                report.submitted = drain.submitted;
                report.synced = drain.synced.len();
                report.rejected = drain.rejected.len();
                report.remaining_pending = drain.remaining_pending;
            }
            Err(e) => {
                tracing::error!(error = %e, "Sync pass failed on local storage");
                publish(&self.events, SyncEvent::StorageFailed(e.to_string()));
                return report;
            }
        }

        // no point refreshing against a server that just failed us
        if report.transport_failed || !self.config.refresh_displayed {
            return report;
        }

        let queries = self.cache.displayed();
        let results = join_all(queries.iter().map(|params| self.cache.refresh(params))).await;
        for (params, result) in queries.iter().zip(results) {
            match result {
                Ok(_) => report.refreshed += 1,
                Err(e) => {
                    report.refresh_failed += 1;
                    let key = key_for(params);
                    tracing::warn!(cache_key = %key, error = %e, "Refresh failed");
                    publish(
                        &self.events,
                        SyncEvent::RefreshFailed {
                            key,
                            error: e.to_string(),
                        },
                    );
                }
            }
        }

        tracing::info!(
            trigger = ?report.trigger,
            submitted = report.submitted,
            synced = report.synced,
            rejected = report.rejected,
            remaining = report.remaining_pending,
            refreshed = report.refreshed,
            "Sync pass completed"
        );

        report
    }
}

/// Handle to a running driver task.
#[derive(Debug)]
pub struct SyncHandle {
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl SyncHandle {
    /// Stop the driver and wait for it to exit. A pass in flight is left to
    /// finish on its own.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(());
        if let Err(e) = self.task.await {
            tracing::error!(error = %e, "Sync driver task failed");
        }
    }
}

/// Clears the in-flight flag when a pass ends, however it ends.
struct InFlight<'a> {
    flag: &'a AtomicBool,
    state: &'a watch::Sender<SyncState>,
    events: &'a broadcast::Sender<SyncEvent>,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        // Idle before the flag clears, so a new pass cannot be overwritten
        set_state(self.state, self.events, SyncState::Idle);
        self.flag.store(false, Ordering::SeqCst);
    }
}

fn set_state(
    state: &watch::Sender<SyncState>,
    events: &broadcast::Sender<SyncEvent>,
    next: SyncState,
) {
    let changed = state.send_if_modified(|current| {
        if *current == next {
            return false;
        }
        *current = next;
        true
    });
    if changed {
        publish(events, SyncEvent::StateChanged(next));
    }
}

fn publish(events: &broadcast::Sender<SyncEvent>, event: SyncEvent) {
    // no subscribers is fine
    let _ = events.send(event);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryStore;
    use crate::transport::ScriptedTransport;
    use serde_json::json;
    use tally_engine::{FieldDef, FieldType};

    type Coordinator = SyncCoordinator<MemoryStore, ScriptedTransport>;

    fn setup(online: bool) -> (Arc<Coordinator>, Arc<ScriptedTransport>) {
        let transport = Arc::new(ScriptedTransport::accept_all());
        let coordinator = SyncCoordinator::new(
            Arc::new(MemoryStore::new()),
            Arc::clone(&transport),
            NetworkMonitor::shared(online),
            RecordSchema::new(vec![FieldDef::required("account", FieldType::String)]),
            SyncConfig::default(),
        );
        (coordinator, transport)
    }

    #[tokio::test]
    async fn offline_request_is_refused() {
        let (coordinator, transport) = setup(false);
        assert_eq!(
            coordinator.request_sync(SyncTrigger::Manual).await,
            PassOutcome::Offline
        );
        assert_eq!(transport.submission_count(), 0);
    }

    #[tokio::test]
    async fn pass_reports_and_returns_to_idle() {
        let (coordinator, _) = setup(true);
        coordinator
            .queue()
            .enqueue(json!({"account": "AC-1"}))
            .await
            .unwrap();
        let mut events = coordinator.subscribe();

        let PassOutcome::Completed(report) = coordinator.request_sync(SyncTrigger::Manual).await
        else {
            panic!("pass did not run");
        };
        assert_eq!(report.submitted, 1);
        assert_eq!(report.synced, 1);
        assert_eq!(report.remaining_pending, 0);
        assert_eq!(coordinator.state(), SyncState::Idle);

        assert_eq!(
            events.recv().await.unwrap(),
            SyncEvent::StateChanged(SyncState::Syncing)
        );
        assert!(matches!(events.recv().await.unwrap(), SyncEvent::PassCompleted(_)));
        assert_eq!(
            events.recv().await.unwrap(),
            SyncEvent::StateChanged(SyncState::Idle)
        );
    }

    #[tokio::test]
    async fn concurrent_request_is_coalesced() {
        let (coordinator, transport) = setup(true);
        coordinator
            .queue()
            .enqueue(json!({"account": "AC-1"}))
            .await
            .unwrap();
        let gate = transport.hold_batches();

        let first = coordinator.spawn_pass(SyncTrigger::Manual);
        while transport.submission_count() == 0 {
            tokio::task::yield_now().await;
        }
        assert_eq!(coordinator.state(), SyncState::Syncing);
        assert_eq!(
            coordinator.request_sync(SyncTrigger::Manual).await,
            PassOutcome::Coalesced
        );

        gate.notify_one();
        assert!(matches!(first.await.unwrap(), PassOutcome::Completed(_)));
        assert_eq!(transport.submission_count(), 1);
        assert_eq!(coordinator.state(), SyncState::Idle);
    }

    #[tokio::test]
    async fn transport_failure_skips_refresh() {
        let (coordinator, transport) = setup(true);
        coordinator
            .queue()
            .enqueue(json!({"account": "AC-1"}))
            .await
            .unwrap();
        coordinator.load(&QueryParams::new("invoices")).await.unwrap();
        transport.on_batch(|_| Err(crate::transport::unreachable_error()));
        let queries_before = transport.query_count();

        let PassOutcome::Completed(report) = coordinator.request_sync(SyncTrigger::Manual).await
        else {
            panic!("pass did not run");
        };
        assert!(report.transport_failed);
        assert_eq!(report.remaining_pending, 1);
        assert_eq!(transport.query_count(), queries_before);
    }

    #[tokio::test]
    async fn pass_refreshes_displayed_queries() {
        let (coordinator, transport) = setup(true);
        coordinator.load(&QueryParams::new("invoices")).await.unwrap();
        coordinator.load(&QueryParams::new("readings")).await.unwrap();

        let PassOutcome::Completed(report) = coordinator.request_sync(SyncTrigger::Manual).await
        else {
            panic!("pass did not run");
        };
        assert_eq!(report.submitted, 0);
        assert_eq!(report.refreshed, 2);
        assert_eq!(transport.query_count(), 4);
    }
}
