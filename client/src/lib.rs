//! Tally Client - the offline-first side of Tally's sync engine.
//!
//! Wires the deterministic core in `tally-engine` to real storage, a real
//! network and a real clock:
//!
//! - [`store`]: the [`LocalStore`] contract, with SQLite and in-memory
//!   backends under [`db`]
//! - [`network`]: the [`NetworkMonitor`], the single source of truth for
//!   connectivity
//! - [`queue`]: the [`WriteQueue`] of outbound records
//! - [`cache`]: the [`ReadCache`] of inbound query results
//! - [`coordinator`]: the [`SyncCoordinator`] that drains the queue and
//!   refreshes the cache whenever connectivity allows
//! - [`transport`]: the [`Transport`] contract and its HTTP implementation,
//!   plus a scripted stand-in for tests behind the `test-util` feature

pub mod cache;
pub mod config;
pub mod coordinator;
pub mod db;
pub mod error;
pub mod network;
pub mod queue;
pub mod store;
pub mod transport;

pub use cache::{CachedView, ReadCache, ViewSource};
pub use config::{Config, ConfigError};
pub use coordinator::{
    PassOutcome, SyncConfig, SyncCoordinator, SyncEvent, SyncHandle, SyncReport, SyncState,
    SyncTrigger,
};
pub use db::{MemoryStore, SqliteStore};
pub use error::{Result, StorageError, SyncError, TransportError};
pub use network::NetworkMonitor;
pub use queue::{DrainReport, WriteQueue};
pub use store::LocalStore;
pub use transport::{HttpTransport, Transport};
#[cfg(any(test, feature = "test-util"))]
pub use transport::ScriptedTransport;

use tally_engine::{Clock, Timestamp};

/// Wall clock in milliseconds since the Unix epoch.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        // pre-epoch clocks are clamped rather than wrapped
        chrono::Utc::now().timestamp_millis().max(0) as Timestamp
    }
}
