//! Connectivity monitor.
//!
//! The platform reports connectivity through [`NetworkMonitor::set_online`];
//! everything else reads it from here. Reports are optimistic: "online"
//! means "worth attempting a sync", not "the server will answer".

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::watch;

/// Callback invoked with the new connectivity state.
pub type Listener = Arc<dyn Fn(bool) + Send + Sync>;

/// Single source of truth for connectivity.
///
/// Thread-safe and can be shared across tasks via `Arc`.
pub struct NetworkMonitor {
    state: watch::Sender<bool>,
    listeners: DashMap<String, Listener>,
}

impl std::fmt::Debug for NetworkMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkMonitor")
            .field("online", &self.is_online())
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

impl NetworkMonitor {
    /// Create a monitor with an initial state.
    pub fn new(online: bool) -> Self {
        let (state, _) = watch::channel(online);
        Self {
            state,
            listeners: DashMap::new(),
        }
    }

    /// Create a monitor wrapped in Arc for sharing.
    pub fn shared(online: bool) -> Arc<Self> {
        Arc::new(Self::new(online))
    }

    pub fn is_online(&self) -> bool {
        *self.state.borrow()
    }

    /// Report the current connectivity.
    ///
    /// Repeating the current state is dropped. Returns whether this report
    /// was a transition; listeners run only for transitions, after the new
    /// state is visible to [`is_online`](Self::is_online).
    pub fn set_online(&self, online: bool) -> bool {
        let changed = self.state.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });
        if !changed {
            return false;
        }

        tracing::info!(online, "Connectivity changed");

        // cloned out so a listener may register or remove listeners
        let listeners: Vec<Listener> = self
            .listeners
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        for listener in listeners {
            listener(online);
        }
        true
    }

    /// Register a callback for transitions.
    ///
    /// Returns an id for [`remove`](Self::remove).
    pub fn on_change<F>(&self, listener: F) -> String
    where
        F: Fn(bool) + Send + Sync + 'static,
    {
        let id = uuid::Uuid::new_v4().to_string();
        self.listeners.insert(id.clone(), Arc::new(listener));
        tracing::debug!(listener = %id, "Connectivity listener registered");
        id
    }

    /// Unregister a callback. Returns whether it was registered.
    pub fn remove(&self, id: &str) -> bool {
        self.listeners.remove(id).is_some()
    }

    /// Watch connectivity from async code.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.state.subscribe()
    }
}
