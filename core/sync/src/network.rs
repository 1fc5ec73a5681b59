//! Network reachability monitoring.
//!
//! [`NetworkMonitor`] caches the last known connectivity state so callers
//! can ask "are we online?" without awaiting anything, and fans state
//! transitions out to registered listeners.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use repsync_common::Result;

/// Snapshot of device connectivity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkState {
    /// Whether the remote is believed reachable.
    pub is_online: bool,
    /// Whether any network interface is up.
    pub is_connected: bool,
    /// Platform connection kind ("wifi", "cellular", ...).
    pub connection_type: Option<String>,
    /// Metered connection.
    pub is_expensive: bool,
}

impl NetworkState {
    /// No connectivity at all.
    pub fn offline() -> Self {
        Self {
            is_online: false,
            is_connected: false,
            connection_type: None,
            is_expensive: false,
        }
    }

    /// Connected and reachable over the given connection kind.
    pub fn online(connection_type: impl Into<String>) -> Self {
        Self {
            is_online: true,
            is_connected: true,
            connection_type: Some(connection_type.into()),
            is_expensive: false,
        }
    }

    /// Build a state from raw platform readings.
    ///
    /// An interface can be up without the internet being reachable (captive
    /// portals); only an explicit `Some(false)` reachability marks such a
    /// connection offline.
    pub fn from_platform(
        is_connected: bool,
        internet_reachable: Option<bool>,
        connection_type: Option<String>,
        is_expensive: bool,
    ) -> Self {
        Self {
            is_online: is_connected && internet_reachable != Some(false),
            is_connected,
            connection_type,
            is_expensive,
        }
    }

    /// Mark the connection as metered.
    pub fn with_expensive(mut self, is_expensive: bool) -> Self {
        self.is_expensive = is_expensive;
        self
    }
}

impl Default for NetworkState {
    fn default() -> Self {
        Self::offline()
    }
}

/// Host platform connectivity source.
#[async_trait]
pub trait ConnectivityProbe: Send + Sync {
    /// Actively fetch the current connectivity.
    async fn probe(&self) -> Result<NetworkState>;

    /// Register for change notifications.
    ///
    /// Every state the platform reports afterwards is sent on the returned
    /// channel until the receiver is dropped.
    fn watch(&self) -> mpsc::UnboundedReceiver<NetworkState>;
}

/// Connectivity probe driven by hand.
///
/// Useful for tests, the CLI demo, and hosts that push connectivity events
/// from elsewhere.
pub struct ManualProbe {
    state: Mutex<NetworkState>,
    watchers: Mutex<Vec<mpsc::UnboundedSender<NetworkState>>>,
    probes: AtomicU64,
}

impl ManualProbe {
    /// Create a probe reporting `initial`.
    pub fn new(initial: NetworkState) -> Self {
        Self {
            state: Mutex::new(initial),
            watchers: Mutex::new(Vec::new()),
            probes: AtomicU64::new(0),
        }
    }

    /// Change the reported state and notify watchers.
    pub fn set(&self, state: NetworkState) {
        *lock(&self.state) = state.clone();
        lock(&self.watchers).retain(|tx| tx.send(state.clone()).is_ok());
    }

    /// Change the reported state without notifying watchers.
    ///
    /// Only an active probe will observe it.
    pub fn set_silently(&self, state: NetworkState) {
        *lock(&self.state) = state;
    }

    /// Number of active probes served so far.
    pub fn probe_count(&self) -> u64 {
        self.probes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ConnectivityProbe for ManualProbe {
    async fn probe(&self) -> Result<NetworkState> {
        self.probes.fetch_add(1, Ordering::SeqCst);
        Ok(lock(&self.state).clone())
    }

    fn watch(&self) -> mpsc::UnboundedReceiver<NetworkState> {
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.watchers).push(tx);
        rx
    }
}

type Listener = Arc<dyn Fn(&NetworkState) + Send + Sync>;

/// Listener registry keyed by capability id.
#[derive(Default)]
struct ListenerRegistry {
    listeners: Mutex<HashMap<u64, Listener>>,
    next_id: AtomicU64,
}

impl ListenerRegistry {
    fn insert(&self, listener: Listener) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        lock(&self.listeners).insert(id, listener);
        id
    }

    fn remove(&self, id: u64) -> bool {
        lock(&self.listeners).remove(&id).is_some()
    }

    fn len(&self) -> usize {
        lock(&self.listeners).len()
    }

    /// Invoke every listener with `state`.
    ///
    /// Listeners run outside the registry lock so they may unsubscribe
    /// themselves; a panicking listener is logged and skipped.
    fn notify(&self, state: &NetworkState) {
        let snapshot: Vec<(u64, Listener)> = lock(&self.listeners)
            .iter()
            .map(|(id, l)| (*id, l.clone()))
            .collect();

        for (id, listener) in snapshot {
            invoke(id, &listener, state);
        }
    }
}

fn invoke(id: u64, listener: &Listener, state: &NetworkState) {
    if panic::catch_unwind(AssertUnwindSafe(|| listener(state))).is_err() {
        error!(listener = id, "Network listener panicked; continuing with others");
    }
}

/// Detects offline-to-online edges across listener calls.
///
/// Seeded with the state seen before subscribing, so the immediate
/// subscribe callback only counts when the state really moved.
pub(crate) struct OnlineEdge {
    online: AtomicBool,
}

impl OnlineEdge {
    pub(crate) fn new(online: bool) -> Self {
        Self {
            online: AtomicBool::new(online),
        }
    }

    /// Record `state`; true when it went from offline to online.
    pub(crate) fn rose(&self, state: &NetworkState) -> bool {
        let was_online = self.online.swap(state.is_online, Ordering::SeqCst);
        state.is_online && !was_online
    }
}

/// Handle returned by [`NetworkMonitor::subscribe`].
///
/// Dropping the handle does not unsubscribe.
#[derive(Debug, Clone)]
pub struct Subscription {
    id: u64,
    registry: Weak<ListenerRegistry>,
}

impl Subscription {
    /// Remove the listener. Safe to call repeatedly and from inside the
    /// listener itself.
    pub fn unsubscribe(&self) {
        if let Some(registry) = self.registry.upgrade() {
            if registry.remove(self.id) {
                debug!(listener = self.id, "Network listener removed");
            }
        }
    }
}

struct MonitorInner {
    probe: Arc<dyn ConnectivityProbe>,
    state: RwLock<NetworkState>,
    listeners: Arc<ListenerRegistry>,
    monitoring: AtomicBool,
    watch_task: Mutex<Option<JoinHandle<()>>>,
}

impl MonitorInner {
    /// Replace the cached state, notifying listeners when `is_online` flips.
    fn apply(&self, next: NetworkState) {
        let changed = {
            let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
            let changed = state.is_online != next.is_online;
            *state = next.clone();
            changed
        };

        if changed {
            if next.is_online {
                info!(connection = ?next.connection_type, "Network: online");
            } else {
                warn!("Network: offline");
            }
            self.listeners.notify(&next);
        }
    }
}

/// Single source of truth for "can we reach the network".
///
/// Cloning is cheap; clones share state and listeners.
#[derive(Clone)]
pub struct NetworkMonitor {
    inner: Arc<MonitorInner>,
}

impl NetworkMonitor {
    /// Create a monitor over the given probe.
    ///
    /// The cached state starts offline until [`start_monitoring`] or
    /// [`refresh`] has probed the platform.
    ///
    /// [`start_monitoring`]: NetworkMonitor::start_monitoring
    /// [`refresh`]: NetworkMonitor::refresh
    pub fn new(probe: Arc<dyn ConnectivityProbe>) -> Self {
        Self {
            inner: Arc::new(MonitorInner {
                probe,
                state: RwLock::new(NetworkState::offline()),
                listeners: Arc::new(ListenerRegistry::default()),
                monitoring: AtomicBool::new(false),
                watch_task: Mutex::new(None),
            }),
        }
    }

    /// Begin listening to platform connectivity changes.
    ///
    /// Idempotent: a second call while monitoring is a no-op. A failed
    /// initial probe is logged and leaves the previous state in place.
    pub async fn start_monitoring(&self) -> Result<()> {
        if self.inner.monitoring.swap(true, Ordering::SeqCst) {
            debug!("Network monitoring already started");
            return Ok(());
        }

        // Watch before probing so no transition slips between the two.
        let mut changes = self.inner.probe.watch();

        match self.inner.probe.probe().await {
            Ok(state) => self.inner.apply(state),
            Err(e) => warn!("Initial connectivity probe failed: {}", e),
        }

        let weak = Arc::downgrade(&self.inner);
        let task = tokio::spawn(async move {
            while let Some(state) = changes.recv().await {
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                inner.apply(state);
            }
            debug!("Connectivity watch ended");
        });

        *lock(&self.inner.watch_task) = Some(task);
        info!("Network monitoring started");
        Ok(())
    }

    /// Stop listening to platform changes. The cached state is kept.
    pub fn stop_monitoring(&self) {
        if let Some(task) = lock(&self.inner.watch_task).take() {
            task.abort();
        }
        self.inner.monitoring.store(false, Ordering::SeqCst);
    }

    /// Whether monitoring is active.
    pub fn is_monitoring(&self) -> bool {
        self.inner.monitoring.load(Ordering::SeqCst)
    }

    /// Last known online flag. Never blocks on I/O.
    pub fn is_online(&self) -> bool {
        self.current_state().is_online
    }

    /// Last known full state.
    pub fn current_state(&self) -> NetworkState {
        self.inner
            .state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Register a listener.
    ///
    /// The listener runs immediately with the current state, then on every
    /// change of `is_online`.
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&NetworkState) + Send + Sync + 'static,
    {
        let listener: Listener = Arc::new(listener);
        let id = self.inner.listeners.insert(listener.clone());
        invoke(id, &listener, &self.current_state());

        Subscription {
            id,
            registry: Arc::downgrade(&self.inner.listeners),
        }
    }

    /// Number of registered listeners.
    pub fn listener_count(&self) -> usize {
        self.inner.listeners.len()
    }

    /// Actively re-probe and update the cached state.
    pub async fn refresh(&self) -> Result<NetworkState> {
        let state = self.inner.probe.probe().await?;
        self.inner.apply(state.clone());
        Ok(state)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
