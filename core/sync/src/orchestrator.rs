//! Coordinates stores, the mutation queue and the network monitor.
//!
//! The orchestrator owns the per-store status board and the aggregate
//! statistics. Stores sync concurrently with each other; a single store
//! always pulls before it pushes. A failure in one store is recorded on
//! its status and never stops the others.

use chrono::{DateTime, Utc};
use futures::future::{join_all, BoxFuture, FutureExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::{OnceCell, RwLock};
use tracing::{debug, error, info, warn};

use repsync_common::{Error, Result, SensitiveString, UserId};
use repsync_storage::KeyValueStore;

use crate::network::{ConnectivityProbe, NetworkMonitor, OnlineEdge, Subscription};
use crate::queue::{PendingMutation, PendingOperationsQueue, QueueConfig};
use crate::remote::RealtimeSubscription;
use crate::retry::{RetryConfig, RetryExecutor};
use crate::scheduler::{SyncMode, SyncScheduler};
use crate::status::{StatusBoard, StoreSyncState, SyncStats, SyncStatus};
use crate::store::SyncableStore;

/// Top-level sync configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Pending operations queue settings.
    pub queue: QueueConfig,
    /// Backoff applied around each store's pull and push.
    pub retry: RetryConfig,
    /// When syncs run without an explicit trigger.
    pub sync_mode: SyncMode,
}

impl SyncConfig {
    /// Replace the queue settings.
    pub fn with_queue(mut self, queue: QueueConfig) -> Self {
        self.queue = queue;
        self
    }

    /// Replace the backoff settings.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Replace the scheduling mode.
    pub fn with_sync_mode(mut self, sync_mode: SyncMode) -> Self {
        self.sync_mode = sync_mode;
        self
    }
}

/// Registration of one store.
#[derive(Clone)]
pub struct StoreConfig {
    /// Registry key; must not be blank.
    pub name: String,
    /// Disabled stores are skipped by every sync.
    pub enabled: bool,
    /// Skip the store while nobody is signed in.
    pub requires_auth: bool,
    /// Include the store in the sync run right after sign-in.
    pub sync_on_sign_in: bool,
    /// The store being synced.
    pub store: Arc<dyn SyncableStore>,
}

impl StoreConfig {
    /// Enabled, auth-gated, synced on sign-in.
    pub fn new(name: impl Into<String>, store: Arc<dyn SyncableStore>) -> Self {
        Self {
            name: name.into(),
            enabled: true,
            requires_auth: true,
            sync_on_sign_in: true,
            store,
        }
    }

    /// Enable or disable the store.
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Whether a signed-in user is needed.
    pub fn with_requires_auth(mut self, requires_auth: bool) -> Self {
        self.requires_auth = requires_auth;
        self
    }

    /// Whether sign-in syncs the store.
    pub fn with_sync_on_sign_in(mut self, sync_on_sign_in: bool) -> Self {
        self.sync_on_sign_in = sync_on_sign_in;
        self
    }
}

impl fmt::Debug for StoreConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreConfig")
            .field("name", &self.name)
            .field("enabled", &self.enabled)
            .field("requires_auth", &self.requires_auth)
            .field("sync_on_sign_in", &self.sync_on_sign_in)
            .finish_non_exhaustive()
    }
}

/// The signed-in user.
#[derive(Debug, Clone)]
pub struct Session {
    pub user_id: UserId,
    pub access_token: Option<SensitiveString>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl Session {
    /// Session without a token.
    pub fn new(user_id: UserId) -> Self {
        Self {
            user_id,
            access_token: None,
            expires_at: None,
        }
    }

    /// Attach the access token.
    pub fn with_access_token(mut self, token: impl Into<String>) -> Self {
        self.access_token = Some(SensitiveString::new(token));
        self
    }

    /// Attach the token expiry.
    pub fn with_expires_at(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }
}

/// Why a store sync did not run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Disabled,
    AuthRequired,
    Offline,
    AlreadySyncing,
}

/// Result of a single store sync that did not error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    Synced,
    Skipped(SkipReason),
}

/// Summary of one multi-store sync run.
#[derive(Debug, Clone, Default)]
pub struct SyncReport {
    pub succeeded: Vec<String>,
    pub failed: Vec<String>,
    pub skipped: Vec<(String, SkipReason)>,
    pub duration: Duration,
}

impl SyncReport {
    /// No store failed.
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

struct OrchestratorInner {
    network: NetworkMonitor,
    queue: PendingOperationsQueue,
    retry: RetryExecutor,
    stores: RwLock<HashMap<String, StoreConfig>>,
    statuses: RwLock<StatusBoard>,
    stats: RwLock<SyncStats>,
    session: RwLock<Option<Session>>,
    realtime: Mutex<HashMap<String, RealtimeSubscription>>,
    network_subscription: Mutex<Option<Subscription>>,
    sync_mode: SyncMode,
    scheduler: Mutex<Option<SyncScheduler>>,
    initialized: OnceCell<()>,
}

/// Drives sync for every registered store.
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct SyncOrchestrator {
    inner: Arc<OrchestratorInner>,
}

impl SyncOrchestrator {
    /// Build an orchestrator around an existing monitor and queue.
    ///
    /// Syncs run only when triggered; see [`with_storage`] for periodic
    /// scheduling.
    ///
    /// [`with_storage`]: SyncOrchestrator::with_storage
    pub fn new(network: NetworkMonitor, queue: PendingOperationsQueue, retry: RetryConfig) -> Self {
        Self::build(network, queue, retry, SyncMode::Manual)
    }

    /// Build the monitor and queue from a probe and a key-value store.
    ///
    /// A periodic `sync_mode` starts its scheduler on [`initialize`].
    ///
    /// [`initialize`]: SyncOrchestrator::initialize
    pub fn with_storage(
        storage: Arc<dyn KeyValueStore>,
        probe: Arc<dyn ConnectivityProbe>,
        config: SyncConfig,
    ) -> Self {
        let network = NetworkMonitor::new(probe);
        let queue = PendingOperationsQueue::new(storage, network.clone(), config.queue);
        Self::build(network, queue, config.retry, config.sync_mode)
    }

    fn build(
        network: NetworkMonitor,
        queue: PendingOperationsQueue,
        retry: RetryConfig,
        sync_mode: SyncMode,
    ) -> Self {
        Self {
            inner: Arc::new(OrchestratorInner {
                network,
                queue,
                retry: RetryExecutor::new(retry),
                stores: RwLock::new(HashMap::new()),
                statuses: RwLock::new(StatusBoard::new()),
                stats: RwLock::new(SyncStats::default()),
                session: RwLock::new(None),
                realtime: Mutex::new(HashMap::new()),
                network_subscription: Mutex::new(None),
                sync_mode,
                scheduler: Mutex::new(None),
                initialized: OnceCell::new(),
            }),
        }
    }

    /// The shared network monitor.
    pub fn network(&self) -> &NetworkMonitor {
        &self.inner.network
    }

    /// The shared mutation queue.
    pub fn queue(&self) -> &PendingOperationsQueue {
        &self.inner.queue
    }

    /// Configured scheduling mode.
    pub fn sync_mode(&self) -> &SyncMode {
        &self.inner.sync_mode
    }

    /// Whether a periodic scheduler is running.
    pub fn is_scheduled(&self) -> bool {
        lock(&self.inner.scheduler).is_some()
    }

    /// Start monitoring, hydrate the queue, wire replay and start the
    /// periodic scheduler if configured. Idempotent.
    pub async fn initialize(&self) -> Result<()> {
        self.inner
            .initialized
            .get_or_try_init(|| async {
                self.inner.network.start_monitoring().await?;
                self.inner.queue.initialize().await?;
                self.install_replay_handler();
                self.watch_network();
                self.start_scheduler();
                info!("Sync orchestrator initialized");
                Ok::<(), Error>(())
            })
            .await?;
        Ok(())
    }

    fn install_replay_handler(&self) {
        let weak = Arc::downgrade(&self.inner);
        self.inner
            .queue
            .set_replay_handler(Arc::new(move |mutation: PendingMutation| {
                let weak = weak.clone();
                async move {
                    match weak.upgrade() {
                        Some(inner) => SyncOrchestrator { inner }.replay_mutation(mutation).await,
                        None => Err(Error::InvalidInput("Orchestrator has shut down".to_string())),
                    }
                }
                .boxed()
            }));
    }

    fn watch_network(&self) {
        let weak = Arc::downgrade(&self.inner);
        let edge = OnlineEdge::new(self.inner.network.is_online());
        let subscription = self.inner.network.subscribe(move |state| {
            if !edge.rose(state) {
                return;
            }
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let Ok(runtime) = tokio::runtime::Handle::try_current() else {
                return;
            };
            let orchestrator = SyncOrchestrator { inner };
            runtime.spawn(async move { orchestrator.on_network_online().await });
        });
        *lock(&self.inner.network_subscription) = Some(subscription);
    }

    /// The scheduler holds a clone of `self` until [`shutdown`].
    ///
    /// [`shutdown`]: SyncOrchestrator::shutdown
    fn start_scheduler(&self) {
        if self.inner.sync_mode == SyncMode::Manual {
            return;
        }
        let scheduler = SyncScheduler::spawn(self.clone(), self.inner.sync_mode.clone());
        *lock(&self.inner.scheduler) = Some(scheduler);
        info!(mode = ?self.inner.sync_mode, "Periodic sync scheduled");
    }

    /// Send one queued mutation to its store.
    async fn replay_mutation(&self, mutation: PendingMutation) -> Result<()> {
        let store = self
            .inner
            .stores
            .read()
            .await
            .get(&mutation.store_name)
            .map(|config| config.store.clone());

        match store {
            Some(store) => {
                debug!(store = %mutation.store_name, mutation = %mutation.id, "Replaying mutation");
                store.push().await
            }
            None => {
                warn!(
                    store = %mutation.store_name,
                    mutation = %mutation.id,
                    "Discarding mutation for unregistered store"
                );
                Ok(())
            }
        }
    }

    /// Add a store, replacing any store with the same name.
    ///
    /// Replacing a store resets its status unless a sync of it is running,
    /// in which case that sync settles the status.
    pub async fn register_store(&self, config: StoreConfig) -> Result<()> {
        if config.name.trim().is_empty() {
            return Err(Error::InvalidInput("Store name cannot be empty".to_string()));
        }
        let name = config.name.clone();
        self.cancel_realtime(&name);
        self.inner.statuses.write().await.insert(name.clone());
        self.inner.stores.write().await.insert(name.clone(), config);
        info!(store = %name, "Store registered");
        Ok(())
    }

    /// Remove a store and cancel its realtime feed.
    pub async fn unregister_store(&self, name: &str) -> bool {
        let removed = self.inner.stores.write().await.remove(name).is_some();
        self.inner.statuses.write().await.remove(name);
        self.cancel_realtime(name);
        if removed {
            info!(store = %name, "Store unregistered");
        }
        removed
    }

    /// Track a realtime feed so it is cancelled on unregister or sign-out.
    pub async fn register_realtime(&self, name: &str, subscription: RealtimeSubscription) -> Result<()> {
        if !self.inner.stores.read().await.contains_key(name) {
            subscription.cancel();
            return Err(Error::NotFound(format!("store '{}'", name)));
        }
        if let Some(previous) = lock(&self.inner.realtime).insert(name.to_string(), subscription) {
            previous.cancel();
        }
        debug!(store = %name, "Realtime subscription registered");
        Ok(())
    }

    fn cancel_realtime(&self, name: &str) {
        let subscription = lock(&self.inner.realtime).remove(name);
        if let Some(subscription) = subscription {
            subscription.cancel();
            debug!(store = %name, "Realtime subscription cancelled");
        }
    }

    /// Number of tracked realtime feeds.
    pub fn realtime_count(&self) -> usize {
        lock(&self.inner.realtime).len()
    }

    /// The signed-in user, if any.
    pub async fn current_user(&self) -> Option<UserId> {
        self.inner
            .session
            .read()
            .await
            .as_ref()
            .map(|s| s.user_id.clone())
    }

    /// Record the user and sync every sign-in store.
    ///
    /// Returns `None` when offline; the network-online path picks the
    /// work up later.
    pub async fn on_sign_in(&self, session: Session) -> Option<SyncReport> {
        info!(user = %session.user_id, "User signed in");
        *self.inner.session.write().await = Some(session);

        if !self.inner.network.is_online() {
            info!("Offline at sign-in; deferring sync");
            return None;
        }

        let names: Vec<String> = self
            .inner
            .stores
            .read()
            .await
            .values()
            .filter(|c| c.enabled && c.sync_on_sign_in)
            .map(|c| c.name.clone())
            .collect();
        Some(self.run_cycle(names).await)
    }

    /// Forget the user, stop realtime feeds and reset every status.
    ///
    /// The queue is cleared in a background task.
    pub async fn on_sign_out(&self) {
        *self.inner.session.write().await = None;

        let subscriptions: Vec<(String, RealtimeSubscription)> =
            lock(&self.inner.realtime).drain().collect();
        for (name, subscription) in subscriptions {
            subscription.cancel();
            debug!(store = %name, "Realtime subscription cancelled");
        }

        self.inner.statuses.write().await.reset_all();

        let queue = self.inner.queue.clone();
        tokio::spawn(async move {
            if let Err(e) = queue.clear().await {
                warn!("Failed to clear pending mutations: {}", e);
            }
        });
        info!("User signed out");
    }

    /// Replay queued mutations, then sync every store.
    pub async fn on_network_online(&self) {
        if self.inner.session.read().await.is_none() {
            debug!("Network online without a user; nothing to do");
            return;
        }

        info!("Network online; replaying pending mutations");
        let this = self.clone();
        let replay = self
            .inner
            .queue
            .process_all(move |mutation| {
                let this = this.clone();
                async move { this.replay_mutation(mutation).await }
            })
            .await;
        if let Err(e) = replay {
            warn!("Mutation replay failed: {}", e);
        }

        self.sync_all().await;
    }

    /// Sync one store: pull, then push.
    ///
    /// Returns `Skipped` when the store is disabled, needs a user, the
    /// device is offline, or it is already syncing.
    pub async fn sync_store(&self, name: &str) -> Result<SyncOutcome> {
        let config = self
            .inner
            .stores
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("store '{}'", name)))?;

        if !config.enabled {
            debug!(store = %name, "Store disabled; skipping");
            return Ok(SyncOutcome::Skipped(SkipReason::Disabled));
        }
        if config.requires_auth && self.inner.session.read().await.is_none() {
            warn!(store = %name, "Store requires sign-in; skipping");
            return Ok(SyncOutcome::Skipped(SkipReason::AuthRequired));
        }
        if !self.inner.network.is_online() {
            debug!(store = %name, "Offline; skipping");
            return Ok(SyncOutcome::Skipped(SkipReason::Offline));
        }
        if !self.inner.statuses.write().await.begin(name) {
            debug!(store = %name, "Already syncing; skipping");
            return Ok(SyncOutcome::Skipped(SkipReason::AlreadySyncing));
        }

        info!(store = %name, "Syncing store");
        let store = config.store;
        let result = async {
            self.inner.retry.execute("pull", || store.pull()).await?;
            self.inner.retry.execute("push", || store.push()).await
        }
        .await;

        match result {
            Ok(()) => {
                self.inner.statuses.write().await.mark_success(name);
                info!(store = %name, "Store synced");
                Ok(SyncOutcome::Synced)
            }
            Err(e) => {
                error!(store = %name, "Store sync failed: {}", e);
                self.inner.statuses.write().await.mark_failed(name, e.to_string());
                Err(e)
            }
        }
    }

    /// Sync every registered store concurrently.
    ///
    /// Returns `None` without a user or while offline.
    pub async fn sync_all(&self) -> Option<SyncReport> {
        if self.inner.session.read().await.is_none() {
            warn!("No signed-in user; skipping sync");
            return None;
        }
        if !self.inner.network.is_online() {
            warn!("Offline; skipping sync");
            return None;
        }

        let names: Vec<String> = self.inner.stores.read().await.keys().cloned().collect();
        Some(self.run_cycle(names).await)
    }

    async fn run_cycle(&self, names: Vec<String>) -> SyncReport {
        if names.is_empty() {
            debug!("No stores to sync");
            return SyncReport::default();
        }
        let start = Instant::now();
        debug!(stores = names.len(), "Starting sync cycle");

        let tasks = names.iter().map(|name| {
            let this = self.clone();
            let name = name.clone();
            tokio::spawn(async move { this.sync_store(&name).await })
        });
        let results = join_all(tasks).await;

        let mut report = SyncReport::default();
        for (name, result) in names.into_iter().zip(results) {
            match result {
                Ok(Ok(SyncOutcome::Synced)) => report.succeeded.push(name),
                Ok(Ok(SyncOutcome::Skipped(reason))) => report.skipped.push((name, reason)),
                Ok(Err(_)) => report.failed.push(name),
                Err(e) => {
                    error!(store = %name, "Store sync task panicked: {}", e);
                    self.inner.statuses.write().await.mark_failed(&name, e.to_string());
                    report.failed.push(name);
                }
            }
        }
        report.duration = start.elapsed();

        self.inner.stats.write().await.record_cycle(
            report.succeeded.len(),
            report.failed.len(),
            report.duration,
        );
        info!(
            succeeded = report.succeeded.len(),
            failed = report.failed.len(),
            skipped = report.skipped.len(),
            "Sync cycle finished in {:?}",
            report.duration
        );
        report
    }

    /// Manual full sync; a no-op while any store is syncing.
    pub async fn trigger_sync(&self) -> Option<SyncReport> {
        if self.is_syncing().await {
            info!("Sync already in progress; ignoring trigger");
            return None;
        }
        self.sync_all().await
    }

    /// Manual sync of one store.
    pub async fn trigger_store_sync(&self, name: &str) -> Result<SyncOutcome> {
        self.sync_store(name).await
    }

    /// Whether any store is mid-sync.
    pub async fn is_syncing(&self) -> bool {
        self.inner.statuses.read().await.any_syncing()
    }

    /// Aggregate statistics with the current queue length.
    pub async fn stats(&self) -> SyncStats {
        let mut stats = self.inner.stats.read().await.clone();
        match self.inner.queue.count().await {
            Ok(pending) => stats.pending_mutations = pending,
            Err(e) => warn!("Could not read queue length: {}", e),
        }
        stats
    }

    /// Status of every registered store.
    pub async fn sync_statuses(&self) -> HashMap<String, SyncStatus> {
        self.inner.statuses.read().await.snapshot()
    }

    /// Status of one store.
    pub async fn store_sync_status(&self, name: &str) -> Option<SyncStatus> {
        self.inner.statuses.read().await.status(name)
    }

    /// Full tracked state of one store.
    pub async fn store_state(&self, name: &str) -> Option<StoreSyncState> {
        self.inner.statuses.read().await.get(name).cloned()
    }

    /// Stop the scheduler and monitoring, detach replay and cancel
    /// realtime feeds.
    pub fn shutdown(&self) {
        if let Some(scheduler) = lock(&self.inner.scheduler).take() {
            scheduler.stop();
        }
        if let Some(subscription) = lock(&self.inner.network_subscription).take() {
            subscription.unsubscribe();
        }
        self.inner.network.stop_monitoring();
        self.inner.queue.clear_replay_handler();

        let subscriptions: Vec<RealtimeSubscription> =
            lock(&self.inner.realtime).drain().map(|(_, s)| s).collect();
        for subscription in subscriptions {
            subscription.cancel();
        }
        info!("Sync orchestrator shut down");
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
