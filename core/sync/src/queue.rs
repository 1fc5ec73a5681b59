//! Durable queue of mutations awaiting server confirmation.

use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, OnceCell};
use tracing::{debug, info, warn};

use repsync_common::{now_millis, Error, Result};
use repsync_storage::KeyValueStore;

use crate::network::NetworkMonitor;

/// Storage key the queue is persisted under by default.
pub const DEFAULT_STORAGE_KEY: &str = "pending_operations_queue";

/// Replay attempts before a mutation is dropped.
pub const DEFAULT_MAX_RETRIES: u32 = 5;

/// Age after which a queued mutation is discarded unreplayed.
pub const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Bounds every queued payload type must satisfy.
pub trait Payload: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {}

impl<T> Payload for T where T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {}

/// A locally applied mutation the remote has not confirmed yet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingMutation<T = serde_json::Value> {
    /// Unique ID, derived from store name, enqueue time and a random suffix.
    pub id: String,
    /// Owning store.
    pub store_name: String,
    /// Store-defined mutation description.
    pub payload: T,
    /// Enqueue time in milliseconds since the Unix epoch.
    pub timestamp: i64,
    /// Failed replay attempts so far.
    pub retry_count: u32,
}

/// Queue configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Key the queue is persisted under.
    pub storage_key: String,
    /// Failed replays after which a mutation is dropped.
    pub max_retries: u32,
    /// Entries older than this are evicted at load time.
    pub stale_after: Duration,
}

impl QueueConfig {
    /// Set the storage key.
    pub fn with_storage_key(mut self, key: impl Into<String>) -> Self {
        self.storage_key = key.into();
        self
    }

    /// Set the retry ceiling.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set the staleness window.
    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            storage_key: DEFAULT_STORAGE_KEY.to_string(),
            max_retries: DEFAULT_MAX_RETRIES,
            stale_after: DEFAULT_STALE_AFTER,
        }
    }
}

/// Handler used for background replays started by [`PendingOperationsQueue::enqueue`].
pub type ReplayHandler<T> =
    Arc<dyn Fn(PendingMutation<T>) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// How a replay pass ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReplayOutcome {
    /// Queue is empty.
    Drained,
    /// A mutation failed; others remain.
    Stalled,
    /// Another replay holds the guard.
    Busy,
    /// Device is offline.
    Offline,
}

/// Clears the processing flag on every exit path.
struct ProcessingGuard<'a>(&'a AtomicBool);

impl<'a> ProcessingGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for ProcessingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

struct QueueInner<T> {
    config: QueueConfig,
    storage: Arc<dyn KeyValueStore>,
    network: NetworkMonitor,
    entries: Mutex<Vec<PendingMutation<T>>>,
    hydrated: OnceCell<()>,
    processing: AtomicBool,
    replay_handler: RwLock<Option<ReplayHandler<T>>>,
    dropped_watchers: StdMutex<Vec<mpsc::UnboundedSender<PendingMutation<T>>>>,
}

/// Durable, ordered queue of unconfirmed mutations.
///
/// Entries are replayed oldest-first. A failed entry moves to the tail so
/// one bad mutation cannot block the rest, and is dropped once it has
/// failed `max_retries` times. Cloning is cheap; clones share the queue.
pub struct PendingOperationsQueue<T = serde_json::Value> {
    inner: Arc<QueueInner<T>>,
}

impl<T> Clone for PendingOperationsQueue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Payload> PendingOperationsQueue<T> {
    /// Create a queue persisted in `storage`.
    ///
    /// Nothing is loaded until the first operation (or [`initialize`]).
    ///
    /// [`initialize`]: PendingOperationsQueue::initialize
    pub fn new(
        storage: Arc<dyn KeyValueStore>,
        network: NetworkMonitor,
        config: QueueConfig,
    ) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                config,
                storage,
                network,
                entries: Mutex::new(Vec::new()),
                hydrated: OnceCell::new(),
                processing: AtomicBool::new(false),
                replay_handler: RwLock::new(None),
                dropped_watchers: StdMutex::new(Vec::new()),
            }),
        }
    }

    /// Queue configuration.
    pub fn config(&self) -> &QueueConfig {
        &self.inner.config
    }

    /// Load the persisted queue, evicting stale entries.
    ///
    /// Runs once per queue instance; later calls return immediately.
    pub async fn initialize(&self) -> Result<()> {
        self.inner
            .hydrated
            .get_or_try_init(|| self.hydrate())
            .await
            .map(|_| ())
    }

    async fn hydrate(&self) -> Result<()> {
        let key = &self.inner.config.storage_key;
        let loaded: Vec<PendingMutation<T>> = match self.inner.storage.get(key).await? {
            Some(json) => serde_json::from_str(&json).unwrap_or_else(|e| {
                warn!("Discarding unreadable pending queue: {}", e);
                Vec::new()
            }),
            None => Vec::new(),
        };

        let cutoff = now_millis() - self.inner.config.stale_after.as_millis() as i64;
        let total = loaded.len();
        let fresh: Vec<PendingMutation<T>> = loaded
            .into_iter()
            .filter(|m| m.timestamp >= cutoff)
            .collect();

        let mut entries = self.inner.entries.lock().await;
        *entries = fresh;

        let evicted = total - entries.len();
        if evicted > 0 {
            info!("Evicted {} stale pending mutations", evicted);
            self.persist(&entries).await?;
        }

        debug!("Pending queue hydrated with {} entries", entries.len());
        Ok(())
    }

    /// Append a mutation for `store_name`.
    ///
    /// The entry is persisted before this returns. When online and no
    /// replay is running, a background replay is started with the
    /// installed handler; its failures are only logged.
    pub async fn enqueue(&self, store_name: &str, payload: T) -> Result<String> {
        if store_name.is_empty() {
            return Err(Error::InvalidInput("Store name cannot be empty".to_string()));
        }
        self.initialize().await?;

        let timestamp = now_millis();
        let mutation = PendingMutation {
            id: mutation_id(store_name, timestamp),
            store_name: store_name.to_string(),
            payload,
            timestamp,
            retry_count: 0,
        };
        let id = mutation.id.clone();

        {
            let mut entries = self.inner.entries.lock().await;
            entries.push(mutation);
            if let Err(e) = self.persist(&entries).await {
                entries.pop();
                return Err(e);
            }
        }

        debug!(store = store_name, mutation = %id, "Mutation enqueued");
        self.spawn_background_replay();
        Ok(id)
    }

    fn spawn_background_replay(&self) {
        if !self.inner.network.is_online() || self.is_processing() {
            return;
        }
        let handler = self
            .inner
            .replay_handler
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let Some(handler) = handler else {
            return;
        };

        let queue = self.clone();
        tokio::spawn(async move {
            if let Err(e) = queue.process_next(|m| handler(m)).await {
                warn!("Background replay failed: {}", e);
            }
        });
    }

    /// Install the handler used for background replays.
    pub fn set_replay_handler(&self, handler: ReplayHandler<T>) {
        *self
            .inner
            .replay_handler
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(handler);
    }

    /// Remove the background replay handler.
    pub fn clear_replay_handler(&self) {
        *self
            .inner
            .replay_handler
            .write()
            .unwrap_or_else(PoisonError::into_inner) = None;
    }

    /// Receive mutations dropped after reaching the retry ceiling.
    ///
    /// Each receiver gets every drop from now on, however far behind it
    /// falls. Dropping the receiver unsubscribes.
    pub fn subscribe_dropped(&self) -> mpsc::UnboundedReceiver<PendingMutation<T>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner
            .dropped_watchers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        rx
    }

    /// Whether a replay is in flight.
    pub fn is_processing(&self) -> bool {
        self.inner.processing.load(Ordering::SeqCst)
    }

    /// Replay from the head of the queue.
    ///
    /// Returns `true` when the queue is empty afterwards. Returns `false`
    /// without calling `handler` when offline or when another replay is in
    /// flight. Successful entries are removed and draining continues; the
    /// first failure ends the call.
    pub async fn process_next<F, Fut>(&self, handler: F) -> Result<bool>
    where
        F: Fn(PendingMutation<T>) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let outcome = self.replay(&handler).await?;
        Ok(outcome == ReplayOutcome::Drained)
    }

    async fn replay<F, Fut>(&self, handler: &F) -> Result<ReplayOutcome>
    where
        F: Fn(PendingMutation<T>) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        if !self.inner.network.is_online() {
            debug!("Offline; skipping replay");
            return Ok(ReplayOutcome::Offline);
        }
        let Some(_guard) = ProcessingGuard::acquire(&self.inner.processing) else {
            debug!("Replay already in progress");
            return Ok(ReplayOutcome::Busy);
        };

        self.initialize().await?;

        loop {
            if !self.inner.network.is_online() {
                return Ok(ReplayOutcome::Offline);
            }

            let head = self.inner.entries.lock().await.first().cloned();
            let Some(head) = head else {
                return Ok(ReplayOutcome::Drained);
            };

            match handler(head.clone()).await {
                Ok(()) => {
                    let mut entries = self.inner.entries.lock().await;
                    if let Some(pos) = entries.iter().position(|m| m.id == head.id) {
                        entries.remove(pos);
                        self.persist(&entries).await?;
                    }
                    debug!(store = %head.store_name, mutation = %head.id, "Mutation replayed");
                }
                Err(err) => {
                    let empty = self.record_failure(&head, &err).await?;
                    return Ok(if empty {
                        ReplayOutcome::Drained
                    } else {
                        ReplayOutcome::Stalled
                    });
                }
            }
        }
    }

    /// Bump the retry count of a failed entry and requeue or drop it.
    ///
    /// Returns whether the queue is empty afterwards.
    async fn record_failure(&self, failed: &PendingMutation<T>, err: &Error) -> Result<bool> {
        let mut entries = self.inner.entries.lock().await;
        let Some(pos) = entries.iter().position(|m| m.id == failed.id) else {
            // Cleared while the handler ran
            return Ok(entries.is_empty());
        };

        let mut entry = entries.remove(pos);
        entry.retry_count += 1;

        if entry.retry_count < self.inner.config.max_retries {
            warn!(
                store = %entry.store_name,
                mutation = %entry.id,
                retries = entry.retry_count,
                "Replay failed, moving to back of queue: {}",
                err
            );
            entries.push(entry);
            self.persist(&entries).await?;
            return Ok(false);
        }

        warn!(
            store = %entry.store_name,
            mutation = %entry.id,
            retries = entry.retry_count,
            "Dropping mutation after max retries: {}",
            err
        );
        self.persist(&entries).await?;
        let empty = entries.is_empty();
        drop(entries);

        self.inner
            .dropped_watchers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|tx| tx.send(entry.clone()).is_ok());
        Ok(empty)
    }

    /// Drain the queue while online.
    ///
    /// Stops once the head entry has already failed in this or an earlier
    /// pass, so failing entries are not retried back-to-back.
    pub async fn process_all<F, Fut>(&self, handler: F) -> Result<()>
    where
        F: Fn(PendingMutation<T>) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        self.initialize().await?;

        loop {
            if !self.inner.network.is_online() || self.count().await? == 0 {
                break;
            }

            match self.replay(&handler).await? {
                ReplayOutcome::Stalled => {
                    let head_failed = self
                        .inner
                        .entries
                        .lock()
                        .await
                        .first()
                        .is_some_and(|m| m.retry_count > 0);
                    if head_failed {
                        debug!("Head mutation already failed; pausing replay");
                        break;
                    }
                }
                ReplayOutcome::Drained | ReplayOutcome::Busy | ReplayOutcome::Offline => break,
            }
        }

        Ok(())
    }

    /// Give previously failed entries a fresh start.
    ///
    /// Failed entries move to the front with their retry count and
    /// timestamp reset, then the queue is drained.
    pub async fn retry_failed<F, Fut>(&self, handler: F) -> Result<()>
    where
        F: Fn(PendingMutation<T>) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        self.initialize().await?;

        {
            let mut entries = self.inner.entries.lock().await;
            let now = now_millis();
            let (mut failed, fresh): (Vec<_>, Vec<_>) =
                entries.drain(..).partition(|m| m.retry_count > 0);

            for entry in failed.iter_mut() {
                entry.retry_count = 0;
                entry.timestamp = now;
            }

            info!("Retrying {} failed mutations", failed.len());
            failed.extend(fresh);
            *entries = failed;
            self.persist(&entries).await?;
        }

        self.process_all(handler).await
    }

    /// Remove every entry belonging to `store_name`.
    ///
    /// Returns the number of removed entries.
    pub async fn clear_store(&self, store_name: &str) -> Result<usize> {
        self.initialize().await?;

        let mut entries = self.inner.entries.lock().await;
        let before = entries.len();
        entries.retain(|m| m.store_name != store_name);
        let removed = before - entries.len();

        self.persist(&entries).await?;
        debug!(store = store_name, "Cleared {} pending mutations", removed);
        Ok(removed)
    }

    /// Remove every entry.
    pub async fn clear(&self) -> Result<()> {
        self.initialize().await?;

        let mut entries = self.inner.entries.lock().await;
        entries.clear();
        self.persist(&entries).await?;
        info!("Pending queue cleared");
        Ok(())
    }

    /// Number of queued entries.
    pub async fn count(&self) -> Result<usize> {
        self.initialize().await?;
        Ok(self.inner.entries.lock().await.len())
    }

    /// Number of queued entries for `store_name`.
    pub async fn store_count(&self, store_name: &str) -> Result<usize> {
        self.initialize().await?;
        Ok(self
            .inner
            .entries
            .lock()
            .await
            .iter()
            .filter(|m| m.store_name == store_name)
            .count())
    }

    /// Snapshot of the queue in replay order.
    pub async fn all(&self) -> Result<Vec<PendingMutation<T>>> {
        self.initialize().await?;
        Ok(self.inner.entries.lock().await.clone())
    }

    /// Snapshot of the entries for `store_name`, in replay order.
    pub async fn for_store(&self, store_name: &str) -> Result<Vec<PendingMutation<T>>> {
        self.initialize().await?;
        Ok(self
            .inner
            .entries
            .lock()
            .await
            .iter()
            .filter(|m| m.store_name == store_name)
            .cloned()
            .collect())
    }

    /// Persist the queue. Callers hold the entries lock so writes land in order.
    async fn persist(&self, entries: &[PendingMutation<T>]) -> Result<()> {
        let json = serde_json::to_string(entries)?;
        self.inner
            .storage
            .set(&self.inner.config.storage_key, &json)
            .await
    }
}

fn mutation_id(store_name: &str, timestamp: i64) -> String {
    format!("{}-{}-{:08x}", store_name, timestamp, rand::random::<u32>())
}
