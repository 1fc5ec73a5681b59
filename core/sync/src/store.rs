//! Syncable stores.
//!
//! A store owns the local copy of one collection and knows how to pull
//! remote changes into it and push local changes out. [`CollectionStore`]
//! is the generic implementation used for every entity type: writes are
//! applied locally first, recorded in the pending operations queue, and
//! reconciled with the remote on the next push.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tracing::{debug, info, warn};

use repsync_common::{now_millis, Error, Result};

use crate::conflict::Mergeable;
use crate::queue::PendingOperationsQueue;
use crate::remote::{RealtimeEvent, RealtimeSubscription, RemoteRepository};

/// A collection the orchestrator can sync.
#[async_trait]
pub trait SyncableStore: Send + Sync {
    /// Bring remote changes into the local copy.
    async fn pull(&self) -> Result<()>;

    /// Send local changes to the remote.
    async fn push(&self) -> Result<()>;
}

/// Queue payload describing a local write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum RecordOp {
    Upsert { id: String },
    Delete { id: String },
}

struct CollectionState<T> {
    records: BTreeMap<String, T>,
    dirty: HashSet<String>,
    pending_deletes: HashSet<String>,
    cursor: Option<i64>,
}

struct CollectionInner<T> {
    name: String,
    remote: Arc<dyn RemoteRepository<T>>,
    queue: PendingOperationsQueue,
    state: Mutex<CollectionState<T>>,
}

/// Local copy of a remote collection with optimistic writes.
pub struct CollectionStore<T> {
    inner: Arc<CollectionInner<T>>,
}

impl<T> Clone for CollectionStore<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> CollectionStore<T>
where
    T: Mergeable + Send + Sync + 'static,
{
    /// Empty collection syncing against `remote` and queueing on `queue`.
    pub fn new(
        name: impl Into<String>,
        remote: Arc<dyn RemoteRepository<T>>,
        queue: PendingOperationsQueue,
    ) -> Self {
        Self {
            inner: Arc::new(CollectionInner {
                name: name.into(),
                remote,
                queue,
                state: Mutex::new(CollectionState {
                    records: BTreeMap::new(),
                    dirty: HashSet::new(),
                    pending_deletes: HashSet::new(),
                    cursor: None,
                }),
            }),
        }
    }

    /// Queue and registry name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Apply a write locally and queue it for the remote.
    pub async fn save(&self, record: T) -> Result<String> {
        let id = record.key().to_string();
        {
            let mut state = self.state();
            state.pending_deletes.remove(&id);
            state.dirty.insert(id.clone());
            state.records.insert(id.clone(), record);
        }
        self.enqueue(RecordOp::Upsert { id }).await
    }

    /// Delete a record locally and queue the deletion.
    pub async fn remove(&self, id: &str) -> Result<String> {
        {
            let mut state = self.state();
            if state.records.remove(id).is_none() {
                return Err(Error::NotFound(format!("{}/{}", self.inner.name, id)));
            }
            state.dirty.remove(id);
            state.pending_deletes.insert(id.to_string());
        }
        self.enqueue(RecordOp::Delete { id: id.to_string() }).await
    }

    async fn enqueue(&self, op: RecordOp) -> Result<String> {
        let payload = serde_json::to_value(&op)?;
        self.inner.queue.enqueue(&self.inner.name, payload).await
    }

    /// Local copy of one record.
    pub fn get(&self, id: &str) -> Option<T> {
        self.state().records.get(id).cloned()
    }

    /// All local records ordered by key.
    pub fn records(&self) -> Vec<T> {
        self.state().records.values().cloned().collect()
    }

    /// Number of local records.
    pub fn len(&self) -> usize {
        self.state().records.len()
    }

    /// Whether no record is held locally.
    pub fn is_empty(&self) -> bool {
        self.state().records.is_empty()
    }

    /// Whether a local write for `id` has not been confirmed by the remote.
    pub fn is_dirty(&self, id: &str) -> bool {
        let state = self.state();
        state.dirty.contains(id) || state.pending_deletes.contains(id)
    }

    /// Local writes and deletes not yet confirmed.
    pub fn dirty_count(&self) -> usize {
        let state = self.state();
        state.dirty.len() + state.pending_deletes.len()
    }

    /// Merge one remote record into the local copy.
    ///
    /// Returns true when the local side had unconfirmed changes that
    /// conflicted with it.
    fn absorb(state: &mut CollectionState<T>, remote: T) -> bool {
        let id = remote.key().to_string();
        if state.pending_deletes.contains(&id) {
            return false;
        }
        if !state.dirty.contains(&id) {
            state.records.insert(id, remote);
            return false;
        }

        let Some(local) = state.records.get(&id) else {
            state.records.insert(id, remote);
            return false;
        };
        let resolution = T::merge(local, &remote);
        if resolution.merged == remote {
            state.dirty.remove(&id);
        }
        state.records.insert(id, resolution.merged);
        resolution.has_conflict
    }

    /// Apply a realtime event from the remote.
    pub fn apply_realtime(&self, event: RealtimeEvent<T>) {
        let mut state = self.state();
        match event {
            RealtimeEvent::Insert(record) | RealtimeEvent::Update(record) => {
                Self::absorb(&mut state, record);
            }
            RealtimeEvent::Delete { id } => {
                state.pending_deletes.remove(&id);
                if state.dirty.contains(&id) {
                    debug!(store = %self.inner.name, record = %id, "Keeping locally modified record deleted remotely");
                } else {
                    state.records.remove(&id);
                }
            }
        }
    }

    /// Open the remote's realtime feed and apply its events.
    ///
    /// The returned subscription stops both the feed and the task.
    pub fn start_realtime(&self) -> Result<RealtimeSubscription> {
        let (mut rx, remote_sub) = self.inner.remote.subscribe()?;
        let weak: Weak<CollectionInner<T>> = Arc::downgrade(&self.inner);

        let task = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                CollectionStore { inner }.apply_realtime(event);
            }
        });

        info!(store = %self.inner.name, "Realtime feed started");
        Ok(remote_sub.chain(RealtimeSubscription::from_task(task)))
    }

    fn state(&self) -> MutexGuard<'_, CollectionState<T>> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl<T> SyncableStore for CollectionStore<T>
where
    T: Mergeable + Send + Sync + 'static,
{
    async fn pull(&self) -> Result<()> {
        let since = self.state().cursor;
        let started = now_millis();
        let changes = self.inner.remote.fetch_since(since).await?;

        let fetched = changes.len();
        let mut conflicts = 0;
        {
            let mut state = self.state();
            for record in changes {
                if Self::absorb(&mut state, record) {
                    conflicts += 1;
                }
            }
            state.cursor = Some(started);
        }

        debug!(
            store = %self.inner.name,
            fetched,
            conflicts,
            "Pull complete"
        );
        Ok(())
    }

    async fn push(&self) -> Result<()> {
        let (upserts, deletes): (Vec<T>, Vec<String>) = {
            let state = self.state();
            let upserts = state
                .dirty
                .iter()
                .filter_map(|id| state.records.get(id).cloned())
                .collect();
            (upserts, state.pending_deletes.iter().cloned().collect())
        };

        if upserts.is_empty() && deletes.is_empty() {
            return Ok(());
        }

        if !upserts.is_empty() {
            let stored = self.inner.remote.batch_upsert(&upserts).await?;
            let mut state = self.state();
            for (sent, confirmed) in upserts.iter().zip(stored) {
                let id = sent.key();
                // A newer local write may have landed during the call.
                if state.records.get(id) == Some(sent) {
                    state.dirty.remove(id);
                    state.records.insert(id.to_string(), confirmed);
                }
            }
        }

        for id in &deletes {
            if let Err(e) = self.inner.remote.delete(id).await {
                warn!(store = %self.inner.name, record = %id, "Remote delete failed: {}", e);
                return Err(e);
            }
            self.state().pending_deletes.remove(id);
        }

        debug!(
            store = %self.inner.name,
            upserts = upserts.len(),
            deletes = deletes.len(),
            "Push complete"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::{FriendEdge, FriendStatus, Routine};
    use crate::network::{ManualProbe, NetworkMonitor, NetworkState};
    use crate::queue::QueueConfig;
    use crate::remote::MemoryRemote;
    use repsync_storage::MemoryStore;

    fn routine(id: &str, name: &str, t: i64) -> Routine {
        Routine {
            id: id.to_string(),
            user_id: "alice".to_string(),
            name: name.to_string(),
            exercise_ids: vec![],
            updated_at_ms: t,
            deleted: false,
        }
    }

    fn offline_queue() -> PendingOperationsQueue {
        let monitor = NetworkMonitor::new(Arc::new(ManualProbe::new(NetworkState::offline())));
        PendingOperationsQueue::new(Arc::new(MemoryStore::new()), monitor, QueueConfig::default())
    }

    fn setup<T>() -> (Arc<MemoryRemote<T>>, CollectionStore<T>, PendingOperationsQueue)
    where
        T: Mergeable + Send + Sync + 'static,
    {
        let remote = Arc::new(MemoryRemote::new());
        let queue = offline_queue();
        let store = CollectionStore::new("items", remote.clone(), queue.clone());
        (remote, store, queue)
    }

    #[tokio::test]
    async fn test_save_is_optimistic_and_queued() {
        let (remote, store, queue) = setup::<Routine>();

        store.save(routine("r1", "Push", 100)).await.unwrap();

        assert_eq!(store.get("r1").map(|r| r.name), Some("Push".to_string()));
        assert!(store.is_dirty("r1"));
        assert!(remote.is_empty());

        let pending = queue.all().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].store_name, "items");
        let op: RecordOp = serde_json::from_value(pending[0].payload.clone()).unwrap();
        assert_eq!(op, RecordOp::Upsert { id: "r1".into() });
    }

    #[tokio::test]
    async fn test_push_confirms_writes() {
        let (remote, store, _queue) = setup::<Routine>();
        store.save(routine("r1", "Push", 100)).await.unwrap();
        store.save(routine("r2", "Pull", 100)).await.unwrap();

        store.push().await.unwrap();

        assert_eq!(remote.len(), 2);
        assert_eq!(store.dirty_count(), 0);
    }

    #[tokio::test]
    async fn test_failed_push_keeps_dirty() {
        let (remote, store, _queue) = setup::<Routine>();
        store.save(routine("r1", "Push", 100)).await.unwrap();

        remote.set_failing(true);
        assert!(store.push().await.is_err());
        assert!(store.is_dirty("r1"));

        remote.set_failing(false);
        store.push().await.unwrap();
        assert!(!store.is_dirty("r1"));
    }

    #[tokio::test]
    async fn test_pull_takes_remote_for_clean_records() {
        let (remote, store, _queue) = setup::<Routine>();
        remote.seed(routine("r1", "Server", 50));

        store.pull().await.unwrap();
        assert_eq!(store.get("r1").map(|r| r.name), Some("Server".to_string()));
        assert!(!store.is_dirty("r1"));
    }

    #[tokio::test]
    async fn test_pull_merges_dirty_records() {
        let (remote, store, _queue) = setup::<Routine>();
        store.save(routine("r1", "Local newer", 300)).await.unwrap();
        store.save(routine("r2", "Local older", 100)).await.unwrap();
        remote.seed(routine("r1", "Server", 200));
        remote.seed(routine("r2", "Server newer", 200));

        store.pull().await.unwrap();

        assert_eq!(store.get("r1").map(|r| r.name), Some("Local newer".to_string()));
        assert!(store.is_dirty("r1"));
        assert_eq!(store.get("r2").map(|r| r.name), Some("Server newer".to_string()));
        assert!(!store.is_dirty("r2"));
    }

    #[tokio::test]
    async fn test_pull_applies_priority_lattice() {
        let (remote, store, _queue) = setup::<FriendEdge>();
        store
            .save(FriendEdge::new("alice", "bob", FriendStatus::Blocked, 100))
            .await
            .unwrap();
        remote.seed(FriendEdge::new("alice", "bob", FriendStatus::Friends, 200));

        store.pull().await.unwrap();

        let merged = store.get("alice:bob").unwrap();
        assert_eq!(merged.status, FriendStatus::Blocked);
        assert_eq!(merged.updated_at_ms, 200);
        assert!(store.is_dirty("alice:bob"));
    }

    #[tokio::test]
    async fn test_remove_pushes_delete() {
        let (remote, store, queue) = setup::<Routine>();
        remote.seed(routine("r1", "Server", 50));
        store.pull().await.unwrap();

        store.remove("r1").await.unwrap();
        assert!(store.get("r1").is_none());
        assert_eq!(queue.count().await.unwrap(), 1);

        // A pull before the push must not resurrect it.
        store.pull().await.unwrap();
        assert!(store.get("r1").is_none());

        store.push().await.unwrap();
        assert!(remote.is_empty());
        assert_eq!(store.dirty_count(), 0);
    }

    #[tokio::test]
    async fn test_remove_unknown_record() {
        let (_remote, store, _queue) = setup::<Routine>();
        assert!(matches!(store.remove("nope").await, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_realtime_feed_updates_local_copy() {
        let (remote, store, _queue) = setup::<Routine>();
        let sub = store.start_realtime().unwrap();

        remote.seed(routine("r1", "Live", 10));
        for _ in 0..50 {
            if store.get("r1").is_some() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert_eq!(store.get("r1").map(|r| r.name), Some("Live".to_string()));

        sub.cancel();
        assert_eq!(remote.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_realtime_delete_spares_dirty_records() {
        let (_remote, store, _queue) = setup::<Routine>();
        store.save(routine("r1", "Mine", 10)).await.unwrap();

        store.apply_realtime(RealtimeEvent::Delete { id: "r1".into() });
        assert!(store.get("r1").is_some());

        store.apply_realtime(RealtimeEvent::Insert(routine("r2", "Theirs", 10)));
        store.apply_realtime(RealtimeEvent::Delete { id: "r2".into() });
        assert!(store.get("r2").is_none());
    }
}
