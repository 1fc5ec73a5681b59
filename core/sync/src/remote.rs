//! Remote repository contract and an in-memory implementation.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use repsync_common::{now_millis, Error, Result};

use crate::conflict::Keyed;

/// Change pushed by the remote for one record.
#[derive(Debug, Clone, PartialEq)]
pub enum RealtimeEvent<T> {
    Insert(T),
    Update(T),
    Delete { id: String },
}

/// Handle to a live realtime feed. Call [`cancel`](Self::cancel) to stop it.
pub struct RealtimeSubscription {
    cancel: Box<dyn FnOnce() + Send + Sync>,
}

impl RealtimeSubscription {
    pub fn new<F>(cancel: F) -> Self
    where
        F: FnOnce() + Send + Sync + 'static,
    {
        Self {
            cancel: Box::new(cancel),
        }
    }

    /// Subscription that aborts `task` when cancelled.
    pub fn from_task(task: JoinHandle<()>) -> Self {
        Self::new(move || task.abort())
    }

    /// Combine two subscriptions into one.
    pub fn chain(self, other: RealtimeSubscription) -> Self {
        Self::new(move || {
            self.cancel();
            other.cancel();
        })
    }

    pub fn cancel(self) {
        (self.cancel)();
    }
}

impl fmt::Debug for RealtimeSubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RealtimeSubscription").finish_non_exhaustive()
    }
}

/// Server-side table for one entity type.
#[async_trait]
pub trait RemoteRepository<T>: Send + Sync
where
    T: Send + Sync + 'static,
{
    async fn fetch_by_id(&self, id: &str) -> Result<Option<T>>;

    /// Records changed at or after `since` (all records when `None`).
    async fn fetch_since(&self, since: Option<i64>) -> Result<Vec<T>>;

    /// Insert or replace a record, returning the stored version.
    async fn upsert(&self, record: &T) -> Result<T>;

    async fn delete(&self, id: &str) -> Result<()>;

    async fn batch_upsert(&self, records: &[T]) -> Result<Vec<T>>;

    /// Open a realtime feed of changes.
    fn subscribe(&self) -> Result<(mpsc::UnboundedReceiver<RealtimeEvent<T>>, RealtimeSubscription)>;
}

struct Row<T> {
    record: T,
    changed_at: i64,
}

type Subscribers<T> = Mutex<HashMap<u64, mpsc::UnboundedSender<RealtimeEvent<T>>>>;

/// In-memory remote table.
///
/// Can be switched into a failing mode where every call returns
/// [`Error::Network`]. Used by tests and the CLI demo.
pub struct MemoryRemote<T> {
    rows: Mutex<BTreeMap<String, Row<T>>>,
    subscribers: Arc<Subscribers<T>>,
    next_subscriber: AtomicU64,
    failing: AtomicBool,
    upserts: AtomicUsize,
    fetches: AtomicUsize,
}

impl<T> MemoryRemote<T>
where
    T: Keyed + Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            rows: Mutex::new(BTreeMap::new()),
            subscribers: Arc::new(Mutex::new(HashMap::new())),
            next_subscriber: AtomicU64::new(1),
            failing: AtomicBool::new(false),
            upserts: AtomicUsize::new(0),
            fetches: AtomicUsize::new(0),
        }
    }

    /// Make every subsequent call fail (or succeed again).
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Write a record server-side, as another client would.
    pub fn seed(&self, record: T) {
        let existed = self.put(record.clone());
        self.emit(if existed {
            RealtimeEvent::Update(record)
        } else {
            RealtimeEvent::Insert(record)
        });
    }

    pub fn get(&self, id: &str) -> Option<T> {
        lock(&self.rows).get(id).map(|row| row.record.clone())
    }

    pub fn records(&self) -> Vec<T> {
        lock(&self.rows).values().map(|row| row.record.clone()).collect()
    }

    pub fn len(&self) -> usize {
        lock(&self.rows).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.rows).is_empty()
    }

    /// Number of records written through `upsert`/`batch_upsert`.
    pub fn upsert_count(&self) -> usize {
        self.upserts.load(Ordering::SeqCst)
    }

    /// Number of `fetch_since` calls served.
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.subscribers).len()
    }

    fn check(&self) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::Network("Remote unavailable".to_string()));
        }
        Ok(())
    }

    fn put(&self, record: T) -> bool {
        let row = Row {
            changed_at: now_millis(),
            record,
        };
        lock(&self.rows)
            .insert(row.record.key().to_string(), row)
            .is_some()
    }

    fn emit(&self, event: RealtimeEvent<T>) {
        lock(&self.subscribers).retain(|_, tx| tx.send(event.clone()).is_ok());
    }
}

impl<T> Default for MemoryRemote<T>
where
    T: Keyed + Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<T> RemoteRepository<T> for MemoryRemote<T>
where
    T: Keyed + Clone + Send + Sync + 'static,
{
    async fn fetch_by_id(&self, id: &str) -> Result<Option<T>> {
        self.check()?;
        Ok(self.get(id))
    }

    async fn fetch_since(&self, since: Option<i64>) -> Result<Vec<T>> {
        self.check()?;
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let rows = lock(&self.rows);
        Ok(rows
            .values()
            .filter(|row| since.map_or(true, |s| row.changed_at >= s))
            .map(|row| row.record.clone())
            .collect())
    }

    async fn upsert(&self, record: &T) -> Result<T> {
        self.check()?;
        self.upserts.fetch_add(1, Ordering::SeqCst);
        self.seed(record.clone());
        Ok(record.clone())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.check()?;
        if lock(&self.rows).remove(id).is_some() {
            self.emit(RealtimeEvent::Delete { id: id.to_string() });
        }
        Ok(())
    }

    async fn batch_upsert(&self, records: &[T]) -> Result<Vec<T>> {
        self.check()?;
        self.upserts.fetch_add(records.len(), Ordering::SeqCst);
        for record in records {
            self.seed(record.clone());
        }
        Ok(records.to_vec())
    }

    fn subscribe(
        &self,
    ) -> Result<(mpsc::UnboundedReceiver<RealtimeEvent<T>>, RealtimeSubscription)> {
        self.check()?;
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_subscriber.fetch_add(1, Ordering::SeqCst);
        lock(&self.subscribers).insert(id, tx);

        let subscribers: Weak<Subscribers<T>> = Arc::downgrade(&self.subscribers);
        let subscription = RealtimeSubscription::new(move || {
            if let Some(subscribers) = subscribers.upgrade() {
                lock(&subscribers).remove(&id);
            }
        });
        Ok((rx, subscription))
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::{FriendEdge, FriendStatus};

    fn edge(friend: &str, status: FriendStatus) -> FriendEdge {
        FriendEdge::new("alice", friend, status, now_millis())
    }

    #[tokio::test]
    async fn test_upsert_and_fetch() {
        let remote = MemoryRemote::new();
        remote.upsert(&edge("bob", FriendStatus::Requested)).await.unwrap();
        remote
            .batch_upsert(&[edge("carol", FriendStatus::Friends), edge("dave", FriendStatus::None)])
            .await
            .unwrap();

        assert_eq!(remote.len(), 3);
        assert_eq!(remote.upsert_count(), 3);
        assert!(remote.fetch_by_id("alice:bob").await.unwrap().is_some());
        assert_eq!(remote.fetch_since(None).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_fetch_since_filters() {
        let remote = MemoryRemote::new();
        remote.seed(edge("bob", FriendStatus::Requested));
        let future = now_millis() + 60_000;
        assert!(remote.fetch_since(Some(future)).await.unwrap().is_empty());
        assert_eq!(remote.fetch_since(Some(0)).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_failing_mode() {
        let remote: MemoryRemote<FriendEdge> = MemoryRemote::new();
        remote.set_failing(true);
        let err = remote.fetch_since(None).await.unwrap_err();
        assert!(err.is_transient());

        remote.set_failing(false);
        assert!(remote.fetch_since(None).await.is_ok());
    }

    #[tokio::test]
    async fn test_subscribe_and_cancel() {
        let remote = MemoryRemote::new();
        let (mut rx, sub) = remote.subscribe().unwrap();
        assert_eq!(remote.subscriber_count(), 1);

        remote.seed(edge("bob", FriendStatus::Requested));
        remote.seed(edge("bob", FriendStatus::Friends));
        remote.delete("alice:bob").await.unwrap();

        assert!(matches!(rx.recv().await, Some(RealtimeEvent::Insert(_))));
        assert!(matches!(rx.recv().await, Some(RealtimeEvent::Update(_))));
        assert_eq!(
            rx.recv().await,
            Some(RealtimeEvent::Delete {
                id: "alice:bob".to_string()
            })
        );

        sub.cancel();
        assert_eq!(remote.subscriber_count(), 0);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_from_task_aborts() {
        let task = tokio::spawn(async {
            tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
        });
        let abort = task.abort_handle();
        RealtimeSubscription::from_task(task).cancel();
        tokio::task::yield_now().await;
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert!(abort.is_finished());
    }
}
