//! RepSync sync engine
//!
//! Offline-first synchronization of local collections with a remote
//! backend:
//! - Network monitoring with change listeners
//! - Durable queue of unconfirmed mutations, replayed when online
//! - Per-entity conflict resolution (last-write-wins, priority lattice,
//!   append-only)
//! - Orchestration of per-store pull/push cycles with status tracking
//! - Manual and periodic scheduling

pub mod conflict;
pub mod entities;
pub mod network;
pub mod orchestrator;
pub mod queue;
pub mod remote;
pub mod retry;
pub mod scheduler;
pub mod status;
pub mod store;

// Re-export main types
pub use conflict::{
    merge_collections, resolve_append_only, resolve_by_priority, resolve_by_timestamp,
    ConflictPolicy, Keyed, MergeOutcome, Mergeable, Prioritized, Resolution, Versioned,
};
pub use entities::{
    resolve_friend_conflict, resolve_post_conflict, resolve_routine_conflict,
    resolve_workout_conflict, Comment, ExerciseSet, FriendEdge, FriendStatus, Post, Reaction,
    Routine, Workout,
};
pub use network::{ConnectivityProbe, ManualProbe, NetworkMonitor, NetworkState, Subscription};
pub use orchestrator::{
    Session, SkipReason, StoreConfig, SyncConfig, SyncOrchestrator, SyncOutcome, SyncReport,
};
pub use queue::{PendingMutation, PendingOperationsQueue, QueueConfig, ReplayHandler};
pub use remote::{MemoryRemote, RealtimeEvent, RealtimeSubscription, RemoteRepository};
pub use retry::{RetryConfig, RetryExecutor};
pub use scheduler::{SyncMode, SyncScheduler};
pub use status::{StatusBoard, StoreSyncState, SyncStats, SyncStatus};
pub use store::{CollectionStore, RecordOp, SyncableStore};
