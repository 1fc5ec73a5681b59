//! Per-store sync status and aggregate statistics.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Sync status of a single store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum SyncStatus {
    /// Registered, never synced since the last reset.
    #[default]
    Idle,
    /// A pull/push cycle is running.
    Syncing,
    /// The last cycle completed.
    Success,
    /// The last cycle failed.
    Error,
}

/// Tracked state of one store.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreSyncState {
    /// Current status.
    pub status: SyncStatus,
    /// Message of the last failure, cleared on success.
    pub last_error: Option<String>,
    /// Last successful sync time.
    pub last_synced: Option<DateTime<Utc>>,
    /// Consecutive failures since the last success.
    pub failure_count: u32,
}

impl StoreSyncState {
    /// Enter `Syncing`.
    pub fn mark_syncing(&mut self) {
        self.status = SyncStatus::Syncing;
    }

    /// Record a completed cycle and clear the failure streak.
    pub fn mark_success(&mut self) {
        self.status = SyncStatus::Success;
        self.last_synced = Some(Utc::now());
        self.last_error = None;
        self.failure_count = 0;
    }

    /// Record a failed cycle.
    pub fn mark_failed(&mut self, error: impl Into<String>) {
        self.status = SyncStatus::Error;
        self.failure_count += 1;
        self.last_error = Some(error.into());
    }

    /// Back to a fresh `Idle` state.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Status of every registered store.
///
/// Transitions are only applied to stores already on the board, so a
/// cycle finishing after its store was unregistered leaves no trace.
#[derive(Debug, Clone, Default)]
pub struct StatusBoard {
    stores: HashMap<String, StoreSyncState>,
}

impl StatusBoard {
    /// Empty board.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a store in `Idle`, or reset it if already present.
    ///
    /// A store that is mid-sync stays `Syncing`; the running cycle settles
    /// it.
    pub fn insert(&mut self, name: impl Into<String>) {
        let state = self.stores.entry(name.into()).or_default();
        if state.status != SyncStatus::Syncing {
            state.reset();
        }
    }

    /// Drop a store, returning its last state.
    pub fn remove(&mut self, name: &str) -> Option<StoreSyncState> {
        self.stores.remove(name)
    }

    /// Full state of one store.
    pub fn get(&self, name: &str) -> Option<&StoreSyncState> {
        self.stores.get(name)
    }

    /// Status of one store.
    pub fn status(&self, name: &str) -> Option<SyncStatus> {
        self.stores.get(name).map(|s| s.status)
    }

    /// Move a store to `Syncing`.
    ///
    /// Returns false when the store is unknown or already syncing.
    pub fn begin(&mut self, name: &str) -> bool {
        match self.stores.get_mut(name) {
            Some(state) if state.status != SyncStatus::Syncing => {
                state.mark_syncing();
                true
            }
            _ => false,
        }
    }

    /// Mark a known store `Success`.
    pub fn mark_success(&mut self, name: &str) {
        if let Some(state) = self.stores.get_mut(name) {
            state.mark_success();
        }
    }

    /// Mark a known store `Error` with `error`.
    pub fn mark_failed(&mut self, name: &str, error: impl Into<String>) {
        if let Some(state) = self.stores.get_mut(name) {
            state.mark_failed(error);
        }
    }

    /// Put every store back to `Idle`.
    pub fn reset_all(&mut self) {
        for state in self.stores.values_mut() {
            state.reset();
        }
    }

    /// Whether any store is mid-sync.
    pub fn any_syncing(&self) -> bool {
        self.stores
            .values()
            .any(|s| s.status == SyncStatus::Syncing)
    }

    /// Copy of the name → status map.
    pub fn snapshot(&self) -> HashMap<String, SyncStatus> {
        self.stores
            .iter()
            .map(|(name, state)| (name.clone(), state.status))
            .collect()
    }

    /// Number of stores on the board.
    pub fn len(&self) -> usize {
        self.stores.len()
    }

    /// Whether no store is registered.
    pub fn is_empty(&self) -> bool {
        self.stores.is_empty()
    }
}

/// Aggregate statistics across sync cycles.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStats {
    /// End of the most recent cycle.
    pub last_sync_at: Option<DateTime<Utc>>,
    /// Wall time of the most recent cycle.
    pub last_sync_duration_ms: u64,
    /// Full cycles run.
    pub total_syncs: u64,
    /// Store syncs that succeeded, summed over cycles.
    pub successful_syncs: u64,
    /// Store syncs that failed, summed over cycles.
    pub failed_syncs: u64,
    /// Queue length at the time of the read.
    pub pending_mutations: usize,
}

impl SyncStats {
    /// Fold one finished cycle into the totals.
    pub fn record_cycle(&mut self, succeeded: usize, failed: usize, duration: Duration) {
        self.last_sync_at = Some(Utc::now());
        self.last_sync_duration_ms = duration.as_millis() as u64;
        self.total_syncs += 1;
        self.successful_syncs += succeeded as u64;
        self.failed_syncs += failed as u64;
    }
}
