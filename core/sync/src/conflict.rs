//! Conflict resolution between local and remote versions of a record.
//!
//! Every function here is pure: the same inputs always give the same
//! output, nothing is mutated, and no clock is read beyond the
//! `updated_at_ms` values already carried by the records.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// Record with a stable primary key.
pub trait Keyed {
    /// Primary key shared by every version of the same logical record.
    fn key(&self) -> &str;
}

/// Record carrying a last-modified time.
pub trait Versioned {
    /// Last modification time in milliseconds since the Unix epoch.
    fn updated_at_ms(&self) -> i64;

    /// Overwrite the modification time.
    fn set_updated_at_ms(&mut self, updated_at_ms: i64);
}

/// Record whose state belongs to a priority lattice.
///
/// Higher priority states win a merge regardless of recency.
pub trait Prioritized {
    /// Priority of the record's current state.
    fn priority(&self) -> u8;
}

/// Merge policy an entity type follows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConflictPolicy {
    /// Newer `updated_at_ms` wins; ties go to the remote.
    LastWriteWins,
    /// Higher lattice priority wins; equal priority falls back to recency.
    PriorityLattice,
    /// Append-mostly log; the remote copy is kept as-is.
    AppendOnly,
}

/// Outcome of merging two versions.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution<T> {
    /// The version to keep.
    pub merged: T,
    /// Whether the two inputs differed at all. Informational only.
    pub has_conflict: bool,
}

/// Entity with a conflict policy.
pub trait Mergeable: Keyed + Clone + PartialEq {
    /// The policy this entity follows.
    const POLICY: ConflictPolicy;

    /// Merge a locally modified version with the remote one.
    fn merge(local: &Self, remote: &Self) -> Resolution<Self>;
}

/// Last-write-wins merge.
///
/// The version with the larger `updated_at_ms` wins, the remote on a tie.
/// The merged record carries the larger of the two timestamps.
pub fn resolve_by_timestamp<T>(local: &T, remote: &T) -> Resolution<T>
where
    T: Versioned + Clone + PartialEq,
{
    let winner = if local.updated_at_ms() > remote.updated_at_ms() {
        local
    } else {
        remote
    };
    stamp(winner, local, remote)
}

/// Priority-lattice merge.
///
/// The higher-priority state wins even when it is older; equal priorities
/// are settled by [`resolve_by_timestamp`]. The merged record carries the
/// larger of the two timestamps.
pub fn resolve_by_priority<T>(local: &T, remote: &T) -> Resolution<T>
where
    T: Versioned + Prioritized + Clone + PartialEq,
{
    match local.priority().cmp(&remote.priority()) {
        Ordering::Greater => stamp(local, local, remote),
        Ordering::Less => stamp(remote, local, remote),
        Ordering::Equal => resolve_by_timestamp(local, remote),
    }
}

/// Pass-through merge for append-mostly records.
///
/// Nothing is merged field by field; the remote copy is retained.
pub fn resolve_append_only<T>(local: &T, remote: &T) -> Resolution<T>
where
    T: Keyed + Clone + PartialEq,
{
    debug_assert_eq!(local.key(), remote.key());
    Resolution {
        merged: remote.clone(),
        has_conflict: local != remote,
    }
}

fn stamp<T>(winner: &T, local: &T, remote: &T) -> Resolution<T>
where
    T: Versioned + Clone + PartialEq,
{
    let mut merged = winner.clone();
    merged.set_updated_at_ms(local.updated_at_ms().max(remote.updated_at_ms()));
    Resolution {
        merged,
        has_conflict: local != remote,
    }
}

/// Result of merging two collections.
#[derive(Debug, Clone, PartialEq)]
pub struct MergeOutcome<T> {
    /// Union of both sides, ordered by key.
    pub items: Vec<T>,
    /// Keys present on both sides whose versions differed.
    pub conflicts: Vec<String>,
    /// Keys only present locally (candidates for push).
    pub local_only: Vec<String>,
}

/// Merge two collections keyed by primary id.
///
/// Records present on one side only are kept; records on both sides are
/// merged with the entity's policy.
pub fn merge_collections<T: Mergeable>(local: &[T], remote: &[T]) -> MergeOutcome<T> {
    let mut by_key: BTreeMap<&str, T> = remote.iter().map(|r| (r.key(), r.clone())).collect();
    let mut conflicts = Vec::new();
    let mut local_only = Vec::new();

    for item in local {
        match by_key.get(item.key()) {
            Some(remote_item) => {
                let resolution = T::merge(item, remote_item);
                if resolution.has_conflict {
                    conflicts.push(item.key().to_string());
                }
                by_key.insert(item.key(), resolution.merged);
            }
            None => {
                local_only.push(item.key().to_string());
                by_key.insert(item.key(), item.clone());
            }
        }
    }

    MergeOutcome {
        items: by_key.into_values().collect(),
        conflicts,
        local_only,
    }
}
