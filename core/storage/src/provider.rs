//! Key/value storage trait definition.

use async_trait::async_trait;

use repsync_common::Result;

/// Flat string key/value storage used for durable sync state.
///
/// Implementations must handle their own locking; callers may share a
/// single instance across tasks.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Get the backend name (e.g., "memory", "file").
    fn name(&self) -> &str;

    /// Read the value stored under `key`.
    ///
    /// # Postconditions
    /// - Returns `None` if nothing was ever stored or the key was removed
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Store `value` under `key`, replacing any previous value.
    ///
    /// # Postconditions
    /// - Once this returns `Ok`, the value survives a process restart
    ///   (for durable backends)
    async fn set(&self, key: &str, value: &str) -> Result<()>;

    /// Remove `key`. Removing a missing key is not an error.
    async fn remove(&self, key: &str) -> Result<()>;
}
