//! Local filesystem key/value store.

use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;

use crate::provider::KeyValueStore;
use repsync_common::{Error, Result};

/// Local filesystem key/value store.
///
/// Each key maps to one file under the root directory. Writes go to a
/// temporary sibling first and are renamed into place, so a crash never
/// leaves a half-written value behind.
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    /// Create a new file store with the given root directory.
    ///
    /// # Postconditions
    /// - Root directory is created if it doesn't exist
    ///
    /// # Errors
    /// - Permission denied or invalid path
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();

        // Create root if it doesn't exist (sync for constructor)
        if !root.exists() {
            std::fs::create_dir_all(&root)?;
        }

        Ok(Self { root })
    }

    /// Root directory of this store.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map a key to its file path.
    ///
    /// Keys are restricted to `[A-Za-z0-9_.-]` so they can never escape
    /// the root directory.
    fn key_path(&self, key: &str) -> Result<PathBuf> {
        let valid = !key.is_empty()
            && !key.starts_with('.')
            && key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
        if !valid {
            return Err(Error::InvalidInput(format!("Invalid storage key: {:?}", key)));
        }
        Ok(self.root.join(format!("{}.json", key)))
    }
}

#[async_trait]
impl KeyValueStore for FileStore {
    fn name(&self) -> &str {
        "file"
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let path = self.key_path(key)?;
        match fs::read_to_string(&path).await {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::Io(e)),
        }
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        let path = self.key_path(key)?;
        let tmp_path = path.with_extension("json.tmp");

        fs::write(&tmp_path, value).await?;
        fs::rename(&tmp_path, &path).await?;

        debug!("Persisted {} bytes under key {}", value.len(), key);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let path = self.key_path(key)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Io(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_file_set_get() {
        let temp = TempDir::new().unwrap();
        let store = FileStore::new(temp.path()).unwrap();

        store.set("pending_operations_queue", "[1,2]").await.unwrap();
        let value = store.get("pending_operations_queue").await.unwrap();

        assert_eq!(value.as_deref(), Some("[1,2]"));
    }

    #[tokio::test]
    async fn test_file_persists_across_instances() {
        let temp = TempDir::new().unwrap();

        {
            let store = FileStore::new(temp.path()).unwrap();
            store.set("k", "v").await.unwrap();
        }

        let store = FileStore::new(temp.path()).unwrap();
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v"));
    }

    #[tokio::test]
    async fn test_file_remove() {
        let temp = TempDir::new().unwrap();
        let store = FileStore::new(temp.path()).unwrap();

        store.set("k", "v").await.unwrap();
        store.remove("k").await.unwrap();
        assert!(store.get("k").await.unwrap().is_none());

        // Removing again is fine
        store.remove("k").await.unwrap();
    }

    #[tokio::test]
    async fn test_file_rejects_traversal() {
        let temp = TempDir::new().unwrap();
        let store = FileStore::new(temp.path().join("nested")).unwrap();

        assert!(store.get("../escape").await.is_err());
        assert!(store.set("", "v").await.is_err());
        assert!(store.set(".hidden", "v").await.is_err());
    }
}
