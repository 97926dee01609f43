//! Local file client for state storage
//!
//! This client stores the state blob in a local file (default: tofu.tfstate)
//! and uses a JSON `<file>.lock` next to it as a simple locking mechanism.

use std::fs::OpenOptions;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;

use super::wait_for_lock;
use crate::backend::{
    BackendConfig, BackendError, BackendResult, ClientLocker, RemoteClient, StorageConfig,
};
use crate::lock::LockInfo;

/// Local file client for development and single-machine use
pub struct LocalClient {
    /// Path to the state file
    state_path: PathBuf,
    /// Path to the lock file
    lock_path: PathBuf,
    /// How long to wait for a lock held by someone else
    lock_timeout: Duration,
}

impl LocalClient {
    /// Default state file name
    pub const DEFAULT_STATE_FILE: &'static str = "tofu.tfstate";

    /// Create a new LocalClient with default paths (tofu.tfstate in current directory)
    pub fn new() -> Self {
        Self::with_path(PathBuf::from(Self::DEFAULT_STATE_FILE))
    }

    /// Create a new LocalClient with a specific state file path
    pub fn with_path(state_path: PathBuf) -> Self {
        let mut lock_path = state_path.clone().into_os_string();
        lock_path.push(".lock");
        Self {
            state_path,
            lock_path: PathBuf::from(lock_path),
            lock_timeout: Duration::ZERO,
        }
    }

    pub fn with_lock_timeout(mut self, lock_timeout: Duration) -> Self {
        self.lock_timeout = lock_timeout;
        self
    }

    /// Create a LocalClient from configuration
    pub fn from_config(config: &BackendConfig, storage: &StorageConfig) -> BackendResult<Self> {
        let path = config
            .get_string("path")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(Self::DEFAULT_STATE_FILE));

        Ok(Self::with_path(path).with_lock_timeout(storage.lock_timeout))
    }

    /// Get the state file path
    pub fn state_path(&self) -> &Path {
        &self.state_path
    }

    /// Get the lock file path
    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }

    /// Read the lock file, distinguishing missing from unparseable
    fn read_lock(&self) -> BackendResult<Option<Result<LockInfo, serde_json::Error>>> {
        match std::fs::read_to_string(&self.lock_path) {
            Ok(content) => Ok(Some(serde_json::from_str(&content))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(BackendError::Io(format!("Failed to read lock file: {}", e))),
        }
    }

    fn remove_lock(&self) -> BackendResult<()> {
        match std::fs::remove_file(&self.lock_path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(BackendError::Io(format!("Failed to remove lock file: {}", e))),
        }
    }

    fn try_lock(&self, info: &LockInfo) -> BackendResult<String> {
        match self.read_lock()? {
            Some(Ok(existing)) if !existing.is_expired() => {
                return Err(BackendError::locked(&existing));
            }
            Some(Ok(existing)) => {
                log::warn!(
                    "Taking over expired state lock {} held by {}",
                    existing.id,
                    existing.who
                );
                self.remove_expired_lock(&existing.id)?;
            }
            Some(Err(e)) => {
                return Err(BackendError::Io(format!(
                    "Lock file {} exists but cannot be parsed ({}); remove it with force-unlock",
                    self.lock_path.display(),
                    e
                )));
            }
            None => {}
        }

        let content = serde_json::to_vec_pretty(info)
            .map_err(|e| BackendError::Serialization(format!("Failed to serialize lock: {}", e)))?;
        self.publish_lock(&info.id, &content)?;

        Ok(info.id.clone())
    }

    /// Write the lock to a private file, then link it into place
    ///
    /// The link fails if a lock file already exists, and readers only ever
    /// see a complete lock file.
    fn publish_lock(&self, lock_id: &str, content: &[u8]) -> BackendResult<()> {
        let mut tmp_path = self.lock_path.clone().into_os_string();
        tmp_path.push(format!(".{}.tmp", lock_id));
        let tmp_path = PathBuf::from(tmp_path);

        let written = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&tmp_path)
            .and_then(|mut file| {
                file.write_all(content)?;
                file.sync_all()
            });
        if let Err(e) = written {
            let _ = std::fs::remove_file(&tmp_path);
            return Err(BackendError::Io(format!("Failed to write lock file: {}", e)));
        }

        let linked = std::fs::hard_link(&tmp_path, &self.lock_path);
        let _ = std::fs::remove_file(&tmp_path);
        match linked {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => match self.read_lock()? {
                Some(Ok(winner)) => Err(BackendError::locked(&winner)),
                _ => Err(BackendError::Io(
                    "Lock file was created concurrently".to_string(),
                )),
            },
            Err(e) => Err(BackendError::Io(format!("Failed to write lock file: {}", e))),
        }
    }

    /// Remove an expired lock only if it is still the one we saw
    fn remove_expired_lock(&self, expired_id: &str) -> BackendResult<()> {
        match self.read_lock()? {
            Some(Ok(current)) if current.id == expired_id => self.remove_lock(),
            Some(Ok(current)) => Err(BackendError::locked(&current)),
            Some(Err(_)) => Err(BackendError::Io(
                "Lock file was replaced concurrently".to_string(),
            )),
            None => Ok(()),
        }
    }

    /// Remove the lock file if it belongs to `lock_id`
    ///
    /// With `strict` off, an unparseable lock file is removed as well.
    fn release(&self, lock_id: &str, strict: bool) -> BackendResult<()> {
        match self.read_lock()? {
            None => Err(BackendError::LockNotFound(lock_id.to_string())),
            Some(Ok(existing)) if existing.id != lock_id => Err(BackendError::LockMismatch {
                expected: lock_id.to_string(),
                actual: existing.id,
            }),
            Some(Err(e)) if strict => Err(BackendError::Serialization(format!(
                "Failed to parse lock file: {}",
                e
            ))),
            Some(_) => self.remove_lock(),
        }
    }
}

impl Default for LocalClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteClient for LocalClient {
    async fn get(&self) -> BackendResult<Option<Vec<u8>>> {
        match std::fs::read(&self.state_path) {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(BackendError::Io(format!("Failed to read state file: {}", e))),
        }
    }

    async fn put(&self, data: &[u8]) -> BackendResult<()> {
        // Write next to the target and rename so readers never see a partial file
        let mut tmp_path = self.state_path.clone().into_os_string();
        tmp_path.push(".tmp");
        let tmp_path = PathBuf::from(tmp_path);

        std::fs::write(&tmp_path, data)
            .map_err(|e| BackendError::Io(format!("Failed to write state file: {}", e)))?;
        std::fs::rename(&tmp_path, &self.state_path)
            .map_err(|e| BackendError::Io(format!("Failed to replace state file: {}", e)))?;

        Ok(())
    }

    async fn delete(&self) -> BackendResult<()> {
        match std::fs::remove_file(&self.state_path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(BackendError::Io(format!("Failed to remove state file: {}", e))),
        }
    }
}

#[async_trait]
impl ClientLocker for LocalClient {
    async fn lock(&self, info: &LockInfo) -> BackendResult<String> {
        wait_for_lock(self.lock_timeout, || async move { self.try_lock(info) }).await
    }

    async fn unlock(&self, lock_id: &str) -> BackendResult<()> {
        self.release(lock_id, true)
    }

    async fn force_unlock(&self, lock_id: &str) -> BackendResult<()> {
        log::warn!("Forcibly releasing state lock {}", lock_id);
        self.release(lock_id, false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::tempdir;
    use tofu_core::Value;

    fn client_in(dir: &tempfile::TempDir) -> LocalClient {
        LocalClient::with_path(dir.path().join("test.tfstate"))
    }

    #[tokio::test]
    async fn test_local_client_read_write() {
        let dir = tempdir().unwrap();
        let client = client_in(&dir);

        // Initially no state
        assert!(client.get().await.unwrap().is_none());

        client.put(&[0, 1, 2, 255]).await.unwrap();
        assert_eq!(client.get().await.unwrap(), Some(vec![0, 1, 2, 255]));

        // Temporary file is renamed away
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(leftovers.len(), 1);

        client.delete().await.unwrap();
        assert!(client.get().await.unwrap().is_none());
        client.delete().await.unwrap();
    }

    #[tokio::test]
    async fn test_local_client_locking() {
        let dir = tempdir().unwrap();
        let client = client_in(&dir);

        // Acquire lock
        let lock = LockInfo::new("apply");
        let id = client.lock(&lock).await.unwrap();
        assert_eq!(id, lock.id);
        assert!(client.lock_path().exists());

        // Try to acquire again - should fail
        let result = client.lock(&LockInfo::new("plan")).await;
        assert!(matches!(result, Err(BackendError::Locked { .. })));

        // Release lock
        client.unlock(&id).await.unwrap();
        assert!(!client.lock_path().exists());

        // Now can acquire again
        let id2 = client.lock(&LockInfo::new("destroy")).await.unwrap();
        client.unlock(&id2).await.unwrap();
    }

    #[tokio::test]
    async fn test_local_client_unlock_checks_id() {
        let dir = tempdir().unwrap();
        let client = client_in(&dir);

        assert!(matches!(
            client.unlock("nothing").await,
            Err(BackendError::LockNotFound(_))
        ));

        let id = client.lock(&LockInfo::new("apply")).await.unwrap();
        assert!(matches!(
            client.unlock("wrong-id").await,
            Err(BackendError::LockMismatch { .. })
        ));
        assert!(matches!(
            client.force_unlock("wrong-id").await,
            Err(BackendError::LockMismatch { .. })
        ));
        client.force_unlock(&id).await.unwrap();
        assert!(!client.lock_path().exists());
    }

    #[tokio::test]
    async fn test_local_client_takes_over_expired_lock() {
        let dir = tempdir().unwrap();
        let client = client_in(&dir);

        client
            .lock(&LockInfo::with_timeout("apply", -1))
            .await
            .unwrap();
        let id = client.lock(&LockInfo::new("plan")).await.unwrap();
        client.unlock(&id).await.unwrap();
    }

    #[tokio::test]
    async fn test_local_client_never_removes_unparseable_lock_on_lock() {
        let dir = tempdir().unwrap();
        let client = client_in(&dir);

        // Another process has created the lock file but not written it yet
        std::fs::write(client.lock_path(), "").unwrap();
        assert!(matches!(
            client.lock(&LockInfo::new("plan")).await,
            Err(BackendError::Io(_))
        ));
        assert!(client.lock_path().exists());

        std::fs::write(client.lock_path(), "not json").unwrap();
        assert!(matches!(
            client.lock(&LockInfo::new("plan")).await,
            Err(BackendError::Io(_))
        ));
        assert!(matches!(
            client.unlock("any").await,
            Err(BackendError::Serialization(_))
        ));

        // Only force-unlock clears it
        client.force_unlock("any").await.unwrap();
        let id = client.lock(&LockInfo::new("apply")).await.unwrap();
        client.unlock(&id).await.unwrap();
    }

    #[tokio::test]
    async fn test_local_client_lock_leaves_no_temp_files() {
        let dir = tempdir().unwrap();
        let client = client_in(&dir);
        let holder = client.lock(&LockInfo::new("apply")).await.unwrap();
        assert!(client.lock(&LockInfo::new("plan")).await.is_err());

        let names: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(names, vec!["test.tfstate.lock".to_string()]);

        let stored: LockInfo =
            serde_json::from_str(&std::fs::read_to_string(client.lock_path()).unwrap()).unwrap();
        assert_eq!(stored.id, holder);
        client.unlock(&holder).await.unwrap();
    }

    #[tokio::test]
    async fn test_local_client_waits_for_lock() {
        let dir = tempdir().unwrap();
        let holder = Arc::new(client_in(&dir));
        let waiter =
            LocalClient::with_path(holder.state_path().to_path_buf()).with_lock_timeout(Duration::from_secs(5));

        let id = holder.lock(&LockInfo::new("apply")).await.unwrap();
        let release = {
            let holder = holder.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(200)).await;
                holder.unlock(&id).await.unwrap();
            })
        };

        let id = waiter.lock(&LockInfo::new("plan")).await.unwrap();
        release.await.unwrap();
        waiter.unlock(&id).await.unwrap();
    }

    #[tokio::test]
    async fn test_local_client_from_config() {
        let config = BackendConfig::new("local");
        let client = LocalClient::from_config(&config, &StorageConfig::default()).unwrap();
        assert_eq!(client.state_path(), Path::new("tofu.tfstate"));
        assert_eq!(client.lock_path(), Path::new("tofu.tfstate.lock"));
    }

    #[tokio::test]
    async fn test_local_client_custom_path() {
        let config = BackendConfig::new("local")
            .with_attribute("path", Value::String("custom.tfstate".to_string()))
            .with_attribute("lock_timeout", 12i64);
        let storage = StorageConfig::from_backend_config(&config).unwrap();

        let client = LocalClient::from_config(&config, &storage).unwrap();
        assert_eq!(client.state_path(), Path::new("custom.tfstate"));
        assert_eq!(client.lock_timeout, Duration::from_secs(12));
    }
}
