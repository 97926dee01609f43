//! In-memory client, for tests and throwaway state

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::backend::{BackendError, BackendResult, ClientLocker, RemoteClient};
use crate::lock::LockInfo;

/// Process-local blob and lock slot
#[derive(Default)]
pub struct InmemClient {
    blob: Mutex<Option<Vec<u8>>>,
    lock: Mutex<Option<LockInfo>>,
}

impl InmemClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// The lock currently held, if any
    pub async fn current_lock(&self) -> Option<LockInfo> {
        self.lock.lock().await.clone()
    }
}

#[async_trait]
impl RemoteClient for InmemClient {
    async fn get(&self) -> BackendResult<Option<Vec<u8>>> {
        Ok(self.blob.lock().await.clone())
    }

    async fn put(&self, data: &[u8]) -> BackendResult<()> {
        *self.blob.lock().await = Some(data.to_vec());
        Ok(())
    }

    async fn delete(&self) -> BackendResult<()> {
        *self.blob.lock().await = None;
        Ok(())
    }
}

#[async_trait]
impl ClientLocker for InmemClient {
    async fn lock(&self, info: &LockInfo) -> BackendResult<String> {
        let mut slot = self.lock.lock().await;
        if let Some(existing) = slot.as_ref()
            && !existing.is_expired()
        {
            return Err(BackendError::locked(existing));
        }
        *slot = Some(info.clone());
        Ok(info.id.clone())
    }

    async fn unlock(&self, lock_id: &str) -> BackendResult<()> {
        let mut slot = self.lock.lock().await;
        match slot.as_ref() {
            None => Err(BackendError::LockNotFound(lock_id.to_string())),
            Some(existing) if existing.id != lock_id => Err(BackendError::LockMismatch {
                expected: lock_id.to_string(),
                actual: existing.id.clone(),
            }),
            Some(_) => {
                *slot = None;
                Ok(())
            }
        }
    }
}
