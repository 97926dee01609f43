//! Per-process bookkeeping of state locks
//!
//! [`StateLocker`] sits between the engine and a [`Storage`] and remembers
//! which keys this process has locked, and how. It catches double locking
//! and unlocking keys that were never locked before the storage sees them,
//! and after any storage failure it refuses further lock requests so the
//! process winds down quickly instead of working on an unknown lock state.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::Mutex;

use crate::statekeys::StateKey;
use crate::statestore::{Key, KeySet, Storage, StorageError};

/// A single rejected key in a lock or unlock request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockConflict {
    AlreadyHeld(StateKey),
    SharedAndExclusive(StateKey),
    NotHeld(StateKey),
}

impl fmt::Display for LockConflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockConflict::AlreadyHeld(key) => write!(f, "already have lock for {}", key),
            LockConflict::SharedAndExclusive(key) => {
                write!(f, "can't request both shared and exclusive locks for {}", key)
            }
            LockConflict::NotHeld(key) => write!(f, "don't have any lock for {}", key),
        }
    }
}

fn join_conflicts(conflicts: &[LockConflict]) -> String {
    conflicts
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Debug, Error)]
pub enum LockerError {
    #[error("state storage locker is now closed")]
    Closed,

    #[error("refusing to issue new state storage lock due to earlier error")]
    Poisoned,

    #[error("{}", join_conflicts(.0))]
    Conflicts(Vec<LockConflict>),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

#[derive(Default)]
struct Inner {
    /// true for an exclusive lock, false for shared
    active: HashMap<Key, bool>,
    poisoned: bool,
    closed: bool,
}

/// Tracks the locks this process holds on a [`Storage`]
pub struct StateLocker {
    storage: Arc<dyn Storage>,
    inner: Mutex<Inner>,
}

impl StateLocker {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self {
            storage,
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    async fn lock_status(&self, key: &StateKey) -> Option<bool> {
        self.inner.lock().await.active.get(&key.encode()).copied()
    }

    pub async fn have_any_lock(&self, key: &StateKey) -> bool {
        self.lock_status(key).await.is_some()
    }

    pub async fn have_shared_lock(&self, key: &StateKey) -> bool {
        self.lock_status(key).await == Some(false)
    }

    pub async fn have_exclusive_lock(&self, key: &StateKey) -> bool {
        self.lock_status(key).await == Some(true)
    }

    /// Acquire shared and exclusive locks in one storage request
    ///
    /// Nothing is requested from the storage if any key is rejected.
    pub async fn lock(
        &self,
        shared: impl IntoIterator<Item = StateKey>,
        exclusive: impl IntoIterator<Item = StateKey>,
    ) -> Result<(), LockerError> {
        let shared: Vec<StateKey> = shared.into_iter().collect();
        let exclusive: Vec<StateKey> = exclusive.into_iter().collect();

        let mut inner = self.inner.lock().await;
        if inner.closed {
            return Err(LockerError::Closed);
        }
        if inner.poisoned {
            return Err(LockerError::Poisoned);
        }

        let mut conflicts = Vec::new();
        let mut want_shared = KeySet::new();
        for key in shared {
            let storage_key = key.encode();
            if inner.active.contains_key(&storage_key) {
                conflicts.push(LockConflict::AlreadyHeld(key));
                continue;
            }
            want_shared.insert(storage_key);
        }
        let mut want_exclusive = KeySet::new();
        for key in exclusive {
            let storage_key = key.encode();
            if inner.active.contains_key(&storage_key) {
                conflicts.push(LockConflict::AlreadyHeld(key));
                continue;
            }
            if want_shared.contains(&storage_key) {
                conflicts.push(LockConflict::SharedAndExclusive(key));
                continue;
            }
            want_exclusive.insert(storage_key);
        }
        if !conflicts.is_empty() {
            return Err(LockerError::Conflicts(conflicts));
        }
        if want_shared.is_empty() && want_exclusive.is_empty() {
            return Ok(());
        }

        if let Err(e) = self.storage.lock(&want_shared, &want_exclusive).await {
            // The storage may hold some, all or none of the requested locks now
            log::warn!("State lock request failed, refusing further locks: {}", e);
            inner.poisoned = true;
            return Err(e.into());
        }

        for key in want_shared {
            inner.active.insert(key, false);
        }
        for key in want_exclusive {
            inner.active.insert(key, true);
        }
        Ok(())
    }

    /// Release locks previously acquired through [`StateLocker::lock`]
    ///
    /// Allowed even when poisoned, so that as much as possible is released.
    pub async fn unlock(&self, keys: impl IntoIterator<Item = StateKey>) -> Result<(), LockerError> {
        let keys: Vec<StateKey> = keys.into_iter().collect();

        let mut inner = self.inner.lock().await;
        if inner.closed {
            return Err(LockerError::Closed);
        }

        let mut conflicts = Vec::new();
        let mut release = KeySet::new();
        for key in keys {
            let storage_key = key.encode();
            if !inner.active.contains_key(&storage_key) {
                conflicts.push(LockConflict::NotHeld(key));
                continue;
            }
            release.insert(storage_key);
        }
        if !conflicts.is_empty() {
            return Err(LockerError::Conflicts(conflicts));
        }
        if release.is_empty() {
            return Ok(());
        }

        if let Err(e) = self.storage.unlock(&release).await {
            log::warn!("State unlock request failed, refusing further locks: {}", e);
            inner.poisoned = true;
            return Err(e.into());
        }

        for key in &release {
            inner.active.remove(key);
        }
        Ok(())
    }

    /// Release every remaining lock and stop accepting requests
    ///
    /// The locker is closed on return even if releasing fails. The storage
    /// itself is left open.
    pub async fn close(&self) -> Result<(), LockerError> {
        let mut inner = self.inner.lock().await;
        if inner.closed {
            return Ok(());
        }
        inner.closed = true;
        let remaining: KeySet = std::mem::take(&mut inner.active).into_keys().collect();
        drop(inner);

        if remaining.is_empty() {
            return Ok(());
        }
        log::debug!("Releasing {} state locks on close", remaining.len());
        self.storage.unlock(&remaining).await?;
        Ok(())
    }
}
