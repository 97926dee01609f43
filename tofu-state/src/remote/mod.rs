//! Remote state storage - A [`Storage`] over a single-blob remote client
//!
//! Simple backends can only store one blob and hold one global lock. This
//! adapter keeps the whole key/value map in memory while any key is locked:
//! the first lock acquires the remote lock and fetches the blob, and the last
//! unlock flattens the map, writes it back and releases the remote lock.
//! Concurrency is therefore all-or-nothing across processes, but tasks in
//! one process can still share the storage freely.

pub mod codec;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::backend::SharedClient;
use crate::lock::LockInfo;
use crate::statestore::{Key, KeySeq, KeySet, Storage, StorageError, StorageResult, Value};

/// Operation name recorded in the remote lock when none is configured
pub const DEFAULT_OPERATION: &str = "state";

#[derive(Default)]
struct Inner {
    /// Present iff `lock_count > 0`
    data: Option<HashMap<Key, Value>>,
    lock_count: usize,
    /// Token returned by the client's lock call
    lock_id: Option<String>,
    closed: bool,
}

/// [`Storage`] implementation backed by a [`SharedClient`]
pub struct StateStorage {
    client: SharedClient,
    operation: String,
    info: String,
    inner: Mutex<Inner>,
    /// Bumped on every activation and deactivation
    generation: Arc<AtomicU64>,
}

impl StateStorage {
    pub fn new(client: SharedClient) -> Self {
        Self {
            client,
            operation: DEFAULT_OPERATION.to_string(),
            info: String::new(),
            inner: Mutex::new(Inner::default()),
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Set the operation and free-form info recorded with the remote lock
    pub fn with_lock_info(mut self, operation: impl Into<String>, info: impl Into<String>) -> Self {
        self.operation = operation.into();
        self.info = info.into();
        self
    }

    pub fn client(&self) -> &SharedClient {
        &self.client
    }

    /// Number of key locks currently held
    pub async fn lock_count(&self) -> usize {
        self.inner.lock().await.lock_count
    }

    async fn activate(&self, inner: &mut Inner, count: usize) -> StorageResult<()> {
        let info = LockInfo::new(self.operation.as_str()).with_info(self.info.as_str());
        let lock_id = self
            .client
            .lock(&info)
            .await
            .map_err(StorageError::backend("acquiring state lock"))?;
        log::debug!("Acquired remote state lock {}", lock_id);

        // From here on, dropping this future must not leak the remote lock.
        let guard = RemoteLockGuard::new(self.client.clone(), lock_id);

        let raw = match self.client.get().await {
            Ok(raw) => raw,
            Err(e) => {
                guard.release().await;
                return Err(StorageError::backend("fetching state")(e));
            }
        };
        let data = match raw {
            None => HashMap::new(),
            Some(bytes) => match codec::decode(&bytes) {
                Ok(data) => data,
                Err(e) => {
                    guard.release().await;
                    return Err(StorageError::CorruptRemoteState(e));
                }
            },
        };

        log::debug!("Loaded {} state items", data.len());
        inner.data = Some(data);
        inner.lock_count = count;
        inner.lock_id = Some(guard.disarm());
        self.generation.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    /// Persist and release the remote lock; on failure `inner` is untouched
    async fn deactivate(&self, inner: &mut Inner) -> StorageResult<()> {
        if let Some(data) = &inner.data {
            let blob = codec::encode(data);
            self.client
                .put(&blob)
                .await
                .map_err(StorageError::backend("persisting state"))?;
            log::debug!("Persisted {} state items ({} bytes)", data.len(), blob.len());
        }
        if let Some(lock_id) = inner.lock_id.as_deref() {
            self.client
                .unlock(lock_id)
                .await
                .map_err(StorageError::backend("releasing state lock"))?;
            log::debug!("Released remote state lock {}", lock_id);
        }

        inner.data = None;
        inner.lock_count = 0;
        inner.lock_id = None;
        self.generation.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    /// One-shot key listing straight from the client
    async fn fetch_keys(&self) -> StorageResult<Vec<Key>> {
        let raw = self
            .client
            .get()
            .await
            .map_err(StorageError::backend("listing state keys"))?;
        let data = match raw {
            None => HashMap::new(),
            Some(bytes) => codec::decode(&bytes).map_err(StorageError::CorruptRemoteState)?,
        };
        let mut keys: Vec<Key> = data.into_keys().collect();
        keys.sort();
        Ok(keys)
    }
}

#[async_trait]
impl Storage for StateStorage {
    async fn keys(&self) -> KeySeq {
        let inner = self.inner.lock().await;
        if inner.closed {
            return Box::new(std::iter::once(Err(StorageError::Closed)));
        }

        if let Some(data) = &inner.data {
            let mut keys: Vec<Key> = data.keys().cloned().collect();
            keys.sort();
            return Box::new(GuardedKeys {
                keys: keys.into_iter(),
                generation: self.generation.clone(),
                expected: self.generation.load(Ordering::SeqCst),
                done: false,
            });
        }
        drop(inner);

        match self.fetch_keys().await {
            Ok(keys) => Box::new(keys.into_iter().map(Ok)),
            Err(e) => Box::new(std::iter::once(Err(e))),
        }
    }

    async fn read(&self, keys: &KeySet) -> StorageResult<HashMap<Key, Value>> {
        let inner = self.inner.lock().await;
        if inner.closed {
            return Err(StorageError::Closed);
        }
        let data = inner
            .data
            .as_ref()
            .ok_or(StorageError::NotLocked { operation: "read" })?;

        Ok(keys
            .iter()
            .filter_map(|key| data.get(key).map(|value| (key.clone(), value.clone())))
            .collect())
    }

    async fn write(&self, values: HashMap<Key, Value>) -> StorageResult<()> {
        let mut inner = self.inner.lock().await;
        if inner.closed {
            return Err(StorageError::Closed);
        }
        let data = inner
            .data
            .as_mut()
            .ok_or(StorageError::NotLocked { operation: "write" })?;

        for (key, value) in values {
            if value.is_empty() {
                data.remove(&key);
            } else {
                data.insert(key, value);
            }
        }
        Ok(())
    }

    async fn lock(&self, shared: &KeySet, exclusive: &KeySet) -> StorageResult<()> {
        let count = shared.len() + exclusive.len();
        let mut inner = self.inner.lock().await;
        if inner.closed {
            return Err(StorageError::Closed);
        }
        if count == 0 {
            return Ok(());
        }
        if inner.lock_count > 0 {
            inner.lock_count += count;
            return Ok(());
        }
        self.activate(&mut inner, count).await
    }

    async fn unlock(&self, keys: &KeySet) -> StorageResult<()> {
        let mut inner = self.inner.lock().await;
        if inner.closed {
            return Err(StorageError::Closed);
        }
        if keys.is_empty() {
            return Ok(());
        }

        let over_released = keys.len() > inner.lock_count;
        let remaining = inner.lock_count.saturating_sub(keys.len());
        if remaining > 0 {
            inner.lock_count = remaining;
            return Ok(());
        }

        if inner.data.is_some() {
            self.deactivate(&mut inner).await?;
        }
        if over_released {
            log::warn!("Released {} state keys while holding fewer locks", keys.len());
            return Err(StorageError::OverReleased);
        }
        Ok(())
    }

    async fn persist(&self) -> StorageResult<()> {
        let inner = self.inner.lock().await;
        if inner.closed {
            return Err(StorageError::Closed);
        }
        let Some(data) = &inner.data else {
            return Ok(());
        };
        self.client
            .put(&codec::encode(data))
            .await
            .map_err(StorageError::backend("persisting state"))
    }

    async fn close(&self) -> StorageResult<()> {
        let mut inner = self.inner.lock().await;
        if inner.closed {
            return Ok(());
        }
        if inner.data.is_some() {
            log::info!(
                "Closing state storage with {} locks still held",
                inner.lock_count
            );
            self.deactivate(&mut inner).await?;
        }
        inner.closed = true;
        Ok(())
    }
}

/// Key sequence over a locked snapshot that notices lock status changes
struct GuardedKeys {
    keys: std::vec::IntoIter<Key>,
    generation: Arc<AtomicU64>,
    expected: u64,
    done: bool,
}

impl Iterator for GuardedKeys {
    type Item = StorageResult<Key>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        if self.generation.load(Ordering::SeqCst) != self.expected {
            self.done = true;
            return Some(Err(StorageError::ConcurrentStateChange));
        }
        self.keys.next().map(Ok)
    }
}

/// Releases a freshly acquired remote lock unless disarmed
///
/// If the owning future is dropped mid-activation, the unlock is spawned
/// onto the current runtime.
struct RemoteLockGuard {
    client: SharedClient,
    lock_id: Option<String>,
}

impl RemoteLockGuard {
    fn new(client: SharedClient, lock_id: String) -> Self {
        Self {
            client,
            lock_id: Some(lock_id),
        }
    }

    /// Keep the lock; returns its id
    fn disarm(mut self) -> String {
        self.lock_id.take().unwrap_or_default()
    }

    async fn release(mut self) {
        if let Some(lock_id) = self.lock_id.take() {
            release_lock(&self.client, &lock_id).await;
        }
    }
}

impl Drop for RemoteLockGuard {
    fn drop(&mut self) {
        let Some(lock_id) = self.lock_id.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let client = self.client.clone();
                handle.spawn(async move {
                    release_lock(&client, &lock_id).await;
                });
            }
            Err(_) => {
                log::warn!(
                    "Remote state lock {} could not be released: no async runtime",
                    lock_id
                );
            }
        }
    }
}

async fn release_lock(client: &SharedClient, lock_id: &str) {
    match client.unlock(lock_id).await {
        Ok(()) => log::debug!("Released remote state lock {}", lock_id),
        Err(e) => log::warn!("Failed to release remote state lock {}: {}", lock_id, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendError, BackendResult, ClientLocker, RemoteClient};
    use crate::statestore::collect_key_set;
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use std::time::Duration;

    /// Client that counts every call and can be told to misbehave
    #[derive(Default)]
    struct CountingClient {
        blob: std::sync::Mutex<Option<Vec<u8>>>,
        gets: AtomicUsize,
        puts: AtomicUsize,
        locks: AtomicUsize,
        unlocks: AtomicUsize,
        fail_lock: AtomicBool,
        fail_put: AtomicBool,
        get_delay_ms: AtomicU64,
    }

    impl CountingClient {
        fn with_blob(blob: Vec<u8>) -> Self {
            let client = Self::default();
            *client.blob.lock().unwrap() = Some(blob);
            client
        }

        fn stored(&self) -> HashMap<Key, Value> {
            let blob = self.blob.lock().unwrap().clone().unwrap();
            codec::decode(&blob).unwrap()
        }

        fn count(counter: &AtomicUsize) -> usize {
            counter.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl RemoteClient for CountingClient {
        async fn get(&self) -> BackendResult<Option<Vec<u8>>> {
            self.gets.fetch_add(1, Ordering::SeqCst);
            let delay = self.get_delay_ms.load(Ordering::SeqCst);
            if delay > 0 {
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }
            Ok(self.blob.lock().unwrap().clone())
        }

        async fn put(&self, data: &[u8]) -> BackendResult<()> {
            if self.fail_put.load(Ordering::SeqCst) {
                return Err(BackendError::Io("disk full".to_string()));
            }
            self.puts.fetch_add(1, Ordering::SeqCst);
            *self.blob.lock().unwrap() = Some(data.to_vec());
            Ok(())
        }

        async fn delete(&self) -> BackendResult<()> {
            *self.blob.lock().unwrap() = None;
            Ok(())
        }
    }

    #[async_trait]
    impl ClientLocker for CountingClient {
        async fn lock(&self, info: &LockInfo) -> BackendResult<String> {
            if self.fail_lock.load(Ordering::SeqCst) {
                return Err(BackendError::locked(info));
            }
            self.locks.fetch_add(1, Ordering::SeqCst);
            Ok(info.id.clone())
        }

        async fn unlock(&self, _lock_id: &str) -> BackendResult<()> {
            self.unlocks.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn init_logging() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn key(name: &str) -> Key {
        Key::parse(&format!("rsrcinst|aws_instance.{}", name)).unwrap()
    }

    fn keys(names: &[&str]) -> KeySet {
        names.iter().map(|n| key(n)).collect()
    }

    fn storage() -> (Arc<CountingClient>, StateStorage) {
        init_logging();
        let client = Arc::new(CountingClient::default());
        let storage = StateStorage::new(client.clone());
        (client, storage)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_disjoint_locks_share_one_session() {
        init_logging();
        const TASKS: usize = 16;
        let client = Arc::new(CountingClient::default());
        let storage = Arc::new(StateStorage::new(client.clone()));
        let barrier = Arc::new(tokio::sync::Barrier::new(TASKS));

        let mut handles = Vec::new();
        for i in 0..TASKS {
            let storage = storage.clone();
            let barrier = barrier.clone();
            handles.push(tokio::spawn(async move {
                let name = format!("n{}", i);
                let mine = keys(&[name.as_str()]);
                storage.lock(&KeySet::new(), &mine).await.unwrap();
                barrier.wait().await;

                let mut values = HashMap::new();
                values.insert(key(&name), Value::new(vec![i as u8 + 1]));
                storage.write(values).await.unwrap();
                storage.unlock(&mine).await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(CountingClient::count(&client.locks), 1);
        assert_eq!(CountingClient::count(&client.gets), 1);
        assert_eq!(CountingClient::count(&client.puts), 1);
        assert_eq!(CountingClient::count(&client.unlocks), 1);
        assert_eq!(client.stored().len(), TASKS);
        assert_eq!(storage.lock_count().await, 0);
    }

    #[tokio::test]
    async fn test_read_write_require_lock() {
        let (_, storage) = storage();
        assert!(matches!(
            storage.read(&keys(&["a"])).await,
            Err(StorageError::NotLocked { operation: "read" })
        ));
        assert!(matches!(
            storage.write(HashMap::new()).await,
            Err(StorageError::NotLocked { operation: "write" })
        ));
    }

    #[tokio::test]
    async fn test_read_observes_writes_and_empty_value_deletes() {
        let (client, storage) = storage();
        let held = keys(&["a", "b"]);
        storage.lock(&held, &KeySet::new()).await.unwrap();

        let mut values = HashMap::new();
        values.insert(key("a"), Value::new(vec![1]));
        values.insert(key("b"), Value::new(vec![2]));
        storage.write(values).await.unwrap();

        let mut values = HashMap::new();
        values.insert(key("b"), Value::default());
        storage.write(values).await.unwrap();

        let read = storage.read(&held).await.unwrap();
        assert_eq!(read.len(), 1);
        assert_eq!(read[&key("a")], Value::new(vec![1]));

        storage.unlock(&held).await.unwrap();
        assert_eq!(client.stored().len(), 1);
    }

    #[tokio::test]
    async fn test_lock_zero_keys_is_noop() {
        let (client, storage) = storage();
        storage.lock(&KeySet::new(), &KeySet::new()).await.unwrap();
        storage.unlock(&KeySet::new()).await.unwrap();
        assert_eq!(CountingClient::count(&client.locks), 0);
        assert_eq!(CountingClient::count(&client.gets), 0);
    }

    #[tokio::test]
    async fn test_over_release_inactive() {
        let (client, storage) = storage();
        assert!(matches!(
            storage.unlock(&keys(&["a"])).await,
            Err(StorageError::OverReleased)
        ));
        assert_eq!(storage.lock_count().await, 0);
        assert_eq!(CountingClient::count(&client.unlocks), 0);
    }

    #[tokio::test]
    async fn test_over_release_active_still_releases() {
        let (client, storage) = storage();
        storage.lock(&KeySet::new(), &keys(&["a"])).await.unwrap();

        assert!(matches!(
            storage.unlock(&keys(&["a", "b"])).await,
            Err(StorageError::OverReleased)
        ));
        assert_eq!(storage.lock_count().await, 0);
        assert_eq!(CountingClient::count(&client.puts), 1);
        assert_eq!(CountingClient::count(&client.unlocks), 1);

        // The storage is usable again afterwards
        storage.lock(&KeySet::new(), &keys(&["a"])).await.unwrap();
        storage.unlock(&keys(&["a"])).await.unwrap();
        assert_eq!(CountingClient::count(&client.locks), 2);
    }

    #[tokio::test]
    async fn test_persist_keeps_lock() {
        let (client, storage) = storage();
        storage.persist().await.unwrap();
        assert_eq!(CountingClient::count(&client.puts), 0);

        storage.lock(&KeySet::new(), &keys(&["a"])).await.unwrap();
        let mut values = HashMap::new();
        values.insert(key("a"), Value::new(vec![9]));
        storage.write(values).await.unwrap();
        storage.persist().await.unwrap();

        assert_eq!(CountingClient::count(&client.puts), 1);
        assert_eq!(CountingClient::count(&client.unlocks), 0);
        assert_eq!(client.stored()[&key("a")], Value::new(vec![9]));
        assert_eq!(storage.lock_count().await, 1);
    }

    #[tokio::test]
    async fn test_corrupt_blob_releases_fresh_lock() {
        init_logging();
        let client = Arc::new(CountingClient::with_blob(b"definitely not state".to_vec()));
        let storage = StateStorage::new(client.clone());

        let err = storage.lock(&KeySet::new(), &keys(&["a"])).await.unwrap_err();
        assert!(matches!(
            err,
            StorageError::CorruptRemoteState(codec::CodecError::BadHeader)
        ));
        assert_eq!(CountingClient::count(&client.locks), 1);
        assert_eq!(CountingClient::count(&client.unlocks), 1);
        assert!(matches!(
            storage.read(&keys(&["a"])).await,
            Err(StorageError::NotLocked { .. })
        ));
    }

    #[tokio::test]
    async fn test_lock_failure_stays_inactive() {
        let (client, storage) = storage();
        client.fail_lock.store(true, Ordering::SeqCst);

        let err = storage.lock(&KeySet::new(), &keys(&["a"])).await.unwrap_err();
        match err {
            StorageError::Backend { operation, source } => {
                assert_eq!(operation, "acquiring state lock");
                assert!(matches!(source, BackendError::Locked { .. }));
            }
            other => panic!("Expected Backend error, got {:?}", other),
        }
        assert_eq!(CountingClient::count(&client.gets), 0);
        assert_eq!(storage.lock_count().await, 0);
    }

    #[tokio::test]
    async fn test_failed_persist_keeps_session() {
        let (client, storage) = storage();
        storage.lock(&KeySet::new(), &keys(&["a"])).await.unwrap();
        client.fail_put.store(true, Ordering::SeqCst);

        assert!(matches!(
            storage.unlock(&keys(&["a"])).await,
            Err(StorageError::Backend { .. })
        ));
        assert_eq!(storage.lock_count().await, 1);
        assert_eq!(CountingClient::count(&client.unlocks), 0);

        client.fail_put.store(false, Ordering::SeqCst);
        storage.unlock(&keys(&["a"])).await.unwrap();
        assert_eq!(CountingClient::count(&client.unlocks), 1);
    }

    #[tokio::test]
    async fn test_keys_without_lock_fetch_every_time() {
        let mut data = HashMap::new();
        data.insert(key("a"), Value::new(vec![1]));
        data.insert(key("b"), Value::new(vec![2]));
        let client = Arc::new(CountingClient::with_blob(codec::encode(&data)));
        let storage = StateStorage::new(client.clone());

        let first = collect_key_set(storage.keys().await).unwrap();
        let second = collect_key_set(storage.keys().await).unwrap();
        assert_eq!(first, keys(&["a", "b"]));
        assert_eq!(first, second);
        assert_eq!(CountingClient::count(&client.gets), 2);
        assert_eq!(CountingClient::count(&client.locks), 0);
    }

    #[tokio::test]
    async fn test_keys_with_lock_use_snapshot() {
        let (client, storage) = storage();
        storage.lock(&KeySet::new(), &keys(&["a"])).await.unwrap();
        let mut values = HashMap::new();
        values.insert(key("a"), Value::new(vec![1]));
        storage.write(values).await.unwrap();

        let listed = collect_key_set(storage.keys().await).unwrap();
        assert_eq!(listed, keys(&["a"]));
        assert_eq!(CountingClient::count(&client.gets), 1);
        storage.unlock(&keys(&["a"])).await.unwrap();
    }

    #[tokio::test]
    async fn test_keys_detect_lock_status_change() {
        let (_, storage) = storage();
        storage.lock(&KeySet::new(), &keys(&["a"])).await.unwrap();
        let mut values = HashMap::new();
        values.insert(key("a"), Value::new(vec![1]));
        storage.write(values).await.unwrap();

        let mut seq = storage.keys().await;
        storage.unlock(&keys(&["a"])).await.unwrap();

        assert!(matches!(
            seq.next(),
            Some(Err(StorageError::ConcurrentStateChange))
        ));
        assert!(seq.next().is_none());
    }

    #[tokio::test]
    async fn test_close_releases_and_rejects_further_use() {
        let (client, storage) = storage();
        storage.lock(&KeySet::new(), &keys(&["a"])).await.unwrap();
        storage.close().await.unwrap();

        assert_eq!(CountingClient::count(&client.puts), 1);
        assert_eq!(CountingClient::count(&client.unlocks), 1);
        assert!(matches!(
            storage.read(&keys(&["a"])).await,
            Err(StorageError::Closed)
        ));
        assert!(matches!(
            storage.lock(&KeySet::new(), &keys(&["a"])).await,
            Err(StorageError::Closed)
        ));
        assert!(matches!(
            storage.keys().await.next(),
            Some(Err(StorageError::Closed))
        ));
        storage.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_cancelled_activation_releases_remote_lock() {
        let (client, storage) = storage();
        client.get_delay_ms.store(500, Ordering::SeqCst);

        let attempt = tokio::time::timeout(
            Duration::from_millis(50),
            storage.lock(&KeySet::new(), &keys(&["a"])),
        )
        .await;
        assert!(attempt.is_err());

        // The release runs on a spawned task
        for _ in 0..50 {
            if CountingClient::count(&client.unlocks) == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(CountingClient::count(&client.locks), 1);
        assert_eq!(CountingClient::count(&client.unlocks), 1);
        assert_eq!(storage.lock_count().await, 0);
    }

    #[tokio::test]
    async fn test_lock_info_carries_operation() {
        struct Recording(std::sync::Mutex<Option<LockInfo>>);

        #[async_trait]
        impl RemoteClient for Recording {
            async fn get(&self) -> BackendResult<Option<Vec<u8>>> {
                Ok(None)
            }
            async fn put(&self, _data: &[u8]) -> BackendResult<()> {
                Ok(())
            }
            async fn delete(&self) -> BackendResult<()> {
                Ok(())
            }
        }

        #[async_trait]
        impl ClientLocker for Recording {
            async fn lock(&self, info: &LockInfo) -> BackendResult<String> {
                *self.0.lock().unwrap() = Some(info.clone());
                Ok("id".to_string())
            }
            async fn unlock(&self, _lock_id: &str) -> BackendResult<()> {
                Ok(())
            }
        }

        let client = Arc::new(Recording(std::sync::Mutex::new(None)));
        let storage = StateStorage::new(client.clone()).with_lock_info("apply", "ci job 12");
        storage.lock(&keys(&["a"]), &KeySet::new()).await.unwrap();
        storage.unlock(&keys(&["a"])).await.unwrap();

        let info = client.0.lock().unwrap().clone().unwrap();
        assert_eq!(info.operation, "apply");
        assert_eq!(info.info, "ci job 12");
        assert_eq!(info.version, env!("CARGO_PKG_VERSION"));
        assert!(info.expires.is_none());
    }

    #[tokio::test]
    async fn test_long_session_lock_is_not_taken_over() {
        use crate::backends::LocalClient;

        init_logging();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s.tfstate");
        let first = StateStorage::new(Arc::new(LocalClient::with_path(path.clone())));
        let second = StateStorage::new(Arc::new(LocalClient::with_path(path.clone())));
        let lock_path = LocalClient::with_path(path).lock_path().to_path_buf();

        first.lock(&KeySet::new(), &keys(&["a"])).await.unwrap();

        // Age the held lock well past any timeout
        let mut held: LockInfo =
            serde_json::from_str(&std::fs::read_to_string(&lock_path).unwrap()).unwrap();
        held.created = held.created - chrono::Duration::hours(6);
        std::fs::write(&lock_path, serde_json::to_vec(&held).unwrap()).unwrap();

        assert!(matches!(
            second.lock(&KeySet::new(), &keys(&["b"])).await,
            Err(StorageError::Backend {
                source: BackendError::Locked { .. },
                ..
            })
        ));
        assert_eq!(second.lock_count().await, 0);

        first.unlock(&keys(&["a"])).await.unwrap();
        assert!(!lock_path.exists());
        second.lock(&KeySet::new(), &keys(&["b"])).await.unwrap();
        second.unlock(&keys(&["b"])).await.unwrap();
    }
}
