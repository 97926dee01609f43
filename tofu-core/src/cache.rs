//! Evaluation cache - Per-address memoization for a single planning pass
//!
//! Each address gets its own entry holding the populated value and the
//! diagnostics produced while computing it. The map of entries is guarded by
//! a coarse lock that is only held long enough to find or create an entry;
//! computation happens under the entry's own lock, so callers for different
//! addresses never wait on each other while callers for the same address
//! share a single computation.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use crate::diagnostics::Diagnostics;

struct Entry<V> {
    populated: AtomicBool,
    slot: tokio::sync::Mutex<Option<(V, Diagnostics)>>,
}

impl<V> Entry<V> {
    fn new() -> Self {
        Self {
            populated: AtomicBool::new(false),
            slot: tokio::sync::Mutex::new(None),
        }
    }
}

/// Memoizes one computed value (plus diagnostics) per address
pub struct EvalCache<K, V> {
    entries: Mutex<HashMap<K, Arc<Entry<V>>>>,
}

impl<K, V> EvalCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn entry(&self, addr: &K) -> Arc<Entry<V>> {
        let mut entries = self.entries.lock();
        entries
            .entry(addr.clone())
            .or_insert_with(|| Arc::new(Entry::new()))
            .clone()
    }

    /// Return the value for `addr`, calling `populate` to compute it if this
    /// address has not been populated since it was created or last evicted.
    ///
    /// `populate` runs at most once per address between evictions no matter
    /// how many callers race here; every other caller receives a clone of the
    /// stored result, including any error diagnostics.
    pub async fn get<F, Fut>(&self, addr: &K, populate: F) -> (V, Diagnostics)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = (V, Diagnostics)>,
    {
        let entry = self.entry(addr);
        let mut slot = entry.slot.lock().await;
        if entry.populated.load(Ordering::Acquire)
            && let Some((value, diags)) = slot.as_ref()
        {
            return (value.clone(), diags.clone());
        }

        let (value, diags) = populate().await;
        *slot = Some((value.clone(), diags.clone()));
        entry.populated.store(true, Ordering::Release);
        (value, diags)
    }

    /// Mark `addr` as unpopulated so the next `get` recomputes it.
    ///
    /// The entry itself is kept so that its lock stays shared with any
    /// in-flight callers. Eviction does not cancel a populate that is already
    /// running: that result is still stored and served until the next
    /// eviction.
    pub fn evict(&self, addr: &K) {
        let entries = self.entries.lock();
        if let Some(entry) = entries.get(addr) {
            log::debug!("evicting cached evaluation result");
            entry.populated.store(false, Ordering::Release);
        }
    }

    pub fn is_populated(&self, addr: &K) -> bool {
        let entries = self.entries.lock();
        entries
            .get(addr)
            .is_some_and(|entry| entry.populated.load(Ordering::Acquire))
    }

    /// Number of addresses that have ever been referenced
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl<K, V> Default for EvalCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addrs::AbsResourceInstance;
    use crate::diagnostics::Diagnostic;
    use std::sync::atomic::AtomicUsize;
    use std::time::{Duration, Instant};

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn populate_runs_once_under_concurrency() {
        let cache: Arc<EvalCache<AbsResourceInstance, usize>> = Arc::new(EvalCache::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let addr = AbsResourceInstance::managed("aws_instance", "foo");

        let mut tasks = tokio::task::JoinSet::new();
        for _ in 0..100 {
            let cache = cache.clone();
            let calls = calls.clone();
            let addr = addr.clone();
            tasks.spawn(async move {
                cache
                    .get(&addr, move || async move {
                        let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        (n * 42, Diagnostics::new())
                    })
                    .await
            });
        }

        let mut results = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            results.push(joined.unwrap().0);
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(results.len(), 100);
        assert!(results.iter().all(|v| *v == 42));
    }

    #[tokio::test]
    async fn different_addresses_populate_in_parallel() {
        let cache: EvalCache<AbsResourceInstance, &'static str> = EvalCache::new();
        let a = AbsResourceInstance::managed("aws_instance", "a");
        let b = AbsResourceInstance::managed("aws_instance", "b");
        let slow = Duration::from_millis(200);

        let start = Instant::now();
        let (ra, rb) = tokio::join!(
            cache.get(&a, move || async move {
                tokio::time::sleep(slow).await;
                ("a", Diagnostics::new())
            }),
            cache.get(&b, move || async move {
                tokio::time::sleep(slow).await;
                ("b", Diagnostics::new())
            }),
        );
        let elapsed = start.elapsed();

        assert_eq!(ra.0, "a");
        assert_eq!(rb.0, "b");
        assert!(
            elapsed < Duration::from_millis(350),
            "populates were serialized: {:?}",
            elapsed
        );
    }

    #[tokio::test]
    async fn evict_causes_recompute() {
        let cache: EvalCache<String, usize> = EvalCache::new();
        let calls = AtomicUsize::new(0);
        let addr = "aws_instance.foo".to_string();
        let counter = &calls;
        let populate = move || async move {
            let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
            (n, Diagnostics::new())
        };

        assert_eq!(cache.get(&addr, populate).await.0, 1);
        assert_eq!(cache.get(&addr, populate).await.0, 1);
        assert!(cache.is_populated(&addr));

        cache.evict(&addr);
        assert!(!cache.is_populated(&addr));
        assert_eq!(cache.get(&addr, populate).await.0, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn error_diagnostics_are_memoized() {
        let cache: EvalCache<String, Option<u32>> = EvalCache::new();
        let addr = "data.aws_ami.ubuntu".to_string();

        let (value, diags) = cache
            .get(&addr, || async {
                (
                    None::<u32>,
                    Diagnostics::from(Diagnostic::error("provider unavailable")),
                )
            })
            .await;
        assert!(value.is_none());
        assert!(diags.has_errors());

        let (value, diags) = cache
            .get(&addr, || async { (Some(1), Diagnostics::new()) })
            .await;
        assert!(value.is_none());
        assert!(diags.has_errors());
    }

    #[tokio::test]
    async fn evict_unknown_address_is_noop() {
        let cache: EvalCache<String, u8> = EvalCache::new();
        cache.evict(&"nothing".to_string());
        assert!(cache.is_empty());
    }
}
