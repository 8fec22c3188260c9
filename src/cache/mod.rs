//! Byte-budgeted artifact cache.
//!
//! [`ArtifactCache`] sits in front of a persistent [`CacheStore`] and keeps
//! the sum of stored entry sizes within a configured budget. All mutations go
//! through one lock, so concurrent model loads never interleave evictions.

mod store;

use lru::LruCache;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::config::EvictionPolicy;
use crate::error::{Result, SdkError};

pub use store::{DiskStore, MemoryStore};

pub trait CacheStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
    fn set(&self, key: &str, bytes: &[u8]) -> Result<()>;
    fn remove(&self, key: &str) -> Result<()>;
    fn keys(&self) -> Result<Vec<String>>;

    /// Stored size of an entry without reading it, where the store can tell.
    fn entry_size(&self, key: &str) -> Result<Option<u64>> {
        Ok(self.get(key)?.map(|bytes| bytes.len() as u64))
    }
}

struct CacheIndex {
    entries: LruCache<String, u64>,
    total_bytes: u64,
}

pub struct ArtifactCache {
    store: Box<dyn CacheStore>,
    budget: u64,
    policy: EvictionPolicy,
    index: OnceCell<Mutex<CacheIndex>>,
}

impl ArtifactCache {
    pub fn new(store: impl CacheStore + 'static, budget: u64, policy: EvictionPolicy) -> Self {
        Self {
            store: Box::new(store),
            budget,
            policy,
            index: OnceCell::new(),
        }
    }

    pub fn budget(&self) -> u64 {
        self.budget
    }

    fn index(&self) -> Result<&Mutex<CacheIndex>> {
        self.index.get_or_try_init(|| {
            let mut entries = LruCache::unbounded();
            let mut total_bytes = 0;
            for key in self.store.keys()? {
                if let Some(size) = self.store.entry_size(&key)? {
                    total_bytes += size;
                    entries.push(key, size);
                }
            }
            debug!(entries = entries.len(), total_bytes, "artifact cache index loaded");
            Ok(Mutex::new(CacheIndex {
                entries,
                total_bytes,
            }))
        })
    }

    pub fn total_bytes(&self) -> Result<u64> {
        Ok(self.index()?.lock().total_bytes)
    }

    pub fn contains(&self, key: &str) -> Result<bool> {
        Ok(self.index()?.lock().entries.contains(key))
    }

    /// Reads an entry. A stored entry whose size disagrees with the index is
    /// dropped and reported as a cache error.
    pub fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut index = self.index()?.lock();
        let Some(&expected) = index.entries.peek(key) else {
            return Ok(None);
        };
        let bytes = match self.store.get(key)? {
            Some(bytes) => bytes,
            None => {
                index.entries.pop(key);
                index.total_bytes -= expected;
                let _ = self.store.remove(key);
                return Err(SdkError::Cache(format!("entry {key} vanished from the store")));
            }
        };
        if bytes.len() as u64 != expected {
            index.entries.pop(key);
            index.total_bytes -= expected;
            let _ = self.store.remove(key);
            return Err(SdkError::Cache(format!(
                "entry {key} is corrupt: expected {expected} bytes, found {}",
                bytes.len()
            )));
        }
        if self.policy == EvictionPolicy::Lru {
            index.entries.promote(key);
        }
        Ok(Some(bytes))
    }

    /// Stores an entry, evicting others until it fits.
    ///
    /// Returns `false` when the entry alone is larger than the whole budget;
    /// an older copy stored under the same key is dropped in that case.
    pub fn put(&self, key: &str, bytes: &[u8]) -> Result<bool> {
        let size = bytes.len() as u64;
        if size > self.budget {
            warn!(
                key,
                bytes = size,
                budget = self.budget,
                "artifact exceeds cache budget, not caching"
            );
            if self.contains(key)? {
                self.remove(key)?;
            }
            return Ok(false);
        }

        let mut index = self.index()?.lock();
        if let Some(previous) = index.entries.pop(key) {
            index.total_bytes -= previous;
            self.store.remove(key)?;
        }
        while index.total_bytes + size > self.budget {
            let Some((victim, victim_size)) = index.entries.pop_lru() else {
                break;
            };
            if let Err(err) = self.store.remove(&victim) {
                // still stored, so it stays indexed and first in line
                index.entries.push(victim.clone(), victim_size);
                index.entries.demote(&victim);
                return Err(err);
            }
            index.total_bytes -= victim_size;
            debug!(key = %victim, bytes = victim_size, "evicted cached artifact");
        }

        self.store.set(key, bytes)?;
        index.entries.push(key.to_string(), size);
        index.total_bytes += size;
        Ok(true)
    }

    pub fn remove(&self, key: &str) -> Result<()> {
        let mut index = self.index()?.lock();
        if let Some(size) = index.entries.pop(key) {
            index.total_bytes -= size;
        }
        self.store.remove(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::{
        fs,
        path::PathBuf,
        sync::atomic::{AtomicUsize, Ordering},
    };

    fn cache(budget: u64, policy: EvictionPolicy) -> ArtifactCache {
        ArtifactCache::new(MemoryStore::default(), budget, policy)
    }

    fn scratch_dir() -> PathBuf {
        static COUNTER: AtomicUsize = AtomicUsize::new(0);
        let n = COUNTER.fetch_add(1, Ordering::SeqCst);
        let dir = std::env::temp_dir().join(format!("edge-sdk-cache-{}-{n}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        dir
    }

    /// Memory store that refuses to delete anything.
    #[derive(Default)]
    struct StickyStore(MemoryStore);

    impl CacheStore for StickyStore {
        fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
            self.0.get(key)
        }

        fn set(&self, key: &str, bytes: &[u8]) -> Result<()> {
            self.0.set(key, bytes)
        }

        fn remove(&self, key: &str) -> Result<()> {
            Err(SdkError::Cache(format!("cannot remove {key}")))
        }

        fn keys(&self) -> Result<Vec<String>> {
            self.0.keys()
        }
    }

    #[test]
    fn vanished_entry_leaves_no_trace_after_reopen() {
        let root = scratch_dir();
        let cache = ArtifactCache::new(
            DiskStore::open(&root, "models").unwrap(),
            64,
            EvictionPolicy::Lru,
        );
        cache.put("a", &[1; 6]).unwrap();
        for entry in fs::read_dir(root.join("models")).unwrap() {
            let path = entry.unwrap().path();
            if path.extension().is_some_and(|ext| ext == "bin") {
                fs::remove_file(path).unwrap();
            }
        }

        assert!(matches!(cache.get("a"), Err(SdkError::Cache(_))));
        assert_eq!(cache.total_bytes().unwrap(), 0);

        let reopened = ArtifactCache::new(
            DiskStore::open(&root, "models").unwrap(),
            64,
            EvictionPolicy::Lru,
        );
        assert_eq!(reopened.total_bytes().unwrap(), 0);
        assert!(!reopened.contains("a").unwrap());
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn failed_eviction_keeps_the_victim_counted() {
        let cache = ArtifactCache::new(StickyStore::default(), 10, EvictionPolicy::Lru);
        cache.put("a", &[1; 4]).unwrap();
        cache.put("b", &[2; 4]).unwrap();

        assert!(matches!(cache.put("c", &[3; 4]), Err(SdkError::Cache(_))));
        assert_eq!(cache.total_bytes().unwrap(), 8);
        assert!(cache.contains("a").unwrap());
        assert!(!cache.contains("c").unwrap());
    }

    #[test]
    fn oversized_entry_is_skipped() {
        let cache = cache(10, EvictionPolicy::Lru);
        assert!(cache.put("a", &[0; 4]).unwrap());
        assert!(!cache.put("big", &[0; 11]).unwrap());
        assert!(!cache.contains("big").unwrap());
        assert!(cache.contains("a").unwrap());
        assert_eq!(cache.total_bytes().unwrap(), 4);
    }

    #[test]
    fn lru_keeps_recently_read_entries() {
        let cache = cache(10, EvictionPolicy::Lru);
        cache.put("a", &[1; 4]).unwrap();
        cache.put("b", &[2; 4]).unwrap();
        cache.get("a").unwrap();
        cache.put("c", &[3; 4]).unwrap();
        assert!(cache.contains("a").unwrap());
        assert!(!cache.contains("b").unwrap());
        assert!(cache.contains("c").unwrap());
    }

    #[test]
    fn insertion_order_ignores_reads() {
        let cache = cache(10, EvictionPolicy::InsertionOrder);
        cache.put("a", &[1; 4]).unwrap();
        cache.put("b", &[2; 4]).unwrap();
        cache.get("a").unwrap();
        cache.put("c", &[3; 4]).unwrap();
        assert!(!cache.contains("a").unwrap());
        assert!(cache.contains("b").unwrap());
    }

    #[test]
    fn replacing_a_key_does_not_double_count() {
        let cache = cache(10, EvictionPolicy::Lru);
        cache.put("a", &[1; 6]).unwrap();
        cache.put("a", &[1; 8]).unwrap();
        assert_eq!(cache.total_bytes().unwrap(), 8);
        assert_eq!(cache.get("a").unwrap().unwrap().len(), 8);
    }

    #[test]
    fn index_is_rebuilt_from_existing_store() {
        let store = MemoryStore::default();
        store.set("warm", &[7; 5]).unwrap();
        let cache = ArtifactCache::new(store, 8, EvictionPolicy::Lru);
        assert_eq!(cache.total_bytes().unwrap(), 5);
        cache.put("next", &[1; 5]).unwrap();
        assert!(!cache.contains("warm").unwrap());
    }

    proptest! {
        #[test]
        fn total_never_exceeds_budget(
            budget in 1u64..256,
            inserts in proptest::collection::vec((0u8..12, 0usize..300), 1..40),
        ) {
            let cache = cache(budget, EvictionPolicy::Lru);
            for (key, len) in inserts {
                let key = format!("k{key}");
                let stored = cache.put(&key, &vec![0u8; len]).unwrap();
                let total = cache.total_bytes().unwrap();
                prop_assert!(total <= budget);
                if stored {
                    prop_assert!(cache.contains(&key).unwrap());
                } else {
                    prop_assert!(len as u64 > budget);
                    prop_assert!(!cache.contains(&key).unwrap());
                }
            }
        }
    }
}
