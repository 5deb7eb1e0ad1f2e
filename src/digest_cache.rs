//! Content-addressed memoization of instrumented output
//!
//! Entries are keyed by a SHA-256 fingerprint of the canonical options JSON
//! and the source text. The cache has no eviction and no TTL: an entry lives
//! as long as the process, which is only correct because the instrumenter is
//! a pure function of its inputs.

use crate::error::Result;
use crate::options::TransformOptions;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tracing::debug;

/// Separator between the options JSON and the source text
///
/// Canonical JSON never contains a raw NUL, so the split point is unambiguous.
const FINGERPRINT_SEPARATOR: &[u8] = b"\0";

/// Cache key derived from options and source text
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Compute the fingerprint of an instrumentation request
    pub fn compute(options: &TransformOptions, source: &str) -> Result<Self> {
        let canonical = options.canonical_json()?;

        let mut hasher = Sha256::new();
        hasher.update(canonical.as_bytes());
        hasher.update(FINGERPRINT_SEPARATOR);
        hasher.update(source.as_bytes());

        Ok(Fingerprint(hex::encode(hasher.finalize())))
    }

    /// Hex digest
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Storage for instrumented output
///
/// Implementations are shared by every in-flight response, hence `Send + Sync`.
pub trait DigestCache: Send + Sync {
    /// Look up previously instrumented output
    fn get(&self, fingerprint: &Fingerprint) -> Option<Arc<str>>;

    /// Store instrumented output; an existing entry is replaced
    fn put(&self, fingerprint: Fingerprint, value: Arc<str>);
}

/// Cache statistics for monitoring
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheStats {
    pub total_entries: usize,
    pub total_bytes: usize,
    pub hits: u64,
    pub misses: u64,
}

impl CacheStats {
    /// Hit rate as a percentage
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            (self.hits as f64 / total as f64) * 100.0
        }
    }
}

/// Unbounded in-memory digest cache
#[derive(Debug, Default)]
pub struct MemoryDigestCache {
    storage: RwLock<HashMap<Fingerprint, Arc<str>>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl MemoryDigestCache {
    /// Create an empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries
    pub fn len(&self) -> usize {
        self.read_storage().len()
    }

    /// Whether the cache holds no entries
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Get cache statistics
    pub fn get_stats(&self) -> CacheStats {
        let storage = self.read_storage();
        CacheStats {
            total_entries: storage.len(),
            total_bytes: storage.values().map(|v| v.len()).sum(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }

    fn read_storage(&self) -> std::sync::RwLockReadGuard<'_, HashMap<Fingerprint, Arc<str>>> {
        // Every write is a single insert, so a poisoned map is still consistent.
        self.storage.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl DigestCache for MemoryDigestCache {
    fn get(&self, fingerprint: &Fingerprint) -> Option<Arc<str>> {
        let found = self.read_storage().get(fingerprint).cloned();

        if found.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
            debug!("Digest cache hit: {}", fingerprint);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            debug!("Digest cache miss: {}", fingerprint);
        }

        found
    }

    fn put(&self, fingerprint: Fingerprint, value: Arc<str>) {
        let size = value.len();
        let mut storage = self
            .storage
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        storage.insert(fingerprint, value);
        debug!(
            "Digest cache stored {} bytes ({} entries)",
            size,
            storage.len()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_fingerprint_deterministic() {
        let options = TransformOptions::for_request("/a.js");
        let a = Fingerprint::compute(&options, "var x = 1;").unwrap();
        let b = Fingerprint::compute(&options, "var x = 1;").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), 64);
    }

    #[test]
    fn test_fingerprint_depends_on_options() {
        let source = "var x = 1;";
        let a = Fingerprint::compute(&TransformOptions::for_request("/a.js"), source).unwrap();
        let b = Fingerprint::compute(&TransformOptions::for_request("/b.js"), source).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_fingerprint_depends_on_source() {
        let options = TransformOptions::for_request("/a.js");
        let a = Fingerprint::compute(&options, "var x = 1;").unwrap();
        let b = Fingerprint::compute(&options, "var x = 2;").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_fingerprint_boundary_not_ambiguous() {
        // Moving characters across the options/source boundary must change the key
        let a = Fingerprint::compute(&TransformOptions::for_request("/a||"), "x").unwrap();
        let b = Fingerprint::compute(&TransformOptions::for_request("/a"), "||x").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_get_put() {
        let cache = MemoryDigestCache::new();
        let key = Fingerprint::compute(&TransformOptions::default(), "src").unwrap();

        assert!(cache.get(&key).is_none());
        cache.put(key.clone(), Arc::from("instrumented"));
        assert_eq!(cache.get(&key).as_deref(), Some("instrumented"));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_stats() {
        let cache = MemoryDigestCache::new();
        let key = Fingerprint::compute(&TransformOptions::default(), "src").unwrap();

        cache.get(&key);
        cache.put(key.clone(), Arc::from("12345"));
        cache.get(&key);
        cache.get(&key);
        cache.get(&key);

        let stats = cache.get_stats();
        assert_eq!(stats.total_entries, 1);
        assert_eq!(stats.total_bytes, 5);
        assert_eq!(stats.hits, 3);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hit_rate(), 75.0);
    }

    #[test]
    fn test_concurrent_access() {
        let cache = Arc::new(MemoryDigestCache::new());
        let mut handles = vec![];

        for t in 0..8 {
            let cache = Arc::clone(&cache);
            handles.push(thread::spawn(move || {
                for i in 0..50 {
                    let source = format!("var v{} = {};", t, i);
                    let key = Fingerprint::compute(&TransformOptions::default(), &source).unwrap();
                    cache.put(key.clone(), Arc::from(source.as_str()));
                    assert_eq!(cache.get(&key).as_deref(), Some(source.as_str()));
                }
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(cache.len(), 400);
    }
}
