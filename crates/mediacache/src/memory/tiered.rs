//! # Tiered Memory Cache
//!
//! Two LRU tiers behind a single lock:
//!
//! - the **encoded** tier keeps the compact form of every value and is bounded
//!   by entry count,
//! - the **decoded** tier keeps ready-to-use values and is bounded by total
//!   cost in bytes.
//!
//! `get` serves from the decoded tier first and otherwise materializes the
//! value from the encoded tier. The tiers evict independently, and a decoded
//! entry never depends on its encoded counterpart still being present.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use lru::LruCache;
use parking_lot::Mutex;
use tracing::{debug, warn};

use super::codec::CacheCodec;

/// An entry removed under limit pressure, handed to the eviction hook
#[derive(Debug, Clone)]
pub enum Evicted<T> {
    /// Compact form dropped from the encoded tier
    Encoded { size: usize },
    /// Ready-to-use value dropped from the decoded tier
    Decoded { value: T, cost: usize },
}

/// Observability hook invoked after an eviction, outside the cache lock
pub type EvictionHook<T> = Arc<dyn Fn(&str, &Evicted<T>) + Send + Sync>;

enum EncodedEntry<T> {
    Compact(Bytes),
    // The codec could not round-trip the value; it is kept as is.
    Raw(T),
}

impl<T> EncodedEntry<T> {
    fn size(&self, codec: &dyn CacheCodec<T>) -> usize {
        match self {
            EncodedEntry::Compact(bytes) => bytes.len(),
            EncodedEntry::Raw(value) => codec.cost(value),
        }
    }
}

struct DecodedEntry<T> {
    value: T,
    cost: usize,
}

struct Tiers<T> {
    encoded: LruCache<String, EncodedEntry<T>>,
    decoded: LruCache<String, DecodedEntry<T>>,
    decoded_cost: usize,
    count_limit: usize,
    cost_limit: usize,
}

impl<T: Clone> Tiers<T> {
    fn enforce_count(&mut self, codec: &dyn CacheCodec<T>, evicted: &mut Vec<(String, Evicted<T>)>) {
        if self.count_limit == 0 {
            return;
        }
        while self.encoded.len() > self.count_limit {
            match self.encoded.pop_lru() {
                Some((key, entry)) => {
                    let size = entry.size(codec);
                    evicted.push((key, Evicted::Encoded { size }));
                }
                None => break,
            }
        }
    }

    fn enforce_cost(&mut self, evicted: &mut Vec<(String, Evicted<T>)>) {
        if self.cost_limit == 0 {
            return;
        }
        while self.decoded_cost > self.cost_limit {
            match self.decoded.pop_lru() {
                Some((key, entry)) => {
                    self.decoded_cost -= entry.cost;
                    evicted.push((
                        key,
                        Evicted::Decoded {
                            value: entry.value,
                            cost: entry.cost,
                        },
                    ));
                }
                None => break,
            }
        }
    }

    fn insert_decoded(&mut self, key: String, value: T, cost: usize, evicted: &mut Vec<(String, Evicted<T>)>) {
        if self.cost_limit > 0 && cost > self.cost_limit {
            // Too large for the decoded tier; it stays reachable through the encoded tier.
            if let Some(old) = self.decoded.pop(&key) {
                self.decoded_cost -= old.cost;
            }
            return;
        }
        if let Some((_, old)) = self.decoded.push(key, DecodedEntry { value, cost }) {
            self.decoded_cost -= old.cost;
        }
        self.decoded_cost += cost;
        self.enforce_cost(evicted);
    }
}

/// Snapshot of cache counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub encoded_entries: usize,
    pub decoded_entries: usize,
    pub decoded_cost: usize,
}

/// Bounded two-level memory cache.
///
/// A limit of zero disables that bound.
pub struct TieredMemoryCache<T> {
    tiers: Mutex<Tiers<T>>,
    codec: Arc<dyn CacheCodec<T>>,
    compress: bool,
    on_evict: EvictionHook<T>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl<T: Clone + Send + 'static> TieredMemoryCache<T> {
    /// Create a cache with the given encoded-entry count limit and decoded cost limit
    pub fn new(codec: Arc<dyn CacheCodec<T>>, count_limit: usize, cost_limit: usize) -> Self {
        debug!(count_limit, cost_limit, "Memory cache created");
        Self {
            tiers: Mutex::new(Tiers {
                encoded: LruCache::unbounded(),
                decoded: LruCache::unbounded(),
                decoded_cost: 0,
                count_limit,
                cost_limit,
            }),
            codec,
            compress: true,
            on_evict: Arc::new(|key: &str, evicted: &Evicted<T>| match evicted {
                Evicted::Encoded { size } => debug!(key, size, "Evicted encoded entry"),
                Evicted::Decoded { cost, .. } => debug!(key, cost, "Evicted decoded entry"),
            }),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// Keep original values in the encoded tier instead of running the codec
    pub fn without_compression(mut self) -> Self {
        self.compress = false;
        self
    }

    /// Replace the eviction hook
    pub fn with_eviction_hook(mut self, hook: EvictionHook<T>) -> Self {
        self.on_evict = hook;
        self
    }

    fn notify(&self, evicted: Vec<(String, Evicted<T>)>) {
        if evicted.is_empty() {
            return;
        }
        self.evictions.fetch_add(evicted.len() as u64, Ordering::Relaxed);
        for (key, entry) in &evicted {
            (self.on_evict)(key, entry);
        }
    }

    pub fn get(&self, key: &str) -> Option<T> {
        let mut evicted = Vec::new();
        let result = {
            let mut tiers = self.tiers.lock();

            if let Some(entry) = tiers.decoded.get(key) {
                Some(entry.value.clone())
            } else {
                let materialized = match tiers.encoded.get(key) {
                    Some(EncodedEntry::Compact(bytes)) => match self.codec.decode(bytes) {
                        Ok(value) => Some(value),
                        Err(e) => {
                            warn!(key, error = %e, "Failed to decode cached entry, dropping it");
                            None
                        }
                    },
                    Some(EncodedEntry::Raw(value)) => Some(value.clone()),
                    None => None,
                };

                match materialized {
                    Some(value) => {
                        let cost = self.codec.cost(&value);
                        tiers.insert_decoded(key.to_string(), value.clone(), cost, &mut evicted);
                        Some(value)
                    }
                    None => {
                        // Undecodable compact entries are useless; drop them.
                        tiers.encoded.pop(key);
                        None
                    }
                }
            }
        };

        match result {
            Some(_) => self.hits.fetch_add(1, Ordering::Relaxed),
            None => self.misses.fetch_add(1, Ordering::Relaxed),
        };
        self.notify(evicted);
        result
    }

    /// Store `value` in both tiers
    pub fn put(&self, key: impl Into<String>, value: T) {
        let key = key.into();
        let encoded = self.encode_entry(&key, &value);
        let cost = self.codec.cost(&value);

        let mut evicted = Vec::new();
        {
            let mut tiers = self.tiers.lock();
            tiers.encoded.push(key.clone(), encoded);
            tiers.enforce_count(self.codec.as_ref(), &mut evicted);
            tiers.insert_decoded(key, value, cost, &mut evicted);
        }
        self.notify(evicted);
    }

    /// Compact form of `value`, or the value itself when the codec cannot
    /// reproduce it from the compact form
    fn encode_entry(&self, key: &str, value: &T) -> EncodedEntry<T> {
        if !self.compress {
            return EncodedEntry::Raw(value.clone());
        }
        let checked = self.codec.encode(value).and_then(|bytes| {
            self.codec.decode(&bytes)?;
            Ok(bytes)
        });
        match checked {
            Ok(bytes) => EncodedEntry::Compact(bytes),
            Err(e) => {
                warn!(key, error = %e, "Entry does not survive encoding, storing it uncompressed");
                EncodedEntry::Raw(value.clone())
            }
        }
    }

    /// Remove `key` from both tiers. Returns whether anything was removed.
    pub fn remove(&self, key: &str) -> bool {
        let mut tiers = self.tiers.lock();
        let encoded = tiers.encoded.pop(key).is_some();
        let decoded = match tiers.decoded.pop(key) {
            Some(entry) => {
                tiers.decoded_cost -= entry.cost;
                true
            }
            None => false,
        };
        encoded || decoded
    }

    pub fn contains(&self, key: &str) -> bool {
        let tiers = self.tiers.lock();
        tiers.decoded.contains(key) || tiers.encoded.contains(key)
    }

    pub fn clear(&self) {
        let mut tiers = self.tiers.lock();
        tiers.encoded.clear();
        tiers.decoded.clear();
        tiers.decoded_cost = 0;
    }

    pub fn set_count_limit(&self, count_limit: usize) {
        let mut evicted = Vec::new();
        {
            let mut tiers = self.tiers.lock();
            tiers.count_limit = count_limit;
            tiers.enforce_count(self.codec.as_ref(), &mut evicted);
        }
        self.notify(evicted);
    }

    pub fn set_cost_limit(&self, cost_limit: usize) {
        let mut evicted = Vec::new();
        {
            let mut tiers = self.tiers.lock();
            tiers.cost_limit = cost_limit;
            tiers.enforce_cost(&mut evicted);
        }
        self.notify(evicted);
    }

    pub fn stats(&self) -> CacheStats {
        let tiers = self.tiers.lock();
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            encoded_entries: tiers.encoded.len(),
            decoded_entries: tiers.decoded.len(),
            decoded_cost: tiers.decoded_cost,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::codec::{DeflateCodec, IdentityCodec};
    use std::io;

    fn bytes_cache(count: usize, cost: usize) -> TieredMemoryCache<Bytes> {
        TieredMemoryCache::new(Arc::new(DeflateCodec::default()), count, cost)
    }

    fn payload(fill: u8, len: usize) -> Bytes {
        Bytes::from(vec![fill; len])
    }

    struct BrokenCodec;

    impl CacheCodec<Bytes> for BrokenCodec {
        fn encode(&self, _value: &Bytes) -> io::Result<Bytes> {
            Err(io::Error::other("encoder unavailable"))
        }
        fn decode(&self, _encoded: &Bytes) -> io::Result<Bytes> {
            Err(io::Error::other("decoder unavailable"))
        }
        fn cost(&self, value: &Bytes) -> usize {
            value.len()
        }
    }

    #[test]
    fn test_put_get_hit_and_miss() {
        let cache = bytes_cache(10, 1024);
        cache.put("a", payload(1, 100));
        assert_eq!(cache.get("a"), Some(payload(1, 100)));
        assert_eq!(cache.get("missing"), None);

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[test]
    fn test_decoded_eviction_rematerializes_from_encoded() {
        let cache = bytes_cache(10, 250);
        cache.put("a", payload(1, 100));
        cache.put("b", payload(2, 100));
        cache.put("c", payload(3, 100));

        // "a" fell out of the decoded tier but is still encoded
        let stats = cache.stats();
        assert_eq!(stats.decoded_entries, 2);
        assert_eq!(stats.encoded_entries, 3);
        assert_eq!(stats.decoded_cost, 200);

        assert_eq!(cache.get("a"), Some(payload(1, 100)));
        assert!(cache.stats().decoded_cost <= 250);
    }

    #[test]
    fn test_decoded_entries_stay_valid_without_encoded_counterpart() {
        let cache = bytes_cache(1, 10_000);
        cache.put("a", payload(1, 100));
        cache.put("b", payload(2, 100));

        // Count limit of 1 evicted "a" from the encoded tier only
        assert_eq!(cache.stats().encoded_entries, 1);
        assert_eq!(cache.get("a"), Some(payload(1, 100)));
        assert_eq!(cache.get("b"), Some(payload(2, 100)));
    }

    #[test]
    fn test_eviction_never_returns_stale_values() {
        let cache = bytes_cache(3, 300);
        for i in 0..20u8 {
            cache.put(format!("k{i}"), payload(i, 100));
        }
        for i in 0..20u8 {
            if let Some(value) = cache.get(&format!("k{i}")) {
                assert_eq!(value, payload(i, 100));
            }
        }
        assert!(cache.get("k0").is_none());
        assert_eq!(cache.get("k19"), Some(payload(19, 100)));
    }

    #[test]
    fn test_eviction_hook_is_notified() {
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = seen.clone();
        let cache = bytes_cache(1, 0).with_eviction_hook(Arc::new(move |key: &str, evicted: &Evicted<Bytes>| {
            sink.lock().push((key.to_string(), matches!(evicted, Evicted::Encoded { .. })));
        }));

        cache.put("a", payload(1, 10));
        cache.put("b", payload(2, 10));

        assert_eq!(seen.lock().as_slice(), &[("a".to_string(), true)]);
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn test_encoding_failure_falls_back_to_raw() {
        let cache = TieredMemoryCache::new(Arc::new(BrokenCodec), 10, 50);
        cache.put("big", payload(9, 100));

        // Too costly for the decoded tier, so this is served from the raw encoded entry
        assert_eq!(cache.stats().decoded_entries, 0);
        assert_eq!(cache.get("big"), Some(payload(9, 100)));
    }

    struct LossyCodec;

    impl CacheCodec<Bytes> for LossyCodec {
        fn encode(&self, value: &Bytes) -> io::Result<Bytes> {
            Ok(value.clone())
        }
        fn decode(&self, _encoded: &Bytes) -> io::Result<Bytes> {
            Err(io::Error::other("corrupt stream"))
        }
        fn cost(&self, value: &Bytes) -> usize {
            value.len()
        }
    }

    #[test]
    fn test_undecodable_encoding_keeps_original_value() {
        let cache = TieredMemoryCache::new(Arc::new(LossyCodec), 10, 50);
        cache.put("big", payload(4, 100));

        assert_eq!(cache.stats().decoded_entries, 0);
        assert_eq!(cache.get("big"), Some(payload(4, 100)));
        assert_eq!(cache.get("big"), Some(payload(4, 100)));
        assert!(cache.contains("big"));
        assert_eq!(cache.stats().misses, 0);
    }

    #[test]
    fn test_limits_can_shrink_at_runtime() {
        let cache = TieredMemoryCache::new(Arc::new(IdentityCodec), 0, 0);
        for i in 0..5u8 {
            cache.put(format!("k{i}"), payload(i, 10));
        }
        assert_eq!(cache.stats().encoded_entries, 5);

        cache.set_count_limit(2);
        cache.set_cost_limit(20);
        let stats = cache.stats();
        assert_eq!(stats.encoded_entries, 2);
        assert_eq!(stats.decoded_cost, 20);
        assert_eq!(stats.evictions, 6);
    }

    #[test]
    fn test_remove_and_clear() {
        let cache = bytes_cache(10, 1000);
        cache.put("a", payload(1, 10));
        cache.put("b", payload(2, 10));

        assert!(cache.remove("a"));
        assert!(!cache.remove("a"));
        assert!(!cache.contains("a"));
        assert!(cache.contains("b"));

        cache.clear();
        assert!(!cache.contains("b"));
        assert_eq!(cache.stats().decoded_cost, 0);
    }

    #[test]
    fn test_overwrite_updates_cost() {
        let cache = bytes_cache(10, 1000);
        cache.put("a", payload(1, 100));
        cache.put("a", payload(2, 40));
        assert_eq!(cache.stats().decoded_cost, 40);
        assert_eq!(cache.get("a"), Some(payload(2, 40)));
    }
}
