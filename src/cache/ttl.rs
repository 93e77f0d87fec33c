//! Bounded LRU cache with lazy TTL expiry.

use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

#[derive(Debug, Clone)]
struct CacheEntry<V> {
  value: V,
  stored_at: Instant,
}

/// Size-bounded key/value cache.
///
/// Entries older than `ttl` are treated as absent and dropped when touched.
/// Inserting into a full cache evicts the least recently used entry. The lock
/// is held only for the duration of a single call.
pub struct Cache<V> {
  entries: Mutex<LruCache<String, CacheEntry<V>>>,
  ttl: Duration,
}

impl<V: Clone> Cache<V> {
  /// Create a cache holding at most `max_size` entries (minimum 1).
  pub fn new(max_size: usize, ttl: Duration) -> Self {
    let capacity = NonZeroUsize::new(max_size).unwrap_or(NonZeroUsize::MIN);
    Self {
      entries: Mutex::new(LruCache::new(capacity)),
      ttl,
    }
  }

  pub fn ttl(&self) -> Duration {
    self.ttl
  }

  pub fn capacity(&self) -> usize {
    self.lock().cap().get()
  }

  /// Number of physically stored entries, including expired ones not yet touched.
  pub fn len(&self) -> usize {
    self.lock().len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// Look up a live entry and promote it to most recently used.
  pub fn get(&self, key: &str) -> Option<V> {
    let mut entries = self.lock();
    let expired = match entries.get(key) {
      Some(entry) if entry.stored_at.elapsed() > self.ttl => true,
      Some(entry) => return Some(entry.value.clone()),
      None => return None,
    };
    if expired {
      entries.pop(key);
      debug!(key, "cache entry expired");
    }
    None
  }

  /// Insert or refresh an entry, evicting the least recently used one when full.
  pub fn set(&self, key: impl Into<String>, value: V) {
    let key = key.into();
    let entry = CacheEntry {
      value,
      stored_at: Instant::now(),
    };
    // push hands back the replaced pair on refresh, or the evicted LRU pair
    if let Some((evicted, _)) = self.lock().push(key.clone(), entry) {
      if evicted != key {
        debug!(key = %evicted, "cache entry evicted");
      }
    }
  }

  pub fn invalidate(&self, key: &str) {
    self.lock().pop(key);
  }

  /// Drop every entry whose key starts with `prefix`.
  pub fn invalidate_by_prefix(&self, prefix: &str) {
    let mut entries = self.lock();
    let doomed: Vec<String> = entries
      .iter()
      .filter(|(k, _)| k.starts_with(prefix))
      .map(|(k, _)| k.clone())
      .collect();
    for key in &doomed {
      entries.pop(key.as_str());
    }
  }

  pub fn clear(&self) {
    self.lock().clear();
  }

  fn lock(&self) -> std::sync::MutexGuard<'_, LruCache<String, CacheEntry<V>>> {
    self
      .entries
      .lock()
      .unwrap_or_else(|poisoned| poisoned.into_inner())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test(start_paused = true)]
  async fn test_evicts_least_recently_used() {
    let cache = Cache::new(3, Duration::from_secs(60));
    cache.set("a", 1);
    cache.set("b", 2);
    cache.set("c", 3);
    cache.set("d", 4);

    assert_eq!(cache.get("a"), None);
    assert_eq!(cache.get("b"), Some(2));
    assert_eq!(cache.get("c"), Some(3));
    assert_eq!(cache.get("d"), Some(4));
    assert_eq!(cache.len(), 3);
  }

  #[tokio::test(start_paused = true)]
  async fn test_get_protects_from_eviction() {
    let cache = Cache::new(3, Duration::from_secs(60));
    cache.set("a", 1);
    cache.set("b", 2);
    cache.set("c", 3);
    assert_eq!(cache.get("a"), Some(1));
    cache.set("d", 4);

    assert_eq!(cache.get("a"), Some(1));
    assert_eq!(cache.get("b"), None);
  }

  #[tokio::test(start_paused = true)]
  async fn test_reset_refreshes_recency_and_timestamp() {
    let cache = Cache::new(2, Duration::from_secs(10));
    cache.set("a", 1);
    cache.set("b", 2);
    tokio::time::advance(Duration::from_secs(8)).await;
    cache.set("a", 10);
    cache.set("c", 3);

    // "b" was the oldest by recency once "a" was re-set
    assert_eq!(cache.get("b"), None);
    tokio::time::advance(Duration::from_secs(5)).await;
    assert_eq!(cache.get("a"), Some(10));
  }

  #[tokio::test(start_paused = true)]
  async fn test_ttl_boundary() {
    let ttl = Duration::from_secs(30);
    let cache = Cache::new(10, ttl);
    cache.set("k", "v");

    tokio::time::advance(ttl - Duration::from_millis(1)).await;
    assert_eq!(cache.get("k"), Some("v"));

    tokio::time::advance(Duration::from_millis(2)).await;
    assert_eq!(cache.get("k"), None);
    assert!(cache.is_empty(), "expired entry is removed on access");
  }

  #[tokio::test(start_paused = true)]
  async fn test_invalidate_by_prefix() {
    let cache = Cache::new(10, Duration::from_secs(60));
    cache.set("products:p1", 1);
    cache.set("products?abc", 2);
    cache.set("faqs:f1", 3);

    cache.invalidate_by_prefix("products");
    assert_eq!(cache.get("products:p1"), None);
    assert_eq!(cache.get("products?abc"), None);
    assert_eq!(cache.get("faqs:f1"), Some(3));

    cache.invalidate("faqs:f1");
    assert!(cache.is_empty());
  }

  #[tokio::test(start_paused = true)]
  async fn test_zero_capacity_clamps_to_one() {
    let cache = Cache::new(0, Duration::from_secs(60));
    assert_eq!(cache.capacity(), 1);
    cache.set("a", 1);
    cache.set("b", 2);
    assert_eq!(cache.get("a"), None);
    assert_eq!(cache.get("b"), Some(2));
    cache.clear();
    assert!(cache.is_empty());
  }
}
