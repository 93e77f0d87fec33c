//! Access counters exposed to callers.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic counters, reset only through [`Metrics::reset`].
#[derive(Debug, Default)]
pub struct Metrics {
  cache_hits: AtomicU64,
  cache_misses: AtomicU64,
  network_requests: AtomicU64,
  network_errors: AtomicU64,
  rate_limit_rejections: AtomicU64,
  dedup_joins: AtomicU64,
  queued_writes: AtomicU64,
  replayed_writes: AtomicU64,
}

/// Point-in-time view of the counters plus the current queue depth.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
  pub cache_hits: u64,
  pub cache_misses: u64,
  pub network_requests: u64,
  pub network_errors: u64,
  pub rate_limit_rejections: u64,
  pub dedup_joins: u64,
  pub queued_writes: u64,
  pub replayed_writes: u64,
  pub queue_depth: u64,
}

impl MetricsSnapshot {
  /// Cache hit rate (0.0 to 1.0)
  pub fn hit_rate(&self) -> f64 {
    let total = self.cache_hits + self.cache_misses;
    if total == 0 {
      0.0
    } else {
      self.cache_hits as f64 / total as f64
    }
  }
}

impl Metrics {
  pub fn new() -> Self {
    Self::default()
  }

  pub(crate) fn cache_hit(&self) {
    self.cache_hits.fetch_add(1, Ordering::Relaxed);
  }

  pub(crate) fn cache_miss(&self) {
    self.cache_misses.fetch_add(1, Ordering::Relaxed);
  }

  pub(crate) fn network_request(&self) {
    self.network_requests.fetch_add(1, Ordering::Relaxed);
  }

  pub(crate) fn network_error(&self) {
    self.network_errors.fetch_add(1, Ordering::Relaxed);
  }

  pub(crate) fn rate_limited(&self) {
    self.rate_limit_rejections.fetch_add(1, Ordering::Relaxed);
  }

  pub(crate) fn dedup_join(&self) {
    self.dedup_joins.fetch_add(1, Ordering::Relaxed);
  }

  pub(crate) fn queued_write(&self) {
    self.queued_writes.fetch_add(1, Ordering::Relaxed);
  }

  pub(crate) fn replayed_write(&self) {
    self.replayed_writes.fetch_add(1, Ordering::Relaxed);
  }

  pub fn snapshot(&self, queue_depth: usize) -> MetricsSnapshot {
    MetricsSnapshot {
      cache_hits: self.cache_hits.load(Ordering::Relaxed),
      cache_misses: self.cache_misses.load(Ordering::Relaxed),
      network_requests: self.network_requests.load(Ordering::Relaxed),
      network_errors: self.network_errors.load(Ordering::Relaxed),
      rate_limit_rejections: self.rate_limit_rejections.load(Ordering::Relaxed),
      dedup_joins: self.dedup_joins.load(Ordering::Relaxed),
      queued_writes: self.queued_writes.load(Ordering::Relaxed),
      replayed_writes: self.replayed_writes.load(Ordering::Relaxed),
      queue_depth: queue_depth as u64,
    }
  }

  /// Reset all counters
  pub fn reset(&self) {
    for counter in [
      &self.cache_hits,
      &self.cache_misses,
      &self.network_requests,
      &self.network_errors,
      &self.rate_limit_rejections,
      &self.dedup_joins,
      &self.queued_writes,
      &self.replayed_writes,
    ] {
      counter.store(0, Ordering::Relaxed);
    }
  }
}
