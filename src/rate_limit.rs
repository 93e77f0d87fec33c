//! Token bucket admission control shared by every outbound backend call.

use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use crate::config::RateLimitConfig;

#[derive(Debug)]
struct Bucket {
  tokens: f64,
  last_refill: Instant,
}

/// Token bucket refilled lazily at call time.
///
/// Invariant: `0 <= tokens <= max_tokens`.
pub struct RateLimiter {
  bucket: Mutex<Bucket>,
  max_tokens: f64,
  refill_rate: f64,
}

impl RateLimiter {
  /// Create a full bucket of `max_tokens`, refilled at `refill_rate` per second.
  pub fn new(max_tokens: f64, refill_rate: f64) -> Self {
    let max_tokens = max_tokens.max(0.0);
    Self {
      bucket: Mutex::new(Bucket {
        tokens: max_tokens,
        last_refill: Instant::now(),
      }),
      max_tokens,
      refill_rate: refill_rate.max(0.0),
    }
  }

  pub fn from_config(config: &RateLimitConfig) -> Self {
    Self::new(config.max_tokens, config.refill_rate)
  }

  pub fn max_tokens(&self) -> f64 {
    self.max_tokens
  }

  /// Admit a call of `cost` tokens without blocking.
  pub fn try_acquire(&self, cost: f64) -> bool {
    let mut bucket = self.refilled();
    if bucket.tokens >= cost {
      bucket.tokens -= cost;
      true
    } else {
      debug!(cost, available = bucket.tokens, "rate limit denied");
      false
    }
  }

  /// Tokens currently available after refill.
  pub fn available(&self) -> f64 {
    self.refilled().tokens
  }

  /// How long until `cost` tokens will be available; `None` if never.
  pub fn time_until_available(&self, cost: f64) -> Option<Duration> {
    if cost > self.max_tokens {
      return None;
    }
    let bucket = self.refilled();
    let missing = cost - bucket.tokens;
    if missing <= 0.0 {
      return Some(Duration::ZERO);
    }
    if self.refill_rate <= 0.0 {
      return None;
    }
    Some(Duration::from_secs_f64(missing / self.refill_rate))
  }

  /// Wait until `cost` tokens are admitted.
  ///
  /// Returns `false` immediately when `cost` can never be satisfied.
  pub async fn acquire(&self, cost: f64) -> bool {
    loop {
      if self.try_acquire(cost) {
        return true;
      }
      match self.time_until_available(cost) {
        // Another caller may win the tokens first; loop and re-check
        Some(wait) => tokio::time::sleep(wait.max(Duration::from_millis(1))).await,
        None => return false,
      }
    }
  }

  fn refilled(&self) -> MutexGuard<'_, Bucket> {
    let mut bucket = self
      .bucket
      .lock()
      .unwrap_or_else(|poisoned| poisoned.into_inner());
    let now = Instant::now();
    let elapsed = now.saturating_duration_since(bucket.last_refill).as_secs_f64();
    bucket.tokens = (bucket.tokens + elapsed * self.refill_rate).min(self.max_tokens);
    bucket.last_refill = now;
    bucket
  }
}
