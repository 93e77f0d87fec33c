//! Bounded exponential-backoff retry with terminal error classification.
//!
//! - Delay before retry `n` (0-indexed) is `base_delay * 2^n`
//! - Optional jitter adds up to a quarter of that delay, never less
//! - Terminal errors are returned after the first attempt
//! - Each attempt runs under a timeout that counts as a retryable failure

use std::future::Future;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

use crate::config::RetryConfig;
use crate::error::BackendError;

/// Why a retried operation gave up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryError {
  /// A terminal error; no further attempts were made.
  Terminal { attempts: u32, error: BackendError },
  /// Every permitted attempt failed with a retryable error.
  Exhausted { attempts: u32, error: BackendError },
}

impl RetryError {
  pub fn attempts(&self) -> u32 {
    match self {
      RetryError::Terminal { attempts, .. } | RetryError::Exhausted { attempts, .. } => *attempts,
    }
  }

  pub fn error(&self) -> &BackendError {
    match self {
      RetryError::Terminal { error, .. } | RetryError::Exhausted { error, .. } => error,
    }
  }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
  max_retries: u32,
  base_delay: Duration,
  attempt_timeout: Duration,
  jitter: bool,
}

impl RetryPolicy {
  /// `max_retries` counts every attempt including the first (minimum 1).
  /// A zero `attempt_timeout` disables the per-attempt timeout.
  pub fn new(max_retries: u32, base_delay: Duration, attempt_timeout: Duration) -> Self {
    Self {
      max_retries: max_retries.max(1),
      base_delay,
      attempt_timeout,
      jitter: false,
    }
  }

  pub fn from_config(config: &RetryConfig) -> Self {
    Self::new(
      config.max_retries,
      config.base_delay(),
      config.attempt_timeout(),
    )
    .with_jitter(config.jitter)
  }

  pub fn with_jitter(mut self, jitter: bool) -> Self {
    self.jitter = jitter;
    self
  }

  pub fn max_retries(&self) -> u32 {
    self.max_retries
  }

  pub fn base_delay(&self) -> Duration {
    self.base_delay
  }

  /// Run `operation` with the policy's own bounds.
  pub async fn execute<T, F, Fut>(&self, operation: F) -> Result<T, RetryError>
  where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, BackendError>>,
  {
    self
      .execute_with(self.max_retries, self.base_delay, operation)
      .await
  }

  /// Run `operation` with caller-supplied bounds.
  pub async fn execute_with<T, F, Fut>(
    &self,
    max_retries: u32,
    base_delay: Duration,
    mut operation: F,
  ) -> Result<T, RetryError>
  where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, BackendError>>,
  {
    let max_retries = max_retries.max(1);
    let mut attempt: u32 = 0;

    loop {
      attempt += 1;
      let outcome = if self.attempt_timeout.is_zero() {
        operation().await
      } else {
        match tokio::time::timeout(self.attempt_timeout, operation()).await {
          Ok(outcome) => outcome,
          Err(_) => Err(BackendError::timeout(self.attempt_timeout)),
        }
      };

      let error = match outcome {
        Ok(value) => return Ok(value),
        Err(e) => e,
      };

      if error.is_terminal() {
        debug!(attempt, %error, "terminal error, not retrying");
        return Err(RetryError::Terminal {
          attempts: attempt,
          error,
        });
      }
      if attempt >= max_retries {
        warn!(attempts = attempt, %error, "retries exhausted");
        return Err(RetryError::Exhausted {
          attempts: attempt,
          error,
        });
      }

      let delay = self.delay_for(base_delay, attempt - 1);
      debug!(
        attempt,
        delay_ms = delay.as_millis() as u64,
        %error,
        "retrying after backoff"
      );
      tokio::time::sleep(delay).await;
    }
  }

  /// Backoff before retry `index` (0 for the delay after the first failure).
  pub fn delay_for(&self, base_delay: Duration, index: u32) -> Duration {
    let factor = 1u32.checked_shl(index).unwrap_or(u32::MAX);
    let delay = base_delay.saturating_mul(factor);
    if self.jitter {
      delay.saturating_add(jitter(delay / 4))
    } else {
      delay
    }
  }
}

/// Pseudo-random extra delay in `[0, max)`.
fn jitter(max: Duration) -> Duration {
  let max_nanos = max.as_nanos() as u64;
  if max_nanos == 0 {
    return Duration::ZERO;
  }
  let nanos = SystemTime::now()
    .duration_since(UNIX_EPOCH)
    .unwrap_or_else(|_| Duration::from_nanos(0))
    .subsec_nanos() as u64;
  Duration::from_nanos(nanos.wrapping_mul(2_654_435_761) % max_nanos)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::error::ErrorCode;
  use std::sync::{Arc, Mutex};
  use tokio::time::Instant;

  fn policy() -> RetryPolicy {
    RetryPolicy::new(3, Duration::from_millis(1000), Duration::from_secs(5))
  }

  #[tokio::test(start_paused = true)]
  async fn test_transient_failure_backs_off_then_exhausts() {
    let attempts = Arc::new(Mutex::new(Vec::new()));
    let log = Arc::clone(&attempts);

    let result: Result<(), RetryError> = policy()
      .execute(|| {
        log.lock().unwrap().push(Instant::now());
        async { Err(BackendError::new(ErrorCode::Unavailable, "down")) }
      })
      .await;

    let err = result.unwrap_err();
    assert!(matches!(err, RetryError::Exhausted { attempts: 3, .. }));
    assert_eq!(err.error().code, ErrorCode::Unavailable);

    let times = attempts.lock().unwrap().clone();
    assert_eq!(times.len(), 3);
    assert!(times[1] - times[0] >= Duration::from_millis(1000));
    assert!(times[2] - times[1] >= Duration::from_millis(2000));
  }

  #[tokio::test(start_paused = true)]
  async fn test_terminal_error_makes_one_attempt() {
    let mut calls = 0;
    let result: Result<(), RetryError> = policy()
      .execute(|| {
        calls += 1;
        async { Err(BackendError::new(ErrorCode::PermissionDenied, "nope")) }
      })
      .await;

    assert_eq!(calls, 1);
    assert!(matches!(result, Err(RetryError::Terminal { attempts: 1, .. })));
  }

  #[tokio::test(start_paused = true)]
  async fn test_succeeds_after_transient_failures() {
    let mut calls = 0;
    let result = policy()
      .execute(|| {
        calls += 1;
        let n = calls;
        async move {
          if n < 3 {
            Err(BackendError::new(ErrorCode::Internal, "flaky"))
          } else {
            Ok(n)
          }
        }
      })
      .await;
    assert_eq!(result, Ok(3));
  }

  #[tokio::test(start_paused = true)]
  async fn test_hung_attempt_times_out_and_retries() {
    let policy = RetryPolicy::new(2, Duration::from_millis(10), Duration::from_secs(2));
    let mut calls = 0;
    let result = policy
      .execute(|| {
        calls += 1;
        let n = calls;
        async move {
          if n == 1 {
            std::future::pending::<()>().await;
          }
          Ok::<_, BackendError>(n)
        }
      })
      .await;
    assert_eq!(result, Ok(2));
  }

  #[test]
  fn test_jittered_delays_keep_growing() {
    let policy = policy().with_jitter(true);
    let base = Duration::from_millis(1000);
    for index in 0..6 {
      let lower = base * 2u32.pow(index);
      let delay = policy.delay_for(base, index);
      assert!(delay >= lower);
      assert!(delay < lower + lower / 4 + Duration::from_nanos(1));
    }
  }

  #[test]
  fn test_delay_saturates() {
    let delay = policy().delay_for(Duration::from_secs(1), 80);
    assert!(delay >= Duration::from_secs(u32::MAX as u64));
  }
}
