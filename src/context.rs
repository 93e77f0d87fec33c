//! The resilience context: one cache, rate limiter, connection monitor,
//! offline queue and retry policy shared by every domain service.
//!
//! Reads go cache first, then through the rate limiter and retry policy to
//! the backend, with concurrent reads of the same key sharing one call.
//! Writes go straight to the backend while online and into the offline
//! queue otherwise. Coming back online drains the queue in enqueue order.

use futures::future::{BoxFuture, FutureExt, Shared};
use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::backend::Backend;
use crate::cache::{Cache, CacheResult, Invalidation};
use crate::config::Config;
use crate::connection::{ConnectionMonitor, Subscription};
use crate::error::{AccessError, BackendError, ErrorContext};
use crate::metrics::{Metrics, MetricsSnapshot};
use crate::queue::{KvStore, OfflineQueue, Operation, OperationStatus, QueueError};
use crate::rate_limit::RateLimiter;
use crate::retry::{RetryError, RetryPolicy};

type SharedRead = Shared<BoxFuture<'static, Result<Value, AccessError>>>;

/// A backend read other callers of the same key can join.
struct InFlight {
  id: u64,
  call: SharedRead,
}

/// One caller awaiting an in-flight read.
///
/// Dropping the last waiter before the read finishes unregisters the call,
/// so the next read of the key starts over instead of joining a future
/// nobody polls.
struct Waiter<'a> {
  ctx: &'a ResilienceContext,
  key: &'a str,
  id: u64,
  call: SharedRead,
}

impl Drop for Waiter<'_> {
  fn drop(&mut self) {
    // Completed calls have already unregistered themselves
    if self.call.strong_count().is_none() {
      return;
    }
    let mut in_flight = self.ctx.in_flight();
    let registered = in_flight.get(self.key).is_some_and(|c| c.id == self.id);
    // The map's handle and this one
    if registered && self.call.strong_count().is_some_and(|n| n <= 2) {
      in_flight.remove(self.key);
      debug!(key = self.key, "abandoned in-flight read");
    }
  }
}

/// Per-call read settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadOptions {
  /// Serve from and populate the cache
  pub use_cache: bool,
  /// Attempts allowed for the backend call, including the first
  pub retries: u32,
}

impl Default for ReadOptions {
  fn default() -> Self {
    Self {
      use_cache: true,
      retries: 3,
    }
  }
}

impl ReadOptions {
  /// Always go to the backend and leave the cache untouched.
  pub fn fresh() -> Self {
    Self {
      use_cache: false,
      ..Self::default()
    }
  }
}

/// How a write was accepted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum WriteOutcome {
  /// The backend applied the write.
  Applied { id: String },
  /// The write was persisted for replay once the connection returns.
  Queued { queue_id: u64 },
}

impl WriteOutcome {
  pub fn is_queued(&self) -> bool {
    matches!(self, WriteOutcome::Queued { .. })
  }
}

/// What a drain did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DrainReport {
  /// Operations applied and removed from the queue
  pub replayed: usize,
  /// Operations rejected with a terminal error and marked failed
  pub failed: usize,
  /// Operations that exhausted their retries and stay pending
  pub deferred: usize,
  /// Operations not attempted because an earlier one on the same resource
  /// is failed or deferred
  pub skipped: usize,
  /// The connection dropped before the queue was fully processed
  pub interrupted: bool,
  /// Another drain was running; it will make one more pass
  pub already_running: bool,
}

impl DrainReport {
  fn absorb(&mut self, pass: DrainReport) {
    self.replayed += pass.replayed;
    self.failed += pass.failed;
    self.deferred += pass.deferred;
    // Later passes revisit the same blocked operations
    self.skipped = pass.skipped;
    self.interrupted = pass.interrupted;
  }
}

pub struct ResilienceContext {
  backend: Arc<dyn Backend>,
  cache: Cache<Value>,
  limiter: RateLimiter,
  monitor: ConnectionMonitor,
  queue: OfflineQueue,
  retry: RetryPolicy,
  metrics: Metrics,
  replay_delay: Duration,
  in_flight: Mutex<HashMap<String, InFlight>>,
  next_read: AtomicU64,
  draining: AtomicBool,
  drain_requested: AtomicBool,
  _reconnect: Subscription,
}

impl ResilienceContext {
  /// Build a context over `backend`, keeping the offline queue in `store`.
  ///
  /// The connection starts online. Must be called inside a tokio runtime for
  /// reconnect drains to be scheduled automatically.
  pub fn new(
    config: &Config,
    backend: Arc<dyn Backend>,
    store: Arc<dyn KvStore>,
  ) -> Result<Arc<Self>, AccessError> {
    config
      .validate()
      .map_err(|e| AccessError::Config(e.to_string()))?;
    let queue = OfflineQueue::open(store, config.queue.max_size)
      .map_err(|e| queue_error(ErrorContext::new("open", "queue"), e))?;

    Ok(Arc::new_cyclic(|weak: &Weak<Self>| {
      let monitor = ConnectionMonitor::new(true);
      let reconnect = {
        let weak = weak.clone();
        monitor.on_change(move |online| {
          if online {
            if let Some(ctx) = weak.upgrade() {
              ctx.schedule_drain();
            }
          }
        })
      };

      Self {
        backend,
        cache: Cache::new(config.cache.max_size, config.cache.ttl()),
        limiter: RateLimiter::from_config(&config.rate_limit),
        monitor,
        queue,
        retry: RetryPolicy::from_config(&config.retry),
        metrics: Metrics::new(),
        replay_delay: config.queue.replay_delay(),
        in_flight: Mutex::new(HashMap::new()),
        next_read: AtomicU64::new(0),
        draining: AtomicBool::new(false),
        drain_requested: AtomicBool::new(false),
        _reconnect: reconnect,
      }
    }))
  }

  // ==========================================================================
  // Reads
  // ==========================================================================

  /// Read `key`, from the cache when possible, otherwise through `fetch`.
  ///
  /// A second read of a key whose fetch is still in flight awaits that fetch
  /// instead of starting another one, and receives the same value or error.
  /// A write that invalidates the key while the fetch runs detaches it: the
  /// result still reaches its waiters but is not cached, and later reads
  /// start a new fetch. Rate-limit denial is returned to the caller, never
  /// waited out.
  pub async fn read<F, Fut>(
    self: &Arc<Self>,
    key: &str,
    options: ReadOptions,
    fetch: F,
  ) -> Result<CacheResult<Value>, AccessError>
  where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, BackendError>> + Send + 'static,
  {
    if options.use_cache {
      if let Some(value) = self.cache.get(key) {
        self.metrics.cache_hit();
        debug!(key, "cache hit");
        return Ok(CacheResult::from_cache(value));
      }
    }
    self.metrics.cache_miss();

    // The in-flight entry is registered before the first suspension point
    let (mut waiter, joined) = {
      let mut in_flight = self.in_flight();
      match in_flight.get(key) {
        Some(entry) => (
          Waiter {
            ctx: self,
            key,
            id: entry.id,
            call: entry.call.clone(),
          },
          true,
        ),
        None => {
          if !self.limiter.try_acquire(1.0) {
            self.metrics.rate_limited();
            debug!(key, "read denied by rate limiter");
            return Err(AccessError::RateLimited {
              context: ErrorContext::new("read", key),
            });
          }
          let id = self.next_read.fetch_add(1, Ordering::Relaxed);
          let call = Arc::clone(self)
            .fetch_and_store(key.to_string(), id, options, fetch)
            .boxed()
            .shared();
          in_flight.insert(
            key.to_string(),
            InFlight {
              id,
              call: call.clone(),
            },
          );
          (
            Waiter {
              ctx: self,
              key,
              id,
              call,
            },
            false,
          )
        }
      }
    };

    if joined {
      self.metrics.dedup_join();
      debug!(key, "joined in-flight read");
      (&mut waiter.call).await.map(CacheResult::shared)
    } else {
      (&mut waiter.call).await.map(CacheResult::from_network)
    }
  }

  async fn fetch_and_store<F, Fut>(
    self: Arc<Self>,
    key: String,
    id: u64,
    options: ReadOptions,
    fetch: F,
  ) -> Result<Value, AccessError>
  where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, BackendError>> + Send,
  {
    let outcome = self
      .retry
      .execute_with(options.retries, self.retry.base_delay(), || {
        self.metrics.network_request();
        fetch()
      })
      .await;

    // Checked and cached under the in-flight lock so an invalidation lands
    // either before (detaching this call) or after (dropping the entry)
    let mut in_flight = self.in_flight();
    let current = in_flight.get(&key).is_some_and(|c| c.id == id);
    if current {
      in_flight.remove(&key);
    }
    match outcome {
      Ok(value) => {
        if options.use_cache && current {
          self.cache.set(key, value.clone());
        } else if options.use_cache {
          debug!(key = %key, "key invalidated during read, result not cached");
        }
        Ok(value)
      }
      Err(e) => {
        self.metrics.network_error();
        Err(retry_failure(ErrorContext::new("read", key.as_str()), e))
      }
    }
  }

  // ==========================================================================
  // Writes
  // ==========================================================================

  /// Apply `operation`, or queue it when it cannot be applied now.
  ///
  /// Offline writes, writes to a resource that still has queued operations
  /// ahead of it, and writes that exhaust their retries on a retryable
  /// error are persisted and reported as [`WriteOutcome::Queued`]. Terminal
  /// errors are returned. On success the entries named by `invalidation`
  /// are dropped from the cache.
  pub async fn write(
    self: &Arc<Self>,
    operation: Operation,
    invalidation: Invalidation,
  ) -> Result<WriteOutcome, AccessError> {
    let context = || ErrorContext::new(operation.name(), operation.context_key());

    if !self.monitor.is_online() {
      return self.enqueue(operation, invalidation);
    }
    if self.has_queued_ahead(&operation).map_err(|e| queue_error(context(), e))? {
      let outcome = self.enqueue(operation, invalidation)?;
      self.schedule_drain();
      return Ok(outcome);
    }

    if !self.limiter.try_acquire(1.0) {
      self.metrics.rate_limited();
      debug!(op = %operation.name(), "write denied by rate limiter");
      return Err(AccessError::RateLimited { context: context() });
    }

    let outcome = self
      .retry
      .execute(|| {
        self.metrics.network_request();
        operation.apply(self.backend.as_ref())
      })
      .await;

    match outcome {
      Ok(id) => {
        self.invalidate(&invalidation);
        debug!(op = %operation.name(), id = %id, "write applied");
        Ok(WriteOutcome::Applied { id })
      }
      Err(RetryError::Exhausted { attempts, error }) => {
        self.metrics.network_error();
        warn!(op = %operation.name(), attempts, %error, "write exhausted retries, queueing");
        self.enqueue(operation, invalidation)
      }
      Err(e) => {
        self.metrics.network_error();
        Err(retry_failure(context(), e))
      }
    }
  }

  fn enqueue(
    &self,
    operation: Operation,
    invalidation: Invalidation,
  ) -> Result<WriteOutcome, AccessError> {
    let context = ErrorContext::new(operation.name(), operation.context_key());
    let name = operation.name();
    let queue_id = self
      .queue
      .enqueue(operation, invalidation)
      .map_err(|e| queue_error(context, e))?;
    self.metrics.queued_write();
    info!(queue_id, op = %name, "write queued for replay");
    Ok(WriteOutcome::Queued { queue_id })
  }

  fn has_queued_ahead(&self, operation: &Operation) -> Result<bool, QueueError> {
    let Some(resource) = operation.resource_key() else {
      return Ok(false);
    };
    if self.queue.is_empty()? {
      return Ok(false);
    }
    Ok(
      self
        .queue
        .list_pending()?
        .iter()
        .any(|entry| entry.operation.resource_key().as_deref() == Some(resource.as_str())),
    )
  }

  fn invalidate(&self, invalidation: &Invalidation) {
    let mut in_flight = self.in_flight();
    in_flight.retain(|key, _| {
      !invalidation.keys.contains(key) && !invalidation.prefixes.iter().any(|p| key.starts_with(p))
    });
    for key in &invalidation.keys {
      self.cache.invalidate(key);
    }
    for prefix in &invalidation.prefixes {
      self.cache.invalidate_by_prefix(prefix);
    }
  }

  // ==========================================================================
  // Queue drain
  // ==========================================================================

  /// Replay queued operations in enqueue order.
  ///
  /// Only one drain runs at a time. A call made while another drain is
  /// running returns at once with `already_running` set, and the running
  /// drain makes one more pass before it finishes.
  pub async fn drain(self: &Arc<Self>) -> Result<DrainReport, AccessError> {
    self.drain_requested.store(true, Ordering::SeqCst);
    if self.draining.swap(true, Ordering::SeqCst) {
      debug!("drain already running, another pass requested");
      return Ok(DrainReport {
        already_running: true,
        ..DrainReport::default()
      });
    }

    let mut report = DrainReport::default();
    loop {
      while self.drain_requested.swap(false, Ordering::SeqCst) {
        match self.drain_pass().await {
          Ok(pass) => report.absorb(pass),
          Err(e) => {
            self.draining.store(false, Ordering::SeqCst);
            return Err(e);
          }
        }
        if !self.monitor.is_online() {
          break;
        }
      }
      self.draining.store(false, Ordering::SeqCst);

      // A request may have arrived after the last pass but before the flag
      // was cleared; its caller saw the drain as running
      if !self.monitor.is_online()
        || !self.drain_requested.load(Ordering::SeqCst)
        || self.draining.swap(true, Ordering::SeqCst)
      {
        break;
      }
    }

    info!(
      replayed = report.replayed,
      failed = report.failed,
      deferred = report.deferred,
      skipped = report.skipped,
      interrupted = report.interrupted,
      "drain finished"
    );
    Ok(report)
  }

  async fn drain_pass(&self) -> Result<DrainReport, AccessError> {
    let context = || ErrorContext::new("drain", "queue");
    let entries = self
      .queue
      .list_pending()
      .map_err(|e| queue_error(context(), e))?;

    let mut report = DrainReport::default();
    if entries.is_empty() {
      return Ok(report);
    }
    info!(pending = entries.len(), "draining offline queue");

    let mut blocked: HashSet<String> = HashSet::new();
    let mut replays = 0usize;
    for entry in entries {
      let resource = entry.operation.resource_key();
      if resource.as_ref().is_some_and(|r| blocked.contains(r)) {
        report.skipped += 1;
        continue;
      }
      if entry.status == OperationStatus::Failed {
        debug!(queue_id = entry.id, "failed operation blocks its resource");
        blocked.extend(resource);
        report.skipped += 1;
        continue;
      }

      if replays > 0 {
        tokio::time::sleep(self.replay_delay).await;
      }
      if !self.monitor.is_online() {
        info!(queue_id = entry.id, "connection lost, stopping drain");
        report.interrupted = true;
        break;
      }
      replays += 1;

      if !self.limiter.acquire(1.0).await {
        // Only possible when a single token exceeds the bucket size
        warn!(queue_id = entry.id, "rate limiter cannot admit replay");
        blocked.extend(resource);
        report.deferred += 1;
        continue;
      }

      self
        .queue
        .mark_processing(entry.id)
        .map_err(|e| queue_error(context(), e))?;
      let outcome = self
        .retry
        .execute(|| {
          self.metrics.network_request();
          entry.operation.apply(self.backend.as_ref())
        })
        .await;

      match outcome {
        Ok(id) => {
          self
            .queue
            .remove(entry.id)
            .map_err(|e| queue_error(context(), e))?;
          self.invalidate(&entry.invalidation);
          self.metrics.replayed_write();
          report.replayed += 1;
          info!(queue_id = entry.id, op = %entry.operation.name(), id = %id, "replayed queued operation");
        }
        Err(RetryError::Terminal { error, .. }) => {
          self.metrics.network_error();
          self
            .queue
            .mark_failed(entry.id, &error.to_string())
            .map_err(|e| queue_error(context(), e))?;
          blocked.extend(resource);
          report.failed += 1;
          warn!(queue_id = entry.id, %error, "queued operation rejected");
        }
        Err(RetryError::Exhausted { error, .. }) => {
          self.metrics.network_error();
          self
            .queue
            .mark_deferred(entry.id, &error.to_string())
            .map_err(|e| queue_error(context(), e))?;
          blocked.extend(resource);
          report.deferred += 1;
          warn!(queue_id = entry.id, %error, "queued operation deferred");
        }
      }
    }
    Ok(report)
  }

  /// Start a drain in the background of the current tokio runtime.
  fn schedule_drain(self: &Arc<Self>) {
    match tokio::runtime::Handle::try_current() {
      Ok(handle) => {
        let ctx = Arc::clone(self);
        handle.spawn(async move {
          if let Err(e) = ctx.drain().await {
            warn!(error = %e, "background drain failed");
          }
        });
      }
      Err(_) => warn!("no async runtime, queue drain not scheduled"),
    }
  }

  // ==========================================================================
  // Connection, metrics and accessors
  // ==========================================================================

  pub fn is_online(&self) -> bool {
    self.monitor.is_online()
  }

  /// Feed a connectivity signal; going online schedules a drain.
  pub fn set_online(&self, online: bool) -> bool {
    self.monitor.set_online(online)
  }

  pub fn on_connection_change<F>(&self, callback: F) -> Subscription
  where
    F: Fn(bool) + Send + Sync + 'static,
  {
    self.monitor.on_change(callback)
  }

  pub fn metrics(&self) -> Result<MetricsSnapshot, AccessError> {
    let depth = self
      .queue
      .len()
      .map_err(|e| queue_error(ErrorContext::new("metrics", "queue"), e))?;
    Ok(self.metrics.snapshot(depth))
  }

  pub fn reset_metrics(&self) {
    self.metrics.reset();
    info!("metrics reset");
  }

  pub fn backend(&self) -> &Arc<dyn Backend> {
    &self.backend
  }

  pub fn cache(&self) -> &Cache<Value> {
    &self.cache
  }

  pub fn queue(&self) -> &OfflineQueue {
    &self.queue
  }

  pub fn limiter(&self) -> &RateLimiter {
    &self.limiter
  }

  fn in_flight(&self) -> MutexGuard<'_, HashMap<String, InFlight>> {
    self
      .in_flight
      .lock()
      .unwrap_or_else(|poisoned| poisoned.into_inner())
  }
}

fn retry_failure(context: ErrorContext, e: RetryError) -> AccessError {
  match e {
    RetryError::Terminal { error, .. } => AccessError::Terminal {
      context,
      source: error,
    },
    RetryError::Exhausted { attempts, error } => AccessError::RetryExhausted {
      context,
      attempts,
      source: error,
    },
  }
}

fn queue_error(context: ErrorContext, e: QueueError) -> AccessError {
  match e {
    QueueError::Full { capacity } => AccessError::QueueFull { context, capacity },
    QueueError::Store(source) => AccessError::storage(context, source),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::backend::{CallKind, Document, Fault, MemoryBackend, Query};
  use crate::cache::{item_key, CacheSource};
  use crate::error::ErrorCode;
  use crate::queue::MemoryKvStore;
  use serde_json::json;

  fn config() -> Config {
    let mut config = Config::default();
    config.rate_limit.max_tokens = 100.0;
    config.rate_limit.refill_rate = 10.0;
    config.retry.base_delay_ms = 100;
    config.retry.jitter = false;
    config.queue.replay_delay_ms = 50;
    config
  }

  fn setup(config: &Config) -> (Arc<ResilienceContext>, Arc<MemoryBackend>) {
    let backend = Arc::new(MemoryBackend::new());
    backend.insert("products", "p1", json!({"name": "Lamp", "price": 400}));
    let ctx = ResilienceContext::new(config, backend.clone(), Arc::new(MemoryKvStore::new())).unwrap();
    (ctx, backend)
  }

  fn fetch_product(
    backend: &Arc<MemoryBackend>,
    id: &'static str,
  ) -> impl Fn() -> BoxFuture<'static, Result<Value, BackendError>> + Send + Sync + 'static {
    let backend = Arc::clone(backend);
    move || {
      let backend = Arc::clone(&backend);
      async move {
        let doc = backend.fetch_one("products", id).await?;
        Ok(doc.map(|d| serde_json::to_value(d).unwrap()).unwrap_or(Value::Null))
      }
      .boxed()
    }
  }

  /// Takes the document at once, then is slow to hand it back.
  fn fetch_product_slowly(
    backend: &Arc<MemoryBackend>,
    id: &'static str,
  ) -> impl Fn() -> BoxFuture<'static, Result<Value, BackendError>> + Send + Sync + 'static {
    let fetch = fetch_product(backend, id);
    move || {
      let fetched = fetch();
      async move {
        let value = fetched.await?;
        tokio::time::sleep(Duration::from_millis(500)).await;
        Ok(value)
      }
      .boxed()
    }
  }

  fn fetch_all(
    backend: &Arc<MemoryBackend>,
  ) -> impl Fn() -> BoxFuture<'static, Result<Value, BackendError>> + Send + Sync + 'static {
    let backend = Arc::clone(backend);
    move || {
      let backend = Arc::clone(&backend);
      async move {
        let docs: Vec<Document> = backend.fetch_many("products", &Query::new()).await?;
        Ok(serde_json::to_value(docs).unwrap())
      }
      .boxed()
    }
  }

  #[tokio::test(start_paused = true)]
  async fn test_read_populates_and_hits_cache() {
    let (ctx, backend) = setup(&config());
    let key = item_key("products", "p1");

    let first = ctx
      .read(&key, ReadOptions::default(), fetch_product(&backend, "p1"))
      .await
      .unwrap();
    assert_eq!(first.source, CacheSource::Network);
    assert_eq!(first.data["price"], 400);

    let second = ctx
      .read(&key, ReadOptions::default(), fetch_product(&backend, "p1"))
      .await
      .unwrap();
    assert!(second.is_cached());
    assert_eq!(backend.calls(CallKind::FetchOne), 1);

    let metrics = ctx.metrics().unwrap();
    assert_eq!(metrics.cache_hits, 1);
    assert_eq!(metrics.cache_misses, 1);
    assert_eq!(metrics.network_requests, 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_fresh_read_bypasses_cache() {
    let (ctx, backend) = setup(&config());
    let key = item_key("products", "p1");
    ctx
      .read(&key, ReadOptions::default(), fetch_product(&backend, "p1"))
      .await
      .unwrap();
    let fresh = ctx
      .read(&key, ReadOptions::fresh(), fetch_product(&backend, "p1"))
      .await
      .unwrap();
    assert_eq!(fresh.source, CacheSource::Network);
    assert_eq!(backend.calls(CallKind::FetchOne), 2);
  }

  #[tokio::test(start_paused = true)]
  async fn test_concurrent_reads_share_one_call() {
    let (ctx, backend) = setup(&config());
    backend.set_latency(Some(Duration::from_millis(200)));

    let (a, b) = tokio::join!(
      ctx.read("products:all", ReadOptions::default(), fetch_all(&backend)),
      ctx.read("products:all", ReadOptions::default(), fetch_all(&backend)),
    );
    let (a, b) = (a.unwrap(), b.unwrap());

    assert_eq!(backend.calls(CallKind::FetchMany), 1);
    assert_eq!(a.data, b.data);
    assert_eq!(a.source, CacheSource::Network);
    assert_eq!(b.source, CacheSource::Shared);
    assert_eq!(ctx.metrics().unwrap().dedup_joins, 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_shared_read_error_reaches_every_caller() {
    let (ctx, backend) = setup(&config());
    backend.set_latency(Some(Duration::from_millis(200)));
    backend.push_fault(Fault::on(CallKind::FetchMany, ErrorCode::PermissionDenied));

    let (a, b) = tokio::join!(
      ctx.read("products:all", ReadOptions::default(), fetch_all(&backend)),
      ctx.read("products:all", ReadOptions::default(), fetch_all(&backend)),
    );
    assert!(matches!(a, Err(AccessError::Terminal { .. })));
    assert!(matches!(b, Err(AccessError::Terminal { .. })));
    assert_eq!(backend.calls(CallKind::FetchMany), 1);

    // The failed call is no longer in flight
    let retry = ctx
      .read("products:all", ReadOptions::default(), fetch_all(&backend))
      .await
      .unwrap();
    assert_eq!(retry.source, CacheSource::Network);
  }

  #[tokio::test(start_paused = true)]
  async fn test_rate_limit_denial_is_surfaced() {
    let mut config = config();
    config.rate_limit.max_tokens = 1.0;
    config.rate_limit.refill_rate = 0.01;
    let (ctx, backend) = setup(&config);

    ctx
      .read("products:all", ReadOptions::default(), fetch_all(&backend))
      .await
      .unwrap();
    let err = ctx
      .read(&item_key("products", "p1"), ReadOptions::default(), fetch_product(&backend, "p1"))
      .await
      .unwrap_err();

    assert!(matches!(err, AccessError::RateLimited { .. }));
    assert!(err.is_retryable());
    assert_eq!(err.context().unwrap().key, "products:p1");
    assert_eq!(ctx.metrics().unwrap().rate_limit_rejections, 1);
    assert_eq!(backend.total_calls(), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_transient_read_failure_exhausts_retries() {
    let (ctx, backend) = setup(&config());
    backend.fail_always(Some(ErrorCode::Unavailable));

    let options = ReadOptions {
      use_cache: true,
      retries: 2,
    };
    let err = ctx
      .read("products:all", options, fetch_all(&backend))
      .await
      .unwrap_err();

    assert!(matches!(err, AccessError::RetryExhausted { attempts: 2, .. }));
    assert_eq!(err.backend_error().unwrap().code, ErrorCode::Unavailable);
    let metrics = ctx.metrics().unwrap();
    assert_eq!(metrics.network_requests, 2);
    assert_eq!(metrics.network_errors, 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_online_write_invalidates_cached_reads() {
    let (ctx, backend) = setup(&config());
    let key = item_key("products", "p1");
    ctx
      .read(&key, ReadOptions::default(), fetch_product(&backend, "p1"))
      .await
      .unwrap();
    ctx
      .read("products?all", ReadOptions::default(), fetch_all(&backend))
      .await
      .unwrap();

    let outcome = ctx
      .write(
        Operation::update("products", "p1", json!({"price": 450})),
        Invalidation::for_write("products", Some("p1")),
      )
      .await
      .unwrap();
    assert_eq!(outcome, WriteOutcome::Applied { id: "p1".into() });
    assert!(ctx.cache().get(&key).is_none());
    assert!(ctx.cache().get("products?all").is_none());

    let after = ctx
      .read(&key, ReadOptions::default(), fetch_product(&backend, "p1"))
      .await
      .unwrap();
    assert_eq!(after.data["price"], 450);
  }

  #[tokio::test(start_paused = true)]
  async fn test_terminal_write_error_is_not_queued() {
    let (ctx, backend) = setup(&config());
    backend.push_fault(Fault::on(CallKind::Update, ErrorCode::InvalidArgument));

    let err = ctx
      .write(
        Operation::update("products", "p1", json!({"price": -1})),
        Invalidation::none(),
      )
      .await
      .unwrap_err();
    assert!(matches!(err, AccessError::Terminal { .. }));
    assert_eq!(err.context().unwrap().operation, "write:update");
    assert!(ctx.queue().is_empty().unwrap());
  }

  #[tokio::test(start_paused = true)]
  async fn test_online_write_exhausting_retries_is_queued() {
    let (ctx, backend) = setup(&config());
    backend.fail_always(Some(ErrorCode::Unavailable));

    let outcome = ctx
      .write(
        Operation::update("products", "p1", json!({"price": 500})),
        Invalidation::for_write("products", Some("p1")),
      )
      .await
      .unwrap();
    assert!(outcome.is_queued());
    assert_eq!(ctx.queue().len().unwrap(), 1);
    assert_eq!(backend.calls(CallKind::Update), 3);

    let metrics = ctx.metrics().unwrap();
    assert_eq!(metrics.network_errors, 1);
    assert_eq!(metrics.queued_writes, 1);

    backend.fail_always(None);
    let report = ctx.drain().await.unwrap();
    assert_eq!(report.replayed, 1);
    assert_eq!(backend.document("products", "p1").unwrap().data["price"], 500);
  }

  #[tokio::test(start_paused = true)]
  async fn test_exhausted_write_into_full_queue_reports_queue_full() {
    let mut config = config();
    config.queue.max_size = 1;
    let (ctx, backend) = setup(&config);
    ctx.set_online(false);
    ctx
      .write(Operation::delete("products", "p2"), Invalidation::none())
      .await
      .unwrap();
    ctx.monitor.force_state(true);

    backend.fail_always(Some(ErrorCode::DeadlineExceeded));
    let err = ctx
      .write(
        Operation::update("products", "p1", json!({"price": 500})),
        Invalidation::none(),
      )
      .await
      .unwrap_err();
    assert!(matches!(err, AccessError::QueueFull { capacity: 1, .. }));
    assert_eq!(ctx.queue().len().unwrap(), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_write_during_slow_read_keeps_stale_value_out_of_cache() {
    let (ctx, backend) = setup(&config());
    let key = item_key("products", "p1");

    let writer = async {
      tokio::time::sleep(Duration::from_millis(10)).await;
      ctx
        .write(
          Operation::update("products", "p1", json!({"price": 500})),
          Invalidation::for_write("products", Some("p1")),
        )
        .await
    };
    let later_reader = async {
      tokio::time::sleep(Duration::from_millis(20)).await;
      ctx
        .read(&key, ReadOptions::default(), fetch_product(&backend, "p1"))
        .await
    };
    let (stale, written, later) = tokio::join!(
      ctx.read(&key, ReadOptions::default(), fetch_product_slowly(&backend, "p1")),
      writer,
      later_reader
    );

    assert_eq!(stale.unwrap().data["price"], 400);
    assert!(!written.unwrap().is_queued());
    let later = later.unwrap();
    assert_eq!(later.source, CacheSource::Network);
    assert_eq!(later.data["price"], 500);

    let cached = ctx
      .read(&key, ReadOptions::default(), fetch_product(&backend, "p1"))
      .await
      .unwrap();
    assert!(cached.is_cached());
    assert_eq!(cached.data["price"], 500);
    assert_eq!(backend.calls(CallKind::FetchOne), 2);
  }

  #[tokio::test(start_paused = true)]
  async fn test_abandoned_read_is_not_joined() {
    let (ctx, backend) = setup(&config());
    backend.set_latency(Some(Duration::from_millis(200)));

    let abandoned = tokio::time::timeout(
      Duration::from_millis(50),
      ctx.read("products:all", ReadOptions::default(), fetch_all(&backend)),
    )
    .await;
    assert!(abandoned.is_err());
    assert!(ctx.in_flight().is_empty());

    let next = ctx
      .read("products:all", ReadOptions::default(), fetch_all(&backend))
      .await
      .unwrap();
    assert_eq!(next.source, CacheSource::Network);
    assert_eq!(backend.calls(CallKind::FetchMany), 2);
    assert_eq!(ctx.metrics().unwrap().dedup_joins, 0);
  }

  #[tokio::test(start_paused = true)]
  async fn test_offline_write_is_queued() {
    let (ctx, backend) = setup(&config());
    ctx.set_online(false);

    let outcome = ctx
      .write(
        Operation::update("products", "p1", json!({"price": 500})),
        Invalidation::none(),
      )
      .await
      .unwrap();
    assert!(outcome.is_queued());
    assert_eq!(backend.total_calls(), 0);

    let metrics = ctx.metrics().unwrap();
    assert_eq!(metrics.queued_writes, 1);
    assert_eq!(metrics.queue_depth, 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_full_queue_rejects_write() {
    let mut config = config();
    config.queue.max_size = 1;
    let (ctx, _backend) = setup(&config);
    ctx.set_online(false);

    ctx
      .write(Operation::delete("products", "p1"), Invalidation::none())
      .await
      .unwrap();
    let err = ctx
      .write(Operation::delete("products", "p2"), Invalidation::none())
      .await
      .unwrap_err();
    assert!(matches!(err, AccessError::QueueFull { capacity: 1, .. }));
    assert_eq!(err.context().unwrap().key, "products:p2");
  }

  #[tokio::test(start_paused = true)]
  async fn test_terminal_failure_blocks_later_operations_on_same_resource() {
    let (ctx, backend) = setup(&config());
    backend.insert("products", "p2", json!({"price": 10}));
    ctx.set_online(false);

    let a = Operation::update("products", "p1", json!({"price": 1}));
    let b = Operation::update("products", "p1", json!({"price": 2}));
    let c = Operation::update("products", "p2", json!({"price": 3}));
    for op in [a, b, c] {
      ctx.write(op, Invalidation::none()).await.unwrap();
    }

    backend.push_fault(Fault::on(CallKind::Update, ErrorCode::PermissionDenied).for_id("p1"));
    // Flip the flag without the listener so the drain below is the only one
    ctx.monitor.force_state(true);
    let report = ctx.drain().await.unwrap();

    assert_eq!(report.failed, 1);
    assert_eq!(report.skipped, 1);
    assert_eq!(report.replayed, 1);

    let pending = ctx.queue().list_pending().unwrap();
    assert_eq!(pending.len(), 2);
    assert_eq!(pending[0].status, OperationStatus::Failed);
    assert_eq!(pending[0].operation.payload["price"], 1);
    assert_eq!(pending[1].status, OperationStatus::Pending);
    assert_eq!(pending[1].operation.payload["price"], 2);

    assert_eq!(backend.document("products", "p1").unwrap().data["price"], 400);
    assert_eq!(backend.document("products", "p2").unwrap().data["price"], 3);
  }

  #[tokio::test(start_paused = true)]
  async fn test_drain_replays_same_resource_in_order() {
    let (ctx, backend) = setup(&config());
    ctx.set_online(false);
    ctx
      .write(
        Operation::update("products", "p1", json!({"price": 1})),
        Invalidation::none(),
      )
      .await
      .unwrap();
    ctx
      .write(
        Operation::update("products", "p1", json!({"price": 2})),
        Invalidation::none(),
      )
      .await
      .unwrap();

    ctx.monitor.force_state(true);
    let report = ctx.drain().await.unwrap();
    assert_eq!(report.replayed, 2);
    assert!(ctx.queue().is_empty().unwrap());
    assert_eq!(backend.document("products", "p1").unwrap().data["price"], 2);
    assert_eq!(ctx.metrics().unwrap().replayed_writes, 2);
  }

  #[tokio::test(start_paused = true)]
  async fn test_drain_spaces_replays_by_replay_delay() {
    let config = config();
    let (ctx, _backend) = setup(&config);
    ctx.set_online(false);
    for id in ["p1", "p2", "p3"] {
      ctx
        .write(Operation::delete("products", id), Invalidation::none())
        .await
        .unwrap();
    }
    ctx.monitor.force_state(true);

    let started = tokio::time::Instant::now();
    let report = ctx.drain().await.unwrap();
    let elapsed = started.elapsed();

    assert_eq!(report.replayed, 3);
    let delay = config.queue.replay_delay();
    // Two gaps between three replays, none before the first
    assert!(elapsed >= delay * 2, "elapsed {:?}", elapsed);
    assert!(elapsed < delay * 3, "elapsed {:?}", elapsed);
  }

  #[tokio::test(start_paused = true)]
  async fn test_exhausted_replay_stays_pending() {
    let (ctx, backend) = setup(&config());
    ctx.set_online(false);
    ctx
      .write(Operation::delete("products", "p1"), Invalidation::none())
      .await
      .unwrap();

    backend.fail_always(Some(ErrorCode::Unavailable));
    ctx.monitor.force_state(true);
    let report = ctx.drain().await.unwrap();
    assert_eq!(report.deferred, 1);

    let pending = ctx.queue().list_pending().unwrap();
    assert_eq!(pending[0].status, OperationStatus::Pending);
    assert_eq!(pending[0].attempts, 1);
    assert!(pending[0].last_error.as_deref().unwrap().contains("unavailable"));
  }

  #[tokio::test(start_paused = true)]
  async fn test_drain_stops_when_offline() {
    let (ctx, backend) = setup(&config());
    ctx.set_online(false);
    ctx
      .write(Operation::delete("products", "p1"), Invalidation::none())
      .await
      .unwrap();

    let report = ctx.drain().await.unwrap();
    assert!(report.interrupted);
    assert_eq!(report.replayed, 0);
    assert_eq!(ctx.queue().len().unwrap(), 1);
    assert_eq!(backend.total_calls(), 0);
  }

  #[tokio::test(start_paused = true)]
  async fn test_overlapping_drain_requests_another_pass() {
    let (ctx, _backend) = setup(&config());
    ctx.set_online(false);
    for id in ["p1", "p2"] {
      ctx
        .write(Operation::delete("products", id), Invalidation::none())
        .await
        .unwrap();
    }
    ctx.monitor.force_state(true);

    let (first, second) = tokio::join!(ctx.drain(), ctx.drain());
    let (first, second) = (first.unwrap(), second.unwrap());
    assert!(second.already_running);
    assert!(!first.already_running);
    assert_eq!(first.replayed, 2);
    assert!(ctx.queue().is_empty().unwrap());
  }

  #[tokio::test(start_paused = true)]
  async fn test_online_write_behind_queued_operation_is_queued() {
    let (ctx, backend) = setup(&config());
    ctx.set_online(false);
    ctx
      .write(
        Operation::update("products", "p1", json!({"price": 1})),
        Invalidation::none(),
      )
      .await
      .unwrap();
    ctx.monitor.force_state(true);

    let outcome = ctx
      .write(
        Operation::update("products", "p1", json!({"price": 2})),
        Invalidation::none(),
      )
      .await
      .unwrap();
    assert!(outcome.is_queued());

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(ctx.queue().is_empty().unwrap());
    assert_eq!(backend.document("products", "p1").unwrap().data["price"], 2);
  }

  #[tokio::test(start_paused = true)]
  async fn test_offline_write_then_reconnect_end_to_end() {
    let (ctx, backend) = setup(&config());
    let changes = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&changes);
    let _subscription = ctx.on_connection_change(move |online| seen.lock().unwrap().push(online));

    ctx.set_online(false);
    let outcome = ctx
      .write(
        Operation::update("products", "p1", json!({"price": 500})),
        Invalidation::for_write("products", Some("p1")),
      )
      .await
      .unwrap();
    assert!(matches!(outcome, WriteOutcome::Queued { .. }));
    assert_eq!(ctx.queue().list_pending().unwrap().len(), 1);

    assert!(ctx.set_online(true));
    for _ in 0..50 {
      if ctx.queue().is_empty().unwrap() {
        break;
      }
      tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert!(ctx.queue().list_pending().unwrap().is_empty());

    let fresh = ctx
      .read(&item_key("products", "p1"), ReadOptions::fresh(), fetch_product(&backend, "p1"))
      .await
      .unwrap();
    assert_eq!(fresh.data["price"], 500);
    assert_eq!(*changes.lock().unwrap(), vec![false, true]);
  }
}
