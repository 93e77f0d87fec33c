//! Resilient data access for a storefront backed by a remote document store.
//!
//! A [`ResilienceContext`] owns the shared cache, rate limiter, connection
//! monitor, offline queue and retry policy. Domain code reads and writes
//! through [`DataAccessService`], one per record type.

pub mod backend;
pub mod cache;
pub mod config;
pub mod connection;
pub mod context;
pub mod domain;
pub mod error;
pub mod metrics;
pub mod queue;
pub mod rate_limit;
pub mod retry;
pub mod service;

pub use backend::{Backend, Direction, Document, Filter, FilterOp, HttpBackend, MemoryBackend, Query};
pub use cache::{CacheResult, CacheSource, Invalidation};
pub use config::Config;
pub use connection::{ConnectionMonitor, Subscription};
pub use context::{DrainReport, ReadOptions, ResilienceContext, WriteOutcome};
pub use domain::{Contact, Faq, Product};
pub use error::{AccessError, BackendError, ErrorCode, ErrorContext, StoreError};
pub use metrics::MetricsSnapshot;
pub use queue::{
  KvStore, MemoryKvStore, OfflineQueue, Operation, OperationKind, OperationStatus, QueueError,
  QueuedOperation, SqliteKvStore,
};
pub use service::{DataAccessService, Record};
