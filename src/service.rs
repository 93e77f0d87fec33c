//! Typed data access over one collection.
//!
//! Wraps the shared [`ResilienceContext`] so domain code works with records
//! instead of JSON, while reads and writes keep the context's caching,
//! deduplication, rate limiting, retry and offline queueing.

use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::marker::PhantomData;
use std::sync::Arc;

use crate::backend::{Backend, Query};
use crate::cache::{item_key, query_key, CacheResult, Invalidation};
use crate::context::{ReadOptions, ResilienceContext, WriteOutcome};
use crate::error::{AccessError, BackendError, ErrorCode, ErrorContext};
use crate::queue::Operation;

/// A record stored in a named collection.
///
/// Records serialize with their document id in an `id` field. An empty id
/// is omitted when creating, letting the backend assign one.
pub trait Record: Serialize + DeserializeOwned + Send + Sync + 'static {
  const COLLECTION: &'static str;
}

pub struct DataAccessService<T> {
  ctx: Arc<ResilienceContext>,
  _record: PhantomData<fn() -> T>,
}

impl<T> Clone for DataAccessService<T> {
  fn clone(&self) -> Self {
    Self {
      ctx: Arc::clone(&self.ctx),
      _record: PhantomData,
    }
  }
}

impl<T: Record> DataAccessService<T> {
  pub fn new(ctx: Arc<ResilienceContext>) -> Self {
    Self {
      ctx,
      _record: PhantomData,
    }
  }

  pub fn collection(&self) -> &'static str {
    T::COLLECTION
  }

  pub fn context(&self) -> &Arc<ResilienceContext> {
    &self.ctx
  }

  /// Records matching `query`, cached under the query's signature.
  pub async fn list(&self, query: &Query) -> Result<CacheResult<Vec<T>>, AccessError> {
    self.list_with(query, ReadOptions::default()).await
  }

  pub async fn list_with(
    &self,
    query: &Query,
    options: ReadOptions,
  ) -> Result<CacheResult<Vec<T>>, AccessError> {
    let key = query_key(T::COLLECTION, query);
    let backend = Arc::clone(self.ctx.backend());
    let query = query.clone();

    let result = self
      .ctx
      .read(&key, options, move || {
        let backend = Arc::clone(&backend);
        let query = query.clone();
        async move {
          let docs = backend.fetch_many(T::COLLECTION, &query).await?;
          serde_json::to_value(docs).map_err(encode_error)
        }
      })
      .await?;

    decode(result, ErrorContext::new("list", key))
  }

  /// One record by id; `None` when the document does not exist.
  pub async fn get(&self, id: &str) -> Result<CacheResult<Option<T>>, AccessError> {
    self.get_with(id, ReadOptions::default()).await
  }

  pub async fn get_with(
    &self,
    id: &str,
    options: ReadOptions,
  ) -> Result<CacheResult<Option<T>>, AccessError> {
    let key = item_key(T::COLLECTION, id);
    let backend = Arc::clone(self.ctx.backend());
    let id = id.to_string();

    let result = self
      .ctx
      .read(&key, options, move || {
        let backend = Arc::clone(&backend);
        let id = id.clone();
        async move {
          let doc = backend.fetch_one(T::COLLECTION, &id).await?;
          serde_json::to_value(doc).map_err(encode_error)
        }
      })
      .await?;

    decode(result, ErrorContext::new("get", key))
  }

  pub async fn create(&self, record: &T) -> Result<WriteOutcome, AccessError> {
    let context = || ErrorContext::new("write:create", T::COLLECTION);
    let mut payload =
      serde_json::to_value(record).map_err(|e| AccessError::serialization(context(), e))?;
    if let Value::Object(fields) = &mut payload {
      fields.remove("id");
    }

    self
      .ctx
      .write(
        Operation::create(T::COLLECTION, payload),
        Invalidation::for_write(T::COLLECTION, None),
      )
      .await
  }

  /// Merge `patch` into the record with `id`.
  pub async fn update(&self, id: &str, patch: Value) -> Result<WriteOutcome, AccessError> {
    self
      .ctx
      .write(
        Operation::update(T::COLLECTION, id, patch),
        Invalidation::for_write(T::COLLECTION, Some(id)),
      )
      .await
  }

  pub async fn delete(&self, id: &str) -> Result<WriteOutcome, AccessError> {
    self
      .ctx
      .write(
        Operation::delete(T::COLLECTION, id),
        Invalidation::for_write(T::COLLECTION, Some(id)),
      )
      .await
  }
}

fn encode_error(e: serde_json::Error) -> BackendError {
  BackendError::new(ErrorCode::Internal, format!("Failed to encode documents: {}", e))
}

fn decode<U: DeserializeOwned>(
  result: CacheResult<Value>,
  context: ErrorContext,
) -> Result<CacheResult<U>, AccessError> {
  let source = result.source;
  let data = serde_json::from_value(result.data)
    .map_err(|e| AccessError::serialization(context, e))?;
  Ok(CacheResult { data, source })
}
