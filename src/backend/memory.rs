//! In-process document store.
//!
//! Behaves like the remote store for the calls the data-access layer makes,
//! and lets callers script failures and latency.

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use super::{Backend, Direction, Document, Filter, FilterOp, Query};
use crate::error::{BackendError, ErrorCode};

/// Backend call kinds, used to target faults and read counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallKind {
  FetchMany,
  FetchOne,
  Create,
  Update,
  Delete,
}

const CALL_KINDS: usize = 5;

impl CallKind {
  fn index(self) -> usize {
    match self {
      CallKind::FetchMany => 0,
      CallKind::FetchOne => 1,
      CallKind::Create => 2,
      CallKind::Update => 3,
      CallKind::Delete => 4,
    }
  }
}

/// A scripted one-shot failure.
#[derive(Debug, Clone)]
pub struct Fault {
  kind: Option<CallKind>,
  id: Option<String>,
  error: BackendError,
}

impl Fault {
  /// Fail the next call of any kind.
  pub fn any(code: ErrorCode) -> Self {
    Self {
      kind: None,
      id: None,
      error: BackendError::new(code, "injected fault"),
    }
  }

  /// Fail the next call of the given kind.
  pub fn on(kind: CallKind, code: ErrorCode) -> Self {
    Self {
      kind: Some(kind),
      ..Self::any(code)
    }
  }

  /// Only match calls targeting this document id.
  pub fn for_id(mut self, id: impl Into<String>) -> Self {
    self.id = Some(id.into());
    self
  }

  fn matches(&self, kind: CallKind, id: Option<&str>) -> bool {
    self.kind.map_or(true, |k| k == kind)
      && self.id.as_deref().map_or(true, |want| Some(want) == id)
  }
}

type Collections = HashMap<String, BTreeMap<String, Map<String, Value>>>;

/// Document store held in memory.
#[derive(Default)]
pub struct MemoryBackend {
  collections: Mutex<Collections>,
  faults: Mutex<VecDeque<Fault>>,
  persistent_failure: Mutex<Option<BackendError>>,
  latency: Mutex<Option<Duration>>,
  calls: [AtomicUsize; CALL_KINDS],
  next_id: AtomicU64,
}

impl MemoryBackend {
  pub fn new() -> Self {
    Self::default()
  }

  /// Seed a document directly, bypassing faults and counters.
  pub fn insert(&self, collection: &str, id: &str, data: Value) {
    let fields = match data {
      Value::Object(map) => map,
      other => {
        let mut map = Map::new();
        map.insert("value".to_string(), other);
        map
      }
    };
    lock(&self.collections)
      .entry(collection.to_string())
      .or_default()
      .insert(id.to_string(), fields);
  }

  /// Read a document directly, bypassing faults and counters.
  pub fn document(&self, collection: &str, id: &str) -> Option<Document> {
    lock(&self.collections)
      .get(collection)
      .and_then(|docs| docs.get(id))
      .map(|fields| Document::new(id, fields.clone()))
  }

  /// Queue a one-shot fault; faults are consumed in order by matching calls.
  pub fn push_fault(&self, fault: Fault) {
    lock(&self.faults).push_back(fault);
  }

  /// Fail every call with `code` until cleared with `None`.
  pub fn fail_always(&self, code: Option<ErrorCode>) {
    *lock(&self.persistent_failure) =
      code.map(|c| BackendError::new(c, "backend failing persistently"));
  }

  /// Delay every call by `latency`.
  pub fn set_latency(&self, latency: Option<Duration>) {
    *lock(&self.latency) = latency;
  }

  pub fn calls(&self, kind: CallKind) -> usize {
    self.calls[kind.index()].load(AtomicOrdering::SeqCst)
  }

  pub fn total_calls(&self) -> usize {
    self
      .calls
      .iter()
      .map(|c| c.load(AtomicOrdering::SeqCst))
      .sum()
  }

  /// Count the call, apply latency, then surface any matching fault.
  async fn begin(&self, kind: CallKind, id: Option<&str>) -> Result<(), BackendError> {
    self.calls[kind.index()].fetch_add(1, AtomicOrdering::SeqCst);

    let latency = *lock(&self.latency);
    if let Some(latency) = latency {
      tokio::time::sleep(latency).await;
    }

    if let Some(err) = lock(&self.persistent_failure).clone() {
      return Err(err);
    }

    let mut faults = lock(&self.faults);
    if let Some(pos) = faults.iter().position(|f| f.matches(kind, id)) {
      if let Some(fault) = faults.remove(pos) {
        return Err(fault.error);
      }
    }
    Ok(())
  }
}

#[async_trait]
impl Backend for MemoryBackend {
  async fn fetch_many(&self, collection: &str, query: &Query) -> Result<Vec<Document>, BackendError> {
    self.begin(CallKind::FetchMany, None).await?;

    let collections = lock(&self.collections);
    let mut docs: Vec<Document> = collections
      .get(collection)
      .map(|docs| {
        docs
          .iter()
          .filter(|(id, fields)| query.filters.iter().all(|f| matches_filter(id, fields, f)))
          .map(|(id, fields)| Document::new(id.clone(), fields.clone()))
          .collect()
      })
      .unwrap_or_default();
    drop(collections);

    if let Some(order) = &query.order_by {
      docs.sort_by(|a, b| {
        let ord = match (field(&a.id, &a.data, &order.field), field(&b.id, &b.data, &order.field)) {
          (Some(x), Some(y)) => compare(&x, &y).unwrap_or(Ordering::Equal),
          // Documents without the field sort last in either direction
          (Some(_), None) => return Ordering::Less,
          (None, Some(_)) => return Ordering::Greater,
          (None, None) => Ordering::Equal,
        };
        match order.direction {
          Direction::Asc => ord,
          Direction::Desc => ord.reverse(),
        }
      });
    }
    if let Some(limit) = query.limit {
      docs.truncate(limit);
    }
    Ok(docs)
  }

  async fn fetch_one(&self, collection: &str, id: &str) -> Result<Option<Document>, BackendError> {
    self.begin(CallKind::FetchOne, Some(id)).await?;
    Ok(self.document(collection, id))
  }

  async fn create(&self, collection: &str, data: Value) -> Result<String, BackendError> {
    self.begin(CallKind::Create, None).await?;
    let Value::Object(fields) = data else {
      return Err(BackendError::new(
        ErrorCode::InvalidArgument,
        "document data must be an object",
      ));
    };
    let n = self.next_id.fetch_add(1, AtomicOrdering::SeqCst) + 1;
    let id = format!("doc-{:06}", n);
    lock(&self.collections)
      .entry(collection.to_string())
      .or_default()
      .insert(id.clone(), fields);
    Ok(id)
  }

  async fn update(&self, collection: &str, id: &str, patch: Value) -> Result<(), BackendError> {
    self.begin(CallKind::Update, Some(id)).await?;
    let Value::Object(patch) = patch else {
      return Err(BackendError::new(
        ErrorCode::InvalidArgument,
        "update patch must be an object",
      ));
    };
    let mut collections = lock(&self.collections);
    let doc = collections
      .get_mut(collection)
      .and_then(|docs| docs.get_mut(id))
      .ok_or_else(|| {
        BackendError::new(ErrorCode::NotFound, format!("{}/{} does not exist", collection, id))
      })?;
    for (k, v) in patch {
      doc.insert(k, v);
    }
    Ok(())
  }

  async fn delete(&self, collection: &str, id: &str) -> Result<(), BackendError> {
    self.begin(CallKind::Delete, Some(id)).await?;
    if let Some(docs) = lock(&self.collections).get_mut(collection) {
      docs.remove(id);
    }
    Ok(())
  }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
  m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Field lookup where `id` is addressable like any other field.
fn field(id: &str, fields: &Map<String, Value>, name: &str) -> Option<Value> {
  if name == "id" {
    return Some(Value::String(id.to_string()));
  }
  fields.get(name).cloned()
}

fn matches_filter(id: &str, fields: &Map<String, Value>, filter: &Filter) -> bool {
  let Some(value) = field(id, fields, &filter.field) else {
    return false;
  };
  let ord = compare(&value, &filter.value);
  match filter.op {
    FilterOp::Eq => ord == Some(Ordering::Equal) || value == filter.value,
    FilterOp::Ne => !(ord == Some(Ordering::Equal) || value == filter.value),
    FilterOp::Lt => ord == Some(Ordering::Less),
    FilterOp::Le => matches!(ord, Some(Ordering::Less | Ordering::Equal)),
    FilterOp::Gt => ord == Some(Ordering::Greater),
    FilterOp::Ge => matches!(ord, Some(Ordering::Greater | Ordering::Equal)),
  }
}

/// Compare values of the same JSON type; mixed types are unordered.
fn compare(a: &Value, b: &Value) -> Option<Ordering> {
  match (a, b) {
    (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
    (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
    (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
    (Value::Null, Value::Null) => Some(Ordering::Equal),
    _ => None,
  }
}
