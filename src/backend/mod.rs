//! Remote document-store collaborators.
//!
//! The data-access layer talks to the backend only through the [`Backend`]
//! trait. Two implementations ship with the crate:
//! - [`HttpBackend`]: a REST document API over reqwest
//! - [`MemoryBackend`]: an in-process store with fault injection

mod http;
mod memory;

pub use http::HttpBackend;
pub use memory::{CallKind, Fault, MemoryBackend};

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::error::BackendError;

/// Re-serialize a value through JSON to convert between compatible types.
pub fn reserialize<T: DeserializeOwned>(value: impl Serialize) -> serde_json::Result<T> {
  serde_json::from_value(serde_json::to_value(value)?)
}

/// A stored document: its id plus arbitrary fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
  pub id: String,
  #[serde(flatten)]
  pub data: Map<String, Value>,
}

impl Document {
  pub fn new(id: impl Into<String>, data: Map<String, Value>) -> Self {
    Self {
      id: id.into(),
      data,
    }
  }

  /// Convert into a typed record; the id is exposed as an `id` field.
  pub fn into_record<T: DeserializeOwned>(self) -> serde_json::Result<T> {
    reserialize(self)
  }
}

// ============================================================================
// Queries
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FilterOp {
  #[serde(rename = "==")]
  Eq,
  #[serde(rename = "!=")]
  Ne,
  #[serde(rename = "<")]
  Lt,
  #[serde(rename = "<=")]
  Le,
  #[serde(rename = ">")]
  Gt,
  #[serde(rename = ">=")]
  Ge,
}

impl FilterOp {
  pub fn as_str(self) -> &'static str {
    match self {
      FilterOp::Eq => "==",
      FilterOp::Ne => "!=",
      FilterOp::Lt => "<",
      FilterOp::Le => "<=",
      FilterOp::Gt => ">",
      FilterOp::Ge => ">=",
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Filter {
  pub field: String,
  pub op: FilterOp,
  pub value: Value,
}

impl Filter {
  pub fn new(field: impl Into<String>, op: FilterOp, value: impl Into<Value>) -> Self {
    Self {
      field: field.into(),
      op,
      value: value.into(),
    }
  }

  pub fn equals(field: impl Into<String>, value: impl Into<Value>) -> Self {
    Self::new(field, FilterOp::Eq, value)
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
  #[default]
  Asc,
  Desc,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderBy {
  pub field: String,
  pub direction: Direction,
}

/// Query over a collection: conjunctive filters, optional ordering and limit.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Query {
  #[serde(default)]
  pub filters: Vec<Filter>,
  pub order_by: Option<OrderBy>,
  pub limit: Option<usize>,
}

impl Query {
  /// A query matching every document.
  pub fn new() -> Self {
    Self::default()
  }

  pub fn filter(mut self, filter: Filter) -> Self {
    self.filters.push(filter);
    self
  }

  pub fn order_by(mut self, field: impl Into<String>, direction: Direction) -> Self {
    self.order_by = Some(OrderBy {
      field: field.into(),
      direction,
    });
    self
  }

  pub fn limit(mut self, limit: usize) -> Self {
    self.limit = Some(limit);
    self
  }

  /// Stable, fixed-length signature used in cache keys.
  pub fn signature(&self) -> String {
    // Field names are Debug-quoted and values JSON-encoded, so no two
    // queries share a canonical form
    let mut hasher = Sha256::new();
    for filter in &self.filters {
      hasher.update(format!("filter {:?} {} {}\n", filter.field, filter.op.as_str(), filter.value));
    }
    if let Some(order) = &self.order_by {
      hasher.update(format!("order {:?} {:?}\n", order.field, order.direction));
    }
    if let Some(limit) = self.limit {
      hasher.update(format!("limit {}\n", limit));
    }
    hex::encode(hasher.finalize())
  }
}

// ============================================================================
// Backend trait
// ============================================================================

/// CRUD and query access to the remote document store.
#[async_trait]
pub trait Backend: Send + Sync {
  async fn fetch_many(&self, collection: &str, query: &Query) -> Result<Vec<Document>, BackendError>;

  /// Fetch one document; a missing document is `Ok(None)`, not an error.
  async fn fetch_one(&self, collection: &str, id: &str) -> Result<Option<Document>, BackendError>;

  /// Create a document and return its generated id.
  async fn create(&self, collection: &str, data: Value) -> Result<String, BackendError>;

  /// Merge `patch` into an existing document.
  async fn update(&self, collection: &str, id: &str, patch: Value) -> Result<(), BackendError>;

  async fn delete(&self, collection: &str, id: &str) -> Result<(), BackendError>;
}
