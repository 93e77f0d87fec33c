//! Serializable write descriptors.
//!
//! Queued writes are stored as data, never as closures, so they survive a
//! restart. Replay dispatches on [`OperationKind`] against the backend.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::backend::Backend;
use crate::cache::{item_key, Invalidation};
use crate::error::{BackendError, ErrorCode};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
  Create,
  Update,
  Delete,
}

impl OperationKind {
  pub fn as_str(self) -> &'static str {
    match self {
      OperationKind::Create => "create",
      OperationKind::Update => "update",
      OperationKind::Delete => "delete",
    }
  }
}

/// A write against one collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
  pub kind: OperationKind,
  pub collection: String,
  /// Target document; `None` for creates that let the backend pick an id
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub id: Option<String>,
  #[serde(default)]
  pub payload: Value,
}

impl Operation {
  pub fn create(collection: impl Into<String>, data: Value) -> Self {
    Self {
      kind: OperationKind::Create,
      collection: collection.into(),
      id: None,
      payload: data,
    }
  }

  pub fn update(collection: impl Into<String>, id: impl Into<String>, patch: Value) -> Self {
    Self {
      kind: OperationKind::Update,
      collection: collection.into(),
      id: Some(id.into()),
      payload: patch,
    }
  }

  pub fn delete(collection: impl Into<String>, id: impl Into<String>) -> Self {
    Self {
      kind: OperationKind::Delete,
      collection: collection.into(),
      id: Some(id.into()),
      payload: Value::Null,
    }
  }

  /// Name used in logs and error contexts, e.g. `write:update`.
  pub fn name(&self) -> String {
    format!("write:{}", self.kind.as_str())
  }

  /// Cache key of the targeted document, when the id is known.
  ///
  /// Queued operations sharing a resource key are replayed strictly in
  /// enqueue order.
  pub fn resource_key(&self) -> Option<String> {
    self
      .id
      .as_deref()
      .map(|id| item_key(&self.collection, id))
  }

  /// Key used for error contexts: the resource key or the collection.
  pub fn context_key(&self) -> String {
    self.resource_key().unwrap_or_else(|| self.collection.clone())
  }

  /// Entries to drop from the cache once the write lands.
  pub fn default_invalidation(&self) -> Invalidation {
    Invalidation::for_write(&self.collection, self.id.as_deref())
  }

  /// Perform the write and return the id of the affected document.
  pub async fn apply(&self, backend: &dyn Backend) -> Result<String, BackendError> {
    match self.kind {
      OperationKind::Create => backend.create(&self.collection, self.payload.clone()).await,
      OperationKind::Update => {
        let id = self.require_id()?;
        backend
          .update(&self.collection, id, self.payload.clone())
          .await?;
        Ok(id.to_string())
      }
      OperationKind::Delete => {
        let id = self.require_id()?;
        backend.delete(&self.collection, id).await?;
        Ok(id.to_string())
      }
    }
  }

  fn require_id(&self) -> Result<&str, BackendError> {
    self.id.as_deref().ok_or_else(|| {
      BackendError::new(
        ErrorCode::InvalidArgument,
        format!("{} on {} requires a document id", self.kind.as_str(), self.collection),
      )
    })
  }
}

/// Lifecycle of a queued operation. Completed operations are removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationStatus {
  Pending,
  Processing,
  /// Rejected with a terminal error; kept for inspection or requeue
  Failed,
}

/// An operation as persisted in the offline queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedOperation {
  pub id: u64,
  pub operation: Operation,
  #[serde(default)]
  pub invalidation: Invalidation,
  pub enqueued_at: DateTime<Utc>,
  pub status: OperationStatus,
  #[serde(default)]
  pub attempts: u32,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub last_error: Option<String>,
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::backend::MemoryBackend;
  use serde_json::json;

  #[test]
  fn test_descriptor_wire_format() {
    let op = Operation::update("products", "p1", json!({"price": 600}));
    let json = serde_json::to_value(&op).unwrap();
    assert_eq!(
      json,
      json!({"kind": "update", "collection": "products", "id": "p1", "payload": {"price": 600}})
    );
    assert_eq!(op.name(), "write:update");
    assert_eq!(op.resource_key().as_deref(), Some("products:p1"));
  }

  #[test]
  fn test_create_without_id_has_no_resource_key() {
    let op = Operation::create("contacts", json!({"email": "a@b.c"}));
    assert_eq!(op.resource_key(), None);
    assert_eq!(op.context_key(), "contacts");
  }

  #[tokio::test]
  async fn test_apply_dispatches_by_kind() {
    let backend = MemoryBackend::default();
    let id = Operation::create("products", json!({"name": "Mug"}))
      .apply(&backend)
      .await
      .unwrap();

    Operation::update("products", id.clone(), json!({"price": 12}))
      .apply(&backend)
      .await
      .unwrap();
    let doc = backend.document("products", &id).unwrap();
    assert_eq!(doc.data["name"], "Mug");
    assert_eq!(doc.data["price"], 12);

    Operation::delete("products", id.clone())
      .apply(&backend)
      .await
      .unwrap();
    assert!(backend.document("products", &id).is_none());
  }

  #[tokio::test]
  async fn test_update_without_id_is_invalid() {
    let backend = MemoryBackend::default();
    let op = Operation {
      kind: OperationKind::Update,
      collection: "products".into(),
      id: None,
      payload: json!({}),
    };
    let err = op.apply(&backend).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::InvalidArgument);
  }
}
