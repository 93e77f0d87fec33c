//! Persistent FIFO of writes made while offline.
//!
//! Every mutation goes straight to the [`KvStore`], so the queue contents
//! survive a restart. Entries are keyed by a zero-padded sequence number,
//! which makes key order equal to enqueue order.

mod operation;
mod store;

pub use operation::{Operation, OperationKind, OperationStatus, QueuedOperation};
pub use store::{KvStore, MemoryKvStore, SqliteKvStore};

use chrono::Utc;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::cache::Invalidation;
use crate::error::StoreError;

const OP_PREFIX: &str = "queue/op/";
const SEQ_KEY: &str = "queue/seq";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
  #[error("offline queue full ({capacity} operations)")]
  Full { capacity: usize },
  #[error(transparent)]
  Store(#[from] StoreError),
}

pub struct OfflineQueue {
  store: Arc<dyn KvStore>,
  max_size: usize,
  // Serializes read-modify-write sequences against the store
  write: Mutex<()>,
}

impl OfflineQueue {
  /// Open the queue over `store`.
  ///
  /// Operations left `Processing` by a previous run are returned to
  /// `Pending`, since their outcome is unknown.
  pub fn open(store: Arc<dyn KvStore>, max_size: usize) -> Result<Self, QueueError> {
    let queue = Self {
      store,
      max_size: max_size.max(1),
      write: Mutex::new(()),
    };

    let mut recovered = 0;
    for mut entry in queue.entries()? {
      if entry.status == OperationStatus::Processing {
        entry.status = OperationStatus::Pending;
        queue.save(&entry)?;
        recovered += 1;
      }
    }
    if recovered > 0 {
      info!(recovered, "recovered interrupted queue operations");
    }
    Ok(queue)
  }

  pub fn capacity(&self) -> usize {
    self.max_size
  }

  /// Append an operation; fails with [`QueueError::Full`] at capacity.
  pub fn enqueue(
    &self,
    operation: Operation,
    invalidation: Invalidation,
  ) -> Result<u64, QueueError> {
    let _guard = self.guard();
    let depth = self.store.scan_prefix(OP_PREFIX)?.len();
    if depth >= self.max_size {
      warn!(depth, capacity = self.max_size, "offline queue full, rejecting write");
      return Err(QueueError::Full {
        capacity: self.max_size,
      });
    }

    let id = self.next_id()?;
    let entry = QueuedOperation {
      id,
      operation,
      invalidation,
      enqueued_at: Utc::now(),
      status: OperationStatus::Pending,
      attempts: 0,
      last_error: None,
    };
    self.save(&entry)?;
    debug!(id, op = %entry.operation.name(), "queued operation");
    Ok(id)
  }

  /// Every queued operation in enqueue order, failed ones included.
  pub fn list_pending(&self) -> Result<Vec<QueuedOperation>, QueueError> {
    self.entries()
  }

  pub fn get(&self, id: u64) -> Result<Option<QueuedOperation>, QueueError> {
    let key = op_key(id);
    match self.store.get(&key)? {
      Some(bytes) => Ok(Some(decode(&key, &bytes)?)),
      None => Ok(None),
    }
  }

  pub fn len(&self) -> Result<usize, QueueError> {
    Ok(self.store.scan_prefix(OP_PREFIX)?.len())
  }

  pub fn is_empty(&self) -> Result<bool, QueueError> {
    Ok(self.len()? == 0)
  }

  /// Remove an operation; removing an unknown id is not an error.
  pub fn remove(&self, id: u64) -> Result<(), QueueError> {
    let _guard = self.guard();
    self.store.delete(&op_key(id))?;
    Ok(())
  }

  /// Drop every queued operation. The id sequence keeps counting.
  pub fn clear(&self) -> Result<(), QueueError> {
    let _guard = self.guard();
    for (key, _) in self.store.scan_prefix(OP_PREFIX)? {
      self.store.delete(&key)?;
    }
    Ok(())
  }

  pub fn mark_processing(&self, id: u64) -> Result<(), QueueError> {
    self.modify(id, |entry| {
      entry.status = OperationStatus::Processing;
    })
  }

  /// Record a terminal rejection.
  pub fn mark_failed(&self, id: u64, error: &str) -> Result<(), QueueError> {
    self.modify(id, |entry| {
      entry.status = OperationStatus::Failed;
      entry.attempts += 1;
      entry.last_error = Some(error.to_string());
    })
  }

  /// Return an operation to `Pending` after a replay that may succeed later.
  pub fn mark_deferred(&self, id: u64, error: &str) -> Result<(), QueueError> {
    self.modify(id, |entry| {
      entry.status = OperationStatus::Pending;
      entry.attempts += 1;
      entry.last_error = Some(error.to_string());
    })
  }

  /// Give a failed operation another chance. Returns `false` for unknown ids.
  pub fn requeue(&self, id: u64) -> Result<bool, QueueError> {
    let _guard = self.guard();
    let key = op_key(id);
    let Some(bytes) = self.store.get(&key)? else {
      return Ok(false);
    };
    let mut entry = decode(&key, &bytes)?;
    entry.status = OperationStatus::Pending;
    entry.last_error = None;
    self.save(&entry)?;
    info!(id, "requeued operation");
    Ok(true)
  }

  fn modify(&self, id: u64, f: impl FnOnce(&mut QueuedOperation)) -> Result<(), QueueError> {
    let _guard = self.guard();
    let key = op_key(id);
    // Entry may have been removed or cleared concurrently
    let Some(bytes) = self.store.get(&key)? else {
      return Ok(());
    };
    let mut entry = decode(&key, &bytes)?;
    f(&mut entry);
    self.save(&entry)
  }

  fn entries(&self) -> Result<Vec<QueuedOperation>, QueueError> {
    let mut entries = Vec::new();
    for (key, bytes) in self.store.scan_prefix(OP_PREFIX)? {
      match decode(&key, &bytes) {
        Ok(entry) => entries.push(entry),
        Err(e) => warn!(%key, error = %e, "skipping unreadable queue entry"),
      }
    }
    Ok(entries)
  }

  fn save(&self, entry: &QueuedOperation) -> Result<(), QueueError> {
    let key = op_key(entry.id);
    let bytes = serde_json::to_vec(entry).map_err(|e| StoreError::Codec {
      key: key.clone(),
      message: e.to_string(),
    })?;
    self.store.put(&key, &bytes)?;
    Ok(())
  }

  fn next_id(&self) -> Result<u64, QueueError> {
    let current = match self.store.get(SEQ_KEY)? {
      Some(bytes) => std::str::from_utf8(&bytes)
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .ok_or_else(|| StoreError::Codec {
          key: SEQ_KEY.to_string(),
          message: "sequence is not a number".to_string(),
        })?,
      None => 0,
    };
    let next = current + 1;
    self.store.put(SEQ_KEY, next.to_string().as_bytes())?;
    Ok(next)
  }

  fn guard(&self) -> MutexGuard<'_, ()> {
    self
      .write
      .lock()
      .unwrap_or_else(|poisoned| poisoned.into_inner())
  }
}

fn op_key(id: u64) -> String {
  format!("{}{:020}", OP_PREFIX, id)
}

fn decode(key: &str, bytes: &[u8]) -> Result<QueuedOperation, StoreError> {
  serde_json::from_slice(bytes).map_err(|e| StoreError::Codec {
    key: key.to_string(),
    message: e.to_string(),
  })
}
