//! Durable key-value store trait and implementations.

use rusqlite::{params, Connection};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;

use crate::config::Config;
use crate::error::StoreError;

/// Durable key-value persistence.
///
/// Used by the offline queue, and available to callers for settings or cart
/// state.
pub trait KvStore: Send + Sync {
  fn put(&self, key: &str, value: &[u8]) -> Result<(), StoreError>;

  fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

  /// Deleting a missing key is not an error.
  fn delete(&self, key: &str) -> Result<(), StoreError>;

  /// Every entry, sorted by key.
  fn list_all(&self) -> Result<Vec<(String, Vec<u8>)>, StoreError>;

  /// Entries whose key starts with `prefix`, sorted by key.
  fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, StoreError> {
    Ok(
      self
        .list_all()?
        .into_iter()
        .filter(|(k, _)| k.starts_with(prefix))
        .collect(),
    )
  }
}

/// Store that lives only as long as the process.
#[derive(Default)]
pub struct MemoryKvStore {
  entries: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemoryKvStore {
  pub fn new() -> Self {
    Self::default()
  }

  fn lock(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<String, Vec<u8>>>, StoreError> {
    self.entries.lock().map_err(|_| StoreError::Poisoned)
  }
}

impl KvStore for MemoryKvStore {
  fn put(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
    self.lock()?.insert(key.to_string(), value.to_vec());
    Ok(())
  }

  fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
    Ok(self.lock()?.get(key).cloned())
  }

  fn delete(&self, key: &str) -> Result<(), StoreError> {
    self.lock()?.remove(key);
    Ok(())
  }

  fn list_all(&self) -> Result<Vec<(String, Vec<u8>)>, StoreError> {
    Ok(
      self
        .lock()?
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect(),
    )
  }

  fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, StoreError> {
    Ok(
      self
        .lock()?
        .range(prefix.to_string()..)
        .take_while(|(k, _)| k.starts_with(prefix))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect(),
    )
  }
}

/// SQLite-backed store.
pub struct SqliteKvStore {
  conn: Mutex<Connection>,
}

/// Schema for the key-value table.
const KV_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS kv_store (
    key TEXT PRIMARY KEY,
    value BLOB NOT NULL,
    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);
"#;

impl SqliteKvStore {
  /// Open or create the database at `path`.
  pub fn open(path: &Path) -> Result<Self, StoreError> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent).map_err(|e| {
        StoreError::Io(format!(
          "Failed to create store directory {}: {}",
          parent.display(),
          e
        ))
      })?;
    }

    let conn = Connection::open(path)?;
    Self::with_connection(conn)
  }

  /// Open the database at the default location in the data directory.
  pub fn open_default() -> Result<Self, StoreError> {
    let dir = Config::data_dir().map_err(|e| StoreError::Io(e.to_string()))?;
    Self::open(&dir.join("offline.db"))
  }

  /// Open a private in-memory database.
  pub fn open_in_memory() -> Result<Self, StoreError> {
    Self::with_connection(Connection::open_in_memory()?)
  }

  fn with_connection(conn: Connection) -> Result<Self, StoreError> {
    let store = Self {
      conn: Mutex::new(conn),
    };
    store.run_migrations()?;
    Ok(store)
  }

  /// Run database migrations for the store table.
  fn run_migrations(&self) -> Result<(), StoreError> {
    self.lock()?.execute_batch(KV_SCHEMA)?;
    Ok(())
  }

  fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, StoreError> {
    self.conn.lock().map_err(|_| StoreError::Poisoned)
  }
}

impl KvStore for SqliteKvStore {
  fn put(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
    self.lock()?.execute(
      "INSERT OR REPLACE INTO kv_store (key, value, updated_at)
       VALUES (?, ?, datetime('now'))",
      params![key, value],
    )?;
    Ok(())
  }

  fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
    let conn = self.lock()?;
    let mut stmt = conn.prepare("SELECT value FROM kv_store WHERE key = ?")?;
    let mut rows = stmt.query(params![key])?;
    match rows.next()? {
      Some(row) => Ok(Some(row.get(0)?)),
      None => Ok(None),
    }
  }

  fn delete(&self, key: &str) -> Result<(), StoreError> {
    self
      .lock()?
      .execute("DELETE FROM kv_store WHERE key = ?", params![key])?;
    Ok(())
  }

  fn list_all(&self) -> Result<Vec<(String, Vec<u8>)>, StoreError> {
    let conn = self.lock()?;
    let mut stmt = conn.prepare("SELECT key, value FROM kv_store ORDER BY key")?;
    let entries = stmt
      .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
      .collect::<Result<Vec<_>, _>>()?;
    Ok(entries)
  }

  fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, StoreError> {
    let conn = self.lock()?;
    let mut stmt = conn.prepare(
      "SELECT key, value FROM kv_store
       WHERE substr(key, 1, length(?1)) = ?1
       ORDER BY key",
    )?;
    let entries = stmt
      .query_map(params![prefix], |row| Ok((row.get(0)?, row.get(1)?)))?
      .collect::<Result<Vec<_>, _>>()?;
    Ok(entries)
  }
}
