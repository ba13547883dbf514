//! Key-value storage trait with SQLite and in-memory implementations.

use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

/// Trait for persistent key-value backends.
///
/// Writes must be durable by the time a call returns.
pub trait KeyValueStore: Send + Sync {
  /// Read the document stored under `key`.
  fn get(&self, key: &str) -> Result<Option<Value>>;

  /// Overwrite the document stored under `key`.
  fn set(&self, key: &str, value: &Value) -> Result<()>;

  /// Delete `key`. Missing keys are not an error.
  fn remove(&self, key: &str) -> Result<()>;

  /// All stored keys, sorted.
  fn keys(&self) -> Result<Vec<String>>;
}

/// In-memory storage, used in tests and for ephemeral runs.
#[derive(Default)]
pub struct MemoryStorage {
  entries: Mutex<HashMap<String, Value>>,
  /// When set, every operation fails as a persistence error
  failing: AtomicBool,
}

impl MemoryStorage {
  pub fn new() -> Self {
    Self::default()
  }

  /// Make every subsequent operation fail.
  pub fn set_failing(&self, failing: bool) {
    self.failing.store(failing, Ordering::SeqCst);
  }

  fn check(&self) -> Result<()> {
    if self.failing.load(Ordering::SeqCst) {
      return Err(eyre!("Storage unavailable"));
    }
    Ok(())
  }
}

impl KeyValueStore for MemoryStorage {
  fn get(&self, key: &str) -> Result<Option<Value>> {
    self.check()?;
    let entries = self
      .entries
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    Ok(entries.get(key).cloned())
  }

  fn set(&self, key: &str, value: &Value) -> Result<()> {
    self.check()?;
    let mut entries = self
      .entries
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    entries.insert(key.to_string(), value.clone());
    Ok(())
  }

  fn remove(&self, key: &str) -> Result<()> {
    self.check()?;
    let mut entries = self
      .entries
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    entries.remove(key);
    Ok(())
  }

  fn keys(&self) -> Result<Vec<String>> {
    self.check()?;
    let entries = self
      .entries
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    let mut keys: Vec<String> = entries.keys().cloned().collect();
    keys.sort();
    Ok(keys)
  }
}

/// SQLite-based storage implementation.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Open the store at `path`, or at the default location.
  pub fn open(path: Option<&Path>) -> Result<Self> {
    let path = match path {
      Some(p) => p.to_path_buf(),
      None => Self::default_path()?,
    };

    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create store directory: {}", e))?;
    }

    let conn = Connection::open(&path)
      .map_err(|e| eyre!("Failed to open store at {}: {}", path.display(), e))?;

    let storage = Self {
      conn: Mutex::new(conn),
    };
    storage.run_migrations()?;

    tracing::debug!(path = %path.display(), "Opened local store");
    Ok(storage)
  }

  /// Get the default database path.
  pub fn default_path() -> Result<PathBuf> {
    Ok(crate::config::data_dir()?.join("store.db"))
  }

  /// Run database migrations for the store table.
  fn run_migrations(&self) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute_batch(STORE_SCHEMA)
      .map_err(|e| eyre!("Failed to run store migrations: {}", e))?;

    Ok(())
  }
}

/// Schema for the key-value table.
const STORE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS kv_store (
    key TEXT PRIMARY KEY,
    value BLOB NOT NULL,
    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);
"#;

impl KeyValueStore for SqliteStorage {
  fn get(&self, key: &str) -> Result<Option<Value>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let data: Option<Vec<u8>> = conn
      .query_row(
        "SELECT value FROM kv_store WHERE key = ?",
        params![key],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read {}: {}", key, e))?;

    match data {
      Some(data) => {
        let value = serde_json::from_slice(&data)
          .map_err(|e| eyre!("Failed to deserialize {}: {}", key, e))?;
        Ok(Some(value))
      }
      None => Ok(None),
    }
  }

  fn set(&self, key: &str, value: &Value) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    let data = serde_json::to_vec(value).map_err(|e| eyre!("Failed to serialize {}: {}", key, e))?;

    conn
      .execute(
        "INSERT OR REPLACE INTO kv_store (key, value, updated_at)
         VALUES (?, ?, datetime('now'))",
        params![key, data],
      )
      .map_err(|e| eyre!("Failed to write {}: {}", key, e))?;

    Ok(())
  }

  fn remove(&self, key: &str) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute("DELETE FROM kv_store WHERE key = ?", params![key])
      .map_err(|e| eyre!("Failed to remove {}: {}", key, e))?;

    Ok(())
  }

  fn keys(&self) -> Result<Vec<String>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let mut stmt = conn
      .prepare("SELECT key FROM kv_store ORDER BY key")
      .map_err(|e| eyre!("Failed to list keys: {}", e))?;
    let keys = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list keys: {}", e))?
      .collect::<std::result::Result<Vec<String>, _>>()
      .map_err(|e| eyre!("Failed to read key: {}", e))?;

    Ok(keys)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_sqlite_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("store.db");

    {
      let store = SqliteStorage::open(Some(&path)).unwrap();
      store.set("profile", &json!({"name": "A"})).unwrap();
    }

    let store = SqliteStorage::open(Some(&path)).unwrap();
    assert_eq!(store.get("profile").unwrap(), Some(json!({"name": "A"})));
  }

  #[test]
  fn test_sqlite_overwrite_and_remove() {
    let dir = tempfile::tempdir().unwrap();
    let store = SqliteStorage::open(Some(&dir.path().join("store.db"))).unwrap();

    store.set("k", &json!([1, 2])).unwrap();
    store.set("k", &json!([3])).unwrap();
    assert_eq!(store.get("k").unwrap(), Some(json!([3])));

    store.set("a", &json!(true)).unwrap();
    assert_eq!(store.keys().unwrap(), vec!["a".to_string(), "k".to_string()]);

    store.remove("k").unwrap();
    store.remove("k").unwrap();
    assert_eq!(store.get("k").unwrap(), None);
    assert_eq!(store.keys().unwrap(), vec!["a".to_string()]);
  }

  #[test]
  fn test_memory_failing_mode() {
    let store = MemoryStorage::new();
    store.set("k", &json!(1)).unwrap();
    store.set_failing(true);
    assert!(store.get("k").is_err());
    store.set_failing(false);
    assert_eq!(store.get("k").unwrap(), Some(json!(1)));
  }
}
