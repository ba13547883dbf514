//! In-process backend with PostgREST-like semantics.

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use super::{RemoteBackend, RemoteError};
use crate::registry::{ConflictKey, Table};

/// In-memory backend.
///
/// Upserts merge into the row matching the conflict column, inserts fail on
/// a duplicate `id`, and selects are ordered by `updated_at` descending.
/// Failure and latency can be injected for tests.
#[derive(Default)]
pub struct MemoryBackend {
  rows: Mutex<HashMap<Table, Vec<Map<String, Value>>>>,
  unreachable: AtomicBool,
  fail_all: AtomicBool,
  rejected_tables: Mutex<HashSet<Table>>,
  latency: Mutex<Option<Duration>>,
  calls: AtomicUsize,
}

impl MemoryBackend {
  pub fn new() -> Self {
    Self::default()
  }

  /// Snapshot of a table's rows in storage order.
  pub fn rows(&self, table: Table) -> Vec<Value> {
    self
      .rows
      .lock()
      .map(|rows| {
        rows
          .get(&table)
          .map(|r| r.iter().cloned().map(Value::Object).collect())
          .unwrap_or_default()
      })
      .unwrap_or_default()
  }

  /// Put rows in place without going through the write path.
  pub fn seed(&self, table: Table, rows: Vec<Value>) {
    if let Ok(mut all) = self.rows.lock() {
      let entry = all.entry(table).or_default();
      entry.extend(rows.into_iter().filter_map(|row| match row {
        Value::Object(map) => Some(map),
        _ => None,
      }));
    }
  }

  /// Fail every write and read with a transport error.
  pub fn set_failing(&self, failing: bool) {
    self.fail_all.store(failing, Ordering::SeqCst);
  }

  /// Make `ping` fail.
  pub fn set_unreachable(&self, unreachable: bool) {
    self.unreachable.store(unreachable, Ordering::SeqCst);
  }

  /// Reject every write to `table` with a 400.
  pub fn reject_table(&self, table: Table) {
    if let Ok(mut tables) = self.rejected_tables.lock() {
      tables.insert(table);
    }
  }

  pub fn set_latency(&self, latency: Option<Duration>) {
    if let Ok(mut slot) = self.latency.lock() {
      *slot = latency;
    }
  }

  /// Number of table operations attempted (pings excluded).
  pub fn calls(&self) -> usize {
    self.calls.load(Ordering::SeqCst)
  }

  async fn enter(&self, table: Table, write: bool) -> Result<(), RemoteError> {
    self.calls.fetch_add(1, Ordering::SeqCst);

    let latency = self.latency.lock().ok().and_then(|slot| *slot);
    if let Some(latency) = latency {
      tokio::time::sleep(latency).await;
    }

    if self.fail_all.load(Ordering::SeqCst) {
      return Err(RemoteError::Transport("connection refused".to_string()));
    }
    if write {
      let rejected = self
        .rejected_tables
        .lock()
        .map(|tables| tables.contains(&table))
        .unwrap_or(false);
      if rejected {
        return Err(RemoteError::Rejected {
          status: 400,
          message: format!("writes to {} are rejected", table),
        });
      }
    }
    Ok(())
  }

  fn with_table<R>(
    &self,
    table: Table,
    f: impl FnOnce(&mut Vec<Map<String, Value>>) -> Result<R, RemoteError>,
  ) -> Result<R, RemoteError> {
    let mut all = self
      .rows
      .lock()
      .map_err(|e| RemoteError::Transport(format!("lock poisoned: {}", e)))?;
    f(all.entry(table).or_default())
  }
}

fn objects(rows: &Value) -> Result<Vec<Map<String, Value>>, RemoteError> {
  match rows {
    Value::Object(map) => Ok(vec![map.clone()]),
    Value::Array(items) => items
      .iter()
      .map(|item| match item {
        Value::Object(map) => Ok(map.clone()),
        _ => Err(RemoteError::Rejected {
          status: 400,
          message: "row is not an object".to_string(),
        }),
      })
      .collect(),
    _ => Err(RemoteError::Rejected {
      status: 400,
      message: "payload is not an object".to_string(),
    }),
  }
}

fn matches(row: &Map<String, Value>, column: &str, value: &str) -> bool {
  match row.get(column) {
    Some(Value::String(s)) => s == value,
    Some(Value::Number(n)) => n.to_string() == value,
    _ => false,
  }
}

fn key_of(row: &Map<String, Value>, column: &str) -> Option<String> {
  match row.get(column) {
    Some(Value::String(s)) => Some(s.clone()),
    Some(Value::Number(n)) => Some(n.to_string()),
    _ => None,
  }
}

#[async_trait]
impl RemoteBackend for MemoryBackend {
  async fn select(&self, table: Table, owner_id: &str) -> Result<Vec<Value>, RemoteError> {
    self.enter(table, false).await?;
    self.with_table(table, |rows| {
      let mut owned: Vec<Map<String, Value>> = rows
        .iter()
        .filter(|row| matches(row, "owner_id", owner_id))
        .cloned()
        .collect();
      owned.sort_by(|a, b| {
        let a = a.get("updated_at").and_then(Value::as_str).unwrap_or("");
        let b = b.get("updated_at").and_then(Value::as_str).unwrap_or("");
        b.cmp(a)
      });
      Ok(owned.into_iter().map(Value::Object).collect())
    })
  }

  async fn insert(&self, table: Table, rows: &Value) -> Result<(), RemoteError> {
    self.enter(table, true).await?;
    let new_rows = objects(rows)?;
    self.with_table(table, |existing| {
      for row in &new_rows {
        if let Some(id) = key_of(row, "id") {
          if existing.iter().any(|r| matches(r, "id", &id)) {
            return Err(RemoteError::Rejected {
              status: 409,
              message: format!("duplicate key id={}", id),
            });
          }
        }
      }
      existing.extend(new_rows);
      Ok(())
    })
  }

  async fn update(&self, table: Table, id: &str, row: &Value) -> Result<(), RemoteError> {
    self.enter(table, true).await?;
    let patch = objects(row)?;
    self.with_table(table, |existing| {
      for target in existing.iter_mut().filter(|r| matches(r, "id", id)) {
        for fields in &patch {
          for (k, v) in fields {
            target.insert(k.clone(), v.clone());
          }
        }
      }
      Ok(())
    })
  }

  async fn upsert(
    &self,
    table: Table,
    rows: &Value,
    on_conflict: ConflictKey,
  ) -> Result<(), RemoteError> {
    self.enter(table, true).await?;
    let new_rows = objects(rows)?;
    let column = on_conflict.column();
    self.with_table(table, |existing| {
      for row in new_rows {
        let key = key_of(&row, column).ok_or_else(|| RemoteError::Rejected {
          status: 400,
          message: format!("upsert row is missing conflict column {}", column),
        })?;
        match existing.iter_mut().find(|r| matches(r, column, &key)) {
          Some(target) => {
            for (k, v) in row {
              target.insert(k, v);
            }
          }
          None => existing.push(row),
        }
      }
      Ok(())
    })
  }

  async fn delete(&self, table: Table, id: &str) -> Result<(), RemoteError> {
    self.enter(table, true).await?;
    self.with_table(table, |existing| {
      existing.retain(|r| !matches(r, "id", id));
      Ok(())
    })
  }

  async fn ping(&self) -> Result<(), RemoteError> {
    if self.unreachable.load(Ordering::SeqCst) || self.fail_all.load(Ordering::SeqCst) {
      return Err(RemoteError::Transport("host unreachable".to_string()));
    }
    Ok(())
  }
}
