//! Local store that records a pending change for every mapped write.

use color_eyre::{eyre::eyre, Result};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, error};

use super::storage::KeyValueStore;
use super::types::{AppendOptions, SetOptions};
use crate::auth::AuthProvider;
use crate::queue::{Operation, PendingChange, PendingQueue, RESERVED_PREFIX};
use crate::registry::Table;
use crate::sync::SyncHandle;

/// The local durable store.
///
/// Writes are persisted before the call returns. Writes to keys that map to
/// a remote table also append exactly one change to the pending queue and
/// nudge the sync scheduler, if one is attached.
#[derive(Clone)]
pub struct LocalStore {
  kv: Arc<dyn KeyValueStore>,
  queue: Arc<PendingQueue>,
  auth: Arc<dyn AuthProvider>,
  notifier: Option<SyncHandle>,
}

impl LocalStore {
  pub fn new(kv: Arc<dyn KeyValueStore>, queue: Arc<PendingQueue>, auth: Arc<dyn AuthProvider>) -> Self {
    Self {
      kv,
      queue,
      auth,
      notifier: None,
    }
  }

  /// Attach a scheduler to be notified after each enqueue.
  pub fn with_notifier(mut self, notifier: SyncHandle) -> Self {
    self.notifier = Some(notifier);
    self
  }

  pub fn get(&self, key: &str) -> Result<Option<Value>> {
    self.kv.get(key).map_err(|e| {
      error!(key, error = %e, "Local read failed");
      e
    })
  }

  /// Application keys, without sync bookkeeping.
  pub fn keys(&self) -> Result<Vec<String>> {
    let keys = self.kv.keys()?;
    Ok(
      keys
        .into_iter()
        .filter(|k| !k.starts_with(RESERVED_PREFIX))
        .collect(),
    )
  }

  /// Persist `value` under `key` and return it.
  pub fn set(&self, key: &str, value: Value, options: SetOptions) -> Result<Value> {
    check_key(key)?;

    self.kv.set(key, &value).map_err(|e| {
      error!(key, error = %e, "Local write failed");
      e
    })?;

    if !options.skip_sync {
      if let Some(table) = Table::for_local_key(key) {
        self.push_change(table, Operation::Upsert, value.clone(), key)?;
      }
    }

    Ok(value)
  }

  /// Prepend `item` to the list under `key`.
  ///
  /// With a dedupe key, older elements carrying the same value for that field
  /// are dropped first. The list is capped at `max_items`.
  pub fn append(&self, key: &str, item: Value, options: AppendOptions) -> Result<Vec<Value>> {
    let mut list = match self.get(key)? {
      Some(Value::Array(items)) => items,
      _ => Vec::new(),
    };

    if let Some(field) = options.dedupe_key.as_deref() {
      if let Some(identity) = item.get(field).filter(|v| !v.is_null()) {
        list.retain(|existing| existing.get(field) != Some(identity));
      }
    }

    list.insert(0, item);
    list.truncate(options.max_items);

    let saved = self.set(
      key,
      Value::Array(list),
      SetOptions {
        skip_sync: options.skip_sync,
      },
    )?;
    match saved {
      Value::Array(items) => Ok(items),
      _ => Ok(Vec::new()),
    }
  }

  /// Delete `key` locally. Nothing is sent to the remote.
  pub fn remove(&self, key: &str) -> Result<()> {
    check_key(key)?;
    self.kv.remove(key).map_err(|e| {
      error!(key, error = %e, "Local remove failed");
      e
    })
  }

  /// Queue an explicit operation for a mapped key without changing the
  /// cached value.
  pub fn enqueue(&self, key: &str, operation: Operation, data: Value) -> Result<PendingChange> {
    let table =
      Table::for_local_key(key).ok_or_else(|| eyre!("{} does not map to a remote table", key))?;
    self.push_change(table, operation, data, key)
  }

  fn push_change(
    &self,
    table: Table,
    operation: Operation,
    data: Value,
    key: &str,
  ) -> Result<PendingChange> {
    let change = PendingChange::new(table, operation, data, key, self.auth.owner_id());
    let pending = self.queue.enqueue(change.clone())?;
    debug!(key, %table, pending, "Write queued for sync");

    if let Some(notifier) = &self.notifier {
      notifier.notify_enqueued();
    }
    Ok(change)
  }
}

fn check_key(key: &str) -> Result<()> {
  if key.starts_with(RESERVED_PREFIX) {
    return Err(eyre!("{} is reserved for sync bookkeeping", key));
  }
  Ok(())
}
