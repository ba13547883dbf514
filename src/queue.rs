//! Persisted queue of changes waiting to reach the remote backend.
//!
//! The queue, the per-change attempt ledger and the dead-letter list are each
//! stored as one JSON document under a reserved key in the local store. Every
//! mutation rewrites the whole document under a single lock.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, error};

use crate::cache::KeyValueStore;
use crate::registry::Table;

/// Reserved key prefix for engine bookkeeping.
pub const RESERVED_PREFIX: &str = "_sync:";
pub const QUEUE_KEY: &str = "_sync:queue";
pub const ATTEMPTS_KEY: &str = "_sync:attempts";
pub const DEAD_LETTER_KEY: &str = "_sync:dead_letter";

static SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Remote operation a change is applied with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
  Insert,
  Update,
  Upsert,
  Delete,
}

impl std::fmt::Display for Operation {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let name = match self {
      Self::Insert => "insert",
      Self::Update => "update",
      Self::Upsert => "upsert",
      Self::Delete => "delete",
    };
    f.write_str(name)
  }
}

/// A mutation waiting to be applied remotely.
///
/// Changes are immutable once enqueued; retries are counted in the attempt
/// ledger, keyed by `id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingChange {
  pub id: String,
  pub table: Table,
  pub operation: Operation,
  /// Payload in local naming; translated at drain time
  pub data: Value,
  pub local_key: String,
  pub owner_id: Option<String>,
  pub timestamp: DateTime<Utc>,
}

impl PendingChange {
  pub fn new(
    table: Table,
    operation: Operation,
    data: Value,
    local_key: &str,
    owner_id: Option<String>,
  ) -> Self {
    let timestamp = Utc::now();
    let seq = SEQUENCE.fetch_add(1, Ordering::Relaxed);

    let mut hasher = Sha256::new();
    hasher.update(table.remote_name().as_bytes());
    hasher.update(operation.to_string().as_bytes());
    hasher.update(local_key.as_bytes());
    hasher.update(owner_id.as_deref().unwrap_or("").as_bytes());
    hasher.update(timestamp.timestamp_nanos_opt().unwrap_or_default().to_le_bytes());
    hasher.update(seq.to_le_bytes());
    hasher.update(data.to_string().as_bytes());
    let id = hex::encode(hasher.finalize());

    Self {
      id,
      table,
      operation,
      data,
      local_key: local_key.to_string(),
      owner_id,
      timestamp,
    }
  }
}

/// A change that exhausted its attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetter {
  pub change: PendingChange,
  pub attempts: u32,
  pub last_error: String,
  pub dead_lettered_at: DateTime<Utc>,
}

impl DeadLetter {
  pub fn new(change: PendingChange, attempts: u32, last_error: String) -> Self {
    Self {
      change,
      attempts,
      last_error,
      dead_lettered_at: Utc::now(),
    }
  }
}

/// The pending change queue.
pub struct PendingQueue {
  store: Arc<dyn KeyValueStore>,
  lock: Mutex<()>,
}

impl PendingQueue {
  pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
    Self {
      store,
      lock: Mutex::new(()),
    }
  }

  /// Append a change and persist the queue. Returns the new queue length.
  pub fn enqueue(&self, change: PendingChange) -> Result<usize> {
    let _guard = self.lock()?;
    let mut queue: Vec<PendingChange> = self.read(QUEUE_KEY)?;
    debug!(
      id = %change.id,
      table = %change.table,
      operation = %change.operation,
      local_key = %change.local_key,
      "Enqueued pending change"
    );
    queue.push(change);
    self.write(QUEUE_KEY, &queue)?;
    Ok(queue.len())
  }

  /// All pending changes in append order.
  pub fn all(&self) -> Result<Vec<PendingChange>> {
    let _guard = self.lock()?;
    self.read(QUEUE_KEY)
  }

  pub fn size(&self) -> Result<usize> {
    Ok(self.all()?.len())
  }

  /// Tables that have at least one change waiting.
  pub fn tables_with_pending_work(&self) -> Result<Vec<Table>> {
    let tables: BTreeSet<Table> = self.all()?.into_iter().map(|c| c.table).collect();
    Ok(tables.into_iter().collect())
  }

  /// Replace the queue after a drain pass.
  ///
  /// The result is `failed` followed by anything enqueued after `snapshot`
  /// was taken, so writes that land mid-drain are never lost. Only as many
  /// copies of an id as the snapshot held are dropped, so a change requeued
  /// during the pass survives.
  ///
  /// `dead` is appended to the dead-letter list once the queue rewrite has
  /// succeeded; a failed rewrite leaves those changes queued and nowhere else.
  pub fn drain_failed_back_to(
    &self,
    snapshot: &[PendingChange],
    failed: Vec<PendingChange>,
    dead: Vec<DeadLetter>,
  ) -> Result<()> {
    let _guard = self.lock()?;
    let mut seen: HashMap<&str, usize> = HashMap::new();
    for change in snapshot {
      *seen.entry(change.id.as_str()).or_insert(0) += 1;
    }
    let current: Vec<PendingChange> = self.read(QUEUE_KEY)?;

    let mut next = failed;
    for change in current {
      match seen.get_mut(change.id.as_str()) {
        Some(count) if *count > 0 => *count -= 1,
        _ => next.push(change),
      }
    }
    self.write(QUEUE_KEY, &next)?;

    self.append_dead_letters(dead)
  }

  /// Count one more failed attempt for a change. Returns the new total.
  pub fn record_failure(&self, id: &str) -> Result<u32> {
    let _guard = self.lock()?;
    let mut attempts = self.read_attempts()?;
    let count = attempts.entry(id.to_string()).or_insert(0);
    *count += 1;
    let total = *count;
    self.write(ATTEMPTS_KEY, &attempts)?;
    Ok(total)
  }

  pub fn attempts(&self, id: &str) -> Result<u32> {
    let _guard = self.lock()?;
    Ok(self.read_attempts()?.get(id).copied().unwrap_or(0))
  }

  pub fn clear_attempts(&self, ids: &[String]) -> Result<()> {
    if ids.is_empty() {
      return Ok(());
    }
    let _guard = self.lock()?;
    let mut attempts = self.read_attempts()?;
    let before = attempts.len();
    for id in ids {
      attempts.remove(id);
    }
    if attempts.len() != before {
      self.write(ATTEMPTS_KEY, &attempts)?;
    }
    Ok(())
  }

  /// Quarantine a change that keeps failing.
  pub fn dead_letter(&self, change: PendingChange, attempts: u32, last_error: String) -> Result<()> {
    let _guard = self.lock()?;
    self.append_dead_letters(vec![DeadLetter::new(change, attempts, last_error)])
  }

  fn append_dead_letters(&self, dead: Vec<DeadLetter>) -> Result<()> {
    if dead.is_empty() {
      return Ok(());
    }

    let mut letters: Vec<DeadLetter> = self.read(DEAD_LETTER_KEY)?;
    let mut ledger = self.read_attempts()?;
    for letter in dead {
      error!(
        id = %letter.change.id,
        table = %letter.change.table,
        operation = %letter.change.operation,
        attempts = letter.attempts,
        error = %letter.last_error,
        "Change exhausted its attempts and was moved to the dead-letter list"
      );
      ledger.remove(&letter.change.id);
      letters.push(letter);
    }
    self.write(DEAD_LETTER_KEY, &letters)?;
    self.write(ATTEMPTS_KEY, &ledger)
  }

  pub fn dead_letters(&self) -> Result<Vec<DeadLetter>> {
    let _guard = self.lock()?;
    self.read(DEAD_LETTER_KEY)
  }

  /// Move every dead letter back to the tail of the queue.
  pub fn requeue_dead_letters(&self) -> Result<usize> {
    let _guard = self.lock()?;
    let letters: Vec<DeadLetter> = self.read(DEAD_LETTER_KEY)?;
    if letters.is_empty() {
      return Ok(0);
    }

    let count = letters.len();
    let mut queue: Vec<PendingChange> = self.read(QUEUE_KEY)?;
    queue.extend(letters.into_iter().map(|letter| letter.change));
    self.write(QUEUE_KEY, &queue)?;
    self.write::<Vec<DeadLetter>>(DEAD_LETTER_KEY, &Vec::new())?;
    Ok(count)
  }

  fn lock(&self) -> Result<std::sync::MutexGuard<'_, ()>> {
    self.lock.lock().map_err(|e| eyre!("Lock poisoned: {}", e))
  }

  fn read_attempts(&self) -> Result<HashMap<String, u32>> {
    match self.store.get(ATTEMPTS_KEY)? {
      Some(value) => serde_json::from_value(value)
        .map_err(|e| eyre!("Failed to decode {}: {}", ATTEMPTS_KEY, e)),
      None => Ok(HashMap::new()),
    }
  }

  fn read<T: DeserializeOwned>(&self, key: &str) -> Result<Vec<T>> {
    match self.store.get(key)? {
      Some(value) => {
        serde_json::from_value(value).map_err(|e| eyre!("Failed to decode {}: {}", key, e))
      }
      None => Ok(Vec::new()),
    }
  }

  fn write<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
    let value =
      serde_json::to_value(value).map_err(|e| eyre!("Failed to encode {}: {}", key, e))?;
    self.store.set(key, &value)
  }
}
