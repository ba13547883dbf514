//! Single entry point for application reads and writes.
//!
//! Writes always land in the local store first; the sync engine takes care
//! of the remote leg. Reads are served locally unless a remote refresh is
//! asked for.

use color_eyre::Result;
use futures::future::join_all;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::cache::{AppendOptions, LocalStore, SetOptions};
use crate::queue::{Operation, PendingChange};
use crate::registry::Table;
use crate::remote::RemoteError;
use crate::sync::{GuardFailure, RetryOutcome, SyncEngine, SyncStatus};
use crate::translate::to_local;

#[derive(Debug, Clone, Copy, Default)]
pub struct GetOptions {
  /// Refresh from the remote table before answering
  pub force_remote: bool,
}

impl GetOptions {
  pub fn remote() -> Self {
    Self { force_remote: true }
  }
}

/// Why a remote read did not refresh the local copy.
#[derive(Debug, thiserror::Error)]
pub enum PullError {
  #[error("pull skipped: {0}")]
  Skipped(#[from] GuardFailure),
  #[error(transparent)]
  Remote(#[from] RemoteError),
  #[error("local write failed: {0}")]
  Local(String),
}

/// Per-table result of [`UnifiedStorage::pull_from_remote`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PullSummary {
  pub table: Table,
  pub rows: usize,
  pub error: Option<String>,
}

/// Result of [`UnifiedStorage::migrate_to_remote`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationReport {
  /// Tables that had local data and were queued
  pub enqueued: Vec<Table>,
  pub outcome: RetryOutcome,
}

pub struct UnifiedStorage {
  local: LocalStore,
  engine: Arc<SyncEngine>,
}

impl UnifiedStorage {
  pub fn new(local: LocalStore, engine: Arc<SyncEngine>) -> Self {
    Self { local, engine }
  }

  pub fn local(&self) -> &LocalStore {
    &self.local
  }

  pub fn engine(&self) -> &Arc<SyncEngine> {
    &self.engine
  }

  pub fn save(&self, key: &str, data: Value, options: SetOptions) -> Result<()> {
    self.local.set(key, data, options)?;
    Ok(())
  }

  pub async fn get(&self, key: &str, options: GetOptions) -> Result<Option<Value>> {
    if options.force_remote {
      if let Some(table) = Table::for_local_key(key) {
        match self.refresh(table, key).await {
          Ok(Some(value)) => return Ok(Some(value)),
          Ok(None) => {}
          Err(e) => warn!(key, %table, error = %e, "Remote read failed, using local copy"),
        }
      }
    }
    self.local.get(key)
  }

  pub fn append(&self, key: &str, item: Value, options: AppendOptions) -> Result<Vec<Value>> {
    self.local.append(key, item, options)
  }

  pub fn remove(&self, key: &str) -> Result<()> {
    self.local.remove(key)
  }

  pub fn enqueue(&self, key: &str, operation: Operation, data: Value) -> Result<PendingChange> {
    self.local.enqueue(key, operation, data)
  }

  /// Read the owner's rows for `table` and overwrite `key` with them.
  ///
  /// An empty remote list clears the local one unless the table still has
  /// queued changes. Returns `None` when the local copy was left alone.
  async fn refresh(&self, table: Table, key: &str) -> Result<Option<Value>, PullError> {
    let owner_id = self.engine.check_preconditions()?;
    let rows = self.engine.backend().select(table, &owner_id).await?;

    let value = if table.is_singleton() {
      match rows.first() {
        Some(newest) => to_local(newest, table),
        None => return Ok(None),
      }
    } else {
      if rows.is_empty() && self.has_pending_work(table)? {
        debug!(%table, "Remote list is empty but local changes are queued, keeping local copy");
        return Ok(None);
      }
      Value::Array(rows.iter().map(|row| to_local(row, table)).collect())
    };

    self
      .local
      .set(key, value, SetOptions::local_only())
      .map(Some)
      .map_err(|e| PullError::Local(e.to_string()))
  }

  fn has_pending_work(&self, table: Table) -> Result<bool, PullError> {
    self
      .engine
      .queue()
      .tables_with_pending_work()
      .map(|tables| tables.contains(&table))
      .map_err(|e| PullError::Local(e.to_string()))
  }

  /// Queue every table's local data and push it with retries.
  pub async fn migrate_to_remote(&self) -> Result<MigrationReport> {
    let mut enqueued = Vec::new();
    for table in Table::ALL {
      let key = table.canonical_key();
      match self.local.get(key)? {
        Some(data) if !data.is_null() => {
          self.local.enqueue(key, Operation::Upsert, data)?;
          enqueued.push(table);
        }
        _ => {}
      }
    }
    info!(tables = enqueued.len(), "Queued local data for migration");

    let max_attempts = self.engine.settings().retry.max_attempts;
    let outcome = self.engine.sync_with_retry(max_attempts).await?;
    Ok(MigrationReport { enqueued, outcome })
  }

  /// Refresh every table's canonical key from the remote, concurrently.
  pub async fn pull_from_remote(&self) -> Vec<PullSummary> {
    let pulls = Table::ALL.into_iter().map(|table| async move {
      let result = self.refresh(table, table.canonical_key()).await;
      match result {
        Ok(value) => PullSummary {
          table,
          rows: match value {
            Some(Value::Array(rows)) => rows.len(),
            Some(_) => 1,
            None => 0,
          },
          error: None,
        },
        Err(e) => {
          warn!(%table, error = %e, "Pull failed");
          PullSummary {
            table,
            rows: 0,
            error: Some(e.to_string()),
          }
        }
      }
    });

    let summaries = join_all(pulls).await;
    let pulled: usize = summaries.iter().map(|s| s.rows).sum();
    info!(rows = pulled, "Pull from remote complete");
    summaries
  }

  pub fn status(&self) -> Result<SyncStatus> {
    self.engine.status()
  }
}
