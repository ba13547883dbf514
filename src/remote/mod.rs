//! Remote relational backend port.
//!
//! The engine talks to the backend only through [`RemoteBackend`]. `rest`
//! speaks PostgREST over HTTP; `memory` keeps rows in process and is used by
//! tests and local dry runs.

mod memory;
mod rest;

use async_trait::async_trait;
use serde_json::Value;

use crate::registry::{ConflictKey, Table};

pub use memory::MemoryBackend;
pub use rest::RestBackend;

/// Failure applying a single remote call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RemoteError {
  /// The backend answered with an error status
  #[error("remote rejected request ({status}): {message}")]
  Rejected { status: u16, message: String },
  /// The request never got a response
  #[error("transport failure: {0}")]
  Transport(String),
  #[error("remote backend is not configured")]
  NotConfigured,
  /// The change cannot be expressed as a remote call
  #[error("invalid record: {0}")]
  InvalidRecord(String),
}

/// Table-level operations the backend must support.
///
/// `rows` arguments are either a single JSON object or an array of objects,
/// already translated to remote column names.
#[async_trait]
pub trait RemoteBackend: Send + Sync {
  /// Rows owned by `owner_id`, newest `updated_at` first.
  async fn select(&self, table: Table, owner_id: &str) -> Result<Vec<Value>, RemoteError>;

  async fn insert(&self, table: Table, rows: &Value) -> Result<(), RemoteError>;

  /// Update the row whose `id` matches.
  async fn update(&self, table: Table, id: &str, row: &Value) -> Result<(), RemoteError>;

  /// Insert or merge on the given conflict column.
  async fn upsert(
    &self,
    table: Table,
    rows: &Value,
    on_conflict: ConflictKey,
  ) -> Result<(), RemoteError>;

  async fn delete(&self, table: Table, id: &str) -> Result<(), RemoteError>;

  /// Cheap reachability check.
  async fn ping(&self) -> Result<(), RemoteError>;
}
