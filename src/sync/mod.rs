//! Sync engine: drains the pending change queue into the remote backend.
//!
//! A drain is guarded by a single `draining` flag; a request that finds the
//! flag set, the device offline, the backend unreachable or nobody signed in
//! returns a [`GuardFailure`] without touching the queue.
//!
//! Each queued change is applied independently. Successes leave the queue,
//! failures stay and are counted in the attempt ledger, and a change that
//! reaches `max_item_attempts` moves to the dead-letter list together with
//! the queue rewrite that ends the pass.

mod retry;
mod scheduler;

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::auth::AuthProvider;
use crate::cache::KeyValueStore;
use crate::connectivity::Connectivity;
use crate::queue::{DeadLetter, Operation, PendingChange, PendingQueue};
use crate::registry::Table;
use crate::remote::{RemoteBackend, RemoteError};
use crate::translate::{prepare, record_id};

pub use retry::{RetryOutcome, RetryPolicy};
pub use scheduler::{SyncEvent, SyncHandle, SyncRequest, SyncScheduler, Trigger};

const LAST_SYNC_KEY: &str = "_sync:last_sync_time";

/// Precondition that stopped a drain before it started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, thiserror::Error)]
#[serde(rename_all = "snake_case")]
pub enum GuardFailure {
  #[error("sync already in progress")]
  AlreadyDraining,
  #[error("device is offline")]
  Offline,
  #[error("backend is unreachable or not configured")]
  BackendUnreachable,
  #[error("not authenticated")]
  Unauthenticated,
}

/// Engine tuning.
#[derive(Debug, Clone, Copy)]
pub struct SyncSettings {
  pub retry: RetryPolicy,
  /// Failed passes a single change may accumulate before it is dead-lettered
  pub max_item_attempts: u32,
}

impl Default for SyncSettings {
  fn default() -> Self {
    Self {
      retry: RetryPolicy::default(),
      max_item_attempts: 10,
    }
  }
}

/// Why a single change failed in a pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ItemError {
  pub change_id: String,
  pub table: Table,
  pub operation: Operation,
  pub error: String,
}

/// Result of one completed drain pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DrainReport {
  pub attempted: usize,
  pub synced: usize,
  /// Includes dead-lettered items
  pub failed: usize,
  pub dead_lettered: usize,
  pub errors: Vec<ItemError>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DrainOutcome {
  Skipped { reason: GuardFailure },
  Completed(DrainReport),
}

impl DrainOutcome {
  pub fn guard(&self) -> Option<GuardFailure> {
    match self {
      Self::Skipped { reason } => Some(*reason),
      Self::Completed(_) => None,
    }
  }
}

/// Status surface for UI and telemetry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
  pub is_online: bool,
  pub draining: bool,
  pub pending_count: usize,
  pub last_sync_time: Option<DateTime<Utc>>,
  pub tables_with_pending_work: Vec<Table>,
  pub dead_letter_count: usize,
}

/// Resets the draining flag when a pass ends, however it ends.
struct DrainGuard<'a>(&'a AtomicBool);

impl Drop for DrainGuard<'_> {
  fn drop(&mut self) {
    self.0.store(false, Ordering::Release);
  }
}

/// The sync engine. All collaborators are injected at construction.
pub struct SyncEngine {
  store: Arc<dyn KeyValueStore>,
  queue: Arc<PendingQueue>,
  backend: Arc<dyn RemoteBackend>,
  auth: Arc<dyn AuthProvider>,
  connectivity: Connectivity,
  settings: SyncSettings,
  draining: AtomicBool,
}

impl SyncEngine {
  pub fn new(
    store: Arc<dyn KeyValueStore>,
    queue: Arc<PendingQueue>,
    backend: Arc<dyn RemoteBackend>,
    auth: Arc<dyn AuthProvider>,
    connectivity: Connectivity,
    settings: SyncSettings,
  ) -> Self {
    Self {
      store,
      queue,
      backend,
      auth,
      connectivity,
      settings,
      draining: AtomicBool::new(false),
    }
  }

  pub fn queue(&self) -> &Arc<PendingQueue> {
    &self.queue
  }

  pub fn backend(&self) -> &Arc<dyn RemoteBackend> {
    &self.backend
  }

  pub fn auth(&self) -> &Arc<dyn AuthProvider> {
    &self.auth
  }

  pub fn connectivity(&self) -> &Connectivity {
    &self.connectivity
  }

  pub fn settings(&self) -> &SyncSettings {
    &self.settings
  }

  pub fn is_draining(&self) -> bool {
    self.draining.load(Ordering::Acquire)
  }

  /// Check every precondition except the draining flag.
  ///
  /// Returns the owner identity changes are attributed to.
  pub fn check_preconditions(&self) -> Result<String, GuardFailure> {
    if !self.connectivity.is_online() {
      return Err(GuardFailure::Offline);
    }
    if !self.auth.backend_reachable() {
      return Err(GuardFailure::BackendUnreachable);
    }
    if !self.auth.is_authenticated() {
      return Err(GuardFailure::Unauthenticated);
    }
    self.auth.owner_id().ok_or(GuardFailure::Unauthenticated)
  }

  fn begin_drain(&self) -> Result<(DrainGuard<'_>, String), GuardFailure> {
    if self.is_draining() {
      return Err(GuardFailure::AlreadyDraining);
    }
    let owner_id = self.check_preconditions()?;
    if self.draining.swap(true, Ordering::AcqRel) {
      return Err(GuardFailure::AlreadyDraining);
    }
    Ok((DrainGuard(&self.draining), owner_id))
  }

  /// Run a single drain pass.
  pub async fn drain(&self) -> Result<DrainOutcome> {
    let (_guard, owner_id) = match self.begin_drain() {
      Ok(claimed) => claimed,
      Err(reason) => {
        debug!(%reason, "Drain skipped");
        return Ok(DrainOutcome::Skipped { reason });
      }
    };

    self
      .drain_pass(&owner_id)
      .await
      .map(DrainOutcome::Completed)
  }

  /// Single pass with no backoff, for "sync now" style triggers.
  pub async fn sync_now(&self) -> Result<DrainOutcome> {
    self.drain().await
  }

  async fn drain_pass(&self, owner_id: &str) -> Result<DrainReport> {
    let snapshot = self.queue.all()?;
    let mut report = DrainReport {
      attempted: snapshot.len(),
      ..DrainReport::default()
    };

    if !snapshot.is_empty() {
      info!(pending = snapshot.len(), "Starting drain pass");
    }

    let mut failed = Vec::new();
    let mut dead = Vec::new();
    let mut succeeded = Vec::new();

    for change in &snapshot {
      match self.apply(change, owner_id).await {
        Ok(()) => {
          debug!(id = %change.id, table = %change.table, operation = %change.operation, "Change applied");
          succeeded.push(change.id.clone());
          report.synced += 1;
        }
        Err(err) => {
          warn!(
            id = %change.id,
            table = %change.table,
            operation = %change.operation,
            error = %err,
            "Change failed, keeping it queued"
          );
          report.failed += 1;
          report.errors.push(ItemError {
            change_id: change.id.clone(),
            table: change.table,
            operation: change.operation,
            error: err.to_string(),
          });

          let attempts = self.queue.record_failure(&change.id)?;
          if attempts >= self.settings.max_item_attempts {
            dead.push(DeadLetter::new(change.clone(), attempts, err.to_string()));
          } else {
            failed.push(change.clone());
          }
        }
      }
    }

    report.dead_lettered = dead.len();
    self.queue.drain_failed_back_to(&snapshot, failed, dead)?;
    self.queue.clear_attempts(&succeeded)?;

    if report.failed == 0 {
      self.record_sync_time(Utc::now())?;
    }

    if report.attempted > 0 {
      info!(
        synced = report.synced,
        failed = report.failed,
        dead_lettered = report.dead_lettered,
        "Drain pass complete"
      );
    }
    Ok(report)
  }

  async fn apply(&self, change: &PendingChange, owner_id: &str) -> Result<(), RemoteError> {
    let table = change.table;
    // Changes stay attributed to whoever made them
    let owner = change.owner_id.as_deref().unwrap_or(owner_id);

    match change.operation {
      Operation::Insert => {
        let row = prepare(&change.data, owner, table, change.timestamp);
        self.backend.insert(table, &row).await
      }
      Operation::Update => {
        let row = prepare(&change.data, owner, table, change.timestamp);
        match record_id(&change.data) {
          Some(id) => self.backend.update(table, &id, &row).await,
          None => self.backend.upsert(table, &row, table.conflict_key()).await,
        }
      }
      Operation::Upsert => {
        let row = prepare(&change.data, owner, table, change.timestamp);
        self.backend.upsert(table, &row, table.conflict_key()).await
      }
      Operation::Delete => {
        let id = record_id(&change.data)
          .ok_or_else(|| RemoteError::InvalidRecord("delete requires a record id".to_string()))?;
        self.backend.delete(table, &id).await
      }
    }
  }

  /// Drain with bounded retries and exponential backoff between passes.
  pub async fn sync_with_retry(&self, max_attempts: u32) -> Result<RetryOutcome> {
    let policy = self.settings.retry;
    let mut outcome = RetryOutcome::default();

    for attempt in 1..=max_attempts.max(1) {
      match self.drain().await? {
        DrainOutcome::Skipped { reason } => {
          info!(%reason, attempt, "Sync stopped by precondition");
          outcome.guard = Some(reason);
          outcome.failed = self.queue.size()?;
          return Ok(outcome);
        }
        DrainOutcome::Completed(report) => {
          outcome.attempts = attempt;
          outcome.synced += report.synced;
          outcome.failed = report.failed;
          if let Some(last) = report.errors.last() {
            outcome.last_error = Some(last.error.clone());
          }

          if report.failed == 0 {
            if attempt > 1 {
              info!(attempt, "Sync succeeded after retries");
            }
            outcome.success = true;
            return Ok(outcome);
          }

          if attempt < max_attempts {
            let delay = policy.delay_for(attempt);
            warn!(
              attempt,
              max_attempts,
              failed = report.failed,
              "Sync pass left failures. Retrying in {:?}...",
              delay
            );
            tokio::time::sleep(delay).await;
          }
        }
      }
    }

    warn!(
      attempts = outcome.attempts,
      failed = outcome.failed,
      "Sync gave up with changes still pending"
    );
    Ok(outcome)
  }

  pub fn last_sync_time(&self) -> Result<Option<DateTime<Utc>>> {
    match self.store.get(LAST_SYNC_KEY)? {
      Some(value) => serde_json::from_value(value)
        .map(Some)
        .map_err(|e| eyre!("Failed to decode last sync time: {}", e)),
      None => Ok(None),
    }
  }

  fn record_sync_time(&self, at: DateTime<Utc>) -> Result<()> {
    let value = serde_json::to_value(at).map_err(|e| eyre!("Failed to encode sync time: {}", e))?;
    self.store.set(LAST_SYNC_KEY, &value)
  }

  pub fn status(&self) -> Result<SyncStatus> {
    Ok(SyncStatus {
      is_online: self.connectivity.is_online(),
      draining: self.is_draining(),
      pending_count: self.queue.size()?,
      last_sync_time: self.last_sync_time()?,
      tables_with_pending_work: self.queue.tables_with_pending_work()?,
      dead_letter_count: self.queue.dead_letters()?.len(),
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::auth::StaticAuth;
  use crate::cache::MemoryStorage;
  use crate::queue::QUEUE_KEY;
  use crate::remote::MemoryBackend;
  use serde_json::json;
  use std::time::Duration;

  struct Harness {
    store: Arc<MemoryStorage>,
    backend: Arc<MemoryBackend>,
    auth: Arc<StaticAuth>,
    connectivity: Connectivity,
    engine: Arc<SyncEngine>,
  }

  fn harness_with(settings: SyncSettings) -> Harness {
    let store = Arc::new(MemoryStorage::new());
    let queue = Arc::new(PendingQueue::new(store.clone()));
    let backend = Arc::new(MemoryBackend::new());
    let auth = Arc::new(StaticAuth::signed_in("owner-1", None, true));
    let connectivity = Connectivity::new(true);
    let engine = Arc::new(SyncEngine::new(
      store.clone(),
      queue,
      backend.clone(),
      auth.clone(),
      connectivity.clone(),
      settings,
    ));
    Harness {
      store,
      backend,
      auth,
      connectivity,
      engine,
    }
  }

  fn harness() -> Harness {
    harness_with(SyncSettings::default())
  }

  fn enqueue(h: &Harness, table: Table, op: Operation, data: serde_json::Value) -> PendingChange {
    let change = PendingChange::new(table, op, data, table.canonical_key(), Some("owner-1".to_string()));
    h.engine.queue().enqueue(change.clone()).unwrap();
    change
  }

  fn report(outcome: DrainOutcome) -> DrainReport {
    match outcome {
      DrainOutcome::Completed(report) => report,
      other => panic!("expected a completed drain, got {:?}", other),
    }
  }

  #[tokio::test]
  async fn test_drain_applies_and_empties_queue() {
    let h = harness();
    enqueue(&h, Table::UserProfile, Operation::Upsert, json!({"fullName": "Ada"}));
    enqueue(&h, Table::Post, Operation::Upsert, json!([{"id": "p1"}, {"id": "p2"}]));

    let report = report(h.engine.drain().await.unwrap());
    assert_eq!(report.synced, 2);
    assert_eq!(report.failed, 0);
    assert_eq!(h.engine.queue().size().unwrap(), 0);
    assert!(h.engine.last_sync_time().unwrap().is_some());

    let profile = h.backend.rows(Table::UserProfile);
    assert_eq!(profile[0]["full_name"], "Ada");
    assert_eq!(profile[0]["owner_id"], "owner-1");
    assert_eq!(h.backend.rows(Table::Post).len(), 2);
  }

  #[tokio::test]
  async fn test_total_failure_leaves_queue_unchanged() {
    let h = harness();
    enqueue(&h, Table::UserProfile, Operation::Upsert, json!({"name": "A"}));
    enqueue(&h, Table::Post, Operation::Insert, json!({"id": "p1"}));
    enqueue(&h, Table::Post, Operation::Delete, json!({"id": "p0"}));
    let before = h.engine.queue().all().unwrap();

    h.backend.set_failing(true);
    let report = report(h.engine.drain().await.unwrap());

    assert_eq!(report.failed, 3);
    assert_eq!(report.synced, 0);
    assert_eq!(h.engine.queue().all().unwrap(), before);
    assert!(h.engine.last_sync_time().unwrap().is_none());
  }

  #[tokio::test]
  async fn test_one_failure_does_not_abort_the_batch() {
    let h = harness();
    enqueue(&h, Table::Post, Operation::Upsert, json!({"id": "p1"}));
    let rejected = enqueue(&h, Table::Connection, Operation::Upsert, json!({"id": "c1"}));
    enqueue(&h, Table::PostDraft, Operation::Upsert, json!({"id": "d1"}));
    h.backend.reject_table(Table::Connection);

    let report = report(h.engine.drain().await.unwrap());
    assert_eq!(report.synced, 2);
    assert_eq!(report.failed, 1);
    assert_eq!(report.errors[0].change_id, rejected.id);
    assert_eq!(h.engine.queue().all().unwrap(), vec![rejected.clone()]);
    assert_eq!(h.engine.queue().attempts(&rejected.id).unwrap(), 1);
    assert_eq!(h.backend.rows(Table::PostDraft).len(), 1);
  }

  #[tokio::test]
  async fn test_replaying_an_upsert_is_idempotent() {
    let h = harness();
    let data = json!({"id": "p1", "postUrl": "https://x/p1"});
    let change = enqueue(&h, Table::Post, Operation::Upsert, data);
    report(h.engine.drain().await.unwrap());
    let first = h.backend.rows(Table::Post);

    h.engine.queue().enqueue(change).unwrap();
    report(h.engine.drain().await.unwrap());
    let second = h.backend.rows(Table::Post);

    assert_eq!(second.len(), 1);
    assert_eq!(first[0]["captured_at"], second[0]["captured_at"]);
    assert_eq!(first[0]["created_at"], second[0]["created_at"]);
    let strip = |mut row: serde_json::Value| {
      row.as_object_mut().unwrap().remove("updated_at");
      row
    };
    assert_eq!(strip(first[0].clone()), strip(second[0].clone()));
  }

  #[tokio::test]
  async fn test_update_without_id_falls_back_to_upsert() {
    let h = harness();
    enqueue(&h, Table::UserSettings, Operation::Update, json!({"autoSync": true}));
    enqueue(&h, Table::PostDraft, Operation::Upsert, json!({"id": "d1", "body": "a"}));
    enqueue(&h, Table::PostDraft, Operation::Update, json!({"id": "d1", "body": "b"}));

    report(h.engine.drain().await.unwrap());
    assert_eq!(h.backend.rows(Table::UserSettings)[0]["auto_sync"], true);
    assert_eq!(h.backend.rows(Table::PostDraft)[0]["body"], "b");
  }

  #[tokio::test]
  async fn test_delete_without_id_is_rejected() {
    let h = harness();
    enqueue(&h, Table::Post, Operation::Delete, json!({"postUrl": "u"}));

    let report = report(h.engine.drain().await.unwrap());
    assert_eq!(report.failed, 1);
    assert!(report.errors[0].error.contains("record id"));
    assert_eq!(h.backend.calls(), 0);
  }

  #[tokio::test]
  async fn test_guards_short_circuit_without_touching_queue() {
    let h = harness();
    enqueue(&h, Table::Post, Operation::Upsert, json!({"id": "p1"}));

    h.connectivity.set_online(false);
    assert_eq!(
      h.engine.drain().await.unwrap().guard(),
      Some(GuardFailure::Offline)
    );

    h.connectivity.set_online(true);
    h.auth.set_reachable(false);
    assert_eq!(
      h.engine.drain().await.unwrap().guard(),
      Some(GuardFailure::BackendUnreachable)
    );

    h.auth.set_reachable(true);
    h.auth.sign_out();
    assert_eq!(
      h.engine.drain().await.unwrap().guard(),
      Some(GuardFailure::Unauthenticated)
    );

    assert_eq!(h.engine.queue().size().unwrap(), 1);
    assert_eq!(h.backend.calls(), 0);
  }

  #[tokio::test(start_paused = true)]
  async fn test_concurrent_drain_reports_already_draining() {
    let h = harness();
    enqueue(&h, Table::Post, Operation::Upsert, json!({"id": "p1"}));
    h.backend.set_latency(Some(Duration::from_secs(1)));

    let engine = h.engine.clone();
    let first = tokio::spawn(async move { engine.drain().await });
    while !h.engine.is_draining() {
      tokio::task::yield_now().await;
    }

    let queue_before = h.engine.queue().all().unwrap();
    let outcome = h.engine.drain().await.unwrap();
    assert_eq!(outcome.guard(), Some(GuardFailure::AlreadyDraining));
    assert_eq!(h.engine.queue().all().unwrap(), queue_before);
    assert!(h.connectivity.is_online());
    assert!(h.engine.last_sync_time().unwrap().is_none());

    let first = report(first.await.unwrap().unwrap());
    assert_eq!(first.synced, 1);
    assert!(!h.engine.is_draining());
  }

  #[tokio::test(start_paused = true)]
  async fn test_change_enqueued_mid_pass_stays_queued() {
    let h = harness();
    enqueue(&h, Table::Post, Operation::Upsert, json!({"id": "p1"}));
    h.backend.set_latency(Some(Duration::from_secs(1)));

    let engine = h.engine.clone();
    let pass = tokio::spawn(async move { engine.drain().await });
    while !h.engine.is_draining() {
      tokio::task::yield_now().await;
    }
    let late = enqueue(&h, Table::PostDraft, Operation::Upsert, json!({"id": "d1"}));

    let report = report(pass.await.unwrap().unwrap());
    assert_eq!(report.attempted, 1);
    assert_eq!(report.synced, 1);
    assert_eq!(h.engine.queue().all().unwrap(), vec![late]);
    assert_eq!(h.backend.rows(Table::Post).len(), 1);
    assert!(h.backend.rows(Table::PostDraft).is_empty());
  }

  #[tokio::test(start_paused = true)]
  async fn test_requeue_during_pass_keeps_the_change() {
    let h = harness_with(SyncSettings {
      retry: RetryPolicy::test(),
      max_item_attempts: 1,
    });
    let rejected = enqueue(&h, Table::Connection, Operation::Upsert, json!({"id": "c1"}));
    enqueue(&h, Table::Post, Operation::Upsert, json!({"id": "p1"}));
    h.backend.reject_table(Table::Connection);
    h.backend.set_latency(Some(Duration::from_secs(1)));

    let engine = h.engine.clone();
    let pass = tokio::spawn(async move { engine.drain().await });
    // The first change has been rejected, the second is still in flight
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert!(h.engine.is_draining());
    assert_eq!(h.engine.queue().requeue_dead_letters().unwrap(), 0);

    let report = report(pass.await.unwrap().unwrap());
    assert_eq!(report.synced, 1);
    assert_eq!(report.dead_lettered, 1);
    assert!(h.engine.queue().all().unwrap().is_empty());

    assert_eq!(h.engine.queue().requeue_dead_letters().unwrap(), 1);
    assert_eq!(h.engine.queue().all().unwrap(), vec![rejected]);
  }

  /// Memory store whose queue writes can be made to fail.
  #[derive(Default)]
  struct QueueWritesFail {
    inner: MemoryStorage,
    failing: AtomicBool,
  }

  impl KeyValueStore for QueueWritesFail {
    fn get(&self, key: &str) -> Result<Option<serde_json::Value>> {
      self.inner.get(key)
    }

    fn set(&self, key: &str, value: &serde_json::Value) -> Result<()> {
      if key == QUEUE_KEY && self.failing.load(Ordering::SeqCst) {
        return Err(eyre!("disk full"));
      }
      self.inner.set(key, value)
    }

    fn remove(&self, key: &str) -> Result<()> {
      self.inner.remove(key)
    }

    fn keys(&self) -> Result<Vec<String>> {
      self.inner.keys()
    }
  }

  #[tokio::test]
  async fn test_failed_rewrite_leaves_change_only_in_queue() {
    let store = Arc::new(QueueWritesFail::default());
    let backend = Arc::new(MemoryBackend::new());
    let engine = SyncEngine::new(
      store.clone(),
      Arc::new(PendingQueue::new(store.clone())),
      backend.clone(),
      Arc::new(StaticAuth::signed_in("owner-1", None, true)),
      Connectivity::new(true),
      SyncSettings {
        retry: RetryPolicy::test(),
        max_item_attempts: 1,
      },
    );
    let change = PendingChange::new(
      Table::Post,
      Operation::Upsert,
      json!({"id": "p1"}),
      "posts",
      Some("owner-1".to_string()),
    );
    engine.queue().enqueue(change.clone()).unwrap();
    backend.reject_table(Table::Post);

    store.failing.store(true, Ordering::SeqCst);
    assert!(engine.drain().await.is_err());
    assert_eq!(engine.queue().all().unwrap(), vec![change.clone()]);
    assert!(engine.queue().dead_letters().unwrap().is_empty());

    store.failing.store(false, Ordering::SeqCst);
    let report = report(engine.drain().await.unwrap());
    assert_eq!(report.dead_lettered, 1);
    assert!(engine.queue().all().unwrap().is_empty());
    let letters = engine.queue().dead_letters().unwrap();
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].change, change);
  }

  #[tokio::test]
  async fn test_changes_are_dead_lettered_after_max_attempts() {
    let h = harness_with(SyncSettings {
      retry: RetryPolicy::test(),
      max_item_attempts: 2,
    });
    let change = enqueue(&h, Table::Post, Operation::Upsert, json!({"id": "p1"}));
    h.backend.reject_table(Table::Post);

    let first = report(h.engine.drain().await.unwrap());
    assert_eq!(first.dead_lettered, 0);
    assert_eq!(h.engine.queue().size().unwrap(), 1);

    let second = report(h.engine.drain().await.unwrap());
    assert_eq!(second.dead_lettered, 1);
    assert_eq!(h.engine.queue().size().unwrap(), 0);

    let letters = h.engine.queue().dead_letters().unwrap();
    assert_eq!(letters[0].change, change);
    assert_eq!(letters[0].attempts, 2);
    assert_eq!(h.engine.status().unwrap().dead_letter_count, 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_retry_backs_off_exponentially() {
    let h = harness();
    enqueue(&h, Table::Post, Operation::Upsert, json!({"id": "p1"}));
    h.backend.set_failing(true);

    let started = tokio::time::Instant::now();
    let outcome = h.engine.sync_with_retry(3).await.unwrap();
    let elapsed = started.elapsed();

    assert!(!outcome.success);
    assert_eq!(outcome.attempts, 3);
    assert_eq!(outcome.synced, 0);
    assert_eq!(outcome.failed, 1);
    assert!(outcome.last_error.unwrap().contains("connection refused"));
    // 1s after the first pass, 2s after the second, none after the last
    assert!(elapsed >= Duration::from_secs(3));
    assert!(elapsed < Duration::from_millis(3500));
    assert_eq!(h.engine.queue().size().unwrap(), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_retry_stops_on_first_clean_pass() {
    let h = harness();
    enqueue(&h, Table::Post, Operation::Upsert, json!({"id": "p1"}));
    h.backend.set_failing(true);

    let engine = h.engine.clone();
    let task = tokio::spawn(async move { engine.sync_with_retry(3).await });
    // Let the first pass fail, then recover during the backoff
    tokio::time::sleep(Duration::from_millis(500)).await;
    h.backend.set_failing(false);

    let outcome = task.await.unwrap().unwrap();
    assert!(outcome.success);
    assert_eq!(outcome.attempts, 2);
    assert_eq!(outcome.synced, 1);
    assert_eq!(outcome.failed, 0);
    assert!(h.engine.last_sync_time().unwrap().is_some());
  }

  #[tokio::test]
  async fn test_retry_stops_immediately_on_guard() {
    let h = harness();
    enqueue(&h, Table::Post, Operation::Upsert, json!({"id": "p1"}));
    h.connectivity.set_online(false);

    let outcome = h.engine.sync_with_retry(3).await.unwrap();
    assert_eq!(outcome.guard, Some(GuardFailure::Offline));
    assert_eq!(outcome.attempts, 0);
    assert_eq!(outcome.failed, 1);
    assert!(!outcome.success);
  }

  #[tokio::test]
  async fn test_status_reports_pending_tables() {
    let h = harness();
    h.connectivity.set_online(false);
    enqueue(&h, Table::Post, Operation::Upsert, json!({"id": "p1"}));
    enqueue(&h, Table::UserProfile, Operation::Upsert, json!({"name": "A"}));

    let status = h.engine.status().unwrap();
    assert!(!status.is_online);
    assert!(!status.draining);
    assert_eq!(status.pending_count, 2);
    assert_eq!(
      status.tables_with_pending_work,
      vec![Table::UserProfile, Table::Post]
    );
    assert_eq!(status.last_sync_time, None);
  }

  #[tokio::test]
  async fn test_persistence_failure_is_fatal() {
    let h = harness();
    enqueue(&h, Table::Post, Operation::Upsert, json!({"id": "p1"}));
    h.store.set_failing(true);

    assert!(h.engine.drain().await.is_err());
    assert!(!h.engine.is_draining());
  }
}
