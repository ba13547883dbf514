//! Background scheduler that owns every automatic sync trigger.
//!
//! Requests arrive over an mpsc channel and are handled one at a time, so the
//! scheduler never starts overlapping drains itself. A burst of enqueue
//! notifications already waiting in the channel collapses into one drain.
//! Outcomes are broadcast to any subscriber.

use color_eyre::{eyre::eyre, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Interval;
use tracing::{debug, error, info};

use super::{DrainOutcome, DrainReport, GuardFailure, RetryOutcome, SyncEngine};

/// What caused a sync attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
  /// A change was just enqueued
  Enqueue,
  /// The device came back online
  Reconnect,
  /// Periodic tick
  Interval,
  /// Explicit "sync now"
  Manual,
}

/// Requests accepted by the scheduler.
#[derive(Debug)]
pub enum SyncRequest {
  /// Drain once if possible; skipped silently otherwise
  Opportunistic,
  /// Run the retry loop, as after a reconnect
  Reconnected,
  /// Drain once and report back
  Now {
    reply: oneshot::Sender<Result<DrainOutcome, String>>,
  },
  Shutdown,
}

/// Notifications published after each scheduled attempt.
#[derive(Debug, Clone)]
pub enum SyncEvent {
  Drained { trigger: Trigger, report: DrainReport },
  Retried { trigger: Trigger, outcome: RetryOutcome },
  Skipped { trigger: Trigger, reason: GuardFailure },
  Failed { trigger: Trigger, error: String },
}

/// Cloneable handle for talking to a running scheduler.
#[derive(Clone)]
pub struct SyncHandle {
  tx: mpsc::UnboundedSender<SyncRequest>,
  events: broadcast::Sender<SyncEvent>,
}

impl SyncHandle {
  /// Ask for an opportunistic drain after a write.
  pub fn notify_enqueued(&self) {
    if self.tx.send(SyncRequest::Opportunistic).is_err() {
      debug!("Scheduler is gone, skipping opportunistic drain");
    }
  }

  pub fn notify_reconnected(&self) {
    if self.tx.send(SyncRequest::Reconnected).is_err() {
      debug!("Scheduler is gone, skipping reconnect sync");
    }
  }

  /// Drain once through the scheduler and wait for the outcome.
  pub async fn sync_now(&self) -> Result<DrainOutcome> {
    let (reply, rx) = oneshot::channel();
    self
      .tx
      .send(SyncRequest::Now { reply })
      .map_err(|_| eyre!("Sync scheduler is not running"))?;
    rx.await
      .map_err(|_| eyre!("Sync scheduler dropped the request"))?
      .map_err(|e| eyre!(e))
  }

  pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
    self.events.subscribe()
  }

  pub fn shutdown(&self) {
    let _ = self.tx.send(SyncRequest::Shutdown);
  }
}

/// The scheduler task.
pub struct SyncScheduler {
  engine: Arc<SyncEngine>,
  rx: mpsc::UnboundedReceiver<SyncRequest>,
  events: broadcast::Sender<SyncEvent>,
  online: watch::Receiver<bool>,
  /// Flag value when the receiver was created
  was_online: bool,
  interval: Option<Interval>,
  /// Request pulled off the channel while coalescing, handled next
  deferred: Option<SyncRequest>,
}

impl SyncScheduler {
  /// Spawn the scheduler. `interval` enables a periodic single-pass drain.
  pub fn spawn(engine: Arc<SyncEngine>, interval: Option<Duration>) -> (SyncHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let (events, _) = broadcast::channel(64);
    let online = engine.connectivity().subscribe();
    let was_online = *online.borrow();

    let interval = interval.map(|period| {
      let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
      ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
      ticker
    });

    let scheduler = Self {
      engine,
      rx,
      events: events.clone(),
      online,
      was_online,
      interval,
      deferred: None,
    };
    let task = tokio::spawn(scheduler.run());

    (SyncHandle { tx, events }, task)
  }

  async fn run(mut self) {
    let mut was_online = self.was_online;
    let mut watching = true;
    info!(online = was_online, "Sync scheduler started");

    loop {
      if let Some(request) = self.deferred.take() {
        if !self.handle(request).await {
          break;
        }
        continue;
      }

      tokio::select! {
        request = self.rx.recv() => match request {
          Some(request) => {
            if !self.handle(request).await {
              break;
            }
          }
          None => break,
        },
        changed = self.online.changed(), if watching => {
          if changed.is_err() {
            watching = false;
            continue;
          }
          let online = *self.online.borrow_and_update();
          if online && !was_online {
            info!("Back online, syncing pending changes");
            self.retry(Trigger::Reconnect).await;
          }
          was_online = online;
        },
        _ = tick(&mut self.interval) => {
          let _ = self.drain_once(Trigger::Interval).await;
        },
      }
    }

    info!("Sync scheduler stopped");
  }

  /// Handle one request. Returns false once the scheduler should stop.
  async fn handle(&mut self, request: SyncRequest) -> bool {
    match request {
      SyncRequest::Shutdown => return false,
      SyncRequest::Opportunistic => {
        self.coalesce_enqueue_notifications();
        let _ = self.drain_once(Trigger::Enqueue).await;
      }
      SyncRequest::Reconnected => self.retry(Trigger::Reconnect).await,
      SyncRequest::Now { reply } => {
        let outcome = self.drain_once(Trigger::Manual).await;
        let _ = reply.send(outcome);
      }
    }
    true
  }

  /// Swallow enqueue notifications already waiting in the channel, stopping
  /// at the first request of another kind.
  fn coalesce_enqueue_notifications(&mut self) {
    let mut absorbed = 0;
    while let Ok(next) = self.rx.try_recv() {
      match next {
        SyncRequest::Opportunistic => absorbed += 1,
        other => {
          self.deferred = Some(other);
          break;
        }
      }
    }
    if absorbed > 0 {
      debug!(absorbed, "Coalesced enqueue notifications");
    }
  }

  async fn drain_once(&self, trigger: Trigger) -> Result<DrainOutcome, String> {
    match self.engine.drain().await {
      Ok(outcome) => {
        let event = match &outcome {
          DrainOutcome::Skipped { reason } => {
            debug!(?trigger, %reason, "Scheduled drain skipped");
            SyncEvent::Skipped {
              trigger,
              reason: *reason,
            }
          }
          DrainOutcome::Completed(report) => SyncEvent::Drained {
            trigger,
            report: report.clone(),
          },
        };
        self.publish(event);
        Ok(outcome)
      }
      Err(e) => {
        error!(?trigger, error = %e, "Drain failed");
        let error = e.to_string();
        self.publish(SyncEvent::Failed {
          trigger,
          error: error.clone(),
        });
        Err(error)
      }
    }
  }

  async fn retry(&self, trigger: Trigger) {
    let max_attempts = self.engine.settings().retry.max_attempts;
    match self.engine.sync_with_retry(max_attempts).await {
      Ok(outcome) => self.publish(SyncEvent::Retried { trigger, outcome }),
      Err(e) => {
        error!(?trigger, error = %e, "Retry sync failed");
        self.publish(SyncEvent::Failed {
          trigger,
          error: e.to_string(),
        });
      }
    }
  }

  fn publish(&self, event: SyncEvent) {
    // No subscribers is fine
    let _ = self.events.send(event);
  }
}

async fn tick(interval: &mut Option<Interval>) {
  match interval {
    Some(interval) => {
      interval.tick().await;
    }
    None => std::future::pending::<()>().await,
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::auth::StaticAuth;
  use crate::cache::MemoryStorage;
  use crate::connectivity::Connectivity;
  use crate::queue::{Operation, PendingChange, PendingQueue};
  use crate::registry::Table;
  use crate::remote::MemoryBackend;
  use crate::sync::SyncSettings;
  use serde_json::json;

  fn engine(online: bool) -> (Arc<SyncEngine>, Arc<MemoryBackend>, Connectivity) {
    let store = Arc::new(MemoryStorage::new());
    let queue = Arc::new(PendingQueue::new(store.clone()));
    let backend = Arc::new(MemoryBackend::new());
    let connectivity = Connectivity::new(online);
    let engine = Arc::new(SyncEngine::new(
      store,
      queue,
      backend.clone(),
      Arc::new(StaticAuth::signed_in("o", None, true)),
      connectivity.clone(),
      SyncSettings::default(),
    ));
    (engine, backend, connectivity)
  }

  fn enqueue(engine: &SyncEngine, id: &str) {
    let change = PendingChange::new(
      Table::Post,
      Operation::Upsert,
      json!({ "id": id }),
      "posts",
      Some("o".to_string()),
    );
    engine.queue().enqueue(change).unwrap();
  }

  #[tokio::test]
  async fn test_sync_now_replies_with_report() {
    let (engine, backend, _connectivity) = engine(true);
    enqueue(&engine, "p1");
    let (handle, task) = SyncScheduler::spawn(engine.clone(), None);

    let outcome = handle.sync_now().await.unwrap();
    match outcome {
      DrainOutcome::Completed(report) => assert_eq!(report.synced, 1),
      other => panic!("unexpected {:?}", other),
    }
    assert_eq!(backend.rows(Table::Post).len(), 1);

    handle.shutdown();
    task.await.unwrap();
  }

  #[tokio::test]
  async fn test_opportunistic_drain_while_offline_is_skipped() {
    let (engine, _backend, _connectivity) = engine(false);
    enqueue(&engine, "p1");
    let (handle, task) = SyncScheduler::spawn(engine.clone(), None);
    let mut events = handle.subscribe();

    handle.notify_enqueued();
    match events.recv().await.unwrap() {
      SyncEvent::Skipped { trigger, reason } => {
        assert_eq!(trigger, Trigger::Enqueue);
        assert_eq!(reason, GuardFailure::Offline);
      }
      other => panic!("unexpected {:?}", other),
    }
    assert_eq!(engine.queue().size().unwrap(), 1);

    handle.shutdown();
    task.await.unwrap();
  }

  #[tokio::test]
  async fn test_reconnect_triggers_retry_sync() {
    let (engine, backend, connectivity) = engine(false);
    enqueue(&engine, "p1");
    enqueue(&engine, "p2");
    let (handle, task) = SyncScheduler::spawn(engine.clone(), None);
    let mut events = handle.subscribe();

    connectivity.set_online(true);
    match events.recv().await.unwrap() {
      SyncEvent::Retried { trigger, outcome } => {
        assert_eq!(trigger, Trigger::Reconnect);
        assert!(outcome.success);
        assert_eq!(outcome.synced, 2);
      }
      other => panic!("unexpected {:?}", other),
    }
    assert_eq!(backend.rows(Table::Post).len(), 2);
    assert_eq!(engine.queue().size().unwrap(), 0);

    handle.shutdown();
    task.await.unwrap();
  }

  #[tokio::test(start_paused = true)]
  async fn test_interval_drains_periodically() {
    let (engine, backend, _connectivity) = engine(true);
    let (handle, task) = SyncScheduler::spawn(engine.clone(), Some(Duration::from_secs(30)));
    let mut events = handle.subscribe();

    enqueue(&engine, "p1");
    match events.recv().await.unwrap() {
      SyncEvent::Drained { trigger, report } => {
        assert_eq!(trigger, Trigger::Interval);
        assert_eq!(report.synced, 1);
      }
      other => panic!("unexpected {:?}", other),
    }
    assert_eq!(backend.rows(Table::Post).len(), 1);

    handle.shutdown();
    task.await.unwrap();
  }

  #[tokio::test]
  async fn test_burst_of_enqueue_notifications_drains_once() {
    let (engine, backend, _connectivity) = engine(true);
    enqueue(&engine, "p1");
    let (handle, task) = SyncScheduler::spawn(engine.clone(), None);
    let mut events = handle.subscribe();

    for _ in 0..5 {
      handle.notify_enqueued();
    }
    match handle.sync_now().await.unwrap() {
      DrainOutcome::Completed(report) => assert_eq!(report.attempted, 0),
      other => panic!("unexpected {:?}", other),
    }

    let mut triggers = Vec::new();
    while let Ok(event) = events.try_recv() {
      match event {
        SyncEvent::Drained { trigger, .. } => triggers.push(trigger),
        other => panic!("unexpected {:?}", other),
      }
    }
    assert_eq!(triggers, vec![Trigger::Enqueue, Trigger::Manual]);
    assert_eq!(backend.calls(), 1);
    assert_eq!(backend.rows(Table::Post).len(), 1);

    handle.shutdown();
    task.await.unwrap();
  }

  #[tokio::test]
  async fn test_shutdown_waits_for_queued_requests() {
    let (engine, backend, _connectivity) = engine(true);
    enqueue(&engine, "p1");
    let (handle, task) = SyncScheduler::spawn(engine.clone(), None);

    handle.notify_enqueued();
    handle.notify_enqueued();
    handle.shutdown();
    task.await.unwrap();

    assert_eq!(backend.rows(Table::Post).len(), 1);
    assert_eq!(engine.queue().size().unwrap(), 0);
  }

  #[tokio::test]
  async fn test_handle_errors_once_scheduler_stops() {
    let (engine, _backend, _connectivity) = engine(true);
    let (handle, task) = SyncScheduler::spawn(engine, None);
    handle.shutdown();
    task.await.unwrap();

    assert!(handle.sync_now().await.is_err());
  }
}
