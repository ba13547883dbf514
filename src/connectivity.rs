//! Online/offline signal.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::remote::RemoteBackend;

/// Shared connectivity flag with change notifications.
#[derive(Clone)]
pub struct Connectivity {
  tx: Arc<watch::Sender<bool>>,
}

impl Connectivity {
  pub fn new(online: bool) -> Self {
    let (tx, _rx) = watch::channel(online);
    Self { tx: Arc::new(tx) }
  }

  pub fn is_online(&self) -> bool {
    *self.tx.borrow()
  }

  /// Update the flag. Subscribers are only woken on an actual transition.
  pub fn set_online(&self, online: bool) {
    let changed = self.tx.send_if_modified(|current| {
      if *current == online {
        false
      } else {
        *current = online;
        true
      }
    });
    if changed {
      info!(online, "Connectivity changed");
    }
  }

  pub fn subscribe(&self) -> watch::Receiver<bool> {
    self.tx.subscribe()
  }

  /// Ping the backend every `interval` and mirror the result into the flag.
  pub fn spawn_probe(&self, backend: Arc<dyn RemoteBackend>, interval: Duration) -> JoinHandle<()> {
    let connectivity = self.clone();
    tokio::spawn(async move {
      let mut ticker = tokio::time::interval(interval);
      loop {
        ticker.tick().await;
        let online = match backend.ping().await {
          Ok(()) => true,
          Err(e) => {
            debug!(error = %e, "Connectivity probe failed");
            false
          }
        };
        connectivity.set_online(online);
      }
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::remote::MemoryBackend;

  #[tokio::test]
  async fn test_subscribers_see_transitions_only() {
    let connectivity = Connectivity::new(false);
    let mut rx = connectivity.subscribe();

    connectivity.set_online(false);
    assert!(!rx.has_changed().unwrap());

    connectivity.set_online(true);
    assert!(rx.has_changed().unwrap());
    assert!(*rx.borrow_and_update());
    assert!(connectivity.is_online());
  }

  #[tokio::test(start_paused = true)]
  async fn test_probe_mirrors_backend_reachability() {
    let backend = Arc::new(MemoryBackend::new());
    backend.set_unreachable(true);
    let connectivity = Connectivity::new(true);
    let mut rx = connectivity.subscribe();

    let probe = connectivity.spawn_probe(backend.clone(), Duration::from_secs(5));
    rx.changed().await.unwrap();
    assert!(!connectivity.is_online());

    backend.set_unreachable(false);
    rx.changed().await.unwrap();
    assert!(connectivity.is_online());

    probe.abort();
  }
}
