//! Authentication port.
//!
//! The engine only asks questions of the auth collaborator; obtaining and
//! refreshing credentials happens elsewhere.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

use crate::config::Config;

/// Read-only view of the signed-in principal and backend availability.
pub trait AuthProvider: Send + Sync {
  fn is_authenticated(&self) -> bool;

  /// Stable identifier of the signed-in principal.
  fn owner_id(&self) -> Option<String>;

  /// Whether a backend is configured and believed reachable.
  fn backend_reachable(&self) -> bool;

  /// Bearer credential for remote calls.
  fn access_token(&self) -> Option<String>;
}

#[derive(Debug, Clone)]
struct Session {
  owner_id: String,
  access_token: Option<String>,
}

/// Auth provider backed by values handed to it at startup.
#[derive(Debug)]
pub struct StaticAuth {
  session: RwLock<Option<Session>>,
  backend_configured: bool,
  reachable: AtomicBool,
}

impl StaticAuth {
  pub fn signed_in(owner_id: impl Into<String>, access_token: Option<String>, backend_configured: bool) -> Self {
    Self {
      session: RwLock::new(Some(Session {
        owner_id: owner_id.into(),
        access_token,
      })),
      backend_configured,
      reachable: AtomicBool::new(true),
    }
  }

  pub fn signed_out(backend_configured: bool) -> Self {
    Self {
      session: RwLock::new(None),
      backend_configured,
      reachable: AtomicBool::new(true),
    }
  }

  /// Build from configuration and the process environment.
  pub fn from_config(config: &Config) -> Self {
    let configured = config.backend.url.is_some();
    match config.owner_id() {
      Some(owner) => Self::signed_in(owner, Config::get_access_token().ok(), configured),
      None => Self::signed_out(configured),
    }
  }

  pub fn sign_in(&self, owner_id: impl Into<String>, access_token: Option<String>) {
    if let Ok(mut session) = self.session.write() {
      *session = Some(Session {
        owner_id: owner_id.into(),
        access_token,
      });
    }
  }

  pub fn sign_out(&self) {
    if let Ok(mut session) = self.session.write() {
      *session = None;
    }
  }

  pub fn set_reachable(&self, reachable: bool) {
    self.reachable.store(reachable, Ordering::SeqCst);
  }
}

impl AuthProvider for StaticAuth {
  fn is_authenticated(&self) -> bool {
    self.session.read().map(|s| s.is_some()).unwrap_or(false)
  }

  fn owner_id(&self) -> Option<String> {
    self
      .session
      .read()
      .ok()
      .and_then(|s| s.as_ref().map(|s| s.owner_id.clone()))
  }

  fn backend_reachable(&self) -> bool {
    self.backend_configured && self.reachable.load(Ordering::SeqCst)
  }

  fn access_token(&self) -> Option<String> {
    self
      .session
      .read()
      .ok()
      .and_then(|s| s.as_ref().and_then(|s| s.access_token.clone()))
  }
}
