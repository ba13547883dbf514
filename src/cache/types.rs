//! Option types for cache writes.

/// Default list cap for [`AppendOptions`].
pub const DEFAULT_MAX_ITEMS: usize = 100;

/// Options for a single-value write.
#[derive(Debug, Clone, Copy, Default)]
pub struct SetOptions {
  /// Write locally only, never enqueue a remote change
  pub skip_sync: bool,
}

impl SetOptions {
  pub fn local_only() -> Self {
    Self { skip_sync: true }
  }
}

/// Options for a list append.
#[derive(Debug, Clone)]
pub struct AppendOptions {
  /// Field whose value identifies duplicates; the newest item wins
  pub dedupe_key: Option<String>,
  /// Maximum list length after the append
  pub max_items: usize,
  pub skip_sync: bool,
}

impl Default for AppendOptions {
  fn default() -> Self {
    Self {
      dedupe_key: None,
      max_items: DEFAULT_MAX_ITEMS,
      skip_sync: false,
    }
  }
}

impl AppendOptions {
  pub fn dedupe_on(key: impl Into<String>) -> Self {
    Self {
      dedupe_key: Some(key.into()),
      ..Self::default()
    }
  }
}
