use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::sync::{RetryPolicy, SyncSettings};

const APP_DIR: &str = "offline-sync";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
  #[serde(default)]
  pub backend: BackendConfig,
  #[serde(default)]
  pub sync: SyncConfig,
  #[serde(default)]
  pub storage: StorageConfig,
  /// Principal to attribute changes to (overridden by OFFLINE_SYNC_OWNER_ID)
  pub owner_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BackendConfig {
  /// Project URL, e.g. https://xyz.supabase.co. Unset means local-only.
  pub url: Option<String>,
  /// Public API key sent as the `apikey` header
  pub api_key: Option<String>,
  #[serde(default = "default_timeout_secs")]
  pub timeout_secs: u64,
}

impl Default for BackendConfig {
  fn default() -> Self {
    Self {
      url: None,
      api_key: None,
      timeout_secs: default_timeout_secs(),
    }
  }
}

fn default_timeout_secs() -> u64 {
  30
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
  /// Drain passes per retry sync
  pub max_attempts: u32,
  pub base_delay_ms: u64,
  pub max_delay_ms: u64,
  /// Failed passes before a change is dead-lettered
  pub max_item_attempts: u32,
  /// Periodic drain; 0 disables it
  pub interval_secs: u64,
  /// Backend ping used as the connectivity signal; 0 disables it
  pub probe_interval_secs: u64,
}

impl Default for SyncConfig {
  fn default() -> Self {
    let settings = SyncSettings::default();
    Self {
      max_attempts: settings.retry.max_attempts,
      base_delay_ms: settings.retry.base_delay.as_millis() as u64,
      max_delay_ms: settings.retry.max_delay.as_millis() as u64,
      max_item_attempts: settings.max_item_attempts,
      interval_secs: 0,
      probe_interval_secs: 30,
    }
  }
}

impl SyncConfig {
  pub fn settings(&self) -> SyncSettings {
    SyncSettings {
      retry: RetryPolicy {
        max_attempts: self.max_attempts.max(1),
        base_delay: Duration::from_millis(self.base_delay_ms),
        max_delay: Duration::from_millis(self.max_delay_ms),
      },
      max_item_attempts: self.max_item_attempts.max(1),
    }
  }

  pub fn interval(&self) -> Option<Duration> {
    (self.interval_secs > 0).then(|| Duration::from_secs(self.interval_secs))
  }

  pub fn probe_interval(&self) -> Option<Duration> {
    (self.probe_interval_secs > 0).then(|| Duration::from_secs(self.probe_interval_secs))
  }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StorageConfig {
  /// SQLite file (default: $XDG_DATA_HOME/offline-sync/store.db)
  pub path: Option<PathBuf>,
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./offline-sync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/offline-sync/config.yaml
  ///
  /// With no file at all the defaults apply, which keeps every write local.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => {
        tracing::debug!("No configuration file found, using defaults");
        Ok(Self::default())
      }
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from(format!("{}.yaml", APP_DIR));
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join(APP_DIR).join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents).map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  fn parse(contents: &str) -> Result<Self> {
    // An empty file deserializes to null
    if contents.trim().is_empty() {
      return Ok(Self::default());
    }
    serde_yaml::from_str(contents).map_err(|e| eyre!("{}", e))
  }

  /// Owner identity. The environment wins over the file.
  pub fn owner_id(&self) -> Option<String> {
    std::env::var("OFFLINE_SYNC_OWNER_ID")
      .ok()
      .filter(|v| !v.trim().is_empty())
      .or_else(|| self.owner_id.clone())
  }

  /// Get the backend access token from environment variables.
  ///
  /// Checks OFFLINE_SYNC_ACCESS_TOKEN first, then SUPABASE_ACCESS_TOKEN as fallback.
  pub fn get_access_token() -> Result<String> {
    std::env::var("OFFLINE_SYNC_ACCESS_TOKEN")
      .or_else(|_| std::env::var("SUPABASE_ACCESS_TOKEN"))
      .map_err(|_| {
        eyre!(
          "Access token not found. Set OFFLINE_SYNC_ACCESS_TOKEN or SUPABASE_ACCESS_TOKEN environment variable."
        )
      })
  }
}

/// Per-user data directory for the store and logs.
pub fn data_dir() -> Result<PathBuf> {
  dirs::data_dir()
    .map(|d| d.join(APP_DIR))
    .ok_or_else(|| eyre!("Could not determine data directory"))
}
