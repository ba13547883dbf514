use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use serde::Serialize;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use offline_sync::auth::{AuthProvider, StaticAuth};
use offline_sync::cache::{AppendOptions, LocalStore, SetOptions, SqliteStorage, DEFAULT_MAX_ITEMS};
use offline_sync::config::{data_dir, Config};
use offline_sync::connectivity::Connectivity;
use offline_sync::queue::PendingQueue;
use offline_sync::remote::{RemoteBackend, RestBackend};
use offline_sync::sync::{SyncEngine, SyncEvent, SyncHandle, SyncScheduler};
use offline_sync::unified::{GetOptions, UnifiedStorage};

#[derive(Parser, Debug)]
#[command(name = "offline-sync")]
#[command(about = "Offline-first key-value store that syncs to a PostgREST backend")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/offline-sync/config.yaml)
  #[arg(short, long, global = true)]
  config: Option<PathBuf>,

  /// Also log to stderr
  #[arg(short, long, global = true)]
  verbose: bool,

  /// Treat the device as offline regardless of the backend
  #[arg(long, global = true)]
  offline: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Store a value (JSON, or a plain string)
  Save {
    key: String,
    value: String,
    /// Keep the write on this device
    #[arg(long)]
    local: bool,
  },
  /// Read a value, or list keys when none is given
  Get {
    key: Option<String>,
    /// Refresh from the remote first
    #[arg(long)]
    remote: bool,
  },
  /// Prepend an item to a list
  Append {
    key: String,
    item: String,
    /// Field identifying duplicates
    #[arg(long)]
    dedupe: Option<String>,
    #[arg(long, default_value_t = DEFAULT_MAX_ITEMS)]
    max_items: usize,
    #[arg(long)]
    local: bool,
  },
  /// Delete a value locally
  Remove { key: String },
  /// Show sync status
  Status,
  /// Drain the pending queue
  Sync {
    /// Retry with backoff instead of a single pass
    #[arg(long)]
    retry: bool,
  },
  /// Refresh every table from the remote
  Pull,
  /// Queue all local data and push it
  Push,
  /// List pending changes
  Queue,
  /// List changes that exhausted their retries
  DeadLetters,
  /// Move dead-lettered changes back into the queue
  Requeue,
  /// Keep syncing in the foreground until interrupted
  Watch,
}

struct App {
  storage: UnifiedStorage,
  scheduler: SyncHandle,
  scheduler_task: tokio::task::JoinHandle<()>,
  backend: Arc<dyn RemoteBackend>,
  connectivity: Connectivity,
  force_offline: bool,
}

impl App {
  async fn build(config: &Config, force_offline: bool) -> Result<Self> {
    let kv = Arc::new(SqliteStorage::open(config.storage.path.as_deref())?);
    let queue = Arc::new(PendingQueue::new(kv.clone()));
    let auth = Arc::new(StaticAuth::from_config(config));
    let backend: Arc<dyn RemoteBackend> = Arc::new(RestBackend::new(&config.backend, auth.clone())?);

    let online = !force_offline && backend.ping().await.is_ok();
    let connectivity = Connectivity::new(online);
    info!(online, authenticated = auth.is_authenticated(), "Starting");

    let engine = Arc::new(SyncEngine::new(
      kv.clone(),
      queue.clone(),
      backend.clone(),
      auth.clone(),
      connectivity.clone(),
      config.sync.settings(),
    ));
    let (scheduler, scheduler_task) = SyncScheduler::spawn(engine.clone(), config.sync.interval());
    let local = LocalStore::new(kv, queue, auth).with_notifier(scheduler.clone());

    Ok(Self {
      storage: UnifiedStorage::new(local, engine),
      scheduler,
      scheduler_task,
      backend,
      connectivity,
      force_offline,
    })
  }

  /// Let queued scheduler work finish, then stop it.
  async fn shutdown(self) -> Result<()> {
    self.scheduler.shutdown();
    self
      .scheduler_task
      .await
      .map_err(|e| eyre!("Sync scheduler panicked: {}", e))
  }
}

fn parse_value(raw: &str) -> Value {
  serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
  let out = serde_json::to_string_pretty(value).map_err(|e| eyre!("Failed to format output: {}", e))?;
  println!("{}", out);
  Ok(())
}

async fn run(app: &App, command: Command, config: &Config) -> Result<()> {
  let storage = &app.storage;
  match command {
    Command::Save { key, value, local } => {
      let options = SetOptions { skip_sync: local };
      storage.save(&key, parse_value(&value), options)?;
    }
    Command::Get { key: Some(key), remote } => {
      let options = GetOptions {
        force_remote: remote,
      };
      match storage.get(&key, options).await? {
        Some(value) => print_json(&value)?,
        None => return Err(eyre!("No value stored under {}", key)),
      }
    }
    Command::Get { key: None, .. } => {
      for key in storage.local().keys()? {
        println!("{}", key);
      }
    }
    Command::Append {
      key,
      item,
      dedupe,
      max_items,
      local,
    } => {
      let options = AppendOptions {
        dedupe_key: dedupe,
        max_items,
        skip_sync: local,
      };
      let list = storage.append(&key, parse_value(&item), options)?;
      println!("{} items", list.len());
    }
    Command::Remove { key } => storage.remove(&key)?,
    Command::Status => print_json(&storage.status()?)?,
    Command::Sync { retry: false } => print_json(&app.scheduler.sync_now().await?)?,
    Command::Sync { retry: true } => {
      let engine = storage.engine();
      let outcome = engine
        .sync_with_retry(engine.settings().retry.max_attempts)
        .await?;
      print_json(&outcome)?;
    }
    Command::Pull => print_json(&storage.pull_from_remote().await)?,
    Command::Push => print_json(&storage.migrate_to_remote().await?)?,
    Command::Queue => print_json(&storage.engine().queue().all()?)?,
    Command::DeadLetters => print_json(&storage.engine().queue().dead_letters()?)?,
    Command::Requeue => {
      let moved = storage.engine().queue().requeue_dead_letters()?;
      if moved > 0 {
        app.scheduler.notify_enqueued();
      }
      println!("Requeued {} changes", moved);
    }
    Command::Watch => watch(app, config).await?,
  }
  Ok(())
}

async fn watch(app: &App, config: &Config) -> Result<()> {
  let probe = config
    .sync
    .probe_interval()
    .filter(|_| !app.force_offline)
    .map(|interval| app.connectivity.spawn_probe(app.backend.clone(), interval));
  let mut events = app.scheduler.subscribe();
  app.scheduler.notify_reconnected();

  loop {
    tokio::select! {
      _ = tokio::signal::ctrl_c() => break,
      event = events.recv() => match event {
        Ok(SyncEvent::Drained { trigger, report }) if report.attempted > 0 => {
          println!("{:?}: synced {} failed {}", trigger, report.synced, report.failed);
        }
        Ok(SyncEvent::Retried { trigger, outcome }) => {
          println!("{:?}: synced {} failed {} after {} passes", trigger, outcome.synced, outcome.failed, outcome.attempts);
        }
        Ok(SyncEvent::Failed { trigger, error }) => eprintln!("{:?}: {}", trigger, error),
        Ok(_) => {}
        Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
          tracing::warn!(skipped, "Event stream lagged");
        }
        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
      },
    }
  }

  if let Some(probe) = probe {
    probe.abort();
  }
  Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  let config = Config::load(args.config.as_deref())?;
  let _log_guard = offline_sync::logging::init(&data_dir()?, args.verbose)?;

  let app = App::build(&config, args.offline).await?;
  let result = run(&app, args.command, &config).await;
  app.shutdown().await?;

  result
}
