use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use serde_json::{json, Value};
use std::path::PathBuf;

use daybook::cache::{SqliteStorage, Syncable};
use daybook::config::Config;
use daybook::logging;
use daybook::records::{GraphSeries, JournalEntry, MonthlyTasks, TrackerGrid};
use daybook::sync::{FlushOutcome, FsRemoteStore, SyncController, SyncTimings};
use daybook::{CacheKey, ResourceKind};

#[derive(Parser, Debug)]
#[command(name = "daybook")]
#[command(about = "Local-first sync for journal, trackers and graphs")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/daybook/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// User id to act as (overrides config and DAYBOOK_USER)
  #[arg(short, long)]
  user: Option<String>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Load a period and print where it settled
  Show {
    /// journal, tracker, graph or monthly-tasks
    kind: ResourceKind,
    /// YYYY-MM-DD for journal, YYYY-MM otherwise
    period: String,
  },
  /// Apply a JSON merge patch and save it
  Edit {
    kind: ResourceKind,
    period: String,
    patch: String,
  },
  /// Write the local record remotely even if the remote copy could not be read
  ForceSave {
    kind: ResourceKind,
    period: String,
    patch: Option<String>,
  },
}

impl Command {
  fn kind(&self) -> ResourceKind {
    match self {
      Command::Show { kind, .. }
      | Command::Edit { kind, .. }
      | Command::ForceSave { kind, .. } => *kind,
    }
  }
}

struct Session {
  user: String,
  local: SqliteStorage,
  remote: FsRemoteStore,
  timings: SyncTimings,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let config = Config::load(args.config.as_deref())?;
  let _guard = logging::init(&config.log_dir()?, &config.log.level)?;

  let session = Session {
    user: config.user_id(args.user.as_deref())?,
    local: SqliteStorage::open(config.local.path.as_deref())?,
    remote: FsRemoteStore::new(&config.remote.root),
    timings: config.sync.timings(),
  };

  let output = match args.command.kind() {
    ResourceKind::Journal => run::<JournalEntry>(args.command, session).await?,
    ResourceKind::Tracker => run::<TrackerGrid>(args.command, session).await?,
    ResourceKind::Graph => run::<GraphSeries>(args.command, session).await?,
    ResourceKind::MonthlyTasks => run::<MonthlyTasks>(args.command, session).await?,
  };

  println!("{}", serde_json::to_string_pretty(&output)?);
  Ok(())
}

async fn run<T: Syncable>(command: Command, session: Session) -> Result<Value> {
  let controller: SyncController<T, _, _> =
    SyncController::new(session.local, session.remote, session.timings);

  match command {
    Command::Show { period, .. } => {
      let key = CacheKey::new(session.user, T::kind(), period)?;
      controller.load(key.clone()).await?;
      describe(&controller, &key, None)
    }
    Command::Edit { period, patch, .. } => {
      let key = CacheKey::new(session.user, T::kind(), period)?;
      controller.load(key.clone()).await?;
      controller.edit_json(&key, &parse_patch(&patch)?)?;

      let mut report = describe(&controller, &key, None)?;
      let flush = controller.dispose(&key).await;
      report["flush"] = match flush {
        Some(outcome) => flush_json(&outcome),
        None => json!("kept locally; remote copy was never read, use force-save"),
      };
      Ok(report)
    }
    Command::ForceSave { period, patch, .. } => {
      let key = CacheKey::new(session.user, T::kind(), period)?;
      controller.load(key.clone()).await?;
      if let Some(patch) = patch {
        controller.edit_json(&key, &parse_patch(&patch)?)?;
      }
      let outcome = controller.force_save(&key).await?;
      describe(&controller, &key, Some(&outcome))
    }
  }
}

fn parse_patch(patch: &str) -> Result<Value> {
  serde_json::from_str(patch).map_err(|e| eyre!("Patch is not valid JSON: {}", e))
}

fn describe<T: Syncable>(
  controller: &SyncController<T, SqliteStorage, FsRemoteStore>,
  key: &CacheKey,
  flush: Option<&FlushOutcome>,
) -> Result<Value> {
  let snapshot = controller
    .snapshot(key)
    .ok_or_else(|| eyre!("{} is no longer open", key))?;

  let mut report = json!({
    "key": key.to_string(),
    "state": format!("{:?}", snapshot.state),
    "source": snapshot.source.map(|s| format!("{:?}", s)),
    "offline": snapshot.offline,
    "lastError": snapshot.last_error,
    "record": snapshot.record,
  });
  if let Some(outcome) = flush {
    report["flush"] = flush_json(outcome);
  }
  Ok(report)
}

fn flush_json(outcome: &FlushOutcome) -> Value {
  match outcome {
    FlushOutcome::Saved => json!("saved"),
    FlushOutcome::Deferred(e) => json!({ "deferred": e.to_string() }),
    FlushOutcome::Failed(e) => json!({ "failed": e.to_string() }),
  }
}
