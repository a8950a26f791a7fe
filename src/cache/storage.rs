//! Local key-value storage and the typed cache wrapper on top of it.

use chrono::Utc;
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

use super::key::CacheKey;
use super::traits::Syncable;

/// Trait for local persistent key-value backends.
///
/// Both operations are synchronous. Callers never let a failure escape:
/// the remote store is the durability backstop.
pub trait LocalStore: Send + Sync {
  /// Read the raw value stored under `raw_key`.
  fn read(&self, raw_key: &str) -> Option<String>;

  /// Overwrite the value stored under `raw_key`.
  fn write(&self, raw_key: &str, value: &str) -> Result<()>;
}

/// In-memory storage, used for ephemeral sessions and tests.
#[derive(Default)]
pub struct MemoryStorage {
  entries: Mutex<HashMap<String, String>>,
  fail_writes: AtomicBool,
}

impl MemoryStorage {
  pub fn new() -> Self {
    Self::default()
  }

  /// Make every subsequent write fail, as a full quota would.
  pub fn set_fail_writes(&self, fail: bool) {
    self.fail_writes.store(fail, Ordering::SeqCst);
  }

  /// Seed a raw value, bypassing serialization.
  pub fn insert_raw(&self, raw_key: &str, value: &str) {
    if let Ok(mut entries) = self.entries.lock() {
      entries.insert(raw_key.to_string(), value.to_string());
    }
  }
}

impl LocalStore for MemoryStorage {
  fn read(&self, raw_key: &str) -> Option<String> {
    self.entries.lock().ok()?.get(raw_key).cloned()
  }

  fn write(&self, raw_key: &str, value: &str) -> Result<()> {
    if self.fail_writes.load(Ordering::SeqCst) {
      return Err(eyre!("Local storage quota exceeded"));
    }
    self
      .entries
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?
      .insert(raw_key.to_string(), value.to_string());
    Ok(())
  }
}

/// SQLite-based local storage implementation.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Open the storage at `path`, or at the default location.
  pub fn open(path: Option<&Path>) -> Result<Self> {
    let path = match path {
      Some(p) => p.to_path_buf(),
      None => Self::default_path()?,
    };

    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(&path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    let storage = Self {
      conn: Mutex::new(conn),
    };
    storage.run_migrations()?;

    Ok(storage)
  }

  /// Get the default database path.
  fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("daybook").join("local.db"))
  }

  fn run_migrations(&self) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute_batch(LOCAL_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;

    Ok(())
  }
}

const LOCAL_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS kv_cache (
    raw_key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    written_at TEXT NOT NULL
);
"#;

impl LocalStore for SqliteStorage {
  fn read(&self, raw_key: &str) -> Option<String> {
    let conn = self.conn.lock().ok()?;

    conn
      .query_row(
        "SELECT value FROM kv_cache WHERE raw_key = ?",
        params![raw_key],
        |row| row.get(0),
      )
      .optional()
      .unwrap_or_else(|e| {
        debug!(raw_key, error = %e, "local read failed");
        None
      })
  }

  fn write(&self, raw_key: &str, value: &str) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute(
        "INSERT OR REPLACE INTO kv_cache (raw_key, value, written_at) VALUES (?, ?, ?)",
        params![raw_key, value, Utc::now().to_rfc3339()],
      )
      .map_err(|e| eyre!("Failed to store {}: {}", raw_key, e))?;

    Ok(())
  }
}

/// Typed record cache keyed by [`CacheKey`].
///
/// Malformed content reads as absent and failed writes are logged and
/// dropped; neither ever reaches the caller.
pub struct LocalCacheStore<L: LocalStore> {
  storage: Arc<L>,
}

impl<L: LocalStore> LocalCacheStore<L> {
  pub fn new(storage: L) -> Self {
    Self::from_arc(Arc::new(storage))
  }

  pub fn from_arc(storage: Arc<L>) -> Self {
    Self { storage }
  }

  pub fn get<T: Syncable>(&self, key: &CacheKey) -> Option<T> {
    let raw = self.storage.read(&key.raw_key())?;
    match serde_json::from_str(&raw) {
      Ok(record) => Some(record),
      Err(e) => {
        debug!(%key, error = %e, "discarding malformed local cache entry");
        None
      }
    }
  }

  pub fn put<T: Syncable>(&self, key: &CacheKey, record: &T) {
    let raw = match serde_json::to_string(record) {
      Ok(raw) => raw,
      Err(e) => {
        warn!(%key, error = %e, "failed to serialize record for local cache");
        return;
      }
    };

    if let Err(e) = self.storage.write(&key.raw_key(), &raw) {
      warn!(%key, error = %e, "local cache write failed");
    }
  }
}

impl<L: LocalStore> Clone for LocalCacheStore<L> {
  fn clone(&self) -> Self {
    Self {
      storage: Arc::clone(&self.storage),
    }
  }
}
