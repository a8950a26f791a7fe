//! Remote document store collaborator and a filesystem-backed implementation.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::debug;

use crate::cache::DocumentPath;
use crate::error::{RemoteError, RemoteErrorKind};

/// Async key-addressed document database.
///
/// `Ok(None)` means the document does not exist. Offline conditions are
/// reported with [`RemoteErrorKind::Unavailable`].
#[async_trait]
pub trait RemoteStore: Send + Sync + 'static {
  /// Read from the store's client-side replica.
  async fn get_from_cache(&self, path: &DocumentPath) -> Result<Option<Value>, RemoteError>;

  /// Read from the authoritative server.
  async fn get_from_server(&self, path: &DocumentPath) -> Result<Option<Value>, RemoteError>;

  /// Overwrite the document at `path`.
  async fn put(&self, path: &DocumentPath, document: Value) -> Result<(), RemoteError>;
}

/// Document store rooted in a directory, typically a mounted sync folder.
///
/// Documents live at `<root>/<documentPath>.json`. When the root itself is
/// missing the store is treated as unreachable.
pub struct FsRemoteStore {
  root: PathBuf,
  replica: Mutex<HashMap<DocumentPath, Value>>,
}

impl FsRemoteStore {
  pub fn new(root: impl Into<PathBuf>) -> Self {
    Self {
      root: root.into(),
      replica: Mutex::new(HashMap::new()),
    }
  }

  fn file_path(&self, path: &DocumentPath) -> PathBuf {
    let mut file = self.root.clone();
    for segment in path.segments() {
      file.push(segment);
    }
    let mut name = file.into_os_string();
    name.push(".json");
    PathBuf::from(name)
  }

  async fn ensure_reachable(&self) -> Result<(), RemoteError> {
    match tokio::fs::metadata(&self.root).await {
      Ok(meta) if meta.is_dir() => Ok(()),
      Ok(_) => Err(RemoteError::unavailable(format!(
        "{} is not a directory",
        self.root.display()
      ))),
      Err(e) => Err(RemoteError::unavailable(format!(
        "{} is not reachable: {}",
        self.root.display(),
        e
      ))),
    }
  }

  fn remember(&self, path: &DocumentPath, document: &Value) {
    if let Ok(mut replica) = self.replica.lock() {
      replica.insert(path.clone(), document.clone());
    }
  }
}

fn io_error(err: std::io::Error, path: &Path) -> RemoteError {
  let kind = match err.kind() {
    ErrorKind::PermissionDenied => RemoteErrorKind::PermissionDenied,
    ErrorKind::NotConnected
    | ErrorKind::ConnectionRefused
    | ErrorKind::ConnectionReset
    | ErrorKind::ConnectionAborted
    | ErrorKind::TimedOut => RemoteErrorKind::Unavailable,
    _ => RemoteErrorKind::Other,
  };
  RemoteError::new(kind, format!("{}: {}", path.display(), err))
}

#[async_trait]
impl RemoteStore for FsRemoteStore {
  async fn get_from_cache(&self, path: &DocumentPath) -> Result<Option<Value>, RemoteError> {
    let replica = self
      .replica
      .lock()
      .map_err(|e| RemoteError::other(format!("replica lock poisoned: {}", e)))?;
    Ok(replica.get(path).cloned())
  }

  async fn get_from_server(&self, path: &DocumentPath) -> Result<Option<Value>, RemoteError> {
    self.ensure_reachable().await?;

    let file = self.file_path(path);
    let contents = match tokio::fs::read_to_string(&file).await {
      Ok(contents) => contents,
      Err(e) if e.kind() == ErrorKind::NotFound => {
        debug!(%path, "document does not exist");
        return Ok(None);
      }
      Err(e) => return Err(io_error(e, &file)),
    };

    let document: Value = serde_json::from_str(&contents)
      .map_err(|e| RemoteError::malformed(format!("{}: {}", file.display(), e)))?;
    self.remember(path, &document);

    Ok(Some(document))
  }

  async fn put(&self, path: &DocumentPath, document: Value) -> Result<(), RemoteError> {
    self.ensure_reachable().await?;

    let file = self.file_path(path);
    if let Some(parent) = file.parent() {
      tokio::fs::create_dir_all(parent)
        .await
        .map_err(|e| io_error(e, parent))?;
    }

    let body = serde_json::to_vec_pretty(&document)
      .map_err(|e| RemoteError::malformed(format!("{}: {}", path, e)))?;

    // Write to a sibling temp file and rename so readers never see a torn document
    let tmp = file.with_extension("json.tmp");
    tokio::fs::write(&tmp, body)
      .await
      .map_err(|e| io_error(e, &tmp))?;
    tokio::fs::rename(&tmp, &file)
      .await
      .map_err(|e| io_error(e, &file))?;

    self.remember(path, &document);
    Ok(())
  }
}
