//! Two-stage remote read: replica first, then a deadline-bounded server read.

use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::cache::{CacheKey, Syncable};
use crate::error::RemoteError;

use super::deadline::with_deadline;
use super::remote::RemoteStore;

/// Result of a server read.
#[derive(Debug, Clone)]
pub enum FetchOutcome<T> {
  /// A round-trip completed; `None` means nothing is stored yet
  Resolved(Option<T>),
  /// The read failed; check [`RemoteError::is_ignorable`]
  Error(RemoteError),
}

impl<T> FetchOutcome<T> {
  pub fn error(&self) -> Option<&RemoteError> {
    match self {
      FetchOutcome::Error(e) => Some(e),
      FetchOutcome::Resolved(_) => None,
    }
  }
}

/// Remote reader that never blocks longer than a deadline.
pub struct TimedFetch<R: RemoteStore> {
  remote: Arc<R>,
}

impl<R: RemoteStore> TimedFetch<R> {
  pub fn new(remote: Arc<R>) -> Self {
    Self { remote }
  }

  /// Run the full two-stage fetch.
  ///
  /// A present replica document is handed to `on_replica` as soon as it is
  /// read; the returned outcome is the server read's.
  pub async fn fetch<T, F>(
    &self,
    key: &CacheKey,
    deadline: Duration,
    on_replica: F,
  ) -> FetchOutcome<T>
  where
    T: Syncable,
    F: FnOnce(T),
  {
    if let Some(record) = self.replica(key).await {
      on_replica(record);
    }
    self.server(key, deadline).await
  }

  /// Read the remote store's client-side replica. Any failure is a miss.
  pub async fn replica<T: Syncable>(&self, key: &CacheKey) -> Option<T> {
    match self.remote.get_from_cache(&key.document_path()).await {
      Ok(Some(document)) => match decode(document) {
        Ok(record) => Some(record),
        Err(e) => {
          debug!(%key, error = %e, "ignoring undecodable replica document");
          None
        }
      },
      Ok(None) => None,
      Err(e) => {
        debug!(%key, error = %e, "replica read failed, treating as miss");
        None
      }
    }
  }

  /// Read the authoritative server, racing `deadline`.
  pub async fn server<T: Syncable>(&self, key: &CacheKey, deadline: Duration) -> FetchOutcome<T> {
    let remote = Arc::clone(&self.remote);
    let path = key.document_path();

    let result = with_deadline(deadline, async move { remote.get_from_server(&path).await })
      .await
      .and_then(|document| document.map(decode::<T>).transpose());

    match result {
      Ok(record) => FetchOutcome::Resolved(record),
      Err(e) => {
        if e.is_ignorable() {
          debug!(%key, error = %e, "server read skipped");
        } else {
          warn!(%key, error = %e, "server read failed");
        }
        FetchOutcome::Error(e)
      }
    }
  }
}

impl<R: RemoteStore> Clone for TimedFetch<R> {
  fn clone(&self) -> Self {
    Self {
      remote: Arc::clone(&self.remote),
    }
  }
}

fn decode<T: Syncable>(document: Value) -> Result<T, RemoteError> {
  serde_json::from_value(document).map_err(|e| RemoteError::malformed(e.to_string()))
}
