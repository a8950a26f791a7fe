//! Error types shared by the sync engine.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::cache::{CacheKey, ResourceKind};

/// Classification of a remote-store failure.
///
/// The kind is decided where the failure is produced (the remote store
/// implementation), so call sites never inspect error messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteErrorKind {
  /// Client is offline or the store cannot be reached
  Unavailable,
  /// The operation did not finish before its deadline
  DeadlineExceeded,
  /// The store refused the operation
  PermissionDenied,
  /// The stored document could not be decoded
  Malformed,
  /// Anything else
  Other,
}

impl fmt::Display for RemoteErrorKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      Self::Unavailable => "unavailable",
      Self::DeadlineExceeded => "deadline exceeded",
      Self::PermissionDenied => "permission denied",
      Self::Malformed => "malformed document",
      Self::Other => "remote error",
    };
    f.write_str(name)
  }
}

/// Failure reported by a [`RemoteStore`](crate::sync::RemoteStore).
#[derive(Debug, Clone, Error)]
#[error("{kind}: {message}")]
pub struct RemoteError {
  pub kind: RemoteErrorKind,
  pub message: String,
}

impl RemoteError {
  pub fn new(kind: RemoteErrorKind, message: impl Into<String>) -> Self {
    Self {
      kind,
      message: message.into(),
    }
  }

  pub fn unavailable(message: impl Into<String>) -> Self {
    Self::new(RemoteErrorKind::Unavailable, message)
  }

  pub fn timeout(deadline: Duration) -> Self {
    Self::new(
      RemoteErrorKind::DeadlineExceeded,
      format!("no response within {}ms", deadline.as_millis()),
    )
  }

  pub fn malformed(message: impl Into<String>) -> Self {
    Self::new(RemoteErrorKind::Malformed, message)
  }

  pub fn other(message: impl Into<String>) -> Self {
    Self::new(RemoteErrorKind::Other, message)
  }

  /// Transient failures that must not change user-visible error state.
  pub fn is_ignorable(&self) -> bool {
    matches!(
      self.kind,
      RemoteErrorKind::Unavailable | RemoteErrorKind::DeadlineExceeded
    )
  }
}

/// Misuse of the engine's public surface.
#[derive(Debug, Error)]
pub enum SyncError {
  #[error("invalid period '{period}' for {kind}: expected {expected}")]
  InvalidPeriod {
    kind: ResourceKind,
    period: String,
    expected: &'static str,
  },
  #[error("key {key} does not address a {expected} record")]
  KindMismatch {
    key: CacheKey,
    expected: ResourceKind,
  },
  #[error("{0} has not been loaded")]
  NotLoaded(CacheKey),
  #[error("nothing to save for {0}")]
  NothingToSave(CacheKey),
  #[error("patch could not be applied: {0}")]
  Patch(#[from] serde_json::Error),
}
