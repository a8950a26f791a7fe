//! Debounced remote writer that coalesces bursts of edits.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::cache::{CacheKey, LocalCacheStore, LocalStore, Syncable};
use crate::error::RemoteError;

use super::deadline::with_deadline;
use super::remote::RemoteStore;

/// How a flush ended.
#[derive(Debug, Clone)]
pub enum FlushOutcome {
  /// Remote store acknowledged the write
  Saved,
  /// Remote write skipped for a transient reason; the local copy stands
  Deferred(RemoteError),
  /// Remote write failed and will not be retried automatically
  Failed(RemoteError),
}

impl FlushOutcome {
  pub fn is_saved(&self) -> bool {
    matches!(self, FlushOutcome::Saved)
  }
}

/// Emitted when a timer-driven flush finishes.
#[derive(Debug, Clone)]
pub struct FlushEvent {
  pub key: CacheKey,
  /// Sequence number returned by the `schedule` call that produced this flush
  pub seq: u64,
  pub outcome: FlushOutcome,
}

struct PendingWrite<T> {
  seq: u64,
  record: T,
  timer: JoinHandle<()>,
}

/// Coalesces edits per key into one remote write after an idle interval.
///
/// Only the latest scheduled record is ever flushed. A flush already in
/// flight is never cancelled by a later `schedule`.
pub struct DebouncedWriter<T: Syncable, L: LocalStore, R: RemoteStore> {
  local: LocalCacheStore<L>,
  remote: Arc<R>,
  idle: Duration,
  deadline: Duration,
  pending: Arc<Mutex<HashMap<CacheKey, PendingWrite<T>>>>,
  next_seq: Arc<AtomicU64>,
  events: Option<mpsc::UnboundedSender<FlushEvent>>,
}

impl<T: Syncable, L: LocalStore + 'static, R: RemoteStore> DebouncedWriter<T, L, R> {
  pub fn new(
    local: LocalCacheStore<L>,
    remote: Arc<R>,
    idle: Duration,
    deadline: Duration,
  ) -> Self {
    Self {
      local,
      remote,
      idle,
      deadline,
      pending: Arc::new(Mutex::new(HashMap::new())),
      next_seq: Arc::new(AtomicU64::new(0)),
      events: None,
    }
  }

  /// Report timer-driven flush completions on `events`.
  pub fn with_events(mut self, events: mpsc::UnboundedSender<FlushEvent>) -> Self {
    self.events = Some(events);
    self
  }

  fn pending(&self) -> MutexGuard<'_, HashMap<CacheKey, PendingWrite<T>>> {
    self.pending.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// Arm or re-arm the idle timer for `key` with `record` as the payload.
  ///
  /// Returns the sequence number carried by the eventual [`FlushEvent`].
  pub fn schedule(&self, key: &CacheKey, record: T) -> u64 {
    let seq = self.next_seq.fetch_add(1, Ordering::SeqCst) + 1;

    // Hold the map while spawning so the timer can never look before the insert
    let mut pending = self.pending();

    let writer = self.clone();
    let task_key = key.clone();
    let timer = tokio::spawn(async move {
      tokio::time::sleep(writer.idle).await;
      let Some(record) = writer.take_if_current(&task_key, seq) else {
        return;
      };
      let outcome = writer.flush(&task_key, &record).await;
      writer.emit(task_key, seq, outcome);
    });

    let previous = pending.insert(
      key.clone(),
      PendingWrite {
        seq,
        record,
        timer,
      },
    );
    if let Some(previous) = previous {
      previous.timer.abort();
    }

    seq
  }

  /// Clear a pending timer without flushing. Returns the unflushed record.
  pub fn cancel(&self, key: &CacheKey) -> Option<T> {
    let previous = self.pending().remove(key)?;
    previous.timer.abort();
    Some(previous.record)
  }

  /// Whether a timer is armed for `key`.
  pub fn is_pending(&self, key: &CacheKey) -> bool {
    self.pending().contains_key(key)
  }

  /// Flush `record` immediately, dropping any pending timer for `key`.
  pub async fn flush_now(&self, key: &CacheKey, record: &T) -> FlushOutcome {
    self.cancel(key);
    self.flush(key, record).await
  }

  fn take_if_current(&self, key: &CacheKey, seq: u64) -> Option<T> {
    let mut pending = self.pending();
    if pending.get(key).map(|p| p.seq) != Some(seq) {
      return None;
    }
    pending.remove(key).map(|p| p.record)
  }

  async fn flush(&self, key: &CacheKey, record: &T) -> FlushOutcome {
    self.local.put(key, record);

    let document = match serde_json::to_value(record) {
      Ok(document) => document,
      Err(e) => {
        error!(%key, error = %e, "failed to encode record for remote write");
        return FlushOutcome::Failed(RemoteError::malformed(e.to_string()));
      }
    };

    let remote = Arc::clone(&self.remote);
    let path = key.document_path();
    match with_deadline(self.deadline, async move { remote.put(&path, document).await }).await {
      Ok(()) => {
        debug!(%key, "remote write saved");
        FlushOutcome::Saved
      }
      Err(e) if e.is_ignorable() => {
        debug!(%key, error = %e, "remote write deferred, local copy kept");
        FlushOutcome::Deferred(e)
      }
      Err(e) => {
        error!(%key, error = %e, "remote write failed");
        FlushOutcome::Failed(e)
      }
    }
  }

  fn emit(&self, key: CacheKey, seq: u64, outcome: FlushOutcome) {
    if let Some(events) = &self.events {
      // Receiver gone means the controller was dropped
      let _ = events.send(FlushEvent { key, seq, outcome });
    }
  }
}

impl<T: Syncable, L: LocalStore, R: RemoteStore> Clone for DebouncedWriter<T, L, R> {
  fn clone(&self) -> Self {
    Self {
      local: self.local.clone(),
      remote: Arc::clone(&self.remote),
      idle: self.idle,
      deadline: self.deadline,
      pending: Arc::clone(&self.pending),
      next_seq: Arc::clone(&self.next_seq),
      events: self.events.clone(),
    }
  }
}
