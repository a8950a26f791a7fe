//! Per-period load/save lifecycle and its observable state.

use chrono::Utc;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::cache::{merge_patch, CacheKey, LocalCacheStore, LocalStore, RecordSource, Syncable};
use crate::error::SyncError;

use super::fetch::{FetchOutcome, TimedFetch};
use super::remote::RemoteStore;
use super::writer::{DebouncedWriter, FlushEvent, FlushOutcome};

/// Sync status of the displayed period.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
  Idle,
  Loading,
  Syncing,
  Saving,
  LoadFailed,
  Synced,
}

impl SyncState {
  /// `Synced` and `LoadFailed` are where a period comes to rest.
  pub fn is_settled(self) -> bool {
    matches!(self, SyncState::Synced | SyncState::LoadFailed)
  }
}

/// Timers used by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncTimings {
  /// Idle interval before coalesced edits are written remotely
  pub debounce: Duration,
  /// Deadline for server reads
  pub read_deadline: Duration,
  /// Deadline for server writes
  pub write_deadline: Duration,
}

impl Default for SyncTimings {
  fn default() -> Self {
    Self {
      debounce: Duration::from_millis(1000),
      read_deadline: Duration::from_millis(3000),
      write_deadline: Duration::from_millis(3000),
    }
  }
}

/// Everything a view needs to render one period.
#[derive(Debug, Clone)]
pub struct SyncSnapshot<T> {
  pub state: SyncState,
  /// `None` until something was found or edited; render the default
  pub record: Option<T>,
  pub source: Option<RecordSource>,
  /// The last remote attempt failed for a transient reason
  pub offline: bool,
  pub last_error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoadPhase {
  Loading,
  Syncing,
  Done { failed: bool },
}

struct Slot<T> {
  generation: u64,
  phase: LoadPhase,
  record: Option<T>,
  source: Option<RecordSource>,
  /// A local or replica snapshot was shown before the server answered
  has_fallback: bool,
  edited: bool,
  /// Edited while the remote record was unread; not yet handed to the writer
  unsent: bool,
  pending_seq: Option<u64>,
  force_saving: bool,
  offline: bool,
  last_error: Option<String>,
  tx: watch::Sender<SyncSnapshot<T>>,
}

impl<T: Syncable> Slot<T> {
  fn new(generation: u64) -> Self {
    let (tx, _) = watch::channel(SyncSnapshot {
      state: SyncState::Loading,
      record: None,
      source: None,
      offline: false,
      last_error: None,
    });

    Self {
      generation,
      phase: LoadPhase::Loading,
      record: None,
      source: None,
      has_fallback: false,
      edited: false,
      unsent: false,
      pending_seq: None,
      force_saving: false,
      offline: false,
      last_error: None,
      tx,
    }
  }

  fn state(&self) -> SyncState {
    if self.pending_seq.is_some() || self.force_saving {
      return SyncState::Saving;
    }
    match self.phase {
      LoadPhase::Loading => SyncState::Loading,
      LoadPhase::Syncing => SyncState::Syncing,
      LoadPhase::Done { failed: true } => SyncState::LoadFailed,
      LoadPhase::Done { failed: false } => SyncState::Synced,
    }
  }

  fn load_failed(&self) -> bool {
    self.phase == LoadPhase::Done { failed: true }
  }

  fn snapshot(&self) -> SyncSnapshot<T> {
    SyncSnapshot {
      state: self.state(),
      record: self.record.clone(),
      source: self.source,
      offline: self.offline,
      last_error: self.last_error.clone(),
    }
  }

  fn publish(&self) {
    self.tx.send_replace(self.snapshot());
  }

  /// Show a remote snapshot unless the user already edited this period.
  fn apply_remote(&mut self, record: T, source: RecordSource) -> bool {
    if self.edited {
      return false;
    }
    self.record = Some(record);
    self.source = Some(source);
    true
  }
}

struct Inner<T: Syncable, L: LocalStore, R: RemoteStore> {
  local: LocalCacheStore<L>,
  fetch: TimedFetch<R>,
  writer: DebouncedWriter<T, L, R>,
  timings: SyncTimings,
  slots: Mutex<HashMap<CacheKey, Slot<T>>>,
  next_generation: AtomicU64,
}

impl<T: Syncable, L: LocalStore + 'static, R: RemoteStore> Inner<T, L, R> {
  fn slots(&self) -> MutexGuard<'_, HashMap<CacheKey, Slot<T>>> {
    self.slots.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// Run `f` on the slot for `key` and publish the result.
  ///
  /// With `generation` set, a slot that was replaced since is left alone.
  fn update<X>(
    &self,
    key: &CacheKey,
    generation: Option<u64>,
    f: impl FnOnce(&mut Slot<T>) -> X,
  ) -> Option<X> {
    let mut slots = self.slots();
    let slot = slots.get_mut(key)?;
    if generation.is_some_and(|g| g != slot.generation) {
      return None;
    }
    let out = f(slot);
    slot.publish();
    Some(out)
  }

  fn finish_load(&self, key: &CacheKey, generation: u64, outcome: FetchOutcome<T>) -> SyncState {
    self
      .update(key, Some(generation), |slot| {
        match outcome {
          FetchOutcome::Resolved(found) => {
            if let Some(record) = found {
              if slot.apply_remote(record.clone(), RecordSource::Server) {
                self.local.put(key, &record);
              }
            }
            slot.phase = LoadPhase::Done { failed: false };
            slot.offline = false;
            slot.last_error = None;
          }
          FetchOutcome::Error(e) if e.is_ignorable() => {
            slot.phase = LoadPhase::Done { failed: false };
            slot.offline = true;
          }
          FetchOutcome::Error(e) if slot.has_fallback => {
            warn!(%key, error = %e, "server read failed, keeping cached record");
            slot.phase = LoadPhase::Done { failed: false };
            slot.last_error = Some(e.to_string());
          }
          FetchOutcome::Error(e) => {
            error!(%key, error = %e, "load failed with nothing to show");
            slot.phase = LoadPhase::Done { failed: true };
            slot.last_error = Some(e.to_string());
            // Edits made while syncing stay local until a retry or force-save
            if self.writer.cancel(key).is_some() {
              slot.pending_seq = None;
              slot.unsent = true;
            }
          }
        }
        self.resume_unsent(key, slot);
        slot.state()
      })
      .unwrap_or(SyncState::Idle)
  }

  /// Schedule an edit that was held back by a failed load, once the load
  /// is no longer failed.
  fn resume_unsent(&self, key: &CacheKey, slot: &mut Slot<T>) {
    if !slot.unsent || slot.load_failed() {
      return;
    }
    slot.unsent = false;
    if let Some(record) = slot.record.clone() {
      debug!(%key, "scheduling edit held back by the failed load");
      slot.pending_seq = Some(self.writer.schedule(key, record));
    }
  }

  fn on_flush(&self, event: FlushEvent) {
    self.update(&event.key, None, |slot| {
      if slot.pending_seq != Some(event.seq) {
        return;
      }
      slot.pending_seq = None;
      match event.outcome {
        FlushOutcome::Saved => {
          slot.offline = false;
          slot.last_error = None;
        }
        FlushOutcome::Deferred(_) => slot.offline = true,
        FlushOutcome::Failed(e) => slot.last_error = Some(e.to_string()),
      }
    });
  }
}

/// Orchestrates load and save for every displayed period of one record type.
///
/// Each [`CacheKey`] gets its own state machine. Loading a different period
/// for the same user and resource kind disposes the previous one, flushing
/// any edit still waiting on the debounce timer.
pub struct SyncController<T: Syncable, L: LocalStore, R: RemoteStore> {
  inner: Arc<Inner<T, L, R>>,
}

impl<T: Syncable, L: LocalStore + 'static, R: RemoteStore> SyncController<T, L, R> {
  /// Create a controller. Must be called from within a Tokio runtime.
  pub fn new(local: L, remote: R, timings: SyncTimings) -> Self {
    Self::from_parts(LocalCacheStore::new(local), Arc::new(remote), timings)
  }

  pub fn from_parts(local: LocalCacheStore<L>, remote: Arc<R>, timings: SyncTimings) -> Self {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let writer = DebouncedWriter::new(
      local.clone(),
      Arc::clone(&remote),
      timings.debounce,
      timings.write_deadline,
    )
    .with_events(tx);

    let inner = Arc::new(Inner {
      local,
      fetch: TimedFetch::new(remote),
      writer,
      timings,
      slots: Mutex::new(HashMap::new()),
      next_generation: AtomicU64::new(0),
    });

    let weak: Weak<Inner<T, L, R>> = Arc::downgrade(&inner);
    tokio::spawn(async move {
      while let Some(event) = rx.recv().await {
        let Some(inner) = weak.upgrade() else {
          break;
        };
        inner.on_flush(event);
      }
    });

    Self { inner }
  }

  fn check_kind(&self, key: &CacheKey) -> Result<(), SyncError> {
    if key.kind() != T::kind() {
      return Err(SyncError::KindMismatch {
        key: key.clone(),
        expected: T::kind(),
      });
    }
    Ok(())
  }

  /// Open a period: paint from the local cache, then sync with the remote store.
  ///
  /// Returns once the remote stage has settled.
  pub async fn load(&self, key: CacheKey) -> Result<SyncState, SyncError> {
    self.check_kind(&key)?;

    let previous: Vec<CacheKey> = self
      .inner
      .slots()
      .keys()
      .filter(|k| k.same_slot(&key))
      .cloned()
      .collect();
    for old in previous {
      self.dispose(&old).await;
    }

    let generation = self.inner.next_generation.fetch_add(1, Ordering::SeqCst) + 1;
    self.open_slot(&key, generation);

    let cached = self.inner.local.get::<T>(&key);
    self.inner.update(&key, Some(generation), |slot| {
      slot.has_fallback = cached.is_some();
      slot.source = cached.as_ref().map(|_| RecordSource::Local);
      slot.record = cached;
      slot.phase = LoadPhase::Syncing;
    });
    debug!(%key, "painted from local cache");

    let inner = &self.inner;
    let outcome = inner
      .fetch
      .fetch::<T, _>(&key, inner.timings.read_deadline, |record| {
        inner.update(&key, Some(generation), |slot| {
          if slot.apply_remote(record, RecordSource::Replica) {
            slot.has_fallback = true;
          }
        });
      })
      .await;

    let state = inner.finish_load(&key, generation, outcome);
    info!(%key, ?state, "load settled");
    Ok(state)
  }

  fn open_slot(&self, key: &CacheKey, generation: u64) {
    let slot = Slot::new(generation);
    slot.publish();
    self.inner.slots().insert(key.clone(), slot);
  }

  /// Apply `patch` to the displayed record.
  ///
  /// The local cache is overwritten before this returns. The remote write is
  /// debounced, except after a failed load, where only
  /// [`force_save`](Self::force_save) reaches the remote store.
  pub fn edit(&self, key: &CacheKey, patch: impl FnOnce(&mut T)) -> Result<T, SyncError> {
    self.check_kind(key)?;

    let mut slots = self.inner.slots();
    let slot = slots
      .get_mut(key)
      .ok_or_else(|| SyncError::NotLoaded(key.clone()))?;

    let mut record = slot.record.clone().unwrap_or_default();
    patch(&mut record);
    record.touch(Utc::now());
    self.inner.local.put(key, &record);

    slot.record = Some(record.clone());
    slot.source = Some(RecordSource::Edit);
    slot.edited = true;
    if slot.load_failed() {
      debug!(%key, "edit kept local, remote record was never read");
      slot.unsent = true;
    } else {
      slot.pending_seq = Some(self.inner.writer.schedule(key, record.clone()));
    }
    slot.publish();

    Ok(record)
  }

  /// Apply a JSON merge patch to the displayed record.
  pub fn edit_json(&self, key: &CacheKey, patch: &Value) -> Result<T, SyncError> {
    let current = self.record(key).unwrap_or_default();
    let patched = merge_patch(&current, patch)?;
    self.edit(key, move |record| *record = patched)
  }

  /// Re-issue the server read after a failed load.
  ///
  /// Does nothing unless the key is in `LoadFailed`. Once the read settles,
  /// edits kept local in the meantime are scheduled for a remote write.
  pub async fn retry(&self, key: &CacheKey) -> Result<SyncState, SyncError> {
    self.check_kind(key)?;

    let generation = {
      let mut slots = self.inner.slots();
      let slot = slots
        .get_mut(key)
        .ok_or_else(|| SyncError::NotLoaded(key.clone()))?;
      if !slot.load_failed() {
        return Ok(slot.state());
      }
      slot.phase = LoadPhase::Syncing;
      slot.publish();
      slot.generation
    };

    let outcome = self
      .inner
      .fetch
      .server::<T>(key, self.inner.timings.read_deadline)
      .await;
    Ok(self.inner.finish_load(key, generation, outcome))
  }

  /// Write the displayed record to the remote store now, even if it could
  /// overwrite a remote record that was never read.
  pub async fn force_save(&self, key: &CacheKey) -> Result<FlushOutcome, SyncError> {
    self.check_kind(key)?;

    let (record, generation, armed) = {
      let mut slots = self.inner.slots();
      let slot = slots
        .get_mut(key)
        .ok_or_else(|| SyncError::NotLoaded(key.clone()))?;
      let record = slot
        .record
        .clone()
        .ok_or_else(|| SyncError::NothingToSave(key.clone()))?;
      slot.force_saving = true;
      slot.unsent = false;
      slot.publish();
      (record, slot.generation, slot.pending_seq)
    };

    warn!(%key, "force-saving without a verified remote read");
    let outcome = self.inner.writer.flush_now(key, &record).await;

    let inner = &self.inner;
    inner.update(key, Some(generation), |slot| {
      slot.force_saving = false;
      // flush_now dropped the timer armed before the save, not one armed since
      if slot.pending_seq == armed {
        slot.pending_seq = None;
      }
      match &outcome {
        FlushOutcome::Saved => {
          slot.phase = LoadPhase::Done { failed: false };
          slot.offline = false;
          slot.last_error = None;
        }
        FlushOutcome::Deferred(_) => {
          slot.offline = true;
          if slot.load_failed() {
            slot.unsent = true;
          }
        }
        FlushOutcome::Failed(e) => {
          slot.last_error = Some(e.to_string());
          if slot.load_failed() {
            slot.unsent = true;
          }
        }
      }
      inner.resume_unsent(key, slot);
    });

    Ok(outcome)
  }

  /// Close a period. An edit still waiting on the debounce timer is flushed
  /// first; the state machine is then discarded.
  pub async fn dispose(&self, key: &CacheKey) -> Option<FlushOutcome> {
    self.inner.slots().remove(key);

    let record = self.inner.writer.cancel(key)?;
    debug!(%key, "flushing pending edit before close");
    Some(self.inner.writer.flush_now(key, &record).await)
  }

  /// Current state of `key`; `Idle` when it is not open.
  pub fn state(&self, key: &CacheKey) -> SyncState {
    self
      .inner
      .slots()
      .get(key)
      .map_or(SyncState::Idle, |slot| slot.state())
  }

  pub fn record(&self, key: &CacheKey) -> Option<T> {
    self.inner.slots().get(key).and_then(|slot| slot.record.clone())
  }

  pub fn snapshot(&self, key: &CacheKey) -> Option<SyncSnapshot<T>> {
    self.inner.slots().get(key).map(|slot| slot.snapshot())
  }

  /// Observe a period. The receiver closes when the period is disposed.
  pub fn watch(&self, key: &CacheKey) -> Option<watch::Receiver<SyncSnapshot<T>>> {
    self.inner.slots().get(key).map(|slot| slot.tx.subscribe())
  }

  pub fn active_keys(&self) -> Vec<CacheKey> {
    self.inner.slots().keys().cloned().collect()
  }
}

impl<T: Syncable, L: LocalStore, R: RemoteStore> Clone for SyncController<T, L, R> {
  fn clone(&self) -> Self {
    Self {
      inner: Arc::clone(&self.inner),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{MemoryStorage, ResourceKind};
  use crate::error::RemoteError;
  use crate::records::{JournalEntry, Task, TrackerGrid};
  use crate::testing::ScriptedRemote;
  use serde_json::json;
  use tokio::time::{sleep, Instant};

  type Controller = SyncController<JournalEntry, MemoryStorage, ScriptedRemote>;

  fn day(period: &str) -> CacheKey {
    CacheKey::new("u1", ResourceKind::Journal, period).unwrap()
  }

  fn setup() -> (Controller, Arc<ScriptedRemote>, LocalCacheStore<MemoryStorage>) {
    let remote = Arc::new(ScriptedRemote::new());
    let local = LocalCacheStore::new(MemoryStorage::new());
    let controller =
      SyncController::from_parts(local.clone(), Arc::clone(&remote), SyncTimings::default());
    (controller, remote, local)
  }

  fn seed_local(local: &LocalCacheStore<MemoryStorage>, key: &CacheKey, diary: &str) {
    local.put(
      key,
      &JournalEntry {
        diary: diary.to_string(),
        ..Default::default()
      },
    );
  }

  fn always_failing() -> (Controller, Arc<ScriptedRemote>, LocalCacheStore<MemoryStorage>) {
    let (controller, remote, local) = setup();
    remote.fail_cache_reads(RemoteError::other("replica unreadable"));
    remote.fail_server_reads(Some(RemoteError::other("permission check failed")));
    (controller, remote, local)
  }

  fn diary(controller: &Controller, key: &CacheKey) -> Option<String> {
    controller.record(key).map(|entry| entry.diary)
  }

  #[tokio::test(start_paused = true)]
  async fn test_paints_local_then_server() {
    let (controller, remote, local) = setup();
    let key = day("2024-05-01");
    seed_local(&local, &key, "a");
    remote.set_server_document(
      &key,
      json!({ "diary": "b", "updatedAt": "2024-05-01T10:00:00Z" }),
    );
    remote.set_server_delay(Duration::from_millis(500));

    let handle = tokio::spawn({
      let controller = controller.clone();
      let key = key.clone();
      async move { controller.load(key).await }
    });

    sleep(Duration::from_millis(10)).await;
    assert_eq!(controller.state(&key), SyncState::Syncing);
    assert_eq!(diary(&controller, &key).as_deref(), Some("a"));

    assert_eq!(handle.await.unwrap().unwrap(), SyncState::Synced);
    let snapshot = controller.snapshot(&key).unwrap();
    assert_eq!(snapshot.record.unwrap().diary, "b");
    assert_eq!(snapshot.source, Some(RecordSource::Server));
    assert_eq!(local.get::<JournalEntry>(&key).unwrap().diary, "b");
  }

  #[tokio::test(start_paused = true)]
  async fn test_slow_server_settles_at_deadline_with_cache() {
    let (controller, remote, local) = setup();
    let key = day("2024-05-01");
    seed_local(&local, &key, "cached");
    remote.set_server_delay(Duration::from_millis(5000));

    let start = Instant::now();
    let state = controller.load(key.clone()).await.unwrap();
    let elapsed = start.elapsed();

    assert_eq!(state, SyncState::Synced);
    assert!(elapsed >= Duration::from_millis(2950) && elapsed <= Duration::from_millis(3050));
    let snapshot = controller.snapshot(&key).unwrap();
    assert!(snapshot.offline);
    assert_eq!(snapshot.record.unwrap().diary, "cached");
  }

  #[tokio::test(start_paused = true)]
  async fn test_slow_server_without_cache_is_ignorable() {
    let (controller, remote, _) = setup();
    let key = day("2024-05-01");
    remote.set_server_delay(Duration::from_millis(5000));

    let state = controller.load(key.clone()).await.unwrap();
    assert_eq!(state, SyncState::Synced);
    assert!(controller.record(&key).is_none());
    assert!(controller.snapshot(&key).unwrap().last_error.is_none());
  }

  #[tokio::test(start_paused = true)]
  async fn test_server_supersedes_replica() {
    let (controller, remote, _) = setup();
    let key = day("2024-05-01");
    remote.set_replica_document(&key, json!({ "diary": "1" }));
    remote.set_server_document(&key, json!({ "diary": "2" }));
    remote.set_server_delay(Duration::from_millis(100));

    controller.load(key.clone()).await.unwrap();
    assert_eq!(diary(&controller, &key).as_deref(), Some("2"));
  }

  #[tokio::test(start_paused = true)]
  async fn test_nothing_to_show_is_load_failed() {
    let (controller, _, _) = always_failing();
    let key = day("2024-05-01");

    assert_eq!(controller.load(key.clone()).await.unwrap(), SyncState::LoadFailed);
    let snapshot = controller.snapshot(&key).unwrap();
    assert_eq!(snapshot.state, SyncState::LoadFailed);
    assert!(snapshot.last_error.is_some());
  }

  #[tokio::test(start_paused = true)]
  async fn test_server_error_with_cache_downgrades_to_synced() {
    let (controller, _, local) = always_failing();
    let key = day("2024-05-01");
    seed_local(&local, &key, "stale");

    assert_eq!(controller.load(key.clone()).await.unwrap(), SyncState::Synced);
    assert_eq!(diary(&controller, &key).as_deref(), Some("stale"));
  }

  #[tokio::test(start_paused = true)]
  async fn test_force_save_bypasses_failed_load() {
    let (controller, remote, _) = always_failing();
    let key = day("2024-05-01");
    controller.load(key.clone()).await.unwrap();

    controller
      .edit(&key, |entry| entry.diary = "rescued".to_string())
      .unwrap();
    assert_eq!(controller.state(&key), SyncState::LoadFailed);

    sleep(Duration::from_millis(2000)).await;
    assert!(remote.puts().is_empty());

    let outcome = controller.force_save(&key).await.unwrap();
    assert!(outcome.is_saved());

    sleep(Duration::from_millis(2000)).await;
    let puts = remote.puts();
    assert_eq!(puts.len(), 1);
    assert_eq!(puts[0].document["diary"], "rescued");
    assert_eq!(controller.state(&key), SyncState::Synced);
  }

  #[tokio::test(start_paused = true)]
  async fn test_local_cache_always_holds_last_edit() {
    let (controller, remote, local) = always_failing();
    remote.fail_puts(Some(RemoteError::other("write rejected")));
    let key = day("2024-05-01");
    seed_local(&local, &key, "seed");
    assert_eq!(controller.load(key.clone()).await.unwrap(), SyncState::Synced);

    for text in ["x", "xy", "xyz"] {
      controller
        .edit(&key, |entry| entry.diary = text.to_string())
        .unwrap();
      assert_eq!(local.get::<JournalEntry>(&key).unwrap().diary, text);
      sleep(Duration::from_millis(1500)).await;
    }
    assert_eq!(local.get::<JournalEntry>(&key).unwrap().diary, "xyz");
    assert_eq!(remote.puts().len(), 3);
    let snapshot = controller.snapshot(&key).unwrap();
    assert_eq!(snapshot.state, SyncState::Synced);
    assert!(snapshot.last_error.is_some());
  }

  #[tokio::test(start_paused = true)]
  async fn test_edit_burst_writes_once() {
    let (controller, remote, _) = setup();
    let key = day("2024-05-01");
    controller.load(key.clone()).await.unwrap();
    let start = Instant::now();

    for (i, text) in ["d", "di", "dia", "diar"].iter().enumerate() {
      if i > 0 {
        sleep(Duration::from_millis(200)).await;
      }
      controller
        .edit(&key, |entry| entry.diary = text.to_string())
        .unwrap();
      assert_eq!(controller.state(&key), SyncState::Saving);
    }

    let mut rx = controller.watch(&key).unwrap();
    let settled = rx.wait_for(|s| s.state == SyncState::Synced).await.unwrap();
    assert_eq!(settled.record.as_ref().unwrap().diary, "diar");
    drop(settled);

    let puts = remote.puts();
    assert_eq!(puts.len(), 1);
    let issued = puts[0].at - start;
    assert!(issued >= Duration::from_millis(1600) && issued <= Duration::from_millis(1601));
    assert_eq!(puts[0].document["diary"], "diar");
  }

  #[tokio::test(start_paused = true)]
  async fn test_retry_recovers_after_failure() {
    let (controller, remote, _) = always_failing();
    let key = day("2024-05-01");
    controller.load(key.clone()).await.unwrap();

    remote.fail_server_reads(None);
    remote.set_server_document(&key, json!({ "diary": "found" }));

    assert_eq!(controller.retry(&key).await.unwrap(), SyncState::Synced);
    assert_eq!(diary(&controller, &key).as_deref(), Some("found"));
    assert_eq!(remote.server_reads(), 2);
  }

  #[tokio::test(start_paused = true)]
  async fn test_retry_is_noop_when_synced() {
    let (controller, remote, _) = setup();
    let key = day("2024-05-01");
    controller.load(key.clone()).await.unwrap();

    assert_eq!(controller.retry(&key).await.unwrap(), SyncState::Synced);
    assert_eq!(remote.server_reads(), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_switching_period_flushes_pending_edit() {
    let (controller, remote, _) = setup();
    let first = day("2024-05-01");
    let second = day("2024-05-02");
    controller.load(first.clone()).await.unwrap();
    controller
      .edit(&first, |entry| {
        entry.tasks.push(Task {
          text: "water plants".to_string(),
          done: false,
        })
      })
      .unwrap();

    let start = Instant::now();
    controller.load(second.clone()).await.unwrap();

    let puts = remote.puts();
    assert_eq!(puts.len(), 1);
    assert_eq!(puts[0].path, first.document_path());
    assert!(puts[0].at - start < Duration::from_millis(1000));
    assert_eq!(controller.active_keys(), vec![second]);
    assert_eq!(controller.state(&first), SyncState::Idle);

    sleep(Duration::from_millis(2000)).await;
    assert_eq!(remote.puts().len(), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_late_server_read_keeps_edits() {
    let (controller, remote, _) = setup();
    let key = day("2024-05-01");
    remote.set_server_document(&key, json!({ "diary": "remote" }));
    remote.set_server_delay(Duration::from_millis(500));

    let handle = tokio::spawn({
      let controller = controller.clone();
      let key = key.clone();
      async move { controller.load(key).await }
    });
    sleep(Duration::from_millis(100)).await;
    controller
      .edit(&key, |entry| entry.diary = "typed".to_string())
      .unwrap();

    handle.await.unwrap().unwrap();
    assert_eq!(diary(&controller, &key).as_deref(), Some("typed"));
  }

  #[tokio::test(start_paused = true)]
  async fn test_edit_json_merges_patch() {
    let (controller, _, _) = setup();
    let key = day("2024-05-01");
    controller.load(key.clone()).await.unwrap();

    controller.edit_json(&key, &json!({ "diary": "hi" })).unwrap();
    let entry = controller
      .edit_json(&key, &json!({ "tasks": [{ "text": "run", "done": true }] }))
      .unwrap();
    assert_eq!(entry.diary, "hi");
    assert_eq!(entry.tasks.len(), 1);
    assert!(entry.updated_at > chrono::DateTime::<Utc>::default());
  }

  #[tokio::test(start_paused = true)]
  async fn test_surface_misuse_is_rejected() {
    let (controller, _, _) = setup();
    let key = day("2024-05-01");
    let month = CacheKey::new("u1", ResourceKind::Tracker, "2024-05").unwrap();

    assert!(matches!(
      controller.load(month).await,
      Err(SyncError::KindMismatch { .. })
    ));
    assert!(matches!(
      controller.edit(&key, |_| {}),
      Err(SyncError::NotLoaded(_))
    ));

    controller.load(key.clone()).await.unwrap();
    assert!(matches!(
      controller.force_save(&key).await,
      Err(SyncError::NothingToSave(_))
    ));
  }

  #[tokio::test(start_paused = true)]
  async fn test_retry_sends_edit_kept_during_failed_load() {
    let (controller, remote, local) = always_failing();
    let key = day("2024-05-01");
    remote.set_server_document(&key, json!({ "diary": "old" }));
    assert_eq!(controller.load(key.clone()).await.unwrap(), SyncState::LoadFailed);

    controller
      .edit(&key, |entry| entry.diary = "rescued".to_string())
      .unwrap();
    sleep(Duration::from_millis(2000)).await;
    assert!(remote.puts().is_empty());

    remote.fail_server_reads(None);
    assert_eq!(controller.retry(&key).await.unwrap(), SyncState::Saving);
    assert_eq!(diary(&controller, &key).as_deref(), Some("rescued"));

    sleep(Duration::from_millis(1500)).await;
    let puts = remote.puts();
    assert_eq!(puts.len(), 1);
    assert_eq!(puts[0].document["diary"], "rescued");
    assert_eq!(controller.state(&key), SyncState::Synced);

    assert!(controller.dispose(&key).await.is_none());
    controller.load(key.clone()).await.unwrap();
    assert_eq!(diary(&controller, &key).as_deref(), Some("rescued"));
    assert_eq!(local.get::<JournalEntry>(&key).unwrap().diary, "rescued");
  }

  #[tokio::test(start_paused = true)]
  async fn test_retry_resends_edit_cancelled_by_failed_load() {
    let (controller, remote, _) = always_failing();
    let key = day("2024-05-01");
    remote.set_server_delay(Duration::from_millis(500));

    let handle = tokio::spawn({
      let controller = controller.clone();
      let key = key.clone();
      async move { controller.load(key).await }
    });
    sleep(Duration::from_millis(100)).await;
    controller
      .edit(&key, |entry| entry.diary = "early".to_string())
      .unwrap();
    assert_eq!(controller.state(&key), SyncState::Saving);

    assert_eq!(handle.await.unwrap().unwrap(), SyncState::LoadFailed);
    sleep(Duration::from_millis(2000)).await;
    assert!(remote.puts().is_empty());

    remote.fail_server_reads(None);
    controller.retry(&key).await.unwrap();
    sleep(Duration::from_millis(1500)).await;

    let puts = remote.puts();
    assert_eq!(puts.len(), 1);
    assert_eq!(puts[0].document["diary"], "early");
  }

  #[tokio::test(start_paused = true)]
  async fn test_edit_during_failed_force_save_stays_saving() {
    let (controller, remote, _) = setup();
    let key = day("2024-05-01");
    controller.load(key.clone()).await.unwrap();
    controller
      .edit(&key, |entry| entry.diary = "a".to_string())
      .unwrap();

    remote.fail_puts(Some(RemoteError::other("rejected")));
    remote.set_put_delay(Duration::from_millis(500));
    let handle = tokio::spawn({
      let controller = controller.clone();
      let key = key.clone();
      async move { controller.force_save(&key).await }
    });
    sleep(Duration::from_millis(100)).await;
    controller
      .edit(&key, |entry| entry.diary = "b".to_string())
      .unwrap();

    let outcome = handle.await.unwrap().unwrap();
    assert!(matches!(outcome, FlushOutcome::Failed(_)));
    let snapshot = controller.snapshot(&key).unwrap();
    assert_eq!(snapshot.state, SyncState::Saving);
    assert!(snapshot.last_error.is_some());

    remote.fail_puts(None);
    let mut rx = controller.watch(&key).unwrap();
    let settled = rx.wait_for(|s| s.state.is_settled()).await.unwrap().clone();
    assert_eq!(settled.state, SyncState::Synced);
    assert!(settled.last_error.is_none());

    let puts = remote.puts();
    assert_eq!(puts.len(), 2);
    assert_eq!(puts[1].document["diary"], "b");
  }

  #[tokio::test(start_paused = true)]
  async fn test_slow_write_surfaces_as_offline() {
    let (controller, remote, local) = setup();
    let key = day("2024-05-01");
    controller.load(key.clone()).await.unwrap();
    remote.set_put_delay(Duration::from_millis(5000));

    controller
      .edit(&key, |entry| entry.diary = "draft".to_string())
      .unwrap();
    let mut rx = controller.watch(&key).unwrap();
    let settled = rx.wait_for(|s| s.state.is_settled()).await.unwrap().clone();

    assert_eq!(settled.state, SyncState::Synced);
    assert!(settled.offline);
    assert!(settled.last_error.is_none());
    assert_eq!(local.get::<JournalEntry>(&key).unwrap().diary, "draft");
  }

  #[tokio::test(start_paused = true)]
  async fn test_dispose_after_failed_load_keeps_edit_local() {
    let (controller, remote, local) = always_failing();
    let key = day("2024-05-01");
    controller.load(key.clone()).await.unwrap();
    controller
      .edit(&key, |entry| entry.diary = "local only".to_string())
      .unwrap();

    assert!(controller.dispose(&key).await.is_none());
    sleep(Duration::from_millis(2000)).await;

    assert!(remote.puts().is_empty());
    assert_eq!(local.get::<JournalEntry>(&key).unwrap().diary, "local only");
    assert_eq!(controller.state(&key), SyncState::Idle);
  }

  #[tokio::test(start_paused = true)]
  async fn test_controllers_per_kind_are_independent() {
    let remote = Arc::new(ScriptedRemote::new());
    let local = LocalCacheStore::new(MemoryStorage::new());
    let journal: Controller =
      SyncController::from_parts(local.clone(), Arc::clone(&remote), SyncTimings::default());
    let tracker: SyncController<TrackerGrid, _, _> =
      SyncController::from_parts(local, Arc::clone(&remote), SyncTimings::default());

    let day_key = day("2024-05-01");
    let month_key = CacheKey::new("u1", ResourceKind::Tracker, "2024-05").unwrap();
    journal.load(day_key.clone()).await.unwrap();
    tracker.load(month_key.clone()).await.unwrap();

    assert_eq!(journal.active_keys(), vec![day_key]);
    assert_eq!(tracker.active_keys(), vec![month_key]);
  }
}
