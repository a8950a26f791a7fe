//! Core traits and types for synced records.

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;

use super::key::ResourceKind;

/// Trait for records that can be cached locally and synced remotely.
///
/// The whole record is always written as one snapshot; `updated_at` is the
/// only field used to reason about recency.
pub trait Syncable:
  Clone + Default + Send + Sync + Serialize + DeserializeOwned + 'static
{
  /// Resource kind this record type belongs to
  fn kind() -> ResourceKind;

  /// Last modification timestamp
  fn updated_at(&self) -> DateTime<Utc>;

  /// Stamp the record as modified at `at`.
  fn touch(&mut self, at: DateTime<Utc>);
}

/// Where the currently displayed record came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordSource {
  /// Local persistent cache
  Local,
  /// Remote store's client-side replica
  Replica,
  /// Authoritative remote server
  Server,
  /// Produced by an edit in this session
  Edit,
}

/// Apply an RFC 7386 JSON merge patch to a typed record.
pub fn merge_patch<T: Syncable>(record: &T, patch: &Value) -> Result<T, serde_json::Error> {
  let mut doc = serde_json::to_value(record)?;
  merge_value(&mut doc, patch);
  serde_json::from_value(doc)
}

fn merge_value(target: &mut Value, patch: &Value) {
  let Value::Object(patch_map) = patch else {
    *target = patch.clone();
    return;
  };

  if !target.is_object() {
    *target = Value::Object(Default::default());
  }

  if let Value::Object(target_map) = target {
    for (name, value) in patch_map {
      if value.is_null() {
        target_map.remove(name);
      } else {
        merge_value(target_map.entry(name.clone()).or_insert(Value::Null), value);
      }
    }
  }
}
