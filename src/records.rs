//! Record payloads for each synced widget.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::cache::{ResourceKind, Syncable};

/// A checklist item
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Task {
  pub text: String,
  pub done: bool,
}

/// One day's journal: free-text diary plus the day's task checklist
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct JournalEntry {
  pub diary: String,
  pub tasks: Vec<Task>,
  pub updated_at: DateTime<Utc>,
}

/// A habit and the days of the month it was completed
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Habit {
  pub name: String,
  pub completed_days: BTreeSet<u32>,
}

/// Monthly habit-completion grid
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TrackerGrid {
  pub habits: Vec<Habit>,
  pub updated_at: DateTime<Utc>,
}

/// A single day's values on both graph axes
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct GraphPoint {
  pub mood: Option<f64>,
  pub metric: Option<f64>,
}

/// Monthly two-axis mood/metric series, keyed by day of month
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct GraphSeries {
  pub metric_label: String,
  pub points: BTreeMap<u32, GraphPoint>,
  pub updated_at: DateTime<Utc>,
}

/// Task list for a whole month
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MonthlyTasks {
  pub tasks: Vec<Task>,
  pub updated_at: DateTime<Utc>,
}

macro_rules! impl_syncable {
  ($ty:ty, $kind:expr) => {
    impl Syncable for $ty {
      fn kind() -> ResourceKind {
        $kind
      }

      fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
      }

      fn touch(&mut self, at: DateTime<Utc>) {
        self.updated_at = at;
      }
    }
  };
}

impl_syncable!(JournalEntry, ResourceKind::Journal);
impl_syncable!(TrackerGrid, ResourceKind::Tracker);
impl_syncable!(GraphSeries, ResourceKind::Graph);
impl_syncable!(MonthlyTasks, ResourceKind::MonthlyTasks);
