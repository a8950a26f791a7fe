//! Record addressing: which user, which widget, which day or month.

use chrono::NaiveDate;
use std::fmt;
use std::str::FromStr;

use crate::error::SyncError;

/// The kind of record a key addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceKind {
  /// Diary text plus the day's task checklist (per day)
  Journal,
  /// Habit-completion grid (per month)
  Tracker,
  /// Two-axis mood/metric series (per month)
  Graph,
  /// Monthly task list (per month)
  MonthlyTasks,
}

/// Granularity of a period key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Period {
  Day,
  Month,
}

impl ResourceKind {
  pub const ALL: [ResourceKind; 4] = [
    ResourceKind::Journal,
    ResourceKind::Tracker,
    ResourceKind::Graph,
    ResourceKind::MonthlyTasks,
  ];

  pub fn period(self) -> Period {
    match self {
      Self::Journal => Period::Day,
      Self::Tracker | Self::Graph | Self::MonthlyTasks => Period::Month,
    }
  }

  /// Prefix of the local store key.
  pub fn local_prefix(self) -> &'static str {
    match self {
      Self::Journal => "journal",
      Self::Tracker => "tracker",
      Self::Graph => "graph",
      Self::MonthlyTasks => "monthlyTasks",
    }
  }

  /// Collection name in the remote document store.
  pub fn collection(self) -> &'static str {
    match self {
      Self::Journal => "journal",
      Self::Tracker => "trackers",
      Self::Graph => "graphs",
      Self::MonthlyTasks => "monthlyTasks",
    }
  }

  /// Name used on the command line.
  pub fn name(self) -> &'static str {
    match self {
      Self::Journal => "journal",
      Self::Tracker => "tracker",
      Self::Graph => "graph",
      Self::MonthlyTasks => "monthly-tasks",
    }
  }
}

impl fmt::Display for ResourceKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.name())
  }
}

impl FromStr for ResourceKind {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let lower = s.to_lowercase();
    Self::ALL
      .into_iter()
      .find(|kind| kind.name() == lower)
      .ok_or_else(|| format!("unknown resource kind '{}'", s))
  }
}

/// Uniquely addresses one record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey {
  user_id: String,
  kind: ResourceKind,
  period_key: String,
}

impl CacheKey {
  /// Build a key, validating the period format against the kind's granularity.
  pub fn new(
    user_id: impl Into<String>,
    kind: ResourceKind,
    period_key: impl Into<String>,
  ) -> Result<Self, SyncError> {
    let period_key = period_key.into();
    let (valid, expected) = match kind.period() {
      Period::Day => (
        NaiveDate::parse_from_str(&period_key, "%Y-%m-%d").is_ok() && period_key.len() == 10,
        "YYYY-MM-DD",
      ),
      Period::Month => (
        period_key.len() == 7
          && NaiveDate::parse_from_str(&format!("{}-01", period_key), "%Y-%m-%d").is_ok(),
        "YYYY-MM",
      ),
    };

    if !valid {
      return Err(SyncError::InvalidPeriod {
        kind,
        period: period_key,
        expected,
      });
    }

    Ok(Self {
      user_id: user_id.into(),
      kind,
      period_key,
    })
  }

  pub fn user_id(&self) -> &str {
    &self.user_id
  }

  pub fn kind(&self) -> ResourceKind {
    self.kind
  }

  pub fn period_key(&self) -> &str {
    &self.period_key
  }

  /// Key used in the local key-value store, e.g. `journal_u1_2024-05-01`.
  pub fn raw_key(&self) -> String {
    format!(
      "{}_{}_{}",
      self.kind.local_prefix(),
      self.user_id,
      self.period_key
    )
  }

  /// Address of the record in the remote document store.
  pub fn document_path(&self) -> DocumentPath {
    DocumentPath(format!(
      "users/{}/{}/{}",
      self.user_id,
      self.kind.collection(),
      self.period_key
    ))
  }

  /// Whether two keys belong to the same widget for the same user.
  pub fn same_slot(&self, other: &CacheKey) -> bool {
    self.user_id == other.user_id && self.kind == other.kind
  }
}

impl fmt::Display for CacheKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}/{}/{}", self.user_id, self.kind, self.period_key)
  }
}

/// Slash-separated document address: `users/{userId}/{collection}/{periodKey}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DocumentPath(String);

impl DocumentPath {
  pub fn as_str(&self) -> &str {
    &self.0
  }

  pub fn segments(&self) -> impl Iterator<Item = &str> {
    self.0.split('/')
  }
}

impl fmt::Display for DocumentPath {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}
