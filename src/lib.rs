//! Local-first synchronization engine for a daily-planning journal.
//!
//! Records (journal days, habit trackers, mood graphs, monthly tasks) render
//! from a local cache immediately and are synced against a remote document
//! store in the background.

pub mod cache;
pub mod config;
pub mod error;
pub mod logging;
pub mod records;
pub mod sync;

#[cfg(test)]
pub(crate) mod testing;

pub use cache::{CacheKey, ResourceKind};
pub use error::{RemoteError, RemoteErrorKind, SyncError};
pub use sync::{SyncController, SyncSnapshot, SyncState, SyncTimings};
