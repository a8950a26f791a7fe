//! Local-first record caching.
//!
//! This module provides the local half of the sync engine:
//! - Addresses records by user, resource kind and period
//! - Stores whole-record JSON snapshots in a synchronous key-value store
//! - Treats malformed entries as absent and swallows local write failures

mod key;
mod storage;
mod traits;

pub use key::{CacheKey, DocumentPath, Period, ResourceKind};
pub use storage::{LocalCacheStore, LocalStore, MemoryStorage, SqliteStorage};
pub use traits::{merge_patch, RecordSource, Syncable};
