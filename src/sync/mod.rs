//! Remote synchronization for locally cached records.
//!
//! Reads race a deadline and never block the caller indefinitely; writes are
//! debounced per key and always land in the local cache first.

mod controller;
mod deadline;
mod fetch;
mod remote;
mod writer;

pub use controller::{SyncController, SyncSnapshot, SyncState, SyncTimings};
pub use fetch::{FetchOutcome, TimedFetch};
pub use remote::{FsRemoteStore, RemoteStore};
pub use writer::{DebouncedWriter, FlushEvent, FlushOutcome};
