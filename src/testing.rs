//! Scripted remote store for engine tests.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

use crate::cache::{CacheKey, DocumentPath};
use crate::error::RemoteError;
use crate::sync::RemoteStore;

/// A recorded `put` call, stamped with the (possibly virtual) time it was issued.
#[derive(Debug, Clone)]
pub(crate) struct PutCall {
  pub at: Instant,
  pub path: DocumentPath,
  pub document: Value,
}

#[derive(Default)]
struct Script {
  server: HashMap<DocumentPath, Value>,
  replica: HashMap<DocumentPath, Value>,
  cache_error: Option<RemoteError>,
  server_error: Option<RemoteError>,
  put_error: Option<RemoteError>,
  server_delay: Duration,
  put_delay: Duration,
  puts: Vec<PutCall>,
  server_reads: usize,
}

/// In-memory [`RemoteStore`] whose latency and failures are scripted per test.
#[derive(Default)]
pub(crate) struct ScriptedRemote {
  script: Mutex<Script>,
}

impl ScriptedRemote {
  pub fn new() -> Self {
    Self::default()
  }

  fn with<R>(&self, f: impl FnOnce(&mut Script) -> R) -> R {
    f(&mut self.script.lock().unwrap())
  }

  pub fn set_server_document(&self, key: &CacheKey, document: Value) {
    self.with(|s| s.server.insert(key.document_path(), document));
  }

  pub fn set_replica_document(&self, key: &CacheKey, document: Value) {
    self.with(|s| s.replica.insert(key.document_path(), document));
  }

  pub fn fail_cache_reads(&self, err: RemoteError) {
    self.with(|s| s.cache_error = Some(err));
  }

  pub fn fail_server_reads(&self, err: Option<RemoteError>) {
    self.with(|s| s.server_error = err);
  }

  pub fn fail_puts(&self, err: Option<RemoteError>) {
    self.with(|s| s.put_error = err);
  }

  pub fn set_server_delay(&self, delay: Duration) {
    self.with(|s| s.server_delay = delay);
  }

  pub fn set_put_delay(&self, delay: Duration) {
    self.with(|s| s.put_delay = delay);
  }

  pub fn puts(&self) -> Vec<PutCall> {
    self.with(|s| s.puts.clone())
  }

  pub fn server_reads(&self) -> usize {
    self.with(|s| s.server_reads)
  }

  pub fn server_document(&self, key: &CacheKey) -> Option<Value> {
    self.with(|s| s.server.get(&key.document_path()).cloned())
  }
}

#[async_trait]
impl RemoteStore for ScriptedRemote {
  async fn get_from_cache(&self, path: &DocumentPath) -> Result<Option<Value>, RemoteError> {
    self.with(|s| match &s.cache_error {
      Some(err) => Err(err.clone()),
      None => Ok(s.replica.get(path).cloned()),
    })
  }

  async fn get_from_server(&self, path: &DocumentPath) -> Result<Option<Value>, RemoteError> {
    let delay = self.with(|s| {
      s.server_reads += 1;
      s.server_delay
    });
    tokio::time::sleep(delay).await;

    self.with(|s| match &s.server_error {
      Some(err) => Err(err.clone()),
      None => Ok(s.server.get(path).cloned()),
    })
  }

  async fn put(&self, path: &DocumentPath, document: Value) -> Result<(), RemoteError> {
    let delay = self.with(|s| {
      s.puts.push(PutCall {
        at: Instant::now(),
        path: path.clone(),
        document: document.clone(),
      });
      s.put_delay
    });
    tokio::time::sleep(delay).await;

    self.with(|s| match &s.put_error {
      Some(err) => Err(err.clone()),
      None => {
        s.server.insert(path.clone(), document);
        Ok(())
      }
    })
  }
}
