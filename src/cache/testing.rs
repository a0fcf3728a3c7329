//! Storage with switchable write failures, for tests.

use color_eyre::{eyre::eyre, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::key::RequestKey;
use super::storage::SqliteStorage;
use super::traits::{CacheEntry, CacheStorage, Namespace};
use crate::db::Database;

/// Delegates to SQLite, except where a failure has been switched on.
pub struct FaultyStorage {
  inner: SqliteStorage,
  fail_puts: AtomicBool,
  fail_opens: AtomicBool,
}

impl FaultyStorage {
  pub fn new(db: Arc<Database>) -> Self {
    Self {
      inner: SqliteStorage::new(db),
      fail_puts: AtomicBool::new(false),
      fail_opens: AtomicBool::new(false),
    }
  }

  /// Every `put` fails as if the quota were exhausted.
  pub fn fail_puts(&self, fail: bool) {
    self.fail_puts.store(fail, Ordering::SeqCst);
  }

  pub fn fail_opens(&self, fail: bool) {
    self.fail_opens.store(fail, Ordering::SeqCst);
  }
}

impl CacheStorage for FaultyStorage {
  fn open_namespace(&self, namespace: &Namespace) -> Result<()> {
    if self.fail_opens.load(Ordering::SeqCst) {
      return Err(eyre!("disk I/O error opening {}", namespace.name));
    }
    self.inner.open_namespace(namespace)
  }

  fn namespaces(&self) -> Result<Vec<Namespace>> {
    self.inner.namespaces()
  }

  fn delete_namespace(&self, name: &str) -> Result<bool> {
    self.inner.delete_namespace(name)
  }

  fn put(&self, namespace: &Namespace, entry: &CacheEntry) -> Result<()> {
    if self.fail_puts.load(Ordering::SeqCst) {
      return Err(eyre!("quota exceeded storing {} in {}", entry.url, namespace.name));
    }
    self.inner.put(namespace, entry)
  }

  fn get(&self, namespace: &str, key: &RequestKey) -> Result<Option<CacheEntry>> {
    self.inner.get(namespace, key)
  }

  fn match_any(&self, key: &RequestKey) -> Result<Option<CacheEntry>> {
    self.inner.match_any(key)
  }

  fn entry_count(&self, namespace: &str) -> Result<usize> {
    self.inner.entry_count(namespace)
  }
}
