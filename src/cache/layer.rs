//! Cache layer that adds read-time staleness to the raw store.

use chrono::{Duration, Utc};
use std::sync::Arc;
use tracing::warn;

use super::key::RequestKey;
use super::traits::{CacheEntry, CacheResult, CacheStorage, Namespace};

/// Cache layer that manages lookups and writes for the router.
///
/// Entries carry no TTL. Whether a hit counts as fresh or stale is decided
/// here, at read time, against `stale_time`. Store errors never escape: a
/// failed read is a miss and a failed write is logged and dropped.
pub struct CacheLayer<S: CacheStorage> {
  storage: Arc<S>,
  /// How long before cached data is considered stale
  stale_time: Duration,
}

impl<S: CacheStorage> CacheLayer<S> {
  /// Create a new cache layer with the given storage backend.
  pub fn new(storage: Arc<S>) -> Self {
    Self {
      storage,
      stale_time: Duration::minutes(5),
    }
  }

  /// Set the stale time for cached data.
  pub fn with_stale_time(mut self, stale_time: Duration) -> Self {
    self.stale_time = stale_time;
    self
  }

  /// Check if cached data is stale based on cached_at timestamp.
  fn is_stale(&self, cached_at: chrono::DateTime<Utc>) -> bool {
    Utc::now() - cached_at > self.stale_time
  }

  fn classify(&self, entry: CacheEntry) -> CacheResult<CacheEntry> {
    let cached_at = entry.stored_at;
    let stale = self.is_stale(cached_at);
    CacheResult::from_cache(entry, cached_at, stale)
  }

  /// Look up a key in any namespace, most recent entry first.
  pub fn lookup_any(&self, key: &RequestKey) -> Option<CacheResult<CacheEntry>> {
    match self.storage.match_any(key) {
      Ok(entry) => entry.map(|e| self.classify(e)),
      Err(e) => {
        warn!(key = %key, error = %e, "cache read failed, treating as miss");
        None
      }
    }
  }

  /// Look up an entry to serve because the network is unreachable.
  pub fn fallback(&self, key: &RequestKey) -> Option<CacheResult<CacheEntry>> {
    self.lookup_any(key).map(|hit| {
      let cached_at = hit.cached_at.unwrap_or(hit.data.stored_at);
      CacheResult::offline(hit.data, cached_at)
    })
  }

  /// Write an entry. Failures degrade to "delivered but not cached".
  pub fn store(&self, namespace: &Namespace, entry: &CacheEntry) -> bool {
    match self.storage.put(namespace, entry) {
      Ok(()) => true,
      Err(e) => {
        warn!(namespace = %namespace.name, url = %entry.url, error = %e, "cache write failed");
        false
      }
    }
  }
}

impl<S: CacheStorage> Clone for CacheLayer<S> {
  fn clone(&self) -> Self {
    Self {
      storage: Arc::clone(&self.storage),
      stale_time: self.stale_time,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{CacheSource, SqliteStorage};
  use crate::db::Database;
  use crate::net::{Request, Response};
  use reqwest::StatusCode;
  use url::Url;

  fn layer() -> CacheLayer<SqliteStorage> {
    let db = Arc::new(Database::open_in_memory().unwrap());
    CacheLayer::new(Arc::new(SqliteStorage::new(db)))
  }

  fn entry(url: &str) -> CacheEntry {
    let request = Request::get(Url::parse(url).unwrap());
    CacheEntry::snapshot(&request, &Response::new(StatusCode::OK, "body"))
  }

  #[test]
  fn test_fresh_and_stale_hits() {
    let layer = layer();
    let ns = Namespace::new("receipts-dynamic-v1", 1);

    let fresh = entry("https://app.example.com/api/me");
    assert!(layer.store(&ns, &fresh));
    let hit = layer.lookup_any(&fresh.key).unwrap();
    assert_eq!(hit.source, CacheSource::CacheFresh);

    let mut old = entry("https://app.example.com/api/old");
    old.stored_at = Utc::now() - Duration::hours(1);
    assert!(layer.store(&ns, &old));
    let hit = layer.lookup_any(&old.key).unwrap();
    assert_eq!(hit.source, CacheSource::CacheStale);
  }

  #[test]
  fn test_fallback_marks_offline() {
    let layer = layer();
    let ns = Namespace::new("receipts-dynamic-v1", 1);
    let e = entry("https://app.example.com/api/me");
    layer.store(&ns, &e);

    let hit = layer.fallback(&e.key).unwrap();
    assert_eq!(hit.source, CacheSource::Offline);
    assert_eq!(hit.data.body, e.body);
  }

  #[test]
  fn test_miss_returns_none() {
    let layer = layer();
    let e = entry("https://app.example.com/api/none");
    assert!(layer.lookup_any(&e.key).is_none());
    assert!(layer.fallback(&e.key).is_none());
  }
}
