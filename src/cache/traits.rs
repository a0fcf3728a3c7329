//! Core traits and types for the cache store.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use color_eyre::Result;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::StatusCode;

use super::key::{normalize_url, RequestKey};
use crate::net::{Request, Response, ResponseKind};

/// A named, versioned grouping of cache entries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Namespace {
  pub name: String,
  pub generation: u64,
}

impl Namespace {
  pub fn new(name: impl Into<String>, generation: u64) -> Self {
    Self {
      name: name.into(),
      generation,
    }
  }
}

/// Immutable snapshot of a response, keyed by its request fingerprint.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
  pub key: RequestKey,
  pub url: String,
  pub status: u16,
  pub headers: Vec<(String, String)>,
  pub body: Bytes,
  pub stored_at: DateTime<Utc>,
}

impl CacheEntry {
  /// Snapshot a response for the given request.
  pub fn snapshot(request: &Request, response: &Response) -> Self {
    let headers = response
      .headers
      .iter()
      .map(|(name, value)| {
        (
          name.as_str().to_string(),
          String::from_utf8_lossy(value.as_bytes()).into_owned(),
        )
      })
      .collect();

    Self {
      key: RequestKey::for_request(request),
      url: normalize_url(&request.url),
      status: response.status.as_u16(),
      headers,
      body: response.body.clone(),
      stored_at: Utc::now(),
    }
  }

  /// Rebuild a response from the snapshot.
  pub fn to_response(&self) -> Response {
    let mut headers = HeaderMap::new();
    for (name, value) in &self.headers {
      if let (Ok(name), Ok(value)) = (
        HeaderName::from_bytes(name.as_bytes()),
        HeaderValue::from_str(value),
      ) {
        headers.append(name, value);
      }
    }

    Response {
      status: StatusCode::from_u16(self.status).unwrap_or(StatusCode::OK),
      headers,
      body: self.body.clone(),
      kind: ResponseKind::Basic,
    }
  }
}

/// Trait for cache storage backends.
pub trait CacheStorage: Send + Sync + 'static {
  /// Create the namespace if it does not exist yet.
  fn open_namespace(&self, namespace: &Namespace) -> Result<()>;

  /// All namespaces currently stored.
  fn namespaces(&self) -> Result<Vec<Namespace>>;

  /// Delete a namespace and every entry in it. Returns false if it did not exist.
  fn delete_namespace(&self, name: &str) -> Result<bool>;

  /// Store an entry, replacing any previous entry for the same key.
  fn put(&self, namespace: &Namespace, entry: &CacheEntry) -> Result<()>;

  /// Look up an entry in one namespace.
  #[allow(dead_code)]
  fn get(&self, namespace: &str, key: &RequestKey) -> Result<Option<CacheEntry>>;

  /// Look up the most recently stored entry for a key across all namespaces.
  fn match_any(&self, key: &RequestKey) -> Result<Option<CacheEntry>>;

  /// Number of entries in a namespace.
  fn entry_count(&self, namespace: &str) -> Result<usize>;
}

/// Result from a cache operation, including data and metadata about the source.
#[derive(Debug, Clone)]
pub struct CacheResult<T> {
  /// The actual data
  pub data: T,
  /// Where the data came from
  pub source: CacheSource,
  /// When the data was cached (if from cache)
  pub cached_at: Option<DateTime<Utc>>,
}

impl<T> CacheResult<T> {
  /// Create a new cache result from fresh network data.
  pub fn from_network(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Network,
      cached_at: None,
    }
  }

  /// Create a new cache result from cached data.
  pub fn from_cache(data: T, cached_at: DateTime<Utc>, is_stale: bool) -> Self {
    Self {
      data,
      source: if is_stale {
        CacheSource::CacheStale
      } else {
        CacheSource::CacheFresh
      },
      cached_at: Some(cached_at),
    }
  }

  /// Create a new cache result for offline mode.
  pub fn offline(data: T, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::Offline,
      cached_at: Some(cached_at),
    }
  }

  pub fn map<U>(self, f: impl FnOnce(T) -> U) -> CacheResult<U> {
    CacheResult {
      data: f(self.data),
      source: self.source,
      cached_at: self.cached_at,
    }
  }

  /// Create a result for a response synthesized because nothing else was available.
  pub fn synthesized(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Synthesized,
      cached_at: None,
    }
  }
}

/// Indicates where a served response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fresh data from network
  Network,
  /// Data from cache, still considered fresh
  CacheFresh,
  /// Data from cache, older than the stale threshold
  CacheStale,
  /// Offline mode - network unavailable, serving cached data
  Offline,
  /// Offline notice or queued-write acknowledgement built locally
  Synthesized,
}

impl CacheSource {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Network => "network",
      Self::CacheFresh => "cache",
      Self::CacheStale => "cache-stale",
      Self::Offline => "offline-cache",
      Self::Synthesized => "synthesized",
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use reqwest::header::CONTENT_TYPE;
  use url::Url;

  #[test]
  fn test_snapshot_preserves_status_headers_and_body() {
    let request = Request::get(Url::parse("https://app.example.com/api/me#x").unwrap());
    let response = Response::new(StatusCode::CREATED, "hello")
      .with_header(CONTENT_TYPE, "text/plain");

    let entry = CacheEntry::snapshot(&request, &response);
    assert_eq!(entry.url, "https://app.example.com/api/me");

    let restored = entry.to_response();
    assert_eq!(restored.status, StatusCode::CREATED);
    assert_eq!(restored.body, response.body);
    assert_eq!(restored.headers.get(CONTENT_TYPE).unwrap(), "text/plain");
  }
}
