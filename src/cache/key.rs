use reqwest::Method;
use sha2::{Digest, Sha256};
use std::fmt;
use url::Url;

use crate::net::Request;

/// Fingerprint of a request: method plus normalized URL.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestKey(String);

impl RequestKey {
  pub fn new(method: &Method, url: &Url) -> Self {
    let input = format!("{} {}", method.as_str(), normalize_url(url));

    // SHA256 hash for stable, fixed-length keys
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    Self(hex::encode(hasher.finalize()))
  }

  pub fn for_request(request: &Request) -> Self {
    Self::new(&request.method, &request.url)
  }

  /// Wrap a key read back from storage.
  pub fn from_stored(key: String) -> Self {
    Self(key)
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl fmt::Display for RequestKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

/// Normalize a URL for keying.
///
/// Parsing already lowercases scheme and host and drops default ports; the
/// fragment never reaches the server so it is dropped too.
pub fn normalize_url(url: &Url) -> String {
  let mut url = url.clone();
  url.set_fragment(None);
  url.to_string()
}
