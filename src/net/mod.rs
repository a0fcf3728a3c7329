//! HTTP request/response model shared by the router, the queue and the lifecycle.
//!
//! The layer only ever sees requests and responses. `Fetcher` is the seam to the
//! real network; everything above it can be driven by a scripted fetcher in tests.

mod client;
#[cfg(test)]
pub mod testing;

pub use client::HttpFetcher;

use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use reqwest::{Method, StatusCode};
use std::future::Future;
use std::time::Duration;
use url::Url;

/// What the request is going to be used for by the client.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Destination {
  #[default]
  Empty,
  Document,
  Image,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RequestMode {
  #[default]
  SameOrigin,
  /// Full page navigation
  Navigate,
}

/// An intercepted outgoing request.
#[derive(Debug, Clone)]
pub struct Request {
  pub method: Method,
  pub url: Url,
  pub headers: HeaderMap,
  pub body: Bytes,
  pub destination: Destination,
  pub mode: RequestMode,
}

impl Request {
  pub fn new(method: Method, url: Url) -> Self {
    Self {
      method,
      url,
      headers: HeaderMap::new(),
      body: Bytes::new(),
      destination: Destination::default(),
      mode: RequestMode::default(),
    }
  }

  pub fn get(url: Url) -> Self {
    Self::new(Method::GET, url)
  }

  /// Attach a body along with its content type.
  pub fn with_body(mut self, content_type: &str, body: impl Into<Bytes>) -> Self {
    if let Ok(value) = HeaderValue::from_str(content_type) {
      self.headers.insert(CONTENT_TYPE, value);
    }
    self.body = body.into();
    self
  }

  pub fn with_destination(mut self, destination: Destination) -> Self {
    self.destination = destination;
    self
  }

  /// Mark this request as a full page navigation.
  pub fn navigate(mut self) -> Self {
    self.mode = RequestMode::Navigate;
    self.destination = Destination::Document;
    self
  }

  pub fn content_type(&self) -> Option<&str> {
    self.headers.get(CONTENT_TYPE).and_then(|v| v.to_str().ok())
  }

  pub fn is_http(&self) -> bool {
    matches!(self.url.scheme(), "http" | "https")
  }
}

/// Response type, mirroring what a browser exposes for a fetched response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseKind {
  /// Same-origin response, fully readable
  Basic,
  /// Cross-origin response with CORS headers
  Cors,
  /// Cross-origin response without CORS, body unreadable
  #[allow(dead_code)]
  Opaque,
}

#[derive(Debug, Clone)]
pub struct Response {
  pub status: StatusCode,
  pub headers: HeaderMap,
  pub body: Bytes,
  pub kind: ResponseKind,
}

impl Response {
  pub fn new(status: StatusCode, body: impl Into<Bytes>) -> Self {
    Self {
      status,
      headers: HeaderMap::new(),
      body: body.into(),
      kind: ResponseKind::Basic,
    }
  }

  /// Build a JSON response from a serializable value.
  pub fn json(status: StatusCode, value: &serde_json::Value) -> Self {
    let mut response = Self::new(status, value.to_string());
    response
      .headers
      .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
  }

  #[allow(dead_code)]
  pub fn with_kind(mut self, kind: ResponseKind) -> Self {
    self.kind = kind;
    self
  }

  pub fn with_header(mut self, name: reqwest::header::HeaderName, value: &'static str) -> Self {
    self.headers.insert(name, HeaderValue::from_static(value));
    self
  }

  pub fn is_success(&self) -> bool {
    self.status.is_success()
  }

  /// Same-origin and successful. Anything else would poison the static namespace.
  pub fn is_basic_success(&self) -> bool {
    self.is_success() && self.kind == ResponseKind::Basic
  }
}

/// Why a request never produced a response.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
  #[error("network unreachable: {0}")]
  Network(String),
  #[error("request timed out after {0:?}")]
  Timeout(Duration),
  #[error("unsupported request: {0}")]
  Unsupported(String),
}

/// Transport between the layer and the server.
pub trait Fetcher: Send + Sync + 'static {
  fn fetch(&self, request: &Request) -> impl Future<Output = Result<Response, FetchError>> + Send;
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_with_body_sets_content_type() {
    let url = Url::parse("https://app.example.com/api/receipts").unwrap();
    let request = Request::new(Method::POST, url).with_body("application/json", "{}");
    assert_eq!(request.content_type(), Some("application/json"));
    assert_eq!(request.body.as_ref(), b"{}");
  }

  #[test]
  fn test_navigate_sets_document_destination() {
    let url = Url::parse("https://app.example.com/receipts").unwrap();
    let request = Request::get(url).navigate();
    assert_eq!(request.mode, RequestMode::Navigate);
    assert_eq!(request.destination, Destination::Document);
  }

  #[test]
  fn test_basic_success_rejects_cross_origin() {
    let ok = Response::new(StatusCode::OK, "x");
    assert!(ok.is_basic_success());
    assert!(!ok.clone().with_kind(ResponseKind::Opaque).is_basic_success());
    assert!(!ok.with_kind(ResponseKind::Cors).is_basic_success());
    assert!(!Response::new(StatusCode::NOT_FOUND, "").is_basic_success());
  }

  #[test]
  fn test_is_http() {
    let data = Request::get(Url::parse("data:text/plain,hello").unwrap());
    assert!(!data.is_http());
    let https = Request::get(Url::parse("https://app.example.com/").unwrap());
    assert!(https.is_http());
  }
}
