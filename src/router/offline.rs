//! Responses synthesized when neither network nor cache can answer.

use reqwest::header::CONTENT_TYPE;
use reqwest::StatusCode;
use serde_json::json;

use crate::net::Response;

const OFFLINE_PAGE: &str = "<!doctype html>\
<html><head><meta charset=\"utf-8\"><title>Offline</title></head>\
<body><h1>You are offline</h1>\
<p>This page is not available offline yet. It will load once you reconnect.</p>\
</body></html>";

/// Generic API failure: 503 with an offline indicator.
pub fn unavailable() -> Response {
  Response::json(
    StatusCode::SERVICE_UNAVAILABLE,
    &json!({
      "offline": true,
      "message": "You are offline. Showing cached data where available.",
    }),
  )
}

/// Acknowledgement for a receipt write parked in the mutation queue.
pub fn queued(id: &str) -> Response {
  Response::json(
    StatusCode::ACCEPTED,
    &json!({
      "offline": true,
      "queued": true,
      "id": id,
      "message": "Receipt saved offline. It will sync when you are back online.",
    }),
  )
}

/// Navigation with nothing cached, not even the root document.
pub fn page() -> Response {
  Response::new(StatusCode::SERVICE_UNAVAILABLE, OFFLINE_PAGE)
    .with_header(CONTENT_TYPE, "text/html; charset=utf-8")
}

/// Asset with nothing cached.
pub fn asset() -> Response {
  Response::new(StatusCode::SERVICE_UNAVAILABLE, "Offline")
    .with_header(CONTENT_TYPE, "text/plain; charset=utf-8")
}
