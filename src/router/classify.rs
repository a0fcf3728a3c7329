use color_eyre::Result;
use url::Url;

use crate::config::Config;
use crate::net::{Destination, Request, RequestMode};

/// Which strategy handles a request. Checked in declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestClass {
  /// Not http(s); left alone entirely
  Bypass,
  /// Network-first, queued writes on failure
  Api,
  /// Cache-first
  Image,
  /// Network-first with navigation fallback
  Navigation,
  /// Cache-first with refill of same-origin successes
  Static,
}

impl RequestClass {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Bypass => "bypass",
      Self::Api => "api",
      Self::Image => "image",
      Self::Navigation => "navigation",
      Self::Static => "static",
    }
  }
}

#[derive(Debug, Clone)]
pub struct RoutePolicy {
  pub api_prefix: String,
  pub receipts_endpoint: String,
  pub root_document: Url,
  pub image_extensions: Vec<String>,
}

impl RoutePolicy {
  pub fn from_config(config: &Config) -> Result<Self> {
    Ok(Self {
      api_prefix: config.routes.api_prefix.clone(),
      receipts_endpoint: config.routes.receipts_endpoint.clone(),
      root_document: config.resolve(&config.routes.root_document)?,
      image_extensions: config
        .routes
        .image_extensions
        .iter()
        .map(|e| e.trim_start_matches('.').to_lowercase())
        .collect(),
    })
  }

  fn is_api(&self, path: &str) -> bool {
    path.starts_with(&self.api_prefix) || path == self.api_prefix.trim_end_matches('/')
  }

  fn is_image_path(&self, path: &str) -> bool {
    let file = path.rsplit('/').next().unwrap_or("");
    match file.rsplit_once('.') {
      Some((_, ext)) => {
        let ext = ext.to_lowercase();
        self.image_extensions.iter().any(|e| *e == ext)
      }
      None => false,
    }
  }

  /// A POST to the receipt-creation endpoint.
  pub fn is_receipt_create(&self, request: &Request) -> bool {
    request.method == reqwest::Method::POST
      && request.url.path().trim_end_matches('/') == self.receipts_endpoint.trim_end_matches('/')
  }
}

pub fn classify(request: &Request, policy: &RoutePolicy) -> RequestClass {
  if !request.is_http() {
    return RequestClass::Bypass;
  }

  let path = request.url.path();
  if policy.is_api(path) {
    RequestClass::Api
  } else if request.destination == Destination::Image || policy.is_image_path(path) {
    RequestClass::Image
  } else if request.mode == RequestMode::Navigate {
    RequestClass::Navigation
  } else {
    RequestClass::Static
  }
}
