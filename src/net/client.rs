use color_eyre::{eyre::eyre, Result};
use std::time::Duration;
use tracing::debug;
use url::Url;

use super::{FetchError, Fetcher, Request, Response, ResponseKind};
use crate::config::Config;

/// Fetcher backed by a real HTTP client.
///
/// Every request is raced against a fixed timeout so a stalled network turns
/// into a fallback decision instead of hanging the handler.
#[derive(Clone)]
pub struct HttpFetcher {
  client: reqwest::Client,
  origin: Url,
  timeout: Duration,
}

impl HttpFetcher {
  pub fn new(config: &Config) -> Result<Self> {
    let client = reqwest::Client::builder()
      .user_agent(concat!("offgrid/", env!("CARGO_PKG_VERSION")))
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self {
      client,
      origin: config.origin.clone(),
      timeout: config.fetch_timeout(),
    })
  }

  async fn send(&self, request: &Request) -> Result<Response, FetchError> {
    let mut builder = self
      .client
      .request(request.method.clone(), request.url.clone())
      .headers(request.headers.clone());
    if !request.body.is_empty() {
      builder = builder.body(request.body.clone());
    }

    let response = builder
      .send()
      .await
      .map_err(|e| FetchError::Network(e.to_string()))?;

    let kind = if response.url().origin() == self.origin.origin() {
      ResponseKind::Basic
    } else {
      ResponseKind::Cors
    };
    let status = response.status();
    let headers = response.headers().clone();
    let body = response
      .bytes()
      .await
      .map_err(|e| FetchError::Network(e.to_string()))?;

    Ok(Response {
      status,
      headers,
      body,
      kind,
    })
  }
}

impl Fetcher for HttpFetcher {
  async fn fetch(&self, request: &Request) -> Result<Response, FetchError> {
    if !request.is_http() {
      return Err(FetchError::Unsupported(format!(
        "scheme {}",
        request.url.scheme()
      )));
    }

    debug!(method = %request.method, url = %request.url, "fetching");
    match tokio::time::timeout(self.timeout, self.send(request)).await {
      Ok(result) => result,
      Err(_) => Err(FetchError::Timeout(self.timeout)),
    }
  }
}
