//! Scripted fetcher for tests.

use bytes::Bytes;
use reqwest::{Method, StatusCode};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use super::{FetchError, Fetcher, Request, Response};

#[derive(Clone)]
enum Script {
  Respond(Response),
  Fail,
  TimeOut,
}

/// Records every call and answers from a per-URL script.
///
/// Unscripted URLs answer 404. `set_offline(true)` fails every request.
#[derive(Default)]
pub struct ScriptedFetcher {
  routes: Mutex<HashMap<String, Script>>,
  calls: Mutex<Vec<(Method, String, Bytes)>>,
  offline: AtomicBool,
  delay: Option<Duration>,
}

impl ScriptedFetcher {
  pub fn new() -> Self {
    Self::default()
  }

  /// Delay every answer, so concurrent handlers interleave.
  pub fn with_delay(mut self, delay: Duration) -> Self {
    self.delay = Some(delay);
    self
  }

  pub fn respond(&self, url: &str, response: Response) {
    self
      .routes
      .lock()
      .unwrap()
      .insert(url.to_string(), Script::Respond(response));
  }

  pub fn respond_ok(&self, url: &str, body: &str) {
    self.respond(url, Response::new(StatusCode::OK, body.to_string()));
  }

  pub fn fail(&self, url: &str) {
    self
      .routes
      .lock()
      .unwrap()
      .insert(url.to_string(), Script::Fail);
  }

  /// Answer as if the request outlived the fetch timeout.
  pub fn time_out(&self, url: &str) {
    self
      .routes
      .lock()
      .unwrap()
      .insert(url.to_string(), Script::TimeOut);
  }

  pub fn set_offline(&self, offline: bool) {
    self.offline.store(offline, Ordering::SeqCst);
  }

  pub fn calls(&self) -> Vec<(Method, String, Bytes)> {
    self.calls.lock().unwrap().clone()
  }

  pub fn call_count(&self) -> usize {
    self.calls.lock().unwrap().len()
  }

  pub fn calls_to(&self, url: &str) -> usize {
    self
      .calls
      .lock()
      .unwrap()
      .iter()
      .filter(|(_, u, _)| u == url)
      .count()
  }
}

impl Fetcher for ScriptedFetcher {
  async fn fetch(&self, request: &Request) -> Result<Response, FetchError> {
    let url = request.url.to_string();
    self
      .calls
      .lock()
      .unwrap()
      .push((request.method.clone(), url.clone(), request.body.clone()));

    if let Some(delay) = self.delay {
      tokio::time::sleep(delay).await;
    }

    if self.offline.load(Ordering::SeqCst) {
      return Err(FetchError::Network("offline".to_string()));
    }

    let script = self.routes.lock().unwrap().get(&url).cloned();
    match script {
      Some(Script::Respond(response)) => Ok(response),
      Some(Script::Fail) => Err(FetchError::Network(format!("connection refused: {}", url))),
      Some(Script::TimeOut) => Err(FetchError::Timeout(Duration::from_secs(10))),
      None => Ok(Response::new(StatusCode::NOT_FOUND, "")),
    }
  }
}
