//! Replay of queued mutations.

use color_eyre::{eyre::eyre, Result};
use reqwest::header::HeaderValue;
use reqwest::StatusCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};
use url::Url;

use super::{MutationStore, PendingMutation};
use crate::net::{Fetcher, Request};

/// In-memory "drain in progress" flag.
///
/// Collapses concurrent triggers into one pass. It lives only as long as the
/// process; a torn-down process simply starts with no drain in flight.
#[derive(Debug, Default)]
pub struct DrainFlag {
  draining: AtomicBool,
}

impl DrainFlag {
  pub fn new() -> Self {
    Self::default()
  }

  /// Claim the flag. `None` if a drain is already running.
  pub fn try_acquire(&self) -> Option<DrainGuard<'_>> {
    self
      .draining
      .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
      .ok()
      .map(|_| DrainGuard { flag: self })
  }

  #[allow(dead_code)]
  pub fn is_draining(&self) -> bool {
    self.draining.load(Ordering::Acquire)
  }

  pub fn reset(&self) {
    self.draining.store(false, Ordering::Release);
  }
}

/// Releases the drain flag when dropped, including on early return.
pub struct DrainGuard<'a> {
  flag: &'a DrainFlag,
}

impl Drop for DrainGuard<'_> {
  fn drop(&mut self) {
    self.flag.reset();
  }
}

/// Bounded retry: after `max_attempts` failed replays a mutation is parked.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
  pub max_attempts: u32,
}

impl RetryPolicy {
  pub fn new(max_attempts: u32) -> Self {
    Self {
      max_attempts: max_attempts.max(1),
    }
  }

  /// Statuses worth another try. Other non-2xx answers are rejections.
  fn is_retryable(&self, status: StatusCode) -> bool {
    status.is_server_error()
      || status == StatusCode::REQUEST_TIMEOUT
      || status == StatusCode::TOO_MANY_REQUESTS
  }
}

/// What one drain pass did, by mutation id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
  /// Another drain was in flight; nothing was replayed
  pub skipped: bool,
  /// Confirmed by the server and removed
  pub replayed: Vec<String>,
  /// Failed this pass, still queued
  pub retrying: Vec<String>,
  /// Given up on, parked as failed
  pub failed: Vec<String>,
}

impl DrainReport {
  pub fn skipped() -> Self {
    Self {
      skipped: true,
      ..Self::default()
    }
  }
}

enum Replay {
  Confirmed,
  Retry(String),
  Rejected(String),
}

/// Replays pending mutations against their original endpoints.
pub struct Replayer<N: Fetcher> {
  store: Arc<MutationStore>,
  fetcher: Arc<N>,
  policy: RetryPolicy,
}

impl<N: Fetcher> Replayer<N> {
  pub fn new(store: Arc<MutationStore>, fetcher: Arc<N>, policy: RetryPolicy) -> Self {
    Self {
      store,
      fetcher,
      policy,
    }
  }

  pub fn store(&self) -> &Arc<MutationStore> {
    &self.store
  }

  /// Replay every pending mutation once, oldest first.
  ///
  /// The pending list is read once up front, so mutations enqueued while the
  /// pass runs wait for the next one.
  pub async fn drain(&self, flag: &DrainFlag) -> Result<DrainReport> {
    let Some(_guard) = flag.try_acquire() else {
      debug!("drain already in flight, skipping");
      return Ok(DrainReport::skipped());
    };

    let pending = self.store.pending()?;
    let mut report = DrainReport::default();
    if pending.is_empty() {
      return Ok(report);
    }
    info!(count = pending.len(), "draining mutation queue");

    for mutation in pending {
      let replay = self.replay(&mutation).await;
      // A store error costs this mutation its turn, not the rest of the pass
      if let Err(e) = self.settle(&mutation, replay, &mut report) {
        warn!(id = %mutation.id, error = %e, "failed to record replay outcome, skipping");
      }
    }

    info!(
      replayed = report.replayed.len(),
      retrying = report.retrying.len(),
      failed = report.failed.len(),
      "drain finished"
    );
    Ok(report)
  }

  fn settle(&self, mutation: &PendingMutation, replay: Replay, report: &mut DrainReport) -> Result<()> {
    let id = &mutation.id;
    match replay {
      Replay::Confirmed => {
        self.store.remove(id)?;
        debug!(id = %id, endpoint = %mutation.endpoint, "mutation replayed");
        report.replayed.push(id.clone());
      }
      Replay::Retry(error) => {
        let attempts = self.store.record_failure(id, &error)?;
        if attempts >= self.policy.max_attempts {
          self.store.mark_failed(id, &error)?;
          warn!(
            id = %id,
            endpoint = %mutation.endpoint,
            attempts,
            error = %error,
            "giving up on mutation"
          );
          report.failed.push(id.clone());
        } else {
          debug!(id = %id, attempts, error = %error, "replay failed, will retry");
          report.retrying.push(id.clone());
        }
      }
      Replay::Rejected(error) => {
        self.store.record_failure(id, &error)?;
        self.store.mark_failed(id, &error)?;
        warn!(
          id = %id,
          endpoint = %mutation.endpoint,
          error = %error,
          "server rejected replayed mutation"
        );
        report.failed.push(id.clone());
      }
    }
    Ok(())
  }

  async fn replay(&self, mutation: &PendingMutation) -> Replay {
    let request = match replay_request(mutation) {
      Ok(request) => request,
      Err(e) => return Replay::Rejected(e.to_string()),
    };

    match self.fetcher.fetch(&request).await {
      Ok(response) if response.is_success() => Replay::Confirmed,
      Ok(response) if self.policy.is_retryable(response.status) => {
        Replay::Retry(format!("server answered {}", response.status))
      }
      Ok(response) => Replay::Rejected(format!("server answered {}", response.status)),
      Err(e) => Replay::Retry(e.to_string()),
    }
  }
}

/// Rebuild the original write. The mutation id doubles as an idempotency key.
fn replay_request(mutation: &PendingMutation) -> Result<Request> {
  let url = Url::parse(&mutation.endpoint)
    .map_err(|e| eyre!("Invalid endpoint {}: {}", mutation.endpoint, e))?;
  let mut request = Request::new(mutation.method()?, url);
  match &mutation.content_type {
    Some(content_type) => request = request.with_body(content_type, mutation.payload.clone()),
    None => request.body = mutation.payload.clone(),
  }
  if let Ok(value) = HeaderValue::from_str(&mutation.id) {
    request.headers.insert("idempotency-key", value);
  }
  Ok(request)
}
