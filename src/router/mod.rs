//! Per-request strategy selection.
//!
//! The router never fails a request. Every branch ends in a live response, a
//! cached snapshot, or a synthesized offline answer. Cache writes are not done
//! inline: they come back as `Effect::CachePut` carrying a snapshot, so the
//! response handed to the caller is never consumed by caching.

mod classify;
pub mod offline;

pub use classify::{classify, RequestClass, RoutePolicy};

use reqwest::Method;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::cache::{CacheEntry, CacheLayer, CacheResult, CacheStorage, Namespace, RequestKey};
use crate::lifecycle::Namespaces;
use crate::net::{FetchError, Fetcher, Request, Response};
use crate::queue::MutationStore;
use crate::worker::Effect;

/// Outcome of routing one request.
#[derive(Debug)]
pub struct Routed {
  pub class: RequestClass,
  /// `None` when the request bypassed the layer
  pub response: Option<CacheResult<Response>>,
  pub effects: Vec<Effect>,
}

impl Routed {
  fn bypass() -> Self {
    Self {
      class: RequestClass::Bypass,
      response: None,
      effects: Vec::new(),
    }
  }

  fn respond(class: RequestClass, response: CacheResult<Response>, effects: Vec<Effect>) -> Self {
    Self {
      class,
      response: Some(response),
      effects,
    }
  }
}

pub struct Router<S: CacheStorage, N: Fetcher> {
  cache: CacheLayer<S>,
  fetcher: Arc<N>,
  queue: Arc<MutationStore>,
  policy: RoutePolicy,
}

impl<S: CacheStorage, N: Fetcher> Router<S, N> {
  pub fn new(
    cache: CacheLayer<S>,
    fetcher: Arc<N>,
    queue: Arc<MutationStore>,
    policy: RoutePolicy,
  ) -> Self {
    Self {
      cache,
      fetcher,
      queue,
      policy,
    }
  }

  /// Route one request, refilling the namespaces of the serving generation.
  pub async fn route(&self, request: Request, namespaces: &Namespaces) -> Routed {
    let class = classify(&request, &self.policy);
    debug!(method = %request.method, url = %request.url, class = class.as_str(), "routing");

    match class {
      RequestClass::Bypass => Routed::bypass(),
      RequestClass::Api => self.network_first_api(request, &namespaces.dynamic).await,
      RequestClass::Image => {
        self
          .cache_first(class, request, &namespaces.dynamic, Response::is_success)
          .await
      }
      RequestClass::Navigation => {
        self
          .network_first_navigation(request, &namespaces.dynamic)
          .await
      }
      RequestClass::Static => {
        self
          .cache_first(class, request, &namespaces.static_assets, Response::is_basic_success)
          .await
      }
    }
  }

  fn cache_put(namespace: &Namespace, request: &Request, response: &Response) -> Effect {
    Effect::CachePut {
      namespace: namespace.clone(),
      entry: CacheEntry::snapshot(request, response),
    }
  }

  async fn network_first_api(&self, request: Request, dynamic: &Namespace) -> Routed {
    let class = RequestClass::Api;
    let error = match self.fetcher.fetch(&request).await {
      Ok(response) => {
        let mut effects = Vec::new();
        if request.method == Method::GET && response.is_success() {
          effects.push(Self::cache_put(dynamic, &request, &response));
        }
        return Routed::respond(class, CacheResult::from_network(response), effects);
      }
      Err(error) => error,
    };
    log_network_failure(&request, &error);

    if self.policy.is_receipt_create(&request) {
      return Routed::respond(class, self.queue_write(&request), Vec::new());
    }

    if request.method == Method::GET {
      if let Some(hit) = self.cache.fallback(&RequestKey::for_request(&request)) {
        return Routed::respond(class, hit.map(|e| e.to_response()), Vec::new());
      }
    }

    Routed::respond(
      class,
      CacheResult::synthesized(offline::unavailable()),
      Vec::new(),
    )
  }

  /// Persist a failed write for replay and acknowledge it.
  ///
  /// The 202 is only sent once the mutation is durable; if the queue cannot
  /// take it the caller gets the plain offline 503 instead.
  fn queue_write(&self, request: &Request) -> CacheResult<Response> {
    match self.queue.enqueue(
      request.url.as_str(),
      &request.method,
      request.content_type(),
      &request.body,
    ) {
      Ok(mutation) => {
        info!(id = %mutation.id, endpoint = %mutation.endpoint, "write queued for replay");
        CacheResult::synthesized(offline::queued(&mutation.id))
      }
      Err(e) => {
        warn!(url = %request.url, error = %e, "failed to queue write");
        CacheResult::synthesized(offline::unavailable())
      }
    }
  }

  async fn cache_first(
    &self,
    class: RequestClass,
    request: Request,
    namespace: &Namespace,
    cacheable: fn(&Response) -> bool,
  ) -> Routed {
    let is_get = request.method == Method::GET;
    if is_get {
      if let Some(hit) = self.cache.lookup_any(&RequestKey::for_request(&request)) {
        return Routed::respond(class, hit.map(|e| e.to_response()), Vec::new());
      }
    }

    match self.fetcher.fetch(&request).await {
      Ok(response) => {
        let mut effects = Vec::new();
        if is_get && cacheable(&response) {
          effects.push(Self::cache_put(namespace, &request, &response));
        } else if is_get {
          debug!(url = %request.url, status = %response.status, kind = ?response.kind, "not caching response");
        }
        Routed::respond(class, CacheResult::from_network(response), effects)
      }
      Err(error) => {
        log_network_failure(&request, &error);
        Routed::respond(class, CacheResult::synthesized(offline::asset()), Vec::new())
      }
    }
  }

  async fn network_first_navigation(&self, request: Request, dynamic: &Namespace) -> Routed {
    let class = RequestClass::Navigation;
    let error = match self.fetcher.fetch(&request).await {
      Ok(response) => {
        let mut effects = Vec::new();
        if request.method == Method::GET && response.is_success() {
          effects.push(Self::cache_put(dynamic, &request, &response));
        }
        return Routed::respond(class, CacheResult::from_network(response), effects);
      }
      Err(error) => error,
    };
    log_network_failure(&request, &error);

    let page = RequestKey::new(&Method::GET, &request.url);
    let root = RequestKey::new(&Method::GET, &self.policy.root_document);
    let hit = self
      .cache
      .fallback(&page)
      .or_else(|| self.cache.fallback(&root));

    match hit {
      Some(hit) => Routed::respond(class, hit.map(|e| e.to_response()), Vec::new()),
      None => Routed::respond(class, CacheResult::synthesized(offline::page()), Vec::new()),
    }
  }
}

fn log_network_failure(request: &Request, error: &FetchError) {
  info!(method = %request.method, url = %request.url, error = %error, "network unavailable, degrading");
}
