//! Cache generation lifecycle: provisioning, take-over and activation.
//!
//! The installed/active generation is persisted, so the phase survives the
//! process being torn down between install and activate.

use color_eyre::{eyre::eyre, Result};
use futures::future::join_all;
use std::sync::Arc;
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::{CacheEntry, CacheStorage, Namespace};
use crate::db::Database;
use crate::net::{Fetcher, Request};

const INSTALLED_KEY: &str = "installed_generation";
const ACTIVE_KEY: &str = "active_generation";
const SKIP_WAITING_KEY: &str = "skip_waiting";

/// The two live namespaces of one generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Namespaces {
  pub static_assets: Namespace,
  pub dynamic: Namespace,
}

impl Namespaces {
  pub fn for_generation(app: &str, generation: u64) -> Self {
    Self {
      static_assets: Namespace::new(format!("{}-static-v{}", app, generation), generation),
      dynamic: Namespace::new(format!("{}-dynamic-v{}", app, generation), generation),
    }
  }

  pub fn contains(&self, name: &str) -> bool {
    self.static_assets.name == name || self.dynamic.name == name
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
  /// Nothing installed for this generation
  Idle,
  /// Manifest fetch in progress
  Provisioning,
  /// Installed, waiting to take over
  Waiting,
  /// Serving traffic
  Active,
}

impl Phase {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Idle => "idle",
      Self::Provisioning => "provisioning",
      Self::Waiting => "waiting",
      Self::Active => "active",
    }
  }
}

#[derive(Debug, Clone)]
pub struct ProvisionReport {
  pub generation: u64,
  pub cached: Vec<Url>,
  pub failed: Vec<(Url, String)>,
  pub phase: Phase,
  /// Set when the take-over signal promoted the generation right away
  pub activation: Option<ActivationReport>,
}

#[derive(Debug, Clone, Default)]
pub struct ActivationReport {
  pub generation: u64,
  pub deleted: Vec<String>,
  /// Cleanup errors; logged, never blocking promotion
  pub errors: Vec<String>,
}

pub struct Lifecycle<S: CacheStorage, N: Fetcher> {
  storage: Arc<S>,
  fetcher: Arc<N>,
  db: Arc<Database>,
  app: String,
  manifest: Vec<Url>,
}

impl<S: CacheStorage, N: Fetcher> Lifecycle<S, N> {
  pub fn new(
    storage: Arc<S>,
    fetcher: Arc<N>,
    db: Arc<Database>,
    app: impl Into<String>,
    manifest: Vec<Url>,
  ) -> Self {
    Self {
      storage,
      fetcher,
      db,
      app: app.into(),
      manifest,
    }
  }

  pub fn namespaces(&self, generation: u64) -> Namespaces {
    Namespaces::for_generation(&self.app, generation)
  }

  fn read_generation(&self, key: &str) -> Result<Option<u64>> {
    self
      .db
      .get_meta(key)?
      .map(|v| {
        v.parse::<u64>()
          .map_err(|e| eyre!("Corrupt {} value '{}': {}", key, v, e))
      })
      .transpose()
  }

  pub fn active_generation(&self) -> Result<Option<u64>> {
    self.read_generation(ACTIVE_KEY)
  }

  pub fn phase(&self, generation: u64) -> Result<Phase> {
    if self.read_generation(ACTIVE_KEY)? == Some(generation) {
      return Ok(Phase::Active);
    }
    if self.read_generation(INSTALLED_KEY)? == Some(generation) {
      return Ok(Phase::Waiting);
    }
    Ok(Phase::Idle)
  }

  /// Pre-populate the static namespace with the manifest.
  ///
  /// Each asset is best-effort: a failed fetch or write is logged and reported,
  /// and that asset is simply served from the network later.
  pub async fn provision(&self, generation: u64) -> Result<ProvisionReport> {
    let namespaces = self.namespaces(generation);
    info!(
      generation,
      namespace = %namespaces.static_assets.name,
      assets = self.manifest.len(),
      phase = Phase::Provisioning.as_str(),
      "provisioning cache generation"
    );
    // Writes open their namespace on demand, so a failure here is not fatal
    for namespace in [&namespaces.static_assets, &namespaces.dynamic] {
      if let Err(e) = self.storage.open_namespace(namespace) {
        warn!(namespace = %namespace.name, error = %e, "failed to open namespace");
      }
    }

    let results = join_all(
      self
        .manifest
        .iter()
        .map(|url| self.provision_asset(&namespaces.static_assets, url)),
    )
    .await;

    let mut report = ProvisionReport {
      generation,
      cached: Vec::new(),
      failed: Vec::new(),
      phase: Phase::Waiting,
      activation: None,
    };
    for (url, result) in self.manifest.iter().zip(results) {
      match result {
        Ok(()) => report.cached.push(url.clone()),
        Err(error) => {
          warn!(url = %url, error = %error, "failed to provision asset");
          report.failed.push((url.clone(), error));
        }
      }
    }

    self
      .db
      .set_meta(INSTALLED_KEY, &generation.to_string())?;
    info!(
      generation,
      cached = report.cached.len(),
      failed = report.failed.len(),
      "provisioning finished"
    );

    if self.db.get_meta(SKIP_WAITING_KEY)?.as_deref() == Some(generation.to_string().as_str()) {
      report.activation = Some(self.activate(generation)?);
      report.phase = Phase::Active;
    }

    Ok(report)
  }

  async fn provision_asset(&self, namespace: &Namespace, url: &Url) -> Result<(), String> {
    let request = Request::get(url.clone());
    let response = self
      .fetcher
      .fetch(&request)
      .await
      .map_err(|e| e.to_string())?;
    if !response.is_success() {
      return Err(format!("server answered {}", response.status));
    }
    self
      .storage
      .put(namespace, &CacheEntry::snapshot(&request, &response))
      .map_err(|e| e.to_string())?;
    debug!(url = %url, "asset provisioned");
    Ok(())
  }

  /// Take over immediately instead of waiting.
  ///
  /// If the generation is already installed it is activated now; otherwise the
  /// signal is remembered and applied as soon as provisioning finishes.
  pub fn skip_waiting(&self, generation: u64) -> Result<Option<ActivationReport>> {
    match self.phase(generation)? {
      Phase::Active => Ok(None),
      Phase::Waiting => self.activate(generation).map(Some),
      Phase::Idle | Phase::Provisioning => {
        self
          .db
          .set_meta(SKIP_WAITING_KEY, &generation.to_string())?;
        debug!(generation, "take-over requested before install");
        Ok(None)
      }
    }
  }

  /// Promote a provisioned generation and evict every other namespace.
  pub fn activate(&self, generation: u64) -> Result<ActivationReport> {
    if self.read_generation(INSTALLED_KEY)? != Some(generation)
      && self.read_generation(ACTIVE_KEY)? != Some(generation)
    {
      return Err(eyre!("Generation {} has not been provisioned", generation));
    }

    let current = self.namespaces(generation);
    let mut report = ActivationReport {
      generation,
      ..ActivationReport::default()
    };

    match self.storage.namespaces() {
      Ok(namespaces) => {
        for namespace in namespaces {
          if current.contains(&namespace.name) {
            continue;
          }
          match self.storage.delete_namespace(&namespace.name) {
            Ok(_) => {
              debug!(namespace = %namespace.name, "evicted namespace");
              report.deleted.push(namespace.name);
            }
            Err(e) => {
              warn!(namespace = %namespace.name, error = %e, "failed to evict namespace");
              report.errors.push(format!("{}: {}", namespace.name, e));
            }
          }
        }
      }
      Err(e) => {
        warn!(error = %e, "failed to enumerate namespaces, skipping cleanup");
        report.errors.push(e.to_string());
      }
    }

    if let Err(e) = self.storage.open_namespace(&current.dynamic) {
      warn!(namespace = %current.dynamic.name, error = %e, "failed to open dynamic namespace");
      report.errors.push(e.to_string());
    }

    self.db.set_meta(ACTIVE_KEY, &generation.to_string())?;
    self.db.delete_meta(SKIP_WAITING_KEY)?;
    info!(
      generation,
      evicted = report.deleted.len(),
      "generation active"
    );

    Ok(report)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::testing::FaultyStorage;
  use crate::cache::SqliteStorage;
  use crate::net::testing::ScriptedFetcher;
  use crate::net::Response;
  use reqwest::StatusCode;

  struct Fixture {
    lifecycle: Lifecycle<SqliteStorage, ScriptedFetcher>,
    storage: Arc<SqliteStorage>,
    fetcher: Arc<ScriptedFetcher>,
  }

  fn fixture(manifest: &[&str]) -> Fixture {
    let db = Arc::new(Database::open_in_memory().unwrap());
    let storage = Arc::new(SqliteStorage::new(Arc::clone(&db)));
    let fetcher = Arc::new(ScriptedFetcher::new());
    let manifest = manifest
      .iter()
      .map(|p| Url::parse(&format!("https://app.example.com{}", p)).unwrap())
      .collect();
    let lifecycle = Lifecycle::new(
      Arc::clone(&storage),
      Arc::clone(&fetcher),
      db,
      "receipts",
      manifest,
    );
    Fixture {
      lifecycle,
      storage,
      fetcher,
    }
  }

  #[tokio::test]
  async fn test_provision_survives_namespace_open_failure() {
    let db = Arc::new(Database::open_in_memory().unwrap());
    let storage = Arc::new(FaultyStorage::new(Arc::clone(&db)));
    storage.fail_opens(true);
    let fetcher = Arc::new(ScriptedFetcher::new());
    fetcher.respond_ok("https://app.example.com/", "<html>");
    let lifecycle = Lifecycle::new(
      Arc::clone(&storage),
      Arc::clone(&fetcher),
      Arc::clone(&db),
      "receipts",
      vec![Url::parse("https://app.example.com/").unwrap()],
    );

    let report = lifecycle.provision(1).await.unwrap();
    assert_eq!(report.cached.len(), 1);
    assert!(report.failed.is_empty());
    assert_eq!(lifecycle.phase(1).unwrap(), Phase::Waiting);
    let reader = SqliteStorage::new(db);
    assert_eq!(reader.entry_count("receipts-static-v1").unwrap(), 1);
  }

  #[test]
  fn test_namespace_names() {
    let ns = Namespaces::for_generation("receipts", 7);
    assert_eq!(ns.static_assets.name, "receipts-static-v7");
    assert_eq!(ns.dynamic.name, "receipts-dynamic-v7");
    assert!(ns.contains("receipts-dynamic-v7"));
    assert!(!ns.contains("receipts-dynamic-v6"));
  }

  #[tokio::test]
  async fn test_provision_is_best_effort() {
    let f = fixture(&["/", "/app.js", "/missing.css", "/down.png"]);
    f.fetcher.respond_ok("https://app.example.com/", "<html>");
    f.fetcher.respond_ok("https://app.example.com/app.js", "js");
    f.fetcher
      .respond("https://app.example.com/missing.css", Response::new(StatusCode::NOT_FOUND, ""));
    f.fetcher.fail("https://app.example.com/down.png");

    let report = f.lifecycle.provision(1).await.unwrap();
    assert_eq!(report.cached.len(), 2);
    assert_eq!(report.failed.len(), 2);
    assert_eq!(report.phase, Phase::Waiting);
    assert_eq!(f.storage.entry_count("receipts-static-v1").unwrap(), 2);
    assert_eq!(f.lifecycle.phase(1).unwrap(), Phase::Waiting);
  }

  #[tokio::test]
  async fn test_activate_evicts_previous_generation() {
    let f = fixture(&["/"]);
    f.fetcher.respond_ok("https://app.example.com/", "v1");
    f.lifecycle.provision(1).await.unwrap();
    f.lifecycle.activate(1).unwrap();

    let old = f.lifecycle.namespaces(1);
    let request = Request::get(Url::parse("https://app.example.com/api/me").unwrap());
    let response = Response::new(StatusCode::OK, "me");
    f.storage
      .put(&old.dynamic, &CacheEntry::snapshot(&request, &response))
      .unwrap();
    // Namespace from some unrelated older deploy
    f.storage
      .open_namespace(&Namespace::new("receipts-images-v0", 0))
      .unwrap();

    f.fetcher.respond_ok("https://app.example.com/", "v2");
    f.lifecycle.provision(2).await.unwrap();
    assert_eq!(f.lifecycle.phase(2).unwrap(), Phase::Waiting);
    // Old generation keeps serving until activation
    assert_eq!(f.storage.entry_count(&old.dynamic.name).unwrap(), 1);

    let report = f.lifecycle.activate(2).unwrap();
    assert_eq!(report.deleted.len(), 3);
    assert!(report.errors.is_empty());

    let names: Vec<String> = f
      .storage
      .namespaces()
      .unwrap()
      .into_iter()
      .map(|n| n.name)
      .collect();
    assert_eq!(names, vec!["receipts-dynamic-v2", "receipts-static-v2"]);
    assert_eq!(f.storage.entry_count("receipts-static-v2").unwrap(), 1);
    assert_eq!(f.lifecycle.phase(2).unwrap(), Phase::Active);
    assert_eq!(f.lifecycle.phase(1).unwrap(), Phase::Idle);
  }

  #[tokio::test]
  async fn test_skip_waiting_before_install_activates_after_provision() {
    let f = fixture(&["/"]);
    f.fetcher.respond_ok("https://app.example.com/", "v1");

    assert!(f.lifecycle.skip_waiting(1).unwrap().is_none());
    let report = f.lifecycle.provision(1).await.unwrap();
    assert_eq!(report.phase, Phase::Active);
    assert!(report.activation.is_some());
    assert_eq!(f.lifecycle.active_generation().unwrap(), Some(1));
  }

  #[tokio::test]
  async fn test_skip_waiting_after_install_activates_now() {
    let f = fixture(&["/"]);
    f.fetcher.respond_ok("https://app.example.com/", "v1");
    f.lifecycle.provision(1).await.unwrap();

    assert!(f.lifecycle.skip_waiting(1).unwrap().is_some());
    assert_eq!(f.lifecycle.phase(1).unwrap(), Phase::Active);
  }

  #[test]
  fn test_activate_requires_provisioning() {
    let f = fixture(&["/"]);
    assert!(f.lifecycle.activate(3).is_err());
  }
}
