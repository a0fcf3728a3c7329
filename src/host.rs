//! Host adapter: delivers events to the worker and settles their effects.

use color_eyre::{eyre::eyre, Result};
use reqwest::Method;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::{CacheLayer, CacheStorage};
use crate::net::{Fetcher, Request};
use crate::notify::{ClientWindow, Notification};
use crate::worker::{Effect, Event, Outcome, Worker, CONNECTIVITY_TAG, PERIODIC_TAG};

/// Notification surface and browsing contexts of the host environment.
pub trait Shell: Send + Sync {
  fn show(&self, notification: &Notification) -> Result<()>;
  fn close(&self, tag: Option<&str>) -> Result<()>;
  fn focus(&self, client: &str, url: &str) -> Result<()>;
  fn open(&self, url: &str) -> Result<()>;
  fn windows(&self) -> Vec<ClientWindow>;
}

/// Shell for a terminal: notifications and navigation are printed.
pub struct ConsoleShell;

impl Shell for ConsoleShell {
  fn show(&self, notification: &Notification) -> Result<()> {
    let json = serde_json::to_string_pretty(notification)
      .map_err(|e| eyre!("Failed to render notification: {}", e))?;
    println!("{}", json);
    Ok(())
  }

  fn close(&self, tag: Option<&str>) -> Result<()> {
    debug!(tag, "notification closed");
    Ok(())
  }

  fn focus(&self, client: &str, url: &str) -> Result<()> {
    println!("focus {} -> {}", client, url);
    Ok(())
  }

  fn open(&self, url: &str) -> Result<()> {
    println!("open {}", url);
    Ok(())
  }

  fn windows(&self) -> Vec<ClientWindow> {
    Vec::new()
  }
}

pub struct Host<S: CacheStorage, N: Fetcher, H: Shell> {
  worker: Worker<S, N>,
  cache: CacheLayer<S>,
  fetcher: Arc<N>,
  shell: H,
  health_url: Url,
}

impl<S: CacheStorage, N: Fetcher, H: Shell> Host<S, N, H> {
  pub fn new(worker: Worker<S, N>, cache: CacheLayer<S>, fetcher: Arc<N>, shell: H, health_url: Url) -> Self {
    Self {
      worker,
      cache,
      fetcher,
      shell,
      health_url,
    }
  }

  pub fn worker(&self) -> &Worker<S, N> {
    &self.worker
  }

  /// Handle one event and wait until every effect it produced has settled.
  pub async fn dispatch(&self, event: Event) -> Result<Outcome> {
    let handled = self.worker.handle(event).await?;
    self.settle(handled.effects);
    Ok(handled.outcome)
  }

  /// Deliver a tap on a notification, with the currently open windows.
  pub async fn click(&self, notification: Notification) -> Result<Outcome> {
    let windows = self.shell.windows();
    self
      .dispatch(Event::NotificationClick {
        notification,
        windows,
      })
      .await
  }

  /// Run effects to completion, in order. Failures are logged and dropped.
  ///
  /// Cache writes go to SQLite inline, the same way the router reads it.
  /// Returns how many effects failed.
  pub fn settle(&self, effects: Vec<Effect>) -> usize {
    let mut failed = 0;

    for effect in effects {
      let result = match effect {
        Effect::CachePut { namespace, entry } => {
          // The layer has already logged the failure
          if !self.cache.store(&namespace, &entry) {
            failed += 1;
          }
          continue;
        }
        Effect::ShowNotification(notification) => self.shell.show(&notification),
        Effect::CloseNotification { tag } => self.shell.close(tag.as_deref()),
        Effect::FocusWindow { client, url } => self.shell.focus(&client, &url),
        Effect::OpenWindow { url } => self.shell.open(&url),
      };
      if let Err(e) = result {
        warn!(error = %e, "effect failed");
        failed += 1;
      }
    }

    failed
  }

  async fn check_online(&self) -> bool {
    let request = Request::new(Method::HEAD, self.health_url.clone());
    self.fetcher.fetch(&request).await.is_ok()
  }

  /// Drive the drain triggers until `shutdown` resolves.
  ///
  /// The periodic trigger fires every `drain_interval`. The connectivity check
  /// runs every `health_interval` and fires a one-shot sync when the network
  /// comes back.
  pub async fn watch(
    &self,
    drain_interval: Duration,
    health_interval: Duration,
    shutdown: impl Future<Output = ()>,
  ) -> Result<()> {
    let mut drain_tick = tokio::time::interval(drain_interval);
    let mut health_tick = tokio::time::interval(health_interval);
    let mut online: Option<bool> = None;
    tokio::pin!(shutdown);

    info!(
      drain_secs = drain_interval.as_secs(),
      health_secs = health_interval.as_secs(),
      "watching for drain triggers"
    );

    loop {
      tokio::select! {
        _ = &mut shutdown => {
          info!("shutting down");
          break;
        }
        _ = drain_tick.tick() => {
          self.trigger(Event::PeriodicSync { tag: PERIODIC_TAG.to_string() }).await;
        }
        _ = health_tick.tick() => {
          let now_online = self.check_online().await;
          match (online, now_online) {
            (Some(false), true) => {
              info!("connectivity restored");
              self.trigger(Event::Sync { tag: CONNECTIVITY_TAG.to_string() }).await;
            }
            (Some(true) | None, false) => info!("network unreachable"),
            _ => {}
          }
          online = Some(now_online);
        }
      }
    }

    Ok(())
  }

  async fn trigger(&self, event: Event) {
    let name = event.name();
    match self.dispatch(event).await {
      Ok(Outcome::Drained(report)) if !report.skipped => {
        debug!(
          event = name,
          replayed = report.replayed.len(),
          retrying = report.retrying.len(),
          failed = report.failed.len(),
          "drain pass done"
        );
      }
      Ok(_) => {}
      Err(e) => warn!(event = name, error = %e, "drain failed"),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::testing::FaultyStorage;
  use crate::cache::{CacheSource, SqliteStorage};
  use crate::config::Config;
  use crate::db::Database;
  use crate::net::testing::ScriptedFetcher;
  use crate::net::Response;
  use crate::router::RequestClass;
  use bytes::Bytes;
  use reqwest::StatusCode;
  use std::sync::Mutex;

  #[derive(Default)]
  struct RecordingShell {
    log: Mutex<Vec<String>>,
    windows: Vec<ClientWindow>,
  }

  impl Shell for RecordingShell {
    fn show(&self, n: &Notification) -> Result<()> {
      self.log.lock().unwrap().push(format!("show {}", n.title));
      Ok(())
    }
    fn close(&self, tag: Option<&str>) -> Result<()> {
      self.log.lock().unwrap().push(format!("close {}", tag.unwrap_or("-")));
      Ok(())
    }
    fn focus(&self, client: &str, url: &str) -> Result<()> {
      self.log.lock().unwrap().push(format!("focus {} {}", client, url));
      Ok(())
    }
    fn open(&self, url: &str) -> Result<()> {
      self.log.lock().unwrap().push(format!("open {}", url));
      Ok(())
    }
    fn windows(&self) -> Vec<ClientWindow> {
      self.windows.clone()
    }
  }

  type TestHost = Host<SqliteStorage, ScriptedFetcher, RecordingShell>;

  fn host() -> (TestHost, Arc<ScriptedFetcher>, Arc<SqliteStorage>) {
    let config = Config::parse("origin: https://app.example.com\ngeneration: 1\nmanifest: [\"/\"]\n").unwrap();
    let db = Arc::new(Database::open_in_memory().unwrap());
    let storage = Arc::new(SqliteStorage::new(Arc::clone(&db)));
    let fetcher = Arc::new(ScriptedFetcher::new());
    fetcher.respond_ok("https://app.example.com/", "<root>");
    let worker = Worker::new(&config, db, Arc::clone(&storage), Arc::clone(&fetcher)).unwrap();
    let host = Host::new(
      worker,
      CacheLayer::new(Arc::clone(&storage)),
      Arc::clone(&fetcher),
      RecordingShell::default(),
      config.resolve(&config.timing.health_path).unwrap(),
    );
    (host, fetcher, storage)
  }

  #[tokio::test]
  async fn test_dispatch_settles_cache_writes() {
    let (host, fetcher, storage) = host();
    host.dispatch(Event::Install).await.unwrap();
    host.dispatch(Event::Activate).await.unwrap();
    fetcher.respond_ok("https://app.example.com/api/me", r#"{"name":"Ada"}"#);

    let request = Request::get(Url::parse("https://app.example.com/api/me").unwrap());
    let outcome = host.dispatch(Event::Fetch(request)).await.unwrap();
    assert!(matches!(outcome, Outcome::Responded { class: RequestClass::Api, .. }));

    // The write is durable by the time dispatch returns
    assert_eq!(storage.entry_count("receipts-dynamic-v1").unwrap(), 1);
  }

  #[tokio::test]
  async fn test_failed_cache_write_still_delivers_response() {
    let config = Config::parse("origin: https://app.example.com\ngeneration: 1\nmanifest: []\n").unwrap();
    let db = Arc::new(Database::open_in_memory().unwrap());
    let storage = Arc::new(FaultyStorage::new(Arc::clone(&db)));
    let fetcher = Arc::new(ScriptedFetcher::new());
    let worker = Worker::new(&config, db, Arc::clone(&storage), Arc::clone(&fetcher)).unwrap();
    let host = Host::new(
      worker,
      CacheLayer::new(Arc::clone(&storage)),
      Arc::clone(&fetcher),
      RecordingShell::default(),
      config.resolve(&config.timing.health_path).unwrap(),
    );
    host.dispatch(Event::Install).await.unwrap();
    host.dispatch(Event::Activate).await.unwrap();

    storage.fail_puts(true);
    fetcher.respond_ok("https://app.example.com/api/me", r#"{"name":"Ada"}"#);
    let request = Request::get(Url::parse("https://app.example.com/api/me").unwrap());

    let handled = host.worker().handle(Event::Fetch(request.clone())).await.unwrap();
    assert_eq!(handled.effects.len(), 1);
    assert_eq!(host.settle(handled.effects), 1);

    match host.dispatch(Event::Fetch(request)).await.unwrap() {
      Outcome::Responded { response, .. } => {
        assert_eq!(response.source, CacheSource::Network);
        assert_eq!(response.data.body.as_ref(), br#"{"name":"Ada"}"#);
      }
      other => panic!("unexpected outcome {:?}", other),
    }
    assert_eq!(storage.entry_count("receipts-dynamic-v1").unwrap(), 0);
  }

  #[tokio::test]
  async fn test_push_and_click_reach_the_shell() {
    let (host, _, _) = host();
    let outcome = host
      .dispatch(Event::Push(Bytes::from_static(br#"{"title":"Scanned","tag":"t1"}"#)))
      .await
      .unwrap();
    let notification = match outcome {
      Outcome::Notified(n) => n,
      other => panic!("unexpected outcome {:?}", other),
    };

    host.click(notification).await.unwrap();
    let log = host.shell.log.lock().unwrap().clone();
    assert_eq!(
      log,
      vec!["show Scanned", "close t1", "open https://app.example.com/"]
    );
  }

  #[tokio::test]
  async fn test_watch_drains_when_connectivity_returns() {
    let (host, fetcher, _) = host();
    host.dispatch(Event::Install).await.unwrap();
    host.dispatch(Event::Activate).await.unwrap();

    fetcher.set_offline(true);
    let post = Request::new(Method::POST, Url::parse("https://app.example.com/api/receipts").unwrap())
      .with_body("application/json", "{}");
    host.dispatch(Event::Fetch(post)).await.unwrap();
    fetcher.respond("https://app.example.com/api/receipts", Response::new(StatusCode::CREATED, "{}"));

    let reconnect = async {
      tokio::time::sleep(Duration::from_millis(40)).await;
      fetcher.set_offline(false);
    };
    let run = host.watch(
      Duration::from_secs(3600),
      Duration::from_millis(10),
      tokio::time::sleep(Duration::from_millis(150)),
    );
    let (result, _) = tokio::join!(run, reconnect);
    result.unwrap();

    assert!(host.worker().queue().list().unwrap().is_empty());
  }
}
