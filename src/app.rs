use bytes::Bytes;
use color_eyre::{eyre::eyre, Result};
use reqwest::Method;
use std::sync::Arc;
use tracing::info;

use crate::cache::{CacheLayer, CacheResult, CacheStorage, SqliteStorage};
use crate::config::Config;
use crate::db::Database;
use crate::host::{ConsoleShell, Host};
use crate::lifecycle::{ActivationReport, ProvisionReport};
use crate::net::{Destination, Fetcher, HttpFetcher, Request, Response};
use crate::queue::{DrainReport, MutationState};
use crate::worker::{Event, Outcome, Worker};

const MANUAL_TAG: &str = "manual";

/// How a `fetch` command shapes its request.
#[derive(Debug, Default)]
pub struct FetchOptions {
  pub method: Option<String>,
  pub data: Option<String>,
  pub navigate: bool,
  pub image: bool,
}

/// Main application state
pub struct App {
  config: Config,
  storage: Arc<SqliteStorage>,
  fetcher: Arc<HttpFetcher>,
  host: Host<SqliteStorage, HttpFetcher, ConsoleShell>,
}

impl App {
  pub fn new(config: Config) -> Result<Self> {
    let db = Arc::new(Database::open(config.database.as_deref())?);
    let storage = Arc::new(SqliteStorage::new(Arc::clone(&db)));
    let fetcher = Arc::new(HttpFetcher::new(&config)?);
    let worker = Worker::new(&config, db, Arc::clone(&storage), Arc::clone(&fetcher))?;
    let health_url = config.resolve(&config.timing.health_path)?;
    let host = Host::new(
      worker,
      CacheLayer::new(Arc::clone(&storage)),
      Arc::clone(&fetcher),
      ConsoleShell,
      health_url,
    );

    Ok(Self {
      config,
      storage,
      fetcher,
      host,
    })
  }

  pub async fn install(&self, take_over: bool) -> Result<()> {
    if take_over {
      if let Outcome::Activated(Some(report)) = self.host.dispatch(Event::SkipWaiting).await? {
        print_activation(&report);
        return Ok(());
      }
    }

    match self.host.dispatch(Event::Install).await? {
      Outcome::Provisioned(report) => print_provision(&report),
      other => return Err(eyre!("Unexpected outcome for install: {:?}", other)),
    }
    Ok(())
  }

  pub async fn activate(&self) -> Result<()> {
    match self.host.dispatch(Event::Activate).await? {
      Outcome::Activated(Some(report)) => print_activation(&report),
      Outcome::Activated(None) => println!("nothing to activate"),
      other => return Err(eyre!("Unexpected outcome for activate: {:?}", other)),
    }
    Ok(())
  }

  pub async fn fetch(&self, target: &str, options: FetchOptions) -> Result<()> {
    let request = self.build_request(target, options)?;

    match self.host.dispatch(Event::Fetch(request.clone())).await? {
      Outcome::Responded { class, response } => {
        print_response(class.as_str(), &response);
      }
      Outcome::Bypassed => {
        info!(url = %request.url, "request not intercepted, fetching directly");
        let response = self
          .fetcher
          .fetch(&request)
          .await
          .map_err(|e| eyre!("Failed to fetch {}: {}", request.url, e))?;
        print_response("bypass", &CacheResult::from_network(response));
      }
      other => return Err(eyre!("Unexpected outcome for fetch: {:?}", other)),
    }
    Ok(())
  }

  fn build_request(&self, target: &str, options: FetchOptions) -> Result<Request> {
    let url = if target.contains("://") {
      url::Url::parse(target).map_err(|e| eyre!("Invalid URL {}: {}", target, e))?
    } else {
      self.config.resolve(target)?
    };

    let method = match options.method.as_deref() {
      Some(m) => Method::from_bytes(m.to_uppercase().as_bytes())
        .map_err(|e| eyre!("Invalid method {}: {}", m, e))?,
      None if options.data.is_some() => Method::POST,
      None => Method::GET,
    };

    let mut request = Request::new(method, url);
    if let Some(data) = options.data {
      request = request.with_body("application/json", data);
    }
    if options.navigate {
      request = request.navigate();
    }
    if options.image {
      request = request.with_destination(Destination::Image);
    }
    Ok(request)
  }

  pub async fn drain(&self) -> Result<()> {
    let outcome = self
      .host
      .dispatch(Event::Sync {
        tag: MANUAL_TAG.to_string(),
      })
      .await?;
    match outcome {
      Outcome::Drained(report) => print_drain(&report),
      other => return Err(eyre!("Unexpected outcome for drain: {:?}", other)),
    }
    Ok(())
  }

  pub fn queue_list(&self) -> Result<()> {
    let mutations = self.host.worker().queue().list()?;
    if mutations.is_empty() {
      println!("queue is empty");
      return Ok(());
    }

    println!(
      "{:<36}  {:<7}  {:>8}  {:<20}  {:<6}  ENDPOINT",
      "ID", "STATE", "ATTEMPTS", "CREATED", "METHOD"
    );
    for m in mutations {
      println!(
        "{:<36}  {:<7}  {:>8}  {:<20}  {:<6}  {}",
        m.id,
        m.state.as_str(),
        m.attempts,
        m.created_at.format("%Y-%m-%d %H:%M:%S"),
        m.method,
        m.endpoint
      );
      if let Some(error) = &m.last_error {
        println!("    last error: {}", error);
      }
    }
    Ok(())
  }

  pub fn queue_purge(&self, id: Option<&str>) -> Result<()> {
    let queue = self.host.worker().queue();
    match id {
      Some(id) => {
        if !queue.purge(id)? {
          return Err(eyre!("No queued mutation with id {}", id));
        }
        println!("purged {}", id);
      }
      None => {
        let count = queue.purge_all()?;
        println!("purged {} mutation(s)", count);
      }
    }
    Ok(())
  }

  pub fn queue_retry(&self) -> Result<()> {
    let count = self.host.worker().queue().retry_failed()?;
    println!("{} failed mutation(s) moved back to pending", count);
    Ok(())
  }

  pub async fn push(&self, payload: Option<String>, click: bool) -> Result<()> {
    let raw = payload.map(Bytes::from).unwrap_or_default();
    let notification = match self.host.dispatch(Event::Push(raw)).await? {
      Outcome::Notified(notification) => notification,
      other => return Err(eyre!("Unexpected outcome for push: {:?}", other)),
    };

    if click {
      self.host.click(notification).await?;
    }
    Ok(())
  }

  pub fn status(&self) -> Result<()> {
    let worker = self.host.worker();
    let generation = worker.generation();
    let lifecycle = worker.lifecycle();

    println!("app:         {}", self.config.app);
    println!("origin:      {}", self.config.origin);
    println!(
      "generation:  {} ({})",
      generation,
      lifecycle.phase(generation)?.as_str()
    );
    match lifecycle.active_generation()? {
      Some(active) => println!("active:      {}", active),
      None => println!("active:      none"),
    }

    println!("namespaces:");
    for namespace in self.storage.namespaces()? {
      println!(
        "  {:<32} {:>6} entries",
        namespace.name,
        self.storage.entry_count(&namespace.name)?
      );
    }

    let (pending, failed) = worker.queue().counts()?;
    println!("queue:       {} pending, {} failed", pending, failed);
    if failed > 0 {
      println!(
        "             failed mutations gave up after {} attempts; `queue retry` re-arms them",
        self.config.queue.max_replay_attempts
      );
    }
    Ok(())
  }

  pub async fn watch(&self) -> Result<()> {
    let shutdown = async {
      if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
      }
    };
    self
      .host
      .watch(
        self.config.drain_interval(),
        self.config.health_interval(),
        shutdown,
      )
      .await
  }
}

fn print_provision(report: &ProvisionReport) {
  println!(
    "generation {}: {} asset(s) cached, {} failed, phase {}",
    report.generation,
    report.cached.len(),
    report.failed.len(),
    report.phase.as_str()
  );
  for (url, error) in &report.failed {
    println!("  failed {}: {}", url, error);
  }
  if let Some(activation) = &report.activation {
    print_activation(activation);
  }
}

fn print_activation(report: &ActivationReport) {
  println!(
    "generation {} active, {} namespace(s) evicted",
    report.generation,
    report.deleted.len()
  );
  for name in &report.deleted {
    println!("  evicted {}", name);
  }
  for error in &report.errors {
    println!("  cleanup error: {}", error);
  }
}

fn print_drain(report: &DrainReport) {
  if report.skipped {
    println!("a drain is already in progress");
    return;
  }
  println!(
    "replayed {}, retrying {}, failed {}",
    report.replayed.len(),
    report.retrying.len(),
    report.failed.len()
  );
  for id in &report.failed {
    println!("  {} parked as {}", id, MutationState::Failed.as_str());
  }
}

fn print_response(class: &str, result: &CacheResult<Response>) {
  let response = &result.data;
  println!(
    "{} {} [{}, {}]",
    response.status.as_u16(),
    response.status.canonical_reason().unwrap_or(""),
    class,
    result.source.as_str()
  );
  if let Some(cached_at) = result.cached_at {
    println!("cached-at: {}", cached_at.to_rfc3339());
  }
  for (name, value) in &response.headers {
    println!("{}: {}", name, String::from_utf8_lossy(value.as_bytes()));
  }
  println!();
  println!("{}", String::from_utf8_lossy(&response.body));
}
