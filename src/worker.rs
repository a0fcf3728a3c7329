//! Event dispatch for the offline layer.
//!
//! `Worker::handle` maps one event to an outcome plus the effects that still
//! have to happen. It performs no cache writes or notification I/O itself; the
//! host settles the effects, and the invocation is not done until it has.

use bytes::Bytes;
use color_eyre::Result;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::cache::{CacheEntry, CacheLayer, CacheResult, CacheStorage, Namespace};
use crate::config::Config;
use crate::db::Database;
use crate::lifecycle::{ActivationReport, Lifecycle, ProvisionReport};
use crate::net::{Fetcher, Request, Response};
use crate::notify::{ClickOutcome, ClientWindow, Dispatcher, Notification};
use crate::queue::{DrainFlag, DrainReport, MutationStore, Replayer, RetryPolicy};
use crate::router::{RequestClass, RoutePolicy, Router};

pub const CONNECTIVITY_TAG: &str = "connectivity-restored";
pub const PERIODIC_TAG: &str = "periodic-drain";

#[derive(Debug)]
pub enum Event {
  /// Provision the configured generation
  Install,
  /// Promote the configured generation
  Activate,
  /// Take over without waiting
  SkipWaiting,
  Fetch(Request),
  /// One-shot trigger, e.g. connectivity restored
  Sync { tag: String },
  /// Recurring trigger
  PeriodicSync { tag: String },
  Push(Bytes),
  NotificationClick {
    notification: Notification,
    windows: Vec<ClientWindow>,
  },
}

impl Event {
  pub fn name(&self) -> &'static str {
    match self {
      Self::Install => "install",
      Self::Activate => "activate",
      Self::SkipWaiting => "skip-waiting",
      Self::Fetch(_) => "fetch",
      Self::Sync { .. } => "sync",
      Self::PeriodicSync { .. } => "periodic-sync",
      Self::Push(_) => "push",
      Self::NotificationClick { .. } => "notification-click",
    }
  }
}

/// Work a handler leaves behind for the host to finish.
#[derive(Debug, Clone)]
pub enum Effect {
  CachePut {
    namespace: Namespace,
    entry: CacheEntry,
  },
  ShowNotification(Notification),
  CloseNotification {
    tag: Option<String>,
  },
  FocusWindow {
    client: String,
    url: String,
  },
  OpenWindow {
    url: String,
  },
}

#[derive(Debug)]
pub enum Outcome {
  Provisioned(ProvisionReport),
  /// `None` when a take-over request had nothing to promote yet
  Activated(Option<ActivationReport>),
  Responded {
    class: RequestClass,
    response: CacheResult<Response>,
  },
  /// The layer did not intercept; the request goes straight to the network
  Bypassed,
  Drained(DrainReport),
  Notified(Notification),
  Clicked(ClickOutcome),
}

#[derive(Debug)]
pub struct Handled {
  pub outcome: Outcome,
  pub effects: Vec<Effect>,
}

impl Handled {
  fn done(outcome: Outcome) -> Self {
    Self {
      outcome,
      effects: Vec::new(),
    }
  }
}

/// In-memory state shared by concurrently running handlers.
///
/// Only valid for one process lifetime. Anything that has to outlive the
/// process lives in the database instead.
#[derive(Debug, Default)]
pub struct WorkerState {
  drain: DrainFlag,
}

impl WorkerState {
  pub fn new() -> Self {
    Self::default()
  }

  /// Back to the state of a freshly started process.
  #[allow(dead_code)]
  pub fn reset(&self) {
    self.drain.reset();
  }

  pub fn drain_flag(&self) -> &DrainFlag {
    &self.drain
  }
}

pub struct Worker<S: CacheStorage, N: Fetcher> {
  generation: u64,
  lifecycle: Lifecycle<S, N>,
  router: Router<S, N>,
  replayer: Replayer<N>,
  dispatcher: Dispatcher,
  state: WorkerState,
}

impl<S: CacheStorage, N: Fetcher> Worker<S, N> {
  pub fn new(config: &Config, db: Arc<Database>, storage: Arc<S>, fetcher: Arc<N>) -> Result<Self> {
    let manifest = config
      .manifest
      .iter()
      .map(|path| config.resolve(path))
      .collect::<Result<Vec<_>>>()?;
    let lifecycle = Lifecycle::new(
      Arc::clone(&storage),
      Arc::clone(&fetcher),
      Arc::clone(&db),
      config.app.clone(),
      manifest,
    );

    let queue = Arc::new(MutationStore::new(db));
    let router = Router::new(
      CacheLayer::new(storage).with_stale_time(config.stale_after()),
      Arc::clone(&fetcher),
      Arc::clone(&queue),
      RoutePolicy::from_config(config)?,
    );
    let replayer = Replayer::new(
      queue,
      fetcher,
      RetryPolicy::new(config.queue.max_replay_attempts),
    );
    let dispatcher = Dispatcher::new(config.notifications.clone(), config.origin.clone());

    Ok(Self {
      generation: config.generation,
      lifecycle,
      router,
      replayer,
      dispatcher,
      state: WorkerState::new(),
    })
  }

  pub fn generation(&self) -> u64 {
    self.generation
  }

  pub fn lifecycle(&self) -> &Lifecycle<S, N> {
    &self.lifecycle
  }

  pub fn queue(&self) -> &Arc<MutationStore> {
    self.replayer.store()
  }

  #[allow(dead_code)]
  pub fn state(&self) -> &WorkerState {
    &self.state
  }

  pub async fn handle(&self, event: Event) -> Result<Handled> {
    debug!(event = event.name(), generation = self.generation, "handling event");

    match event {
      Event::Install => {
        let report = self.lifecycle.provision(self.generation).await?;
        Ok(Handled::done(Outcome::Provisioned(report)))
      }
      Event::Activate => {
        let report = self.lifecycle.activate(self.generation)?;
        Ok(Handled::done(Outcome::Activated(Some(report))))
      }
      Event::SkipWaiting => {
        let report = self.lifecycle.skip_waiting(self.generation)?;
        Ok(Handled::done(Outcome::Activated(report)))
      }
      Event::Fetch(request) => Ok(self.on_fetch(request).await),
      Event::Sync { tag } | Event::PeriodicSync { tag } => {
        debug!(tag = %tag, "drain triggered");
        let report = self.replayer.drain(self.state.drain_flag()).await?;
        Ok(Handled::done(Outcome::Drained(report)))
      }
      Event::Push(payload) => {
        let notification = self.dispatcher.on_push(&payload);
        Ok(Handled {
          effects: vec![Effect::ShowNotification(notification.clone())],
          outcome: Outcome::Notified(notification),
        })
      }
      Event::NotificationClick {
        notification,
        windows,
      } => {
        let click = self
          .dispatcher
          .on_notification_click(&notification, &windows);
        let navigate = match &click {
          ClickOutcome::Focused { client, url } => Effect::FocusWindow {
            client: client.clone(),
            url: url.clone(),
          },
          ClickOutcome::Opened { url } => Effect::OpenWindow { url: url.clone() },
        };
        Ok(Handled {
          effects: vec![
            Effect::CloseNotification {
              tag: notification.tag.clone(),
            },
            navigate,
          ],
          outcome: Outcome::Clicked(click),
        })
      }
    }
  }

  async fn on_fetch(&self, request: Request) -> Handled {
    // A waiting generation does not serve; the active one keeps doing so until
    // it is replaced. With nothing active, traffic is not ours to handle.
    let serving = match self.lifecycle.active_generation() {
      Ok(Some(generation)) => generation,
      Ok(None) => {
        debug!(url = %request.url, "no active generation, bypassing");
        return Handled::done(Outcome::Bypassed);
      }
      Err(e) => {
        warn!(error = %e, "failed to read lifecycle state, bypassing");
        return Handled::done(Outcome::Bypassed);
      }
    };
    if serving != self.generation {
      debug!(serving, installed = self.generation, "previous generation still serving");
    }

    let namespaces = self.lifecycle.namespaces(serving);
    let routed = self.router.route(request, &namespaces).await;
    match routed.response {
      Some(response) => Handled {
        outcome: Outcome::Responded {
          class: routed.class,
          response,
        },
        effects: routed.effects,
      },
      None => Handled::done(Outcome::Bypassed),
    }
  }
}
