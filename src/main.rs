mod app;
mod cache;
mod config;
mod db;
mod host;
mod lifecycle;
mod net;
mod notify;
mod queue;
mod router;
mod worker;

use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use app::{App, FetchOptions};

const LOG_ENV: &str = "OFFGRID_LOG";

#[derive(Parser, Debug)]
#[command(name = "offgrid")]
#[command(about = "Offline resilience layer for the receipts client")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/offgrid/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Also log to stderr
  #[arg(short, long)]
  verbose: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Provision the configured generation
  Install {
    /// Take over immediately once provisioned
    #[arg(long)]
    take_over: bool,
  },
  /// Promote the configured generation and evict older ones
  Activate,
  /// Send a request through the offline layer
  Fetch {
    /// Absolute URL or path relative to the origin
    url: String,
    #[arg(short = 'X', long)]
    method: Option<String>,
    /// JSON request body (implies POST)
    #[arg(short, long)]
    data: Option<String>,
    /// Treat as a page navigation
    #[arg(long)]
    navigate: bool,
    /// Treat as an image request
    #[arg(long)]
    image: bool,
  },
  /// Replay queued writes now
  Drain,
  /// Inspect or edit the write queue
  Queue {
    #[command(subcommand)]
    action: QueueAction,
  },
  /// Render a push payload as a notification
  Push {
    /// Raw payload (JSON)
    payload: Option<String>,
    /// Also tap the notification
    #[arg(long)]
    click: bool,
  },
  /// Show generation, namespaces and queue state
  Status,
  /// Run the periodic and connectivity drain triggers until interrupted
  Watch,
}

#[derive(Subcommand, Debug)]
enum QueueAction {
  List,
  /// Drop one mutation, or all of them
  Purge { id: Option<String> },
  /// Move failed mutations back to pending
  Retry,
}

fn init_tracing(verbose: bool) -> Result<WorkerGuard> {
  let log_dir = dirs::data_dir()
    .ok_or_else(|| eyre!("Could not determine data directory"))?
    .join("offgrid");
  std::fs::create_dir_all(&log_dir)
    .map_err(|e| eyre!("Failed to create log directory {}: {}", log_dir.display(), e))?;

  let (writer, guard) =
    tracing_appender::non_blocking(tracing_appender::rolling::daily(&log_dir, "offgrid.log"));
  let filter = || EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("offgrid=info"));

  let stderr = verbose.then(|| {
    fmt::layer()
      .with_writer(std::io::stderr)
      .with_filter(filter())
  });

  tracing_subscriber::registry()
    .with(
      fmt::layer()
        .with_ansi(false)
        .with_writer(writer)
        .with_filter(filter()),
    )
    .with(stderr)
    .try_init()
    .map_err(|e| eyre!("Failed to initialize logging: {}", e))?;

  Ok(guard)
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let _guard = init_tracing(args.verbose)?;

  // Load configuration
  let config = config::Config::load(args.config.as_deref())?;
  let app = App::new(config)?;

  match args.command {
    Command::Install { take_over } => app.install(take_over).await?,
    Command::Activate => app.activate().await?,
    Command::Fetch {
      url,
      method,
      data,
      navigate,
      image,
    } => {
      app
        .fetch(
          &url,
          FetchOptions {
            method,
            data,
            navigate,
            image,
          },
        )
        .await?
    }
    Command::Drain => app.drain().await?,
    Command::Queue { action } => match action {
      QueueAction::List => app.queue_list()?,
      QueueAction::Purge { id } => app.queue_purge(id.as_deref())?,
      QueueAction::Retry => app.queue_retry()?,
    },
    Command::Push { payload, click } => app.push(payload, click).await?,
    Command::Status => app.status()?,
    Command::Watch => app.watch().await?,
  }

  Ok(())
}
