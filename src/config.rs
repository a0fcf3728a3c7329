use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  /// Application name, used as the cache namespace prefix
  #[serde(default = "default_app")]
  pub app: String,
  /// Origin the client talks to (e.g. https://app.example.com)
  pub origin: Url,
  /// Current build generation
  pub generation: u64,
  #[serde(default)]
  pub routes: RoutesConfig,
  /// Asset paths fetched into the static namespace at install time
  #[serde(default = "default_manifest")]
  pub manifest: Vec<String>,
  #[serde(default)]
  pub timing: TimingConfig,
  #[serde(default)]
  pub queue: QueueConfig,
  #[serde(default)]
  pub notifications: NotificationDefaults,
  /// Database path (defaults to $XDG_DATA_HOME/offgrid/offgrid.db)
  pub database: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RoutesConfig {
  /// Path prefix of API requests (network-first)
  pub api_prefix: String,
  /// Endpoint whose failed POSTs are queued for replay
  pub receipts_endpoint: String,
  /// Document served when a navigation has nothing better cached
  pub root_document: String,
  /// Path extensions treated as images (cache-first)
  pub image_extensions: Vec<String>,
}

impl Default for RoutesConfig {
  fn default() -> Self {
    Self {
      api_prefix: "/api/".to_string(),
      receipts_endpoint: "/api/receipts".to_string(),
      root_document: "/".to_string(),
      image_extensions: ["png", "jpg", "jpeg", "gif", "webp", "svg", "ico", "avif"]
        .iter()
        .map(|s| s.to_string())
        .collect(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
  /// Age after which a cache hit is reported as stale
  pub stale_after_secs: u64,
  /// Upper bound on a single network fetch
  pub fetch_timeout_secs: u64,
  /// Period of the recurring drain trigger
  pub drain_interval_secs: u64,
  /// Period of the connectivity check
  pub health_interval_secs: u64,
  /// Path requested to detect connectivity
  pub health_path: String,
}

impl Default for TimingConfig {
  fn default() -> Self {
    Self {
      stale_after_secs: 300,
      fetch_timeout_secs: 10,
      drain_interval_secs: 300,
      health_interval_secs: 15,
      health_path: "/api/health".to_string(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
  /// Failed replays allowed before a mutation is parked as failed
  pub max_replay_attempts: u32,
}

impl Default for QueueConfig {
  fn default() -> Self {
    Self {
      max_replay_attempts: 5,
    }
  }
}

/// Template push payloads are merged over.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct NotificationDefaults {
  pub title: String,
  pub body: String,
  pub icon: String,
  pub badge: String,
  /// Opened on tap when the payload carries no url
  pub url: String,
}

impl Default for NotificationDefaults {
  fn default() -> Self {
    Self {
      title: "Receipts".to_string(),
      body: "You have a new update".to_string(),
      icon: "/icons/icon-192.png".to_string(),
      badge: "/icons/badge-72.png".to_string(),
      url: "/".to_string(),
    }
  }
}

fn default_app() -> String {
  "receipts".to_string()
}

fn default_manifest() -> Vec<String> {
  ["/", "/index.html", "/manifest.json", "/offline.html", "/icons/icon-192.png"]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./offgrid.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/offgrid/config.yaml
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Err(eyre!(
        "No configuration file found. Create one at ~/.config/offgrid/config.yaml"
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("offgrid.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("offgrid").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn parse(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents).map_err(|e| eyre!("{}", e))?;
    config.validate()?;
    Ok(config)
  }

  fn validate(&self) -> Result<()> {
    if !matches!(self.origin.scheme(), "http" | "https") {
      return Err(eyre!("origin must be an http(s) URL, got {}", self.origin));
    }
    if !self.routes.api_prefix.starts_with('/') {
      return Err(eyre!("routes.api_prefix must start with '/'"));
    }
    if self.queue.max_replay_attempts == 0 {
      return Err(eyre!("queue.max_replay_attempts must be at least 1"));
    }
    Ok(())
  }

  /// Resolve a path against the configured origin.
  pub fn resolve(&self, path: &str) -> Result<Url> {
    self
      .origin
      .join(path)
      .map_err(|e| eyre!("Invalid path {}: {}", path, e))
  }

  pub fn fetch_timeout(&self) -> Duration {
    Duration::from_secs(self.timing.fetch_timeout_secs)
  }

  pub fn stale_after(&self) -> chrono::Duration {
    chrono::Duration::seconds(self.timing.stale_after_secs as i64)
  }

  pub fn drain_interval(&self) -> Duration {
    Duration::from_secs(self.timing.drain_interval_secs)
  }

  pub fn health_interval(&self) -> Duration {
    Duration::from_secs(self.timing.health_interval_secs)
  }
}

#[cfg(test)]
pub(crate) fn test_config() -> Config {
  Config::parse("origin: https://app.example.com\ngeneration: 1\n").unwrap()
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_minimal_config_uses_defaults() {
    let config = test_config();
    assert_eq!(config.app, "receipts");
    assert_eq!(config.routes.api_prefix, "/api/");
    assert_eq!(config.routes.receipts_endpoint, "/api/receipts");
    assert_eq!(config.queue.max_replay_attempts, 5);
    assert_eq!(config.fetch_timeout(), Duration::from_secs(10));
    assert!(config.manifest.contains(&"/".to_string()));
  }

  #[test]
  fn test_overrides() {
    let yaml = r#"
app: tally
origin: https://tally.example.com
generation: 42
manifest: ["/", "/app.js"]
routes:
  api_prefix: /v2/
timing:
  fetch_timeout_secs: 3
notifications:
  title: Tally
"#;
    let config = Config::parse(yaml).unwrap();
    assert_eq!(config.app, "tally");
    assert_eq!(config.generation, 42);
    assert_eq!(config.manifest, vec!["/", "/app.js"]);
    assert_eq!(config.routes.api_prefix, "/v2/");
    // Unset fields in a partially specified section keep their defaults
    assert_eq!(config.routes.receipts_endpoint, "/api/receipts");
    assert_eq!(config.timing.stale_after_secs, 300);
    assert_eq!(config.notifications.title, "Tally");
    assert_eq!(config.notifications.body, "You have a new update");
  }

  #[test]
  fn test_rejects_non_http_origin() {
    assert!(Config::parse("origin: ftp://example.com\ngeneration: 1\n").is_err());
  }

  #[test]
  fn test_resolve() {
    let config = test_config();
    assert_eq!(
      config.resolve("/api/receipts").unwrap().as_str(),
      "https://app.example.com/api/receipts"
    );
  }
}
