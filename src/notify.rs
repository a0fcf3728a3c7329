//! Push notifications: render incoming payloads and route taps.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use url::Url;

use crate::config::NotificationDefaults;

/// Incoming push payload. Every field is optional.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushPayload {
  pub title: Option<String>,
  pub body: Option<String>,
  pub icon: Option<String>,
  pub badge: Option<String>,
  pub tag: Option<String>,
  pub require_interaction: Option<bool>,
  pub data: Option<PushData>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PushData {
  pub url: Option<String>,
}

/// A notification ready to display.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
  pub title: String,
  pub body: String,
  pub icon: String,
  pub badge: String,
  pub tag: Option<String>,
  pub require_interaction: bool,
  pub data: NotificationData,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationData {
  pub target_url: String,
}

/// An open browsing context of the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientWindow {
  pub id: String,
  pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClickOutcome {
  /// An existing window was focused and navigated
  Focused { client: String, url: String },
  /// No window was open; a new one was requested
  Opened { url: String },
}

pub struct Dispatcher {
  defaults: NotificationDefaults,
  origin: Url,
}

impl Dispatcher {
  pub fn new(defaults: NotificationDefaults, origin: Url) -> Self {
    Self { defaults, origin }
  }

  /// Merge a raw push payload over the default template.
  ///
  /// A payload that is not valid JSON still produces a notification, built
  /// entirely from defaults.
  pub fn on_push(&self, raw: &[u8]) -> Notification {
    let payload = if raw.is_empty() {
      PushPayload::default()
    } else {
      serde_json::from_slice(raw).unwrap_or_else(|e| {
        warn!(error = %e, "malformed push payload, using defaults");
        PushPayload::default()
      })
    };
    self.merge(payload)
  }

  fn merge(&self, payload: PushPayload) -> Notification {
    let d = &self.defaults;
    let target = payload
      .data
      .and_then(|data| data.url)
      .filter(|u| !u.trim().is_empty())
      .unwrap_or_else(|| d.url.clone());

    Notification {
      title: non_empty(payload.title, &d.title),
      body: non_empty(payload.body, &d.body),
      icon: non_empty(payload.icon, &d.icon),
      badge: non_empty(payload.badge, &d.badge),
      tag: payload.tag.filter(|t| !t.is_empty()),
      require_interaction: payload.require_interaction.unwrap_or(false),
      data: NotificationData {
        target_url: self.resolve(&target),
      },
    }
  }

  fn resolve(&self, target: &str) -> String {
    match self.origin.join(target) {
      Ok(url) => url.to_string(),
      Err(e) => {
        warn!(target, error = %e, "invalid notification target, using origin");
        self.origin.to_string()
      }
    }
  }

  /// Decide where a tap goes: the first open application window, or a new one.
  pub fn on_notification_click(
    &self,
    notification: &Notification,
    windows: &[ClientWindow],
  ) -> ClickOutcome {
    let url = notification.data.target_url.clone();
    let existing = windows.iter().find(|w| {
      Url::parse(&w.url)
        .map(|u| u.origin() == self.origin.origin())
        .unwrap_or(false)
    });

    match existing {
      Some(window) => {
        debug!(client = %window.id, url = %url, "focusing existing window");
        ClickOutcome::Focused {
          client: window.id.clone(),
          url,
        }
      }
      None => {
        debug!(url = %url, "opening new window");
        ClickOutcome::Opened { url }
      }
    }
  }
}

fn non_empty(value: Option<String>, default: &str) -> String {
  value
    .filter(|v| !v.trim().is_empty())
    .unwrap_or_else(|| default.to_string())
}
