//! Durable queue of writes that could not reach the server.
//!
//! A mutation is created once per failed write, gets its `attempts` bumped on
//! each failed replay, and is deleted only after the server confirms it.

mod drain;

pub use drain::{DrainFlag, DrainReport, Replayer, RetryPolicy};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use reqwest::Method;
use rusqlite::types::Type;
use rusqlite::{params, Connection, Row};
use std::sync::Arc;
use uuid::Uuid;

use crate::db::Database;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationState {
  /// Waiting for the next drain
  Pending,
  /// Gave up; kept for inspection until purged or retried
  Failed,
}

impl MutationState {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Pending => "pending",
      Self::Failed => "failed",
    }
  }

  fn parse(s: &str) -> Self {
    match s {
      "failed" => Self::Failed,
      _ => Self::Pending,
    }
  }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PendingMutation {
  pub id: String,
  /// Absolute URL the write was sent to
  pub endpoint: String,
  pub method: String,
  pub content_type: Option<String>,
  pub payload: Bytes,
  pub created_at: DateTime<Utc>,
  pub attempts: u32,
  pub last_error: Option<String>,
  pub state: MutationState,
}

impl PendingMutation {
  pub fn method(&self) -> Result<Method> {
    Method::from_bytes(self.method.as_bytes())
      .map_err(|e| eyre!("Invalid method {} on mutation {}: {}", self.method, self.id, e))
  }
}

/// SQLite-backed mutation store.
pub struct MutationStore {
  db: Arc<Database>,
}

const COLUMNS: &str =
  "id, endpoint, method, content_type, payload, created_at, attempts, last_error, state";

impl MutationStore {
  pub fn new(db: Arc<Database>) -> Self {
    Self { db }
  }

  /// Append a mutation, generating its id.
  pub fn enqueue(
    &self,
    endpoint: &str,
    method: &Method,
    content_type: Option<&str>,
    payload: &[u8],
  ) -> Result<PendingMutation> {
    let mutation = PendingMutation {
      id: Uuid::new_v4().to_string(),
      endpoint: endpoint.to_string(),
      method: method.as_str().to_string(),
      content_type: content_type.map(String::from),
      payload: Bytes::copy_from_slice(payload),
      created_at: Utc::now(),
      attempts: 0,
      last_error: None,
      state: MutationState::Pending,
    };

    self
      .db
      .lock()?
      .execute(
        "INSERT INTO pending_mutations (id, endpoint, method, content_type, payload, created_at, attempts, state)
         VALUES (?, ?, ?, ?, ?, ?, 0, 'pending')",
        params![
          mutation.id,
          mutation.endpoint,
          mutation.method,
          mutation.content_type,
          mutation.payload.as_ref(),
          mutation.created_at.to_rfc3339()
        ],
      )
      .map_err(|e| eyre!("Failed to enqueue mutation: {}", e))?;

    Ok(mutation)
  }

  /// Pending mutations in creation order.
  pub fn pending(&self) -> Result<Vec<PendingMutation>> {
    let conn = self.db.lock()?;
    select(&conn, "WHERE state = 'pending' ORDER BY seq", params![])
  }

  /// Mutations that were given up on.
  #[allow(dead_code)]
  pub fn failed(&self) -> Result<Vec<PendingMutation>> {
    let conn = self.db.lock()?;
    select(&conn, "WHERE state = 'failed' ORDER BY seq", params![])
  }

  /// Every stored mutation in creation order.
  pub fn list(&self) -> Result<Vec<PendingMutation>> {
    let conn = self.db.lock()?;
    select(&conn, "ORDER BY seq", params![])
  }

  /// Remove a confirmed mutation. Removing twice is a no-op.
  pub fn remove(&self, id: &str) -> Result<bool> {
    let removed = self
      .db
      .lock()?
      .execute("DELETE FROM pending_mutations WHERE id = ?", params![id])
      .map_err(|e| eyre!("Failed to remove mutation {}: {}", id, e))?;
    Ok(removed > 0)
  }

  /// Record a failed replay and return the new attempt count.
  pub fn record_failure(&self, id: &str, error: &str) -> Result<u32> {
    let conn = self.db.lock()?;
    conn
      .execute(
        "UPDATE pending_mutations SET attempts = attempts + 1, last_error = ? WHERE id = ?",
        params![error, id],
      )
      .map_err(|e| eyre!("Failed to update mutation {}: {}", id, e))?;

    conn
      .query_row(
        "SELECT attempts FROM pending_mutations WHERE id = ?",
        params![id],
        |row| row.get(0),
      )
      .map_err(|e| eyre!("Failed to read attempts of {}: {}", id, e))
  }

  /// Park a mutation as failed. It is no longer replayed.
  pub fn mark_failed(&self, id: &str, error: &str) -> Result<()> {
    self
      .db
      .lock()?
      .execute(
        "UPDATE pending_mutations SET state = ?, last_error = ? WHERE id = ?",
        params![MutationState::Failed.as_str(), error, id],
      )
      .map_err(|e| eyre!("Failed to mark mutation {} failed: {}", id, e))?;
    Ok(())
  }

  /// Put every failed mutation back in line with a fresh attempt budget.
  pub fn retry_failed(&self) -> Result<usize> {
    self
      .db
      .lock()?
      .execute(
        "UPDATE pending_mutations SET state = 'pending', attempts = 0 WHERE state = 'failed'",
        [],
      )
      .map_err(|e| eyre!("Failed to requeue failed mutations: {}", e))
  }

  pub fn purge(&self, id: &str) -> Result<bool> {
    self.remove(id)
  }

  pub fn purge_all(&self) -> Result<usize> {
    self
      .db
      .lock()?
      .execute("DELETE FROM pending_mutations", [])
      .map_err(|e| eyre!("Failed to purge mutations: {}", e))
  }

  /// (pending, failed) counts.
  pub fn counts(&self) -> Result<(usize, usize)> {
    let all = self.list()?;
    let failed = all
      .iter()
      .filter(|m| m.state == MutationState::Failed)
      .count();
    Ok((all.len() - failed, failed))
  }
}

fn select(
  conn: &Connection,
  clause: &str,
  params: &[&dyn rusqlite::ToSql],
) -> Result<Vec<PendingMutation>> {
  let sql = format!("SELECT {} FROM pending_mutations {}", COLUMNS, clause);
  let mut stmt = conn
    .prepare(&sql)
    .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

  let rows = stmt
    .query_map(params, read_mutation)
    .map_err(|e| eyre!("Failed to query mutations: {}", e))?
    .collect::<rusqlite::Result<Vec<_>>>()
    .map_err(|e| eyre!("Failed to read mutation: {}", e));
  rows
}

fn read_mutation(row: &Row<'_>) -> rusqlite::Result<PendingMutation> {
  let payload: Vec<u8> = row.get(4)?;
  let created_at: String = row.get(5)?;
  let created_at = DateTime::parse_from_rfc3339(&created_at)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| rusqlite::Error::FromSqlConversionFailure(5, Type::Text, Box::new(e)))?;
  let state: String = row.get(8)?;

  Ok(PendingMutation {
    id: row.get(0)?,
    endpoint: row.get(1)?,
    method: row.get(2)?,
    content_type: row.get(3)?,
    payload: payload.into(),
    created_at,
    attempts: row.get(6)?,
    last_error: row.get(7)?,
    state: MutationState::parse(&state),
  })
}

#[cfg(test)]
mod tests {
  use super::*;

  fn store() -> MutationStore {
    MutationStore::new(Arc::new(Database::open_in_memory().unwrap()))
  }

  const ENDPOINT: &str = "https://app.example.com/api/receipts";

  #[test]
  fn test_enqueue_keeps_payload_and_order() {
    let store = store();
    let a = store
      .enqueue(ENDPOINT, &Method::POST, Some("application/json"), br#"{"a":1}"#)
      .unwrap();
    let b = store.enqueue(ENDPOINT, &Method::POST, None, b"b").unwrap();
    assert_ne!(a.id, b.id);

    let pending = store.pending().unwrap();
    assert_eq!(pending.len(), 2);
    assert_eq!(pending[0].id, a.id);
    assert_eq!(pending[0].payload.as_ref(), br#"{"a":1}"#);
    assert_eq!(pending[0].content_type.as_deref(), Some("application/json"));
    assert_eq!(pending[0].method().unwrap(), Method::POST);
    assert_eq!(pending[1].id, b.id);
    assert_eq!(pending[1].attempts, 0);
  }

  #[test]
  fn test_record_failure_and_mark_failed() {
    let store = store();
    let m = store.enqueue(ENDPOINT, &Method::POST, None, b"x").unwrap();

    assert_eq!(store.record_failure(&m.id, "offline").unwrap(), 1);
    assert_eq!(store.record_failure(&m.id, "offline").unwrap(), 2);

    store.mark_failed(&m.id, "gave up").unwrap();
    assert!(store.pending().unwrap().is_empty());
    let failed = store.failed().unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].attempts, 2);
    assert_eq!(failed[0].last_error.as_deref(), Some("gave up"));
    assert_eq!(store.counts().unwrap(), (0, 1));

    assert_eq!(store.retry_failed().unwrap(), 1);
    let pending = store.pending().unwrap();
    assert_eq!(pending[0].attempts, 0);
    assert_eq!(pending[0].state, MutationState::Pending);
  }

  #[test]
  fn test_remove_is_idempotent() {
    let store = store();
    let m = store.enqueue(ENDPOINT, &Method::PUT, None, b"x").unwrap();
    assert!(store.remove(&m.id).unwrap());
    assert!(!store.remove(&m.id).unwrap());
    assert!(store.list().unwrap().is_empty());
  }

  #[test]
  fn test_purge_all() {
    let store = store();
    store.enqueue(ENDPOINT, &Method::POST, None, b"1").unwrap();
    store.enqueue(ENDPOINT, &Method::POST, None, b"2").unwrap();
    assert_eq!(store.purge_all().unwrap(), 2);
    assert!(store.list().unwrap().is_empty());
  }
}
