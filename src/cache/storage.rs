//! SQLite implementation of the cache store.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, OptionalExtension, Row};
use std::sync::Arc;

use super::key::RequestKey;
use super::traits::{CacheEntry, CacheStorage, Namespace};
use crate::db::Database;

/// SQLite-based cache storage implementation.
pub struct SqliteStorage {
  db: Arc<Database>,
}

impl SqliteStorage {
  pub fn new(db: Arc<Database>) -> Self {
    Self { db }
  }
}

impl CacheStorage for SqliteStorage {
  fn open_namespace(&self, namespace: &Namespace) -> Result<()> {
    self
      .db
      .lock()?
      .execute(
        "INSERT OR IGNORE INTO cache_namespaces (name, generation, created_at) VALUES (?, ?, ?)",
        params![namespace.name, namespace.generation as i64, Utc::now().to_rfc3339()],
      )
      .map_err(|e| eyre!("Failed to open namespace {}: {}", namespace.name, e))?;
    Ok(())
  }

  fn namespaces(&self) -> Result<Vec<Namespace>> {
    let conn = self.db.lock()?;
    let mut stmt = conn
      .prepare("SELECT name, generation FROM cache_namespaces ORDER BY generation, name")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let namespaces = stmt
      .query_map([], |row| {
        Ok(Namespace {
          name: row.get(0)?,
          generation: row.get::<_, i64>(1)? as u64,
        })
      })
      .map_err(|e| eyre!("Failed to list namespaces: {}", e))?
      .collect::<rusqlite::Result<Vec<_>>>()
      .map_err(|e| eyre!("Failed to read namespace: {}", e))?;

    Ok(namespaces)
  }

  fn delete_namespace(&self, name: &str) -> Result<bool> {
    let mut conn = self.db.lock()?;

    // Entries and namespace go together or not at all
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;
    tx.execute("DELETE FROM cache_entries WHERE namespace = ?", params![name])
      .map_err(|e| eyre!("Failed to delete entries of {}: {}", name, e))?;
    let removed = tx
      .execute("DELETE FROM cache_namespaces WHERE name = ?", params![name])
      .map_err(|e| eyre!("Failed to delete namespace {}: {}", name, e))?;
    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(removed > 0)
  }

  fn put(&self, namespace: &Namespace, entry: &CacheEntry) -> Result<()> {
    let headers = serde_json::to_string(&entry.headers)
      .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

    let mut conn = self.db.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;
    tx.execute(
      "INSERT OR IGNORE INTO cache_namespaces (name, generation, created_at) VALUES (?, ?, ?)",
      params![namespace.name, namespace.generation as i64, Utc::now().to_rfc3339()],
    )
    .map_err(|e| eyre!("Failed to open namespace {}: {}", namespace.name, e))?;
    tx.execute(
      "INSERT OR REPLACE INTO cache_entries (namespace, request_key, url, status, headers, body, stored_at)
       VALUES (?, ?, ?, ?, ?, ?, ?)",
      params![
        namespace.name,
        entry.key.as_str(),
        entry.url,
        entry.status,
        headers,
        entry.body.as_ref(),
        entry.stored_at.to_rfc3339()
      ],
    )
    .map_err(|e| eyre!("Failed to store entry {}: {}", entry.url, e))?;
    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(())
  }

  fn get(&self, namespace: &str, key: &RequestKey) -> Result<Option<CacheEntry>> {
    let conn = self.db.lock()?;
    let row = conn
      .query_row(
        "SELECT request_key, url, status, headers, body, stored_at FROM cache_entries
         WHERE namespace = ? AND request_key = ?",
        params![namespace, key.as_str()],
        read_row,
      )
      .optional()
      .map_err(|e| eyre!("Failed to read entry from {}: {}", namespace, e))?;

    row.map(decode_row).transpose()
  }

  fn match_any(&self, key: &RequestKey) -> Result<Option<CacheEntry>> {
    let conn = self.db.lock()?;
    let row = conn
      .query_row(
        "SELECT request_key, url, status, headers, body, stored_at FROM cache_entries
         WHERE request_key = ?
         ORDER BY stored_at DESC LIMIT 1",
        params![key.as_str()],
        read_row,
      )
      .optional()
      .map_err(|e| eyre!("Failed to match entry: {}", e))?;

    row.map(decode_row).transpose()
  }

  fn entry_count(&self, namespace: &str) -> Result<usize> {
    let count: i64 = self
      .db
      .lock()?
      .query_row(
        "SELECT COUNT(*) FROM cache_entries WHERE namespace = ?",
        params![namespace],
        |row| row.get(0),
      )
      .map_err(|e| eyre!("Failed to count entries of {}: {}", namespace, e))?;
    Ok(count as usize)
  }
}

type RawRow = (String, String, u16, String, Vec<u8>, String);

fn read_row(row: &Row<'_>) -> rusqlite::Result<RawRow> {
  Ok((
    row.get(0)?,
    row.get(1)?,
    row.get(2)?,
    row.get(3)?,
    row.get(4)?,
    row.get(5)?,
  ))
}

fn decode_row((key, url, status, headers, body, stored_at): RawRow) -> Result<CacheEntry> {
  let headers: Vec<(String, String)> = serde_json::from_str(&headers)
    .map_err(|e| eyre!("Failed to deserialize headers for {}: {}", url, e))?;
  let stored_at = DateTime::parse_from_rfc3339(&stored_at)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", stored_at, e))?;

  Ok(CacheEntry {
    key: RequestKey::from_stored(key),
    url,
    status,
    headers,
    body: body.into(),
    stored_at,
  })
}
