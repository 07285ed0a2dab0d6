//! Cache tier backings: SQLite key-value mappings, SQLite record tables,
//! and a no-op tier used when caching is disabled.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::warn;

use super::traits::{CacheTier, StoredEntry};

/// Prefix for every name stored in the key-value table.
const KEY_PREFIX: &str = "tubescript_";

/// Name of the schema version marker in the key-value table.
const VERSION_KEY: &str = "tubescript_version";

/// Get the default database path.
pub fn default_path() -> Result<PathBuf> {
  let data_dir = dirs::data_dir()
    .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
    .ok_or_else(|| eyre!("Could not determine data directory"))?;

  Ok(data_dir.join("tubescript").join("cache.db"))
}

fn open_connection(path: &Path) -> Result<Connection> {
  // Ensure parent directory exists
  if let Some(parent) = path.parent() {
    std::fs::create_dir_all(parent)
      .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
  }

  Connection::open(path)
    .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))
}

// ============================================================================
// Small-object tier
// ============================================================================

/// Small-object tier: each collection is one serialized JSON mapping,
/// rewritten as a whole on every put.
pub struct KvTier {
  conn: Mutex<Connection>,
}

const KV_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS kv_store (
    name TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

/// Shape of one entry inside a collection mapping.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MappingEntry {
  payload: Value,
  cached_at: i64,
  #[serde(default)]
  extra: Value,
}

impl KvTier {
  /// Open the tier in the database at `path`.
  pub fn open(path: &Path) -> Result<Self> {
    Self::from_connection(open_connection(path)?)
  }

  /// Open a private in-memory tier.
  #[allow(dead_code)]
  pub fn open_in_memory() -> Result<Self> {
    let conn =
      Connection::open_in_memory().map_err(|e| eyre!("Failed to open in-memory cache: {}", e))?;
    Self::from_connection(conn)
  }

  fn from_connection(conn: Connection) -> Result<Self> {
    conn
      .execute_batch(KV_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;

    Ok(Self {
      conn: Mutex::new(conn),
    })
  }

  fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }

  fn read_raw(conn: &Connection, name: &str) -> Result<Option<String>> {
    conn
      .query_row(
        "SELECT value FROM kv_store WHERE name = ?",
        params![name],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read {}: {}", name, e))
  }

  fn write_raw(conn: &Connection, name: &str, value: &str) -> Result<()> {
    conn
      .execute(
        "INSERT OR REPLACE INTO kv_store (name, value) VALUES (?, ?)",
        params![name, value],
      )
      .map_err(|e| eyre!("Failed to write {}: {}", name, e))?;
    Ok(())
  }

  /// Read and parse a collection mapping. Absent collections are empty.
  fn read_mapping(conn: &Connection, collection: &str) -> Result<Map<String, Value>> {
    let name = format!("{}{}", KEY_PREFIX, collection);
    match Self::read_raw(conn, &name)? {
      Some(raw) => serde_json::from_str(&raw)
        .map_err(|e| eyre!("Failed to parse cached {}: {}", collection, e)),
      None => Ok(Map::new()),
    }
  }

  fn write_mapping(conn: &Connection, collection: &str, mapping: &Map<String, Value>) -> Result<()> {
    let name = format!("{}{}", KEY_PREFIX, collection);
    let raw = serde_json::to_string(mapping)
      .map_err(|e| eyre!("Failed to serialize {}: {}", collection, e))?;
    Self::write_raw(conn, &name, &raw)
  }

  fn decode(value: &Value) -> Option<StoredEntry> {
    let entry: MappingEntry = serde_json::from_value(value.clone()).ok()?;
    StoredEntry::from_millis(entry.payload, entry.cached_at, entry.extra)
  }
}

impl CacheTier for KvTier {
  fn get(&self, collection: &str, key: &str) -> Result<Option<StoredEntry>> {
    let conn = self.lock()?;
    let mapping = Self::read_mapping(&conn, collection)?;

    match mapping.get(key) {
      Some(value) => Self::decode(value)
        .map(Some)
        .ok_or_else(|| eyre!("Malformed cache entry {}/{}", collection, key)),
      None => Ok(None),
    }
  }

  fn put(&self, collection: &str, key: &str, entry: StoredEntry) -> Result<()> {
    // The whole read-modify-write happens under the connection lock, so
    // writers in this process never drop each other's updates.
    let conn = self.lock()?;
    let mut mapping = Self::read_mapping(&conn, collection).unwrap_or_else(|e| {
      warn!("Replacing unreadable {} collection: {}", collection, e);
      Map::new()
    });

    let value = serde_json::to_value(MappingEntry {
      cached_at: entry.cached_at_millis(),
      payload: entry.payload,
      extra: entry.extra,
    })
    .map_err(|e| eyre!("Failed to serialize entry: {}", e))?;

    mapping.insert(key.to_string(), value);
    Self::write_mapping(&conn, collection, &mapping)
  }

  fn sweep(&self, collection: &str, cutoff: DateTime<Utc>) -> Result<usize> {
    let conn = self.lock()?;
    let mut mapping = Self::read_mapping(&conn, collection)?;
    let before = mapping.len();

    mapping.retain(|_, value| match Self::decode(value) {
      Some(entry) => entry.cached_at > cutoff,
      None => false,
    });

    let removed = before - mapping.len();
    if removed > 0 {
      Self::write_mapping(&conn, collection, &mapping)?;
    }
    Ok(removed)
  }

  fn clear(&self, collection: &str) -> Result<()> {
    let conn = self.lock()?;
    let name = format!("{}{}", KEY_PREFIX, collection);
    conn
      .execute("DELETE FROM kv_store WHERE name = ?", params![name])
      .map_err(|e| eyre!("Failed to clear {}: {}", collection, e))?;
    Ok(())
  }

  fn count(&self, collection: &str) -> Result<usize> {
    let conn = self.lock()?;
    Ok(Self::read_mapping(&conn, collection)?.len())
  }

  fn version_marker(&self) -> Result<Option<u32>> {
    let conn = self.lock()?;
    Ok(Self::read_raw(&conn, VERSION_KEY)?.and_then(|raw| raw.trim().parse().ok()))
  }

  fn set_version_marker(&self, version: u32) -> Result<()> {
    let conn = self.lock()?;
    Self::write_raw(&conn, VERSION_KEY, &version.to_string())
  }
}

// ============================================================================
// Large-object tier
// ============================================================================

/// Large-object tier: one row per key, indexed by `cached_at` so expiry
/// sweeps are a single range delete.
pub struct RecordTier {
  conn: Mutex<Connection>,
}

const RECORD_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS transcripts (
    job_id TEXT PRIMARY KEY,
    data BLOB NOT NULL,
    extra TEXT,
    url TEXT,
    cached_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_transcripts_cached_at ON transcripts(cached_at);
CREATE INDEX IF NOT EXISTS idx_transcripts_url ON transcripts(url);

CREATE TABLE IF NOT EXISTS batches (
    batch_id TEXT PRIMARY KEY,
    data BLOB NOT NULL,
    extra TEXT,
    url TEXT,
    cached_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_batches_cached_at ON batches(cached_at);
"#;

/// Table and key column for a record store name.
fn record_table(collection: &str) -> Result<(&'static str, &'static str)> {
  match collection {
    "transcripts" => Ok(("transcripts", "job_id")),
    "batches" => Ok(("batches", "batch_id")),
    other => Err(eyre!("Unknown record store: {}", other)),
  }
}

impl RecordTier {
  /// Open the tier in the database at `path`, creating its tables if absent.
  pub fn open(path: &Path) -> Result<Self> {
    Self::from_connection(open_connection(path)?)
  }

  /// Open a private in-memory tier.
  #[allow(dead_code)]
  pub fn open_in_memory() -> Result<Self> {
    let conn =
      Connection::open_in_memory().map_err(|e| eyre!("Failed to open in-memory cache: {}", e))?;
    Self::from_connection(conn)
  }

  fn from_connection(conn: Connection) -> Result<Self> {
    conn
      .execute_batch(RECORD_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;

    Ok(Self {
      conn: Mutex::new(conn),
    })
  }

  fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

impl CacheTier for RecordTier {
  fn get(&self, collection: &str, key: &str) -> Result<Option<StoredEntry>> {
    let (table, key_column) = record_table(collection)?;
    let conn = self.lock()?;

    let row: Option<(Vec<u8>, Option<String>, i64)> = conn
      .query_row(
        &format!(
          "SELECT data, extra, cached_at FROM {} WHERE {} = ?",
          table, key_column
        ),
        params![key],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
      )
      .optional()
      .map_err(|e| eyre!("Failed to query {}: {}", table, e))?;

    let Some((data, extra, cached_at)) = row else {
      return Ok(None);
    };

    let payload: Value = serde_json::from_slice(&data)
      .map_err(|e| eyre!("Failed to deserialize {} entry {}: {}", table, key, e))?;
    let extra = extra
      .and_then(|raw| serde_json::from_str(&raw).ok())
      .unwrap_or(Value::Null);

    StoredEntry::from_millis(payload, cached_at, extra)
      .map(Some)
      .ok_or_else(|| eyre!("Invalid timestamp on {} entry {}", table, key))
  }

  fn put(&self, collection: &str, key: &str, entry: StoredEntry) -> Result<()> {
    let (table, key_column) = record_table(collection)?;
    let data =
      serde_json::to_vec(&entry.payload).map_err(|e| eyre!("Failed to serialize entry: {}", e))?;
    let url = entry
      .extra
      .get("url")
      .and_then(Value::as_str)
      .map(String::from);
    let extra = if entry.extra.is_null() {
      None
    } else {
      Some(entry.extra.to_string())
    };

    let conn = self.lock()?;
    conn
      .execute(
        &format!(
          "INSERT OR REPLACE INTO {} ({}, data, extra, url, cached_at) VALUES (?, ?, ?, ?, ?)",
          table, key_column
        ),
        params![key, data, extra, url, entry.cached_at_millis()],
      )
      .map_err(|e| eyre!("Failed to store {} entry: {}", table, e))?;

    Ok(())
  }

  fn sweep(&self, collection: &str, cutoff: DateTime<Utc>) -> Result<usize> {
    let (table, _) = record_table(collection)?;
    let conn = self.lock()?;
    conn
      .execute(
        &format!("DELETE FROM {} WHERE cached_at <= ?", table),
        params![cutoff.timestamp_millis()],
      )
      .map_err(|e| eyre!("Failed to sweep {}: {}", table, e))
  }

  fn clear(&self, collection: &str) -> Result<()> {
    let (table, _) = record_table(collection)?;
    let conn = self.lock()?;
    conn
      .execute(&format!("DELETE FROM {}", table), [])
      .map_err(|e| eyre!("Failed to clear {}: {}", table, e))?;
    Ok(())
  }

  fn count(&self, collection: &str) -> Result<usize> {
    let (table, _) = record_table(collection)?;
    let conn = self.lock()?;
    let count: i64 = conn
      .query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| {
        row.get(0)
      })
      .map_err(|e| eyre!("Failed to count {}: {}", table, e))?;
    Ok(count as usize)
  }
}

// ============================================================================
// Disabled cache
// ============================================================================

/// Tier that doesn't cache anything.
/// Used when caching is disabled or the database cannot be opened.
pub struct NoopTier;

impl CacheTier for NoopTier {
  fn get(&self, _collection: &str, _key: &str) -> Result<Option<StoredEntry>> {
    Ok(None) // Always miss
  }

  fn put(&self, _collection: &str, _key: &str, _entry: StoredEntry) -> Result<()> {
    Ok(()) // Discard
  }

  fn sweep(&self, _collection: &str, _cutoff: DateTime<Utc>) -> Result<usize> {
    Ok(0)
  }

  fn clear(&self, _collection: &str) -> Result<()> {
    Ok(())
  }

  fn count(&self, _collection: &str) -> Result<usize> {
    Ok(0)
  }
}

// ============================================================================
// Async adapter
// ============================================================================

/// Runs a tier on the blocking pool so callers on the async executor never
/// wait on SQLite directly.
#[derive(Clone)]
pub struct AsyncTier {
  inner: Arc<dyn CacheTier>,
}

impl AsyncTier {
  pub fn new(inner: Arc<dyn CacheTier>) -> Self {
    Self { inner }
  }

  async fn run<R, F>(&self, f: F) -> Result<R>
  where
    R: Send + 'static,
    F: FnOnce(&dyn CacheTier) -> Result<R> + Send + 'static,
  {
    let inner = Arc::clone(&self.inner);
    tokio::task::spawn_blocking(move || f(inner.as_ref()))
      .await
      .map_err(|e| eyre!("Cache task failed: {}", e))?
  }

  pub async fn get(&self, collection: &str, key: &str) -> Result<Option<StoredEntry>> {
    let (collection, key) = (collection.to_string(), key.to_string());
    self.run(move |tier| tier.get(&collection, &key)).await
  }

  pub async fn put(&self, collection: &str, key: &str, entry: StoredEntry) -> Result<()> {
    let (collection, key) = (collection.to_string(), key.to_string());
    self.run(move |tier| tier.put(&collection, &key, entry)).await
  }

  pub async fn sweep(&self, collection: &str, cutoff: DateTime<Utc>) -> Result<usize> {
    let collection = collection.to_string();
    self.run(move |tier| tier.sweep(&collection, cutoff)).await
  }

  pub async fn clear(&self, collection: &str) -> Result<()> {
    let collection = collection.to_string();
    self.run(move |tier| tier.clear(&collection)).await
  }

  pub async fn count(&self, collection: &str) -> Result<usize> {
    let collection = collection.to_string();
    self.run(move |tier| tier.count(&collection)).await
  }
}
