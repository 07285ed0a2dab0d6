//! Two-tier cache store with a uniform staleness contract.
//!
//! The store never returns errors: any failure from a tier is logged and
//! treated as a cache miss (reads) or a dropped write (writes). Callers
//! proceed exactly as they would on a cold cache.

use chrono::{Duration, Utc};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::schema::{schema_decision, SchemaDecision, SCHEMA_VERSION};
use super::storage::{default_path, AsyncTier, KvTier, NoopTier, RecordTier};
use super::traits::{is_valid, max_age, CacheEntry, CacheTier, StoredEntry};
use crate::config::CacheConfig;

/// Namespaces of the small-object tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetadataCollection {
  Jobs,
  Batches,
  Settings,
}

impl MetadataCollection {
  pub const ALL: [MetadataCollection; 3] = [Self::Jobs, Self::Batches, Self::Settings];

  pub fn as_str(self) -> &'static str {
    match self {
      Self::Jobs => "jobs",
      Self::Batches => "batches",
      Self::Settings => "settings",
    }
  }
}

/// Stores of the large-object tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectStore {
  Transcripts,
  Batches,
}

impl ObjectStore {
  pub const ALL: [ObjectStore; 2] = [Self::Transcripts, Self::Batches];

  pub fn as_str(self) -> &'static str {
    match self {
      Self::Transcripts => "transcripts",
      Self::Batches => "batches",
    }
  }
}

/// Counts reported by [`CacheStore::stats`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CacheStats {
  pub job_count: usize,
  pub batch_count: usize,
  pub transcript_count: usize,
  pub schema_version: u32,
}

/// Cache store over a synchronous metadata tier and an asynchronous
/// large-object tier.
#[derive(Clone)]
pub struct CacheStore {
  metadata: Arc<dyn CacheTier>,
  objects: AsyncTier,
  max_age: Duration,
}

impl CacheStore {
  /// Open the configured cache, running the schema gate.
  ///
  /// Falls back to a disabled cache if the database cannot be opened.
  pub fn open(config: &CacheConfig) -> Self {
    if !config.enabled {
      info!("Cache disabled by configuration");
      return Self::disabled();
    }

    let path = match config.path.clone().map(Ok).unwrap_or_else(default_path) {
      Ok(path) => path,
      Err(e) => {
        warn!("Cache unavailable, continuing without it: {}", e);
        return Self::disabled();
      }
    };

    let tiers = KvTier::open(&path).and_then(|kv| Ok((kv, RecordTier::open(&path)?)));
    match tiers {
      Ok((kv, records)) => {
        debug!("Opened cache at {}", path.display());
        Self::new(Arc::new(kv), Arc::new(records))
      }
      Err(e) => {
        warn!("Cache unavailable, continuing without it: {}", e);
        Self::disabled()
      }
    }
  }

  /// A store that never caches anything.
  pub fn disabled() -> Self {
    Self::with_schema_version(Arc::new(NoopTier), Arc::new(NoopTier), SCHEMA_VERSION).0
  }

  /// Build a store over the given tiers with the compiled-in schema version.
  pub fn new(metadata: Arc<dyn CacheTier>, objects: Arc<dyn CacheTier>) -> Self {
    Self::with_schema_version(metadata, objects, SCHEMA_VERSION).0
  }

  /// Build a store and run the schema gate against `compiled`.
  ///
  /// This is the only place the version marker is written.
  pub fn with_schema_version(
    metadata: Arc<dyn CacheTier>,
    objects: Arc<dyn CacheTier>,
    compiled: u32,
  ) -> (Self, SchemaDecision) {
    let stored = metadata.version_marker().unwrap_or_else(|e| {
      warn!("Failed to read cache version: {}", e);
      None
    });

    let decision = schema_decision(stored, compiled);
    if decision == SchemaDecision::Wipe {
      info!(
        "Cache version {:?} outdated (want {}), clearing cache",
        stored, compiled
      );
      wipe(metadata.as_ref(), objects.as_ref());
      if let Err(e) = metadata.set_version_marker(compiled) {
        warn!("Failed to write cache version: {}", e);
      }
    }

    let store = Self {
      metadata,
      objects: AsyncTier::new(objects),
      max_age: max_age(),
    };
    (store, decision)
  }

  fn validate<T: DeserializeOwned>(
    &self,
    what: &str,
    key: &str,
    entry: StoredEntry,
  ) -> Option<CacheEntry<T>> {
    if !is_valid(entry.cached_at, Utc::now(), self.max_age) {
      debug!("Cached {} {} expired", what, key);
      return None;
    }

    match serde_json::from_value(entry.payload) {
      Ok(payload) => Some(CacheEntry {
        payload,
        cached_at: entry.cached_at,
      }),
      Err(e) => {
        warn!("Discarding unreadable cached {} {}: {}", what, key, e);
        None
      }
    }
  }

  /// Look up a valid metadata entry.
  pub fn get_metadata<T: DeserializeOwned>(
    &self,
    collection: MetadataCollection,
    key: &str,
  ) -> Option<CacheEntry<T>> {
    match self.metadata.get(collection.as_str(), key) {
      Ok(Some(entry)) => self.validate(collection.as_str(), key, entry),
      Ok(None) => None,
      Err(e) => {
        warn!("Error retrieving cached {} {}: {}", collection.as_str(), key, e);
        None
      }
    }
  }

  /// Overwrite a metadata entry with a freshly timestamped wrapper.
  pub fn put_metadata<T: Serialize>(&self, collection: MetadataCollection, key: &str, payload: &T) {
    let result = serde_json::to_value(payload)
      .map_err(|e| color_eyre::eyre::eyre!("Failed to serialize: {}", e))
      .and_then(|value| {
        self
          .metadata
          .put(collection.as_str(), key, StoredEntry::now(value, Value::Null))
      });

    match result {
      Ok(()) => debug!("Cached {} {}", collection.as_str(), key),
      Err(e) => warn!("Error caching {} {}: {}", collection.as_str(), key, e),
    }
  }

  /// Look up a valid large-object entry.
  pub async fn get_large_object<T: DeserializeOwned>(
    &self,
    store: ObjectStore,
    key: &str,
  ) -> Option<CacheEntry<T>> {
    match self.objects.get(store.as_str(), key).await {
      Ok(Some(entry)) => self.validate(store.as_str(), key, entry),
      Ok(None) => None,
      Err(e) => {
        warn!("Error retrieving cached {} {}: {}", store.as_str(), key, e);
        None
      }
    }
  }

  /// Upsert a large-object entry with a fresh timestamp.
  pub async fn put_large_object<T: Serialize>(
    &self,
    store: ObjectStore,
    key: &str,
    payload: &T,
    extra: Value,
  ) {
    let value = match serde_json::to_value(payload) {
      Ok(value) => value,
      Err(e) => {
        warn!("Error caching {} {}: {}", store.as_str(), key, e);
        return;
      }
    };

    match self
      .objects
      .put(store.as_str(), key, StoredEntry::now(value, extra))
      .await
    {
      Ok(()) => debug!("Cached {} {}", store.as_str(), key),
      Err(e) => warn!("Error caching {} {}: {}", store.as_str(), key, e),
    }
  }

  /// Remove expired entries from both tiers. Settings never expire.
  ///
  /// Returns the number of entries removed.
  pub async fn sweep_expired(&self) -> usize {
    let cutoff = Utc::now() - self.max_age;
    let mut removed = 0;

    for collection in [MetadataCollection::Jobs, MetadataCollection::Batches] {
      match self.metadata.sweep(collection.as_str(), cutoff) {
        Ok(n) => removed += n,
        Err(e) => warn!("Error sweeping {}: {}", collection.as_str(), e),
      }
    }

    for store in ObjectStore::ALL {
      match self.objects.sweep(store.as_str(), cutoff).await {
        Ok(n) => removed += n,
        Err(e) => warn!("Error sweeping {}: {}", store.as_str(), e),
      }
    }

    info!("Cleared {} expired cache entries", removed);
    removed
  }

  /// Empty every collection of both tiers.
  pub async fn clear_all(&self) {
    for collection in MetadataCollection::ALL {
      if let Err(e) = self.metadata.clear(collection.as_str()) {
        warn!("Error clearing {}: {}", collection.as_str(), e);
      }
    }
    for store in ObjectStore::ALL {
      if let Err(e) = self.objects.clear(store.as_str()).await {
        warn!("Error clearing {}: {}", store.as_str(), e);
      }
    }
    info!("Cleared all cache");
  }

  /// Entry counts per collection (expired entries included until swept).
  pub async fn stats(&self) -> CacheStats {
    let count_metadata = |collection: MetadataCollection| {
      self
        .metadata
        .count(collection.as_str())
        .unwrap_or_else(|e| {
          warn!("Error counting {}: {}", collection.as_str(), e);
          0
        })
    };

    let transcript_count = self
      .objects
      .count(ObjectStore::Transcripts.as_str())
      .await
      .unwrap_or_else(|e| {
        warn!("Error getting transcript count: {}", e);
        0
      });

    CacheStats {
      job_count: count_metadata(MetadataCollection::Jobs),
      batch_count: count_metadata(MetadataCollection::Batches),
      transcript_count,
      schema_version: SCHEMA_VERSION,
    }
  }

  /// Read a user setting. Settings are preferences and are not subject to
  /// the cache max age.
  pub fn setting<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
    let collection = MetadataCollection::Settings.as_str();
    match self.metadata.get(collection, key) {
      Ok(entry) => entry.and_then(|entry| serde_json::from_value(entry.payload).ok()),
      Err(e) => {
        warn!("Error retrieving cached setting {}: {}", key, e);
        None
      }
    }
  }

  /// Store a user setting.
  pub fn set_setting<T: Serialize>(&self, key: &str, value: &T) {
    self.put_metadata(MetadataCollection::Settings, key, value);
  }
}

/// Synchronously empty both tiers. Used by the schema gate, before any other
/// operation can observe the store.
fn wipe(metadata: &dyn CacheTier, objects: &dyn CacheTier) {
  for collection in MetadataCollection::ALL {
    if let Err(e) = metadata.clear(collection.as_str()) {
      warn!("Error clearing {}: {}", collection.as_str(), e);
    }
  }
  for store in ObjectStore::ALL {
    if let Err(e) = objects.clear(store.as_str()) {
      warn!("Error clearing {}: {}", store.as_str(), e);
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  struct Tiers {
    kv: Arc<KvTier>,
    records: Arc<RecordTier>,
  }

  fn tiers() -> Tiers {
    Tiers {
      kv: Arc::new(KvTier::open_in_memory().unwrap()),
      records: Arc::new(RecordTier::open_in_memory().unwrap()),
    }
  }

  fn store(tiers: &Tiers) -> CacheStore {
    CacheStore::new(tiers.kv.clone(), tiers.records.clone())
  }

  fn aged(payload: Value, age: Duration) -> StoredEntry {
    StoredEntry {
      payload,
      cached_at: Utc::now() - age,
      extra: Value::Null,
    }
  }

  /// Tier whose every operation fails.
  struct BrokenTier;

  impl CacheTier for BrokenTier {
    fn get(&self, _: &str, _: &str) -> color_eyre::Result<Option<StoredEntry>> {
      Err(color_eyre::eyre::eyre!("engine unavailable"))
    }
    fn put(&self, _: &str, _: &str, _: StoredEntry) -> color_eyre::Result<()> {
      Err(color_eyre::eyre::eyre!("quota exceeded"))
    }
    fn sweep(&self, _: &str, _: chrono::DateTime<Utc>) -> color_eyre::Result<usize> {
      Err(color_eyre::eyre::eyre!("engine unavailable"))
    }
    fn clear(&self, _: &str) -> color_eyre::Result<()> {
      Err(color_eyre::eyre::eyre!("engine unavailable"))
    }
    fn count(&self, _: &str) -> color_eyre::Result<usize> {
      Err(color_eyre::eyre::eyre!("engine unavailable"))
    }
  }

  #[test]
  fn test_metadata_round_trip() {
    let tiers = tiers();
    let store = store(&tiers);

    store.put_metadata(MetadataCollection::Jobs, "j1", &json!({"status": "queued"}));
    let entry: CacheEntry<Value> = store.get_metadata(MetadataCollection::Jobs, "j1").unwrap();
    assert_eq!(entry.payload["status"], "queued");
  }

  #[test]
  fn test_expired_metadata_is_absent_but_not_deleted() {
    let tiers = tiers();
    let store = store(&tiers);
    tiers
      .kv
      .put("jobs", "old", aged(json!({"status": "completed"}), Duration::days(7)))
      .unwrap();

    assert!(store
      .get_metadata::<Value>(MetadataCollection::Jobs, "old")
      .is_none());
    assert!(tiers.kv.get("jobs", "old").unwrap().is_some());
  }

  #[test]
  fn test_corrupt_metadata_reads_as_absent() {
    let tiers = tiers();
    let store = store(&tiers);
    tiers.kv.put("jobs", "j1", StoredEntry::now(json!("not a job"), Value::Null)).unwrap();

    #[derive(serde::Deserialize)]
    struct Job {
      #[allow(dead_code)]
      status: String,
    }

    assert!(store.get_metadata::<Job>(MetadataCollection::Jobs, "j1").is_none());
  }

  #[tokio::test]
  async fn test_large_object_expiry() {
    let tiers = tiers();
    let store = store(&tiers);
    tiers
      .records
      .put("transcripts", "old", aged(json!({"segments": []}), Duration::days(8)))
      .unwrap();
    store
      .put_large_object(ObjectStore::Transcripts, "new", &json!({"segments": []}), Value::Null)
      .await;

    assert!(store
      .get_large_object::<Value>(ObjectStore::Transcripts, "old")
      .await
      .is_none());
    assert!(store
      .get_large_object::<Value>(ObjectStore::Transcripts, "new")
      .await
      .is_some());
  }

  #[tokio::test]
  async fn test_sweep_removes_expired_from_both_tiers() {
    let tiers = tiers();
    let store = store(&tiers);
    tiers.kv.put("jobs", "old", aged(json!(1), Duration::days(10))).unwrap();
    tiers.kv.put("batches", "old", aged(json!(1), Duration::days(10))).unwrap();
    tiers.kv.put("settings", "theme", aged(json!("dark"), Duration::days(10))).unwrap();
    tiers
      .records
      .put("transcripts", "old", aged(json!(1), Duration::days(10)))
      .unwrap();
    store.put_metadata(MetadataCollection::Jobs, "new", &json!(2));

    assert_eq!(store.sweep_expired().await, 3);

    let stats = store.stats().await;
    assert_eq!(stats.job_count, 1);
    assert_eq!(stats.batch_count, 0);
    assert_eq!(stats.transcript_count, 0);
    assert_eq!(store.setting::<String>("theme").as_deref(), Some("dark"));
  }

  #[tokio::test]
  async fn test_clear_all_empties_everything() {
    let tiers = tiers();
    let store = store(&tiers);
    store.put_metadata(MetadataCollection::Jobs, "j", &json!(1));
    store.put_metadata(MetadataCollection::Batches, "b", &json!(1));
    store.set_setting("diarization_enabled", &true);
    store
      .put_large_object(ObjectStore::Transcripts, "j", &json!(1), Value::Null)
      .await;

    store.clear_all().await;

    let stats = store.stats().await;
    assert_eq!((stats.job_count, stats.batch_count, stats.transcript_count), (0, 0, 0));
    assert!(store.setting::<bool>("diarization_enabled").is_none());
  }

  #[tokio::test]
  async fn test_schema_mismatch_wipes_existing_data() {
    let tiers = tiers();
    {
      let (store, decision) =
        CacheStore::with_schema_version(tiers.kv.clone(), tiers.records.clone(), 1);
      assert_eq!(decision, SchemaDecision::Wipe);
      store.put_metadata(MetadataCollection::Jobs, "j", &json!(1));
      store.put_metadata(MetadataCollection::Batches, "b", &json!(1));
      store.set_setting("k", &1);
      store
        .put_large_object(ObjectStore::Transcripts, "j", &json!(1), Value::Null)
        .await;
      store
        .put_large_object(ObjectStore::Batches, "b", &json!(1), Value::Null)
        .await;
    }

    let (same, decision) =
      CacheStore::with_schema_version(tiers.kv.clone(), tiers.records.clone(), 1);
    assert_eq!(decision, SchemaDecision::Proceed);
    assert!(same.get_metadata::<Value>(MetadataCollection::Jobs, "j").is_some());

    let (upgraded, decision) =
      CacheStore::with_schema_version(tiers.kv.clone(), tiers.records.clone(), 2);
    assert_eq!(decision, SchemaDecision::Wipe);
    assert!(upgraded.get_metadata::<Value>(MetadataCollection::Jobs, "j").is_none());
    assert!(upgraded.get_metadata::<Value>(MetadataCollection::Batches, "b").is_none());
    assert!(upgraded.setting::<i32>("k").is_none());
    assert!(upgraded
      .get_large_object::<Value>(ObjectStore::Transcripts, "j")
      .await
      .is_none());
    assert!(upgraded
      .get_large_object::<Value>(ObjectStore::Batches, "b")
      .await
      .is_none());
    assert_eq!(tiers.kv.version_marker().unwrap(), Some(2));
  }

  #[tokio::test]
  async fn test_broken_tiers_degrade_to_misses() {
    let store = CacheStore::new(Arc::new(BrokenTier), Arc::new(BrokenTier));

    store.put_metadata(MetadataCollection::Jobs, "j", &json!(1));
    assert!(store.get_metadata::<Value>(MetadataCollection::Jobs, "j").is_none());
    store
      .put_large_object(ObjectStore::Transcripts, "j", &json!(1), Value::Null)
      .await;
    assert!(store
      .get_large_object::<Value>(ObjectStore::Transcripts, "j")
      .await
      .is_none());
    assert_eq!(store.sweep_expired().await, 0);
    store.clear_all().await;
    assert_eq!(store.stats().await.transcript_count, 0);
  }

  #[tokio::test]
  async fn test_disabled_store_never_hits() {
    let store = CacheStore::disabled();
    store.put_metadata(MetadataCollection::Jobs, "j", &json!(1));
    assert!(store.get_metadata::<Value>(MetadataCollection::Jobs, "j").is_none());
    assert_eq!(store.stats().await.job_count, 0);
  }

  #[test]
  fn test_open_respects_disabled_config() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cache.db");
    let store = CacheStore::open(&CacheConfig {
      enabled: false,
      path: Some(path.clone()),
    });

    store.put_metadata(MetadataCollection::Jobs, "j", &json!(1));
    assert!(!path.exists());
  }

  #[test]
  fn test_open_persists_across_instances() {
    let dir = tempfile::tempdir().unwrap();
    let config = CacheConfig {
      enabled: true,
      path: Some(dir.path().join("cache.db")),
    };

    CacheStore::open(&config).put_metadata(MetadataCollection::Jobs, "j", &json!(1));
    let reopened = CacheStore::open(&config);
    assert!(reopened.get_metadata::<Value>(MetadataCollection::Jobs, "j").is_some());
  }
}
