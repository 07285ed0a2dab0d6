//! Core traits and types for the caching system.

use chrono::{DateTime, Duration, TimeZone, Utc};
use color_eyre::Result;
use serde_json::Value;

/// How long any cached entry stays valid.
pub const MAX_AGE_MS: i64 = 7 * 24 * 60 * 60 * 1000;

/// Maximum entry age as a chrono duration.
pub fn max_age() -> Duration {
  Duration::milliseconds(MAX_AGE_MS)
}

/// Validity predicate shared by every tier.
///
/// An entry is valid while strictly younger than `max_age`; an entry that is
/// exactly `max_age` old is expired.
pub fn is_valid(cached_at: DateTime<Utc>, now: DateTime<Utc>, max_age: Duration) -> bool {
  now - cached_at < max_age
}

/// Raw entry as persisted by a tier.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredEntry {
  /// Serialized payload
  pub payload: Value,
  /// When the entry was written
  pub cached_at: DateTime<Utc>,
  /// Additional metadata stored next to the payload (Null when absent)
  pub extra: Value,
}

impl StoredEntry {
  /// Wrap a payload with the current time.
  pub fn now(payload: Value, extra: Value) -> Self {
    Self {
      payload,
      cached_at: Utc::now(),
      extra,
    }
  }

  pub(crate) fn cached_at_millis(&self) -> i64 {
    self.cached_at.timestamp_millis()
  }

  pub(crate) fn from_millis(payload: Value, cached_at: i64, extra: Value) -> Option<Self> {
    let cached_at = Utc.timestamp_millis_opt(cached_at).single()?;
    Some(Self {
      payload,
      cached_at,
      extra,
    })
  }
}

/// A decoded, valid cache entry.
#[derive(Debug, Clone)]
pub struct CacheEntry<T> {
  pub payload: T,
  pub cached_at: DateTime<Utc>,
}

/// Storage capability shared by the metadata and large-object tiers.
///
/// `collection` names a disjoint namespace inside the tier (e.g. "jobs").
/// Implementations report failures; the store above them decides what to do
/// with them.
pub trait CacheTier: Send + Sync {
  /// Look up a raw entry. No validity check is applied here.
  fn get(&self, collection: &str, key: &str) -> Result<Option<StoredEntry>>;

  /// Insert or replace an entry.
  fn put(&self, collection: &str, key: &str, entry: StoredEntry) -> Result<()>;

  /// Remove every entry whose `cached_at` is at or before `cutoff`.
  /// Returns the number of removed entries.
  fn sweep(&self, collection: &str, cutoff: DateTime<Utc>) -> Result<usize>;

  /// Remove every entry of a collection.
  fn clear(&self, collection: &str) -> Result<()>;

  /// Number of entries in a collection, valid or not.
  fn count(&self, collection: &str) -> Result<usize>;

  /// Read the schema version marker, if this tier keeps one.
  fn version_marker(&self) -> Result<Option<u32>> {
    Ok(None)
  }

  /// Persist the schema version marker.
  fn set_version_marker(&self, _version: u32) -> Result<()> {
    Ok(())
  }
}

/// Result from a cache operation, including data and metadata about the source.
#[derive(Debug, Clone)]
pub struct CacheResult<T> {
  /// The actual data
  pub data: T,
  /// Where the data came from
  pub source: CacheSource,
  /// When the data was cached (if from cache)
  pub cached_at: Option<DateTime<Utc>>,
}

impl<T> CacheResult<T> {
  /// Create a new cache result from fresh network data.
  pub fn from_network(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Network,
      cached_at: None,
    }
  }

  /// Create a new cache result from cached data.
  pub fn from_cache(data: T, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::Cache,
      cached_at: Some(cached_at),
    }
  }

  pub fn is_cached(&self) -> bool {
    self.source == CacheSource::Cache
  }

  /// Short "cached 3m ago" style label, or None for network data.
  pub fn age_label(&self, now: DateTime<Utc>) -> Option<String> {
    self.cached_at.map(|at| format!("cached {}", format_age(now - at)))
  }
}

/// Indicates where data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fresh data from network
  Network,
  /// Valid data served from the local cache
  Cache,
}

/// Render an age the way the cache indicator does: largest whole unit.
pub fn format_age(age: Duration) -> String {
  let days = age.num_days();
  let hours = age.num_hours();
  let minutes = age.num_minutes();

  if days > 0 {
    format!("{}d ago", days)
  } else if hours > 0 {
    format!("{}h ago", hours)
  } else if minutes > 0 {
    format!("{}m ago", minutes)
  } else {
    "just now".to_string()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_fresh_entry_is_valid() {
    let now = Utc::now();
    assert!(is_valid(now - Duration::hours(1), now, max_age()));
  }

  #[test]
  fn test_exact_max_age_is_expired() {
    let now = Utc::now();
    let cached_at = now - Duration::milliseconds(7 * 24 * 60 * 60 * 1000);
    assert!(!is_valid(cached_at, now, max_age()));
  }

  #[test]
  fn test_one_ms_before_max_age_is_valid() {
    let now = Utc::now();
    let cached_at = now - Duration::milliseconds(MAX_AGE_MS - 1);
    assert!(is_valid(cached_at, now, max_age()));
  }

  #[test]
  fn test_format_age() {
    assert_eq!(format_age(Duration::seconds(20)), "just now");
    assert_eq!(format_age(Duration::minutes(3)), "3m ago");
    assert_eq!(format_age(Duration::minutes(125)), "2h ago");
    assert_eq!(format_age(Duration::hours(50)), "2d ago");
  }

  #[test]
  fn test_age_label_only_for_cached_results() {
    let now = Utc::now();
    let network = CacheResult::from_network(1);
    assert_eq!(network.age_label(now), None);

    let cached = CacheResult::from_cache(1, now - Duration::minutes(5));
    assert!(cached.is_cached());
    assert_eq!(cached.age_label(now).as_deref(), Some("cached 5m ago"));
  }
}
