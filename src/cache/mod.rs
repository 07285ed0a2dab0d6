//! Persistent two-tier cache for jobs, batches and transcripts.
//!
//! This module provides a service-agnostic caching mechanism that:
//! - Keeps small metadata (jobs, batches, settings) in synchronous key-value mappings
//! - Keeps large payloads (transcripts, batch results) in asynchronous record tables
//! - Applies one max-age rule to both tiers
//! - Wipes everything when the cache schema version changes

mod layer;
mod schema;
mod storage;
mod traits;

pub use layer::{CacheStore, MetadataCollection, ObjectStore};
pub use traits::CacheResult;

#[cfg(test)]
pub use storage::{KvTier, RecordTier};
