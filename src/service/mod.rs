//! Remote transcription service: HTTP gateway, typed models and the
//! cache-aware client built on top of them.

pub mod api_types;
pub mod cached_client;
pub mod client;
pub mod error;
pub mod types;

#[cfg(test)]
pub mod testing;

pub use cached_client::CachedClient;
pub use client::{ServiceClient, TranscriptService};
pub use error::ServiceError;
