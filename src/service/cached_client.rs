//! Transcription client with transparent caching.

use futures::{stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};
use url::Url;

use crate::cache::{CacheResult, CacheStore, MetadataCollection, ObjectStore};

use super::client::TranscriptService;
use super::error::ServiceError;
use super::types::{
  Batch, BatchPreview, BatchResult, BatchResults, BatchSelection, BatchStatus, ExportedFile, Job,
  JobStatus, ProcessingOptions, Transcript, VideoPage,
};

/// Setting key for the default diarization toggle.
pub const SETTING_DIARIZATION_ENABLED: &str = "diarization_enabled";
/// Setting key for the default diarization sensitivity.
pub const SETTING_DIARIZATION_SENSITIVITY: &str = "diarization_sensitivity";

/// How many exports run at once when exporting a whole batch.
const EXPORT_CONCURRENCY: usize = 4;

/// Outcome of exporting one batch member.
#[derive(Debug)]
pub struct BatchExport {
  pub job_id: String,
  pub video_title: String,
  pub result: Result<ExportedFile, ServiceError>,
}

/// Transcription client with transparent caching support.
///
/// This wraps a [`TranscriptService`] and provides the same operations,
/// serving finished jobs, batches and transcripts from the cache and keeping
/// cached transcripts consistent after speaker edits.
pub struct CachedClient<S> {
  inner: Arc<S>,
  cache: CacheStore,
}

impl<S> Clone for CachedClient<S> {
  fn clone(&self) -> Self {
    Self {
      inner: Arc::clone(&self.inner),
      cache: self.cache.clone(),
    }
  }
}

/// Reject empty or non-http(s) URLs before any request is made.
fn validate_url(url: &str) -> Result<&str, ServiceError> {
  let url = url.trim();
  if url.is_empty() {
    return Err(ServiceError::validation("Please enter a video URL"));
  }

  match Url::parse(url) {
    Ok(parsed) if matches!(parsed.scheme(), "http" | "https") => Ok(url),
    _ => Err(ServiceError::validation(format!("Invalid URL: {}", url))),
  }
}

/// Batch results as stored in the `batches` object store. Member
/// transcripts live only in the `transcripts` store, so speaker edits on a
/// member are visible through the batch without touching this record.
#[derive(Debug, Serialize, Deserialize)]
struct StoredBatchResults {
  status: BatchStatus,
  total_videos: u32,
  completed: u32,
  failed: u32,
  members: Vec<StoredBatchMember>,
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredBatchMember {
  job_id: String,
  video_title: String,
  video_url: String,
}

impl StoredBatchResults {
  fn from_results(results: &BatchResults) -> Self {
    Self {
      status: results.status,
      total_videos: results.total_videos,
      completed: results.completed,
      failed: results.failed,
      members: results
        .results
        .iter()
        .map(|result| StoredBatchMember {
          job_id: result.job_id.clone(),
          video_title: result.video_title.clone(),
          video_url: result.video_url.clone(),
        })
        .collect(),
    }
  }
}

fn transcript_extra(transcript: &Transcript) -> Value {
  json!({
    "url": transcript.metadata.url,
    "title": transcript.metadata.title,
  })
}

impl<S: TranscriptService> CachedClient<S> {
  pub fn new(inner: S, cache: CacheStore) -> Self {
    Self {
      inner: Arc::new(inner),
      cache,
    }
  }

  pub fn cache(&self) -> &CacheStore {
    &self.cache
  }

  #[cfg(test)]
  pub fn service(&self) -> &S {
    &self.inner
  }

  /// Processing options with unset fields filled from stored settings.
  pub fn processing_options(&self, explicit: &ProcessingOptions) -> ProcessingOptions {
    ProcessingOptions {
      diarization_enabled: explicit
        .diarization_enabled
        .or_else(|| self.cache.setting(SETTING_DIARIZATION_ENABLED)),
      diarization_sensitivity: explicit
        .diarization_sensitivity
        .or_else(|| self.cache.setting(SETTING_DIARIZATION_SENSITIVITY)),
    }
  }

  // ==========================================================================
  // Jobs
  // ==========================================================================

  /// Submit a video and cache the new job as queued.
  pub async fn submit_job(&self, url: &str, options: &ProcessingOptions) -> Result<Job, ServiceError> {
    let url = validate_url(url)?;
    let job_id = self.inner.submit_job(url, options).await?;

    let job = Job {
      id: job_id,
      status: JobStatus::Queued,
      progress: 0.0,
      message: "Job queued for processing".to_string(),
    };
    self.cache.put_metadata(MetadataCollection::Jobs, &job.id, &job);
    info!("Submitted job {} for {}", job.id, url);

    Ok(job)
  }

  /// Job status; cached only once the job reached a terminal state.
  pub async fn job_status(&self, job_id: &str) -> Result<CacheResult<Job>, ServiceError> {
    if let Some(cached) = self.cache.get_metadata::<Job>(MetadataCollection::Jobs, job_id) {
      if cached.payload.status.is_terminal() {
        debug!("Serving cached job {}", job_id);
        return Ok(CacheResult::from_cache(cached.payload, cached.cached_at));
      }
    }

    let job = self.inner.job_status(job_id).await?;
    self.cache.put_metadata(MetadataCollection::Jobs, job_id, &job);
    Ok(CacheResult::from_network(job))
  }

  /// Transcript of a job; any valid cached copy is served.
  pub async fn transcript(&self, job_id: &str) -> Result<CacheResult<Transcript>, ServiceError> {
    if let Some(cached) = self
      .cache
      .get_large_object::<Transcript>(ObjectStore::Transcripts, job_id)
      .await
    {
      debug!("Serving cached transcript {}", job_id);
      return Ok(CacheResult::from_cache(cached.payload, cached.cached_at));
    }

    let transcript = self.inner.transcript(job_id).await?;
    self.cache_transcript(job_id, &transcript).await;
    Ok(CacheResult::from_network(transcript))
  }

  async fn cache_transcript(&self, job_id: &str, transcript: &Transcript) {
    self
      .cache
      .put_large_object(
        ObjectStore::Transcripts,
        job_id,
        transcript,
        transcript_extra(transcript),
      )
      .await;
  }

  /// Rename speakers on the server and in the cached transcript.
  ///
  /// Target names are trimmed and identity pairs dropped. When nothing
  /// changes the rename endpoint is not called and the current transcript is
  /// returned (from cache when present). Resolves only after the updated
  /// transcript is cached.
  pub async fn rename_speakers(
    &self,
    job_id: &str,
    mapping: &BTreeMap<String, String>,
  ) -> Result<Transcript, ServiceError> {
    let changes: BTreeMap<String, String> = mapping
      .iter()
      .map(|(old, new)| (old.clone(), new.trim().to_string()))
      .filter(|(old, new)| old != new)
      .collect();

    if changes.values().any(String::is_empty) {
      return Err(ServiceError::validation("Speaker names cannot be empty"));
    }
    if changes.is_empty() {
      return Ok(self.transcript(job_id).await?.data);
    }

    self.inner.rename_speakers(job_id, &changes).await?;

    let updated = match self
      .cache
      .get_large_object::<Transcript>(ObjectStore::Transcripts, job_id)
      .await
    {
      Some(cached) => {
        let mut transcript = cached.payload;
        transcript.rename_speakers(&changes);
        transcript
      }
      None => self.inner.transcript(job_id).await?,
    };

    self.cache_transcript(job_id, &updated).await;
    info!("Renamed {} speaker(s) in job {}", changes.len(), job_id);
    Ok(updated)
  }

  /// Merge speakers into one on the server, then re-fetch and re-cache the
  /// transcript. Needs at least two distinct speakers and a non-blank name.
  pub async fn merge_speakers(
    &self,
    job_id: &str,
    speakers: &[String],
    new_name: &str,
  ) -> Result<Transcript, ServiceError> {
    let mut selected: Vec<String> = Vec::new();
    for speaker in speakers.iter().map(|s| s.trim()).filter(|s| !s.is_empty()) {
      if !selected.iter().any(|s| s == speaker) {
        selected.push(speaker.to_string());
      }
    }

    if selected.len() < 2 {
      return Err(ServiceError::validation(
        "Select at least two speakers to merge",
      ));
    }
    let new_name = new_name.trim();
    if new_name.is_empty() {
      return Err(ServiceError::validation(
        "Enter a name for the merged speaker",
      ));
    }

    self.inner.merge_speakers(job_id, &selected, new_name).await?;

    let updated = self.inner.transcript(job_id).await?;
    self.cache_transcript(job_id, &updated).await;
    info!("Merged {} speakers into {} in job {}", selected.len(), new_name, job_id);
    Ok(updated)
  }

  /// Download a rendered export (not cached).
  pub async fn export_transcript(
    &self,
    job_id: &str,
    format: &str,
    options: Option<&Value>,
  ) -> Result<ExportedFile, ServiceError> {
    if format.trim().is_empty() {
      return Err(ServiceError::validation("Choose an export format"));
    }
    self.inner.export_transcript(job_id, format, options).await
  }

  // ==========================================================================
  // Batches
  // ==========================================================================

  pub async fn batch_preview(&self, url: &str, limit: u32) -> Result<BatchPreview, ServiceError> {
    let url = validate_url(url)?;
    self.inner.batch_preview(url, limit).await
  }

  pub async fn video_list(
    &self,
    url: &str,
    offset: u32,
    limit: u32,
  ) -> Result<VideoPage, ServiceError> {
    let url = validate_url(url)?;
    self.inner.video_list(url, offset, limit).await
  }

  /// Start a batch and cache it as processing.
  pub async fn submit_batch(
    &self,
    url: &str,
    selection: &BatchSelection,
    options: &ProcessingOptions,
  ) -> Result<Batch, ServiceError> {
    let url = validate_url(url)?;
    match selection {
      BatchSelection::Limit(0) => {
        return Err(ServiceError::validation("Process at least one video"))
      }
      BatchSelection::Videos(ids) if ids.is_empty() => {
        return Err(ServiceError::validation("Select at least one video"))
      }
      _ => {}
    }

    let batch_id = self.inner.submit_batch(url, selection, options).await?;

    let batch = Batch {
      id: batch_id,
      status: BatchStatus::Processing,
      progress: 0.0,
      total_videos: match selection {
        BatchSelection::Limit(n) => *n,
        BatchSelection::Videos(ids) => ids.len() as u32,
      },
      completed: 0,
      failed: 0,
      message: "Batch queued for processing".to_string(),
      videos: Vec::new(),
    };
    self.cache.put_metadata(MetadataCollection::Batches, &batch.id, &batch);
    info!("Submitted batch {} for {}", batch.id, url);

    Ok(batch)
  }

  /// Batch status; cached only once the batch reached a terminal state.
  pub async fn batch_status(&self, batch_id: &str) -> Result<CacheResult<Batch>, ServiceError> {
    if let Some(cached) = self
      .cache
      .get_metadata::<Batch>(MetadataCollection::Batches, batch_id)
    {
      if cached.payload.status.is_terminal() {
        debug!("Serving cached batch {}", batch_id);
        return Ok(CacheResult::from_cache(cached.payload, cached.cached_at));
      }
    }

    let batch = self.inner.batch_status(batch_id).await?;
    self
      .cache
      .put_metadata(MetadataCollection::Batches, batch_id, &batch);
    Ok(CacheResult::from_network(batch))
  }

  /// Batch results; fetched results also populate the transcript cache for
  /// every member job.
  ///
  /// Cached results are reassembled from the member transcripts, so they
  /// reflect later renames and merges. A missing member counts as a miss.
  pub async fn batch_results(
    &self,
    batch_id: &str,
  ) -> Result<CacheResult<BatchResults>, ServiceError> {
    if let Some(cached) = self.cached_batch_results(batch_id).await {
      debug!("Serving cached batch results {}", batch_id);
      return Ok(cached);
    }

    let results = self.inner.batch_results(batch_id).await?;

    for result in &results.results {
      self
        .cache
        .put_large_object(
          ObjectStore::Transcripts,
          &result.job_id,
          &result.transcript,
          json!({ "url": result.video_url, "title": result.video_title }),
        )
        .await;
    }
    self
      .cache
      .put_large_object(
        ObjectStore::Batches,
        batch_id,
        &StoredBatchResults::from_results(&results),
        Value::Null,
      )
      .await;

    Ok(CacheResult::from_network(results))
  }

  async fn cached_batch_results(&self, batch_id: &str) -> Option<CacheResult<BatchResults>> {
    let stored = self
      .cache
      .get_large_object::<StoredBatchResults>(ObjectStore::Batches, batch_id)
      .await?;
    let index = stored.payload;

    let mut results = Vec::with_capacity(index.members.len());
    for member in index.members {
      let Some(transcript) = self
        .cache
        .get_large_object::<Transcript>(ObjectStore::Transcripts, &member.job_id)
        .await
      else {
        debug!("Cached batch {} lacks transcript {}", batch_id, member.job_id);
        return None;
      };

      results.push(BatchResult {
        job_id: member.job_id,
        video_title: member.video_title,
        video_url: member.video_url,
        transcript: transcript.payload,
      });
    }

    let results = BatchResults {
      status: index.status,
      total_videos: index.total_videos,
      completed: index.completed,
      failed: index.failed,
      results,
    };
    Some(CacheResult::from_cache(results, stored.cached_at))
  }

  /// Export the results of a batch, limited to `job_ids` unless it is
  /// empty. Individual failures are reported per video and do not stop the
  /// others.
  pub async fn export_batch(
    &self,
    batch_id: &str,
    format: &str,
    options: Option<&Value>,
    job_ids: &[String],
  ) -> Result<Vec<BatchExport>, ServiceError> {
    let results = self.batch_results(batch_id).await?.data.results;

    if let Some(unknown) = job_ids
      .iter()
      .find(|id| !results.iter().any(|result| &result.job_id == *id))
    {
      return Err(ServiceError::validation(format!(
        "Job {} is not part of batch {}",
        unknown, batch_id
      )));
    }

    let selected: Vec<BatchResult> = results
      .into_iter()
      .filter(|result| job_ids.is_empty() || job_ids.contains(&result.job_id))
      .collect();

    let exports = stream::iter(selected)
      .map(|result| async move {
        let exported = self
          .export_transcript(&result.job_id, format, options)
          .await;
        BatchExport {
          job_id: result.job_id,
          video_title: result.video_title,
          result: exported,
        }
      })
      .buffered(EXPORT_CONCURRENCY)
      .collect()
      .await;

    Ok(exports)
  }
}
