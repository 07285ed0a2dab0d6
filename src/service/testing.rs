//! In-process stand-in for the remote service, used by unit tests.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};

use crate::cache::{CacheStore, KvTier, RecordTier};

use super::client::TranscriptService;
use super::error::ServiceError;
use super::types::{
  Batch, BatchPreview, BatchResults, BatchSelection, BatchStatus, ExportedFile, Job, JobStatus,
  ProcessingOptions, Segment, Transcript, TranscriptMetadata, VideoPage,
};

pub fn memory_store() -> CacheStore {
  CacheStore::new(
    Arc::new(KvTier::open_in_memory().unwrap()),
    Arc::new(RecordTier::open_in_memory().unwrap()),
  )
}

pub fn job(id: &str, status: JobStatus, progress: f64) -> Job {
  Job {
    id: id.to_string(),
    status,
    progress,
    message: format!("{} {}", status.as_str(), progress),
  }
}

pub fn batch(id: &str, status: BatchStatus, completed: u32) -> Batch {
  Batch {
    id: id.to_string(),
    status,
    progress: completed as f64 / 3.0,
    total_videos: 3,
    completed,
    failed: 0,
    message: format!("{} of 3 done", completed),
    videos: Vec::new(),
  }
}

pub fn transcript(speakers: &[&str]) -> Transcript {
  Transcript {
    metadata: TranscriptMetadata {
      title: "Interview".to_string(),
      url: "https://www.youtube.com/watch?v=abc".to_string(),
      duration: 30.0,
      num_speakers: 2,
    },
    segments: speakers
      .iter()
      .enumerate()
      .map(|(i, speaker)| Segment {
        start: i as f64 * 2.0,
        end: i as f64 * 2.0 + 1.5,
        speaker: speaker.to_string(),
        text: format!("utterance {}", i),
      })
      .collect(),
  }
}

/// Scripted service. Status calls pop from their queues; every call is
/// recorded by name so tests can assert on network traffic.
#[derive(Default)]
pub struct MockService {
  pub job_statuses: Mutex<VecDeque<Result<Job, ServiceError>>>,
  pub batch_statuses: Mutex<VecDeque<Result<Batch, ServiceError>>>,
  pub transcript: Mutex<Option<Transcript>>,
  pub batch_results: Mutex<Option<BatchResults>>,
  pub export_failures: Mutex<Vec<String>>,
  pub calls: Mutex<Vec<String>>,
}

impl MockService {
  pub fn with_transcript(transcript: Transcript) -> Self {
    let service = Self::default();
    *service.transcript.lock().unwrap() = Some(transcript);
    service
  }

  pub fn push_job(&self, status: Result<Job, ServiceError>) {
    self.job_statuses.lock().unwrap().push_back(status);
  }

  pub fn push_batch(&self, status: Result<Batch, ServiceError>) {
    self.batch_statuses.lock().unwrap().push_back(status);
  }

  /// Number of recorded calls of the given operation.
  pub fn count(&self, operation: &str) -> usize {
    self
      .calls
      .lock()
      .unwrap()
      .iter()
      .filter(|call| call.as_str() == operation)
      .count()
  }

  pub fn calls(&self) -> Vec<String> {
    self.calls.lock().unwrap().clone()
  }

  fn record(&self, operation: &str) {
    self.calls.lock().unwrap().push(operation.to_string());
  }
}

fn exhausted(what: &str) -> ServiceError {
  ServiceError::Transport(format!("no scripted {} left", what))
}

#[async_trait]
impl TranscriptService for MockService {
  async fn submit_job(&self, _url: &str, _options: &ProcessingOptions) -> Result<String, ServiceError> {
    self.record("submit_job");
    Ok("job-new".to_string())
  }

  async fn job_status(&self, _job_id: &str) -> Result<Job, ServiceError> {
    self.record("job_status");
    self
      .job_statuses
      .lock()
      .unwrap()
      .pop_front()
      .unwrap_or_else(|| Err(exhausted("job status")))
  }

  async fn transcript(&self, _job_id: &str) -> Result<Transcript, ServiceError> {
    self.record("transcript");
    self
      .transcript
      .lock()
      .unwrap()
      .clone()
      .ok_or_else(|| ServiceError::Server {
        status: 400,
        message: "Transcript not ready yet".to_string(),
      })
  }

  async fn rename_speakers(
    &self,
    _job_id: &str,
    mapping: &BTreeMap<String, String>,
  ) -> Result<(), ServiceError> {
    self.record("rename_speakers");
    if let Some(transcript) = self.transcript.lock().unwrap().as_mut() {
      transcript.rename_speakers(mapping);
    }
    Ok(())
  }

  async fn merge_speakers(
    &self,
    _job_id: &str,
    speakers: &[String],
    new_name: &str,
  ) -> Result<(), ServiceError> {
    self.record("merge_speakers");
    if let Some(transcript) = self.transcript.lock().unwrap().as_mut() {
      for segment in &mut transcript.segments {
        if speakers.contains(&segment.speaker) {
          segment.speaker = new_name.to_string();
        }
      }
      transcript.metadata.num_speakers = transcript.speakers().len() as u32;
    }
    Ok(())
  }

  async fn export_transcript(
    &self,
    job_id: &str,
    format: &str,
    _options: Option<&Value>,
  ) -> Result<ExportedFile, ServiceError> {
    self.record("export_transcript");
    if self.export_failures.lock().unwrap().iter().any(|id| id == job_id) {
      return Err(ServiceError::Server {
        status: 400,
        message: "Transcript not ready yet".to_string(),
      });
    }
    Ok(ExportedFile {
      filename: format!("{}.{}", job_id, format),
      content_type: Some("text/plain".to_string()),
      bytes: job_id.as_bytes().to_vec(),
    })
  }

  async fn batch_preview(&self, _url: &str, limit: u32) -> Result<BatchPreview, ServiceError> {
    self.record("batch_preview");
    Ok(BatchPreview {
      source_type: "playlist".to_string(),
      title: "Playlist".to_string(),
      total_videos: 12,
      has_more: limit < 12,
      preview_videos: Vec::new(),
    })
  }

  async fn video_list(&self, _url: &str, offset: u32, _limit: u32) -> Result<VideoPage, ServiceError> {
    self.record("video_list");
    Ok(VideoPage {
      videos: Vec::new(),
      total_videos: 12,
      has_more: offset < 12,
      title: "Playlist".to_string(),
      source_type: "playlist".to_string(),
      uploader: None,
    })
  }

  async fn submit_batch(
    &self,
    _url: &str,
    _selection: &BatchSelection,
    _options: &ProcessingOptions,
  ) -> Result<String, ServiceError> {
    self.record("submit_batch");
    Ok("batch-new".to_string())
  }

  async fn batch_status(&self, _batch_id: &str) -> Result<Batch, ServiceError> {
    self.record("batch_status");
    self
      .batch_statuses
      .lock()
      .unwrap()
      .pop_front()
      .unwrap_or_else(|| Err(exhausted("batch status")))
  }

  async fn batch_results(&self, _batch_id: &str) -> Result<BatchResults, ServiceError> {
    self.record("batch_results");
    self
      .batch_results
      .lock()
      .unwrap()
      .clone()
      .ok_or_else(|| exhausted("batch results"))
  }
}
