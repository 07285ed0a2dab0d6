//! Serde types matching the TubeScript HTTP API.
//!
//! These types are separate from domain types so that identifiers which only
//! appear in the URL (job id, batch id) are attached in one place.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::types::{Batch, BatchSelection, BatchStatus, Job, JobStatus, ProcessingOptions, VideoDescriptor};

// ============================================================================
// Requests
// ============================================================================

#[derive(Debug, Serialize)]
pub struct ApiProcessRequest<'a> {
  pub url: &'a str,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub diarization_enabled: Option<bool>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub diarization_sensitivity: Option<f64>,
}

impl<'a> ApiProcessRequest<'a> {
  pub fn new(url: &'a str, options: &ProcessingOptions) -> Self {
    Self {
      url,
      diarization_enabled: options.diarization_enabled,
      diarization_sensitivity: options.diarization_sensitivity,
    }
  }
}

#[derive(Debug, Serialize)]
pub struct ApiRenameRequest<'a> {
  pub speaker_mapping: &'a BTreeMap<String, String>,
}

#[derive(Debug, Serialize)]
pub struct ApiMergeRequest<'a> {
  pub speakers_to_merge: &'a [String],
  pub new_name: &'a str,
}

#[derive(Debug, Serialize)]
pub struct ApiPreviewRequest<'a> {
  pub url: &'a str,
  pub limit: u32,
}

#[derive(Debug, Serialize)]
pub struct ApiVideoListRequest<'a> {
  pub url: &'a str,
  pub offset: u32,
  pub limit: u32,
}

#[derive(Debug, Serialize)]
pub struct ApiBatchRequest<'a> {
  pub url: &'a str,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub limit: Option<u32>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub selected_videos: Option<&'a [String]>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub diarization_enabled: Option<bool>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub diarization_sensitivity: Option<f64>,
}

impl<'a> ApiBatchRequest<'a> {
  pub fn new(url: &'a str, selection: &'a BatchSelection, options: &ProcessingOptions) -> Self {
    let (limit, selected_videos) = match selection {
      BatchSelection::Limit(n) => (Some(*n), None),
      BatchSelection::Videos(ids) => (None, Some(ids.as_slice())),
    };

    Self {
      url,
      limit,
      selected_videos,
      diarization_enabled: options.diarization_enabled,
      diarization_sensitivity: options.diarization_sensitivity,
    }
  }
}

// ============================================================================
// Responses
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct ApiJobCreated {
  pub job_id: String,
}

#[derive(Debug, Deserialize)]
pub struct ApiBatchCreated {
  pub batch_id: String,
}

#[derive(Debug, Deserialize)]
pub struct ApiJobStatus {
  pub status: JobStatus,
  #[serde(default)]
  pub progress: f64,
  #[serde(default)]
  pub message: String,
}

impl ApiJobStatus {
  pub fn into_job(self, id: &str) -> Job {
    Job {
      id: id.to_string(),
      status: self.status,
      progress: self.progress,
      message: self.message,
    }
  }
}

#[derive(Debug, Deserialize)]
pub struct ApiBatchStatus {
  pub status: BatchStatus,
  #[serde(default)]
  pub progress: f64,
  #[serde(default)]
  pub completed: u32,
  #[serde(default)]
  pub failed: u32,
  #[serde(default)]
  pub total_videos: u32,
  #[serde(default)]
  pub message: String,
  #[serde(default)]
  pub videos: Vec<VideoDescriptor>,
}

impl ApiBatchStatus {
  pub fn into_batch(self, id: &str) -> Batch {
    Batch {
      id: id.to_string(),
      status: self.status,
      progress: self.progress,
      total_videos: self.total_videos,
      completed: self.completed,
      failed: self.failed,
      message: self.message,
      videos: self.videos,
    }
  }
}

/// Structured error body. FastAPI reports `detail` as a string, or as a list
/// of validation problems each carrying a `msg`.
#[derive(Debug, Deserialize)]
pub struct ApiErrorBody {
  pub detail: Option<ApiErrorDetail>,
  pub message: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum ApiErrorDetail {
  Text(String),
  Items(Vec<ApiErrorItem>),
  Other(serde_json::Value),
}

#[derive(Debug, Deserialize)]
pub struct ApiErrorItem {
  pub msg: Option<String>,
}

impl ApiErrorBody {
  /// The most specific human-readable message in the body, if any.
  pub fn into_message(self) -> Option<String> {
    let detail = match self.detail {
      Some(ApiErrorDetail::Text(text)) => Some(text),
      Some(ApiErrorDetail::Items(items)) => items.into_iter().find_map(|item| item.msg),
      Some(ApiErrorDetail::Other(_)) | None => None,
    };

    detail
      .or(self.message)
      .filter(|message| !message.trim().is_empty())
  }
}
