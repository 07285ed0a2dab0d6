use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use reqwest::header::{CONTENT_DISPOSITION, CONTENT_TYPE};
use reqwest::{RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::debug;
use url::Url;

use crate::config::ServiceConfig;

use super::api_types::{
  ApiBatchCreated, ApiBatchRequest, ApiBatchStatus, ApiErrorBody, ApiJobCreated, ApiJobStatus,
  ApiMergeRequest, ApiPreviewRequest, ApiProcessRequest, ApiRenameRequest, ApiVideoListRequest,
};
use super::error::ServiceError;
use super::types::{
  Batch, BatchPreview, BatchResults, BatchSelection, ExportedFile, Job, ProcessingOptions,
  Transcript, VideoPage,
};

/// One method per remote capability of the transcription service.
#[async_trait]
pub trait TranscriptService: Send + Sync {
  /// Submit a video; returns the new job id.
  async fn submit_job(&self, url: &str, options: &ProcessingOptions) -> Result<String, ServiceError>;

  async fn job_status(&self, job_id: &str) -> Result<Job, ServiceError>;

  async fn transcript(&self, job_id: &str) -> Result<Transcript, ServiceError>;

  async fn rename_speakers(
    &self,
    job_id: &str,
    mapping: &BTreeMap<String, String>,
  ) -> Result<(), ServiceError>;

  async fn merge_speakers(
    &self,
    job_id: &str,
    speakers: &[String],
    new_name: &str,
  ) -> Result<(), ServiceError>;

  /// Download a rendered export. `options` is sent JSON-encoded.
  async fn export_transcript(
    &self,
    job_id: &str,
    format: &str,
    options: Option<&Value>,
  ) -> Result<ExportedFile, ServiceError>;

  async fn batch_preview(&self, url: &str, limit: u32) -> Result<BatchPreview, ServiceError>;

  async fn video_list(&self, url: &str, offset: u32, limit: u32)
    -> Result<VideoPage, ServiceError>;

  /// Start a batch; returns the new batch id.
  async fn submit_batch(
    &self,
    url: &str,
    selection: &BatchSelection,
    options: &ProcessingOptions,
  ) -> Result<String, ServiceError>;

  async fn batch_status(&self, batch_id: &str) -> Result<Batch, ServiceError>;

  async fn batch_results(&self, batch_id: &str) -> Result<BatchResults, ServiceError>;
}

/// HTTP client for the TubeScript API.
#[derive(Clone)]
pub struct ServiceClient {
  http: reqwest::Client,
  base_url: Url,
}

impl ServiceClient {
  pub fn new(config: &ServiceConfig) -> Result<Self> {
    let mut base_url = Url::parse(config.base_url.trim())
      .map_err(|e| eyre!("Invalid service URL {}: {}", config.base_url, e))?;
    if base_url.cannot_be_a_base() {
      return Err(eyre!("Invalid service URL {}", config.base_url));
    }
    if !base_url.path().ends_with('/') {
      let path = format!("{}/", base_url.path());
      base_url.set_path(&path);
    }

    let http = reqwest::Client::builder()
      .timeout(Duration::from_secs(config.timeout_secs))
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self { http, base_url })
  }

  /// Build an endpoint URL from path segments; segments are percent-encoded.
  fn endpoint(&self, segments: &[&str]) -> Result<Url, ServiceError> {
    let mut url = self.base_url.clone();
    url
      .path_segments_mut()
      .map_err(|_| ServiceError::Transport("Invalid service URL".to_string()))?
      .pop_if_empty()
      .extend(segments);
    Ok(url)
  }

  async fn send(&self, request: RequestBuilder, fallback: &str) -> Result<Response, ServiceError> {
    let response = request
      .send()
      .await
      .map_err(|e| ServiceError::Transport(format!("{}: {}", fallback, e)))?;

    let status = response.status();
    if !status.is_success() {
      let body = response.bytes().await.unwrap_or_default();
      return Err(ServiceError::from_response(status.as_u16(), &body, fallback));
    }

    Ok(response)
  }

  async fn decode<T: DeserializeOwned>(response: Response, fallback: &str) -> Result<T, ServiceError> {
    let body = response
      .bytes()
      .await
      .map_err(|e| ServiceError::Transport(format!("{}: {}", fallback, e)))?;

    serde_json::from_slice(&body)
      .map_err(|e| ServiceError::Decode(format!("{}: unexpected response ({})", fallback, e)))
  }

  async fn get_json<T: DeserializeOwned>(&self, segments: &[&str], fallback: &str) -> Result<T, ServiceError> {
    let url = self.endpoint(segments)?;
    debug!("GET {}", url);
    let response = self.send(self.http.get(url), fallback).await?;
    Self::decode(response, fallback).await
  }

  async fn post_json<B: Serialize + ?Sized, T: DeserializeOwned>(
    &self,
    segments: &[&str],
    body: &B,
    fallback: &str,
  ) -> Result<T, ServiceError> {
    let url = self.endpoint(segments)?;
    debug!("POST {}", url);
    let response = self.send(self.http.post(url).json(body), fallback).await?;
    Self::decode(response, fallback).await
  }
}

#[async_trait]
impl TranscriptService for ServiceClient {
  async fn submit_job(&self, url: &str, options: &ProcessingOptions) -> Result<String, ServiceError> {
    let created: ApiJobCreated = self
      .post_json(
        &["api", "process"],
        &ApiProcessRequest::new(url, options),
        "Failed to process video",
      )
      .await?;
    Ok(created.job_id)
  }

  async fn job_status(&self, job_id: &str) -> Result<Job, ServiceError> {
    let status: ApiJobStatus = self
      .get_json(&["api", "status", job_id], "Failed to get job status")
      .await?;
    Ok(status.into_job(job_id))
  }

  async fn transcript(&self, job_id: &str) -> Result<Transcript, ServiceError> {
    self
      .get_json(&["api", "transcript", job_id], "Failed to fetch transcript")
      .await
  }

  async fn rename_speakers(
    &self,
    job_id: &str,
    mapping: &BTreeMap<String, String>,
  ) -> Result<(), ServiceError> {
    let _: Value = self
      .post_json(
        &["api", "rename", job_id],
        &ApiRenameRequest {
          speaker_mapping: mapping,
        },
        "Failed to rename speakers",
      )
      .await?;
    Ok(())
  }

  async fn merge_speakers(
    &self,
    job_id: &str,
    speakers: &[String],
    new_name: &str,
  ) -> Result<(), ServiceError> {
    let _: Value = self
      .post_json(
        &["api", "merge", job_id],
        &ApiMergeRequest {
          speakers_to_merge: speakers,
          new_name,
        },
        "Failed to merge speakers",
      )
      .await?;
    Ok(())
  }

  async fn export_transcript(
    &self,
    job_id: &str,
    format: &str,
    options: Option<&Value>,
  ) -> Result<ExportedFile, ServiceError> {
    let fallback = format!("Failed to export as {}", format);
    let mut url = self.endpoint(&["api", "export", job_id])?;
    {
      let mut query = url.query_pairs_mut();
      query.append_pair("format", format);
      if let Some(options) = options {
        query.append_pair("options", &options.to_string());
      }
    }

    debug!("GET {}", url);
    let response = self
      .http
      .get(url)
      .send()
      .await
      .map_err(|e| ServiceError::Transport(format!("{}: {}", fallback, e)))?;

    let status = response.status().as_u16();
    let header = |name: reqwest::header::HeaderName| {
      response
        .headers()
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(String::from)
    };
    let content_type = header(CONTENT_TYPE);
    let disposition = header(CONTENT_DISPOSITION);

    let body = response
      .bytes()
      .await
      .map_err(|e| ServiceError::Transport(format!("{}: {}", fallback, e)))?;

    interpret_export(
      format,
      status,
      content_type.as_deref(),
      disposition.as_deref(),
      body.to_vec(),
    )
  }

  async fn batch_preview(&self, url: &str, limit: u32) -> Result<BatchPreview, ServiceError> {
    self
      .post_json(
        &["api", "batch-preview"],
        &ApiPreviewRequest { url, limit },
        "Failed to load preview",
      )
      .await
  }

  async fn video_list(
    &self,
    url: &str,
    offset: u32,
    limit: u32,
  ) -> Result<VideoPage, ServiceError> {
    self
      .post_json(
        &["api", "video-list"],
        &ApiVideoListRequest { url, offset, limit },
        "Failed to load videos",
      )
      .await
  }

  async fn submit_batch(
    &self,
    url: &str,
    selection: &BatchSelection,
    options: &ProcessingOptions,
  ) -> Result<String, ServiceError> {
    let created: ApiBatchCreated = self
      .post_json(
        &["api", "batch-process"],
        &ApiBatchRequest::new(url, selection, options),
        "Failed to start batch processing",
      )
      .await?;
    Ok(created.batch_id)
  }

  async fn batch_status(&self, batch_id: &str) -> Result<Batch, ServiceError> {
    let status: ApiBatchStatus = self
      .get_json(&["api", "batch-status", batch_id], "Failed to get batch status")
      .await?;
    Ok(status.into_batch(batch_id))
  }

  async fn batch_results(&self, batch_id: &str) -> Result<BatchResults, ServiceError> {
    self
      .get_json(&["api", "batch-results", batch_id], "Failed to get batch results")
      .await
  }
}

/// Decide whether an export response is a file or an error.
///
/// A JSON body carrying a message is the service refusing the export, even
/// with a success status; anything else is the file itself.
pub fn interpret_export(
  format: &str,
  status: u16,
  content_type: Option<&str>,
  disposition: Option<&str>,
  body: Vec<u8>,
) -> Result<ExportedFile, ServiceError> {
  let fallback = format!("Failed to export as {}", format);

  if !(200..300).contains(&status) {
    return Err(ServiceError::from_response(status, &body, &fallback));
  }

  let is_json = content_type
    .map(|ct| ct.to_ascii_lowercase().contains("application/json"))
    .unwrap_or(false);
  if is_json {
    let parsed: ApiErrorBody = serde_json::from_slice(&body)
      .map_err(|e| ServiceError::Decode(format!("{}: unexpected response ({})", fallback, e)))?;
    if let Some(message) = parsed.into_message() {
      return Err(ServiceError::Server { status, message });
    }
  }

  let filename = disposition
    .and_then(filename_from_disposition)
    .unwrap_or_else(|| format!("transcript.{}", format));

  Ok(ExportedFile {
    filename,
    content_type: content_type.map(String::from),
    bytes: body,
  })
}

/// Extract the `filename` parameter of a Content-Disposition header.
pub fn filename_from_disposition(disposition: &str) -> Option<String> {
  let start = disposition.find("filename")?;
  let rest = &disposition[start + "filename".len()..];

  // Skip to '=' without crossing into the next parameter
  let eq = rest.find('=')?;
  if rest[..eq].contains(|c| c == ';' || c == '\n') {
    return None;
  }
  let value = rest[eq + 1..].trim_start();

  let raw = match value.chars().next() {
    Some(quote @ ('"' | '\'')) => {
      let inner = &value[1..];
      match inner.find(quote) {
        Some(end) => &inner[..end],
        None => inner,
      }
    }
    _ => value.split(|c| c == ';' || c == '\n').next().unwrap_or(""),
  };

  let filename: String = raw.chars().filter(|c| *c != '"' && *c != '\'').collect();
  let filename = filename.trim();
  if filename.is_empty() {
    None
  } else {
    Some(filename.to_string())
  }
}
