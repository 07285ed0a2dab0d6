//! Domain types shared by the gateway, the cache and the pollers.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Processing state of a single job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
  Queued,
  Processing,
  Completed,
  Failed,
}

impl JobStatus {
  /// No transitions happen after a terminal status.
  pub fn is_terminal(self) -> bool {
    matches!(self, JobStatus::Completed | JobStatus::Failed)
  }

  pub fn as_str(self) -> &'static str {
    match self {
      JobStatus::Queued => "queued",
      JobStatus::Processing => "processing",
      JobStatus::Completed => "completed",
      JobStatus::Failed => "failed",
    }
  }
}

/// One video's transcription request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
  pub id: String,
  pub status: JobStatus,
  /// Fraction done, 0.0 to 1.0
  pub progress: f64,
  pub message: String,
}

impl Job {
  /// Progress as a whole percentage.
  pub fn percent(&self) -> u8 {
    percent(self.progress)
  }
}

/// Round a 0.0-1.0 fraction to a 0-100 percentage.
pub fn percent(progress: f64) -> u8 {
  if progress.is_nan() {
    return 0;
  }
  (progress * 100.0).round().clamp(0.0, 100.0) as u8
}

/// Aggregate state of a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchStatus {
  Processing,
  Completed,
  Failed,
  /// Some videos succeeded and some failed
  Partial,
}

impl BatchStatus {
  pub fn is_terminal(self) -> bool {
    !matches!(self, BatchStatus::Processing)
  }

  pub fn as_str(self) -> &'static str {
    match self {
      BatchStatus::Processing => "processing",
      BatchStatus::Completed => "completed",
      BatchStatus::Failed => "failed",
      BatchStatus::Partial => "partial",
    }
  }
}

/// Video listed in a batch, preview or video page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoDescriptor {
  pub id: String,
  #[serde(default)]
  pub title: String,
  /// Seconds; unknown for some sources
  #[serde(default)]
  pub duration: Option<f64>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub url: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub upload_date: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub view_count: Option<u64>,
}

/// A set of jobs derived from a playlist or channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Batch {
  pub id: String,
  pub status: BatchStatus,
  pub progress: f64,
  pub total_videos: u32,
  pub completed: u32,
  pub failed: u32,
  pub message: String,
  pub videos: Vec<VideoDescriptor>,
}

impl Batch {
  pub fn percent(&self) -> u8 {
    percent(self.progress)
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptMetadata {
  #[serde(default)]
  pub title: String,
  #[serde(default)]
  pub url: String,
  #[serde(default)]
  pub duration: f64,
  #[serde(default)]
  pub num_speakers: u32,
}

/// One timestamped utterance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
  pub start: f64,
  pub end: f64,
  pub speaker: String,
  pub text: String,
}

/// Speaker-labeled transcript of one job. Segments are in playback order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transcript {
  pub metadata: TranscriptMetadata,
  pub segments: Vec<Segment>,
}

impl Transcript {
  /// Distinct speaker labels in order of first appearance.
  pub fn speakers(&self) -> Vec<String> {
    let mut speakers: Vec<String> = Vec::new();
    for segment in &self.segments {
      if !speakers.contains(&segment.speaker) {
        speakers.push(segment.speaker.clone());
      }
    }
    speakers
  }

  /// Relabel segments according to `mapping`; unmapped labels are kept.
  /// Segment order is untouched.
  pub fn rename_speakers(&mut self, mapping: &BTreeMap<String, String>) {
    for segment in &mut self.segments {
      if let Some(new_name) = mapping.get(&segment.speaker) {
        segment.speaker = new_name.clone();
      }
    }
  }
}

/// Optional processing settings sent with a submission.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessingOptions {
  pub diarization_enabled: Option<bool>,
  pub diarization_sensitivity: Option<f64>,
}

/// Which videos of a playlist or channel to process.
#[derive(Debug, Clone, PartialEq)]
pub enum BatchSelection {
  /// The first `n` videos
  Limit(u32),
  /// Explicitly chosen video ids
  Videos(Vec<String>),
}

/// First page of a playlist or channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchPreview {
  #[serde(rename = "type")]
  pub source_type: String,
  pub title: String,
  pub total_videos: u32,
  pub has_more: bool,
  pub preview_videos: Vec<VideoDescriptor>,
}

/// One page of a playlist or channel video listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoPage {
  pub videos: Vec<VideoDescriptor>,
  pub total_videos: u32,
  pub has_more: bool,
  #[serde(default)]
  pub title: String,
  #[serde(rename = "type", default)]
  pub source_type: String,
  #[serde(default)]
  pub uploader: Option<String>,
}

/// Transcript of one finished batch member.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchResult {
  pub job_id: String,
  pub video_title: String,
  pub video_url: String,
  pub transcript: Transcript,
}

/// Results of a finished batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchResults {
  pub status: BatchStatus,
  pub total_videos: u32,
  pub completed: u32,
  pub failed: u32,
  pub results: Vec<BatchResult>,
}

/// Downloaded export file.
#[derive(Debug, Clone, PartialEq)]
pub struct ExportedFile {
  pub filename: String,
  pub content_type: Option<String>,
  pub bytes: Vec<u8>,
}

#[cfg(test)]
mod tests {
  use super::*;

  fn segment(speaker: &str, start: f64) -> Segment {
    Segment {
      start,
      end: start + 1.0,
      speaker: speaker.to_string(),
      text: format!("line at {}", start),
    }
  }

  fn transcript() -> Transcript {
    Transcript {
      metadata: TranscriptMetadata {
        title: "Talk".to_string(),
        url: "https://youtube.com/watch?v=x".to_string(),
        duration: 10.0,
        num_speakers: 2,
      },
      segments: vec![segment("B", 0.0), segment("A", 1.0), segment("B", 2.0)],
    }
  }

  #[test]
  fn test_percent_rounds_and_clamps() {
    assert_eq!(percent(0.1), 10);
    assert_eq!(percent(0.456), 46);
    assert_eq!(percent(1.0), 100);
    assert_eq!(percent(1.7), 100);
    assert_eq!(percent(-0.2), 0);
    assert_eq!(percent(f64::NAN), 0);
  }

  #[test]
  fn test_terminal_statuses() {
    assert!(!JobStatus::Queued.is_terminal());
    assert!(!JobStatus::Processing.is_terminal());
    assert!(JobStatus::Completed.is_terminal());
    assert!(JobStatus::Failed.is_terminal());

    assert!(!BatchStatus::Processing.is_terminal());
    assert!(BatchStatus::Partial.is_terminal());
  }

  #[test]
  fn test_unknown_status_is_rejected() {
    assert!(serde_json::from_str::<JobStatus>("\"paused\"").is_err());
    assert_eq!(
      serde_json::from_str::<BatchStatus>("\"partial\"").unwrap(),
      BatchStatus::Partial
    );
  }

  #[test]
  fn test_speakers_in_first_appearance_order() {
    assert_eq!(transcript().speakers(), vec!["B", "A"]);
  }

  #[test]
  fn test_rename_keeps_order_and_unmapped_labels() {
    let mut t = transcript();
    let mapping = BTreeMap::from([("B".to_string(), "Bob".to_string())]);
    t.rename_speakers(&mapping);

    let labels: Vec<&str> = t.segments.iter().map(|s| s.speaker.as_str()).collect();
    assert_eq!(labels, vec!["Bob", "A", "Bob"]);
    let starts: Vec<f64> = t.segments.iter().map(|s| s.start).collect();
    assert_eq!(starts, vec![0.0, 1.0, 2.0]);
  }

  #[test]
  fn test_transcript_wire_shape() {
    let json = r#"{
      "metadata": {"title": "T", "duration": 61, "num_speakers": 2, "url": "u"},
      "segments": [{"start": 0, "end": 1.5, "speaker": "SPEAKER_00", "text": "hi"}],
      "plaintext": "ignored"
    }"#;
    let t: Transcript = serde_json::from_str(json).unwrap();
    assert_eq!(t.metadata.duration, 61.0);
    assert_eq!(t.segments[0].speaker, "SPEAKER_00");
  }
}
