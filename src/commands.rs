//! Subcommands and their handlers.

use chrono::Utc;
use clap::Subcommand;
use color_eyre::{eyre::eyre, Result};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::cache::CacheResult;
use crate::config::Config;
use crate::event::{BatchEvent, JobEvent};
use crate::poller::{BatchPoller, JobPoller};
use crate::service::types::{Batch, BatchSelection, ProcessingOptions, Transcript, VideoDescriptor};
use crate::service::{CachedClient, ServiceClient};

/// Shared options for commands that start processing.
#[derive(Debug, Clone, clap::Args)]
pub struct ProcessingArgs {
  /// Disable speaker diarization
  #[arg(long)]
  pub no_diarization: bool,

  /// Diarization sensitivity (0.0 - 1.0)
  #[arg(long)]
  pub sensitivity: Option<f64>,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
  /// Transcribe a single video and wait for the result
  Process {
    url: String,
    #[command(flatten)]
    processing: ProcessingArgs,
    /// Print the transcript as JSON
    #[arg(long)]
    json: bool,
  },

  /// Show the status of a job
  Status { job_id: String },

  /// Print the transcript of a finished job
  Transcript {
    job_id: String,
    #[arg(long)]
    json: bool,
  },

  /// List the speakers of a transcript
  Speakers { job_id: String },

  /// Rename speakers, e.g. `rename JOB SPEAKER_00=Alice`
  Rename {
    job_id: String,
    #[arg(required = true, value_name = "OLD=NEW")]
    mappings: Vec<String>,
  },

  /// Merge two or more speakers into one
  Merge {
    job_id: String,
    #[arg(long = "speaker", required = true)]
    speakers: Vec<String>,
    #[arg(long)]
    name: String,
  },

  /// Download a transcript export
  Export {
    job_id: String,
    #[arg(long)]
    format: String,
    /// Export options as a JSON object
    #[arg(long)]
    options: Option<String>,
    #[arg(long, default_value = ".")]
    out: PathBuf,
  },

  /// Preview the first videos of a playlist or channel
  Preview {
    url: String,
    #[arg(long, default_value_t = 10)]
    limit: u32,
  },

  /// List videos of a playlist or channel
  Videos {
    url: String,
    #[arg(long, default_value_t = 0)]
    offset: u32,
    #[arg(long, default_value_t = 50)]
    limit: u32,
  },

  /// Start a batch over a playlist or channel
  Batch {
    url: String,
    /// Process the first N videos
    #[arg(long, conflicts_with = "videos")]
    limit: Option<u32>,
    /// Process only these video ids
    #[arg(long = "video")]
    videos: Vec<String>,
    #[command(flatten)]
    processing: ProcessingArgs,
  },

  /// Show the status of a batch
  BatchStatus {
    batch_id: String,
    /// Keep polling until the batch finishes
    #[arg(long)]
    watch: bool,
  },

  /// List the transcripts of a finished batch
  BatchResults { batch_id: String },

  /// Export the transcripts of a batch
  BatchExport {
    batch_id: String,
    #[arg(long)]
    format: String,
    /// Export only these jobs (default: all)
    #[arg(long = "job")]
    jobs: Vec<String>,
    /// Export options as a JSON object
    #[arg(long)]
    options: Option<String>,
    #[arg(long, default_value = ".")]
    out: PathBuf,
  },

  /// Inspect or maintain the local cache
  Cache {
    #[command(subcommand)]
    action: CacheAction,
  },

  /// Read or write stored preferences
  Settings {
    #[command(subcommand)]
    action: SettingsAction,
  },
}

#[derive(Debug, Clone, Subcommand)]
pub enum CacheAction {
  Stats,
  /// Remove expired entries
  Sweep,
  /// Remove everything
  Clear,
}

#[derive(Debug, Clone, Subcommand)]
pub enum SettingsAction {
  Get { key: String },
  /// Store a value; JSON is parsed, anything else is kept as a string
  Set { key: String, value: String },
}

/// Everything a command needs to run.
pub struct Context {
  pub client: CachedClient<ServiceClient>,
  pub config: Config,
}

impl Context {
  /// Options from flags, then stored settings, then config.
  fn processing_options(&self, args: &ProcessingArgs) -> ProcessingOptions {
    let explicit = ProcessingOptions {
      diarization_enabled: args.no_diarization.then_some(false),
      diarization_sensitivity: args.sensitivity,
    };
    let resolved = self.client.processing_options(&explicit);
    let configured = self.config.processing.options();

    ProcessingOptions {
      diarization_enabled: resolved.diarization_enabled.or(configured.diarization_enabled),
      diarization_sensitivity: resolved
        .diarization_sensitivity
        .or(configured.diarization_sensitivity),
    }
  }
}

pub async fn run(command: Command, ctx: &Context) -> Result<()> {
  let client = &ctx.client;

  match command {
    Command::Process {
      url,
      processing,
      json,
    } => {
      let options = ctx.processing_options(&processing);
      let job = client.submit_job(&url, &options).await?;
      println!("Job {} queued", job.id);

      let transcript = watch_job(ctx, job.id).await?;
      print_transcript(&transcript, json)?;
    }

    Command::Status { job_id } => {
      let result = client.job_status(&job_id).await?;
      let job = &result.data;
      println!(
        "{} {} {}%{}",
        job.id,
        job.status.as_str(),
        job.percent(),
        source_suffix(&result)
      );
      if !job.message.is_empty() {
        println!("  {}", job.message);
      }
    }

    Command::Transcript { job_id, json } => {
      let result = client.transcript(&job_id).await?;
      if let Some(label) = result.age_label(Utc::now()) {
        eprintln!("({})", label);
      }
      print_transcript(&result.data, json)?;
    }

    Command::Speakers { job_id } => {
      let transcript = client.transcript(&job_id).await?.data;
      for speaker in transcript.speakers() {
        let segments = transcript
          .segments
          .iter()
          .filter(|s| s.speaker == speaker)
          .count();
        println!("{}\t{} segments", speaker, segments);
      }
    }

    Command::Rename { job_id, mappings } => {
      let mapping = parse_mapping(&mappings)?;
      let transcript = client.rename_speakers(&job_id, &mapping).await?;
      println!("Speakers: {}", transcript.speakers().join(", "));
    }

    Command::Merge {
      job_id,
      speakers,
      name,
    } => {
      let transcript = client.merge_speakers(&job_id, &speakers, &name).await?;
      println!("Speakers: {}", transcript.speakers().join(", "));
    }

    Command::Export {
      job_id,
      format,
      options,
      out,
    } => {
      let options = parse_export_options(options)?;
      let file = client
        .export_transcript(&job_id, &format, options.as_ref())
        .await?;
      let path = write_export(&out, &file.filename, &file.bytes)?;
      match file.content_type {
        Some(content_type) => println!("Wrote {} ({})", path.display(), content_type),
        None => println!("Wrote {}", path.display()),
      }
    }

    Command::Preview { url, limit } => {
      let preview = client.batch_preview(&url, limit).await?;
      println!(
        "{} ({}, {} videos)",
        preview.title, preview.source_type, preview.total_videos
      );
      print_videos(&preview.preview_videos);
      if preview.has_more {
        println!("...");
      }
    }

    Command::Videos { url, offset, limit } => {
      let page = client.video_list(&url, offset, limit).await?;
      print_videos(&page.videos);
      println!(
        "{}-{} of {}",
        offset.saturating_add(1).min(page.total_videos),
        offset.saturating_add(page.videos.len() as u32),
        page.total_videos
      );
    }

    Command::Batch {
      url,
      limit,
      videos,
      processing,
    } => {
      let selection = match limit {
        Some(n) => BatchSelection::Limit(n),
        None if !videos.is_empty() => BatchSelection::Videos(videos),
        None => return Err(eyre!("Pass --limit N or at least one --video ID")),
      };
      let options = ctx.processing_options(&processing);
      let batch = client.submit_batch(&url, &selection, &options).await?;
      println!("Batch {} started", batch.id);
      println!("Follow it with: tubescript batch-status {} --watch", batch.id);
    }

    Command::BatchStatus { batch_id, watch } => {
      if watch {
        watch_batch(ctx, batch_id).await?;
      } else {
        let result = client.batch_status(&batch_id).await?;
        println!("{}{}", batch_line(&result.data), source_suffix(&result));
      }
    }

    Command::BatchResults { batch_id } => {
      let result = client.batch_results(&batch_id).await?;
      let results = &result.data;
      println!(
        "{}: {} of {} completed, {} failed{}",
        results.status.as_str(),
        results.completed,
        results.total_videos,
        results.failed,
        source_suffix(&result)
      );
      for item in &results.results {
        println!(
          "{}\t{}\t{} segments",
          item.job_id,
          item.video_title,
          item.transcript.segments.len()
        );
      }
    }

    Command::BatchExport {
      batch_id,
      format,
      jobs,
      options,
      out,
    } => {
      let options = parse_export_options(options)?;
      let exports = client
        .export_batch(&batch_id, &format, options.as_ref(), &jobs)
        .await?;
      let mut failures = 0;
      for export in exports {
        match export.result {
          Ok(file) => {
            let path = write_export(&out, &file.filename, &file.bytes)?;
            println!("Wrote {}", path.display());
          }
          Err(e) => {
            failures += 1;
            eprintln!("{} ({}): {}", export.video_title, export.job_id, e);
          }
        }
      }
      if failures > 0 {
        return Err(eyre!("{} export(s) failed", failures));
      }
    }

    Command::Cache { action } => match action {
      CacheAction::Stats => {
        let stats = client.cache().stats().await;
        println!("jobs:        {}", stats.job_count);
        println!("batches:     {}", stats.batch_count);
        println!("transcripts: {}", stats.transcript_count);
        println!("version:     {}", stats.schema_version);
      }
      CacheAction::Sweep => {
        let removed = client.cache().sweep_expired().await;
        println!("Removed {} expired entries", removed);
      }
      CacheAction::Clear => {
        client.cache().clear_all().await;
        println!("Cache cleared");
      }
    },

    Command::Settings { action } => match action {
      SettingsAction::Get { key } => match client.cache().setting::<Value>(&key) {
        Some(value) => println!("{}", value),
        None => return Err(eyre!("Setting {} is not set", key)),
      },
      SettingsAction::Set { key, value } => {
        let value = parse_setting(&value);
        client.cache().set_setting(&key, &value);
        info!("Setting {} updated", key);
      }
    },
  }

  Ok(())
}

/// Poll a job until it finishes; Ctrl-C stops polling.
async fn watch_job(ctx: &Context, job_id: String) -> Result<Transcript> {
  let (handle, mut events) =
    JobPoller::start(ctx.client.clone(), job_id, ctx.config.polling.job_interval());

  loop {
    let event = tokio::select! {
      event = events.recv() => event,
      _ = tokio::signal::ctrl_c() => {
        handle.cancel();
        return Err(eyre!("Stopped polling; the job keeps running on the server"));
      }
    };

    match event {
      Some(JobEvent::Progress {
        percent, message, ..
      }) => println!("[{:>3}%] {}", percent, message),
      Some(JobEvent::Completed(transcript)) => return Ok(transcript),
      Some(JobEvent::Failed(message)) => return Err(eyre!(message)),
      None => return Err(eyre!("Polling stopped unexpectedly ({:?})", handle.phase())),
    }
  }
}

/// Poll a batch until it reaches a terminal state; Ctrl-C stops polling.
async fn watch_batch(ctx: &Context, batch_id: String) -> Result<()> {
  let (handle, mut events) =
    BatchPoller::start(ctx.client.clone(), batch_id, ctx.config.polling.batch_interval());

  loop {
    let event = tokio::select! {
      event = events.recv() => event,
      _ = tokio::signal::ctrl_c() => {
        handle.cancel();
        return Err(eyre!("Stopped polling; the batch keeps running on the server"));
      }
    };

    match event {
      Some(BatchEvent::Progress(batch)) => println!("{}", batch_line(&batch)),
      Some(BatchEvent::Finished(batch)) => {
        println!("Batch {} finished: {}", batch.id, batch.status.as_str());
        return Ok(());
      }
      Some(BatchEvent::Failed(message)) => return Err(eyre!(message)),
      None => return Err(eyre!("Polling stopped unexpectedly ({:?})", handle.phase())),
    }
  }
}

fn source_suffix<T>(result: &CacheResult<T>) -> String {
  result
    .age_label(Utc::now())
    .map(|label| format!(" ({})", label))
    .unwrap_or_default()
}

fn batch_line(batch: &Batch) -> String {
  format!(
    "[{:>3}%] {} {}: {}/{} done, {} failed {}",
    batch.percent(),
    batch.id,
    batch.status.as_str(),
    batch.completed,
    batch.total_videos,
    batch.failed,
    batch.message
  )
  .trim_end()
  .to_string()
}

fn print_videos(videos: &[VideoDescriptor]) {
  for video in videos {
    let duration = video
      .duration
      .map(format_timestamp)
      .unwrap_or_else(|| "--:--".to_string());
    println!("{}\t{}\t{}", video.id, duration, video.title);
  }
}

fn print_transcript(transcript: &Transcript, json: bool) -> Result<()> {
  if json {
    let rendered = serde_json::to_string_pretty(transcript)
      .map_err(|e| eyre!("Failed to render transcript: {}", e))?;
    println!("{}", rendered);
  } else {
    print!("{}", render_transcript(transcript));
  }
  Ok(())
}

/// Plain-text rendering: a header, then one line per segment.
pub fn render_transcript(transcript: &Transcript) -> String {
  let mut out = String::new();
  if !transcript.metadata.title.is_empty() {
    out.push_str(&transcript.metadata.title);
    out.push('\n');
  }
  if !transcript.metadata.url.is_empty() {
    out.push_str(&transcript.metadata.url);
    out.push('\n');
  }
  out.push('\n');

  for segment in &transcript.segments {
    out.push_str(&format!(
      "[{}] {}: {}\n",
      format_timestamp(segment.start),
      segment.speaker,
      segment.text.trim()
    ));
  }
  out
}

/// `mm:ss`, or `h:mm:ss` from one hour on.
pub fn format_timestamp(seconds: f64) -> String {
  let total = if seconds.is_finite() && seconds > 0.0 {
    seconds.floor() as u64
  } else {
    0
  };
  let (hours, minutes, secs) = (total / 3600, (total % 3600) / 60, total % 60);

  if hours > 0 {
    format!("{}:{:02}:{:02}", hours, minutes, secs)
  } else {
    format!("{:02}:{:02}", minutes, secs)
  }
}

/// Parse `OLD=NEW` arguments. The new name may itself contain `=`.
pub fn parse_mapping(args: &[String]) -> Result<BTreeMap<String, String>> {
  args
    .iter()
    .map(|arg| match arg.split_once('=') {
      Some((old, new)) if !old.trim().is_empty() => {
        Ok((old.trim().to_string(), new.to_string()))
      }
      _ => Err(eyre!("Expected OLD=NEW, got {}", arg)),
    })
    .collect()
}

fn parse_export_options(raw: Option<String>) -> Result<Option<Value>> {
  raw
    .map(|raw| {
      serde_json::from_str::<Value>(&raw).map_err(|e| eyre!("Invalid export options: {}", e))
    })
    .transpose()
}

fn parse_setting(raw: &str) -> Value {
  serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

/// Write an export into `dir`, keeping only the final path component of the
/// server-provided name.
pub fn write_export(dir: &Path, filename: &str, bytes: &[u8]) -> Result<PathBuf> {
  let name = Path::new(filename)
    .file_name()
    .map(|n| n.to_os_string())
    .ok_or_else(|| eyre!("Invalid export filename {}", filename))?;

  std::fs::create_dir_all(dir)
    .map_err(|e| eyre!("Failed to create {}: {}", dir.display(), e))?;
  let path = dir.join(name);
  std::fs::write(&path, bytes).map_err(|e| eyre!("Failed to write {}: {}", path.display(), e))?;

  Ok(path)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::service::types::{Segment, TranscriptMetadata};
  use clap::Parser;

  #[derive(Parser)]
  struct Cli {
    #[command(subcommand)]
    command: Command,
  }

  #[test]
  fn test_format_timestamp() {
    assert_eq!(format_timestamp(0.0), "00:00");
    assert_eq!(format_timestamp(75.9), "01:15");
    assert_eq!(format_timestamp(3725.0), "1:02:05");
    assert_eq!(format_timestamp(f64::NAN), "00:00");
  }

  #[test]
  fn test_parse_mapping() {
    let mapping = parse_mapping(&[
      "SPEAKER_00=Alice".to_string(),
      "SPEAKER_01=A=B".to_string(),
    ])
    .unwrap();
    assert_eq!(mapping["SPEAKER_00"], "Alice");
    assert_eq!(mapping["SPEAKER_01"], "A=B");

    assert!(parse_mapping(&["Alice".to_string()]).is_err());
    assert!(parse_mapping(&["=Alice".to_string()]).is_err());
  }

  #[test]
  fn test_parse_setting() {
    assert_eq!(parse_setting("true"), Value::Bool(true));
    assert_eq!(parse_setting("0.5"), serde_json::json!(0.5));
    assert_eq!(parse_setting("dark"), Value::String("dark".to_string()));
  }

  #[test]
  fn test_render_transcript() {
    let transcript = Transcript {
      metadata: TranscriptMetadata {
        title: "Interview".to_string(),
        url: "https://www.youtube.com/watch?v=abc".to_string(),
        duration: 70.0,
        num_speakers: 2,
      },
      segments: vec![
        Segment {
          start: 0.0,
          end: 4.0,
          speaker: "Alice".to_string(),
          text: " Hello ".to_string(),
        },
        Segment {
          start: 65.0,
          end: 70.0,
          speaker: "Bob".to_string(),
          text: "Hi".to_string(),
        },
      ],
    };

    assert_eq!(
      render_transcript(&transcript),
      "Interview\nhttps://www.youtube.com/watch?v=abc\n\n[00:00] Alice: Hello\n[01:05] Bob: Hi\n"
    );
  }

  #[test]
  fn test_write_export_strips_directories() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_export(dir.path(), "../../etc/transcript.srt", b"1\n").unwrap();

    assert_eq!(path, dir.path().join("transcript.srt"));
    assert_eq!(std::fs::read(&path).unwrap(), b"1\n");
  }

  #[test]
  fn test_cli_parses_subcommands() {
    let cli = Cli::try_parse_from([
      "tubescript",
      "merge",
      "j1",
      "--speaker",
      "A",
      "--speaker",
      "B",
      "--name",
      "Host",
    ])
    .unwrap();
    assert!(matches!(
      cli.command,
      Command::Merge { ref speakers, ref name, .. } if speakers.len() == 2 && name == "Host"
    ));

    let cli = Cli::try_parse_from(["tubescript", "batch", "u", "--limit", "3", "--no-diarization"])
      .unwrap();
    assert!(matches!(
      cli.command,
      Command::Batch { limit: Some(3), ref processing, .. } if processing.no_diarization
    ));

    assert!(Cli::try_parse_from(["tubescript", "batch", "u", "--limit", "3", "--video", "x"]).is_err());
  }

  #[test]
  fn test_cli_parses_batch_export_selection() {
    let cli = Cli::try_parse_from([
      "tubescript",
      "batch-export",
      "b1",
      "--format",
      "srt",
      "--job",
      "j1",
      "--job",
      "j3",
      "--options",
      r#"{"timestamps":false}"#,
    ])
    .unwrap();
    let Command::BatchExport { jobs, options, .. } = cli.command else {
      panic!("expected batch-export");
    };
    assert_eq!(jobs, vec!["j1", "j3"]);
    assert_eq!(
      parse_export_options(options).unwrap(),
      Some(serde_json::json!({ "timestamps": false }))
    );

    assert!(parse_export_options(Some("{".to_string())).is_err());
    assert_eq!(parse_export_options(None).unwrap(), None);
  }
}
