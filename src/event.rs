use crate::service::types::{Batch, JobStatus, Transcript};

/// Events produced by a job poller.
#[derive(Debug, Clone, PartialEq)]
pub enum JobEvent {
  /// One status tick, including the terminal one
  Progress {
    status: JobStatus,
    percent: u8,
    message: String,
  },
  /// Job finished and its transcript was fetched
  Completed(Transcript),
  /// Polling stopped on a failure; the message is ready to display
  Failed(String),
}

/// Events produced by a batch poller.
#[derive(Debug, Clone, PartialEq)]
pub enum BatchEvent {
  Progress(Batch),
  /// Batch reached completed, failed or partial
  Finished(Batch),
  Failed(String),
}
