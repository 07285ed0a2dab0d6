//! Background status pollers for jobs and batches.
//!
//! A poller runs its ticks sequentially inside one tokio task and reports
//! through an unbounded channel, so the caller only ever reads events:
//!
//! ```ignore
//! let (handle, mut events) = JobPoller::start(client.clone(), job_id, interval);
//! while let Some(event) = events.recv().await {
//!     match event {
//!         JobEvent::Progress { percent, .. } => render_progress(percent),
//!         JobEvent::Completed(transcript) => render_transcript(&transcript),
//!         JobEvent::Failed(message) => render_error(&message),
//!     }
//! }
//! ```
//!
//! Dropping the handle or calling [`PollHandle::cancel`] stops the task.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::event::{BatchEvent, JobEvent};
use crate::service::types::{Batch, BatchStatus, Job, JobStatus, Transcript};
use crate::service::{CachedClient, ServiceError, TranscriptService};

/// Lifecycle of a poller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollPhase {
  Submitted,
  Polling,
  Completed,
  Failed,
  Cancelled,
}

/// What a job poller needs from the client.
#[async_trait]
pub trait JobSource: Send + Sync + 'static {
  async fn job_status(&self, job_id: &str) -> Result<Job, ServiceError>;
  async fn transcript(&self, job_id: &str) -> Result<Transcript, ServiceError>;
}

/// What a batch poller needs from the client.
#[async_trait]
pub trait BatchSource: Send + Sync + 'static {
  async fn batch_status(&self, batch_id: &str) -> Result<Batch, ServiceError>;
}

#[async_trait]
impl<S: TranscriptService + 'static> JobSource for CachedClient<S> {
  async fn job_status(&self, job_id: &str) -> Result<Job, ServiceError> {
    Ok(CachedClient::job_status(self, job_id).await?.data)
  }

  async fn transcript(&self, job_id: &str) -> Result<Transcript, ServiceError> {
    Ok(CachedClient::transcript(self, job_id).await?.data)
  }
}

#[async_trait]
impl<S: TranscriptService + 'static> BatchSource for CachedClient<S> {
  async fn batch_status(&self, batch_id: &str) -> Result<Batch, ServiceError> {
    Ok(CachedClient::batch_status(self, batch_id).await?.data)
  }
}

/// State shared between a handle and its task.
struct Shared {
  generation: Mutex<u64>,
  cancelled: AtomicBool,
  phase: watch::Sender<PollPhase>,
}

/// Event sink bound to the generation its task was started with. Once the
/// shared generation moves on, every emit and phase change is dropped.
struct Emitter<E> {
  tx: mpsc::UnboundedSender<E>,
  shared: Arc<Shared>,
  generation: u64,
}

impl<E> Emitter<E> {
  /// Returns false when the event was discarded or nobody is listening.
  fn emit(&self, event: E) -> bool {
    let Ok(generation) = self.shared.generation.lock() else {
      return false;
    };
    *generation == self.generation && self.tx.send(event).is_ok()
  }

  fn set_phase(&self, phase: PollPhase) {
    if let Ok(generation) = self.shared.generation.lock() {
      if *generation == self.generation {
        self.shared.phase.send_replace(phase);
      }
    }
  }
}

/// Control handle for a running poller.
pub struct PollHandle {
  shared: Arc<Shared>,
  phase: watch::Receiver<PollPhase>,
  task: JoinHandle<()>,
}

impl PollHandle {
  fn spawn<E, F, Fut>(run: F) -> (Self, mpsc::UnboundedReceiver<E>)
  where
    E: Send + 'static,
    F: FnOnce(Emitter<E>) -> Fut,
    Fut: std::future::Future<Output = ()> + Send + 'static,
  {
    let (tx, rx) = mpsc::unbounded_channel();
    let (phase_tx, phase_rx) = watch::channel(PollPhase::Submitted);
    let shared = Arc::new(Shared {
      generation: Mutex::new(0),
      cancelled: AtomicBool::new(false),
      phase: phase_tx,
    });

    let emitter = Emitter {
      tx,
      shared: Arc::clone(&shared),
      generation: 0,
    };
    let task = tokio::spawn(run(emitter));

    let handle = Self {
      shared,
      phase: phase_rx,
      task,
    };
    (handle, rx)
  }

  pub fn phase(&self) -> PollPhase {
    *self.phase.borrow()
  }

  /// Stop polling. Safe to call any number of times; only the first call
  /// has an effect, and nothing is emitted afterwards.
  pub fn cancel(&self) {
    if self.shared.cancelled.swap(true, Ordering::SeqCst) {
      return;
    }

    if let Ok(mut generation) = self.shared.generation.lock() {
      *generation += 1;
      let phase = *self.phase.borrow();
      if !matches!(phase, PollPhase::Completed | PollPhase::Failed) {
        self.shared.phase.send_replace(PollPhase::Cancelled);
      }
    }
    self.task.abort();
    debug!("Poller cancelled");
  }
}

impl Drop for PollHandle {
  fn drop(&mut self) {
    self.cancel();
  }
}

/// Message shown for a failed job or poll.
fn failure_message(message: &str) -> String {
  format!("Error: {}", message)
}

/// Polls one job until it completes or fails.
pub struct JobPoller;

impl JobPoller {
  /// Start polling `job_id`. The first status request is made one interval
  /// after start.
  pub fn start<J: JobSource>(
    source: J,
    job_id: String,
    interval: Duration,
  ) -> (PollHandle, mpsc::UnboundedReceiver<JobEvent>) {
    PollHandle::spawn(move |emitter| run_job(source, job_id, interval, emitter))
  }
}

async fn run_job<J: JobSource>(source: J, job_id: String, interval: Duration, emitter: Emitter<JobEvent>) {
  let mut ticker = time::interval_at(Instant::now() + interval, interval);
  ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
  emitter.set_phase(PollPhase::Polling);
  info!("Polling job {} every {:?}", job_id, interval);

  let fail = |message: &str| {
    warn!("Job {} failed: {}", job_id, message);
    emitter.set_phase(PollPhase::Failed);
    emitter.emit(JobEvent::Failed(failure_message(message)));
  };

  loop {
    ticker.tick().await;

    let job = match source.job_status(&job_id).await {
      Ok(job) => job,
      Err(e) => return fail(&e.to_string()),
    };

    let progress = JobEvent::Progress {
      status: job.status,
      percent: job.percent(),
      message: job.message.clone(),
    };
    if !emitter.emit(progress) {
      return;
    }

    match job.status {
      JobStatus::Completed => {
        info!("Job {} completed", job_id);
        return match source.transcript(&job_id).await {
          Ok(transcript) => {
            emitter.set_phase(PollPhase::Completed);
            emitter.emit(JobEvent::Completed(transcript));
          }
          Err(e) => fail(&e.to_string()),
        };
      }
      JobStatus::Failed => {
        let message = if job.message.trim().is_empty() {
          "Processing failed"
        } else {
          job.message.as_str()
        };
        return fail(message);
      }
      JobStatus::Queued | JobStatus::Processing => {}
    }
  }
}

/// Polls one batch until it reaches a terminal state.
pub struct BatchPoller;

impl BatchPoller {
  /// Start polling `batch_id`. The first status request is immediate.
  pub fn start<B: BatchSource>(
    source: B,
    batch_id: String,
    interval: Duration,
  ) -> (PollHandle, mpsc::UnboundedReceiver<BatchEvent>) {
    PollHandle::spawn(move |emitter| run_batch(source, batch_id, interval, emitter))
  }
}

async fn run_batch<B: BatchSource>(
  source: B,
  batch_id: String,
  interval: Duration,
  emitter: Emitter<BatchEvent>,
) {
  let mut ticker = time::interval(interval);
  ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
  emitter.set_phase(PollPhase::Polling);
  info!("Polling batch {} every {:?}", batch_id, interval);

  loop {
    ticker.tick().await;

    let batch = match source.batch_status(&batch_id).await {
      Ok(batch) => batch,
      Err(e) => {
        warn!("Batch {} polling failed: {}", batch_id, e);
        emitter.set_phase(PollPhase::Failed);
        emitter.emit(BatchEvent::Failed(failure_message(&e.to_string())));
        return;
      }
    };

    if !emitter.emit(BatchEvent::Progress(batch.clone())) {
      return;
    }

    if batch.status.is_terminal() {
      info!("Batch {} finished as {}", batch_id, batch.status.as_str());
      let phase = if batch.status == BatchStatus::Failed {
        PollPhase::Failed
      } else {
        PollPhase::Completed
      };
      emitter.set_phase(phase);
      emitter.emit(BatchEvent::Finished(batch));
      return;
    }
  }
}
