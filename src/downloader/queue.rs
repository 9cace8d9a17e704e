//! Background task queue
//!
//! Work is split into two lanes so that long chunk downloads never starve the
//! short bookkeeping tasks (pumping, preparing, assembling). Each lane is an
//! unbounded channel drained by a fixed pool of workers. Failed tasks are
//! re-enqueued with exponential backoff until the retry budget runs out.

use std::{future::Future, sync::Arc, time::Duration};

use tokio::{
    sync::{Mutex, mpsc},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Task {
    /// Admit pending transfers of a domain
    Pump { domain: String },
    /// RemoteHead, plan and fan out a queued transfer
    Start { transfer: String },
    DownloadChunk { chunk: String },
    /// Concatenate the parts of a fully downloaded transfer
    Assemble { transfer: String },
}

impl Task {
    pub fn lane(&self) -> Lane {
        match self {
            Task::DownloadChunk { .. } => Lane::Chunks,
            _ => Lane::Transfers,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Task::Pump { .. } => "pump",
            Task::Start { .. } => "start",
            Task::DownloadChunk { .. } => "download_chunk",
            Task::Assemble { .. } => "assemble",
        }
    }

    pub fn subject(&self) -> &str {
        match self {
            Task::Pump { domain } => domain,
            Task::Start { transfer } | Task::Assemble { transfer } => transfer,
            Task::DownloadChunk { chunk } => chunk,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lane {
    Transfers,
    Chunks,
}

/// What a handler reports back for one run of a task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Done,
    /// Transient failure, run again later if attempts remain
    Retry(String),
    /// Permanent failure, skip remaining attempts
    Fail(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base: Duration,
    pub max: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base: Duration::from_secs(2),
            max: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// Delay before running attempt `attempt + 1`
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base.saturating_mul(factor).min(self.max)
    }
}

pub trait TaskHandler: Send + Sync + 'static {
    fn handle(&self, task: &Task) -> impl Future<Output = TaskOutcome> + Send;

    /// Called once when a task failed permanently or ran out of attempts
    fn exhausted(&self, task: &Task, reason: &str) -> impl Future<Output = ()> + Send;
}

#[derive(Debug)]
struct Envelope {
    task: Task,
    attempt: u32,
}

/// Cheap handle for enqueueing tasks from anywhere
#[derive(Debug, Clone)]
pub struct Scheduler {
    transfers: mpsc::UnboundedSender<Envelope>,
    chunks: mpsc::UnboundedSender<Envelope>,
}

impl Scheduler {
    pub fn schedule(&self, task: Task) {
        self.send(Envelope { task, attempt: 1 });
    }

    fn retry_after(&self, task: Task, attempt: u32, delay: Duration) {
        let this = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            this.send(Envelope { task, attempt });
        });
    }

    fn send(&self, envelope: Envelope) {
        let tx = match envelope.task.lane() {
            Lane::Transfers => &self.transfers,
            Lane::Chunks => &self.chunks,
        };
        debug!(task = envelope.task.name(), subject = envelope.task.subject(), "Enqueueing task");
        if let Err(e) = tx.send(envelope) {
            warn!(task = e.0.task.name(), "Task queue closed, dropping task");
        }
    }
}

pub struct TaskQueue {
    scheduler: Scheduler,
    transfers: mpsc::UnboundedReceiver<Envelope>,
    chunks: mpsc::UnboundedReceiver<Envelope>,
    policy: RetryPolicy,
}

impl TaskQueue {
    pub fn new(policy: RetryPolicy) -> Self {
        let (transfers_tx, transfers) = mpsc::unbounded_channel();
        let (chunks_tx, chunks) = mpsc::unbounded_channel();
        Self {
            scheduler: Scheduler {
                transfers: transfers_tx,
                chunks: chunks_tx,
            },
            transfers,
            chunks,
            policy,
        }
    }

    pub fn scheduler(&self) -> Scheduler {
        self.scheduler.clone()
    }

    /// Spawns the worker pools. Workers exit when `shutdown` fires.
    pub fn run<H: TaskHandler>(
        self,
        handler: Arc<H>,
        transfer_workers: usize,
        chunk_workers: usize,
        shutdown: CancellationToken,
    ) -> Vec<JoinHandle<()>> {
        info!(transfer_workers, chunk_workers, "Starting task workers");
        let mut handles = Vec::with_capacity(transfer_workers + chunk_workers);
        let lanes = [
            ("transfers", self.transfers, transfer_workers.max(1)),
            ("chunks", self.chunks, chunk_workers.max(1)),
        ];
        for (lane, rx, workers) in lanes {
            let rx = Arc::new(Mutex::new(rx));
            for id in 0..workers {
                let worker = Worker {
                    rx: rx.clone(),
                    handler: handler.clone(),
                    scheduler: self.scheduler.clone(),
                    policy: self.policy,
                    shutdown: shutdown.clone(),
                };
                handles.push(tokio::spawn(
                    worker.run().instrument(info_span!("worker", lane, id)),
                ));
            }
        }
        handles
    }

    /// Removes and returns every queued task without running it
    #[cfg(test)]
    pub fn take_pending(&mut self) -> Vec<Task> {
        let mut tasks = Vec::new();
        while let Ok(envelope) = self.transfers.try_recv() {
            tasks.push(envelope.task);
        }
        while let Ok(envelope) = self.chunks.try_recv() {
            tasks.push(envelope.task);
        }
        tasks
    }

    /// Runs queued tasks inline until both lanes are empty, retrying
    /// immediately instead of after a backoff. Returns the number of runs.
    #[cfg(test)]
    pub async fn drain<H: TaskHandler>(&mut self, handler: &H) -> usize {
        let mut runs = 0;
        loop {
            let envelope = match self.transfers.try_recv() {
                Ok(envelope) => envelope,
                Err(_) => match self.chunks.try_recv() {
                    Ok(envelope) => envelope,
                    Err(_) => return runs,
                },
            };
            runs += 1;
            match handler.handle(&envelope.task).await {
                TaskOutcome::Done => {}
                TaskOutcome::Retry(_) if envelope.attempt < self.policy.max_attempts => {
                    self.scheduler.send(Envelope {
                        task: envelope.task,
                        attempt: envelope.attempt + 1,
                    });
                }
                TaskOutcome::Retry(reason) | TaskOutcome::Fail(reason) => {
                    handler.exhausted(&envelope.task, &reason).await;
                }
            }
        }
    }
}

struct Worker<H> {
    rx: Arc<Mutex<mpsc::UnboundedReceiver<Envelope>>>,
    handler: Arc<H>,
    scheduler: Scheduler,
    policy: RetryPolicy,
    shutdown: CancellationToken,
}

impl<H: TaskHandler> Worker<H> {
    async fn run(self) {
        loop {
            let envelope = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                envelope = async { self.rx.lock().await.recv().await } => envelope,
            };
            let Some(envelope) = envelope else {
                break;
            };
            self.process(envelope).await;
        }
        debug!("Worker stopped");
    }

    async fn process(&self, envelope: Envelope) {
        let Envelope { task, attempt } = envelope;
        let handler = self.handler.clone();
        let running = task.clone();
        // A panicking handler only takes down its own run
        let outcome = match tokio::spawn(async move { handler.handle(&running).await }).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(task = task.name(), subject = task.subject(), error = %e, "Task panicked");
                TaskOutcome::Fail(format!("task panicked: {e}"))
            }
        };

        match outcome {
            TaskOutcome::Done => {}
            TaskOutcome::Retry(reason) if attempt < self.policy.max_attempts => {
                let delay = self.policy.backoff(attempt);
                warn!(
                    task = task.name(),
                    subject = task.subject(),
                    attempt,
                    delay_secs = delay.as_secs(),
                    reason = %reason,
                    "Task failed, retrying"
                );
                self.scheduler.retry_after(task, attempt + 1, delay);
            }
            TaskOutcome::Retry(reason) | TaskOutcome::Fail(reason) => {
                error!(
                    task = task.name(),
                    subject = task.subject(),
                    attempt,
                    reason = %reason,
                    "Task failed permanently"
                );
                self.handler.exhausted(&task, &reason).await;
            }
        }
    }
}
