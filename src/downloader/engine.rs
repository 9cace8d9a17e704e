use std::{path::PathBuf, sync::Arc, time::Duration};

use tokio::sync::Mutex;
use tracing::{debug, error, info, instrument, warn};

use super::error::Result;
use super::http::Downloader;
use super::models::{
    Artifact, Chunk, ChunkStatus, FinishedEvent, ProgressEvent, Transfer, TransferEvent,
    TransferStatus,
};
use super::notify::Notifier;
use super::queue::{Scheduler, Task, TaskHandler, TaskOutcome};
use crate::{db::Db, storage::Disk};

/// Runtime knobs of the engine, usually built from [`crate::config::Config`]
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub max_transfers_total: u64,
    pub max_transfers_per_domain: u64,
    pub chunk_count: u32,
    pub min_bytes_for_chunking: u64,
    pub http_timeout: Duration,
    pub progress_flush_bytes: u64,
    pub storage_root: PathBuf,
    pub tmp_dir: PathBuf,
    /// Base URL the storage root is served from, without a trailing slash
    pub public_url: String,
    pub thumbnail_width: u32,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            max_transfers_total: 20,
            max_transfers_per_domain: 20,
            chunk_count: 4,
            min_bytes_for_chunking: 10 * 1024 * 1024,
            http_timeout: Duration::from_secs(30),
            progress_flush_bytes: 1024 * 1024,
            storage_root: PathBuf::from("storage"),
            tmp_dir: std::env::temp_dir().join("chunkline"),
            public_url: "/storage".to_string(),
            thumbnail_width: 320,
        }
    }
}

/// Owns the collaborators every transfer step needs and dispatches queued
/// tasks to them. All transfer state lives in the database; the engine itself
/// only holds handles.
pub struct Engine {
    pub(crate) db: Db,
    /// Final artifact placement
    pub(crate) storage: Disk,
    /// Part files and assembled blobs, one directory per transfer
    pub(crate) scratch: Disk,
    pub(crate) http: Downloader,
    pub(crate) notifier: Arc<dyn Notifier>,
    pub(crate) scheduler: Scheduler,
    pub(crate) settings: EngineSettings,
    /// Serializes admission decisions inside this process
    pub(crate) pump_lock: Mutex<()>,
}

impl Engine {
    pub fn new(
        db: Db,
        settings: EngineSettings,
        scheduler: Scheduler,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Self> {
        let http = Downloader::new(settings.http_timeout)?;
        Ok(Self {
            db,
            storage: Disk::new(&settings.storage_root),
            scratch: Disk::new(&settings.tmp_dir),
            http,
            notifier,
            scheduler,
            settings,
            pump_lock: Mutex::new(()),
        })
    }

    pub fn db(&self) -> &Db {
        &self.db
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Public URL of a file stored under the storage root
    pub fn public_url(&self, rel: &str) -> String {
        format!("{}/{}", self.settings.public_url, rel.trim_start_matches('/'))
    }

    pub(crate) fn emit_progress(&self, transfer: &Transfer, percent: u8) {
        self.notifier.emit(TransferEvent::Progress(ProgressEvent {
            transfer_id: transfer.key.clone(),
            artifact_id: transfer.artifact.clone(),
            domain: transfer.domain.clone(),
            status: transfer.status,
            percent,
        }));
    }

    pub(crate) fn emit_finished(&self, transfer: &Transfer, artifact: Option<&Artifact>) {
        let path = artifact.and_then(|a| a.path.clone());
        let preview_url = artifact
            .and_then(|a| a.thumbnail_path.as_deref().or(a.path.as_deref()))
            .map(|rel| self.public_url(rel));
        self.notifier.emit(TransferEvent::Finished(FinishedEvent {
            transfer_id: transfer.key.clone(),
            artifact_id: transfer.artifact.clone(),
            domain: transfer.domain.clone(),
            status: transfer.status,
            error: transfer.error.clone(),
            path,
            original_url: transfer.url.clone(),
            preview_url,
            size: artifact.and_then(|a| a.size),
            filename: artifact.and_then(|a| a.filename.clone()),
        }));
    }

    /// Fails a non-terminal transfer, notifies, and frees its slot.
    ///
    /// Returns `false` if the transfer was already terminal.
    #[instrument(skip(self))]
    pub(crate) async fn fail_transfer(&self, key: &str, reason: &str) -> Result<bool> {
        let Some(failed) = Transfer::fail(&self.db, key, reason).await? else {
            debug!("Transfer already terminal, not failing");
            return Ok(false);
        };
        error!(transfer = %key, reason, "Transfer failed");
        self.emit_finished(&failed, None);
        self.scheduler.schedule(Task::Pump {
            domain: failed.domain,
        });
        Ok(true)
    }

    /// Moves a transfer to ASSEMBLING and schedules the assembly, if every
    /// chunk is done and nobody else has already done so
    pub(crate) async fn try_begin_assembly(&self, key: &str) -> Result<bool> {
        match Transfer::begin_assembly(&self.db, key).await? {
            Some(_) => {
                info!(transfer = %key, "All chunks complete, assembling");
                self.scheduler.schedule(Task::Assemble {
                    transfer: key.to_string(),
                });
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Schedules every chunk of a transfer that is not yet complete
    pub(crate) async fn schedule_unfinished(&self, key: &str) -> Result<usize> {
        let chunks = Chunk::for_transfer(&self.db, key).await?;
        let mut scheduled = 0;
        for chunk in chunks.into_iter().filter(|c| c.status != ChunkStatus::Completed) {
            self.scheduler.schedule(Task::DownloadChunk { chunk: chunk.key });
            scheduled += 1;
        }
        if scheduled == 0 {
            self.try_begin_assembly(key).await?;
        }
        Ok(scheduled)
    }

    /// Re-enqueues work for every transfer that was in flight when the
    /// process last stopped. Returns the number of transfers picked up.
    #[instrument(skip(self))]
    pub async fn recover(&self) -> Result<usize> {
        let mut recovered = 0;

        for status in [TransferStatus::Queued, TransferStatus::Preparing] {
            for transfer in Transfer::list(&self.db, Some(status), None).await? {
                self.scheduler.schedule(Task::Start {
                    transfer: transfer.key,
                });
                recovered += 1;
            }
        }

        // No run of this process holds a claim yet
        for transfer in Transfer::list(&self.db, Some(TransferStatus::Paused), None).await? {
            Chunk::release_all(&self.db, &transfer.key).await?;
        }
        for transfer in Transfer::list(&self.db, Some(TransferStatus::Downloading), None).await? {
            Chunk::release_all(&self.db, &transfer.key).await?;
            self.schedule_unfinished(&transfer.key).await?;
            recovered += 1;
        }

        for transfer in Transfer::list(&self.db, Some(TransferStatus::Assembling), None).await? {
            self.scheduler.schedule(Task::Assemble {
                transfer: transfer.key,
            });
            recovered += 1;
        }

        for domain in Transfer::pending_domains(&self.db).await? {
            self.scheduler.schedule(Task::Pump { domain });
        }

        info!(recovered, "Recovered in-flight transfers");
        Ok(recovered)
    }
}

pub(crate) fn outcome(result: Result<()>) -> TaskOutcome {
    match result {
        Ok(()) => TaskOutcome::Done,
        Err(e) if e.is_transient() => TaskOutcome::Retry(e.to_string()),
        Err(e) => TaskOutcome::Fail(e.to_string()),
    }
}

impl TaskHandler for Engine {
    async fn handle(&self, task: &Task) -> TaskOutcome {
        match task {
            Task::Pump { domain } => outcome(self.pump(domain).await.map(|_| ())),
            Task::Start { transfer } => outcome(self.start(transfer).await),
            Task::DownloadChunk { chunk } => self.run_chunk(chunk).await,
            Task::Assemble { transfer } => outcome(self.assemble(transfer).await),
        }
    }

    async fn exhausted(&self, task: &Task, reason: &str) {
        let transfer = match task {
            Task::Pump { domain } => {
                warn!(domain = %domain, reason, "Giving up on pump, the ticker will retry");
                return;
            }
            Task::Start { transfer } | Task::Assemble { transfer } => transfer.clone(),
            Task::DownloadChunk { chunk } => match Chunk::get(&self.db, chunk).await {
                Ok(Some(chunk)) => chunk.transfer,
                Ok(None) => {
                    warn!(chunk = %chunk, "Exhausted chunk no longer exists");
                    return;
                }
                Err(e) => {
                    error!(chunk = %chunk, error = %e, "Could not look up exhausted chunk");
                    return;
                }
            },
        };

        if let Err(e) = self.fail_transfer(&transfer, reason).await {
            error!(transfer = %transfer, error = %e, "Could not mark transfer failed");
        }
    }
}
