//! Entry points used by the API: creating transfers and steering them.

use serde::Deserialize;
use tracing::{info, instrument};
use url::Url;

use super::engine::Engine;
use super::error::{Result, TransferError};
use super::models::{Artifact, Chunk, ChunkStatus, Transfer, TransferStatus};
use super::queue::Task;

#[derive(Debug, Clone, Deserialize)]
pub struct TransferRequest {
    pub url: String,
    /// Existing artifact to download into, a new one is created otherwise
    pub artifact: Option<String>,
    /// Original filename for a new artifact
    pub filename: Option<String>,
}

/// Lowercased host of an http(s) URL
pub fn domain_of(raw: &str) -> Result<String> {
    let url = Url::parse(raw).map_err(|e| TransferError::InvalidUrl(format!("{raw}: {e}")))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(TransferError::InvalidUrl(format!(
            "unsupported scheme {}",
            url.scheme()
        )));
    }
    url.host_str()
        .filter(|host| !host.is_empty())
        .map(str::to_ascii_lowercase)
        .ok_or_else(|| TransferError::InvalidUrl(format!("{raw} has no host")))
}

impl Engine {
    /// Records a pending transfer and asks the pump to look at its domain
    #[instrument(skip(self, request), fields(url = %request.url))]
    pub async fn enqueue(&self, request: TransferRequest) -> Result<Transfer> {
        let domain = domain_of(&request.url)?;

        let artifact = match request.artifact {
            Some(key) => Artifact::require(&self.db, &key).await?,
            None => {
                let artifact = Artifact::new(&request.url, request.filename);
                artifact.insert(&self.db).await?;
                artifact
            }
        };

        let transfer = Transfer::new(artifact.key, request.url, domain);
        transfer.insert(&self.db).await?;
        info!(transfer = %transfer.key, domain = %transfer.domain, "Transfer enqueued");

        self.scheduler.schedule(Task::Pump {
            domain: transfer.domain.clone(),
        });
        Ok(transfer)
    }

    /// Cancels a transfer that has not finished yet. Chunks in flight stop
    /// at their next progress flush.
    #[instrument(skip(self))]
    pub async fn cancel(&self, key: &str) -> Result<Transfer> {
        let Some(canceled) = Transfer::cancel(&self.db, key).await? else {
            return Err(self.not_in_state(key).await);
        };
        info!(domain = %canceled.domain, "Transfer canceled");
        self.scheduler.schedule(Task::Pump {
            domain: canceled.domain.clone(),
        });
        Ok(canceled)
    }

    /// Pauses a transfer without giving up its admission slot
    #[instrument(skip(self))]
    pub async fn pause(&self, key: &str) -> Result<Transfer> {
        let from = [
            TransferStatus::Queued,
            TransferStatus::Preparing,
            TransferStatus::Downloading,
        ];
        let Some(paused) = Transfer::transition(&self.db, key, &from, TransferStatus::Paused).await?
        else {
            return Err(self.not_in_state(key).await);
        };
        info!("Transfer paused");
        Ok(paused)
    }

    /// Picks a paused transfer back up where it stopped
    #[instrument(skip(self))]
    pub async fn resume(&self, key: &str) -> Result<Transfer> {
        let current = Transfer::require(&self.db, key).await?;
        if current.status != TransferStatus::Paused {
            return Err(TransferError::InvalidState {
                key: key.to_string(),
                status: current.status,
            });
        }

        // Not planned yet, go through preparation again
        let target = if current.chunk_count > 0 {
            TransferStatus::Downloading
        } else {
            TransferStatus::Queued
        };
        let Some(resumed) =
            Transfer::transition(&self.db, key, &[TransferStatus::Paused], target).await?
        else {
            return Err(self.not_in_state(key).await);
        };

        if target == TransferStatus::Queued {
            self.scheduler.schedule(Task::Start {
                transfer: key.to_string(),
            });
        } else {
            // Claimed chunks either keep going or reschedule themselves on release
            let chunks = Chunk::for_transfer(&self.db, key).await?;
            let mut scheduled = 0;
            for chunk in chunks.into_iter().filter(|c| {
                !matches!(c.status, ChunkStatus::Completed | ChunkStatus::Downloading)
            }) {
                self.scheduler.schedule(Task::DownloadChunk { chunk: chunk.key });
                scheduled += 1;
            }
            if scheduled == 0 {
                self.try_begin_assembly(key).await?;
            }
        }
        info!(status = %resumed.status, "Transfer resumed");
        Ok(resumed)
    }

    /// Error for a conditional update that matched nothing
    async fn not_in_state(&self, key: &str) -> TransferError {
        match Transfer::require(&self.db, key).await {
            Ok(transfer) => TransferError::InvalidState {
                key: key.to_string(),
                status: transfer.status,
            },
            Err(e) => e,
        }
    }
}
