//! Concatenation of completed parts into one blob, and the terminal
//! bookkeeping that follows a successful placement.

use std::path::PathBuf;

use tokio::{fs::File, io::AsyncWriteExt};
use tracing::{debug, info, instrument, warn};

use super::engine::Engine;
use super::error::{Result, TransferError};
use super::models::{Artifact, Chunk, ChunkStatus, Transfer, TransferStatus};
use super::queue::Task;

const ASSEMBLED: &str = "assembled";

impl Engine {
    /// Joins the part files of an ASSEMBLING transfer in index order and
    /// hands the result to the finalizer.
    ///
    /// Store errors propagate so the task is retried. Any other failure marks
    /// the transfer failed and leaves the part files where they are.
    #[instrument(skip(self))]
    pub async fn assemble(&self, key: &str) -> Result<()> {
        let Some(transfer) = Transfer::get(&self.db, key).await? else {
            warn!("Transfer vanished before assembly");
            return Ok(());
        };
        if transfer.status != TransferStatus::Assembling {
            debug!(status = %transfer.status, "Transfer is not assembling");
            return Ok(());
        }
        let chunks = Chunk::for_transfer(&self.db, key).await?;
        if chunks.is_empty() || chunks.iter().any(|c| c.status != ChunkStatus::Completed) {
            warn!(chunks = chunks.len(), "Assembly requested with unfinished chunks");
            return Ok(());
        }

        let placed = match self.concatenate(key, &chunks).await {
            Ok(assembled) => self.finalize(&transfer, &assembled).await,
            Err(e) => Err(e),
        };
        let artifact = match placed {
            Ok(artifact) => artifact,
            Err(e @ TransferError::Database(_)) => return Err(e),
            Err(e) => {
                self.fail_transfer(key, &e.to_string()).await?;
                return Ok(());
            }
        };

        self.settle(key, &artifact).await
    }

    /// Terminal bookkeeping once the artifact is placed. A transfer canceled
    /// while it was being finalized keeps its status, but its scratch state
    /// goes either way.
    async fn settle(&self, key: &str, artifact: &Artifact) -> Result<()> {
        let Some(completed) = Transfer::complete(&self.db, key).await? else {
            warn!(
                artifact = %artifact.key,
                path = ?artifact.path,
                "Transfer left assembling while it was being finalized"
            );
            self.discard_scratch(key).await;
            return Ok(());
        };
        info!(
            artifact = %artifact.key,
            path = ?artifact.path,
            size = ?artifact.size,
            "Transfer completed"
        );

        self.discard_scratch(key).await;
        if let Err(e) = self.broadcast_complete(&completed).await {
            warn!(error = %e, "Could not record final progress");
        }
        self.emit_finished(&completed, Some(artifact));
        self.scheduler.schedule(Task::Pump {
            domain: completed.domain,
        });
        Ok(())
    }

    /// Removes part files and chunk records, logging failures
    async fn discard_scratch(&self, key: &str) {
        if let Err(e) = self.scratch.delete_directory(key).await {
            warn!(error = %e, "Could not remove part files");
        }
        if let Err(e) = Chunk::delete_for_transfer(&self.db, key).await {
            warn!(error = %e, "Could not remove chunk records");
        }
    }

    async fn concatenate(&self, key: &str, chunks: &[Chunk]) -> Result<PathBuf> {
        let dir = self.scratch.make_directory(key).await?;
        let assembled = dir.join(ASSEMBLED);
        let mut out = File::create(&assembled).await?;

        let mut total = 0;
        for chunk in chunks {
            let rel = chunk
                .part_path
                .clone()
                .unwrap_or_else(|| Chunk::part_path_for(key, chunk.index));
            let mut part = match File::open(self.scratch.path(&rel)).await {
                Ok(part) => part,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    return Err(TransferError::MissingPart(chunk.index));
                }
                Err(e) => return Err(e.into()),
            };
            total += tokio::io::copy(&mut part, &mut out).await?;
        }
        out.flush().await?;

        debug!(parts = chunks.len(), bytes = total, "Parts concatenated");
        Ok(assembled)
    }
}
