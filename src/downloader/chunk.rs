//! Streaming download of a single chunk into its part file.

use std::{
    io::SeekFrom,
    time::{Duration, Instant},
};

use futures_util::StreamExt;
use reqwest::{StatusCode, header};
use tokio::{
    fs::{File, OpenOptions},
    io::{AsyncSeekExt, AsyncWriteExt},
};
use tracing::{debug, info, instrument, trace, warn};

use super::engine::{Engine, outcome};
use super::error::{Result, TransferError};
use super::http::{header_str, parse_content_range};
use super::models::{ByteRange, Chunk, ChunkStatus, Transfer, TransferStatus};
use super::queue::{Task, TaskOutcome};

/// Progress is persisted at least this often while bytes are flowing
const FLUSH_INTERVAL: Duration = Duration::from_millis(500);

/// How a chunk task ended when it did not fail
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkRun {
    Completed,
    /// The chunk had already been completed by an earlier run
    AlreadyDone,
    /// Another run holds the claim on the chunk
    Busy,
    Canceled,
    /// Left pending for the resume operation to reschedule
    Paused,
}

/// Byte counters of one claimed run
struct Counters<'a> {
    chunk: &'a str,
    transfer: &'a str,
    received: u64,
}

impl Engine {
    pub(crate) async fn run_chunk(&self, key: &str) -> TaskOutcome {
        match self.download_chunk(key).await {
            Ok(run) => {
                debug!(chunk = %key, ?run, "Chunk task finished");
                TaskOutcome::Done
            }
            Err(e) => {
                warn!(chunk = %key, error = %e, transient = e.is_transient(), "Chunk download failed");
                outcome(Err(e))
            }
        }
    }

    /// Claims a chunk and streams it. Only the run holding the claim writes
    /// to the part file or the chunk row, so a redelivered task for a chunk
    /// in flight returns [`ChunkRun::Busy`] without side effects.
    #[instrument(skip(self))]
    pub async fn download_chunk(&self, key: &str) -> Result<ChunkRun> {
        let chunk = Chunk::require(&self.db, key).await?;
        if chunk.status == ChunkStatus::Completed {
            // A store error may have interrupted the run that completed it
            self.try_begin_assembly(&chunk.transfer).await?;
            return Ok(ChunkRun::AlreadyDone);
        }

        let transfer = Transfer::require(&self.db, &chunk.transfer).await?;
        if transfer.is_terminal() || transfer.cancel_requested {
            if chunk.status != ChunkStatus::Downloading {
                Chunk::set_status(&self.db, key, ChunkStatus::Canceled).await?;
            }
            return Ok(ChunkRun::Canceled);
        }
        if transfer.status == TransferStatus::Paused {
            // Unclaimed, so resume sees it as pending or failed
            return Ok(ChunkRun::Paused);
        }

        let part_rel = Chunk::part_path_for(&transfer.key, chunk.index);
        let Some(chunk) = Chunk::begin(&self.db, key, &part_rel).await? else {
            debug!("Chunk already claimed");
            return Ok(ChunkRun::Busy);
        };

        match self.fetch_claimed(&transfer, &chunk, &part_rel).await {
            Err(e) => {
                if let Err(store) = Chunk::fail(&self.db, key, &e.to_string()).await {
                    warn!(error = %store, "Could not record chunk failure");
                }
                Err(e)
            }
            ran => ran,
        }
    }

    async fn fetch_claimed(&self, transfer: &Transfer, chunk: &Chunk, part_rel: &str) -> Result<ChunkRun> {
        let key = chunk.key.as_str();
        Transfer::start_downloading(&self.db, &transfer.key).await?;

        let part_path = self.scratch.path(part_rel);
        if let Some(parent) = part_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&part_path)
            .await?;

        // Never trust bytes on disk beyond what was recorded
        let expected = chunk.len();
        let on_disk = file.metadata().await?.len();
        let mut resume = on_disk.min(chunk.bytes_downloaded);
        if let Some(expected) = expected {
            resume = resume.min(expected);
        }
        file.set_len(resume).await?;
        file.seek(SeekFrom::Start(resume)).await?;

        let mut counters = Counters {
            chunk: key,
            transfer: &transfer.key,
            received: resume,
        };

        if expected.is_some_and(|len| resume >= len) {
            debug!(resume, "Part file already complete");
            return self.complete_chunk(&mut file, &mut counters, expected).await;
        }

        let sole = transfer.chunk_count <= 1;
        let start = chunk.range_start + resume;
        let range = (!(sole && start == 0)).then_some(ByteRange {
            start,
            end: chunk.range_end,
        });
        if resume > 0 {
            info!(resume, "Resuming chunk");
        }

        let response = self.http.fetch(&transfer.url, range).await?;
        match response.status() {
            StatusCode::PARTIAL_CONTENT if range.is_some() => {
                let content_range = header_str(response.headers(), header::CONTENT_RANGE)
                    .and_then(parse_content_range)
                    .ok_or_else(|| {
                        TransferError::BadRange("206 without a valid Content-Range".into())
                    })?;
                if content_range.start != start {
                    return Err(TransferError::BadRange(format!(
                        "asked for offset {start}, got {}",
                        content_range.start
                    )));
                }
                if let Some(total) = content_range.total {
                    Transfer::set_total_once(&self.db, &transfer.key, total).await?;
                }
            }
            StatusCode::OK => {
                if range.is_some() {
                    if !sole || chunk.range_start != 0 {
                        return Err(TransferError::BadRange(
                            "server ignored the Range header".into(),
                        ));
                    }
                    info!(resume, "Server ignored the resume range, restarting chunk");
                    file.set_len(0).await?;
                    file.seek(SeekFrom::Start(0)).await?;
                    counters.received = 0;
                }
                let length = header_str(response.headers(), header::CONTENT_LENGTH)
                    .and_then(|v| v.parse::<u64>().ok());
                if let Some(length) = length.filter(|len| *len > 0) {
                    Transfer::set_total_once(&self.db, &transfer.key, length).await?;
                }
            }
            status => return Err(TransferError::Status(status)),
        }

        let timeout = self.http.timeout();
        let mut stream = response.bytes_stream();
        let mut unflushed = 0u64;
        let mut last_flush = Instant::now();

        while let Some(bytes) = tokio::time::timeout(timeout, stream.next())
            .await
            .map_err(|_| TransferError::Timeout(timeout))?
        {
            let bytes = bytes?;
            let len = bytes.len() as u64;
            if let Some(expected) = expected {
                if counters.received + len > expected {
                    return Err(TransferError::Overflow { expected });
                }
            }
            file.write_all(&bytes).await?;
            counters.received += len;
            unflushed += len;
            trace!(received = counters.received, "Received bytes");

            if unflushed >= self.settings.progress_flush_bytes
                || last_flush.elapsed() >= FLUSH_INTERVAL
            {
                let transfer = self.flush_progress(&mut file, &counters).await?;
                if let Some(run) = self.stop_claimed(&transfer, key).await? {
                    info!(?run, received = counters.received, "Chunk stopped mid-stream");
                    return Ok(run);
                }
                unflushed = 0;
                last_flush = Instant::now();
            }
        }

        self.complete_chunk(&mut file, &mut counters, expected).await
    }

    async fn complete_chunk(
        &self,
        file: &mut File,
        counters: &mut Counters<'_>,
        expected: Option<u64>,
    ) -> Result<ChunkRun> {
        if expected.is_none() {
            // Open-ended chunk, the stream end tells the size
            Transfer::set_total_once(&self.db, counters.transfer, counters.received).await?;
        }
        self.flush_progress(file, counters).await?;

        if let Some(expected) = expected {
            if counters.received < expected {
                return Err(TransferError::Truncated {
                    expected,
                    received: counters.received,
                });
            }
        }

        Chunk::complete(&self.db, counters.chunk, counters.received).await?;
        info!(bytes = counters.received, "Chunk complete");
        self.try_begin_assembly(counters.transfer).await?;
        Ok(ChunkRun::Completed)
    }

    /// Persists the part file and counters, then returns the fresh transfer
    /// row for the caller to poll control flags on
    async fn flush_progress(&self, file: &mut File, counters: &Counters<'_>) -> Result<Transfer> {
        file.flush().await?;
        Chunk::report_progress(&self.db, counters.chunk, counters.transfer, counters.received)
            .await?;
        self.maybe_broadcast(counters.transfer).await?;
        Transfer::require(&self.db, counters.transfer).await
    }

    /// Gives up the claim on a chunk whose transfer asks it to stop.
    ///
    /// A pause releases the chunk back to pending. A resume that read the
    /// chunk before the release skipped it, so the transfer is read again
    /// afterwards and the chunk rescheduled if it is no longer paused.
    async fn stop_claimed(&self, transfer: &Transfer, key: &str) -> Result<Option<ChunkRun>> {
        if transfer.is_terminal() || transfer.cancel_requested {
            Chunk::set_status(&self.db, key, ChunkStatus::Canceled).await?;
            return Ok(Some(ChunkRun::Canceled));
        }
        if transfer.status != TransferStatus::Paused {
            return Ok(None);
        }

        Chunk::release(&self.db, key).await?;
        let current = Transfer::require(&self.db, &transfer.key).await?;
        if current.status != TransferStatus::Paused && !current.is_terminal() {
            info!(status = %current.status, "Transfer resumed while pausing, rescheduling chunk");
            self.scheduler.schedule(Task::DownloadChunk {
                chunk: key.to_string(),
            });
        }
        Ok(Some(ChunkRun::Paused))
    }
}
