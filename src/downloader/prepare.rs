use tracing::{debug, info, instrument, warn};

use super::engine::Engine;
use super::error::Result;
use super::http::RemoteHead;
use super::models::{Chunk, Transfer, TransferStatus};
use super::plan::plan;
use super::queue::Task;
use super::store::PlanFacts;

impl Engine {
    /// Inspects a queued transfer, plans its chunks and fans them out.
    ///
    /// Safe to run again: a transfer that already has its full set of chunks
    /// only gets its unfinished chunks rescheduled.
    #[instrument(skip(self))]
    pub async fn start(&self, key: &str) -> Result<()> {
        let Some(transfer) = Transfer::get(&self.db, key).await? else {
            warn!("Transfer vanished before it could start");
            return Ok(());
        };

        match transfer.status {
            TransferStatus::Queued => {
                let from = [TransferStatus::Queued];
                if Transfer::transition(&self.db, key, &from, TransferStatus::Preparing)
                    .await?
                    .is_none()
                {
                    debug!("Transfer left the queue before preparing");
                    return Ok(());
                }
            }
            TransferStatus::Preparing => debug!("Resuming preparation"),
            status => {
                debug!(%status, "Transfer is not startable");
                return Ok(());
            }
        }

        let existing = Chunk::for_transfer(&self.db, key).await?;
        if transfer.chunk_count > 0 && existing.len() == transfer.chunk_count as usize {
            info!(chunks = existing.len(), "Transfer already planned, rescheduling");
            if Transfer::start_downloading(&self.db, key).await?.is_some() {
                self.schedule_unfinished(key).await?;
            }
            return Ok(());
        }
        if !existing.is_empty() {
            // Partially written plan, start over
            Chunk::delete_for_transfer(&self.db, key).await?;
        }

        let head = match self.http.inspect(&transfer.url).await {
            Ok(head) => head,
            Err(e) => {
                warn!(error = %e, "HEAD request failed, planning for an unknown size");
                RemoteHead::default()
            }
        };

        let chunk_count = if head.accept_ranges {
            self.settings.chunk_count
        } else {
            1
        };
        let ranges = plan(
            head.content_length,
            chunk_count,
            self.settings.min_bytes_for_chunking,
        );
        let chunks: Vec<Chunk> = ranges
            .into_iter()
            .enumerate()
            .map(|(index, range)| Chunk::new(key, index as u32, range))
            .collect();

        Transfer::record_plan(
            &self.db,
            key,
            PlanFacts {
                bytes_total: head.content_length.filter(|len| *len > 0),
                chunk_count: chunks.len() as u32,
                accept_ranges: head.accept_ranges,
                content_type: head.content_type,
                filename_hint: head.filename,
            },
        )
        .await?;
        for chunk in &chunks {
            chunk.insert(&self.db).await?;
        }

        if Transfer::start_downloading(&self.db, key).await?.is_none() {
            debug!("Transfer was paused or canceled while preparing");
            return Ok(());
        }

        info!(
            chunks = chunks.len(),
            bytes = ?head.content_length,
            ranges = head.accept_ranges,
            "Transfer planned"
        );
        for chunk in chunks {
            self.scheduler.schedule(Task::DownloadChunk { chunk: chunk.key });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use axum::http::StatusCode;

    use super::*;
    use crate::downloader::models::{ByteRange, ChunkStatus};
    use crate::downloader::testutil::{Fixture, harness, patterned, serve};

    async fn queued(engine: &Engine, url: String) -> Transfer {
        let mut transfer = Transfer::new("art", url, "127.0.0.1");
        transfer.status = TransferStatus::Queued;
        transfer.insert(engine.db()).await.unwrap();
        transfer
    }

    #[tokio::test]
    async fn test_start_plans_ranged_chunks() {
        let server = serve(Fixture::new(patterned(1000)).content_type("application/pdf")).await;
        let mut h = harness(|s| s.min_bytes_for_chunking = 100).await;
        let transfer = queued(&h.engine, server.url("/file")).await;

        h.engine.start(&transfer.key).await.unwrap();

        let started = Transfer::require(h.engine.db(), &transfer.key).await.unwrap();
        assert_eq!(started.status, TransferStatus::Downloading);
        assert_eq!(started.bytes_total, Some(1000));
        assert_eq!(started.chunk_count, 4);
        assert!(started.accept_ranges);
        assert_eq!(started.content_type.as_deref(), Some("application/pdf"));
        assert!(started.started_at.is_some());

        let chunks = Chunk::for_transfer(h.engine.db(), &transfer.key).await.unwrap();
        assert_eq!(chunks.len(), 4);
        assert_eq!(chunks[3].range_end, Some(999));
        assert!(chunks.iter().all(|c| c.status == ChunkStatus::Pending));

        let downloads = h
            .take_tasks()
            .into_iter()
            .filter(|t| matches!(t, Task::DownloadChunk { .. }))
            .count();
        assert_eq!(downloads, 4);
    }

    #[tokio::test]
    async fn test_no_range_support_means_one_chunk() {
        let server = serve(Fixture::new(patterned(1000)).no_ranges()).await;
        let h = harness(|s| s.min_bytes_for_chunking = 100).await;
        let transfer = queued(&h.engine, server.url("/file")).await;

        h.engine.start(&transfer.key).await.unwrap();

        let chunks = Chunk::for_transfer(h.engine.db(), &transfer.key).await.unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].range_end, Some(999));
    }

    #[tokio::test]
    async fn test_failed_head_is_not_fatal() {
        let server = serve(Fixture::new(patterned(10)).head_status(StatusCode::METHOD_NOT_ALLOWED)).await;
        let h = harness(|_| {}).await;
        let transfer = queued(&h.engine, server.url("/file")).await;

        h.engine.start(&transfer.key).await.unwrap();

        let started = Transfer::require(h.engine.db(), &transfer.key).await.unwrap();
        assert_eq!(started.status, TransferStatus::Downloading);
        assert_eq!(started.bytes_total, None);
        let chunks = Chunk::for_transfer(h.engine.db(), &transfer.key).await.unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].range_end, None);
    }

    #[tokio::test]
    async fn test_restart_reuses_existing_plan() {
        let mut h = harness(|_| {}).await;
        let mut transfer = Transfer::new("art", "http://127.0.0.1:9/never", "127.0.0.1");
        transfer.status = TransferStatus::Preparing;
        transfer.chunk_count = 2;
        transfer.insert(h.engine.db()).await.unwrap();
        let mut done = Chunk::new(&transfer.key, 0, ByteRange::bounded(0, 9));
        done.status = ChunkStatus::Completed;
        done.insert(h.engine.db()).await.unwrap();
        Chunk::new(&transfer.key, 1, ByteRange::bounded(10, 19))
            .insert(h.engine.db())
            .await
            .unwrap();

        h.engine.start(&transfer.key).await.unwrap();

        let tasks = h.take_tasks();
        assert_eq!(
            tasks,
            vec![Task::DownloadChunk {
                chunk: Chunk::key_for(&transfer.key, 1)
            }]
        );
    }

    #[tokio::test]
    async fn test_only_queued_transfers_start() {
        let mut h = harness(|_| {}).await;
        let transfer = Transfer::new("art", "http://127.0.0.1:9/x", "127.0.0.1");
        transfer.insert(h.engine.db()).await.unwrap();

        h.engine.start(&transfer.key).await.unwrap();
        h.engine.start("missing").await.unwrap();

        assert!(h.take_tasks().is_empty());
        let untouched = Transfer::require(h.engine.db(), &transfer.key).await.unwrap();
        assert_eq!(untouched.status, TransferStatus::Pending);
    }
}
