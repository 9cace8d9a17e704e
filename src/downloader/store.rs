//! Persistence for transfers, chunks and artifacts.
//!
//! Every mutation that has to be exactly-once or monotonic across workers is a
//! single conditional `UPDATE ... WHERE <expected state> RETURN AFTER`; a
//! `None` result means another worker got there first. Writes that lose an
//! optimistic transaction to a concurrent writer are retried here, so callers
//! only ever see a conflict once the retries ran out.

use std::{future::Future, time::Duration};

use chrono::Utc;
use rand::Rng;
use serde::Deserialize;
use tracing::trace;

use super::error::{Result, TransferError, is_conflict};
use super::models::{Artifact, Chunk, ChunkStatus, Transfer, TransferStatus};
use crate::db::{ARTIFACT_TABLE, CHUNK_TABLE, Db, TRANSFER_TABLE};

fn statuses(list: &[TransferStatus]) -> Vec<&'static str> {
    list.iter().map(TransferStatus::as_str).collect()
}

const CONFLICT_RETRIES: u32 = 16;
const CONFLICT_BACKOFF: Duration = Duration::from_millis(2);

/// Runs a write again while it keeps losing to concurrent transactions
async fn retry_conflicts<T, F, Fut>(mut write: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        match write().await {
            Err(e) if e.is_conflict() && attempt < CONFLICT_RETRIES => {
                attempt += 1;
                let jitter = rand::rng().random_range(0..=attempt);
                let delay = CONFLICT_BACKOFF * (attempt + jitter);
                trace!(attempt, ?delay, "Store write conflicted, retrying");
                tokio::time::sleep(delay).await;
            }
            result => return result,
        }
    }
}

/// Surfaces the error of a multi-statement response, preferring a conflict
/// over the "not executed" errors of the statements it canceled
fn check_statements(res: &mut surrealdb::Response) -> Result<()> {
    let mut errors: Vec<_> = res.take_errors().into_values().collect();
    if errors.is_empty() {
        return Ok(());
    }
    let pos = errors.iter().position(is_conflict).unwrap_or(0);
    Err(errors.swap_remove(pos).into())
}

#[derive(Debug, Deserialize)]
struct CountResult {
    count: u64,
}

/// Number of transfers in one status
#[derive(Debug, Clone, Deserialize, serde::Serialize, PartialEq)]
pub struct StatusCount {
    pub status: TransferStatus,
    pub total: u64,
}

/// Facts learned while preparing a transfer
#[derive(Debug, Clone, Default)]
pub struct PlanFacts {
    pub bytes_total: Option<u64>,
    pub chunk_count: u32,
    pub accept_ranges: bool,
    pub content_type: Option<String>,
    pub filename_hint: Option<String>,
}

impl Transfer {
    pub async fn insert(&self, db: &Db) -> Result<()> {
        let _: Option<Transfer> = db
            .create((TRANSFER_TABLE, self.key.clone()))
            .content(self.clone())
            .await?;
        Ok(())
    }

    pub async fn get(db: &Db, key: &str) -> Result<Option<Self>> {
        Ok(db.select((TRANSFER_TABLE, key.to_owned())).await?)
    }

    pub async fn require(db: &Db, key: &str) -> Result<Self> {
        Self::get(db, key)
            .await?
            .ok_or_else(|| TransferError::NotFound(format!("transfer {key}")))
    }

    pub async fn list(
        db: &Db,
        status: Option<TransferStatus>,
        domain: Option<&str>,
    ) -> Result<Vec<Self>> {
        let mut clauses = Vec::new();
        if status.is_some() {
            clauses.push("status = $status");
        }
        if domain.is_some() {
            clauses.push("domain = $domain");
        }
        let mut query = String::from("SELECT * FROM transfer");
        if !clauses.is_empty() {
            query.push_str(" WHERE ");
            query.push_str(&clauses.join(" AND "));
        }
        query.push_str(" ORDER BY key ASC");

        let mut res = db
            .query(query)
            .bind(("status", status.map(|s| s.as_str())))
            .bind(("domain", domain.map(str::to_owned)))
            .await?;
        Ok(res.take(0)?)
    }

    /// Oldest pending transfers of a domain, ULID keys sort by creation time
    pub async fn pending_for_domain(db: &Db, domain: &str, limit: u64) -> Result<Vec<Self>> {
        let mut res = db
            .query(
                "SELECT * FROM transfer WHERE domain = $domain AND status = 'pending' \
                 ORDER BY key ASC LIMIT $limit",
            )
            .bind(("domain", domain.to_owned()))
            .bind(("limit", limit))
            .await?;
        Ok(res.take(0)?)
    }

    /// Domains that currently have at least one pending transfer
    pub async fn pending_domains(db: &Db) -> Result<Vec<String>> {
        let mut res = db
            .query("SELECT VALUE domain FROM transfer WHERE status = 'pending'")
            .await?;
        let mut domains: Vec<String> = res.take(0)?;
        domains.sort();
        domains.dedup();
        Ok(domains)
    }

    /// Counts transfers holding an admission slot, optionally for one domain
    pub async fn count_active(db: &Db, domain: Option<&str>) -> Result<u64> {
        let query = match domain {
            Some(_) => {
                "SELECT count() FROM transfer WHERE status IN $active AND domain = $domain GROUP ALL"
            }
            None => "SELECT count() FROM transfer WHERE status IN $active GROUP ALL",
        };
        let mut res = db
            .query(query)
            .bind(("active", statuses(&TransferStatus::ACTIVE)))
            .bind(("domain", domain.map(str::to_owned)))
            .await?;
        let result: Option<CountResult> = res.take(0)?;
        Ok(result.map(|r| r.count).unwrap_or_default())
    }

    pub async fn stats(db: &Db) -> Result<Vec<StatusCount>> {
        let mut res = db
            .query("SELECT status, count() AS total FROM transfer GROUP BY status")
            .await?;
        Ok(res.take(0)?)
    }

    /// PENDING -> QUEUED, only if the row is still pending
    pub async fn promote(db: &Db, key: &str) -> Result<Option<Self>> {
        retry_conflicts(move || async move {
            let mut res = db
                .query(
                    "UPDATE type::thing('transfer', $key) SET status = 'queued', queued_at = $now \
                     WHERE status = 'pending' RETURN AFTER",
                )
                .bind(("key", key.to_owned()))
                .bind(("now", Utc::now()))
                .await?;
            Ok::<_, TransferError>(res.take(0)?)
        })
        .await
    }

    /// Moves the transfer to `to` if its current status is one of `from`
    pub async fn transition(
        db: &Db,
        key: &str,
        from: &[TransferStatus],
        to: TransferStatus,
    ) -> Result<Option<Self>> {
        retry_conflicts(move || async move {
            let mut res = db
                .query(
                    "UPDATE type::thing('transfer', $key) SET status = $to \
                     WHERE status IN $from RETURN AFTER",
                )
                .bind(("key", key.to_owned()))
                .bind(("from", statuses(from)))
                .bind(("to", to.as_str()))
                .await?;
            Ok::<_, TransferError>(res.take(0)?)
        })
        .await
    }

    /// QUEUED/PREPARING -> DOWNLOADING, stamping `started_at` the first time
    pub async fn start_downloading(db: &Db, key: &str) -> Result<Option<Self>> {
        retry_conflicts(move || async move {
            let mut res = db
                .query(
                    "UPDATE type::thing('transfer', $key) \
                     SET status = 'downloading', started_at = started_at ?? $now \
                     WHERE status IN ['queued', 'preparing'] RETURN AFTER",
                )
                .bind(("key", key.to_owned()))
                .bind(("now", Utc::now()))
                .await?;
            Ok::<_, TransferError>(res.take(0)?)
        })
        .await
    }

    pub async fn record_plan(db: &Db, key: &str, facts: PlanFacts) -> Result<Option<Self>> {
        let facts = &facts;
        retry_conflicts(move || async move {
            let mut res = db
                .query(
                    "UPDATE type::thing('transfer', $key) SET \
                     bytes_total = bytes_total ?? $bytes_total, \
                     chunk_count = $chunk_count, \
                     accept_ranges = $accept_ranges, \
                     content_type = $content_type, \
                     filename_hint = $filename_hint \
                     RETURN AFTER",
                )
                .bind(("key", key.to_owned()))
                .bind(("bytes_total", facts.bytes_total))
                .bind(("chunk_count", facts.chunk_count))
                .bind(("accept_ranges", facts.accept_ranges))
                .bind(("content_type", facts.content_type.clone()))
                .bind(("filename_hint", facts.filename_hint.clone()))
                .await?;
            Ok::<_, TransferError>(res.take(0)?)
        })
        .await
    }

    /// Writes `bytes_total` only if no earlier response established it
    pub async fn set_total_once(db: &Db, key: &str, total: u64) -> Result<Option<Self>> {
        retry_conflicts(move || async move {
            let mut res = db
                .query(
                    "UPDATE type::thing('transfer', $key) SET bytes_total = $total \
                     WHERE !bytes_total RETURN AFTER",
                )
                .bind(("key", key.to_owned()))
                .bind(("total", total))
                .await?;
            Ok::<_, TransferError>(res.take(0)?)
        })
        .await
    }

    /// Raises `last_broadcast_percent`, never lowers it
    pub async fn bump_broadcast(db: &Db, key: &str, boundary: u8) -> Result<Option<Self>> {
        retry_conflicts(move || async move {
            let mut res = db
                .query(
                    "UPDATE type::thing('transfer', $key) SET last_broadcast_percent = $boundary \
                     WHERE last_broadcast_percent < $boundary RETURN AFTER",
                )
                .bind(("key", key.to_owned()))
                .bind(("boundary", boundary))
                .await?;
            Ok::<_, TransferError>(res.take(0)?)
        })
        .await
    }

    /// DOWNLOADING -> ASSEMBLING, only once no chunk is left unfinished.
    ///
    /// Exactly one of several concurrently completing chunks gets the row back.
    pub async fn begin_assembly(db: &Db, key: &str) -> Result<Option<Self>> {
        retry_conflicts(move || async move {
            let mut res = db
                .query(
                    "UPDATE type::thing('transfer', $key) SET status = 'assembling' \
                     WHERE status = 'downloading' \
                     AND array::len((SELECT VALUE key FROM chunk \
                         WHERE transfer = $key AND status != 'completed')) = 0 \
                     RETURN AFTER",
                )
                .bind(("key", key.to_owned()))
                .await?;
            Ok::<_, TransferError>(res.take(0)?)
        })
        .await
    }

    /// ASSEMBLING -> COMPLETED
    pub async fn complete(db: &Db, key: &str) -> Result<Option<Self>> {
        retry_conflicts(move || async move {
            let mut res = db
                .query(
                    "UPDATE type::thing('transfer', $key) \
                     SET status = 'completed', finished_at = $now, last_broadcast_percent = 100 \
                     WHERE status = 'assembling' RETURN AFTER",
                )
                .bind(("key", key.to_owned()))
                .bind(("now", Utc::now()))
                .await?;
            Ok::<_, TransferError>(res.take(0)?)
        })
        .await
    }

    /// Any non-terminal status -> FAILED
    pub async fn fail(db: &Db, key: &str, error: &str) -> Result<Option<Self>> {
        retry_conflicts(move || async move {
            let mut res = db
                .query(
                    "UPDATE type::thing('transfer', $key) \
                     SET status = 'failed', error = $error, failed_at = $now \
                     WHERE status NOT IN $terminal RETURN AFTER",
                )
                .bind(("key", key.to_owned()))
                .bind(("error", error.to_owned()))
                .bind(("now", Utc::now()))
                .bind(("terminal", statuses(&TransferStatus::TERMINAL)))
                .await?;
            Ok::<_, TransferError>(res.take(0)?)
        })
        .await
    }

    /// Any non-terminal status -> CANCELED, raising the flag chunk workers poll
    pub async fn cancel(db: &Db, key: &str) -> Result<Option<Self>> {
        retry_conflicts(move || async move {
            let mut res = db
                .query(
                    "UPDATE type::thing('transfer', $key) \
                     SET status = 'canceled', cancel_requested = true, finished_at = $now \
                     WHERE status NOT IN $terminal RETURN AFTER",
                )
                .bind(("key", key.to_owned()))
                .bind(("now", Utc::now()))
                .bind(("terminal", statuses(&TransferStatus::TERMINAL)))
                .await?;
            Ok::<_, TransferError>(res.take(0)?)
        })
        .await
    }
}

impl Chunk {
    pub async fn insert(&self, db: &Db) -> Result<()> {
        let _: Option<Chunk> = db
            .create((CHUNK_TABLE, self.key.clone()))
            .content(self.clone())
            .await?;
        Ok(())
    }

    pub async fn get(db: &Db, key: &str) -> Result<Option<Self>> {
        Ok(db.select((CHUNK_TABLE, key.to_owned())).await?)
    }

    pub async fn require(db: &Db, key: &str) -> Result<Self> {
        Self::get(db, key)
            .await?
            .ok_or_else(|| TransferError::NotFound(format!("chunk {key}")))
    }

    /// All chunks of a transfer in assembly order
    pub async fn for_transfer(db: &Db, transfer: &str) -> Result<Vec<Self>> {
        let mut res = db
            .query("SELECT * FROM chunk WHERE transfer = $transfer ORDER BY chunk_index ASC")
            .bind(("transfer", transfer.to_owned()))
            .await?;
        Ok(res.take(0)?)
    }

    /// Claims a pending or failed chunk for one worker. `None` means the
    /// chunk is already being downloaded, or is finished.
    pub async fn begin(db: &Db, key: &str, part_path: &str) -> Result<Option<Self>> {
        retry_conflicts(move || async move {
            let mut res = db
                .query(
                    "UPDATE type::thing('chunk', $key) SET status = 'downloading', \
                     started_at = started_at ?? $now, attempts += 1, error = NONE, \
                     part_path = $part_path \
                     WHERE status IN ['pending', 'failed'] RETURN AFTER",
                )
                .bind(("key", key.to_owned()))
                .bind(("now", Utc::now()))
                .bind(("part_path", part_path.to_owned()))
                .await?;
            Ok::<_, TransferError>(res.take(0)?)
        })
        .await
    }

    /// Records `bytes` received for a chunk and adds whatever the chunk row
    /// did not hold yet to its transfer, in one transaction. The chunk row is
    /// therefore always exactly what the transfer total includes for it, and
    /// a retried or resumed run never counts a byte twice.
    ///
    /// Returns the transfer row, `None` once it is terminal.
    pub async fn report_progress(
        db: &Db,
        key: &str,
        transfer: &str,
        bytes: u64,
    ) -> Result<Option<Transfer>> {
        retry_conflicts(move || async move {
            let mut res = db
                .query(
                    "BEGIN TRANSACTION;
                     LET $before = (SELECT VALUE bytes_downloaded FROM ONLY type::thing('chunk', $key)) ?? 0;
                     LET $delta = math::max([$bytes - $before, 0]);
                     UPDATE type::thing('chunk', $key) SET bytes_downloaded = $bytes \
                         WHERE bytes_downloaded < $bytes;
                     UPDATE type::thing('transfer', $transfer) SET bytes_downloaded += $delta \
                         WHERE status NOT IN $terminal RETURN AFTER;
                     COMMIT TRANSACTION;",
                )
                .bind(("key", key.to_owned()))
                .bind(("transfer", transfer.to_owned()))
                .bind(("bytes", bytes))
                .bind(("terminal", statuses(&TransferStatus::TERMINAL)))
                .await?;
            check_statements(&mut res)?;
            let last = res.num_statements().saturating_sub(1);
            Ok::<_, TransferError>(res.take(last)?)
        })
        .await
    }

    /// DOWNLOADING -> PENDING for a chunk stopped by a pause
    pub async fn release(db: &Db, key: &str) -> Result<Option<Self>> {
        retry_conflicts(move || async move {
            let mut res = db
                .query(
                    "UPDATE type::thing('chunk', $key) SET status = 'pending' \
                     WHERE status = 'downloading' RETURN AFTER",
                )
                .bind(("key", key.to_owned()))
                .await?;
            Ok::<_, TransferError>(res.take(0)?)
        })
        .await
    }

    /// Frees chunks a stopped process left claimed, so they can be claimed again
    pub async fn release_all(db: &Db, transfer: &str) -> Result<()> {
        retry_conflicts(move || async move {
            db.query(
                "UPDATE chunk SET status = 'pending' \
                 WHERE transfer = $transfer AND status = 'downloading'",
            )
            .bind(("transfer", transfer.to_owned()))
            .await?
            .check()?;
            Ok::<_, TransferError>(())
        })
        .await
    }

    pub async fn set_status(db: &Db, key: &str, status: ChunkStatus) -> Result<()> {
        retry_conflicts(move || async move {
            db.query("UPDATE type::thing('chunk', $key) SET status = $status")
                .bind(("key", key.to_owned()))
                .bind(("status", status.as_str()))
                .await?
                .check()?;
            Ok::<_, TransferError>(())
        })
        .await
    }

    pub async fn complete(db: &Db, key: &str, bytes: u64) -> Result<Option<Self>> {
        retry_conflicts(move || async move {
            let mut res = db
                .query(
                    "UPDATE type::thing('chunk', $key) SET status = 'completed', \
                     bytes_downloaded = $bytes, finished_at = $now, error = NONE RETURN AFTER",
                )
                .bind(("key", key.to_owned()))
                .bind(("bytes", bytes))
                .bind(("now", Utc::now()))
                .await?;
            Ok::<_, TransferError>(res.take(0)?)
        })
        .await
    }

    pub async fn fail(db: &Db, key: &str, error: &str) -> Result<Option<Self>> {
        retry_conflicts(move || async move {
            let mut res = db
                .query(
                    "UPDATE type::thing('chunk', $key) SET status = 'failed', error = $error, \
                     failed_at = $now WHERE status != 'completed' RETURN AFTER",
                )
                .bind(("key", key.to_owned()))
                .bind(("error", error.to_owned()))
                .bind(("now", Utc::now()))
                .await?;
            Ok::<_, TransferError>(res.take(0)?)
        })
        .await
    }

    pub async fn delete_for_transfer(db: &Db, transfer: &str) -> Result<()> {
        retry_conflicts(move || async move {
            db.query("DELETE chunk WHERE transfer = $transfer")
                .bind(("transfer", transfer.to_owned()))
                .await?
                .check()?;
            Ok::<_, TransferError>(())
        })
        .await
    }
}

/// Fields the finalizer writes onto an artifact
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Placement {
    pub path: String,
    pub filename: String,
    pub extension: String,
    pub mime_type: String,
    pub size: u64,
    pub thumbnail_path: Option<String>,
}

impl Artifact {
    pub async fn insert(&self, db: &Db) -> Result<()> {
        let _: Option<Artifact> = db
            .create((ARTIFACT_TABLE, self.key.clone()))
            .content(self.clone())
            .await?;
        Ok(())
    }

    pub async fn get(db: &Db, key: &str) -> Result<Option<Self>> {
        Ok(db.select((ARTIFACT_TABLE, key.to_owned())).await?)
    }

    pub async fn require(db: &Db, key: &str) -> Result<Self> {
        Self::get(db, key)
            .await?
            .ok_or_else(|| TransferError::NotFound(format!("artifact {key}")))
    }

    pub async fn set_progress(db: &Db, key: &str, percent: u8) -> Result<()> {
        retry_conflicts(move || async move {
            db.query("UPDATE type::thing('artifact', $key) SET download_progress = $percent")
                .bind(("key", key.to_owned()))
                .bind(("percent", percent))
                .await?
                .check()?;
            Ok::<_, TransferError>(())
        })
        .await
    }

    /// Records a successful placement and lifts any earlier blacklisting.
    /// The artifact's own content hash is left as it was.
    pub async fn mark_downloaded(db: &Db, key: &str, placement: Placement) -> Result<Self> {
        let placement = &placement;
        let updated: Option<Self> = retry_conflicts(move || async move {
            let mut res = db
                .query(
                    "UPDATE type::thing('artifact', $key) SET \
                     path = $path, filename = $filename, extension = $extension, \
                     mime_type = $mime_type, size = $size, \
                     thumbnail_path = $thumbnail_path, downloaded = true, downloaded_at = $now, \
                     download_progress = 100, blacklisted_at = NONE, blacklist_reason = NONE \
                     RETURN AFTER",
                )
                .bind(("key", key.to_owned()))
                .bind(("path", placement.path.clone()))
                .bind(("filename", placement.filename.clone()))
                .bind(("extension", placement.extension.clone()))
                .bind(("mime_type", placement.mime_type.clone()))
                .bind(("size", placement.size))
                .bind(("thumbnail_path", placement.thumbnail_path.clone()))
                .bind(("now", Utc::now()))
                .await?;
            Ok::<_, TransferError>(res.take(0)?)
        })
        .await?;
        updated.ok_or_else(|| TransferError::NotFound(format!("artifact {key}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory_db;
    use crate::downloader::models::ByteRange;

    #[tokio::test]
    async fn test_transfer_roundtrip() {
        let db = memory_db().await;
        let transfer = Transfer::new("art", "https://example.com/a.bin", "example.com");
        transfer.insert(&db).await.unwrap();

        let loaded = Transfer::require(&db, &transfer.key).await.unwrap();
        assert_eq!(loaded.key, transfer.key);
        assert_eq!(loaded.status, TransferStatus::Pending);
        assert_eq!(loaded.bytes_total, None);
        assert!(Transfer::get(&db, "missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_promote_is_conditional() {
        let db = memory_db().await;
        let transfer = Transfer::new("art", "https://example.com/a.bin", "example.com");
        transfer.insert(&db).await.unwrap();

        let first = Transfer::promote(&db, &transfer.key).await.unwrap();
        assert_eq!(first.unwrap().status, TransferStatus::Queued);
        assert!(Transfer::promote(&db, &transfer.key).await.unwrap().is_none());
        assert!(Transfer::promote(&db, "missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_total_is_written_once() {
        let db = memory_db().await;
        let transfer = Transfer::new("art", "https://example.com/a.bin", "example.com");
        transfer.insert(&db).await.unwrap();

        assert!(Transfer::set_total_once(&db, &transfer.key, 100).await.unwrap().is_some());
        assert!(Transfer::set_total_once(&db, &transfer.key, 200).await.unwrap().is_none());
        let loaded = Transfer::require(&db, &transfer.key).await.unwrap();
        assert_eq!(loaded.bytes_total, Some(100));
    }

    /// A downloading transfer with one chunk per range
    async fn with_chunks(db: &Db, ranges: &[ByteRange]) -> (Transfer, Vec<Chunk>) {
        let mut transfer = Transfer::new("art", "https://example.com/a.bin", "example.com");
        transfer.status = TransferStatus::Downloading;
        transfer.chunk_count = ranges.len() as u32;
        transfer.insert(db).await.unwrap();
        let mut chunks = Vec::new();
        for (index, range) in ranges.iter().enumerate() {
            let chunk = Chunk::new(&transfer.key, index as u32, *range);
            chunk.insert(db).await.unwrap();
            chunks.push(chunk);
        }
        (transfer, chunks)
    }

    #[tokio::test]
    async fn test_reported_progress_sums_and_stops_when_terminal() {
        let db = memory_db().await;
        let (transfer, chunks) =
            with_chunks(&db, &[ByteRange::bounded(0, 99), ByteRange::bounded(100, 199)]).await;

        Chunk::report_progress(&db, &chunks[0].key, &transfer.key, 10).await.unwrap();
        Chunk::report_progress(&db, &chunks[1].key, &transfer.key, 30).await.unwrap();
        let updated = Chunk::report_progress(&db, &chunks[0].key, &transfer.key, 15)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.bytes_downloaded, 45);

        // A restarted run reporting less than the row holds adds nothing
        let updated = Chunk::report_progress(&db, &chunks[0].key, &transfer.key, 5)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.bytes_downloaded, 45);
        assert_eq!(Chunk::require(&db, &chunks[0].key).await.unwrap().bytes_downloaded, 15);

        Transfer::fail(&db, &transfer.key, "boom").await.unwrap().unwrap();
        assert!(
            Chunk::report_progress(&db, &chunks[0].key, &transfer.key, 50)
                .await
                .unwrap()
                .is_none()
        );
        let loaded = Transfer::require(&db, &transfer.key).await.unwrap();
        assert_eq!(loaded.bytes_downloaded, 45);
        assert!(loaded.failed_at.is_some());
        assert!(loaded.finished_at.is_none());
    }

    #[tokio::test]
    async fn test_concurrent_reports_sum_exactly() {
        let db = memory_db().await;
        let ranges: Vec<_> = (0..8u64)
            .map(|i| ByteRange::bounded(i * 1000, i * 1000 + 999))
            .collect();
        let (transfer, chunks) = with_chunks(&db, &ranges).await;

        let writers = chunks.into_iter().map(|chunk| {
            let db = db.clone();
            let transfer = transfer.key.clone();
            tokio::spawn(async move {
                for bytes in (1..=1000u64).step_by(37).chain([1000]) {
                    Chunk::report_progress(&db, &chunk.key, &transfer, bytes)
                        .await
                        .unwrap();
                }
            })
        });
        for writer in writers.collect::<Vec<_>>() {
            writer.await.unwrap();
        }

        let loaded = Transfer::require(&db, &transfer.key).await.unwrap();
        assert_eq!(loaded.bytes_downloaded, 8000);
    }

    #[tokio::test]
    async fn test_chunk_is_claimed_once() {
        let db = memory_db().await;
        let (_, chunks) = with_chunks(&db, &[ByteRange::bounded(0, 9)]).await;
        let key = &chunks[0].key;

        let claimed = Chunk::begin(&db, key, "part").await.unwrap().unwrap();
        assert_eq!(claimed.status, ChunkStatus::Downloading);
        assert_eq!(claimed.attempts, 1);
        assert!(Chunk::begin(&db, key, "part").await.unwrap().is_none());

        // Failed and released chunks can be claimed again
        Chunk::fail(&db, key, "reset").await.unwrap().unwrap();
        assert!(Chunk::begin(&db, key, "part").await.unwrap().is_some());
        assert!(Chunk::release(&db, key).await.unwrap().is_some());
        assert!(Chunk::release(&db, key).await.unwrap().is_none());
        let again = Chunk::begin(&db, key, "part").await.unwrap().unwrap();
        assert_eq!(again.attempts, 3);

        Chunk::complete(&db, key, 10).await.unwrap();
        assert!(Chunk::begin(&db, key, "part").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_release_all_frees_claimed_chunks() {
        let db = memory_db().await;
        let (transfer, chunks) =
            with_chunks(&db, &[ByteRange::bounded(0, 9), ByteRange::bounded(10, 19)]).await;
        Chunk::begin(&db, &chunks[0].key, "part").await.unwrap().unwrap();
        Chunk::complete(&db, &chunks[1].key, 10).await.unwrap();

        Chunk::release_all(&db, &transfer.key).await.unwrap();

        let statuses: Vec<_> = Chunk::for_transfer(&db, &transfer.key)
            .await
            .unwrap()
            .into_iter()
            .map(|c| c.status)
            .collect();
        assert_eq!(statuses, vec![ChunkStatus::Pending, ChunkStatus::Completed]);
    }

    #[tokio::test]
    async fn test_terminal_states_are_final() {
        let db = memory_db().await;
        let transfer = Transfer::new("art", "https://example.com/a.bin", "example.com");
        transfer.insert(&db).await.unwrap();

        let canceled = Transfer::cancel(&db, &transfer.key).await.unwrap().unwrap();
        assert_eq!(canceled.status, TransferStatus::Canceled);
        assert!(canceled.cancel_requested);
        assert!(canceled.finished_at.is_some());

        assert!(Transfer::fail(&db, &transfer.key, "late").await.unwrap().is_none());
        let loaded = Transfer::require(&db, &transfer.key).await.unwrap();
        assert_eq!(loaded.status, TransferStatus::Canceled);
        assert!(loaded.failed_at.is_none());
        assert!(loaded.error.is_none());
    }

    #[tokio::test]
    async fn test_begin_assembly_waits_for_every_chunk() {
        let db = memory_db().await;
        let mut transfer = Transfer::new("art", "https://example.com/a.bin", "example.com");
        transfer.status = TransferStatus::Downloading;
        transfer.insert(&db).await.unwrap();
        for (index, range) in [ByteRange::bounded(0, 2), ByteRange::bounded(3, 5)]
            .into_iter()
            .enumerate()
        {
            Chunk::new(&transfer.key, index as u32, range).insert(&db).await.unwrap();
        }

        let first = Chunk::key_for(&transfer.key, 0);
        let second = Chunk::key_for(&transfer.key, 1);
        Chunk::complete(&db, &second, 3).await.unwrap();
        assert!(Transfer::begin_assembly(&db, &transfer.key).await.unwrap().is_none());

        Chunk::complete(&db, &first, 3).await.unwrap();
        let assembling = Transfer::begin_assembly(&db, &transfer.key).await.unwrap();
        assert_eq!(assembling.unwrap().status, TransferStatus::Assembling);
        assert!(Transfer::begin_assembly(&db, &transfer.key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_chunks_come_back_in_index_order() {
        let db = memory_db().await;
        for index in [2u32, 0, 1] {
            Chunk::new("t", index, ByteRange::bounded(u64::from(index) * 10, u64::from(index) * 10 + 9))
                .insert(&db)
                .await
                .unwrap();
        }
        let chunks = Chunk::for_transfer(&db, "t").await.unwrap();
        let order: Vec<u32> = chunks.iter().map(|c| c.index).collect();
        assert_eq!(order, vec![0, 1, 2]);

        Chunk::delete_for_transfer(&db, "t").await.unwrap();
        assert!(Chunk::for_transfer(&db, "t").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_mark_downloaded_clears_blacklist() {
        let db = memory_db().await;
        let mut artifact = Artifact::new("https://example.com/a.png", None);
        artifact.hash = Some("c0ffee".into());
        artifact.blacklisted_at = Some(Utc::now());
        artifact.blacklist_reason = Some("missing".into());
        artifact.insert(&db).await.unwrap();

        let updated = Artifact::mark_downloaded(
            &db,
            &artifact.key,
            Placement {
                path: "ab/cd/a.png".into(),
                filename: "a.png".into(),
                extension: "png".into(),
                mime_type: "image/png".into(),
                size: 10,
                thumbnail_path: None,
            },
        )
        .await
        .unwrap();
        assert!(updated.downloaded);
        assert!(updated.downloaded_at.is_some());
        assert_eq!(updated.path.as_deref(), Some("ab/cd/a.png"));
        assert!(updated.blacklisted_at.is_none());
        assert!(updated.blacklist_reason.is_none());
        assert_eq!(updated.hash.as_deref(), Some("c0ffee"));
    }

    #[tokio::test]
    async fn test_counts() {
        let db = memory_db().await;
        for (domain, status) in [
            ("a.com", TransferStatus::Queued),
            ("a.com", TransferStatus::Downloading),
            ("a.com", TransferStatus::Pending),
            ("b.com", TransferStatus::Paused),
            ("b.com", TransferStatus::Completed),
        ] {
            let mut transfer = Transfer::new("art", format!("https://{domain}/x"), domain);
            transfer.status = status;
            transfer.insert(&db).await.unwrap();
        }

        assert_eq!(Transfer::count_active(&db, None).await.unwrap(), 3);
        assert_eq!(Transfer::count_active(&db, Some("a.com")).await.unwrap(), 2);
        assert_eq!(Transfer::count_active(&db, Some("c.com")).await.unwrap(), 0);
        assert_eq!(Transfer::pending_domains(&db).await.unwrap(), vec!["a.com".to_string()]);

        let stats = Transfer::stats(&db).await.unwrap();
        let queued = stats.iter().find(|s| s.status == TransferStatus::Queued).unwrap();
        assert_eq!(queued.total, 1);
    }
}
