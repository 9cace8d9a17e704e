//! Throttled progress notifications.
//!
//! Events fire only when a transfer crosses a 5% boundary, and the boundary
//! stored on the row only ever moves up, so concurrent chunk workers never
//! emit the same percentage twice or go backwards. Boundaries stop at 95
//! while bytes are flowing; 100 is announced once, on completion.

use tracing::{debug, instrument};

use super::engine::Engine;
use super::error::Result;
use super::models::{Artifact, Transfer};

const STEP: u8 = 5;
/// Highest boundary announced before the transfer is complete
const RUNNING_CAP: u8 = 100 - STEP;

/// Highest 5% boundary reached, `None` while the total is unknown
pub fn boundary_percent(downloaded: u64, total: u64) -> Option<u8> {
    if total == 0 {
        return None;
    }
    let percent = u128::from(downloaded.min(total)) * 100 / u128::from(total);
    Some(percent as u8 / STEP * STEP)
}

impl Engine {
    /// Emits a progress event if the transfer crossed a new boundary.
    /// Returns the boundary that was announced.
    #[instrument(level = "debug", skip(self))]
    pub async fn maybe_broadcast(&self, key: &str) -> Result<Option<u8>> {
        let transfer = Transfer::require(&self.db, key).await?;
        let Some(boundary) = transfer
            .bytes_total
            .and_then(|total| boundary_percent(transfer.bytes_downloaded, total))
            .map(|boundary| boundary.min(RUNNING_CAP))
        else {
            return Ok(None);
        };
        if boundary <= transfer.last_broadcast_percent {
            return Ok(None);
        }

        let Some(updated) = Transfer::bump_broadcast(&self.db, key, boundary).await? else {
            debug!(boundary, "Boundary already announced by another worker");
            return Ok(None);
        };
        self.emit_progress(&updated, boundary);
        Artifact::set_progress(&self.db, &updated.artifact, boundary).await?;
        Ok(Some(boundary))
    }

    /// The only 100% event of a transfer, sent once it is complete
    pub async fn broadcast_complete(&self, transfer: &Transfer) -> Result<()> {
        self.emit_progress(transfer, 100);
        Artifact::set_progress(&self.db, &transfer.artifact, 100).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Db;
    use crate::downloader::models::TransferStatus;
    use crate::downloader::testutil::harness;

    async fn add_bytes(db: &Db, key: &str, delta: u64) {
        db.query("UPDATE type::thing('transfer', $key) SET bytes_downloaded += $delta")
            .bind(("key", key.to_owned()))
            .bind(("delta", delta))
            .await
            .unwrap()
            .check()
            .unwrap();
    }

    const TOTAL: u64 = 100 * 1024 * 1024;

    #[test]
    fn test_boundaries() {
        assert_eq!(boundary_percent(0, 100), Some(0));
        assert_eq!(boundary_percent(4, 100), Some(0));
        assert_eq!(boundary_percent(5, 100), Some(5));
        assert_eq!(boundary_percent(99, 100), Some(95));
        assert_eq!(boundary_percent(100, 100), Some(100));
        assert_eq!(boundary_percent(150, 100), Some(100));
        assert_eq!(boundary_percent(1, 0), None);
        assert_eq!(boundary_percent(u64::MAX / 2, u64::MAX), Some(45));
    }

    async fn downloading(h: &crate::downloader::testutil::Harness, artifact: &Artifact) -> Transfer {
        let mut transfer = Transfer::new(&artifact.key, "https://example.com/big", "example.com");
        transfer.status = TransferStatus::Downloading;
        transfer.bytes_total = Some(TOTAL);
        transfer.insert(h.engine.db()).await.unwrap();
        transfer
    }

    #[tokio::test]
    async fn test_crossing_thirty_five_percent() {
        let mut h = harness(|_| {}).await;
        let artifact = Artifact::new("https://example.com/big", None);
        artifact.insert(h.engine.db()).await.unwrap();
        let transfer = downloading(&h, &artifact).await;
        Transfer::bump_broadcast(h.engine.db(), &transfer.key, 30).await.unwrap();

        let db = h.engine.db().clone();
        add_bytes(&db, &transfer.key, 36 * 1024 * 1024).await;
        assert_eq!(h.engine.maybe_broadcast(&transfer.key).await.unwrap(), Some(35));

        let loaded = Transfer::require(&db, &transfer.key).await.unwrap();
        assert_eq!(loaded.last_broadcast_percent, 35);
        assert_eq!(h.progress_of(&transfer.key), vec![35]);
        let artifact = Artifact::require(&db, &artifact.key).await.unwrap();
        assert_eq!(artifact.download_progress, 35);
    }

    #[tokio::test]
    async fn test_no_event_without_new_boundary() {
        let mut h = harness(|_| {}).await;
        let artifact = Artifact::new("https://example.com/big", None);
        artifact.insert(h.engine.db()).await.unwrap();
        let transfer = downloading(&h, &artifact).await;
        let db = h.engine.db().clone();

        add_bytes(&db, &transfer.key, TOTAL / 100).await;
        assert_eq!(h.engine.maybe_broadcast(&transfer.key).await.unwrap(), None);

        add_bytes(&db, &transfer.key, TOTAL / 20).await;
        assert_eq!(h.engine.maybe_broadcast(&transfer.key).await.unwrap(), Some(5));
        assert_eq!(h.engine.maybe_broadcast(&transfer.key).await.unwrap(), None);
        assert_eq!(h.progress_of(&transfer.key), vec![5]);
    }

    #[tokio::test]
    async fn test_hundred_byte_transfer() {
        let mut h = harness(|_| {}).await;
        let artifact = Artifact::new("https://example.com/small", None);
        artifact.insert(h.engine.db()).await.unwrap();
        let mut transfer = Transfer::new(&artifact.key, "https://example.com/small", "example.com");
        transfer.status = TransferStatus::Downloading;
        transfer.bytes_total = Some(100);
        transfer.insert(h.engine.db()).await.unwrap();

        let db = h.engine.db().clone();
        let mut announced = Vec::new();
        // 0 -> 4 -> 5 -> 9 -> 10
        for delta in [4, 1, 4, 1] {
            add_bytes(&db, &transfer.key, delta).await;
            announced.push(h.engine.maybe_broadcast(&transfer.key).await.unwrap());
        }

        assert_eq!(announced, vec![None, Some(5), None, Some(10)]);
        assert_eq!(h.progress_of(&transfer.key), vec![5, 10]);
        let loaded = Transfer::require(&db, &transfer.key).await.unwrap();
        assert_eq!(loaded.last_broadcast_percent, 10);
    }

    #[tokio::test]
    async fn test_hundred_waits_for_completion() {
        let mut h = harness(|_| {}).await;
        let artifact = Artifact::new("https://example.com/big", None);
        artifact.insert(h.engine.db()).await.unwrap();
        let transfer = downloading(&h, &artifact).await;
        let db = h.engine.db().clone();

        add_bytes(&db, &transfer.key, TOTAL).await;
        assert_eq!(h.engine.maybe_broadcast(&transfer.key).await.unwrap(), Some(95));
        assert_eq!(h.engine.maybe_broadcast(&transfer.key).await.unwrap(), None);

        let done = Transfer::require(&db, &transfer.key).await.unwrap();
        h.engine.broadcast_complete(&done).await.unwrap();
        assert_eq!(h.progress_of(&transfer.key), vec![95, 100]);
        let artifact = Artifact::require(&db, &artifact.key).await.unwrap();
        assert_eq!(artifact.download_progress, 100);
    }

    #[tokio::test]
    async fn test_unknown_total_is_silent() {
        let mut h = harness(|_| {}).await;
        let mut transfer = Transfer::new("art", "https://example.com/x", "example.com");
        transfer.bytes_downloaded = 500;
        transfer.insert(h.engine.db()).await.unwrap();

        assert_eq!(h.engine.maybe_broadcast(&transfer.key).await.unwrap(), None);
        assert!(h.progress_of(&transfer.key).is_empty());
    }

    #[tokio::test]
    async fn test_boundary_never_moves_down() {
        let mut h = harness(|_| {}).await;
        let artifact = Artifact::new("https://example.com/big", None);
        artifact.insert(h.engine.db()).await.unwrap();
        let transfer = downloading(&h, &artifact).await;
        let db = h.engine.db().clone();

        // A slower worker tries to announce an older boundary
        Transfer::bump_broadcast(&db, &transfer.key, 60).await.unwrap();
        assert!(Transfer::bump_broadcast(&db, &transfer.key, 40).await.unwrap().is_none());

        add_bytes(&db, &transfer.key, TOTAL / 2).await;
        assert_eq!(h.engine.maybe_broadcast(&transfer.key).await.unwrap(), None);
        let loaded = Transfer::require(&db, &transfer.key).await.unwrap();
        assert_eq!(loaded.last_broadcast_percent, 60);
        assert!(h.progress_of(&transfer.key).is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_broadcasts_announce_once() {
        let mut h = harness(|_| {}).await;
        let artifact = Artifact::new("https://example.com/big", None);
        artifact.insert(h.engine.db()).await.unwrap();
        let transfer = downloading(&h, &artifact).await;
        add_bytes(h.engine.db(), &transfer.key, TOTAL / 4).await;

        let calls: Vec<_> = (0..8)
            .map(|_| {
                let engine = h.engine.clone();
                let key = transfer.key.clone();
                tokio::spawn(async move { engine.maybe_broadcast(&key).await })
            })
            .collect();
        let mut announced = Vec::new();
        for call in calls {
            announced.extend(call.await.unwrap().unwrap());
        }

        assert_eq!(announced, vec![25]);
        assert_eq!(h.progress_of(&transfer.key), vec![25]);
    }
}
