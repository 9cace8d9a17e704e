//! Data structures for the transfer engine
//!
//! Records persisted in the `transfer`, `chunk` and `artifact` tables, their
//! status enums, and the events the engine emits.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use ulid::Ulid;

/// Status of a transfer
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum TransferStatus {
    /// Created by the trigger, waiting for admission
    #[default]
    Pending,
    /// Admitted by the pump, waiting for the start task
    Queued,
    /// Probing the remote object and planning chunks
    Preparing,
    /// Chunks are being fetched
    Downloading,
    /// Every chunk is done, parts are being concatenated
    Assembling,
    /// Paused by the user, still holds its admission slot
    Paused,
    Completed,
    Failed,
    /// Canceled by the user
    Canceled,
}

impl TransferStatus {
    pub const ACTIVE: [Self; 5] = [
        Self::Queued,
        Self::Preparing,
        Self::Downloading,
        Self::Assembling,
        Self::Paused,
    ];
    pub const TERMINAL: [Self; 3] = [Self::Completed, Self::Failed, Self::Canceled];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Queued => "queued",
            Self::Preparing => "preparing",
            Self::Downloading => "downloading",
            Self::Assembling => "assembling",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        Self::TERMINAL.contains(self)
    }

    /// Whether the transfer occupies an admission slot
    pub fn is_active(&self) -> bool {
        Self::ACTIVE.contains(self)
    }
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of a single chunk
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ChunkStatus {
    #[default]
    Pending,
    Downloading,
    Completed,
    Failed,
    /// Aborted because the owning transfer was canceled
    Canceled,
}

impl ChunkStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Downloading => "downloading",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        }
    }
}

impl fmt::Display for ChunkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One URL being fetched into one artifact
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Transfer {
    pub key: String,
    /// Key of the owning artifact record
    pub artifact: String,
    pub url: String,
    pub domain: String,
    pub status: TransferStatus,
    pub bytes_total: Option<u64>,
    #[serde(default)]
    pub bytes_downloaded: u64,
    #[serde(default)]
    pub last_broadcast_percent: u8,
    pub error: Option<String>,
    /// Number of chunks planned, 0 until the transfer has been prepared
    #[serde(default)]
    pub chunk_count: u32,
    #[serde(default)]
    pub accept_ranges: bool,
    pub content_type: Option<String>,
    /// Filename advertised through `Content-Disposition`
    pub filename_hint: Option<String>,
    #[serde(default)]
    pub cancel_requested: bool,
    pub created_at: DateTime<Utc>,
    pub queued_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
}

impl Transfer {
    /// Creates a new pending transfer with a fresh ULID key
    pub fn new(artifact: impl Into<String>, url: impl Into<String>, domain: impl Into<String>) -> Self {
        Self {
            key: Ulid::new().to_string(),
            artifact: artifact.into(),
            url: url.into(),
            domain: domain.into(),
            status: TransferStatus::Pending,
            bytes_total: None,
            bytes_downloaded: 0,
            last_broadcast_percent: 0,
            error: None,
            chunk_count: 0,
            accept_ranges: false,
            content_type: None,
            filename_hint: None,
            cancel_requested: false,
            created_at: Utc::now(),
            queued_at: None,
            started_at: None,
            finished_at: None,
            failed_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Download progress as a percentage, `None` while the size is unknown
    pub fn percentage(&self) -> Option<f32> {
        self.bytes_total
            .filter(|total| *total > 0)
            .map(|total| (self.bytes_downloaded as f32 / total as f32) * 100.0)
    }
}

/// One contiguous byte-range slice of a transfer
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Chunk {
    pub key: String,
    pub transfer: String,
    /// Assembly position, stored as `chunk_index` since `INDEX` is a SurrealQL keyword
    #[serde(rename = "chunk_index")]
    pub index: u32,
    pub range_start: u64,
    /// Inclusive end offset, `None` when the object length is unknown
    pub range_end: Option<u64>,
    #[serde(default)]
    pub bytes_downloaded: u64,
    pub status: ChunkStatus,
    /// Location of the part file, relative to the scratch directory
    pub part_path: Option<String>,
    pub error: Option<String>,
    #[serde(default)]
    pub attempts: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
}

impl Chunk {
    pub fn new(transfer: &str, index: u32, range: ByteRange) -> Self {
        Self {
            key: Self::key_for(transfer, index),
            transfer: transfer.to_string(),
            index,
            range_start: range.start,
            range_end: range.end,
            bytes_downloaded: 0,
            status: ChunkStatus::Pending,
            part_path: None,
            error: None,
            attempts: 0,
            started_at: None,
            finished_at: None,
            failed_at: None,
        }
    }

    pub fn key_for(transfer: &str, index: u32) -> String {
        format!("{transfer}-{index}")
    }

    /// Part file location relative to the scratch directory
    pub fn part_path_for(transfer: &str, index: u32) -> String {
        format!("{transfer}/{index}.part")
    }

    /// Number of bytes this chunk covers, if bounded
    pub fn len(&self) -> Option<u64> {
        self.range_end.map(|end| end - self.range_start + 1)
    }
}

/// Inclusive byte range, open-ended when `end` is `None`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ByteRange {
    pub start: u64,
    pub end: Option<u64>,
}

impl ByteRange {
    pub fn bounded(start: u64, end: u64) -> Self {
        Self {
            start,
            end: Some(end),
        }
    }

    pub fn open(start: u64) -> Self {
        Self { start, end: None }
    }

    pub fn len(&self) -> Option<u64> {
        self.end.map(|end| end - self.start + 1)
    }

    /// Value for an HTTP `Range` request header
    pub fn header_value(&self) -> String {
        match self.end {
            Some(end) => format!("bytes={}-{}", self.start, end),
            None => format!("bytes={}-", self.start),
        }
    }
}

/// Destination file metadata record, owned by the file collaborator
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Artifact {
    pub key: String,
    pub original_url: Option<String>,
    /// Original filename, reused for the stored name
    pub filename: Option<String>,
    /// Extension hint, takes precedence over detection
    pub extension: Option<String>,
    /// Content hash, used for directory sharding when it is valid hex
    pub hash: Option<String>,
    pub mime_type: Option<String>,
    pub path: Option<String>,
    pub thumbnail_path: Option<String>,
    pub size: Option<u64>,
    #[serde(default)]
    pub downloaded: bool,
    pub downloaded_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub download_progress: u8,
    pub blacklisted_at: Option<DateTime<Utc>>,
    pub blacklist_reason: Option<String>,
}

impl Artifact {
    pub fn new(original_url: impl Into<String>, filename: Option<String>) -> Self {
        Self {
            key: Ulid::new().to_string(),
            original_url: Some(original_url.into()),
            filename,
            ..Default::default()
        }
    }
}

/// Emitted whenever a transfer crosses a 5% boundary
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProgressEvent {
    pub transfer_id: String,
    pub artifact_id: String,
    pub domain: String,
    pub status: TransferStatus,
    pub percent: u8,
}

/// Emitted once when a transfer completes or fails
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FinishedEvent {
    pub transfer_id: String,
    pub artifact_id: String,
    pub domain: String,
    pub status: TransferStatus,
    pub error: Option<String>,
    pub path: Option<String>,
    pub original_url: String,
    pub preview_url: Option<String>,
    pub size: Option<u64>,
    pub filename: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event")]
pub enum TransferEvent {
    #[serde(rename = "download-transfer-progress")]
    Progress(ProgressEvent),
    #[serde(rename = "download-transfer-finished")]
    Finished(FinishedEvent),
}

impl TransferEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Progress(_) => "download-transfer-progress",
            Self::Finished(_) => "download-transfer-finished",
        }
    }

    pub fn transfer_id(&self) -> &str {
        match self {
            Self::Progress(event) => &event.transfer_id,
            Self::Finished(event) => &event.transfer_id,
        }
    }
}
