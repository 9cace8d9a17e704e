//! Config module for chunkline

use std::{path::PathBuf, time::Duration};

use bytesize::ByteSize;
use clap::{Parser, ValueEnum};

use crate::downloader::{EngineSettings, RetryPolicy};

#[derive(ValueEnum, Debug, Clone, Default)]
#[clap(rename_all = "lowercase")]
pub enum DatabaseAuthMethod {
    #[default]
    None,
    Root,
}

#[derive(Parser, Debug, Clone)]
pub struct DatabaseConfig {
    #[clap(long, env = "CHUNKLINE_DATABASE_URL", default_value = "surrealkv://./database")]
    pub database_url: String,

    #[clap(
        long,
        env = "CHUNKLINE_DATABASE_AUTH_METHOD",
        value_enum,
        default_value = "none"
    )]
    pub db_auth_method: DatabaseAuthMethod,

    #[clap(long, env = "CHUNKLINE_SURREAL_ROOT_USERNAME", default_value = "root")]
    pub root_username: String,

    #[clap(long, env = "CHUNKLINE_SURREAL_ROOT_PASSWORD", default_value = "root")]
    pub root_password: String,

    #[clap(long, env = "CHUNKLINE_SURREAL_NAMESPACE", default_value = "chunkline")]
    pub db_namespace: String,

    #[clap(long, env = "CHUNKLINE_SURREAL_DATABASE", default_value = "chunkline")]
    pub db_database: String,
}

#[derive(Parser, Debug, Clone)]
pub struct TransferConfig {
    /// Maximum number of active transfers across every domain
    #[clap(long, env = "CHUNKLINE_MAX_TRANSFERS_TOTAL", default_value_t = 20)]
    pub max_transfers_total: u64,

    /// Maximum number of active transfers for a single domain
    #[clap(long, env = "CHUNKLINE_MAX_TRANSFERS_PER_DOMAIN", default_value_t = 20)]
    pub max_transfers_per_domain: u64,

    /// Number of byte ranges a large transfer is split into
    #[clap(long, env = "CHUNKLINE_CHUNK_COUNT", default_value_t = 4)]
    pub chunk_count: u32,

    /// Objects smaller than this are fetched as a single chunk
    #[clap(long, env = "CHUNKLINE_MIN_BYTES_FOR_CHUNKING", default_value = "10MiB")]
    pub min_bytes_for_chunking: ByteSize,

    #[clap(long, env = "CHUNKLINE_HTTP_TIMEOUT_SECONDS", default_value_t = 30)]
    pub http_timeout_seconds: u64,

    /// How many bytes a chunk buffers before progress is persisted
    #[clap(long, env = "CHUNKLINE_PROGRESS_FLUSH_BYTES", default_value = "1MiB")]
    pub progress_flush_bytes: ByteSize,

    /// Attempts per task before it is given up on
    #[clap(long, env = "CHUNKLINE_MAX_ATTEMPTS", default_value_t = 5)]
    pub max_attempts: u32,

    #[clap(long, env = "CHUNKLINE_RETRY_BASE_SECONDS", default_value_t = 2)]
    pub retry_base_seconds: u64,

    #[clap(long, env = "CHUNKLINE_RETRY_MAX_SECONDS", default_value_t = 60)]
    pub retry_max_seconds: u64,

    /// Workers for pump, start and assemble tasks
    #[clap(long, env = "CHUNKLINE_TRANSFER_WORKERS", default_value_t = 4)]
    pub transfer_workers: usize,

    /// Workers for chunk downloads, i.e. concurrent HTTP streams
    #[clap(long, env = "CHUNKLINE_CHUNK_WORKERS", default_value_t = 8)]
    pub chunk_workers: usize,

    #[clap(long, env = "CHUNKLINE_PUMP_INTERVAL_SECONDS", default_value_t = 10)]
    pub pump_interval_seconds: u64,
}

#[derive(Parser, Debug, Clone)]
pub struct StorageConfig {
    /// Root directory finished artifacts are placed under
    #[clap(long, env = "CHUNKLINE_STORAGE_ROOT", default_value = "storage/")]
    pub storage_root: String,

    /// Scratch directory for chunk part files, segregated per transfer
    #[clap(long, env = "CHUNKLINE_TMP_DIR", default_value_t = get_default_tmp_dir())]
    pub tmp_dir: String,

    /// Public base URL the storage root is served from
    #[clap(long, env = "CHUNKLINE_PUBLIC_URL", default_value = "/storage")]
    pub public_url: String,

    #[clap(long, env = "CHUNKLINE_THUMBNAIL_WIDTH", default_value_t = 320)]
    pub thumbnail_width: u32,
}

/// Safely determine the default scratch directory
fn get_default_tmp_dir() -> String {
    dirs::cache_dir()
        .map(|cache| cache.join("chunkline"))
        .and_then(|path| path.to_str().map(String::from))
        .unwrap_or_else(|| "/tmp/chunkline".to_string())
}

#[derive(Parser, Debug, Clone)]
#[clap(name = "chunkline", version, about)]
pub struct Config {
    #[clap(long, env = "CHUNKLINE_HOST", default_value = "0.0.0.0:3000")]
    pub host: String,

    #[clap(flatten)]
    pub db_config: DatabaseConfig,

    #[clap(flatten)]
    pub transfer_config: TransferConfig,

    #[clap(flatten)]
    pub storage_config: StorageConfig,
}

impl Config {
    pub fn engine_settings(&self) -> EngineSettings {
        let transfer = &self.transfer_config;
        let storage = &self.storage_config;
        EngineSettings {
            max_transfers_total: transfer.max_transfers_total,
            max_transfers_per_domain: transfer.max_transfers_per_domain,
            chunk_count: transfer.chunk_count,
            min_bytes_for_chunking: transfer.min_bytes_for_chunking.as_u64(),
            http_timeout: Duration::from_secs(transfer.http_timeout_seconds),
            progress_flush_bytes: transfer.progress_flush_bytes.as_u64().max(1),
            storage_root: PathBuf::from(&storage.storage_root),
            tmp_dir: PathBuf::from(&storage.tmp_dir),
            public_url: storage.public_url.trim_end_matches('/').to_string(),
            thumbnail_width: storage.thumbnail_width.max(1),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        let transfer = &self.transfer_config;
        RetryPolicy {
            max_attempts: transfer.max_attempts.max(1),
            base: Duration::from_secs(transfer.retry_base_seconds),
            max: Duration::from_secs(transfer.retry_max_seconds),
        }
    }
}

pub fn config() -> Config {
    Config::parse()
}
