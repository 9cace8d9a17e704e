use std::time::Duration;

use reqwest::StatusCode;
use thiserror::Error;

use super::models::TransferStatus;

#[derive(Error, Debug)]
pub enum TransferError {
    #[error("Database error: {0}")]
    Database(#[from] surrealdb::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("HTTP error: {0}")]
    Status(StatusCode),

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("Malformed range response: {0}")]
    BadRange(String),

    #[error("Server sent more than the {expected} bytes requested")]
    Overflow { expected: u64 },

    #[error("Connection closed after {received} of {expected} bytes")]
    Truncated { expected: u64, received: u64 },

    #[error("Missing part file for chunk {0}")]
    MissingPart(u32),

    #[error("{0} not found")]
    NotFound(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Transfer {key} is {status}")]
    InvalidState { key: String, status: TransferStatus },

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("Background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl TransferError {
    /// A store write lost to a concurrent transaction and changed nothing
    pub fn is_conflict(&self) -> bool {
        match self {
            Self::Database(e) => is_conflict(e),
            _ => false,
        }
    }

    /// Whether retrying the same work could succeed
    pub fn is_transient(&self) -> bool {
        match self {
            // Store conflicts between concurrent writers resolve on retry
            Self::Database(_) => true,
            Self::Http(e) => e.is_timeout() || e.is_connect() || e.is_request() || e.is_body(),
            Self::Status(status) => {
                status.is_server_error()
                    || *status == StatusCode::REQUEST_TIMEOUT
                    || *status == StatusCode::TOO_MANY_REQUESTS
            }
            Self::Timeout(_) | Self::Truncated { .. } => true,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, TransferError>;

/// Optimistic transactions report a lost race as a retryable error. Every
/// other statement of a canceled transaction reports it as not executed.
pub(crate) fn is_conflict(e: &surrealdb::Error) -> bool {
    let message = e.to_string();
    message.contains("can be retried") || message.contains("failed transaction")
}
