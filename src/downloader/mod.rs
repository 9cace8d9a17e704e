//! Chunked transfer engine
//!
//! Transfers are admitted per domain by the pump, inspected and split into
//! byte-range chunks, fetched in parallel by queue workers, then assembled
//! and placed into storage. Every coordination point is a conditional update
//! on a database row, so the engine keeps no transfer state in memory.

mod assemble;
mod chunk;
mod engine;
mod error;
mod finalize;
mod http;
mod models;
mod notify;
mod plan;
mod progress;
mod prepare;
mod pump;
mod queue;
mod store;
mod trigger;

#[cfg(test)]
pub(crate) mod testutil;

// Re-export the public API
pub use engine::{Engine, EngineSettings};
pub use error::TransferError;
pub use models::{Chunk, Transfer, TransferStatus};
pub use notify::BroadcastNotifier;
pub use queue::{RetryPolicy, TaskQueue};
pub use store::StatusCount;
pub use trigger::TransferRequest;
