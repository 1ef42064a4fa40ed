//! Log Broadcast Library
//!
//! This library tails an append-only, newline-delimited JSON log file and
//! forwards new records to a remote HTTP collector:
//!
//! - **config**: JSON file configuration and validation
//! - **record**: The opaque JSON object read from each log line
//! - **reader**: Incremental reads with partial-line framing
//! - **batcher**: Count- and size-bounded batching
//! - **broadcaster**: HTTP delivery with fixed-delay retries
//! - **offset**: Read cursor, truncation handling and persisted offsets
//! - **pipeline**: The poll loop tying the pieces together
//!
//! # Example
//!
//! ```no_run
//! use log_broadcast::config::Config;
//! use log_broadcast::pipeline::Tailer;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = Config::from_file("broadcast.json").expect("Failed to load config");
//!     let tailer = Tailer::new(config).expect("Failed to create tailer");
//!
//!     let cancel = CancellationToken::new();
//!     tailer.run(cancel).await.ok();
//! }
//! ```

pub mod batcher;
pub mod broadcaster;
pub mod config;
pub mod offset;
pub mod pipeline;
pub mod reader;
pub mod record;

pub use batcher::{Batch, BatchPlan};
pub use broadcaster::{BroadcastError, BroadcastStats, Broadcaster, Delivery, Envelope};
pub use config::{Config, ConfigError};
pub use offset::{FileSnapshot, OffsetError, OffsetStore, ReadCursor, Reconciliation};
pub use pipeline::{CycleReport, PipelineError, Tailer};
pub use reader::ReadOutcome;
pub use record::LogRecord;
