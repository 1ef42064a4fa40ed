//! The tail-and-forward poll loop.
//!
//! Each cycle stats the log, reconciles the read cursor, reads new records,
//! batches them, broadcasts the batches in order and persists the advanced
//! offset. Cycles run strictly one after another with a fixed sleep between
//! them until the loop is cancelled or a batch cannot be delivered.

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::batcher;
use crate::broadcaster::{BroadcastError, Broadcaster};
use crate::config::Config;
use crate::offset::{self, FileSnapshot, OffsetStore, ReadCursor, Reconciliation};
use crate::reader;

/// Errors that stop the poll loop.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// A batch could not be delivered within the retry budget
    #[error(transparent)]
    Broadcast(#[from] BroadcastError),
}

/// Summary of one poll cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Offset the cycle read from, after reconciliation
    pub start_offset: u64,

    /// Offset after the cycle
    pub end_offset: u64,

    pub bytes_consumed: u64,
    pub events_read: usize,
    pub events_dropped: usize,
    pub batches_sent: usize,

    /// `None` when the log could not be stat'ed and the cycle was skipped
    pub reconciliation: Option<Reconciliation>,
}

/// Tails one log file and forwards its records to the collector.
pub struct Tailer {
    config: Config,
    broadcaster: Broadcaster,
    store: Option<OffsetStore>,
    cursor: Option<ReadCursor>,
}

impl Tailer {
    /// Build a tailer for `config`.
    ///
    /// # Errors
    ///
    /// Returns `BroadcastError::Client` if the HTTP client cannot be built.
    pub fn new(config: Config) -> Result<Self, BroadcastError> {
        let broadcaster = Broadcaster::new(&config)?;
        Ok(Self::with_broadcaster(config, broadcaster))
    }

    /// Build a tailer around an existing broadcaster.
    pub fn with_broadcaster(config: Config, broadcaster: Broadcaster) -> Self {
        let store = config.resume_path.clone().map(OffsetStore::new);
        Self {
            config,
            broadcaster,
            store,
            cursor: None,
        }
    }

    pub fn broadcaster(&self) -> &Broadcaster {
        &self.broadcaster
    }

    /// The current cursor, once the start offset has been determined.
    pub fn cursor(&self) -> Option<&ReadCursor> {
        self.cursor.as_ref()
    }

    /// Run cycles until `cancel` fires or a batch cannot be delivered.
    ///
    /// Cancellation is observed between cycles and during the inter-cycle
    /// sleep; a cycle in progress always runs to completion.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<(), PipelineError> {
        info!(
            path = %self.config.log_path.display(),
            url = %self.broadcaster.url(),
            interval_ms = self.config.interval.as_millis(),
            resume = self.config.resume(),
            "Starting log broadcast"
        );

        loop {
            if cancel.is_cancelled() {
                break;
            }

            self.poll_once().await?;

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.config.interval) => {}
            }
        }

        info!(
            offset = ?self.cursor.map(|c| c.offset),
            "Log broadcast stopped"
        );
        Ok(())
    }

    /// Run a single poll cycle.
    ///
    /// The start offset is determined on the first call. When delivery fails
    /// the advanced offset is still persisted before the error is returned.
    pub async fn poll_once(&mut self) -> Result<CycleReport, PipelineError> {
        let mut cursor = match self.cursor {
            Some(cursor) => cursor,
            None => offset::determine_start(&self.config, self.store.as_ref()).await,
        };

        let snapshot = match FileSnapshot::capture(&self.config.log_path).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(
                    path = %self.config.log_path.display(),
                    offset = cursor.offset,
                    error = %e,
                    "Failed to stat log file, skipping cycle"
                );
                self.cursor = Some(cursor);
                return Ok(CycleReport {
                    start_offset: cursor.offset,
                    end_offset: cursor.offset,
                    ..CycleReport::default()
                });
            }
        };

        let reconciliation = cursor.reconcile(snapshot);
        match reconciliation {
            Reconciliation::Truncated => info!(
                path = %self.config.log_path.display(),
                size = snapshot.size,
                "Log file truncated, reading from start"
            ),
            Reconciliation::Replaced => info!(
                path = %self.config.log_path.display(),
                size = snapshot.size,
                "Log file replaced, reading from start"
            ),
            Reconciliation::Unchanged => {}
        }

        let start_offset = cursor.offset;
        let outcome = reader::read(&self.config.log_path, start_offset).await;
        let events_read = outcome.records.len();

        // The offset covers bytes handed to the batcher, not bytes delivered
        cursor.advance(outcome.bytes_consumed);
        self.cursor = Some(cursor);

        let plan = batcher::batch(
            outcome.records,
            self.config.max_events,
            self.config.max_size,
        );

        let mut report = CycleReport {
            start_offset,
            end_offset: cursor.offset,
            bytes_consumed: outcome.bytes_consumed,
            events_read,
            events_dropped: plan.dropped,
            batches_sent: 0,
            reconciliation: Some(reconciliation),
        };

        let mut failure = None;
        for batch in &plan.batches {
            match self.broadcaster.send(batch).await {
                Ok(delivery) => {
                    if delivery.status.is_some() {
                        report.batches_sent += 1;
                    }
                }
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }

        self.persist(cursor.offset).await;

        debug!(
            start_offset = report.start_offset,
            end_offset = report.end_offset,
            events = report.events_read,
            dropped = report.events_dropped,
            batches = report.batches_sent,
            "Cycle complete"
        );

        match failure {
            Some(e) => {
                error!(
                    error = %e,
                    path = %self.config.log_path.display(),
                    offset = cursor.offset,
                    "Failed to deliver batch"
                );
                Err(e.into())
            }
            None => Ok(report),
        }
    }

    async fn persist(&self, offset: u64) {
        if let Some(store) = &self.store {
            if let Err(e) = store.persist(offset).await {
                error!(error = %e, offset = offset, "Failed to persist offset");
            }
        }
    }
}
