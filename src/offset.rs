//! Read-offset tracking across poll cycles and process restarts.
//!
//! The [`ReadCursor`] is threaded through the poll loop and decides where each
//! cycle resumes reading, resetting to the start of the file when it has been
//! truncated or replaced. The [`OffsetStore`] persists the offset to a side
//! file so a restarted process picks up where the last one stopped.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::config::Config;

/// Errors raised while persisting the read offset.
#[derive(Debug, thiserror::Error)]
pub enum OffsetError {
    #[error("failed to {action} offset file {}: {source}", path.display())]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl OffsetError {
    fn io<'a>(
        action: &'static str,
        path: &'a Path,
    ) -> impl FnOnce(std::io::Error) -> Self + 'a {
        move |source| OffsetError::Io {
            action,
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Point-in-time metadata of the log file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FileSnapshot {
    pub size: u64,
    pub mtime: Option<DateTime<Utc>>,
}

impl FileSnapshot {
    /// A snapshot with no history to compare against.
    pub fn absent() -> Self {
        Self::default()
    }

    /// Stat the file at `path`.
    pub async fn capture(path: &Path) -> std::io::Result<Self> {
        let metadata = tokio::fs::metadata(path).await?;
        Ok(Self {
            size: metadata.len(),
            mtime: metadata.modified().ok().map(DateTime::<Utc>::from),
        })
    }

    /// Whether this snapshot was modified strictly after `other`.
    ///
    /// A missing modification time on either side never counts as newer.
    pub fn is_newer_than(&self, other: &FileSnapshot) -> bool {
        match (self.mtime, other.mtime) {
            (Some(current), Some(previous)) => current > previous,
            _ => false,
        }
    }
}

/// What a cycle decided about the offset before reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconciliation {
    /// Keep reading from the current offset
    Unchanged,

    /// The file shrank below the offset; restart from zero
    Truncated,

    /// The file was rewritten with the same length; restart from zero
    Replaced,
}

/// The mutable read state carried from one poll cycle to the next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadCursor {
    pub offset: u64,
    pub previous: FileSnapshot,
}

impl ReadCursor {
    pub fn new(offset: u64, previous: FileSnapshot) -> Self {
        Self { offset, previous }
    }

    /// Reconcile the offset against a fresh snapshot of the file.
    ///
    /// Resets to zero on truncation or same-size replacement, and records
    /// `snapshot` as the comparison point for the next cycle.
    pub fn reconcile(&mut self, snapshot: FileSnapshot) -> Reconciliation {
        let outcome = if snapshot.size < self.offset {
            Reconciliation::Truncated
        } else if snapshot.size == self.previous.size && snapshot.is_newer_than(&self.previous) {
            Reconciliation::Replaced
        } else {
            Reconciliation::Unchanged
        };

        if outcome != Reconciliation::Unchanged {
            self.offset = 0;
        }
        self.previous = snapshot;

        outcome
    }

    /// Move the offset past bytes handed to the batcher.
    pub fn advance(&mut self, bytes: u64) {
        self.offset += bytes;
    }
}

/// Owns the on-disk representation of the persisted offset.
///
/// The file holds a single ASCII decimal integer and is replaced as a whole on
/// every write.
#[derive(Debug, Clone)]
pub struct OffsetStore {
    path: PathBuf,
}

impl OffsetStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the persisted offset.
    ///
    /// Returns `None` when the file is missing or does not hold an integer.
    pub async fn load(&self) -> Option<u64> {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) => {
                debug!(path = %self.path.display(), error = %e, "No persisted offset");
                return None;
            }
        };

        match contents.trim().parse::<u64>() {
            Ok(offset) => Some(offset),
            Err(e) => {
                warn!(
                    path = %self.path.display(),
                    contents = %contents.trim(),
                    error = %e,
                    "Ignoring unparseable persisted offset"
                );
                None
            }
        }
    }

    /// Atomically replace the persisted offset.
    ///
    /// Writes to a temporary file next to the target, flushes it and renames
    /// it over the target, so a crash never leaves a partial value behind.
    pub async fn persist(&self, offset: u64) -> Result<(), OffsetError> {
        let temp_path = self.temp_path();

        let mut file = tokio::fs::File::create(&temp_path)
            .await
            .map_err(OffsetError::io("create", &temp_path))?;
        file.write_all(offset.to_string().as_bytes())
            .await
            .map_err(OffsetError::io("write", &temp_path))?;
        file.sync_all()
            .await
            .map_err(OffsetError::io("sync", &temp_path))?;
        drop(file);

        tokio::fs::rename(&temp_path, &self.path)
            .await
            .map_err(OffsetError::io("replace", &self.path))?;

        debug!(path = %self.path.display(), offset = offset, "Persisted offset");
        Ok(())
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(format!(".tmp.{}", std::process::id()));
        self.path.with_file_name(name)
    }
}

/// Decide where the first cycle starts reading.
///
/// A readable persisted offset wins, with no snapshot history. Otherwise the
/// log is stat'ed: with `new_only` reading starts one byte before the end,
/// else at zero. A failed stat is treated as an empty file.
pub async fn determine_start(config: &Config, store: Option<&OffsetStore>) -> ReadCursor {
    if let Some(store) = store {
        if let Some(offset) = store.load().await {
            info!(
                path = %store.path().display(),
                offset = offset,
                "Resuming from persisted offset"
            );
            return ReadCursor::new(offset, FileSnapshot::absent());
        }
    }

    let snapshot = match FileSnapshot::capture(&config.log_path).await {
        Ok(snapshot) => snapshot,
        Err(e) => {
            warn!(
                path = %config.log_path.display(),
                error = %e,
                "Failed to stat log file"
            );
            FileSnapshot::absent()
        }
    };

    let offset = if config.new_only {
        snapshot.size.saturating_sub(1)
    } else {
        0
    };

    info!(
        path = %config.log_path.display(),
        size = snapshot.size,
        offset = offset,
        new_only = config.new_only,
        "Determined start offset"
    );

    ReadCursor::new(offset, snapshot)
}
