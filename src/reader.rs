//! Incremental reader for newline-delimited JSON logs.
//!
//! Each call reads everything from a byte offset to the current end of the
//! file and frames it into records. A trailing line that has not been fully
//! written yet is left out of both the records and the consumed byte count,
//! so the next read picks it up once it is complete.

use std::io::SeekFrom;
use std::path::Path;

use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::{debug, warn};

use crate::record::LogRecord;

/// Result of one read from the log.
#[derive(Debug, Default)]
pub struct ReadOutcome {
    /// Bytes to advance the offset by; excludes any trailing partial line
    pub bytes_consumed: u64,

    /// Records decoded from complete lines, in file order
    pub records: Vec<LogRecord>,

    /// Number of framed lines that failed to decode
    pub malformed: usize,
}

/// Read and frame everything in `path` from `from_offset` onwards.
///
/// A failure to open, seek or read the file is logged and reported as no
/// progress (`bytes_consumed == 0`, no records).
pub async fn read(path: &Path, from_offset: u64) -> ReadOutcome {
    match read_raw(path, from_offset).await {
        Ok(buf) => {
            let outcome = frame(&buf);
            debug!(
                path = %path.display(),
                offset = from_offset,
                bytes_read = buf.len(),
                bytes_consumed = outcome.bytes_consumed,
                records = outcome.records.len(),
                "Read log"
            );
            outcome
        }
        Err(e) => {
            warn!(
                path = %path.display(),
                offset = from_offset,
                error = %e,
                "Failed to read log file"
            );
            ReadOutcome::default()
        }
    }
}

async fn read_raw(path: &Path, from_offset: u64) -> std::io::Result<Vec<u8>> {
    let mut file = tokio::fs::File::open(path).await?;
    file.seek(SeekFrom::Start(from_offset)).await?;

    let mut buf = Vec::new();
    file.read_to_end(&mut buf).await?;
    Ok(buf)
}

/// Split raw log bytes into records.
///
/// The final fragment after the last newline only counts as complete when it
/// ends with `}`. Lines that are not wrapped in `{...}` are skipped, and lines
/// that are wrapped but fail to decode are logged and skipped.
pub fn frame(buf: &[u8]) -> ReadOutcome {
    let mut fragments: Vec<&[u8]> = buf.split(|b| *b == b'\n').collect();
    let mut bytes_consumed = buf.len();

    if let Some(last) = fragments.last() {
        if last.last() != Some(&b'}') {
            bytes_consumed -= last.len();
            fragments.pop();
        }
    }

    let mut records = Vec::with_capacity(fragments.len());
    let mut malformed = 0;

    for fragment in fragments {
        let line = fragment.strip_suffix(b"\r").unwrap_or(fragment);
        if line.is_empty() {
            continue;
        }

        if line.first() != Some(&b'{') || line.last() != Some(&b'}') {
            debug!(len = line.len(), "Skipping unframed log fragment");
            continue;
        }

        match LogRecord::from_slice(line) {
            Ok(record) => records.push(record),
            Err(e) => {
                malformed += 1;
                warn!(
                    error = %e,
                    line = %String::from_utf8_lossy(line),
                    "Dropping malformed log record"
                );
            }
        }
    }

    ReadOutcome {
        bytes_consumed: bytes_consumed as u64,
        records,
        malformed,
    }
}
