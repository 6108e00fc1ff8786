//! Reading files that may still be mid-write
//!
//! Editors frequently truncate a file and then write it, so the first read
//! after a modify event can come back empty or fail outright. Reads are
//! retried a bounded number of times before the modification is dropped.

use std::path::Path;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::{debug, warn};

use super::debounce::Debouncer;
use crate::error::{SyncError, SyncResult};
use crate::types::RelativePath;

/// Attempts before a modification is abandoned
pub const MAX_READ_ATTEMPTS: u32 = 10;

/// Pause after an empty read
pub const EMPTY_READ_PAUSE: Duration = Duration::from_millis(100);

/// Read the full content of `local`, retrying transient failures.
///
/// An empty read pauses [`EMPTY_READ_PAUSE`]; any other error pauses half
/// the debounce window and refreshes the debounce slot for `path`. A
/// successful read records `path` in the debounce slot before returning.
pub async fn read_with_retry(
    local: &Path,
    path: &RelativePath,
    debouncer: &Debouncer,
) -> SyncResult<Bytes> {
    for attempt in 1..=MAX_READ_ATTEMPTS {
        match tokio::fs::read(local).await {
            Ok(content) if content.is_empty() => {
                warn!(%path, attempt, "File is empty, waiting for more data");
                tokio::time::sleep(EMPTY_READ_PAUSE).await;
            }
            Ok(content) => {
                debug!(%path, attempt, len = content.len(), "Read modified file");
                debouncer.record(path, Instant::now());
                return Ok(Bytes::from(content));
            }
            Err(e) => {
                warn!(%path, attempt, error = %e, "Failed to read modified file");
                tokio::time::sleep(debouncer.window() / 2).await;
                debouncer.record(path, Instant::now());
            }
        }
    }

    Err(SyncError::RetryExhausted {
        path: local.to_path_buf(),
        attempts: MAX_READ_ATTEMPTS,
    })
}
