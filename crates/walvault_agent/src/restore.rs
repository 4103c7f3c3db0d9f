//! Reading backups back out of the store.
//!
//! These helpers serve the producer's restore hook (one WAL segment at a
//! time) and base-backup retrieval. Tar extraction and starting the
//! database are left to the operator.

use crate::catalog::{latest_base, BaseRef, ObjectName};
use crate::error::{AgentError, AgentResult};
use std::path::Path;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::{debug, info};
use walvault_storage::ObjectStore;
use walvault_wal::{parse_segment_file_name, Lsn};

/// Suffix of timeline history files, which are never stored.
const HISTORY_SUFFIX: &str = ".history";

/// Result of [`restore_wal_segment`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestoreOutcome {
    /// The segment was written to the destination.
    Restored {
        /// Store object it came from.
        object: String,
        /// Bytes written.
        bytes: u64,
    },
    /// The request was for a history file; nothing was done.
    SkippedHistory,
}

/// Maps a segment file name to the store object holding it.
///
/// # Errors
///
/// Returns [`AgentError::Wal`] for names that are not segment file names.
pub fn segment_object(file_name: &str) -> AgentResult<ObjectName> {
    let (timeline, lsn) = parse_segment_file_name(file_name)?;
    Ok(ObjectName::Wal { lsn, timeline })
}

/// Downloads the segment named `file_name` (e.g. `000000010000000000000003`)
/// and writes it to `dest`.
///
/// # Errors
///
/// Returns an error if the name is invalid, the object is missing or fails
/// to decode, or `dest` cannot be written.
pub async fn restore_wal_segment(
    store: &dyn ObjectStore,
    file_name: &str,
    dest: &Path,
) -> AgentResult<RestoreOutcome> {
    if file_name.ends_with(HISTORY_SUFFIX) {
        debug!(file = file_name, "history files are not archived");
        return Ok(RestoreOutcome::SkippedHistory);
    }
    let object = segment_object(file_name)?.to_string();
    info!(segment = file_name, object = %object, "restoring WAL segment");
    let data = store.download(&object).await?;
    tokio::fs::write(dest, &data).await?;
    Ok(RestoreOutcome::Restored {
        object,
        bytes: data.len() as u64,
    })
}

/// Finds the newest complete base backup usable for recovery.
///
/// # Errors
///
/// Returns [`AgentError::NoBaseBackup`] if none qualifies, or the store's
/// error if listing fails.
pub async fn find_base(
    store: &dyn ObjectStore,
    timeline: u32,
    max_lsn: Option<Lsn>,
) -> AgentResult<BaseRef> {
    let listing = store.list().await?;
    latest_base(&listing, timeline, max_lsn).ok_or(AgentError::NoBaseBackup { timeline })
}

/// Streams a base backup into `dest`: parts `part0`, `part1`, ... until
/// one is missing, then the final `.base` object.
///
/// Returns the number of bytes written.
///
/// # Errors
///
/// Returns the store error of any part other than a missing one, or the
/// write error of `dest`. The final object must exist.
pub async fn fetch_base_backup<W>(
    store: &dyn ObjectStore,
    base: &BaseRef,
    dest: &mut W,
) -> AgentResult<u64>
where
    W: AsyncWrite + Unpin + Send,
{
    let mut written = 0u64;
    let mut part = 0u64;
    loop {
        let name = base.part_name(part).to_string();
        match store.download(&name).await {
            Ok(data) => {
                debug!(object = %name, size = data.len(), "base part");
                dest.write_all(&data).await?;
                written += data.len() as u64;
                part += 1;
            }
            Err(e) if e.is_not_found() => break,
            Err(e) => return Err(e.into()),
        }
    }

    let name = base.final_name().to_string();
    let data = store.download(&name).await?;
    dest.write_all(&data).await?;
    dest.flush().await?;
    written += data.len() as u64;
    info!(object = %name, parts = part + 1, bytes = written, "base backup fetched");
    Ok(written)
}
