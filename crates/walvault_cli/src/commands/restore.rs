//! Restore commands.
//!
//! `restore-wal` is meant to be wired into the server's recovery
//! configuration as `restore_command = 'walvault restore-wal %f %p'`.
//! `fetch-base` writes the base backup's tar stream to a file; extracting it
//! is left to the operator.

use std::path::Path;
use tokio::io::BufWriter;
use tracing::info;
use walvault_agent::{fetch_base_backup, find_base, restore_wal_segment, AgentConfig, RestoreOutcome};
use walvault_wal::Lsn;

/// Restores one WAL segment to `dest`.
pub async fn restore_wal(
    config: &AgentConfig,
    segment: &str,
    dest: &Path,
) -> Result<(), Box<dyn std::error::Error>> {
    let store = config.open_store().await?;
    match restore_wal_segment(store.as_ref(), segment, dest).await? {
        RestoreOutcome::Restored { object, bytes } => {
            info!(segment, object = %object, bytes, "segment restored");
        }
        RestoreOutcome::SkippedHistory => {
            info!(segment, "history file not archived, skipping");
        }
    }
    Ok(())
}

/// Downloads the newest usable base backup into `out`.
pub async fn fetch_base(
    config: &AgentConfig,
    timeline: u32,
    max_lsn: Option<Lsn>,
    out: &Path,
) -> Result<(), Box<dyn std::error::Error>> {
    let store = config.open_store().await?;
    let base = find_base(store.as_ref(), timeline, max_lsn).await?;
    info!(base = %base.final_name(), start = %base.lsn, "fetching base backup");

    let file = tokio::fs::File::create(out).await?;
    let mut writer = BufWriter::new(file);
    let written = fetch_base_backup(store.as_ref(), &base, &mut writer).await?;

    println!("✓ Base backup fetched");
    println!("  Path: {:?}", out);
    println!("  Start: {}", base.lsn);
    println!("  Timeline: {}", base.timeline);
    println!("  Size: {} bytes", written);
    Ok(())
}
