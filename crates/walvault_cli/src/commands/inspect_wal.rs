//! Inspect-wal command implementation.

use serde::Serialize;
use std::path::Path;
use std::time::UNIX_EPOCH;
use tracing::{debug, warn};
use walvault_wal::{Page, RecordContinuation, PAGE_SIZE};

/// WAL record representation for output.
#[derive(Debug, Serialize)]
pub struct WalRecordInfo {
    /// Record position, in `HI/LO` form.
    pub lsn: String,
    /// Record type.
    pub record_type: String,
    /// Transaction id (zero when not transactional).
    pub txid: u32,
    /// Total record length.
    pub len: u32,
    /// Relation touched, as `spc/db/rel`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rel: Option<String>,
    /// Commit time in unix milliseconds (commit records only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commit_unix_ms: Option<u64>,
}

/// Runs the inspect-wal command.
pub fn run(path: &Path, limit: Option<usize>, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let raw = std::fs::read(path)?;
    if raw.len() % PAGE_SIZE != 0 {
        warn!(
            size = raw.len(),
            "file is not a whole number of pages; the tail is ignored"
        );
    }
    let records = decode_records(&raw, limit);

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&records)?);
        }
        _ => {
            print_text_output(&records);
        }
    }

    Ok(())
}

/// Decodes pages from the start of `raw` until the first page that fails
/// to parse. A segment switched early is zero-filled after its last page.
pub fn decode_records(raw: &[u8], limit: Option<usize>) -> Vec<WalRecordInfo> {
    let max_records = limit.unwrap_or(usize::MAX);
    let mut cont = RecordContinuation::new();
    let mut records = Vec::new();

    for (index, chunk) in raw.chunks_exact(PAGE_SIZE).enumerate() {
        let page = match Page::parse(chunk) {
            Ok(page) => page,
            Err(e) => {
                debug!(page = index, error = %e, "stopping at undecodable page");
                break;
            }
        };
        for record in cont.feed(&page) {
            if records.len() >= max_records {
                return records;
            }
            let rel = record.rel();
            records.push(WalRecordInfo {
                lsn: record.lsn.to_string(),
                record_type: record.record_type().to_string(),
                txid: record.txid,
                len: record.len,
                rel: (!rel.is_zero()).then(|| rel.to_string()),
                commit_unix_ms: record
                    .commit_time()
                    .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                    .map(|d| d.as_millis() as u64),
            });
        }
    }

    records
}

fn print_text_output(records: &[WalRecordInfo]) {
    println!("{:<14} {:<18} {:>10} {:>8}  DETAIL", "LSN", "TYPE", "TXID", "LEN");
    for record in records {
        let mut detail = String::new();
        if let Some(rel) = &record.rel {
            detail.push_str("rel=");
            detail.push_str(rel);
        }
        if let Some(ms) = record.commit_unix_ms {
            if !detail.is_empty() {
                detail.push(' ');
            }
            detail.push_str(&format!("commit_ms={ms}"));
        }
        println!(
            "{:<14} {:<18} {:>10} {:>8}  {}",
            record.lsn, record.record_type, record.txid, record.len, detail
        );
    }
    println!();
    println!("{} record(s)", records.len());
}
