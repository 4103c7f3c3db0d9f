//! WAL segment file names as used by the producer's archive and restore hooks.

use crate::error::{WalError, WalResult};
use crate::lsn::Lsn;

/// Parses a 24-hex-digit segment file name into its timeline and start LSN.
///
/// The name is `TTTTTTTTLLLLLLLLSSSSSSSS`: timeline, logical log id and
/// segment number. The segment number is masked to its low byte, matching
/// 16 MiB segments.
///
/// # Errors
///
/// Returns [`WalError::InvalidSegmentName`] for names that are not 24 hex
/// digits or that carry timeline zero.
pub fn parse_segment_file_name(name: &str) -> WalResult<(u32, Lsn)> {
    let invalid = || WalError::InvalidSegmentName {
        name: name.to_string(),
    };
    if name.len() != 24 || !name.is_ascii() {
        return Err(invalid());
    }
    let field = |range: std::ops::Range<usize>| {
        u32::from_str_radix(&name[range], 16).map_err(|_| invalid())
    };
    let timeline = field(0..8)?;
    let logical = u64::from(field(8..16)?);
    let physical = u64::from(field(16..24)?);
    if timeline == 0 {
        return Err(invalid());
    }
    Ok((timeline, Lsn((logical << 32) | ((physical & 0xff) << 24))))
}

/// Formats the segment file name for the segment starting at `lsn`.
#[must_use]
pub fn segment_file_name(timeline: u32, lsn: Lsn) -> String {
    let raw = lsn.as_u64();
    format!("{:08X}{:08X}{:08X}", timeline, raw >> 32, (raw >> 24) & 0xff)
}
