//! Record reassembly across page boundaries.

use crate::lsn::Lsn;
use crate::page::{align_next, Page};
use crate::record::{Record, MAX_RECORD_LEN, RECORD_HEADER_SIZE};
use tracing::{debug, warn};

/// Continuation state carried between successive pages of one stream.
///
/// Holds the unconsumed payload (the start of a record that has not been
/// completed yet), the LSN of its first byte, and the page header bytes
/// that were skipped while the buffer was filling and have not yet been
/// folded into the LSN.
///
/// # Invariants
///
/// - After each [`feed`](Self::feed), the LSN equals the true start offset
///   of the next record.
/// - An empty buffer means the next page is scanned from its first record
///   boundary, past any declared continuation.
#[derive(Debug, Clone, Default)]
pub struct RecordContinuation {
    buf: Vec<u8>,
    lsn: Lsn,
    skip: u64,
}

impl RecordContinuation {
    /// Creates an empty continuation.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if no partial record is carried.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Returns the number of carried bytes.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Returns the LSN of the first carried byte.
    #[must_use]
    pub fn lsn(&self) -> Lsn {
        self.lsn
    }

    /// Drops all carried state.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Consumes one page and returns the records completed by it, in order.
    pub fn feed(&mut self, page: &Page<'_>) -> Vec<Record> {
        if self.buf.is_empty() {
            if page.rem_len as usize > page.data.len() {
                // the whole page belongs to a record we never saw the start of
                return Vec::new();
            }
            let skip = align_next(u64::from(page.rem_len));
            let start = (skip as usize).min(page.data.len());
            self.buf.clear();
            self.buf.extend_from_slice(&page.data[start..]);
            self.lsn = page.lsn + u64::from(page.data_offset) + skip;
            self.skip = 0;
        } else {
            if page.rem_len == 0 {
                warn!(
                    page = %page.lsn,
                    carried = self.buf.len(),
                    "continuation bytes carried into a page without remaining length"
                );
            }
            self.buf.extend_from_slice(page.data);
            self.skip += u64::from(page.data_offset);
        }

        let mut records = Vec::new();
        let mut pos = 0usize;

        while self.buf.len() - pos >= RECORD_HEADER_SIZE {
            let rest = &self.buf[pos..];
            let len = page.order.read_u32(rest, 0);

            if (len as usize) < RECORD_HEADER_SIZE || len > MAX_RECORD_LEN {
                if len == 0 {
                    debug!(lsn = %self.lsn, "zero padding after end of records");
                } else {
                    warn!(lsn = %self.lsn, len, "implausible record length, dropping buffer");
                }
                pos = self.buf.len();
                self.lsn = Lsn::ZERO;
                break;
            }

            if len as usize > rest.len() {
                break;
            }

            records.push(Record::parse(page.order, self.lsn, &rest[..len as usize]));

            let advance = align_next(u64::from(len));
            pos = pos.saturating_add(advance as usize).min(self.buf.len());
            self.lsn += advance + self.skip;
            self.skip = 0;
        }

        self.buf.drain(..pos);
        records
    }
}
