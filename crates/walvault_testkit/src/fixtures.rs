//! Synthetic WAL fixtures.
//!
//! Records are serialized back to back (each padded to the word size) into
//! a logical stream, which is then cut into pages. Every page gets the
//! header the producer would write: a long header when the page starts a
//! segment, and the remaining length of any record continued from the
//! previous page.

use walvault_wal::{
    Lsn, RelFileNode, DATA_HEADER_LONG, DATA_HEADER_SHORT, LONG_HEADER_SIZE, PAGE_MAGIC,
    PAGE_SIZE, RECORD_HEADER_SIZE, RM_HEAP_ID, RM_XACT_ID, SEGMENT_SIZE, WORD_SIZE,
    XLP_FIRST_IS_CONTRECORD, XLP_LONG_HEADER,
};

/// Size of a short page header once aligned.
const SHORT_PAGE_HEADER: usize = 24;

/// System identifier written into long headers.
pub const TEST_SYSTEM_ID: u64 = 6_350_021_914_257_315_137;

/// A record to be written by [`WalPageWriter`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordSpec {
    /// Resource manager id.
    pub rmgr: u8,
    /// Info byte.
    pub info: u8,
    /// Transaction id.
    pub txid: u32,
    /// Previous-record backlink.
    pub prev: Lsn,
    /// Bytes following the 24-byte header.
    pub body: Vec<u8>,
}

impl RecordSpec {
    /// A record with an arbitrary body.
    pub fn raw(rmgr: u8, info: u8, txid: u32, body: Vec<u8>) -> Self {
        Self {
            rmgr,
            info,
            txid,
            prev: Lsn::ZERO,
            body,
        }
    }

    /// A 40-byte commit record whose commit time is `micros` after
    /// 2000-01-01 UTC.
    pub fn commit(txid: u32, micros: i64) -> Self {
        let mut body = vec![DATA_HEADER_SHORT, 14];
        body.extend_from_slice(&micros.to_le_bytes());
        body.extend_from_slice(&[0u8; 6]);
        Self::raw(RM_XACT_ID, 0x00, txid, body)
    }

    /// A heap insert touching `rel`, carrying `tuple_len` bytes of block data.
    pub fn heap_insert(txid: u32, rel: RelFileNode, tuple_len: u16) -> Self {
        let mut body = vec![0u8, 0x20];
        body.extend_from_slice(&tuple_len.to_le_bytes());
        body.extend_from_slice(&rel.spc.to_le_bytes());
        body.extend_from_slice(&rel.db.to_le_bytes());
        body.extend_from_slice(&rel.rel.to_le_bytes());
        body.extend_from_slice(&0u32.to_le_bytes());
        body.extend_from_slice(&[DATA_HEADER_SHORT, 3]);
        body.extend(std::iter::repeat(0x5A).take(tuple_len as usize));
        body.extend_from_slice(&[1, 0, 0]);
        Self::raw(RM_HEAP_ID, 0x00, txid, body)
    }

    /// A record of exactly `total_len` bytes (at least 29) with a long
    /// main-data header, useful for spanning pages.
    pub fn filler(rmgr: u8, info: u8, txid: u32, total_len: u32) -> Self {
        let main = total_len as usize - RECORD_HEADER_SIZE - 5;
        let mut body = vec![DATA_HEADER_LONG];
        body.extend_from_slice(&(main as u32).to_le_bytes());
        body.resize(total_len as usize - RECORD_HEADER_SIZE, 0xC3);
        Self::raw(rmgr, info, txid, body)
    }

    /// Sets the previous-record backlink.
    pub fn with_prev(mut self, prev: Lsn) -> Self {
        self.prev = prev;
        self
    }

    /// Total encoded length, header included.
    pub fn encoded_len(&self) -> usize {
        RECORD_HEADER_SIZE + self.body.len()
    }

    /// Serializes the record in little-endian order.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.encoded_len());
        out.extend_from_slice(&(self.encoded_len() as u32).to_le_bytes());
        out.extend_from_slice(&self.txid.to_le_bytes());
        out.extend_from_slice(&self.prev.as_u64().to_le_bytes());
        out.push(self.info);
        out.push(self.rmgr);
        out.extend_from_slice(&[0, 0]);
        out.extend_from_slice(&0u32.to_le_bytes());
        out.extend_from_slice(&self.body);
        out
    }
}

/// Pages produced by [`WalPageWriter::finish`].
#[derive(Debug, Clone)]
pub struct WalPages {
    /// Raw page bytes, a multiple of 8 KiB.
    pub bytes: Vec<u8>,
    /// LSN of each record, in write order.
    pub record_lsns: Vec<Lsn>,
    /// LSN just past the last page.
    pub end_lsn: Lsn,
}

impl WalPages {
    /// Iterates over the individual pages.
    pub fn pages(&self) -> impl Iterator<Item = &[u8]> {
        self.bytes.chunks(PAGE_SIZE)
    }

    /// Returns the number of pages.
    pub fn page_count(&self) -> usize {
        self.bytes.len() / PAGE_SIZE
    }
}

/// Lays records out into WAL pages.
#[derive(Debug, Clone)]
pub struct WalPageWriter {
    start: Lsn,
    timeline: u32,
    records: Vec<RecordSpec>,
    min_pages: usize,
}

impl WalPageWriter {
    /// Creates a writer whose first page starts at `start` (page aligned).
    pub fn new(start: Lsn, timeline: u32) -> Self {
        assert_eq!(start.as_u64() % PAGE_SIZE as u64, 0, "start must be page aligned");
        Self {
            start,
            timeline,
            records: Vec::new(),
            min_pages: 1,
        }
    }

    /// Appends a record.
    pub fn record(mut self, record: RecordSpec) -> Self {
        self.records.push(record);
        self
    }

    /// Appends several records.
    pub fn records(mut self, records: impl IntoIterator<Item = RecordSpec>) -> Self {
        self.records.extend(records);
        self
    }

    /// Pads the output with zero-payload pages up to `pages` pages.
    pub fn min_pages(mut self, pages: usize) -> Self {
        self.min_pages = pages;
        self
    }

    /// Produces the pages.
    pub fn finish(self) -> WalPages {
        let word = WORD_SIZE as usize;
        let mut stream = Vec::new();
        let mut spans = Vec::with_capacity(self.records.len());
        for record in &self.records {
            let encoded = record.encode();
            spans.push((stream.len(), encoded.len()));
            stream.extend_from_slice(&encoded);
            let padded = stream.len().div_ceil(word) * word;
            stream.resize(padded, 0);
        }

        let mut bytes = Vec::new();
        let mut record_lsns = vec![Lsn::ZERO; spans.len()];
        let mut offset = 0usize;
        let mut addr = self.start;
        let mut pages = 0usize;

        while offset < stream.len() || pages < self.min_pages {
            let long = addr.as_u64() % SEGMENT_SIZE == 0;
            let header = if long {
                LONG_HEADER_SIZE as usize
            } else {
                SHORT_PAGE_HEADER
            };
            let capacity = PAGE_SIZE - header;

            let rem_len = spans
                .iter()
                .find(|(s, l)| *s < offset && offset < s + l)
                .map(|(s, l)| s + l - offset)
                .unwrap_or(0);

            for (i, (s, _)) in spans.iter().enumerate() {
                if *s >= offset && *s < offset + capacity {
                    record_lsns[i] = addr + (header + (s - offset)) as u64;
                }
            }

            let mut page = vec![0u8; PAGE_SIZE];
            let mut info = 0u16;
            if long {
                info |= XLP_LONG_HEADER;
            }
            if rem_len > 0 {
                info |= XLP_FIRST_IS_CONTRECORD;
            }
            page[0..2].copy_from_slice(&PAGE_MAGIC.to_le_bytes());
            page[2..4].copy_from_slice(&info.to_le_bytes());
            page[4..8].copy_from_slice(&self.timeline.to_le_bytes());
            page[8..16].copy_from_slice(&addr.as_u64().to_le_bytes());
            page[16..20].copy_from_slice(&(rem_len as u32).to_le_bytes());
            if long {
                page[24..32].copy_from_slice(&TEST_SYSTEM_ID.to_le_bytes());
                page[32..36].copy_from_slice(&(SEGMENT_SIZE as u32).to_le_bytes());
                page[36..40].copy_from_slice(&(PAGE_SIZE as u32).to_le_bytes());
            }

            if offset < stream.len() {
                let end = (offset + capacity).min(stream.len());
                page[header..header + (end - offset)].copy_from_slice(&stream[offset..end]);
            }

            bytes.extend_from_slice(&page);
            offset += capacity;
            addr += PAGE_SIZE as u64;
            pages += 1;
        }

        WalPages {
            bytes,
            record_lsns,
            end_lsn: addr,
        }
    }
}
