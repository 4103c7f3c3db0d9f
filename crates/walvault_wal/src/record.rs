//! WAL records and their classification.
//!
//! ## Record Header Format
//!
//! ```text
//! | total_len (4) | xid (4) | prev (8) | info (1) | rmgr (1) | pad (2) | crc (4) |
//! ```
//!
//! The header is followed by zero or more block headers, one data header
//! (short or long form) and the block and main data.

use crate::byte_order::ByteOrder;
use crate::lsn::Lsn;
use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::warn;

/// Size of the fixed record header.
pub const RECORD_HEADER_SIZE: usize = 24;

/// Smallest block header the walker will step over.
const BLOCK_HEADER_MIN: usize = 24;

/// Smallest remaining length that can still hold a block id and a data header.
const DATA_HEADER_MIN: usize = 5;

/// Largest plausible record length.
pub const MAX_RECORD_LEN: u32 = 0x100_0000;

/// Block id marking a long-form main data header (id + u32 length).
pub const DATA_HEADER_LONG: u8 = 254;

/// Block id marking a short-form main data header (id + u8 length).
pub const DATA_HEADER_SHORT: u8 = 255;

/// Block fork flag: a full page image follows the block header.
pub const BKPBLOCK_HAS_IMAGE: u8 = 0x10;

/// Block fork flag: the block reuses the previous block's relation.
pub const BKPBLOCK_SAME_REL: u8 = 0x80;

/// Image info bits for a holed, compressed image (extra hole length field).
const BKPIMAGE_HOLE_AND_COMPRESSED: u8 = 0x03;

/// Info bit for the initial record of a page.
const XLR_INIT_PAGE: u8 = 0x80;

/// Resource manager: XLOG.
pub const RM_XLOG_ID: u8 = 0x00;
/// Resource manager: transactions.
pub const RM_XACT_ID: u8 = 0x01;
/// Resource manager: heap2.
pub const RM_HEAP2_ID: u8 = 0x09;
/// Resource manager: heap.
pub const RM_HEAP_ID: u8 = 0x0A;
/// Resource manager: btree.
pub const RM_BTREE_ID: u8 = 0x0B;

/// Unix time of the producer's timestamp epoch, 2000-01-01 00:00:00 UTC.
pub const POSTGRES_EPOCH_UNIX_SECS: u64 = 946_684_800;

/// Classification of a record by resource manager and operation bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordType {
    /// Transaction commit.
    Commit,
    /// Transaction abort.
    Abort,
    /// Heap tuple insert.
    Insert,
    /// Heap tuple update.
    Update,
    /// Heap tuple delete.
    Delete,
    /// Heap-only tuple update.
    HotUpdate,
    /// In-place heap update.
    Inplace,
    /// Heap row lock.
    HeapLock,
    /// Heap2 page cleanup.
    Heap2Clean,
    /// Heap2 multi-insert.
    MultiInsert,
    /// Btree leaf insert.
    BtreeInsertLeaf,
    /// Any combination not in the table, carrying the raw code.
    Unknown(u16),
}

impl RecordType {
    /// Classifies a resource manager id and info byte.
    #[must_use]
    pub fn classify(rmgr: u8, info: u8) -> Self {
        let code = (u16::from(rmgr) << 8) | u16::from(info & 0x70);
        match code {
            0x100 | 0x160 => Self::Commit,
            0x120 => Self::Abort,
            0x950 => Self::MultiInsert,
            0xa00 => Self::Insert,
            0xa70 => Self::Inplace,
            0xa10 => Self::Delete,
            0xa20 => Self::Update,
            0xa40 => Self::HotUpdate,
            0x910 => Self::Heap2Clean,
            0xa60 => Self::HeapLock,
            0xb00 => Self::BtreeInsertLeaf,
            other => Self::Unknown(other),
        }
    }
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Commit => f.write_str("commit"),
            Self::Abort => f.write_str("abort"),
            Self::Insert => f.write_str("insert"),
            Self::Update => f.write_str("update"),
            Self::Delete => f.write_str("delete"),
            Self::HotUpdate => f.write_str("hot_update"),
            Self::Inplace => f.write_str("inplace"),
            Self::HeapLock => f.write_str("heap:lock"),
            Self::Heap2Clean => f.write_str("heap2:clean"),
            Self::MultiInsert => f.write_str("multi_insert"),
            Self::BtreeInsertLeaf => f.write_str("btree:insert_leaf"),
            Self::Unknown(code) => write!(f, "unknown:{code:04x}"),
        }
    }
}

/// Physical relation identity: tablespace, database and relation ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct RelFileNode {
    /// Tablespace id.
    pub spc: u32,
    /// Database id.
    pub db: u32,
    /// Relation file id.
    pub rel: u32,
}

impl RelFileNode {
    /// Returns true if no relation was found.
    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.spc == 0 && self.db == 0 && self.rel == 0
    }
}

impl fmt::Display for RelFileNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.spc, self.db, self.rel)
    }
}

/// One WAL record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// Byte order of the page the record came from.
    pub order: ByteOrder,
    /// LSN of the record's first byte (not stored in the record itself).
    pub lsn: Lsn,
    /// Total record length, header included.
    pub len: u32,
    /// Transaction id, zero when the record is not transactional.
    pub txid: u32,
    /// LSN of the previous record.
    pub prev: Lsn,
    /// Info byte.
    pub info: u8,
    /// Resource manager id.
    pub rmgr: u8,
    /// Stored checksum (not verified).
    pub crc: u32,
    /// Record bytes following the fixed header.
    pub data: Vec<u8>,
}

impl Record {
    /// Parses the fixed header of `raw`, which must hold the whole record.
    ///
    /// # Panics
    ///
    /// Panics if `raw` is shorter than [`RECORD_HEADER_SIZE`].
    #[must_use]
    pub fn parse(order: ByteOrder, lsn: Lsn, raw: &[u8]) -> Self {
        Self {
            order,
            lsn,
            len: order.read_u32(raw, 0),
            txid: order.read_u32(raw, 4),
            prev: Lsn(order.read_u64(raw, 8)),
            info: raw[16],
            rmgr: raw[17],
            crc: order.read_u32(raw, 20),
            data: raw[RECORD_HEADER_SIZE..].to_vec(),
        }
    }

    /// Returns the record classification.
    #[must_use]
    pub fn record_type(&self) -> RecordType {
        RecordType::classify(self.rmgr, self.info)
    }

    /// Returns true if the record initializes its page.
    #[must_use]
    pub fn is_init(&self) -> bool {
        self.info & XLR_INIT_PAGE != 0
    }

    /// Returns the relation the record touches.
    ///
    /// A record may reference several relations; the last block header
    /// with a non-zero tablespace wins. Returns all zeros when none is found.
    #[must_use]
    pub fn rel(&self) -> RelFileNode {
        let mut found = RelFileNode::default();
        self.walk_blocks(|node| {
            if node.spc != 0 {
                found = node;
            }
        });
        found
    }

    /// Returns the commit time of a commit record.
    ///
    /// The first 8 bytes of the main data are microseconds since
    /// 2000-01-01 UTC. Returns `None` for other record types or when the
    /// main data holds nothing past the timestamp.
    #[must_use]
    pub fn commit_time(&self) -> Option<SystemTime> {
        if self.record_type() != RecordType::Commit {
            return None;
        }
        let main = self.walk_blocks(|_| {})?;
        if main.len() <= 8 {
            return None;
        }
        let micros = self.order.read_i64(main, 0);
        let epoch = UNIX_EPOCH + Duration::from_secs(POSTGRES_EPOCH_UNIX_SECS);
        if micros >= 0 {
            epoch.checked_add(Duration::from_micros(micros as u64))
        } else {
            epoch.checked_sub(Duration::from_micros(micros.unsigned_abs()))
        }
    }

    /// Walks the block headers, calling `visit` with the relation in effect
    /// for each block, and returns the bytes after the data header.
    ///
    /// Returns `None` if the headers run off the end of the record.
    fn walk_blocks(&self, mut visit: impl FnMut(RelFileNode)) -> Option<&[u8]> {
        let order = self.order;
        let mut data = self.data.as_slice();
        let mut node = RelFileNode::default();

        loop {
            if data.len() < DATA_HEADER_MIN {
                warn!(lsn = %self.lsn, remaining = data.len(), "truncated block header");
                return None;
            }

            match data[0] {
                DATA_HEADER_LONG => return data.get(5..),
                DATA_HEADER_SHORT => return data.get(2..),
                _ => {}
            }

            if data.len() < BLOCK_HEADER_MIN {
                warn!(lsn = %self.lsn, remaining = data.len(), "truncated block header");
                return None;
            }

            let fork_flags = data[1];
            data = &data[4..];

            if fork_flags & BKPBLOCK_HAS_IMAGE != 0 {
                let image_info = *data.get(4)?;
                data = data.get(5..)?;
                if image_info & BKPIMAGE_HOLE_AND_COMPRESSED == BKPIMAGE_HOLE_AND_COMPRESSED {
                    data = data.get(2..)?;
                }
            }

            if fork_flags & BKPBLOCK_SAME_REL == 0 {
                let raw = data.get(..12)?;
                node = RelFileNode {
                    spc: order.read_u32(raw, 0),
                    db: order.read_u32(raw, 4),
                    rel: order.read_u32(raw, 8),
                };
                data = &data[12..];
            }

            // block number
            data = data.get(4..)?;
            visit(node);
        }
    }
}
