//! WAL page decoding.
//!
//! ## Page Header Format
//!
//! ```text
//! | magic (2) | info (2) | timeline (4) | pageaddr (8) | rem_len (4) |
//! ```
//!
//! Pages that start a segment carry a long header, which appends:
//!
//! ```text
//! | system id (8) | segment size (4) | block size (4) |
//! ```
//!
//! The payload begins at the header size rounded by [`align_next`].

use crate::byte_order::ByteOrder;
use crate::error::{WalError, WalResult};
use crate::lsn::Lsn;
use tracing::debug;

/// Size of a WAL page in bytes.
pub const PAGE_SIZE: usize = 8192;

/// Size of a WAL segment in bytes (16 MiB).
pub const SEGMENT_SIZE: u64 = 0x100_0000;

/// Alignment unit of the producer (MAXALIGN).
pub const WORD_SIZE: u32 = 8;

/// Page magic for the supported WAL format.
pub const PAGE_MAGIC: u16 = 0xD087;

/// Bytes covered by the short page header fields.
pub const SHORT_HEADER_SIZE: u32 = 20;

/// Bytes covered by the long page header fields.
pub const LONG_HEADER_SIZE: u32 = 40;

/// Info bit: the page starts with the continuation of a record.
pub const XLP_FIRST_IS_CONTRECORD: u16 = 0x0001;

/// Info bit: the page carries a long header.
pub const XLP_LONG_HEADER: u16 = 0x0002;

/// The byte of the magic that is identical in both orientations.
const MAGIC_MARKER: u8 = 0xD0;

/// Aligns an offset the way the producer does.
///
/// A misaligned offset is rounded down to the word boundary and then moved
/// one full word forward; aligned offsets are left untouched.
#[must_use]
pub const fn align_next(offset: u64) -> u64 {
    let mask = WORD_SIZE as u64 - 1;
    if offset & mask != 0 {
        (offset & !mask) + WORD_SIZE as u64
    } else {
        offset
    }
}

/// A decoded WAL page.
///
/// The payload borrows from the raw page buffer.
#[derive(Debug, Clone, Copy)]
pub struct Page<'a> {
    /// Byte order inferred from the magic.
    pub order: ByteOrder,
    /// Page magic.
    pub magic: u16,
    /// Info flags (`XLP_*`).
    pub info: u16,
    /// Timeline the page was written on.
    pub timeline: u32,
    /// LSN of the first byte of the page.
    pub lsn: Lsn,
    /// Remaining length of a record continued from the previous page.
    pub rem_len: u32,
    /// Offset of the payload within the page.
    pub data_offset: u32,
    /// Payload bytes, from `data_offset` to the end of the page.
    pub data: &'a [u8],
}

impl<'a> Page<'a> {
    /// Parses one raw page.
    ///
    /// # Errors
    ///
    /// Returns [`WalError::MalformedPage`] if the buffer is not exactly
    /// [`PAGE_SIZE`] bytes, the byte order cannot be inferred, the magic is
    /// unknown, or a long header disagrees with the expected segment and
    /// block sizes.
    pub fn parse(raw: &'a [u8]) -> WalResult<Self> {
        if raw.len() != PAGE_SIZE {
            return Err(WalError::malformed_page(format!(
                "expected {PAGE_SIZE} bytes, got {}",
                raw.len()
            )));
        }

        let order = if raw[0] == MAGIC_MARKER && raw[1] != MAGIC_MARKER {
            ByteOrder::Big
        } else if raw[1] == MAGIC_MARKER {
            ByteOrder::Little
        } else {
            return Err(WalError::malformed_page(format!(
                "cannot infer byte order from {:02x} {:02x}",
                raw[0], raw[1]
            )));
        };

        let magic = order.read_u16(raw, 0);
        if magic != PAGE_MAGIC {
            return Err(WalError::malformed_page(format!("bad magic {magic:04x}")));
        }

        let info = order.read_u16(raw, 2);
        let timeline = order.read_u32(raw, 4);
        let lsn = Lsn(order.read_u64(raw, 8));
        let rem_len = order.read_u32(raw, 16);
        let mut data_offset = align_next(u64::from(SHORT_HEADER_SIZE)) as u32;

        if info & XLP_LONG_HEADER != 0 {
            // 24..32 holds the system identifier, which is not needed here.
            let segment_size = order.read_u32(raw, 32);
            let block_size = order.read_u32(raw, 36);
            if u64::from(segment_size) != SEGMENT_SIZE || block_size as usize != PAGE_SIZE {
                debug!(segment_size, block_size, "long header geometry mismatch");
                return Err(WalError::malformed_page(format!(
                    "unexpected geometry: segment size {segment_size:#x}, block size {block_size:#x}"
                )));
            }
            data_offset = align_next(u64::from(LONG_HEADER_SIZE)) as u32;
        }

        Ok(Self {
            order,
            magic,
            info,
            timeline,
            lsn,
            rem_len,
            data_offset,
            data: &raw[data_offset as usize..],
        })
    }

    /// Returns true if the page begins with the continuation of a record.
    #[must_use]
    pub fn is_continuation(&self) -> bool {
        self.info & XLP_FIRST_IS_CONTRECORD != 0
    }

    /// Returns true if the page carries a long header.
    #[must_use]
    pub fn is_long_header(&self) -> bool {
        self.info & XLP_LONG_HEADER != 0
    }
}
