//! # walvault WAL
//!
//! Decoding of PostgreSQL write-ahead log pages and records as they arrive
//! over a physical replication connection.
//!
//! This crate is pure: it performs no I/O and holds no global state. The
//! backup agent feeds it raw 8 KiB pages and gets back typed records.
//!
//! ## Layers
//!
//! - [`Page`] - one fixed-size page: header fields plus the payload slice
//! - [`RecordContinuation`] - walks payloads page after page, carrying the
//!   partial record that straddles a page boundary
//! - [`Record`] - one decoded record with classification helpers
//!
//! ## Example
//!
//! ```rust
//! use walvault_wal::{Page, RecordContinuation, PAGE_SIZE};
//!
//! let raw = vec![0u8; PAGE_SIZE];
//! // An all-zero page carries no valid magic.
//! assert!(Page::parse(&raw).is_err());
//!
//! let mut cont = RecordContinuation::new();
//! assert!(cont.is_empty());
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod byte_order;
mod error;
mod lsn;
mod page;
mod reassembler;
mod record;
mod segment;

pub use byte_order::ByteOrder;
pub use error::{WalError, WalResult};
pub use lsn::Lsn;
pub use page::{
    align_next, Page, LONG_HEADER_SIZE, PAGE_MAGIC, PAGE_SIZE, SEGMENT_SIZE, SHORT_HEADER_SIZE,
    WORD_SIZE, XLP_FIRST_IS_CONTRECORD, XLP_LONG_HEADER,
};
pub use reassembler::RecordContinuation;
pub use record::{
    Record, RecordType, RelFileNode, BKPBLOCK_HAS_IMAGE, BKPBLOCK_SAME_REL, DATA_HEADER_LONG,
    DATA_HEADER_SHORT, MAX_RECORD_LEN, POSTGRES_EPOCH_UNIX_SECS, RECORD_HEADER_SIZE, RM_BTREE_ID,
    RM_HEAP2_ID, RM_HEAP_ID, RM_XACT_ID, RM_XLOG_ID,
};
pub use segment::{parse_segment_file_name, segment_file_name};
