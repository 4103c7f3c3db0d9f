//! # walvault Testkit
//!
//! Test utilities for walvault.
//!
//! This crate provides:
//! - [`WalPageWriter`], which lays synthetic records out into valid 8 KiB
//!   WAL pages (long headers at segment starts, continuation lengths,
//!   alignment), so decoder and agent tests can work from realistic bytes
//! - [`RecordSpec`] builders for commit, heap insert and filler records
//! - Property-based test generators using proptest
//!
//! ## Usage
//!
//! ```rust
//! use walvault_testkit::{RecordSpec, WalPageWriter};
//! use walvault_wal::Lsn;
//!
//! let pages = WalPageWriter::new(Lsn(0x100_0000), 1)
//!     .record(RecordSpec::commit(5, 10_000_000))
//!     .finish();
//! assert_eq!(pages.bytes.len(), 8192);
//! assert_eq!(pages.record_lsns, vec![Lsn(0x100_0000 + 40)]);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
}

pub use fixtures::*;
pub use generators::*;
