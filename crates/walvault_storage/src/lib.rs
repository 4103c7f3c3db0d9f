//! # walvault Storage
//!
//! Object store trait and implementations for walvault.
//!
//! Stores are **opaque name → bytes maps**: they do not interpret what they
//! hold. Archive naming and resume logic live in the agent.
//!
//! ## Design Principles
//!
//! - A store offers exactly upload, download and list
//! - Uploads are all-or-nothing: a failed upload leaves no visible object
//! - Must be `Send + Sync` for use from concurrent workers
//! - Wrappers such as [`EncryptingStore`] implement the same trait as the
//!   stores they wrap
//!
//! ## Available Stores
//!
//! - [`InMemoryStore`] - For testing, with fault injection
//! - [`FileStore`] - One file per object under a root directory
//! - [`EncryptingStore`] - Wrapper that adds zstd compression and
//!   AES-256-GCM encryption
//!
//! ## Example
//!
//! ```rust
//! use bytes::Bytes;
//! use walvault_storage::{InMemoryStore, ObjectStore};
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let store = InMemoryStore::new();
//! store.upload("0.1.wal", Bytes::from_static(b"hello")).await.unwrap();
//! let data = store.download("0.1.wal").await.unwrap();
//! assert_eq!(&data[..], b"hello");
//! # });
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod encrypted;
mod error;
mod file;
mod memory;
mod store;

pub use encrypted::{EncryptingStore, EncryptionKey, KEY_SIZE, NONCE_SIZE, TAG_SIZE, ZSTD_LEVEL};
pub use error::{StoreError, StoreResult};
pub use file::FileStore;
pub use memory::InMemoryStore;
pub use store::{ObjectInfo, ObjectStore};
