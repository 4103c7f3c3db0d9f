//! Error types for object store operations.

use std::io;
use thiserror::Error;

/// Result type for object store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur during object store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// No object exists under the requested name.
    #[error("object not found: {name}")]
    NotFound {
        /// The requested name.
        name: String,
    },

    /// The name cannot be used as an object name.
    #[error("invalid object name: {name:?}")]
    InvalidName {
        /// The rejected name.
        name: String,
    },

    /// The backing store refused the upload.
    #[error("upload of {name} rejected: {reason}")]
    UploadRejected {
        /// The object name.
        name: String,
        /// Reason given by the backend.
        reason: String,
    },

    /// The backing store failed for another reason.
    #[error("store backend error: {0}")]
    Backend(String),

    /// A downloaded object could not be decrypted or decompressed.
    #[error("cannot decode {name}: {reason}")]
    Decode {
        /// The object name.
        name: String,
        /// What went wrong.
        reason: String,
    },

    /// The encryption key is malformed.
    #[error("invalid encryption key: {0}")]
    InvalidKey(String),
}

impl StoreError {
    /// Creates a not-found error.
    pub fn not_found(name: impl Into<String>) -> Self {
        Self::NotFound { name: name.into() }
    }

    /// Creates a decode error.
    pub fn decode(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Decode {
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// Returns true if the object does not exist.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Returns true if a downloaded object failed to decode.
    #[must_use]
    pub fn is_decode(&self) -> bool {
        matches!(self, Self::Decode { .. })
    }
}
