//! Error types for WAL decoding.

use thiserror::Error;

/// Result type for WAL decoding operations.
pub type WalResult<T> = Result<T, WalError>;

/// Errors that can occur while decoding WAL data.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WalError {
    /// The page has the wrong size, an unknown magic, an undetectable byte
    /// order, or a long header that disagrees with the expected geometry.
    #[error("malformed WAL page: {reason}")]
    MalformedPage {
        /// Description of what was wrong with the page.
        reason: String,
    },

    /// An LSN string was not in `HI/LO` hexadecimal form.
    #[error("invalid LSN: {input:?}")]
    InvalidLsn {
        /// The rejected input.
        input: String,
    },

    /// A WAL segment file name could not be parsed.
    #[error("invalid WAL segment file name: {name:?}")]
    InvalidSegmentName {
        /// The rejected file name.
        name: String,
    },
}

impl WalError {
    /// Creates a malformed page error.
    pub fn malformed_page(reason: impl Into<String>) -> Self {
        Self::MalformedPage {
            reason: reason.into(),
        }
    }

    /// Returns true if this error describes a malformed page.
    #[must_use]
    pub fn is_malformed_page(&self) -> bool {
        matches!(self, Self::MalformedPage { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn malformed_page_display() {
        let err = WalError::malformed_page("bad magic d088");
        assert_eq!(err.to_string(), "malformed WAL page: bad magic d088");
        assert!(err.is_malformed_page());
    }

    #[test]
    fn other_errors_are_not_malformed_pages() {
        let err = WalError::InvalidLsn {
            input: "nope".into(),
        };
        assert!(!err.is_malformed_page());
    }
}
