//! Error types for the backup agent.

use std::io;
use thiserror::Error;
use walvault_storage::StoreError;
use walvault_wal::{Lsn, WalError};

/// Result type for agent operations.
pub type AgentResult<T> = Result<T, AgentError>;

/// Errors that can occur while running the agent.
#[derive(Error, Debug)]
pub enum AgentError {
    /// WAL arrived at an address other than the expected next offset.
    #[error("WAL delivered at {got}, expected {expected}")]
    ProtocolViolation {
        /// Address of the delivered bytes.
        got: Lsn,
        /// Address the stream should have continued at.
        expected: Lsn,
    },

    /// The source no longer retains the requested WAL position.
    ///
    /// Consumed by the orchestrator, which restarts from a new base backup.
    #[error("WAL at {lsn} is no longer available upstream")]
    SegmentUnavailable {
        /// Position that was requested.
        lsn: Lsn,
    },

    /// Connectivity failure towards the replication source.
    #[error("connection error: {0}")]
    Connection(String),

    /// The store rejected an upload.
    #[error("upload failed: {0}")]
    Upload(StoreError),

    /// Any other store failure (listing, download).
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// No complete base backup is stored for the requested timeline.
    #[error("no complete base backup on timeline {timeline} or earlier")]
    NoBaseBackup {
        /// Highest acceptable timeline.
        timeline: u32,
    },

    /// The control plane call failed.
    #[error("control plane error: {0}")]
    ControlPlane(String),

    /// The source reports a different system than the one configured.
    #[error("system id mismatch: configured {configured}, database reports {reported}")]
    SystemMismatch {
        /// System id from the configuration.
        configured: String,
        /// System id reported by the source.
        reported: String,
    },

    /// Invalid or incomplete configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// WAL data could not be interpreted.
    #[error("WAL error: {0}")]
    Wal(#[from] WalError),

    /// A worker on the other end of a hand-off queue has stopped.
    #[error("{0} worker is gone")]
    WorkerGone(&'static str),

    /// Local I/O failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl AgentError {
    /// Creates a connection error.
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection(message.into())
    }

    /// Creates a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Returns true if this error ends the current run.
    ///
    /// Only a missing upstream segment is handled inside a run, by
    /// restarting from a fresh base backup.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, AgentError::SegmentUnavailable { .. })
    }
}
