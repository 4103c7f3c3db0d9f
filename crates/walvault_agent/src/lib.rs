//! # walvault Agent
//!
//! Continuous backup of a PostgreSQL server: WAL is streamed over
//! replication, cut into 16 MiB segments, and uploaded together with
//! periodic base backups to an encrypting object store.
//!
//! This crate provides:
//! - Configuration loading
//! - Replication and control-plane collaborator traits, with in-process
//!   implementations for testing
//! - Object naming and resume-position resolution
//! - The orchestrator, upload queue and transaction-log workers
//! - The supervisor that restarts the worker group after failures
//! - Restore helpers
//!
//! ## Architecture
//!
//! ```text
//!   replication ──► Orchestrator ──(upload units)──► UploadQueue ──► store
//!                        │
//!                        └──(raw WAL)──► TxLogWorker ──► control plane
//! ```
//!
//! ## Key Invariants
//!
//! - The store listing is the only persistent state; every run resumes
//!   from it
//! - Uploads happen one at a time, in order
//! - WAL must arrive contiguously; a gap ends the run
//! - Every blocking call races the run's cancellation token
//! - Transaction-log aggregation is best effort and never ends a run

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod catalog;
mod chunker;
mod config;
mod control;
mod error;
mod orchestrator;
mod replication;
mod restore;
mod supervisor;
mod txlog;
mod upload;

pub use catalog::{latest_base, resolve_position, BaseRef, ObjectName, ResumePosition};
pub use chunker::{BaseChunker, UploadUnit, WalChunker};
pub use config::{AgentConfig, AgentTuning, CONFIG_SEARCH_PATH, DEFAULT_BASE_PART_SIZE};
pub use control::{
    ControlPlane, HttpClient, HttpControlPlane, HttpMethod, MemoryControlPlane, Registration,
    TxLogPush,
};
pub use error::{AgentError, AgentResult};
pub use orchestrator::{BackupState, BackupStats, Orchestrator, SharedStatus, BASE_BACKUP_LABEL};
pub use replication::{
    BaseBackupStream, BaseChunk, MockBaseBackup, MockReplicationController,
    MockReplicationSource, MockWalStream, ReplicationConnection, ReplicationSource,
    SystemIdentity, WalData, SWITCH_SEGMENT_COMMAND,
};
pub use restore::{
    fetch_base_backup, find_base, restore_wal_segment, segment_object, RestoreOutcome,
};
pub use supervisor::{Agent, RunContext, RunReport, WorkerExit};
pub use txlog::{TxLogAggregator, TxLogWorker};
pub use upload::UploadQueue;
