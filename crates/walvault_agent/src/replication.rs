//! Replication source collaborator.
//!
//! The wire protocol is supplied from outside; the agent only depends on
//! these traits. [`MockReplicationSource`] is an in-process implementation
//! whose streams are driven from tests through a
//! [`MockReplicationController`].

use crate::error::{AgentError, AgentResult};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use walvault_wal::Lsn;

/// Administrative statement that forces the source to switch segments.
pub const SWITCH_SEGMENT_COMMAND: &str = "select pg_switch_xlog()";

/// Result of `IDENTIFY_SYSTEM`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemIdentity {
    /// Unique system identifier, in decimal.
    pub system_id: String,
    /// Current timeline.
    pub timeline: u32,
    /// Current write position.
    pub xlog_pos: Lsn,
}

/// One delivery on a WAL stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalData {
    /// Address of the first byte.
    pub lsn: Lsn,
    /// Raw WAL bytes; `None` means the start position is no longer retained.
    pub data: Option<Bytes>,
}

/// One delivery on a base-backup stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BaseChunk {
    /// Archive bytes.
    Data(Bytes),
    /// End of the archive.
    End,
}

/// A base backup in progress.
#[derive(Debug)]
pub struct BaseBackupStream {
    /// Metadata returned when the backup started.
    pub metadata: String,
    /// WAL position the backup starts at.
    pub start_lsn: Lsn,
    /// Archive chunks, terminated by [`BaseChunk::End`].
    pub chunks: mpsc::Receiver<BaseChunk>,
}

/// A source of replication connections.
#[async_trait]
pub trait ReplicationSource: Send + Sync {
    /// Opens a replication connection.
    async fn connect(&self) -> AgentResult<Box<dyn ReplicationConnection>>;

    /// Runs an administrative statement on a throwaway connection.
    async fn run_admin_command(&self, command: &str) -> AgentResult<()>;
}

/// One replication connection.
///
/// A closed stream channel means the connection was lost.
#[async_trait]
pub trait ReplicationConnection: Send {
    /// Identifies the source system.
    async fn identify_system(&mut self) -> AgentResult<SystemIdentity>;

    /// Starts streaming WAL from `start` on `timeline`.
    async fn start_replication(
        &mut self,
        start: Lsn,
        timeline: u32,
    ) -> AgentResult<mpsc::Receiver<WalData>>;

    /// Starts a base backup.
    async fn base_backup(&mut self, label: &str, flags: u32) -> AgentResult<BaseBackupStream>;
}

/// A WAL stream opened on a [`MockReplicationSource`].
#[derive(Debug)]
pub struct MockWalStream {
    /// Requested start position.
    pub start: Lsn,
    /// Requested timeline.
    pub timeline: u32,
    /// Sending side of the stream.
    pub sender: mpsc::Sender<WalData>,
}

/// A base backup started on a [`MockReplicationSource`].
#[derive(Debug)]
pub struct MockBaseBackup {
    /// Label given by the agent.
    pub label: String,
    /// Start position reported to the agent.
    pub start_lsn: Lsn,
    /// Sending side of the archive stream.
    pub sender: mpsc::Sender<BaseChunk>,
}

struct MockState {
    identity: Mutex<SystemIdentity>,
    next_base_lsn: Mutex<Lsn>,
    connected: AtomicBool,
    admin_fails: AtomicBool,
    admin_commands: Mutex<Vec<String>>,
    connections: Mutex<usize>,
    channel_capacity: usize,
    wal_streams: mpsc::UnboundedSender<MockWalStream>,
    base_backups: mpsc::UnboundedSender<MockBaseBackup>,
}

/// An in-process replication source for testing.
#[derive(Clone)]
pub struct MockReplicationSource {
    state: Arc<MockState>,
}

/// Test-side handle of a [`MockReplicationSource`].
pub struct MockReplicationController {
    state: Arc<MockState>,
    wal_streams: mpsc::UnboundedReceiver<MockWalStream>,
    base_backups: mpsc::UnboundedReceiver<MockBaseBackup>,
}

impl MockReplicationSource {
    /// Creates a source reporting `identity`, plus its controller.
    pub fn new(identity: SystemIdentity) -> (Self, MockReplicationController) {
        Self::with_channel_capacity(identity, 64)
    }

    /// Like [`new`](Self::new), with a custom stream channel bound.
    pub fn with_channel_capacity(
        identity: SystemIdentity,
        capacity: usize,
    ) -> (Self, MockReplicationController) {
        let (wal_tx, wal_rx) = mpsc::unbounded_channel();
        let (base_tx, base_rx) = mpsc::unbounded_channel();
        let state = Arc::new(MockState {
            identity: Mutex::new(identity),
            next_base_lsn: Mutex::new(Lsn::ZERO),
            connected: AtomicBool::new(true),
            admin_fails: AtomicBool::new(false),
            admin_commands: Mutex::new(Vec::new()),
            connections: Mutex::new(0),
            channel_capacity: capacity,
            wal_streams: wal_tx,
            base_backups: base_tx,
        });
        let controller = MockReplicationController {
            state: Arc::clone(&state),
            wal_streams: wal_rx,
            base_backups: base_rx,
        };
        (Self { state }, controller)
    }
}

impl MockReplicationController {
    /// Sets the identity reported by `identify_system`.
    pub fn set_identity(&self, identity: SystemIdentity) {
        *self.state.identity.lock() = identity;
    }

    /// Sets the start position reported by the next base backup.
    pub fn set_next_base_lsn(&self, lsn: Lsn) {
        *self.state.next_base_lsn.lock() = lsn;
    }

    /// Sets the connected state; while unset, every call fails.
    pub fn set_connected(&self, connected: bool) {
        self.state.connected.store(connected, Ordering::SeqCst);
    }

    /// Makes administrative commands fail while set.
    pub fn set_admin_failing(&self, failing: bool) {
        self.state.admin_fails.store(failing, Ordering::SeqCst);
    }

    /// Returns the administrative commands received.
    pub fn admin_commands(&self) -> Vec<String> {
        self.state.admin_commands.lock().clone()
    }

    /// Returns the number of connections opened.
    pub fn connection_count(&self) -> usize {
        *self.state.connections.lock()
    }

    /// Waits for the agent to start the next WAL stream.
    pub async fn next_wal_stream(&mut self) -> Option<MockWalStream> {
        self.wal_streams.recv().await
    }

    /// Waits for the agent to start the next base backup.
    pub async fn next_base_backup(&mut self) -> Option<MockBaseBackup> {
        self.base_backups.recv().await
    }
}

impl MockState {
    fn check_connected(&self) -> AgentResult<()> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(AgentError::connection("source unreachable"))
        }
    }
}

struct MockConnection {
    state: Arc<MockState>,
}

#[async_trait]
impl ReplicationSource for MockReplicationSource {
    async fn connect(&self) -> AgentResult<Box<dyn ReplicationConnection>> {
        self.state.check_connected()?;
        *self.state.connections.lock() += 1;
        Ok(Box::new(MockConnection {
            state: Arc::clone(&self.state),
        }))
    }

    async fn run_admin_command(&self, command: &str) -> AgentResult<()> {
        self.state.check_connected()?;
        if self.state.admin_fails.load(Ordering::SeqCst) {
            return Err(AgentError::connection("admin connection refused"));
        }
        self.state.admin_commands.lock().push(command.to_string());
        Ok(())
    }
}

#[async_trait]
impl ReplicationConnection for MockConnection {
    async fn identify_system(&mut self) -> AgentResult<SystemIdentity> {
        self.state.check_connected()?;
        Ok(self.state.identity.lock().clone())
    }

    async fn start_replication(
        &mut self,
        start: Lsn,
        timeline: u32,
    ) -> AgentResult<mpsc::Receiver<WalData>> {
        self.state.check_connected()?;
        let (tx, rx) = mpsc::channel(self.state.channel_capacity);
        self.state
            .wal_streams
            .send(MockWalStream {
                start,
                timeline,
                sender: tx,
            })
            .map_err(|_| AgentError::connection("mock controller dropped"))?;
        Ok(rx)
    }

    async fn base_backup(&mut self, label: &str, _flags: u32) -> AgentResult<BaseBackupStream> {
        self.state.check_connected()?;
        let start_lsn = *self.state.next_base_lsn.lock();
        let (tx, rx) = mpsc::channel(self.state.channel_capacity);
        self.state
            .base_backups
            .send(MockBaseBackup {
                label: label.to_string(),
                start_lsn,
                sender: tx,
            })
            .map_err(|_| AgentError::connection("mock controller dropped"))?;
        Ok(BaseBackupStream {
            metadata: String::new(),
            start_lsn,
            chunks: rx,
        })
    }
}
