//! The backup orchestrator.
//!
//! One orchestrator runs per supervisor iteration. It registers with the
//! control plane, opens a WAL connection and a base-backup connection,
//! derives where to resume from the store listing, and then multiplexes
//! in a single event loop:
//!
//! - WAL deliveries, cut into 16 MiB segments and forwarded to the
//!   transaction-log aggregator
//! - base-backup chunks, cut into parts
//! - the rollover timer, which asks the source to switch segments when
//!   writes are slow
//! - the stale-base deadline, which starts a new base backup
//!
//! Every hand-off and every collaborator call races the run's
//! cancellation token; observing cancellation returns `Ok(())`.

use crate::catalog::{resolve_position, BaseRef, ResumePosition};
use crate::chunker::{BaseChunker, UploadUnit, WalChunker};
use crate::config::AgentConfig;
use crate::control::ControlPlane;
use crate::error::{AgentError, AgentResult};
use crate::replication::{
    BaseChunk, ReplicationConnection, ReplicationSource, WalData, SWITCH_SEGMENT_COMMAND,
};
use bytes::Bytes;
use parking_lot::RwLock;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use tokio::time::{sleep, sleep_until, Instant, Sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use walvault_storage::ObjectStore;
use walvault_wal::SEGMENT_SIZE;

/// Cap on how far ahead a deadline may be scheduled.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// Label given to base backups started by the agent.
pub const BASE_BACKUP_LABEL: &str = "walvault";

/// Where the orchestrator is in its run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupState {
    /// Reporting to the control plane.
    Registering,
    /// Deriving the resume position from the store.
    ResolvingPosition,
    /// Streaming WAL (and possibly a base backup).
    Streaming,
    /// Upstream WAL went missing; a new base backup follows.
    Restarting,
    /// The run ended.
    Terminated,
}

impl BackupState {
    /// Returns true while WAL is being consumed.
    pub fn is_streaming(&self) -> bool {
        matches!(self, BackupState::Streaming)
    }
}

impl fmt::Display for BackupState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BackupState::Registering => "registering",
            BackupState::ResolvingPosition => "resolving-position",
            BackupState::Streaming => "streaming",
            BackupState::Restarting => "restarting",
            BackupState::Terminated => "terminated",
        };
        f.write_str(name)
    }
}

/// Counters kept across runs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackupStats {
    /// WAL segments handed to the upload queue.
    pub wal_segments: u64,
    /// Base-backup objects handed to the upload queue, parts included.
    pub base_objects: u64,
    /// Base backups started.
    pub bases_started: u64,
    /// Base backups whose final object was handed off.
    pub bases_completed: u64,
    /// Restarts forced by missing upstream WAL.
    pub forced_restarts: u64,
    /// Segment switches requested by the rollover timer.
    pub rollovers: u64,
}

/// Handles shared between the orchestrator and its observers.
#[derive(Debug, Clone)]
pub struct SharedStatus {
    state: Arc<RwLock<BackupState>>,
    stats: Arc<RwLock<BackupStats>>,
}

impl Default for SharedStatus {
    fn default() -> Self {
        Self {
            state: Arc::new(RwLock::new(BackupState::Terminated)),
            stats: Arc::new(RwLock::new(BackupStats::default())),
        }
    }
}

impl SharedStatus {
    /// Current state.
    pub fn state(&self) -> BackupState {
        *self.state.read()
    }

    /// Snapshot of the counters.
    pub fn stats(&self) -> BackupStats {
        self.stats.read().clone()
    }

    fn set_state(&self, state: BackupState) {
        let previous = std::mem::replace(&mut *self.state.write(), state);
        if previous != state {
            debug!(from = %previous, to = %state, "backup state");
        }
    }

    fn count(&self, update: impl FnOnce(&mut BackupStats)) {
        update(&mut self.stats.write());
    }
}

struct InFlightBase {
    chunker: BaseChunker,
    chunks: mpsc::Receiver<BaseChunk>,
    started: Instant,
}

/// Per-position streaming state.
struct Session {
    timeline: u32,
    wal: WalChunker,
    base: Option<InFlightBase>,
    stale_at: Instant,
    rollover: Option<Pin<Box<Sleep>>>,
}

/// Drives one run of the backup.
pub struct Orchestrator {
    config: Arc<AgentConfig>,
    source: Arc<dyn ReplicationSource>,
    store: Arc<dyn ObjectStore>,
    control: Arc<dyn ControlPlane>,
    uploads: mpsc::Sender<UploadUnit>,
    txlog: mpsc::Sender<Bytes>,
    cancel: CancellationToken,
    status: SharedStatus,
}

impl Orchestrator {
    /// Creates an orchestrator for one run.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<AgentConfig>,
        source: Arc<dyn ReplicationSource>,
        store: Arc<dyn ObjectStore>,
        control: Arc<dyn ControlPlane>,
        uploads: mpsc::Sender<UploadUnit>,
        txlog: mpsc::Sender<Bytes>,
        cancel: CancellationToken,
        status: SharedStatus,
    ) -> Self {
        Self {
            config,
            source,
            store,
            control,
            uploads,
            txlog,
            cancel,
            status,
        }
    }

    /// Runs until cancelled or a fatal error.
    ///
    /// # Errors
    ///
    /// Returns the first fatal error. A missing upstream segment is not
    /// fatal: it restarts streaming from a new base backup.
    pub async fn run(self) -> AgentResult<()> {
        let result = self.run_inner().await;
        self.status.set_state(BackupState::Terminated);
        result
    }

    async fn run_inner(&self) -> AgentResult<()> {
        self.status.set_state(BackupState::Registering);
        let registration = self.config.registration();
        if self
            .race(self.control.register(&registration))
            .await?
            .is_none()
        {
            return Ok(());
        }

        let Some(mut wal_conn) = self.race(self.source.connect()).await? else {
            return Ok(());
        };
        let Some(mut base_conn) = self.race(self.source.connect()).await? else {
            return Ok(());
        };

        let mut force_new_base = false;
        loop {
            self.status.set_state(BackupState::ResolvingPosition);
            let Some(identity) = self.race(wal_conn.identify_system()).await? else {
                return Ok(());
            };
            if identity.system_id != self.config.guid {
                return Err(AgentError::SystemMismatch {
                    configured: self.config.guid.clone(),
                    reported: identity.system_id,
                });
            }

            let Some(mut session) = self
                .resolve(base_conn.as_mut(), identity.timeline, force_new_base)
                .await?
            else {
                return Ok(());
            };
            info!(
                wal = %session.wal.cursor(),
                timeline = identity.timeline,
                server = %identity.xlog_pos,
                system = %identity.system_id,
                "starting replication"
            );

            let start = session.wal.cursor();
            let Some(wal_rx) = self
                .race(wal_conn.start_replication(start, session.timeline))
                .await?
            else {
                return Ok(());
            };

            self.status.set_state(BackupState::Streaming);
            match self.stream(&mut session, wal_rx, base_conn.as_mut()).await {
                Err(AgentError::SegmentUnavailable { lsn }) => {
                    warn!(%lsn, "WAL no longer available upstream, forcing new base backup");
                    self.status.count(|s| s.forced_restarts += 1);
                    self.status.set_state(BackupState::Restarting);
                    force_new_base = true;
                }
                other => return other,
            }
        }
    }

    /// Derives the resume position and builds the session, starting a base
    /// backup if needed. Returns `None` if cancelled.
    async fn resolve(
        &self,
        base_conn: &mut dyn ReplicationConnection,
        timeline: u32,
        force_new_base: bool,
    ) -> AgentResult<Option<Session>> {
        let position = if force_new_base {
            ResumePosition::default()
        } else {
            let Some(listing) = self.race(async { Ok(self.store.list().await?) }).await? else {
                return Ok(None);
            };
            resolve_position(&listing, timeline)
        };

        let rollover = self.rollover_timer();
        match position {
            ResumePosition {
                wal_lsn: Some(wal_lsn),
                base: Some(base),
            } => {
                let stale_after = self.config.stale_base_after();
                let age = unix_now().saturating_sub(base.time);
                info!(
                    wal = %wal_lsn,
                    base = %base.lsn,
                    age_secs = age,
                    "continuing from stored position"
                );
                Ok(Some(Session {
                    timeline,
                    wal: WalChunker::new(wal_lsn, timeline),
                    base: None,
                    stale_at: deadline(
                        Instant::now(),
                        stale_after.saturating_sub(Duration::from_secs(age)),
                    ),
                    rollover,
                }))
            }
            _ => {
                let Some(base) = self.start_base(base_conn, timeline).await? else {
                    return Ok(None);
                };
                let wal_lsn = base.chunker.base().lsn.align_down(SEGMENT_SIZE);
                info!(base = %base.chunker.base().lsn, wal = %wal_lsn, "new backup");
                Ok(Some(Session {
                    timeline,
                    wal: WalChunker::new(wal_lsn, timeline),
                    stale_at: deadline(base.started, self.config.stale_base_after()),
                    base: Some(base),
                    rollover,
                }))
            }
        }
    }

    async fn start_base(
        &self,
        base_conn: &mut dyn ReplicationConnection,
        timeline: u32,
    ) -> AgentResult<Option<InFlightBase>> {
        let Some(stream) = self
            .race(base_conn.base_backup(BASE_BACKUP_LABEL, 0))
            .await?
        else {
            return Ok(None);
        };
        let base = BaseRef {
            lsn: stream.start_lsn,
            timeline,
            time: unix_now(),
        };
        info!(lsn = %base.lsn, time = base.time, "base backup started");
        self.status.count(|s| s.bases_started += 1);
        Ok(Some(InFlightBase {
            chunker: BaseChunker::new(base, self.config.tuning.base_part_size),
            chunks: stream.chunks,
            started: Instant::now(),
        }))
    }

    /// The streaming event loop. Returns `Ok(())` on cancellation.
    async fn stream(
        &self,
        session: &mut Session,
        mut wal_rx: mpsc::Receiver<WalData>,
        base_conn: &mut dyn ReplicationConnection,
    ) -> AgentResult<()> {
        loop {
            let idle = session.base.is_none();
            let stale_at = session.stale_at;
            tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                wal = wal_rx.recv() => {
                    let Some(wal) = wal else {
                        return Err(AgentError::connection("WAL stream closed"));
                    };
                    if !self.on_wal(session, wal).await? {
                        return Ok(());
                    }
                }
                chunk = next_base_chunk(&mut session.base) => {
                    if !self.on_base_chunk(session, chunk).await? {
                        return Ok(());
                    }
                }
                _ = rollover_fired(&mut session.rollover) => {
                    session.rollover = None;
                    if session.base.is_none() {
                        self.switch_segment().await;
                    }
                }
                _ = sleep_until(stale_at), if idle => {}
            }

            if session.base.is_none() && Instant::now() >= session.stale_at {
                info!("last base backup is stale");
                let Some(base) = self.start_base(base_conn, session.timeline).await? else {
                    return Ok(());
                };
                session.base = Some(base);
                session.rollover = None;
            }
        }
    }

    async fn on_wal(&self, session: &mut Session, wal: WalData) -> AgentResult<bool> {
        let data = match wal.data {
            Some(data) if !data.is_empty() => data,
            _ => return Err(AgentError::SegmentUnavailable { lsn: wal.lsn }),
        };

        let units = session.wal.push(wal.lsn, &data)?;
        debug!(lsn = %wal.lsn, len = data.len(), "WAL received");
        if !self.hand_off(&self.txlog, data, "txlog").await? {
            return Ok(false);
        }
        for unit in units {
            debug!(object = %unit.name, "WAL segment complete");
            if !self.hand_off(&self.uploads, unit, "upload").await? {
                return Ok(false);
            }
            self.status.count(|s| s.wal_segments += 1);
            session.rollover = self.rollover_timer();
        }
        Ok(true)
    }

    async fn on_base_chunk(
        &self,
        session: &mut Session,
        chunk: Option<BaseChunk>,
    ) -> AgentResult<bool> {
        match chunk {
            None => Err(AgentError::connection("base backup stream closed")),
            Some(BaseChunk::Data(data)) => {
                let units = match session.base.as_mut() {
                    Some(base) => base.chunker.push(&data),
                    None => return Ok(true),
                };
                for unit in units {
                    if !self.hand_off(&self.uploads, unit, "upload").await? {
                        return Ok(false);
                    }
                    self.status.count(|s| s.base_objects += 1);
                }
                Ok(true)
            }
            Some(BaseChunk::End) => {
                let Some(base) = session.base.take() else {
                    return Ok(true);
                };
                let parts = base.chunker.parts_emitted() + 1;
                let unit = base.chunker.finish();
                info!(object = %unit.name, parts, "base backup complete");
                session.stale_at = deadline(base.started, self.config.stale_base_after());
                if !self.hand_off(&self.uploads, unit, "upload").await? {
                    return Ok(false);
                }
                self.status.count(|s| {
                    s.base_objects += 1;
                    s.bases_completed += 1;
                });
                Ok(true)
            }
        }
    }

    async fn switch_segment(&self) {
        let result = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return,
            result = self.source.run_admin_command(SWITCH_SEGMENT_COMMAND) => result,
        };
        match result {
            Ok(()) => {
                info!("requested WAL segment switch");
                self.status.count(|s| s.rollovers += 1);
            }
            Err(e) => warn!(error = %e, "WAL segment switch failed"),
        }
    }

    fn rollover_timer(&self) -> Option<Pin<Box<Sleep>>> {
        self.config
            .rollover_interval()
            .map(|interval| Box::pin(sleep(interval)))
    }

    /// Sends `item`, racing cancellation. Returns false if cancelled.
    async fn hand_off<T>(
        &self,
        tx: &mpsc::Sender<T>,
        item: T,
        worker: &'static str,
    ) -> AgentResult<bool> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Ok(false),
            sent = tx.send(item) => sent
                .map(|()| true)
                .map_err(|_| AgentError::WorkerGone(worker)),
        }
    }

    /// Awaits `fut` unless cancelled first, in which case `None` is returned.
    async fn race<T>(&self, fut: impl Future<Output = AgentResult<T>>) -> AgentResult<Option<T>> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Ok(None),
            result = fut => result.map(Some),
        }
    }
}

async fn next_base_chunk(base: &mut Option<InFlightBase>) -> Option<BaseChunk> {
    match base {
        Some(base) => base.chunks.recv().await,
        None => std::future::pending().await,
    }
}

async fn rollover_fired(timer: &mut Option<Pin<Box<Sleep>>>) {
    match timer {
        Some(timer) => timer.as_mut().await,
        None => std::future::pending().await,
    }
}

/// `from + after`, clamped so oversized durations cannot overflow.
fn deadline(from: Instant, after: Duration) -> Instant {
    from.checked_add(after.min(FAR_FUTURE)).unwrap_or(from)
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}
