//! Run supervision.
//!
//! A run is the orchestrator, the upload queue and the transaction-log
//! worker, connected by two bounded queues and one cancellation token. The
//! first worker to stop cancels the others; once all three have stopped
//! the supervisor waits a cooldown and builds a fresh run. Nothing carries
//! over between runs except what the store listing says.

use crate::chunker::UploadUnit;
use crate::config::{AgentConfig, AgentTuning};
use crate::control::ControlPlane;
use crate::error::{AgentError, AgentResult};
use crate::orchestrator::{BackupState, BackupStats, Orchestrator, SharedStatus};
use crate::replication::ReplicationSource;
use crate::txlog::{TxLogAggregator, TxLogWorker};
use crate::upload::UploadQueue;
use bytes::Bytes;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use walvault_storage::ObjectStore;

/// Per-run state handed to the workers.
///
/// Built fresh for every run so that nothing leaks from a failed one.
pub struct RunContext {
    /// Cancelled when any worker stops or on shutdown.
    pub cancel: CancellationToken,
    /// Orchestrator to upload queue.
    pub upload_tx: mpsc::Sender<UploadUnit>,
    /// Upload queue input.
    pub upload_rx: mpsc::Receiver<UploadUnit>,
    /// Orchestrator to transaction-log worker.
    pub txlog_tx: mpsc::Sender<Bytes>,
    /// Transaction-log worker input.
    pub txlog_rx: mpsc::Receiver<Bytes>,
}

impl RunContext {
    /// Creates the context of a run that ends with `shutdown`.
    pub fn new(shutdown: &CancellationToken, tuning: &AgentTuning) -> Self {
        let (upload_tx, upload_rx) = mpsc::channel(tuning.upload_queue_depth.max(1));
        let (txlog_tx, txlog_rx) = mpsc::channel(tuning.txlog_queue_depth.max(1));
        Self {
            cancel: shutdown.child_token(),
            upload_tx,
            upload_rx,
            txlog_tx,
            txlog_rx,
        }
    }
}

/// How a worker stopped.
#[derive(Debug)]
pub enum WorkerExit {
    /// Returned without error.
    Clean,
    /// Returned an error.
    Failed(AgentError),
    /// Panicked; the payload is the panic description.
    Panicked(String),
}

/// Outcome of one run.
#[derive(Debug, Default)]
pub struct RunReport {
    /// Each worker's exit, in the order they stopped.
    pub exits: Vec<(&'static str, WorkerExit)>,
}

impl RunReport {
    /// Returns true if every worker returned without error.
    pub fn is_clean(&self) -> bool {
        self.exits
            .iter()
            .all(|(_, exit)| matches!(exit, WorkerExit::Clean))
    }

    /// Returns the first error returned by a worker.
    pub fn first_error(&self) -> Option<&AgentError> {
        self.exits.iter().find_map(|(_, exit)| match exit {
            WorkerExit::Failed(e) => Some(e),
            _ => None,
        })
    }

    /// Returns the exit of the named worker.
    pub fn exit_of(&self, worker: &str) -> Option<&WorkerExit> {
        self.exits
            .iter()
            .find(|(name, _)| *name == worker)
            .map(|(_, exit)| exit)
    }
}

/// The backup agent: runs worker groups until shutdown.
pub struct Agent {
    config: Arc<AgentConfig>,
    source: Arc<dyn ReplicationSource>,
    store: Arc<dyn ObjectStore>,
    control: Arc<dyn ControlPlane>,
    status: SharedStatus,
    runs: AtomicU64,
}

impl Agent {
    /// Creates an agent from its configuration and collaborators.
    pub fn new(
        config: AgentConfig,
        source: Arc<dyn ReplicationSource>,
        store: Arc<dyn ObjectStore>,
        control: Arc<dyn ControlPlane>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            source,
            store,
            control,
            status: SharedStatus::default(),
            runs: AtomicU64::new(0),
        }
    }

    /// Current orchestrator state.
    pub fn state(&self) -> BackupState {
        self.status.state()
    }

    /// Counters accumulated over all runs.
    pub fn stats(&self) -> BackupStats {
        self.status.stats()
    }

    /// Number of runs started.
    pub fn runs(&self) -> u64 {
        self.runs.load(Ordering::SeqCst)
    }

    /// Runs worker groups until `shutdown` is cancelled.
    pub async fn run(&self, shutdown: CancellationToken) {
        let cooldown = self.config.tuning.restart_cooldown;
        while !shutdown.is_cancelled() {
            let report = self.run_once(&shutdown).await;
            if shutdown.is_cancelled() {
                break;
            }
            match report.first_error() {
                Some(e) => warn!(error = %e, ?cooldown, "run failed, restarting"),
                None => warn!(?cooldown, "run stopped, restarting"),
            }
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(cooldown) => {}
            }
        }
        info!("agent stopped");
    }

    /// Runs one worker group until its first worker stops, then cancels
    /// and drains the others.
    pub async fn run_once(&self, shutdown: &CancellationToken) -> RunReport {
        let run = self.runs.fetch_add(1, Ordering::SeqCst) + 1;
        info!(run, "starting workers");

        let ctx = RunContext::new(shutdown, &self.config.tuning);
        let tuning = &self.config.tuning;

        let orchestrator = Orchestrator::new(
            Arc::clone(&self.config),
            Arc::clone(&self.source),
            Arc::clone(&self.store),
            Arc::clone(&self.control),
            ctx.upload_tx,
            ctx.txlog_tx,
            ctx.cancel.clone(),
            self.status.clone(),
        );
        let uploads = UploadQueue::new(
            Arc::clone(&self.store),
            ctx.upload_rx,
            ctx.cancel.clone(),
        );
        let txlog = TxLogWorker::new(
            TxLogAggregator::new(tuning.txlog_staleness),
            Arc::clone(&self.control),
            ctx.txlog_rx,
            ctx.cancel.clone(),
        )
        .with_flush_timing(tuning.txlog_first_flush, tuning.txlog_flush_interval);

        let mut workers = JoinSet::new();
        spawn_worker(&mut workers, "orchestrator", orchestrator.run());
        spawn_worker(&mut workers, "upload", uploads.run());
        spawn_worker(&mut workers, "txlog", txlog.run());

        let mut report = RunReport::default();
        while let Some(joined) = workers.join_next().await {
            ctx.cancel.cancel();
            match joined {
                Ok((name, exit)) => {
                    log_exit(name, &exit);
                    report.exits.push((name, exit));
                }
                Err(e) => error!(error = %e, "worker supervisor task failed"),
            }
        }
        report
    }
}

/// Spawns `worker` in its own task so that a panic is caught and reported
/// under the worker's name.
fn spawn_worker<F>(set: &mut JoinSet<(&'static str, WorkerExit)>, name: &'static str, worker: F)
where
    F: Future<Output = AgentResult<()>> + Send + 'static,
{
    set.spawn(async move {
        let exit = match tokio::spawn(worker).await {
            Ok(Ok(())) => WorkerExit::Clean,
            Ok(Err(e)) => WorkerExit::Failed(e),
            Err(e) => WorkerExit::Panicked(e.to_string()),
        };
        (name, exit)
    });
}

fn log_exit(name: &str, exit: &WorkerExit) {
    match exit {
        WorkerExit::Clean => info!(worker = name, "worker stopped"),
        WorkerExit::Failed(e) => error!(worker = name, error = %e, "worker failed"),
        WorkerExit::Panicked(p) => error!(worker = name, panic = %p, "worker panicked"),
    }
}
