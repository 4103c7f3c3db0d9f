//! Transaction-log aggregation.
//!
//! Every WAL chunk the orchestrator receives is also forwarded here. The
//! aggregator decodes it into records, sums record lengths per
//! transaction, and writes one line per commit:
//!
//! ```text
//! {lsn delta:x} {txid delta:x} {commit time delta in ms:x} {bytes:x}
//! ```
//!
//! Deltas are relative to the previous line of the same batch, so the first
//! line of a batch carries absolute values. This path is telemetry only:
//! undecodable pages are logged and skipped.

use crate::control::ControlPlane;
use crate::error::AgentResult;
use bytes::{Bytes, BytesMut};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use walvault_wal::{Page, Record, RecordContinuation, RecordType, PAGE_SIZE};

/// Aggregation state for one batch of commit lines.
#[derive(Debug)]
pub struct TxLogAggregator {
    staleness: Duration,
    buf: BytesMut,
    cont: RecordContinuation,
    lens: HashMap<u32, u64>,
    out: String,
    last_lsn: u64,
    last_txid: u32,
    last_ts: i64,
    first_ts: Option<i64>,
}

impl TxLogAggregator {
    /// Creates an aggregator that asks for a flush once the commits it
    /// holds span more than `staleness`.
    pub fn new(staleness: Duration) -> Self {
        Self {
            staleness,
            buf: BytesMut::new(),
            cont: RecordContinuation::new(),
            lens: HashMap::new(),
            out: String::new(),
            last_lsn: 0,
            last_txid: 0,
            last_ts: 0,
            first_ts: None,
        }
    }

    /// Consumes a raw WAL chunk.
    ///
    /// Returns the batches that became stale while decoding; each is
    /// already taken out of the aggregator and must be pushed by the caller.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(chunk);
        let mut batches = Vec::new();
        while self.buf.len() >= PAGE_SIZE {
            let raw = self.buf.split_to(PAGE_SIZE);
            let records = match Page::parse(&raw) {
                Ok(page) => self.cont.feed(&page),
                Err(e) => {
                    warn!(error = %e, "txlog: dropping undecodable WAL");
                    self.buf.clear();
                    self.cont.reset();
                    break;
                }
            };
            for record in &records {
                self.observe(record);
            }
            if self.is_stale() {
                batches.push(self.take_text());
            }
        }
        batches
    }

    /// Accounts one decoded record.
    pub fn observe(&mut self, record: &Record) {
        if record.txid == 0 {
            return;
        }
        let total = self.lens.entry(record.txid).or_insert(0);
        *total += u64::from(record.len);
        if record.record_type() != RecordType::Commit {
            return;
        }

        let len = self.lens.remove(&record.txid).unwrap_or_default();
        let ts = record.commit_time().map_or(self.last_ts, unix_millis);
        let lsn = record.lsn.as_u64();
        self.out.push_str(&format!(
            "{:x} {:x} {} {:x}\n",
            lsn.wrapping_sub(self.last_lsn),
            record.txid.wrapping_sub(self.last_txid),
            signed_hex(ts - self.last_ts),
            len
        ));
        self.last_lsn = lsn;
        self.last_txid = record.txid;
        self.last_ts = ts;
        self.first_ts.get_or_insert(ts);
    }

    /// Text accumulated since the last flush.
    pub fn pending_text(&self) -> &str {
        &self.out
    }

    /// Bytes accumulated for a transaction that has not committed yet.
    pub fn pending_len(&self, txid: u32) -> Option<u64> {
        self.lens.get(&txid).copied()
    }

    /// Takes the accumulated text and starts a new batch.
    ///
    /// Undecoded bytes and the partial record carried between pages are
    /// kept.
    pub fn take_text(&mut self) -> String {
        self.lens.clear();
        self.last_lsn = 0;
        self.last_txid = 0;
        self.last_ts = 0;
        self.first_ts = None;
        std::mem::take(&mut self.out)
    }

    fn is_stale(&self) -> bool {
        match self.first_ts {
            Some(first) => {
                let span = self.last_ts.saturating_sub(first);
                span > 0 && span as u128 > self.staleness.as_millis()
            }
            None => false,
        }
    }
}

fn unix_millis(time: SystemTime) -> i64 {
    match time.duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_millis() as i64,
        Err(e) => -(e.duration().as_millis() as i64),
    }
}

fn signed_hex(value: i64) -> String {
    if value < 0 {
        format!("-{:x}", value.unsigned_abs())
    } else {
        format!("{value:x}")
    }
}

/// Worker that feeds forwarded WAL into a [`TxLogAggregator`] and pushes
/// batches to the control plane.
pub struct TxLogWorker {
    aggregator: TxLogAggregator,
    control: Arc<dyn ControlPlane>,
    chunks: mpsc::Receiver<Bytes>,
    cancel: CancellationToken,
    first_flush: Duration,
    flush_interval: Duration,
}

impl TxLogWorker {
    /// Creates the worker.
    pub fn new(
        aggregator: TxLogAggregator,
        control: Arc<dyn ControlPlane>,
        chunks: mpsc::Receiver<Bytes>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            aggregator,
            control,
            chunks,
            cancel,
            first_flush: Duration::from_secs(10),
            flush_interval: Duration::from_secs(60),
        }
    }

    /// Sets the delay of the first periodic flush and the period after it.
    pub fn with_flush_timing(mut self, first: Duration, interval: Duration) -> Self {
        self.first_flush = first;
        self.flush_interval = interval;
        self
    }

    /// Runs until cancelled or the chunk queue closes.
    ///
    /// Push failures are logged and never end the worker.
    pub async fn run(mut self) -> AgentResult<()> {
        let timer = sleep(self.first_flush);
        tokio::pin!(timer);

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Ok(()),
                chunk = self.chunks.recv() => {
                    let Some(chunk) = chunk else {
                        debug!("txlog queue closed");
                        return Ok(());
                    };
                    for batch in self.aggregator.feed(&chunk) {
                        if !self.push(&batch).await {
                            return Ok(());
                        }
                        timer.as_mut().reset(Instant::now() + self.flush_interval);
                    }
                }
                _ = &mut timer => {
                    let batch = self.aggregator.take_text();
                    if !self.push(&batch).await {
                        return Ok(());
                    }
                    timer.as_mut().reset(Instant::now() + self.flush_interval);
                }
            }
        }
    }

    /// Pushes one batch; returns false if cancelled first.
    async fn push(&self, text: &str) -> bool {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            result = self.control.push_tx_log(text) => {
                match result {
                    Ok(()) => debug!(bytes = text.len(), "txlog pushed"),
                    Err(e) => warn!(error = %e, "txlog push failed"),
                }
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::MemoryControlPlane;
    use walvault_testkit::{RecordSpec, WalPageWriter};
    use walvault_wal::{Lsn, RelFileNode, POSTGRES_EPOCH_UNIX_SECS};

    const START: Lsn = Lsn(0x100_2000);

    fn epoch_millis(secs: u64) -> u64 {
        (POSTGRES_EPOCH_UNIX_SECS + secs) * 1000
    }

    #[test]
    fn single_commit_line() {
        let pages = WalPageWriter::new(START, 1)
            .record(RecordSpec::commit(5, 10_000_000))
            .finish();
        let mut agg = TxLogAggregator::new(Duration::from_secs(60));
        assert!(agg.feed(&pages.bytes).is_empty());

        let expected = format!("{:x} 5 {:x} 28\n", START.0 + 24, epoch_millis(10));
        assert_eq!(agg.pending_text(), expected);
        assert_eq!(agg.pending_len(5), None);
    }

    #[test]
    fn lengths_accumulate_until_commit() {
        let rel = RelFileNode {
            spc: 1663,
            db: 5,
            rel: 16384,
        };
        let insert = RecordSpec::heap_insert(7, rel, 64);
        let insert_len = insert.encoded_len() as u64;
        let pages = WalPageWriter::new(START, 1)
            .record(insert.clone())
            .record(RecordSpec::heap_insert(8, rel, 10))
            .record(insert)
            .record(RecordSpec::commit(7, 1_000_000))
            .finish();
        let mut agg = TxLogAggregator::new(Duration::from_secs(60));
        agg.feed(&pages.bytes);

        let line = agg.pending_text().lines().next().unwrap().to_string();
        let fields: Vec<&str> = line.split(' ').collect();
        assert_eq!(fields[1], "7");
        assert_eq!(fields[3], format!("{:x}", 2 * insert_len + 40));
        assert_eq!(agg.pending_len(7), None);
        assert!(agg.pending_len(8).is_some());
    }

    #[test]
    fn second_line_is_delta_encoded() {
        let pages = WalPageWriter::new(START, 1)
            .record(RecordSpec::commit(5, 10_000_000))
            .record(RecordSpec::commit(9, 9_000_000))
            .finish();
        let mut agg = TxLogAggregator::new(Duration::from_secs(60));
        agg.feed(&pages.bytes);

        let lines: Vec<&str> = agg.pending_text().lines().collect();
        assert_eq!(lines.len(), 2);
        let delta_lsn = pages.record_lsns[1].0 - pages.record_lsns[0].0;
        assert_eq!(lines[1], format!("{delta_lsn:x} 4 -3e8 28"));
    }

    #[test]
    fn stale_batch_is_flushed_mid_stream() {
        let pages = WalPageWriter::new(START, 1)
            .record(RecordSpec::commit(1, 0))
            .record(RecordSpec::commit(2, 61_000_000))
            .finish();
        let mut agg = TxLogAggregator::new(Duration::from_secs(60));
        let batches = agg.feed(&pages.bytes);

        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].lines().count(), 2);
        assert!(agg.pending_text().is_empty());
    }

    #[test]
    fn partial_pages_wait_for_more_bytes() {
        let pages = WalPageWriter::new(START, 1)
            .record(RecordSpec::commit(5, 0))
            .finish();
        let mut agg = TxLogAggregator::new(Duration::from_secs(60));
        agg.feed(&pages.bytes[..100]);
        assert!(agg.pending_text().is_empty());
        agg.feed(&pages.bytes[100..]);
        assert_eq!(agg.pending_text().lines().count(), 1);
    }

    #[test]
    fn malformed_page_is_skipped() {
        let mut agg = TxLogAggregator::new(Duration::from_secs(60));
        assert!(agg.feed(&vec![0u8; PAGE_SIZE]).is_empty());

        let pages = WalPageWriter::new(START, 1)
            .record(RecordSpec::commit(3, 0))
            .finish();
        agg.feed(&pages.bytes);
        assert_eq!(agg.pending_text().lines().count(), 1);
    }

    #[test]
    fn take_text_resets_deltas() {
        let pages = WalPageWriter::new(START, 1)
            .record(RecordSpec::commit(5, 0))
            .finish();
        let mut agg = TxLogAggregator::new(Duration::from_secs(60));
        agg.feed(&pages.bytes);
        let text = agg.take_text();
        assert!(text.starts_with(&format!("{:x} 5 ", START.0 + 24)));
        assert!(agg.pending_text().is_empty());
    }

    #[test]
    fn signed_hex_format() {
        assert_eq!(signed_hex(0), "0");
        assert_eq!(signed_hex(255), "ff");
        assert_eq!(signed_hex(-16), "-10");
    }

    #[tokio::test(start_paused = true)]
    async fn worker_flushes_on_timer() {
        let control = Arc::new(MemoryControlPlane::new());
        let (tx, rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();
        let worker = TxLogWorker::new(
            TxLogAggregator::new(Duration::from_secs(60)),
            control.clone(),
            rx,
            cancel.clone(),
        );
        let handle = tokio::spawn(worker.run());

        let pages = WalPageWriter::new(START, 1)
            .record(RecordSpec::commit(5, 0))
            .finish();
        tx.send(Bytes::from(pages.bytes)).await.unwrap();
        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(control.pushes().len(), 1);
        assert!(control.pushes()[0].contains(" 5 "));

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(control.pushes().len(), 2);
        assert!(control.pushes()[1].is_empty());

        cancel.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn worker_survives_push_failures() {
        let control = Arc::new(MemoryControlPlane::new());
        control.set_failing(true);
        let (tx, rx) = mpsc::channel(4);
        let worker = TxLogWorker::new(
            TxLogAggregator::new(Duration::from_secs(60)),
            control.clone(),
            rx,
            CancellationToken::new(),
        )
        .with_flush_timing(Duration::from_secs(1), Duration::from_secs(1));
        let handle = tokio::spawn(worker.run());

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(!handle.is_finished());
        drop(tx);
        handle.await.unwrap().unwrap();
    }
}
