//! The upload queue worker.

use crate::chunker::UploadUnit;
use crate::error::{AgentError, AgentResult};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use walvault_storage::ObjectStore;

/// Drains upload units into the store, one at a time, in submission order.
///
/// The first failed upload stops the worker; recovery is the supervisor's
/// job.
pub struct UploadQueue {
    store: Arc<dyn ObjectStore>,
    units: mpsc::Receiver<UploadUnit>,
    cancel: CancellationToken,
}

impl UploadQueue {
    /// Creates the worker.
    pub fn new(
        store: Arc<dyn ObjectStore>,
        units: mpsc::Receiver<UploadUnit>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            store,
            units,
            cancel,
        }
    }

    /// Runs until cancelled, the queue closes, or an upload fails.
    ///
    /// # Errors
    ///
    /// Returns [`AgentError::Upload`] with the store's error.
    pub async fn run(mut self) -> AgentResult<()> {
        loop {
            let unit = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Ok(()),
                unit = self.units.recv() => match unit {
                    Some(unit) => unit,
                    None => {
                        debug!("upload queue closed");
                        return Ok(());
                    }
                },
            };

            let name = unit.name.to_string();
            let size = unit.data.len();
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Ok(()),
                result = self.store.upload(&name, unit.data) => {
                    result.map_err(AgentError::Upload)?;
                }
            }
            info!(object = %name, size, "uploaded");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::ObjectName;
    use bytes::Bytes;
    use std::time::Duration;
    use walvault_storage::InMemoryStore;
    use walvault_wal::Lsn;

    fn unit(lsn: u64) -> UploadUnit {
        UploadUnit {
            name: ObjectName::Wal {
                lsn: Lsn(lsn),
                timeline: 1,
            },
            data: Bytes::from(vec![lsn as u8; 8]),
        }
    }

    #[tokio::test]
    async fn uploads_in_order_until_closed() {
        let store = Arc::new(InMemoryStore::new());
        let (tx, rx) = mpsc::channel(4);
        let worker = UploadQueue::new(store.clone(), rx, CancellationToken::new());
        let handle = tokio::spawn(worker.run());

        for lsn in [0u64, 0x100_0000, 0x200_0000] {
            tx.send(unit(lsn)).await.unwrap();
        }
        drop(tx);
        handle.await.unwrap().unwrap();

        assert_eq!(
            store.names(),
            ["000000000000.1.wal", "000001000000.1.wal", "000002000000.1.wal"]
        );
    }

    #[tokio::test]
    async fn failure_stops_worker() {
        let store = Arc::new(InMemoryStore::new());
        store.fail_next_uploads(1);
        let (tx, rx) = mpsc::channel(4);
        tx.send(unit(0)).await.unwrap();
        tx.send(unit(0x100_0000)).await.unwrap();

        let err = UploadQueue::new(store.clone(), rx, CancellationToken::new())
            .run()
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Upload(_)));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn cancel_interrupts_stalled_upload() {
        let store = Arc::new(InMemoryStore::new());
        store.set_stalled(true);
        let (tx, rx) = mpsc::channel(4);
        tx.send(unit(0)).await.unwrap();
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(UploadQueue::new(store, rx, cancel.clone()).run());

        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}
