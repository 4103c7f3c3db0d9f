//! End-to-end runs of the agent against in-process collaborators.

use bytes::Bytes;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio_util::sync::CancellationToken;
use walvault_agent::{
    Agent, AgentConfig, AgentError, BackupState, BaseChunk, MemoryControlPlane,
    MockReplicationController, MockReplicationSource, SystemIdentity, WalData,
    SWITCH_SEGMENT_COMMAND,
};
use walvault_storage::{EncryptingStore, EncryptionKey, InMemoryStore, ObjectStore};
use walvault_testkit::{RecordSpec, WalPageWriter};
use walvault_wal::{Lsn, SEGMENT_SIZE};

const GUID: &str = "6350021914257315137";

fn identity() -> SystemIdentity {
    SystemIdentity {
        system_id: GUID.to_string(),
        timeline: 1,
        xlog_pos: Lsn(0x500_0000),
    }
}

fn config() -> AgentConfig {
    let json = serde_json::json!({
        "encrypt-key": EncryptionKey::generate().to_base64(),
        "conn-string": "host=localhost",
        "guid": GUID,
        "store": "memory",
        "email": "ops@example.com",
    });
    AgentConfig::from_json(&json.to_string())
        .unwrap()
        .with_restart_cooldown(Duration::from_millis(10))
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs()
}

fn start(agent: &Arc<Agent>) -> (CancellationToken, tokio::task::JoinHandle<()>) {
    let shutdown = CancellationToken::new();
    let handle = tokio::spawn({
        let agent = Arc::clone(agent);
        let shutdown = shutdown.clone();
        async move { agent.run(shutdown).await }
    });
    (shutdown, handle)
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(10), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

async fn send_wal(ctl_stream: &walvault_agent::MockWalStream, start: Lsn, bytes: &[u8]) {
    for (i, chunk) in bytes.chunks(1 << 20).enumerate() {
        ctl_stream
            .sender
            .send(WalData {
                lsn: start + ((i as u64) << 20),
                data: Some(Bytes::copy_from_slice(chunk)),
            })
            .await
            .unwrap();
    }
}

async fn next_wal(ctl: &mut MockReplicationController) -> walvault_agent::MockWalStream {
    tokio::time::timeout(Duration::from_secs(10), ctl.next_wal_stream())
        .await
        .unwrap()
        .unwrap()
}

async fn next_base(ctl: &mut MockReplicationController) -> walvault_agent::MockBaseBackup {
    tokio::time::timeout(Duration::from_secs(10), ctl.next_base_backup())
        .await
        .unwrap()
        .unwrap()
}

#[tokio::test]
async fn fresh_store_gets_base_and_segment() {
    let (source, mut ctl) = MockReplicationSource::new(identity());
    ctl.set_next_base_lsn(Lsn(0x100_0028));
    let key = EncryptionKey::generate();
    let inner = Arc::new(InMemoryStore::new());
    let store = Arc::new(EncryptingStore::new(Arc::clone(&inner), &key));
    let control = Arc::new(MemoryControlPlane::new());
    let config = config().with_txlog_flush(Duration::from_millis(20), Duration::from_millis(20));
    let agent = Arc::new(Agent::new(
        config,
        Arc::new(source),
        store.clone(),
        control.clone(),
    ));
    let (shutdown, handle) = start(&agent);

    let base = next_base(&mut ctl).await;
    assert_eq!(base.label, "walvault");
    let wal = next_wal(&mut ctl).await;
    assert_eq!(wal.start, Lsn(0x100_0000));
    assert_eq!(wal.timeline, 1);

    base.sender
        .send(BaseChunk::Data(Bytes::from_static(b"tar archive")))
        .await
        .unwrap();
    base.sender.send(BaseChunk::End).await.unwrap();

    let pages = WalPageWriter::new(Lsn(0x100_0000), 1)
        .record(RecordSpec::commit(5, 10_000_000))
        .min_pages(SEGMENT_SIZE as usize / 8192)
        .finish();
    send_wal(&wal, wal.start, &pages.bytes).await;

    wait_until(|| inner.len() == 2).await;
    wait_until(|| control.pushes().iter().any(|p| p.contains(" 5 "))).await;
    shutdown.cancel();
    handle.await.unwrap();

    let names = inner.names();
    assert!(names.contains(&"000001000000.1.wal".to_string()));
    let base_name = names
        .iter()
        .find(|n| n.ends_with(".base"))
        .expect("base object");
    assert!(base_name.starts_with("000001000028.1."));

    assert_eq!(
        store.download("000001000000.1.wal").await.unwrap(),
        Bytes::from(pages.bytes)
    );
    assert_eq!(&store.download(base_name).await.unwrap()[..], b"tar archive");

    assert_eq!(control.registrations().len(), 1);
    assert_eq!(control.registrations()[0].email, "ops@example.com");
    let stats = agent.stats();
    assert_eq!(stats.wal_segments, 1);
    assert_eq!(stats.bases_completed, 1);
    assert_eq!(agent.state(), BackupState::Terminated);
}

#[tokio::test]
async fn resumes_from_stored_position() {
    let store = Arc::new(InMemoryStore::new());
    store.put_raw("000003000000.1.wal", Bytes::new());
    store.put_raw("000004000000.2.wal", Bytes::new());
    store.put_raw(format!("000002000028.1.{:x}.base", unix_now()), Bytes::new());

    let (source, mut ctl) = MockReplicationSource::new(identity());
    let agent = Arc::new(Agent::new(
        config(),
        Arc::new(source),
        store,
        Arc::new(MemoryControlPlane::new()),
    ));
    let (shutdown, handle) = start(&agent);

    let wal = next_wal(&mut ctl).await;
    assert_eq!(wal.start, Lsn(0x400_0000));
    assert_eq!(agent.stats().bases_started, 0);

    shutdown.cancel();
    handle.await.unwrap();
}

#[tokio::test]
async fn missing_wal_forces_new_base() {
    let store = Arc::new(InMemoryStore::new());
    store.put_raw("000003000000.1.wal", Bytes::new());
    store.put_raw(format!("000002000028.1.{:x}.base", unix_now()), Bytes::new());

    let (source, mut ctl) = MockReplicationSource::new(identity());
    ctl.set_next_base_lsn(Lsn(0x900_0100));
    let agent = Arc::new(Agent::new(
        config(),
        Arc::new(source),
        store,
        Arc::new(MemoryControlPlane::new()),
    ));
    let (shutdown, handle) = start(&agent);

    let wal = next_wal(&mut ctl).await;
    assert_eq!(wal.start, Lsn(0x400_0000));
    wal.sender
        .send(WalData {
            lsn: wal.start,
            data: None,
        })
        .await
        .unwrap();

    next_base(&mut ctl).await;
    let wal = next_wal(&mut ctl).await;
    assert_eq!(wal.start, Lsn(0x900_0000));
    assert_eq!(agent.stats().forced_restarts, 1);
    assert_eq!(agent.runs(), 1);

    shutdown.cancel();
    handle.await.unwrap();
}

#[tokio::test]
async fn empty_wal_payload_forces_new_base() {
    let store = Arc::new(InMemoryStore::new());
    store.put_raw("000003000000.1.wal", Bytes::new());
    store.put_raw(format!("000002000028.1.{:x}.base", unix_now()), Bytes::new());

    let (source, mut ctl) = MockReplicationSource::new(identity());
    ctl.set_next_base_lsn(Lsn(0x900_0100));
    let agent = Arc::new(Agent::new(
        config(),
        Arc::new(source),
        store,
        Arc::new(MemoryControlPlane::new()),
    ));
    let (shutdown, handle) = start(&agent);

    let wal = next_wal(&mut ctl).await;
    wal.sender
        .send(WalData {
            lsn: wal.start,
            data: Some(Bytes::new()),
        })
        .await
        .unwrap();

    next_base(&mut ctl).await;
    let wal = next_wal(&mut ctl).await;
    assert_eq!(wal.start, Lsn(0x900_0000));
    assert_eq!(agent.stats().forced_restarts, 1);
    assert_eq!(agent.runs(), 1);

    shutdown.cancel();
    handle.await.unwrap();
}

#[tokio::test]
async fn protocol_violation_restarts_the_group() {
    let (source, mut ctl) = MockReplicationSource::new(identity());
    ctl.set_next_base_lsn(Lsn(0x100_0000));
    let control = Arc::new(MemoryControlPlane::new());
    let agent = Arc::new(Agent::new(
        config(),
        Arc::new(source),
        Arc::new(InMemoryStore::new()),
        control.clone(),
    ));
    let (shutdown, handle) = start(&agent);

    let _base = next_base(&mut ctl).await;
    let wal = next_wal(&mut ctl).await;
    wal.sender
        .send(WalData {
            lsn: wal.start + 8192,
            data: Some(Bytes::from_static(b"out of order")),
        })
        .await
        .unwrap();

    // the second run registers again and starts over
    let _base = next_base(&mut ctl).await;
    let _wal = next_wal(&mut ctl).await;
    assert_eq!(agent.runs(), 2);
    assert_eq!(control.registrations().len(), 2);

    shutdown.cancel();
    handle.await.unwrap();
}

#[tokio::test]
async fn system_mismatch_fails_the_run() {
    let mut other = identity();
    other.system_id = "42".into();
    let (source, _ctl) = MockReplicationSource::new(other);
    let agent = Agent::new(
        config(),
        Arc::new(source),
        Arc::new(InMemoryStore::new()),
        Arc::new(MemoryControlPlane::new()),
    );

    let report = agent.run_once(&CancellationToken::new()).await;
    assert_eq!(report.exits.len(), 3);
    assert!(matches!(
        report.first_error(),
        Some(AgentError::SystemMismatch { reported, .. }) if reported == "42"
    ));
}

#[tokio::test]
async fn failed_registration_fails_the_run() {
    let (source, ctl) = MockReplicationSource::new(identity());
    let control = Arc::new(MemoryControlPlane::new());
    control.set_failing(true);
    let agent = Agent::new(
        config(),
        Arc::new(source),
        Arc::new(InMemoryStore::new()),
        control,
    );

    let report = agent.run_once(&CancellationToken::new()).await;
    assert!(matches!(
        report.first_error(),
        Some(AgentError::ControlPlane(_))
    ));
    assert_eq!(ctl.connection_count(), 0);
}

#[tokio::test]
async fn upload_failure_ends_the_run() {
    let (source, mut ctl) = MockReplicationSource::new(identity());
    ctl.set_next_base_lsn(Lsn(0x100_0000));
    let store = Arc::new(InMemoryStore::new());
    store.fail_next_uploads(1);
    let agent = Arc::new(Agent::new(
        config(),
        Arc::new(source),
        store.clone(),
        Arc::new(MemoryControlPlane::new()),
    ));

    let run = tokio::spawn({
        let agent = Arc::clone(&agent);
        async move { agent.run_once(&CancellationToken::new()).await }
    });
    let base = next_base(&mut ctl).await;
    base.sender.send(BaseChunk::End).await.unwrap();

    let report = tokio::time::timeout(Duration::from_secs(10), run)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(report.first_error(), Some(AgentError::Upload(_))));
    assert!(store.is_empty());
}

#[tokio::test]
async fn cancellation_unblocks_all_workers() {
    let (source, mut ctl) = MockReplicationSource::new(identity());
    ctl.set_next_base_lsn(Lsn(0x100_0000));
    let store = Arc::new(InMemoryStore::new());
    store.set_stalled(true);
    let agent = Arc::new(Agent::new(
        config().with_upload_queue_depth(1).with_txlog_queue_depth(1),
        Arc::new(source),
        store.clone(),
        Arc::new(MemoryControlPlane::new()),
    ));

    let shutdown = CancellationToken::new();
    let run = tokio::spawn({
        let agent = Arc::clone(&agent);
        let shutdown = shutdown.clone();
        async move { agent.run_once(&shutdown).await }
    });

    let _base = next_base(&mut ctl).await;
    let wal = next_wal(&mut ctl).await;
    // three segments: one stalled in the store, one queued, one blocking
    // the orchestrator's hand-off
    send_wal(&wal, wal.start, &vec![0u8; 3 * SEGMENT_SIZE as usize]).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(agent.state(), BackupState::Streaming);
    assert_eq!(store.upload_count(), 0);

    shutdown.cancel();
    let report = tokio::time::timeout(Duration::from_secs(5), run)
        .await
        .expect("workers did not stop")
        .unwrap();
    assert_eq!(report.exits.len(), 3);
    assert!(report.is_clean());
}

#[tokio::test(start_paused = true)]
async fn rollover_requests_segment_switch_once_per_segment() {
    let store = Arc::new(InMemoryStore::new());
    store.put_raw("000003000000.1.wal", Bytes::new());
    store.put_raw(format!("000002000028.1.{:x}.base", unix_now()), Bytes::new());

    let (source, mut ctl) = MockReplicationSource::new(identity());
    let mut config = config();
    config.rollover = 1;
    let agent = Arc::new(Agent::new(
        config,
        Arc::new(source),
        store,
        Arc::new(MemoryControlPlane::new()),
    ));
    let (shutdown, handle) = start(&agent);

    let wal = next_wal(&mut ctl).await;
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(ctl.admin_commands(), vec![SWITCH_SEGMENT_COMMAND]);

    // the timer is not re-armed until the next segment completes
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(ctl.admin_commands().len(), 1);

    send_wal(&wal, wal.start, &vec![0u8; SEGMENT_SIZE as usize]).await;
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(ctl.admin_commands().len(), 2);
    assert_eq!(agent.stats().rollovers, 2);

    shutdown.cancel();
    handle.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn failed_rollover_switch_keeps_streaming() {
    let store = Arc::new(InMemoryStore::new());
    store.put_raw("000003000000.1.wal", Bytes::new());
    store.put_raw(format!("000002000028.1.{:x}.base", unix_now()), Bytes::new());

    let (source, mut ctl) = MockReplicationSource::new(identity());
    ctl.set_admin_failing(true);
    let mut config = config();
    config.rollover = 1;
    let agent = Arc::new(Agent::new(
        config,
        Arc::new(source),
        store.clone(),
        Arc::new(MemoryControlPlane::new()),
    ));
    let (shutdown, handle) = start(&agent);

    let wal = next_wal(&mut ctl).await;
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert!(ctl.admin_commands().is_empty());
    assert_eq!(agent.stats().rollovers, 0);
    assert_eq!(agent.state(), BackupState::Streaming);
    assert_eq!(agent.runs(), 1);

    // the same stream still carries WAL and the next segment re-arms the timer
    ctl.set_admin_failing(false);
    send_wal(&wal, wal.start, &vec![0u8; SEGMENT_SIZE as usize]).await;
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert!(store.names().contains(&"000004000000.1.wal".to_string()));
    assert_eq!(ctl.admin_commands(), vec![SWITCH_SEGMENT_COMMAND]);
    assert_eq!(agent.stats().rollovers, 1);
    assert_eq!(agent.runs(), 1);

    shutdown.cancel();
    handle.await.unwrap();
}

#[tokio::test]
async fn stale_base_triggers_new_backup() {
    let store = Arc::new(InMemoryStore::new());
    store.put_raw("000003000000.1.wal", Bytes::new());
    let five_hours_ago = unix_now() - 5 * 60 * 60;
    store.put_raw(
        format!("000002000028.1.{five_hours_ago:x}.base"),
        Bytes::new(),
    );

    let (source, mut ctl) = MockReplicationSource::new(identity());
    ctl.set_next_base_lsn(Lsn(0x400_0100));
    let agent = Arc::new(Agent::new(
        config(),
        Arc::new(source),
        store,
        Arc::new(MemoryControlPlane::new()),
    ));
    let (shutdown, handle) = start(&agent);

    let wal = next_wal(&mut ctl).await;
    assert_eq!(wal.start, Lsn(0x400_0000));
    let base = next_base(&mut ctl).await;
    assert_eq!(base.start_lsn, Lsn(0x400_0100));
    wait_until(|| agent.stats().bases_started == 1).await;

    shutdown.cancel();
    handle.await.unwrap();
}

#[tokio::test]
async fn unreachable_source_is_retried_after_cooldown() {
    let (source, mut ctl) = MockReplicationSource::new(identity());
    ctl.set_connected(false);
    ctl.set_next_base_lsn(Lsn(0x100_0000));
    let agent = Arc::new(Agent::new(
        config(),
        Arc::new(source),
        Arc::new(InMemoryStore::new()),
        Arc::new(MemoryControlPlane::new()),
    ));
    let (shutdown, handle) = start(&agent);

    wait_until(|| agent.runs() >= 2).await;
    ctl.set_connected(true);
    let _wal = next_wal(&mut ctl).await;

    shutdown.cancel();
    handle.await.unwrap();
}
