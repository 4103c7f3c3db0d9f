//! Property-based test generators using proptest.
//!
//! These strategies generate record mixes, object payloads and store names
//! for property testing.

use crate::fixtures::RecordSpec;
use proptest::prelude::*;
use walvault_wal::{RelFileNode, RM_HEAP2_ID, RM_HEAP_ID, RM_XLOG_ID};

/// Strategy for a non-zero transaction id.
pub fn txid_strategy() -> impl Strategy<Value = u32> {
    1u32..100_000
}

/// Strategy for a relation in the default tablespace.
pub fn rel_strategy() -> impl Strategy<Value = RelFileNode> {
    (1u32..100_000, 16_384u32..1_000_000).prop_map(|(db, rel)| RelFileNode {
        spc: 1663,
        db,
        rel,
    })
}

/// Strategy for a commit record with a timestamp within the first year
/// after the producer's epoch.
pub fn commit_strategy() -> impl Strategy<Value = RecordSpec> {
    (txid_strategy(), 0i64..31_536_000_000_000)
        .prop_map(|(txid, micros)| RecordSpec::commit(txid, micros))
}

/// Strategy for a single record of any supported kind.
///
/// Filler records reach up to 20 000 bytes so that sequences routinely
/// span page boundaries.
pub fn record_strategy() -> impl Strategy<Value = RecordSpec> {
    prop_oneof![
        commit_strategy(),
        (txid_strategy(), rel_strategy(), 0u16..512)
            .prop_map(|(txid, rel, len)| RecordSpec::heap_insert(txid, rel, len)),
        (
            prop::sample::select(vec![RM_XLOG_ID, RM_HEAP_ID, RM_HEAP2_ID]),
            txid_strategy(),
            29u32..20_000
        )
            .prop_map(|(rmgr, txid, len)| RecordSpec::filler(rmgr, 0x30, txid, len)),
    ]
}

/// Strategy for a sequence of records.
pub fn record_sequence_strategy(max_len: usize) -> impl Strategy<Value = Vec<RecordSpec>> {
    prop::collection::vec(record_strategy(), 1..max_len)
}

/// Strategy for object payloads, empty included.
pub fn payload_strategy() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 0..16_384)
}

/// Strategy for compressible payloads (long runs of few distinct bytes).
pub fn compressible_payload_strategy() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec((any::<u8>(), 1usize..4096), 0..32).prop_map(|runs| {
        runs.into_iter()
            .flat_map(|(byte, count)| std::iter::repeat(byte).take(count))
            .collect()
    })
}

/// Strategy for a store object name in the archive's naming scheme.
pub fn object_name_strategy() -> impl Strategy<Value = String> {
    (
        any::<u32>(),
        1u64..0xFFFF_FFFF,
        prop::sample::select(vec!["wal", "base", "base.part0", "base.part1"]),
    )
        .prop_map(|(lsn, time, suffix)| format!("{lsn:x}.{time:x}.{suffix}"))
}
