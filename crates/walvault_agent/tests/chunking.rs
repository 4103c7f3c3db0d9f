//! Property tests for cutting streams into upload units.

use proptest::prelude::*;
use walvault_agent::{BaseChunker, BaseRef, WalChunker};
use walvault_testkit::payload_strategy;
use walvault_wal::{Lsn, SEGMENT_SIZE};

fn base() -> BaseRef {
    BaseRef {
        lsn: Lsn(0x300_0028),
        timeline: 1,
        time: 0x6000_0000,
    }
}

proptest! {
    #[test]
    fn base_parts_reassemble_to_the_archive(
        part_size in 1usize..4096,
        pieces in prop::collection::vec(payload_strategy(), 0..6),
    ) {
        let mut chunker = BaseChunker::new(base(), part_size);
        let mut units = Vec::new();
        for piece in &pieces {
            units.extend(chunker.push(piece));
        }
        let parts = units.len();
        prop_assert_eq!(chunker.parts_emitted(), parts as u64);
        units.push(chunker.finish());

        let (last, parts_only) = units.split_last().unwrap();
        for (n, unit) in parts_only.iter().enumerate() {
            prop_assert_eq!(&unit.name, &base().part_name(n as u64));
            prop_assert_eq!(unit.data.len(), part_size);
        }
        prop_assert_eq!(&last.name, &base().final_name());
        prop_assert!(last.data.len() < part_size);

        let joined: Vec<u8> = units.iter().flat_map(|u| u.data.iter().copied()).collect();
        prop_assert_eq!(joined, pieces.concat());
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn wal_segments_follow_the_cursor(
        segment in 0u64..0x1000,
        timeline in 1u32..8,
        sizes in prop::collection::vec(0usize..(6 << 20), 1..8),
    ) {
        let start = Lsn(segment * SEGMENT_SIZE);
        let zeros = vec![0u8; 6 << 20];
        let mut chunker = WalChunker::new(start, timeline);
        let mut units = Vec::new();
        for size in &sizes {
            let at = chunker.next_lsn();
            units.extend(chunker.push(at, &zeros[..*size]).unwrap());
        }

        let total: u64 = sizes.iter().map(|&s| s as u64).sum();
        prop_assert_eq!(units.len() as u64, total / SEGMENT_SIZE);
        prop_assert_eq!(chunker.buffered() as u64, total % SEGMENT_SIZE);
        prop_assert_eq!(chunker.next_lsn(), start + total);
        prop_assert_eq!(chunker.cursor(), start + (total / SEGMENT_SIZE) * SEGMENT_SIZE);
        for (n, unit) in units.iter().enumerate() {
            prop_assert_eq!(unit.name.lsn(), start + n as u64 * SEGMENT_SIZE);
            prop_assert_eq!(unit.name.timeline(), timeline);
            prop_assert_eq!(unit.data.len() as u64, SEGMENT_SIZE);
        }
    }
}
