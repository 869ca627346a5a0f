//! Property-based tests for memory-mode eviction.
//!
//! Records are written with strictly increasing clocks, so whatever survives
//! eviction must be a suffix of the write order, with per-kind ids intact.

use std::sync::Arc;

use chrono::Utc;
use pb_common::{AutoregRecord, BufferMode, DiscoveryRecord, HistoryRecord, RecordKind};
use pb_config::BufferConfig;
use pb_core::{BufferRecord, InMemoryDatabase, ProxyBuffer};
use proptest::prelude::*;

#[derive(Debug, Clone)]
struct Write {
    kind: RecordKind,
    len: usize,
}

fn write_strategy() -> impl Strategy<Value = Write> {
    (
        prop_oneof![
            Just(RecordKind::History),
            Just(RecordKind::Discovery),
            Just(RecordKind::AutoRegistration),
        ],
        0usize..300,
    )
        .prop_map(|(kind, len)| Write { kind, len })
}

fn write_one(buffer: &ProxyBuffer, write: &Write, clock: i64) {
    let text = "p".repeat(write.len);
    match write.kind {
        RecordKind::History => {
            let mut handle = buffer.open::<HistoryRecord>();
            handle.write(HistoryRecord::new(1, clock, text));
            handle.close();
        }
        RecordKind::Discovery => {
            let mut handle = buffer.open::<DiscoveryRecord>();
            handle.write(DiscoveryRecord::new(1, clock, text));
            handle.close();
        }
        RecordKind::AutoRegistration => {
            let mut handle = buffer.open::<AutoregRecord>();
            handle.write(AutoregRecord::new(text, clock));
            handle.close();
        }
    }
}

/// Resident clocks of one kind, read without acknowledging.
fn resident<R: BufferRecord>(buffer: &ProxyBuffer) -> Vec<(u64, i64)> {
    buffer
        .get_rows::<R>(usize::MAX, usize::MAX - 1)
        .rows
        .iter()
        .map(|r| (r.id(), r.clock()))
        .collect()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn survivors_are_a_suffix_of_write_order(
        writes in proptest::collection::vec(write_strategy(), 1..120)
    ) {
        let config = BufferConfig {
            mode: BufferMode::Memory,
            memory_size: 8 * 1024,
            ..Default::default()
        };
        let buffer = ProxyBuffer::create(config, Arc::new(InMemoryDatabase::new())).unwrap();

        let base = Utc::now().timestamp() - 1000;
        for (i, write) in writes.iter().enumerate() {
            write_one(&buffer, write, base + i as i64);
        }

        let mut survivors: Vec<(RecordKind, u64, i64)> = Vec::new();
        survivors.extend(resident::<HistoryRecord>(&buffer).into_iter().map(|(id, c)| (RecordKind::History, id, c)));
        survivors.extend(resident::<DiscoveryRecord>(&buffer).into_iter().map(|(id, c)| (RecordKind::Discovery, id, c)));
        survivors.extend(resident::<AutoregRecord>(&buffer).into_iter().map(|(id, c)| (RecordKind::AutoRegistration, id, c)));
        survivors.sort_by_key(|(_, _, clock)| *clock);

        prop_assert_eq!(survivors.len() as u64, buffer.mem_stats().records);
        prop_assert!(!survivors.is_empty());

        // Clocks are write positions; survivors must be the last N writes.
        let first = (survivors[0].2 - base) as usize;
        prop_assert_eq!(survivors.len(), writes.len() - first);
        for (offset, (kind, _, clock)) in survivors.iter().enumerate() {
            prop_assert_eq!((*clock - base) as usize, first + offset);
            prop_assert_eq!(*kind, writes[first + offset].kind);
        }

        // Per-kind ids count every write of that kind, evicted or not.
        for kind in RecordKind::ALL {
            let written = writes.iter().filter(|w| w.kind == kind).count() as u64;
            prop_assert_eq!(buffer.watermarks(kind).mem, written);
        }
    }
}
