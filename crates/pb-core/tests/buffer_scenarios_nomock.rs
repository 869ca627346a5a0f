//! End-to-end buffer scenarios against the in-process database.
//!
//! Covers:
//! - Initial state selection and the hybrid automaton
//! - Global eviction and oversized records in memory mode
//! - Gap waits for out-of-order database commits
//! - Age policies in hybrid and memory mode

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

use chrono::Utc;
use pb_common::{
    AutoregRecord, BufferMode, BufferState, DataStore, DiscoveryRecord, HistoryRecord, More,
    RecordKind,
};
use pb_config::BufferConfig;
use pb_core::db::{Database, DbError, Transaction, Unsent};
use pb_core::store::RecordStore;
use pb_core::{InMemoryDatabase, ProxyBuffer};

fn config(mode: BufferMode, memory_size: u64) -> BufferConfig {
    BufferConfig {
        mode,
        memory_size,
        db_retry_delay_ms: 1,
        gap_wait_ms: 5_000,
        gap_poll_ms: 10,
        ..Default::default()
    }
}

fn now() -> i64 {
    Utc::now().timestamp()
}

fn history(clock: i64, value: &str) -> HistoryRecord {
    HistoryRecord::new(1, clock, value)
}

fn write_all(buffer: &ProxyBuffer, records: Vec<HistoryRecord>) {
    let mut handle = buffer.open::<HistoryRecord>();
    for record in records {
        handle.write(record);
    }
    handle.close();
}

fn drain_history(buffer: &ProxyBuffer) -> Vec<HistoryRecord> {
    let mut out = Vec::new();
    loop {
        let batch = buffer.get_rows::<HistoryRecord>(usize::MAX, 100);
        if batch.rows.is_empty() {
            return out;
        }
        buffer.set_lastid(RecordKind::History, batch.lastid);
        out.extend(batch.rows);
    }
}

/// Seed `db` with `count` unacknowledged history rows.
fn seed_backlog(db: &Arc<InMemoryDatabase>, count: usize) {
    let buffer = ProxyBuffer::create(config(BufferMode::Disk, 0), db.clone()).unwrap();
    write_all(
        &buffer,
        (0..count).map(|i| history(now(), &i.to_string())).collect(),
    );
    buffer.destroy();
}

// ============================================================================
// Initial state and automaton
// ============================================================================

#[test]
fn hybrid_without_backlog_starts_in_memory() {
    let db = Arc::new(InMemoryDatabase::new());
    let buffer = ProxyBuffer::create(config(BufferMode::Hybrid, 1 << 20), db).unwrap();
    let health = buffer.state_info();
    assert_eq!(health.state, BufferState::Memory);
    assert_eq!(health.store, DataStore::Memory);
    assert_eq!(health.changes, 0);
}

#[test]
fn hybrid_with_backlog_uploads_database_first() {
    let db = Arc::new(InMemoryDatabase::new());
    seed_backlog(&db, 3);

    let buffer = ProxyBuffer::create(config(BufferMode::Hybrid, 1 << 20), db.clone()).unwrap();
    assert_eq!(buffer.state_info().state, BufferState::Database);

    // New writes keep going to the database behind the backlog.
    write_all(&buffer, vec![history(now(), "new")]);
    assert_eq!(db.ids(RecordKind::History), vec![1, 2, 3, 4]);

    let rows = drain_history(&buffer);
    assert_eq!(rows.iter().map(|r| r.id).collect::<Vec<_>>(), vec![1, 2, 3, 4]);
    assert_eq!(db.lastid(RecordKind::History), 4);
}

#[test]
fn upload_done_moves_database_to_memory() {
    let db = Arc::new(InMemoryDatabase::new());
    seed_backlog(&db, 2);
    let buffer = ProxyBuffer::create(config(BufferMode::Hybrid, 1 << 20), db).unwrap();

    // Rows left behind keep the buffer in the database.
    buffer.update_state(More::Available);
    assert_eq!(buffer.state_info().state, BufferState::Database);

    drain_history(&buffer);
    buffer.update_state(More::Done);
    let health = buffer.state_info();
    assert_eq!(health.state, BufferState::DatabaseToMemory);
    assert_eq!(health.store, DataStore::Memory);

    // The first arena write finds the database drained and hands reads over.
    write_all(&buffer, vec![history(now(), "m1")]);
    assert_eq!(buffer.resident(RecordKind::History), 1);
    assert_eq!(buffer.state_info().state, BufferState::Memory);
    assert_eq!(buffer.state_info().changes, 2);

    let rows = drain_history(&buffer);
    assert_eq!(rows.iter().map(|r| r.value.as_str()).collect::<Vec<_>>(), vec!["m1"]);
    assert_eq!(rows[0].id, 3);
}

#[test]
fn full_arena_while_draining_flushes_to_database() {
    let db = Arc::new(InMemoryDatabase::new());
    seed_backlog(&db, 1);
    let buffer = ProxyBuffer::create(config(BufferMode::Hybrid, 2048), db.clone()).unwrap();
    drain_history(&buffer);
    buffer.update_state(More::Done);
    assert_eq!(buffer.state_info().state, BufferState::DatabaseToMemory);

    let big = "v".repeat(300);
    write_all(&buffer, (0..8).map(|_| history(now(), &big)).collect());

    let health = buffer.state_info();
    assert_eq!(health.state, BufferState::Database);
    assert_eq!(buffer.mem_stats().records, 0);
    assert_eq!(db.ids(RecordKind::History), (1..=9).collect::<Vec<_>>());

    let rows = drain_history(&buffer);
    assert_eq!(rows.iter().map(|r| r.id).collect::<Vec<_>>(), (2..=9).collect::<Vec<_>>());
}

#[test]
fn shutdown_disable_then_flush_keeps_every_record() {
    let db = Arc::new(InMemoryDatabase::new());
    let buffer = ProxyBuffer::create(config(BufferMode::Hybrid, 1 << 20), db.clone()).unwrap();
    write_all(&buffer, vec![history(now(), "in arena")]);

    buffer.disable();
    assert_eq!(buffer.state_info().store, DataStore::Database);
    write_all(&buffer, vec![history(now(), "after disable")]);
    assert_eq!(db.ids(RecordKind::History), vec![2]);

    buffer.flush();
    assert_eq!(buffer.state_info().state, BufferState::Database);
    assert_eq!(buffer.mem_stats().records, 0);

    let rows = drain_history(&buffer);
    assert_eq!(
        rows.iter().map(|r| r.value.as_str()).collect::<Vec<_>>(),
        vec!["in arena", "after disable"]
    );

    // Frozen: a drained database does not reopen the arena.
    buffer.update_state(More::Done);
    assert_eq!(buffer.state_info().state, BufferState::Database);
}

// ============================================================================
// Eviction
// ============================================================================

#[test]
fn full_memory_arena_evicts_globally_oldest() {
    let value = "x".repeat(200);
    let estimate = RecordStore::<HistoryRecord>::estimate_size(&history(0, &value));
    let db = Arc::new(InMemoryDatabase::new());
    let buffer = ProxyBuffer::create(
        config(BufferMode::Memory, 3 * estimate + estimate / 2),
        db,
    )
    .unwrap();

    let base = now() - 100;
    for i in 0..3 {
        write_all(&buffer, vec![history(base + i, &value)]);
    }
    assert_eq!(buffer.resident(RecordKind::History), 3);

    write_all(&buffer, vec![history(base + 3, &value)]);
    assert_eq!(buffer.resident(RecordKind::History), 3);

    let rows = drain_history(&buffer);
    assert_eq!(rows.iter().map(|r| r.id).collect::<Vec<_>>(), vec![2, 3, 4]);
}

#[test]
fn eviction_crosses_record_kinds() {
    let value = "x".repeat(200);
    let h_estimate = RecordStore::<HistoryRecord>::estimate_size(&history(0, &value));
    let mut discovery = DiscoveryRecord::new(1, now() - 90, "10.0.0.1");
    discovery.value = "d".repeat(400);
    let d_estimate = RecordStore::<DiscoveryRecord>::estimate_size(&discovery);
    assert!(d_estimate > h_estimate);

    let db = Arc::new(InMemoryDatabase::new());
    let buffer = ProxyBuffer::create(
        config(BufferMode::Memory, d_estimate + 2 * h_estimate + h_estimate / 2),
        db,
    )
    .unwrap();

    let mut handle = buffer.open::<DiscoveryRecord>();
    handle.write(discovery);
    handle.close();
    write_all(&buffer, vec![history(now() - 50, &value), history(now() - 40, &value)]);
    assert_eq!(buffer.mem_stats().records, 3);

    // The discovery record is oldest and goes first.
    write_all(&buffer, vec![history(now() - 30, &value)]);
    assert_eq!(buffer.resident(RecordKind::Discovery), 0);
    assert_eq!(buffer.resident(RecordKind::History), 3);
}

#[test]
fn oversized_record_is_dropped_without_eviction() {
    let db = Arc::new(InMemoryDatabase::new());
    let buffer = ProxyBuffer::create(config(BufferMode::Memory, 4096), db).unwrap();
    write_all(&buffer, vec![history(now(), "a"), history(now(), "b")]);

    write_all(&buffer, vec![history(now(), &"z".repeat(8192))]);
    assert_eq!(buffer.resident(RecordKind::History), 2);

    // The sequence continues after the dropped record.
    write_all(&buffer, vec![history(now(), "c")]);
    let rows = drain_history(&buffer);
    assert_eq!(rows.iter().map(|r| r.id).collect::<Vec<_>>(), vec![1, 2, 3]);
}

// ============================================================================
// Gap handling
// ============================================================================

/// Holds the commit of the history batch starting at `gate_id` until
/// released.
struct GatedDatabase {
    inner: InMemoryDatabase,
    gate_id: u64,
    released: Mutex<bool>,
    release: Condvar,
    blocked: AtomicBool,
}

impl GatedDatabase {
    fn new(gate_id: u64) -> Self {
        GatedDatabase {
            inner: InMemoryDatabase::new(),
            gate_id,
            released: Mutex::new(false),
            release: Condvar::new(),
            blocked: AtomicBool::new(false),
        }
    }

    fn open_gate(&self) {
        *self.released.lock().unwrap() = true;
        self.release.notify_all();
    }

    fn wait_blocked(&self) {
        while !self.blocked.load(Ordering::SeqCst) {
            thread::sleep(Duration::from_millis(1));
        }
    }
}

struct GatedTransaction<'a> {
    db: &'a GatedDatabase,
    inner: Box<dyn Transaction + 'a>,
    gated: bool,
}

impl Transaction for GatedTransaction<'_> {
    fn insert_history(&mut self, rows: &[HistoryRecord]) -> Result<(), DbError> {
        if rows.first().is_some_and(|r| r.id == self.db.gate_id) {
            self.gated = true;
        }
        self.inner.insert_history(rows)
    }

    fn insert_discovery(&mut self, rows: &[DiscoveryRecord]) -> Result<(), DbError> {
        self.inner.insert_discovery(rows)
    }

    fn insert_autoreg(&mut self, rows: &[AutoregRecord]) -> Result<(), DbError> {
        self.inner.insert_autoreg(rows)
    }

    fn commit(self: Box<Self>) -> Result<(), DbError> {
        let GatedTransaction { db, inner, gated } = *self;
        if gated {
            db.blocked.store(true, Ordering::SeqCst);
            let mut released = db.released.lock().unwrap();
            while !*released {
                released = db.release.wait(released).unwrap();
            }
        }
        inner.commit()
    }
}

impl Database for GatedDatabase {
    fn begin(&self) -> Result<Box<dyn Transaction + '_>, DbError> {
        Ok(Box::new(GatedTransaction {
            db: self,
            inner: self.inner.begin()?,
            gated: false,
        }))
    }

    fn select_unsent(&self, kind: RecordKind) -> Result<Unsent, DbError> {
        self.inner.select_unsent(kind)
    }

    fn fetch_history(&self, after: u64, limit: usize) -> Result<Vec<HistoryRecord>, DbError> {
        self.inner.fetch_history(after, limit)
    }

    fn fetch_discovery(&self, after: u64, limit: usize) -> Result<Vec<DiscoveryRecord>, DbError> {
        self.inner.fetch_discovery(after, limit)
    }

    fn fetch_autoreg(&self, after: u64, limit: usize) -> Result<Vec<AutoregRecord>, DbError> {
        self.inner.fetch_autoreg(after, limit)
    }

    fn set_lastid(&self, kind: RecordKind, id: u64) -> Result<(), DbError> {
        self.inner.set_lastid(kind, id)
    }
}

/// Nine acknowledged rows, then handle A (ids 10-14) commits after handle B
/// (ids 15-19).
fn out_of_order_commits(gap_wait_ms: u64) -> Vec<u64> {
    let db = Arc::new(GatedDatabase::new(10));
    let mut cfg = config(BufferMode::Disk, 0);
    cfg.gap_wait_ms = gap_wait_ms;
    let buffer = ProxyBuffer::create(cfg, db.clone()).unwrap();

    write_all(&buffer, (0..9).map(|i| history(now(), &i.to_string())).collect());
    assert_eq!(drain_history(&buffer).len(), 9);

    thread::scope(|scope| {
        let mut a = buffer.open::<HistoryRecord>();
        let mut b = buffer.open::<HistoryRecord>();
        for i in 0..5 {
            a.write(history(now(), &format!("a{}", i)));
            b.write(history(now(), &format!("b{}", i)));
        }

        let a_closer = scope.spawn(move || a.close());
        db.wait_blocked();
        b.close();

        let reader = scope.spawn(|| buffer.get_rows::<HistoryRecord>(usize::MAX, 100));
        thread::sleep(Duration::from_millis(100));
        db.open_gate();

        a_closer.join().unwrap();
        let batch = reader.join().unwrap();
        batch.rows.iter().map(|r| r.id).collect()
    })
}

#[test]
fn reader_waits_for_out_of_order_commit() {
    let ids = out_of_order_commits(5_000);
    assert_eq!(ids, (10..=19).collect::<Vec<_>>());
}

#[test]
fn reader_accepts_gap_after_wait_bound() {
    let ids = out_of_order_commits(20);
    assert_eq!(ids, (15..=19).collect::<Vec<_>>());
}

#[test]
fn permanent_gap_is_skipped_immediately() {
    let db = Arc::new(InMemoryDatabase::new());
    let buffer = ProxyBuffer::create(config(BufferMode::Disk, 0), db.clone()).unwrap();
    write_all(&buffer, vec![history(now(), "1")]);
    db.reject_next_commits(1);
    write_all(&buffer, vec![history(now(), "lost")]);
    write_all(&buffer, vec![history(now(), "3")]);

    let started = std::time::Instant::now();
    let rows = drain_history(&buffer);
    assert_eq!(rows.iter().map(|r| r.id).collect::<Vec<_>>(), vec![1, 3]);
    assert!(started.elapsed() < Duration::from_secs(5));
}

// ============================================================================
// Age policies
// ============================================================================

#[test]
fn stale_hybrid_arena_is_flushed_to_database() {
    let db = Arc::new(InMemoryDatabase::new());
    let mut cfg = config(BufferMode::Hybrid, 1 << 20);
    cfg.memory_age = 600;
    let buffer = ProxyBuffer::create(cfg, db.clone()).unwrap();

    write_all(&buffer, vec![history(now() - 700, "old"), history(now(), "new")]);
    assert_eq!(buffer.resident(RecordKind::History), 2);

    let batch = buffer.get_rows::<HistoryRecord>(usize::MAX, 10);
    assert_eq!(buffer.state_info().state, BufferState::Database);
    assert_eq!(db.ids(RecordKind::History), vec![1, 2]);
    assert_eq!(batch.rows.iter().map(|r| r.id).collect::<Vec<_>>(), vec![1, 2]);
}

#[test]
fn memory_mode_discards_past_offline_buffer() {
    let db = Arc::new(InMemoryDatabase::new());
    let buffer = ProxyBuffer::create(config(BufferMode::Memory, 1 << 20), db).unwrap();

    write_all(
        &buffer,
        vec![history(now() - 2 * 3600, "stale"), history(now(), "fresh")],
    );
    let rows = drain_history(&buffer);
    assert_eq!(rows.iter().map(|r| r.value.as_str()).collect::<Vec<_>>(), vec!["fresh"]);
}

// ============================================================================
// Equivalence and introspection
// ============================================================================

#[test]
fn memory_and_disk_modes_upload_the_same_rows() {
    let records: Vec<HistoryRecord> = (0..25)
        .map(|i| HistoryRecord::new(i, now(), format!("value-{}", i)))
        .collect();

    let mut uploads = Vec::new();
    for mode in [BufferMode::Disk, BufferMode::Memory, BufferMode::Hybrid] {
        let db = Arc::new(InMemoryDatabase::new());
        let buffer = ProxyBuffer::create(config(mode, 1 << 20), db).unwrap();
        for chunk in records.chunks(7) {
            write_all(&buffer, chunk.to_vec());
        }

        let mut rows = Vec::new();
        loop {
            let batch = buffer.get_rows::<HistoryRecord>(600, 10);
            if batch.rows.is_empty() {
                break;
            }
            buffer.set_lastid(RecordKind::History, batch.lastid);
            rows.extend(batch.rows);
        }
        uploads.push(rows);
    }

    assert_eq!(uploads[0].len(), 25);
    assert_eq!(uploads[0], uploads[1]);
    assert_eq!(uploads[0], uploads[2]);
}

#[test]
fn watermarks_track_each_kind() {
    let db = Arc::new(InMemoryDatabase::new());
    let buffer = ProxyBuffer::create(config(BufferMode::Memory, 1 << 20), db).unwrap();
    write_all(&buffer, vec![history(now(), "a"), history(now(), "b")]);
    let mut handle = buffer.open::<AutoregRecord>();
    handle.write(AutoregRecord::new("h1", now()));
    handle.close();

    buffer.set_lastid(RecordKind::History, 1);
    let marks = buffer.watermarks(RecordKind::History);
    assert_eq!((marks.sent, marks.mem), (1, 2));
    assert_eq!(buffer.watermarks(RecordKind::AutoRegistration).mem, 1);
    assert_eq!(buffer.watermarks(RecordKind::Discovery).mem, 0);

    let usage = buffer.mem_stats();
    assert_eq!(usage.records, 2);
    assert_eq!(usage.used + usage.free, usage.total);
}

#[test]
fn concurrent_writers_produce_unique_contiguous_ids() {
    let db = Arc::new(InMemoryDatabase::new());
    let buffer = ProxyBuffer::create(config(BufferMode::Hybrid, 16 * 1024), db).unwrap();

    thread::scope(|scope| {
        for w in 0..4 {
            let buffer = &buffer;
            scope.spawn(move || {
                for batch in 0..10 {
                    let mut handle = buffer.open::<HistoryRecord>();
                    for i in 0..10 {
                        handle.write(history(now(), &format!("{}-{}-{}", w, batch, i)));
                    }
                    handle.close();
                }
            });
        }
    });

    let mut ids = Vec::new();
    loop {
        let batch = buffer.get_rows::<HistoryRecord>(usize::MAX, 50);
        if batch.rows.is_empty() {
            buffer.update_state(More::Done);
            if buffer.get_rows::<HistoryRecord>(usize::MAX, 50).rows.is_empty() {
                break;
            }
            continue;
        }
        buffer.set_lastid(RecordKind::History, batch.lastid);
        ids.extend(batch.rows.iter().map(|r| r.id));
    }
    assert_eq!(ids, (1..=400).collect::<Vec<_>>());
}
