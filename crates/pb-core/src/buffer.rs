//! The proxy buffer facade.
//!
//! Collectors open a [`WriteHandle`] per batch, write records, and close it.
//! The uploader calls [`ProxyBuffer::get_rows`] per kind and acknowledges
//! with [`ProxyBuffer::set_lastid`]. All state lives behind one mutex, which
//! is never held across database I/O.

use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use chrono::Utc;
use pb_arena::Arena;
use pb_common::{
    BufferMode, BufferState, DataStore, Error, More, RecordKind, Result, SCHEMA_VERSION,
};
use pb_config::BufferConfig;
use tracing::{debug, error, info, warn};

use crate::db::{Database, DbError};
use crate::handles::{wait_for_open_handles, HandleTracker};
use crate::logging::event_names;
use crate::mode::{ModeController, Transition};
use crate::stats::{BufferHealth, BufferStats, MemoryUsage, Watermarks};
use crate::store::{self, BufferRecord, RecordStore, Stores};

const ARENA_NAME: &str = "proxy buffer";

/// One upload batch.
#[derive(Debug, Clone, PartialEq)]
pub struct RowBatch<R> {
    pub rows: Vec<R>,
    /// Id of the last row, or the acknowledged id when empty.
    pub lastid: u64,
    pub more: More,
}

impl<R: BufferRecord> RowBatch<R> {
    fn new(rows: Vec<R>, after: u64, more: bool) -> Self {
        let lastid = rows.last().map(|r| r.id()).unwrap_or(after);
        RowBatch {
            rows,
            lastid,
            more: More::from_bool(more),
        }
    }

    fn empty(after: u64) -> Self {
        Self::new(Vec::new(), after, false)
    }
}

/// Outcome of an arena append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Append {
    Stored,
    Dropped,
    Full,
}

struct BufferInner {
    arena: Option<Arena>,
    stores: Stores,
    controller: ModeController,
    handles: HandleTracker,
    marks: [Watermarks; 3],
    /// Last id handed out per kind.
    next_id: [u64; 3],
}

impl BufferInner {
    /// Append `record` with the next id. In memory mode the globally oldest
    /// records are evicted until it fits.
    fn append_mem<R: BufferRecord>(&mut self, record: &mut R) -> Append {
        let k = R::KIND.index();
        let Some(arena) = self.arena.as_mut() else {
            return Append::Full;
        };

        let size = RecordStore::<R>::estimate_size(record);
        if size > arena.total_size() {
            let err = Error::RecordTooLarge {
                size,
                capacity: arena.total_size(),
            };
            warn!(
                event = event_names::RECORD_DROPPED,
                kind = %R::KIND,
                error = %err,
                "record dropped"
            );
            return Append::Dropped;
        }

        let id = self.next_id[k] + 1;
        record.set_id(id);
        loop {
            if R::store_mut(&mut self.stores).add_row_mem(arena, record).is_ok() {
                self.next_id[k] = id;
                self.marks[k].mem = id;
                return Append::Stored;
            }

            if self.controller.mode() != BufferMode::Memory {
                record.set_id(0);
                return Append::Full;
            }

            match self.stores.evict_oldest(arena) {
                Some((kind, evicted, clock)) => {
                    warn!(
                        event = event_names::EVICTED,
                        kind = %kind,
                        id = evicted,
                        clock = clock,
                        "evicted oldest record to make room"
                    );
                }
                None => {
                    warn!(
                        event = event_names::RECORD_DROPPED,
                        kind = %R::KIND,
                        size = size,
                        "no space left after eviction, record dropped"
                    );
                    record.set_id(0);
                    return Append::Dropped;
                }
            }
        }
    }

    fn clear_up_to(&mut self, kind: RecordKind, id: u64) -> usize {
        let Some(arena) = self.arena.as_mut() else {
            return 0;
        };
        match kind {
            RecordKind::History => self.stores.history.clear_up_to(arena, id),
            RecordKind::Discovery => self.stores.discovery.clear_up_to(arena, id),
            RecordKind::AutoRegistration => self.stores.autoreg.clear_up_to(arena, id),
        }
    }

    fn try_advance(&mut self) -> bool {
        let database_drained = RecordKind::ALL
            .iter()
            .all(|kind| self.marks[kind.index()].db <= self.marks[kind.index()].sent)
            && !self.handles.has_open_database();
        self.controller
            .try_advance(database_drained, self.stores.is_empty())
    }
}

/// Hybrid memory/database telemetry buffer.
pub struct ProxyBuffer {
    inner: Mutex<BufferInner>,
    handles_closed: Condvar,
    db: Arc<dyn Database>,
    config: BufferConfig,
}

impl std::fmt::Debug for ProxyBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyBuffer")
            .field("mode", &self.config.mode)
            .field("health", &self.state_info())
            .finish()
    }
}

/// Parse a configured buffer mode. An empty value selects `disk`.
pub fn parse_mode(value: &str) -> Result<BufferMode> {
    BufferMode::parse(value)
}

impl ProxyBuffer {
    /// Create the buffer, reading each kind's unsent backlog from `db`.
    pub fn create(config: BufferConfig, db: Arc<dyn Database>) -> Result<Self> {
        let arena = if config.mode.uses_memory() {
            if config.memory_size == 0 {
                return Err(Error::InvalidValue {
                    field: "memory_size".to_string(),
                    message: format!("required in {} mode", config.mode),
                });
            }
            let arena = Arena::create(ARENA_NAME, config.memory_size, true)
                .map_err(|e| Error::ArenaCreate(e.to_string()))?;
            Some(arena)
        } else {
            None
        };

        let mut marks = [Watermarks::default(); 3];
        let mut next_id = [0u64; 3];
        let mut backlog = false;
        for kind in RecordKind::ALL {
            let unsent = db.select_unsent(kind)?;
            let k = kind.index();
            marks[k] = Watermarks {
                sent: unsent.lastid,
                db: unsent.maxid.max(unsent.lastid),
                mem: 0,
            };
            next_id[k] = unsent.maxid.max(unsent.lastid);
            if unsent.has_backlog() {
                backlog = true;
                info!(
                    event = event_names::BACKLOG_FOUND,
                    kind = %kind,
                    lastid = unsent.lastid,
                    maxid = unsent.maxid,
                    "unsent database records found"
                );
            }
        }

        if backlog && config.mode == BufferMode::Memory {
            warn!(
                event = event_names::BACKLOG_FOUND,
                "database backlog is not uploaded in memory mode"
            );
        }

        let controller = ModeController::new(config.mode, backlog);
        info!(
            event = event_names::BUFFER_CREATED,
            mode = %config.mode,
            state = %controller.state(),
            memory_size = config.memory_size,
            "proxy buffer created"
        );

        Ok(ProxyBuffer {
            inner: Mutex::new(BufferInner {
                arena,
                stores: Stores::default(),
                controller,
                handles: HandleTracker::new(),
                marks,
                next_id,
            }),
            handles_closed: Condvar::new(),
            db,
            config,
        })
    }

    fn lock(&self) -> MutexGuard<'_, BufferInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn config(&self) -> &BufferConfig {
        &self.config
    }

    /// Start a write transaction for one record kind.
    pub fn open<R: BufferRecord>(&self) -> WriteHandle<'_, R> {
        let mut guard = self.enforce_age(self.lock());
        let store = guard.controller.write_store();
        let id = guard.handles.register(R::KIND, store);
        WriteHandle {
            buffer: self,
            id,
            store,
            pending: Vec::new(),
            closed: false,
        }
    }

    /// Next upload batch for `R`, limited by serialized bytes and row count.
    pub fn get_rows<R: BufferRecord>(&self, byte_limit: usize, count_limit: usize) -> RowBatch<R> {
        let mut guard = self.enforce_age(self.lock());
        let after = guard.marks[R::KIND.index()].sent;

        let batch = match guard.controller.read_store() {
            DataStore::Memory => {
                let inner = &mut *guard;
                let (rows, more) = match inner.arena.as_ref() {
                    Some(arena) => {
                        R::store(&inner.stores).get_rows_mem(arena, after, byte_limit, count_limit)
                    }
                    None => (Vec::new(), false),
                };
                inner.try_advance();
                RowBatch::new(rows, after, more)
            }
            DataStore::Database => {
                drop(guard);
                let batch = self.get_rows_db::<R>(after, byte_limit, count_limit);
                guard = self.lock();
                // Rows read back are committed even if their writer has not
                // relocked yet.
                let mark = &mut guard.marks[R::KIND.index()];
                mark.db = mark.db.max(batch.lastid);
                guard.try_advance();
                batch
            }
        };

        debug!(
            event = event_names::ROWS_READ,
            kind = %R::KIND,
            count = batch.rows.len(),
            lastid = batch.lastid,
            more = ?batch.more,
            "rows read"
        );
        batch
    }

    fn get_rows_db<R: BufferRecord>(
        &self,
        after: u64,
        byte_limit: usize,
        count_limit: usize,
    ) -> RowBatch<R> {
        let fetch = || store::get_rows_db::<R>(self.db.as_ref(), after, count_limit);
        let mut rows = match fetch() {
            Ok(rows) => rows,
            Err(err) => {
                warn!(kind = %R::KIND, error = %err, "cannot read database rows");
                return RowBatch::empty(after);
            }
        };

        if let Some(expected) = first_gap(after, &rows) {
            let guard = self.lock();
            let snapshot = guard.handles.snapshot();
            if guard.handles.has_open_before(R::KIND, snapshot) {
                debug!(
                    event = event_names::GAP_WAIT,
                    kind = %R::KIND,
                    expected = expected,
                    "waiting for open writers"
                );
                let (guard, _) = wait_for_open_handles(
                    &self.handles_closed,
                    guard,
                    |inner| &inner.handles,
                    R::KIND,
                    snapshot,
                    Duration::from_millis(self.config.gap_wait_ms),
                    Duration::from_millis(self.config.gap_poll_ms.max(1)),
                );
                drop(guard);
                match fetch() {
                    Ok(refetched) => rows = refetched,
                    Err(err) => {
                        warn!(kind = %R::KIND, error = %err, "cannot re-read database rows");
                        rows.retain(|r| r.id() < expected);
                    }
                }
            } else {
                drop(guard);
            }

            if let Some(expected) = first_gap(after, &rows) {
                debug!(
                    event = event_names::GAP_ACCEPTED,
                    kind = %R::KIND,
                    expected = expected,
                    "id gap treated as permanent"
                );
            }
        }

        let (rows, more) = store::take_batch(rows, byte_limit, count_limit);
        RowBatch::new(rows, after, more)
    }

    /// Acknowledge upload of every `kind` record up to `lastid`. Lower or
    /// equal ids are ignored; ids past the highest stored one are clamped
    /// so `sent` never exceeds `max(db, mem)`.
    pub fn set_lastid(&self, kind: RecordKind, lastid: u64) {
        let lastid = {
            let mut guard = self.lock();
            let inner = &mut *guard;
            let k = kind.index();
            let stored = inner.marks[k].db.max(inner.marks[k].mem);
            let lastid = if lastid > stored {
                warn!(
                    event = event_names::LASTID_CLAMPED,
                    kind = %kind,
                    lastid = lastid,
                    stored = stored,
                    "acknowledged id was never stored, clamping"
                );
                stored
            } else {
                lastid
            };
            if lastid <= inner.marks[k].sent {
                return;
            }
            inner.marks[k].sent = lastid;
            let cleared = inner.clear_up_to(kind, lastid);
            inner.try_advance();
            debug!(
                event = event_names::LASTID_SET,
                kind = %kind,
                lastid = lastid,
                cleared = cleared,
                "upload acknowledged"
            );
            lastid
        };

        if let Err(err) = self.db.set_lastid(kind, lastid) {
            warn!(kind = %kind, lastid = lastid, error = %err, "cannot persist upload watermark");
        }
    }

    /// The uploader's per-cycle report on whether rows were left behind.
    pub fn update_state(&self, more: More) {
        self.lock().controller.update_state(more);
    }

    /// Move arena content to the database and settle in `Database`.
    /// Only meaningful in hybrid mode.
    pub fn flush(&self) {
        if self.config.mode != BufferMode::Hybrid {
            return;
        }
        let guard = self.flush_arena(self.lock(), Transition::Flush);
        info!(
            event = event_names::BUFFER_FLUSHED,
            state = %guard.controller.state(),
            "buffer flushed"
        );
    }

    /// Route all further writes to the database. Only meaningful in hybrid
    /// mode.
    pub fn disable(&self) {
        if self.config.mode != BufferMode::Hybrid {
            return;
        }
        self.lock().controller.disable();
        info!(event = event_names::BUFFER_DISABLED, "buffer disabled");
    }

    /// Release the buffer. Callers must have stopped opening handles.
    pub fn destroy(self) {
        let memory = self.mem_stats();
        let health = self.state_info();
        if memory.records > 0 {
            warn!(
                event = event_names::BUFFER_DESTROYED,
                records = memory.records,
                "arena records discarded at shutdown"
            );
        }
        info!(
            event = event_names::BUFFER_DESTROYED,
            mode = %health.mode,
            state = %health.state,
            changes = health.changes,
            "proxy buffer destroyed"
        );
    }

    /// Arena usage snapshot.
    pub fn mem_stats(&self) -> MemoryUsage {
        let guard = self.lock();
        let Some(arena) = guard.arena.as_ref() else {
            return MemoryUsage::default();
        };
        MemoryUsage {
            used: arena.total_size() - arena.free_size(),
            total: arena.total_size(),
            free: arena.free_size(),
            records: guard.stores.len() as u64,
        }
    }

    /// Health snapshot.
    pub fn state_info(&self) -> BufferHealth {
        let guard = self.lock();
        BufferHealth {
            mode: guard.controller.mode(),
            state: guard.controller.state(),
            store: guard.controller.write_store(),
            changes: guard.controller.changes(),
        }
    }

    /// Usage and health in one snapshot.
    pub fn stats(&self) -> BufferStats {
        BufferStats {
            schema_version: SCHEMA_VERSION.to_string(),
            memory: self.mem_stats(),
            health: self.state_info(),
        }
    }

    /// Id milestones of one kind.
    pub fn watermarks(&self, kind: RecordKind) -> Watermarks {
        self.lock().marks[kind.index()]
    }

    /// Records resident in the arena for one kind.
    pub fn resident(&self, kind: RecordKind) -> usize {
        self.lock().stores.len_of(kind)
    }

    /// Apply the age policy: hybrid flushes stale arena data to the
    /// database, memory mode discards data past the offline buffer.
    fn enforce_age<'a>(
        &'a self,
        mut guard: MutexGuard<'a, BufferInner>,
    ) -> MutexGuard<'a, BufferInner> {
        let now = Utc::now().timestamp();
        let offline = self.config.offline_buffer_secs();

        match self.config.mode {
            BufferMode::Disk => guard,
            BufferMode::Hybrid => {
                if guard.stores.check_age(now, self.config.memory_age, offline) {
                    warn!(
                        event = event_names::AGE_EXCEEDED,
                        records = guard.stores.len(),
                        memory_age = self.config.memory_age,
                        "arena data too old, moving to database"
                    );
                    return self.flush_arena(guard, Transition::AgeExceeded);
                }
                guard
            }
            BufferMode::Memory => {
                let inner = &mut *guard;
                if let Some(arena) = inner.arena.as_mut() {
                    let cutoff = now.saturating_sub(i64::try_from(offline).unwrap_or(i64::MAX));
                    let discarded = inner.stores.discard_older_than(arena, cutoff);
                    if discarded > 0 {
                        warn!(
                            event = event_names::OFFLINE_DISCARDED,
                            records = discarded,
                            "records older than the offline buffer discarded"
                        );
                    }
                }
                guard
            }
        }
    }

    /// Move every arena record to the database in one transaction and switch
    /// to `Database`. A flush handle per kind stays open until the commit so
    /// readers that hit the resulting gap wait for it.
    fn flush_arena<'a>(
        &'a self,
        mut guard: MutexGuard<'a, BufferInner>,
        reason: Transition,
    ) -> MutexGuard<'a, BufferInner> {
        let inner = &mut *guard;
        let Some(arena) = inner.arena.as_mut() else {
            return guard;
        };

        let rows = inner.stores.take_all(arena);
        let flush_handles: Vec<u64> = RecordKind::ALL
            .iter()
            .filter(|kind| rows.len_of(**kind) > 0)
            .map(|kind| inner.handles.register(*kind, DataStore::Database))
            .collect();
        inner.controller.on_flush(reason);

        if rows.is_empty() {
            return guard;
        }
        drop(guard);

        let result = self.write_with_retry(|db| rows.write(db));

        let mut guard = self.lock();
        match result {
            Ok(()) => {
                for kind in RecordKind::ALL {
                    if let Some(max) = rows.max_id(kind) {
                        let mark = &mut guard.marks[kind.index()];
                        mark.db = mark.db.max(max);
                    }
                }
                info!(
                    event = event_names::DB_COMMITTED,
                    records = rows.len(),
                    "arena flushed to database"
                );
            }
            Err(err) => {
                error!(
                    event = event_names::DB_BATCH_LOST,
                    records = rows.len(),
                    error = %err,
                    "arena flush rejected by database, records lost"
                );
            }
        }
        for id in flush_handles {
            guard.handles.deregister(id);
        }
        self.handles_closed.notify_all();
        guard
    }

    /// Run `op` until it succeeds or fails permanently. Transient failures
    /// are retried after `db_retry_delay_ms`, without limit.
    fn write_with_retry(
        &self,
        op: impl Fn(&dyn Database) -> std::result::Result<(), DbError>,
    ) -> std::result::Result<(), DbError> {
        let delay = Duration::from_millis(self.config.db_retry_delay_ms);
        let mut attempt: u64 = 0;
        loop {
            match op(self.db.as_ref()) {
                Ok(()) => return Ok(()),
                Err(err) if err.is_transient() => {
                    attempt += 1;
                    warn!(
                        event = event_names::DB_RETRY,
                        attempt = attempt,
                        delay_ms = self.config.db_retry_delay_ms,
                        error = %err,
                        "database write failed, retrying"
                    );
                    thread::sleep(delay);
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Try to keep `record` in the arena. On a full arena in hybrid mode the
    /// automaton falls back to the database and `false` is returned.
    fn store_in_memory<'a, R: BufferRecord>(
        &'a self,
        mut guard: MutexGuard<'a, BufferInner>,
        record: &mut R,
    ) -> (MutexGuard<'a, BufferInner>, bool) {
        match guard.append_mem(record) {
            Append::Stored | Append::Dropped => (guard, true),
            Append::Full => {
                if guard.controller.state() == BufferState::DatabaseToMemory {
                    // Reads still come from the database; move the arena there.
                    guard = self.flush_arena(guard, Transition::ArenaFull);
                } else {
                    guard.controller.on_arena_full();
                }
                (guard, false)
            }
        }
    }
}

/// First id missing from a contiguous run starting after `after`.
fn first_gap<R: BufferRecord>(after: u64, rows: &[R]) -> Option<u64> {
    let mut expected = after + 1;
    for row in rows {
        if row.id() != expected {
            return Some(expected);
        }
        expected += 1;
    }
    None
}

/// An open write transaction for one record kind.
///
/// Memory-bound records are appended on `write`; database-bound ones are
/// buffered privately and committed on `close`. Dropping the handle closes it.
pub struct WriteHandle<'a, R: BufferRecord> {
    buffer: &'a ProxyBuffer,
    id: u64,
    store: DataStore,
    pending: Vec<R>,
    closed: bool,
}

impl<R: BufferRecord> WriteHandle<'_, R> {
    /// Where this handle currently sends records.
    pub fn store(&self) -> DataStore {
        self.store
    }

    pub fn write(&mut self, mut record: R) {
        if self.store == DataStore::Memory {
            let buffer = self.buffer;
            let mut guard = buffer.lock();
            if guard.controller.write_store() == DataStore::Memory {
                let (next, kept) = buffer.store_in_memory(guard, &mut record);
                if kept {
                    return;
                }
                guard = next;
            }
            self.store = DataStore::Database;
            guard.handles.reroute(self.id, DataStore::Database);
        }
        self.pending.push(record);
    }

    /// Commit pending records and release the handle.
    pub fn close(mut self) {
        self.finish();
    }

    fn finish(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        let buffer = self.buffer;
        let mut guard = buffer.lock();
        let pending = std::mem::take(&mut self.pending);

        let mut to_db = Vec::with_capacity(pending.len());
        for mut record in pending {
            if to_db.is_empty() && guard.controller.write_store() == DataStore::Memory {
                let (next, kept) = buffer.store_in_memory(guard, &mut record);
                guard = next;
                if kept {
                    continue;
                }
            }
            to_db.push(record);
        }

        if !to_db.is_empty() {
            let k = R::KIND.index();
            let first = guard.next_id[k] + 1;
            for (offset, record) in to_db.iter_mut().enumerate() {
                record.set_id(first + offset as u64);
            }
            let last = first + to_db.len() as u64 - 1;
            guard.next_id[k] = last;
            guard.handles.reroute(self.id, DataStore::Database);
            drop(guard);

            let result = buffer.write_with_retry(|db| store::add_rows_db(db, &to_db));

            guard = buffer.lock();
            match result {
                Ok(()) => {
                    let mark = &mut guard.marks[k];
                    mark.db = mark.db.max(last);
                }
                Err(err) => {
                    error!(
                        event = event_names::DB_BATCH_LOST,
                        kind = %R::KIND,
                        first = first,
                        last = last,
                        error = %err,
                        "database rejected batch, records lost"
                    );
                }
            }
        }

        guard.handles.deregister(self.id);
        guard.try_advance();
        drop(guard);
        buffer.handles_closed.notify_all();
    }
}

impl<R: BufferRecord> Drop for WriteHandle<'_, R> {
    fn drop(&mut self) {
        self.finish();
    }
}
