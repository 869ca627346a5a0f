//! Per-kind record stores.
//!
//! A store is a FIFO of arena-resident rows. Each row owns one fixed chunk
//! holding the variable field lengths followed by the integer fields, and one
//! chunk per non-empty variable field. Ids and clocks stay on the list entry so
//! ordering and age checks never touch the arena.

pub mod autoreg;
pub mod discovery;
pub mod history;

use std::collections::VecDeque;
use std::marker::PhantomData;

use pb_arena::{Arena, Chunk};
use pb_common::{AutoregRecord, DiscoveryRecord, Error, HistoryRecord, RecordKind};
use serde::Serialize;
use tracing::warn;

use crate::db::{Database, DbError, Transaction};
use crate::logging::event_names;

/// A record kind the buffer can hold.
pub trait BufferRecord: Clone + Serialize + Send + Sized + 'static {
    const KIND: RecordKind;

    /// Number of variable-length fields.
    const VAR_COUNT: usize;

    fn id(&self) -> u64;
    fn set_id(&mut self, id: u64);
    fn clock(&self) -> i64;

    /// Write the integer fields other than id and clock.
    fn encode_fixed(&self, out: &mut FieldWriter);

    /// Variable-length fields, `VAR_COUNT` of them, in a fixed order.
    fn var_fields(&self) -> Vec<&str>;

    /// Rebuild a record from its integer fields and variable fields.
    fn decode(id: u64, clock: i64, fixed: &mut FieldReader<'_>, vars: Vec<String>) -> Option<Self>;

    fn insert(tx: &mut dyn Transaction, rows: &[Self]) -> Result<(), DbError>;
    fn fetch(db: &dyn Database, after: u64, limit: usize) -> Result<Vec<Self>, DbError>;

    fn store(stores: &Stores) -> &RecordStore<Self>;
    fn store_mut(stores: &mut Stores) -> &mut RecordStore<Self>;
}

/// Little-endian field encoder.
#[derive(Debug, Default)]
pub struct FieldWriter {
    buf: Vec<u8>,
}

impl FieldWriter {
    pub fn u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn i64(&mut self, v: i64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn i32(&mut self, v: i32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

/// Little-endian field decoder. Every getter returns `None` past the end.
#[derive(Debug)]
pub struct FieldReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> FieldReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        FieldReader { buf, pos: 0 }
    }

    fn take<const N: usize>(&mut self) -> Option<[u8; N]> {
        let bytes = self.buf.get(self.pos..self.pos.checked_add(N)?)?;
        self.pos += N;
        bytes.try_into().ok()
    }

    pub fn u64(&mut self) -> Option<u64> {
        self.take().map(u64::from_le_bytes)
    }

    pub fn i64(&mut self) -> Option<i64> {
        self.take().map(i64::from_le_bytes)
    }

    pub fn u32(&mut self) -> Option<u32> {
        self.take().map(u32::from_le_bytes)
    }

    pub fn i32(&mut self) -> Option<i32> {
        self.take().map(i32::from_le_bytes)
    }

    pub fn u16(&mut self) -> Option<u16> {
        self.take().map(u16::from_le_bytes)
    }
}

/// Returned when the arena cannot hold a row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArenaFull;

#[derive(Debug)]
struct MemRow {
    id: u64,
    clock: i64,
    fixed: Chunk,
    vars: Vec<Option<Chunk>>,
}

impl MemRow {
    fn chunks(&self) -> impl Iterator<Item = Chunk> + '_ {
        std::iter::once(self.fixed).chain(self.vars.iter().flatten().copied())
    }
}

/// Arena-resident FIFO of one record kind.
#[derive(Debug)]
pub struct RecordStore<R> {
    rows: VecDeque<MemRow>,
    _kind: PhantomData<fn() -> R>,
}

impl<R> Default for RecordStore<R> {
    fn default() -> Self {
        RecordStore {
            rows: VecDeque::new(),
            _kind: PhantomData,
        }
    }
}

impl<R: BufferRecord> RecordStore<R> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Clock of the head record.
    pub fn oldest_clock(&self) -> Option<i64> {
        self.rows.front().map(|row| row.clock)
    }

    /// Arena bytes `add_row_mem` would need for `record`, tags included.
    pub fn estimate_size(record: &R) -> u64 {
        let fixed = Self::encode_fixed(record);
        Arena::required_size(fixed.len() as u64)
            + record
                .var_fields()
                .iter()
                .filter(|v| !v.is_empty())
                .map(|v| Arena::required_size(v.len() as u64))
                .sum::<u64>()
    }

    fn encode_fixed(record: &R) -> Vec<u8> {
        let mut out = FieldWriter::default();
        for v in record.var_fields() {
            out.u32(u32::try_from(v.len()).unwrap_or(u32::MAX));
        }
        record.encode_fixed(&mut out);
        out.into_bytes()
    }

    /// Append `record` to the tail. Either every chunk is allocated and the
    /// row is appended, or nothing changes.
    pub fn add_row_mem(&mut self, arena: &mut Arena, record: &R) -> Result<(), ArenaFull> {
        let fixed_bytes = Self::encode_fixed(record);
        let fixed = arena.malloc(fixed_bytes.len() as u64).ok_or(ArenaFull)?;
        arena.bytes_mut(fixed)[..fixed_bytes.len()].copy_from_slice(&fixed_bytes);

        let mut vars = Vec::with_capacity(R::VAR_COUNT);
        for value in record.var_fields() {
            if value.is_empty() {
                vars.push(None);
                continue;
            }
            match arena.malloc(value.len() as u64) {
                Some(chunk) => {
                    arena.bytes_mut(chunk)[..value.len()].copy_from_slice(value.as_bytes());
                    vars.push(Some(chunk));
                }
                None => {
                    for chunk in vars.into_iter().flatten() {
                        arena.free(chunk);
                    }
                    arena.free(fixed);
                    return Err(ArenaFull);
                }
            }
        }

        self.rows.push_back(MemRow {
            id: record.id(),
            clock: record.clock(),
            fixed,
            vars,
        });
        Ok(())
    }

    fn free_row(arena: &mut Arena, row: MemRow) {
        for chunk in row.chunks() {
            arena.free(chunk);
        }
    }

    fn decode_row(arena: &Arena, row: &MemRow) -> Option<R> {
        let mut reader = FieldReader::new(arena.bytes(row.fixed));
        let mut lengths = Vec::with_capacity(R::VAR_COUNT);
        for _ in 0..R::VAR_COUNT {
            lengths.push(reader.u32()? as usize);
        }
        if lengths.len() != row.vars.len() {
            return None;
        }

        let mut vars = Vec::with_capacity(R::VAR_COUNT);
        for (len, chunk) in lengths.into_iter().zip(&row.vars) {
            let value = match chunk {
                None if len == 0 => String::new(),
                Some(chunk) => {
                    let bytes = arena.bytes(*chunk).get(..len)?;
                    String::from_utf8(bytes.to_vec()).ok()?
                }
                None => return None,
            };
            vars.push(value);
        }

        R::decode(row.id, row.clock, &mut reader, vars)
    }

    fn decode_or_log(arena: &Arena, row: &MemRow) -> Option<R> {
        let record = Self::decode_row(arena, row);
        if record.is_none() {
            let err = Error::MalformedRecord {
                kind: R::KIND.to_string(),
                message: format!("row {} does not decode", row.id),
            };
            warn!(
                event = event_names::MALFORMED_RECORD,
                error = %err,
                "skipping arena record"
            );
        }
        record
    }

    /// Rows with id greater than `after`, limited by count and serialized size.
    pub fn get_rows_mem(
        &self,
        arena: &Arena,
        after: u64,
        byte_limit: usize,
        count_limit: usize,
    ) -> (Vec<R>, bool) {
        let start = self.rows.partition_point(|row| row.id <= after);
        let rows = self
            .rows
            .range(start..)
            .filter_map(|row| Self::decode_or_log(arena, row));
        take_batch(rows, byte_limit, count_limit)
    }

    /// Drop every row with id up to and including `id`.
    pub fn clear_up_to(&mut self, arena: &mut Arena, id: u64) -> usize {
        let mut cleared = 0;
        while self.rows.front().is_some_and(|row| row.id <= id) {
            if let Some(row) = self.rows.pop_front() {
                Self::free_row(arena, row);
                cleared += 1;
            }
        }
        cleared
    }

    /// Remove the head record, returning its id and clock.
    pub fn pop_oldest(&mut self, arena: &mut Arena) -> Option<(u64, i64)> {
        let row = self.rows.pop_front()?;
        let popped = (row.id, row.clock);
        Self::free_row(arena, row);
        Some(popped)
    }

    /// Whether the head record is older than `max_age` (when non-zero) or
    /// the offline buffer period, at time `now`.
    pub fn check_age(&self, now: i64, max_age: u64, offline_buffer: u64) -> bool {
        let Some(clock) = self.oldest_clock() else {
            return false;
        };
        let age = now.saturating_sub(clock);
        let exceeds = |limit: u64| limit > 0 && age > i64::try_from(limit).unwrap_or(i64::MAX);
        exceeds(max_age) || exceeds(offline_buffer)
    }

    /// Drop head records with a clock before `cutoff`.
    pub fn discard_older_than(&mut self, arena: &mut Arena, cutoff: i64) -> usize {
        let mut discarded = 0;
        while self.rows.front().is_some_and(|row| row.clock < cutoff) {
            if self.pop_oldest(arena).is_some() {
                discarded += 1;
            }
        }
        discarded
    }

    /// Decode and remove every row.
    pub fn take_all(&mut self, arena: &mut Arena) -> Vec<R> {
        let mut out = Vec::with_capacity(self.rows.len());
        while let Some(row) = self.rows.pop_front() {
            if let Some(record) = Self::decode_or_log(arena, &row) {
                out.push(record);
            }
            Self::free_row(arena, row);
        }
        out
    }
}

/// Take rows while both limits hold. The first row is always taken so an
/// oversized record cannot stall the stream. The flag reports rows left over.
pub fn take_batch<R: Serialize>(
    rows: impl IntoIterator<Item = R>,
    byte_limit: usize,
    count_limit: usize,
) -> (Vec<R>, bool) {
    let mut out = Vec::new();
    let mut bytes = 0usize;

    for row in rows {
        if out.len() >= count_limit {
            return (out, true);
        }
        let size = serialized_size(&row);
        if !out.is_empty() && bytes.saturating_add(size) > byte_limit {
            return (out, true);
        }
        bytes = bytes.saturating_add(size);
        out.push(row);
    }
    (out, false)
}

/// Length of the record's JSON encoding.
pub fn serialized_size<R: Serialize>(record: &R) -> usize {
    serde_json::to_vec(record).map(|v| v.len()).unwrap_or(0)
}

/// Insert rows of one kind in a single transaction.
pub fn add_rows_db<R: BufferRecord>(db: &dyn Database, rows: &[R]) -> Result<(), DbError> {
    if rows.is_empty() {
        return Ok(());
    }
    let mut tx = db.begin()?;
    R::insert(tx.as_mut(), rows)?;
    tx.commit()
}

/// Up to `count_limit + 1` rows after `after`, the extra row signalling more.
pub fn get_rows_db<R: BufferRecord>(
    db: &dyn Database,
    after: u64,
    count_limit: usize,
) -> Result<Vec<R>, DbError> {
    R::fetch(db, after, count_limit.saturating_add(1))
}

/// The three stores sharing one arena.
#[derive(Debug, Default)]
pub struct Stores {
    pub history: RecordStore<HistoryRecord>,
    pub discovery: RecordStore<DiscoveryRecord>,
    pub autoreg: RecordStore<AutoregRecord>,
}

impl Stores {
    pub fn len(&self) -> usize {
        self.history.len() + self.discovery.len() + self.autoreg.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn len_of(&self, kind: RecordKind) -> usize {
        match kind {
            RecordKind::History => self.history.len(),
            RecordKind::Discovery => self.discovery.len(),
            RecordKind::AutoRegistration => self.autoreg.len(),
        }
    }

    fn oldest_clock_of(&self, kind: RecordKind) -> Option<i64> {
        match kind {
            RecordKind::History => self.history.oldest_clock(),
            RecordKind::Discovery => self.discovery.oldest_clock(),
            RecordKind::AutoRegistration => self.autoreg.oldest_clock(),
        }
    }

    /// Kind whose head record is oldest. Equal clocks are broken by
    /// `RecordKind::eviction_rank`.
    pub fn oldest(&self) -> Option<(RecordKind, i64)> {
        RecordKind::ALL
            .iter()
            .filter_map(|kind| self.oldest_clock_of(*kind).map(|clock| (*kind, clock)))
            .min_by_key(|(kind, clock)| (*clock, kind.eviction_rank()))
    }

    /// Remove the globally oldest record.
    pub fn evict_oldest(&mut self, arena: &mut Arena) -> Option<(RecordKind, u64, i64)> {
        let (kind, _) = self.oldest()?;
        let (id, clock) = match kind {
            RecordKind::History => self.history.pop_oldest(arena),
            RecordKind::Discovery => self.discovery.pop_oldest(arena),
            RecordKind::AutoRegistration => self.autoreg.pop_oldest(arena),
        }?;
        Some((kind, id, clock))
    }

    /// Whether any store holds data past its age limits.
    pub fn check_age(&self, now: i64, max_age: u64, offline_buffer: u64) -> bool {
        self.history.check_age(now, max_age, offline_buffer)
            || self.discovery.check_age(now, max_age, offline_buffer)
            || self.autoreg.check_age(now, max_age, offline_buffer)
    }

    /// Drop records older than `cutoff` from every store.
    pub fn discard_older_than(&mut self, arena: &mut Arena, cutoff: i64) -> usize {
        self.history.discard_older_than(arena, cutoff)
            + self.discovery.discard_older_than(arena, cutoff)
            + self.autoreg.discard_older_than(arena, cutoff)
    }

    /// Empty every store.
    pub fn take_all(&mut self, arena: &mut Arena) -> StoredRows {
        StoredRows {
            history: self.history.take_all(arena),
            discovery: self.discovery.take_all(arena),
            autoreg: self.autoreg.take_all(arena),
        }
    }
}

/// Records moved out of the arena on their way to the database.
#[derive(Debug, Default)]
pub struct StoredRows {
    pub history: Vec<HistoryRecord>,
    pub discovery: Vec<DiscoveryRecord>,
    pub autoreg: Vec<AutoregRecord>,
}

impl StoredRows {
    pub fn len(&self) -> usize {
        self.history.len() + self.discovery.len() + self.autoreg.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn len_of(&self, kind: RecordKind) -> usize {
        match kind {
            RecordKind::History => self.history.len(),
            RecordKind::Discovery => self.discovery.len(),
            RecordKind::AutoRegistration => self.autoreg.len(),
        }
    }

    /// Highest id held for `kind`.
    pub fn max_id(&self, kind: RecordKind) -> Option<u64> {
        match kind {
            RecordKind::History => self.history.iter().map(|r| r.id).max(),
            RecordKind::Discovery => self.discovery.iter().map(|r| r.id).max(),
            RecordKind::AutoRegistration => self.autoreg.iter().map(|r| r.id).max(),
        }
    }

    /// Insert every held record in one transaction.
    pub fn write(&self, db: &dyn Database) -> Result<(), DbError> {
        let mut tx = db.begin()?;
        if !self.history.is_empty() {
            tx.insert_history(&self.history)?;
        }
        if !self.discovery.is_empty() {
            tx.insert_discovery(&self.discovery)?;
        }
        if !self.autoreg.is_empty() {
            tx.insert_autoreg(&self.autoreg)?;
        }
        tx.commit()
    }
}
