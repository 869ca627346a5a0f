//! History store: item values from pollers and trappers.

use pb_common::{HistoryRecord, RecordKind};

use super::{BufferRecord, FieldReader, FieldWriter, RecordStore, Stores};
use crate::db::{Database, DbError, Transaction};

impl BufferRecord for HistoryRecord {
    const KIND: RecordKind = RecordKind::History;
    const VAR_COUNT: usize = 2;

    fn id(&self) -> u64 {
        self.id
    }

    fn set_id(&mut self, id: u64) {
        self.id = id;
    }

    fn clock(&self) -> i64 {
        self.clock
    }

    fn encode_fixed(&self, out: &mut FieldWriter) {
        out.u64(self.itemid);
        out.i32(self.ns);
        out.i64(self.timestamp);
        out.i32(self.severity);
        out.i32(self.logeventid);
        out.u64(self.lastlogsize);
        out.i32(self.mtime);
        out.i32(self.state);
        out.u32(self.flags);
        out.i64(self.write_clock);
    }

    fn var_fields(&self) -> Vec<&str> {
        vec![self.value.as_str(), self.source.as_str()]
    }

    fn decode(id: u64, clock: i64, fixed: &mut FieldReader<'_>, vars: Vec<String>) -> Option<Self> {
        let mut vars = vars.into_iter();
        Some(HistoryRecord {
            id,
            clock,
            itemid: fixed.u64()?,
            ns: fixed.i32()?,
            timestamp: fixed.i64()?,
            severity: fixed.i32()?,
            logeventid: fixed.i32()?,
            lastlogsize: fixed.u64()?,
            mtime: fixed.i32()?,
            state: fixed.i32()?,
            flags: fixed.u32()?,
            write_clock: fixed.i64()?,
            value: vars.next()?,
            source: vars.next()?,
        })
    }

    fn insert(tx: &mut dyn Transaction, rows: &[Self]) -> Result<(), DbError> {
        tx.insert_history(rows)
    }

    fn fetch(db: &dyn Database, after: u64, limit: usize) -> Result<Vec<Self>, DbError> {
        db.fetch_history(after, limit)
    }

    fn store(stores: &Stores) -> &RecordStore<Self> {
        &stores.history
    }

    fn store_mut(stores: &mut Stores) -> &mut RecordStore<Self> {
        &mut stores.history
    }
}
