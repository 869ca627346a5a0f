//! Discovery store: network discovery check results.

use pb_common::{DiscoveryRecord, RecordKind};

use super::{BufferRecord, FieldReader, FieldWriter, RecordStore, Stores};
use crate::db::{Database, DbError, Transaction};

impl BufferRecord for DiscoveryRecord {
    const KIND: RecordKind = RecordKind::Discovery;
    const VAR_COUNT: usize = 4;

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
        out.u64(self.druleid);
        out.u64(self.dcheckid);
        out.u16(self.port);
        out.i32(self.status);
    }

    fn var_fields(&self) -> Vec<&str> {
        vec![self.ip.as_str(), self.dns.as_str(), self.value.as_str(), self.error.as_str()]
    }

    fn decode(id: u64, clock: i64, fixed: &mut FieldReader<'_>, vars: Vec<String>) -> Option<Self> {
        let mut vars = vars.into_iter();
        Some(DiscoveryRecord {
            id,
            clock,
            druleid: fixed.u64()?,
            dcheckid: fixed.u64()?,
            port: fixed.u16()?,
            status: fixed.i32()?,
            ip: vars.next()?,
            dns: vars.next()?,
            value: vars.next()?,
            error: vars.next()?,
        })
    }

    fn insert(tx: &mut dyn Transaction, rows: &[Self]) -> Result<(), DbError> {
        tx.insert_discovery(rows)
    }

    fn fetch(db: &dyn Database, after: u64, limit: usize) -> Result<Vec<Self>, DbError> {
        db.fetch_discovery(after, limit)
    }

    fn store(stores: &Stores) -> &RecordStore<Self> {
        &stores.discovery
    }

    fn store_mut(stores: &mut Stores) -> &mut RecordStore<Self> {
        &mut stores.discovery
    }
}
