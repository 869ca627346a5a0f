//! Auto-registration store: hosts announcing themselves to the proxy.

use pb_common::{AutoregRecord, RecordKind};

use super::{BufferRecord, FieldReader, FieldWriter, RecordStore, Stores};
use crate::db::{Database, DbError, Transaction};

impl BufferRecord for AutoregRecord {
    const KIND: RecordKind = RecordKind::AutoRegistration;
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
        out.u16(self.listen_port);
        out.u32(self.tls_accepted);
        out.u32(self.flags);
    }

    fn var_fields(&self) -> Vec<&str> {
        vec![
            self.host.as_str(),
            self.listen_ip.as_str(),
            self.listen_dns.as_str(),
            self.host_metadata.as_str(),
        ]
    }

    fn decode(id: u64, clock: i64, fixed: &mut FieldReader<'_>, vars: Vec<String>) -> Option<Self> {
        let mut vars = vars.into_iter();
        Some(AutoregRecord {
            id,
            clock,
            listen_port: fixed.u16()?,
            tls_accepted: fixed.u32()?,
            flags: fixed.u32()?,
            host: vars.next()?,
            listen_ip: vars.next()?,
            listen_dns: vars.next()?,
            host_metadata: vars.next()?,
        })
    }

    fn insert(tx: &mut dyn Transaction, rows: &[Self]) -> Result<(), DbError> {
        tx.insert_autoreg(rows)
    }

    fn fetch(db: &dyn Database, after: u64, limit: usize) -> Result<Vec<Self>, DbError> {
        db.fetch_autoreg(after, limit)
    }

    fn store(stores: &Stores) -> &RecordStore<Self> {
        &stores.autoreg
    }

    fn store_mut(stores: &mut Stores) -> &mut RecordStore<Self> {
        &mut stores.autoreg
    }
}
