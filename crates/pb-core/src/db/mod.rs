//! Database collaborator.
//!
//! The buffer only needs transactional inserts, ordered reads after an id,
//! and the per-kind upload watermark. SQL and schema live behind this trait.

pub mod memory;

pub use memory::InMemoryDatabase;

use pb_common::{AutoregRecord, DiscoveryRecord, HistoryRecord, RecordKind};
use thiserror::Error;

/// Database failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DbError {
    /// Transient; the whole transaction is retried from scratch.
    #[error("database unavailable: {0}")]
    Unavailable(String),

    /// Permanent; the operation will not succeed on retry.
    #[error("database operation failed: {0}")]
    Failed(String),
}

impl DbError {
    pub fn is_transient(&self) -> bool {
        matches!(self, DbError::Unavailable(_))
    }
}

impl From<DbError> for pb_common::Error {
    fn from(err: DbError) -> Self {
        match err {
            DbError::Unavailable(msg) => pb_common::Error::DatabaseUnavailable(msg),
            DbError::Failed(msg) => pb_common::Error::Database(msg),
        }
    }
}

/// Unsent backlog of one table: the acknowledged id and the highest stored id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Unsent {
    pub lastid: u64,
    pub maxid: u64,
}

impl Unsent {
    pub fn has_backlog(&self) -> bool {
        self.maxid > self.lastid
    }
}

/// An open transaction. Dropping it without `commit` rolls back.
pub trait Transaction {
    fn insert_history(&mut self, rows: &[HistoryRecord]) -> Result<(), DbError>;
    fn insert_discovery(&mut self, rows: &[DiscoveryRecord]) -> Result<(), DbError>;
    fn insert_autoreg(&mut self, rows: &[AutoregRecord]) -> Result<(), DbError>;
    fn commit(self: Box<Self>) -> Result<(), DbError>;
}

/// Proxy database as seen by the buffer.
pub trait Database: Send + Sync {
    /// Start a transaction.
    fn begin(&self) -> Result<Box<dyn Transaction + '_>, DbError>;

    /// Acknowledged and highest stored id for the kind's table.
    fn select_unsent(&self, kind: RecordKind) -> Result<Unsent, DbError>;

    /// Up to `limit` rows with id greater than `after`, in id order.
    fn fetch_history(&self, after: u64, limit: usize) -> Result<Vec<HistoryRecord>, DbError>;
    fn fetch_discovery(&self, after: u64, limit: usize) -> Result<Vec<DiscoveryRecord>, DbError>;
    fn fetch_autoreg(&self, after: u64, limit: usize) -> Result<Vec<AutoregRecord>, DbError>;

    /// Persist the upload watermark.
    fn set_lastid(&self, kind: RecordKind, id: u64) -> Result<(), DbError>;
}
