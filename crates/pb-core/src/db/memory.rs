//! In-process database used by the simulator and tests.
//!
//! Tables are ordered maps keyed by id. Rows inserted with id 0 get the next
//! auto-increment id. Faults can be injected into commits and reads.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use pb_common::{AutoregRecord, DiscoveryRecord, HistoryRecord, RecordKind};

use super::{Database, DbError, Transaction, Unsent};

#[derive(Debug, Default)]
struct Tables {
    history: BTreeMap<u64, HistoryRecord>,
    discovery: BTreeMap<u64, DiscoveryRecord>,
    autoreg: BTreeMap<u64, AutoregRecord>,
    lastid: [u64; 3],
}

impl Tables {
    fn max_id(&self, kind: RecordKind) -> u64 {
        let last = match kind {
            RecordKind::History => self.history.keys().next_back(),
            RecordKind::Discovery => self.discovery.keys().next_back(),
            RecordKind::AutoRegistration => self.autoreg.keys().next_back(),
        };
        last.copied().unwrap_or(0)
    }
}

#[derive(Debug, Default)]
struct Faults {
    offline: bool,
    unavailable_commits: u32,
    failed_commits: u32,
}

/// Database kept entirely in process memory.
#[derive(Debug, Default)]
pub struct InMemoryDatabase {
    tables: Mutex<Tables>,
    faults: Mutex<Faults>,
    commits: AtomicU64,
    attempts: AtomicU64,
}

impl InMemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every operation fail with `Unavailable` until turned back on.
    pub fn set_offline(&self, offline: bool) {
        self.faults().offline = offline;
    }

    /// Fail the next `n` commits with `Unavailable`.
    pub fn fail_next_commits(&self, n: u32) {
        self.faults().unavailable_commits = n;
    }

    /// Fail the next `n` commits with `Failed`.
    pub fn reject_next_commits(&self, n: u32) {
        self.faults().failed_commits = n;
    }

    /// Successful commits so far.
    pub fn commits(&self) -> u64 {
        self.commits.load(Ordering::SeqCst)
    }

    /// Commit attempts so far, including failed ones.
    pub fn commit_attempts(&self) -> u64 {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Stored ids of a table, in order.
    pub fn ids(&self, kind: RecordKind) -> Vec<u64> {
        let tables = self.tables();
        match kind {
            RecordKind::History => tables.history.keys().copied().collect(),
            RecordKind::Discovery => tables.discovery.keys().copied().collect(),
            RecordKind::AutoRegistration => tables.autoreg.keys().copied().collect(),
        }
    }

    /// Persisted upload watermark of a table.
    pub fn lastid(&self, kind: RecordKind) -> u64 {
        self.tables().lastid[kind.index()]
    }

    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn faults(&self) -> MutexGuard<'_, Faults> {
        self.faults.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_online(&self) -> Result<(), DbError> {
        if self.faults().offline {
            return Err(DbError::Unavailable("database is offline".to_string()));
        }
        Ok(())
    }
}

fn fetch<R: Clone>(table: &BTreeMap<u64, R>, after: u64, limit: usize) -> Vec<R> {
    table
        .range(after.saturating_add(1)..)
        .take(limit)
        .map(|(_, row)| row.clone())
        .collect()
}

impl Database for InMemoryDatabase {
    fn begin(&self) -> Result<Box<dyn Transaction + '_>, DbError> {
        self.check_online()?;
        Ok(Box::new(MemTransaction {
            db: self,
            history: Vec::new(),
            discovery: Vec::new(),
            autoreg: Vec::new(),
        }))
    }

    fn select_unsent(&self, kind: RecordKind) -> Result<Unsent, DbError> {
        self.check_online()?;
        let tables = self.tables();
        Ok(Unsent {
            lastid: tables.lastid[kind.index()],
            maxid: tables.max_id(kind),
        })
    }

    fn fetch_history(&self, after: u64, limit: usize) -> Result<Vec<HistoryRecord>, DbError> {
        self.check_online()?;
        Ok(fetch(&self.tables().history, after, limit))
    }

    fn fetch_discovery(&self, after: u64, limit: usize) -> Result<Vec<DiscoveryRecord>, DbError> {
        self.check_online()?;
        Ok(fetch(&self.tables().discovery, after, limit))
    }

    fn fetch_autoreg(&self, after: u64, limit: usize) -> Result<Vec<AutoregRecord>, DbError> {
        self.check_online()?;
        Ok(fetch(&self.tables().autoreg, after, limit))
    }

    fn set_lastid(&self, kind: RecordKind, id: u64) -> Result<(), DbError> {
        self.check_online()?;
        self.tables().lastid[kind.index()] = id;
        Ok(())
    }
}

struct MemTransaction<'a> {
    db: &'a InMemoryDatabase,
    history: Vec<HistoryRecord>,
    discovery: Vec<DiscoveryRecord>,
    autoreg: Vec<AutoregRecord>,
}

impl Transaction for MemTransaction<'_> {
    fn insert_history(&mut self, rows: &[HistoryRecord]) -> Result<(), DbError> {
        self.history.extend_from_slice(rows);
        Ok(())
    }

    fn insert_discovery(&mut self, rows: &[DiscoveryRecord]) -> Result<(), DbError> {
        self.discovery.extend_from_slice(rows);
        Ok(())
    }

    fn insert_autoreg(&mut self, rows: &[AutoregRecord]) -> Result<(), DbError> {
        self.autoreg.extend_from_slice(rows);
        Ok(())
    }

    fn commit(self: Box<Self>) -> Result<(), DbError> {
        let db = self.db;
        db.attempts.fetch_add(1, Ordering::SeqCst);
        {
            let mut faults = db.faults();
            if faults.offline {
                return Err(DbError::Unavailable("database is offline".to_string()));
            }
            if faults.unavailable_commits > 0 {
                faults.unavailable_commits -= 1;
                return Err(DbError::Unavailable("connection lost".to_string()));
            }
            if faults.failed_commits > 0 {
                faults.failed_commits -= 1;
                return Err(DbError::Failed("constraint violation".to_string()));
            }
        }

        let mut tables = db.tables();
        let history = assign_ids(&tables.history, self.history, |r| &mut r.id)?;
        let discovery = assign_ids(&tables.discovery, self.discovery, |r| &mut r.id)?;
        let autoreg = assign_ids(&tables.autoreg, self.autoreg, |r| &mut r.id)?;

        tables.history.extend(history);
        tables.discovery.extend(discovery);
        tables.autoreg.extend(autoreg);
        db.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Key staged rows by id, auto-incrementing rows without one. A duplicate id
/// fails the whole transaction.
fn assign_ids<R>(
    table: &BTreeMap<u64, R>,
    rows: Vec<R>,
    id: impl Fn(&mut R) -> &mut u64,
) -> Result<Vec<(u64, R)>, DbError> {
    let mut next = table.keys().next_back().copied().unwrap_or(0);
    let mut staged: BTreeMap<u64, R> = BTreeMap::new();

    for mut row in rows {
        let slot = id(&mut row);
        if *slot == 0 {
            next = next.max(staged.keys().next_back().copied().unwrap_or(0)) + 1;
            *slot = next;
        }
        let key = *slot;
        if table.contains_key(&key) || staged.insert(key, row).is_some() {
            return Err(DbError::Failed(format!("duplicate id {}", key)));
        }
    }

    Ok(staged.into_iter().collect())
}
