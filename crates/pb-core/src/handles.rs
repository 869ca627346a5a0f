//! Open write handle tracking.
//!
//! Every write transaction registers before it writes and deregisters once
//! its records are committed with final ids. A reader that finds a gap in the
//! id sequence takes a snapshot of the counter and waits only for handles
//! registered at or before it.

use std::collections::BTreeMap;
use std::sync::{Condvar, MutexGuard};
use std::time::{Duration, Instant};

use pb_common::{DataStore, RecordKind};

/// What an open handle is doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenHandle {
    pub kind: RecordKind,
    /// Where the handle's records will be committed.
    pub store: DataStore,
}

/// Monotonic handle ids plus the set of handles still open.
#[derive(Debug, Default)]
pub struct HandleTracker {
    last_id: u64,
    open: BTreeMap<u64, OpenHandle>,
}

impl HandleTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handle and return its id.
    pub fn register(&mut self, kind: RecordKind, store: DataStore) -> u64 {
        self.last_id += 1;
        self.open.insert(self.last_id, OpenHandle { kind, store });
        self.last_id
    }

    /// Change where an open handle will commit.
    pub fn reroute(&mut self, id: u64, store: DataStore) {
        if let Some(handle) = self.open.get_mut(&id) {
            handle.store = store;
        }
    }

    pub fn deregister(&mut self, id: u64) {
        self.open.remove(&id);
    }

    /// Id of the most recently registered handle.
    pub fn snapshot(&self) -> u64 {
        self.last_id
    }

    /// Whether a handle of `kind` registered at or before `snapshot` is open.
    pub fn has_open_before(&self, kind: RecordKind, snapshot: u64) -> bool {
        self.open
            .range(..=snapshot)
            .any(|(_, handle)| handle.kind == kind)
    }

    /// Whether any handle will commit to the database.
    pub fn has_open_database(&self) -> bool {
        self.open
            .values()
            .any(|handle| handle.store == DataStore::Database)
    }
}

/// Block until `tracker` reports no open handle of `kind` registered at or
/// before `snapshot`, or `timeout` elapses. Returns the reacquired guard and
/// whether the handles drained.
///
/// The condvar must be notified whenever a handle deregisters. Waking every
/// `poll` as well bounds the delay of a missed notification.
pub fn wait_for_open_handles<'a, T>(
    condvar: &Condvar,
    mut guard: MutexGuard<'a, T>,
    tracker: impl Fn(&T) -> &HandleTracker,
    kind: RecordKind,
    snapshot: u64,
    timeout: Duration,
    poll: Duration,
) -> (MutexGuard<'a, T>, bool) {
    let deadline = Instant::now() + timeout;
    loop {
        if !tracker(&*guard).has_open_before(kind, snapshot) {
            return (guard, true);
        }
        let now = Instant::now();
        if now >= deadline {
            return (guard, false);
        }
        let slice = poll.min(deadline - now);
        guard = match condvar.wait_timeout(guard, slice) {
            Ok((guard, _)) => guard,
            Err(poisoned) => poisoned.into_inner().0,
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use std::thread;

    #[test]
    fn test_register_is_monotonic() {
        let mut tracker = HandleTracker::new();
        let a = tracker.register(RecordKind::History, DataStore::Memory);
        let b = tracker.register(RecordKind::History, DataStore::Database);
        tracker.deregister(a);
        let c = tracker.register(RecordKind::Discovery, DataStore::Memory);
        assert!(a < b && b < c);
        assert!(!tracker.has_open_before(RecordKind::History, a));
        assert!(tracker.has_open_before(RecordKind::History, b));
        assert!(tracker.has_open_before(RecordKind::Discovery, c));
    }

    #[test]
    fn test_snapshot_bounds_the_wait_set() {
        let mut tracker = HandleTracker::new();
        let early = tracker.register(RecordKind::History, DataStore::Database);
        let snapshot = tracker.snapshot();
        tracker.register(RecordKind::History, DataStore::Database);

        assert!(tracker.has_open_before(RecordKind::History, snapshot));
        assert!(!tracker.has_open_before(RecordKind::Discovery, snapshot));
        tracker.deregister(early);
        assert!(!tracker.has_open_before(RecordKind::History, snapshot));
    }

    #[test]
    fn test_reroute_changes_database_flag() {
        let mut tracker = HandleTracker::new();
        let id = tracker.register(RecordKind::AutoRegistration, DataStore::Memory);
        assert!(!tracker.has_open_database());
        tracker.reroute(id, DataStore::Database);
        assert!(tracker.has_open_database());
    }

    #[test]
    fn test_wait_times_out() {
        let lock = Mutex::new(HandleTracker::new());
        let condvar = Condvar::new();
        let snapshot = {
            let mut tracker = lock.lock().unwrap();
            tracker.register(RecordKind::History, DataStore::Database);
            tracker.snapshot()
        };

        let start = Instant::now();
        let (_guard, drained) = wait_for_open_handles(
            &condvar,
            lock.lock().unwrap(),
            |t| t,
            RecordKind::History,
            snapshot,
            Duration::from_millis(30),
            Duration::from_millis(5),
        );
        assert!(!drained);
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn test_wait_wakes_on_deregister() {
        let shared = Arc::new((Mutex::new(HandleTracker::new()), Condvar::new()));
        let (id, snapshot) = {
            let mut tracker = shared.0.lock().unwrap();
            let id = tracker.register(RecordKind::History, DataStore::Database);
            (id, tracker.snapshot())
        };

        let closer = {
            let shared = Arc::clone(&shared);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                shared.0.lock().unwrap().deregister(id);
                shared.1.notify_all();
            })
        };

        let (_guard, drained) = wait_for_open_handles(
            &shared.1,
            shared.0.lock().unwrap(),
            |t| t,
            RecordKind::History,
            snapshot,
            Duration::from_secs(5),
            Duration::from_millis(100),
        );
        assert!(drained);
        closer.join().unwrap();
    }
}
