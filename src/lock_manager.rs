//! Page-level locks for strict two-phase locking.

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::errors::{DbError, DbResult};
use crate::page::PageId;
use crate::transaction::TransactionId;

/// The permission a transaction requests on a page. READ_ONLY maps to a
/// shared lock, READ_WRITE to an exclusive lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Permissions {
    ReadOnly,
    ReadWrite,
}

/// Sleep between failed acquisition attempts.
const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(10);
/// Run the deadlock probe on every N-th failed attempt.
const DEADLOCK_CHECK_PERIOD: u32 = 10;

/// Lock state of a single page: the granted mode and its holders.
/// Invariants: exclusive implies exactly one holder; no holders implies no
/// granted mode.
#[derive(Debug, Default)]
struct TransactionLock {
    perm: Option<Permissions>,
    holders: HashSet<TransactionId>,
}

impl TransactionLock {
    fn try_acquire(&mut self, tid: TransactionId, perm: Permissions) -> bool {
        if self.holders.is_empty() {
            self.perm = Some(perm);
            self.holders.insert(tid);
            return true;
        }
        match (perm, self.perm.expect("held lock must have a mode")) {
            (Permissions::ReadOnly, Permissions::ReadOnly) => {
                self.holders.insert(tid);
                true
            }
            // Re-entrant read under the transaction's own write lock.
            (Permissions::ReadOnly, Permissions::ReadWrite) => self.holders.contains(&tid),
            // Upgrade, granted only to a sole holder.
            (Permissions::ReadWrite, Permissions::ReadOnly) => {
                if self.holders.len() == 1 && self.holders.contains(&tid) {
                    self.perm = Some(Permissions::ReadWrite);
                    true
                } else {
                    false
                }
            }
            (Permissions::ReadWrite, Permissions::ReadWrite) => {
                self.holders.len() == 1 && self.holders.contains(&tid)
            }
        }
    }

    fn release(&mut self, tid: TransactionId) {
        self.holders.remove(&tid);
        if self.holders.is_empty() {
            self.perm = None;
        }
    }

    fn holds(&self, tid: TransactionId) -> bool {
        self.holders.contains(&tid)
    }
}

/// The lock manager: per-page lock state plus the set of pages each
/// transaction is currently blocked on, from which the waits-for graph is
/// derived on demand.
#[derive(Debug, Default)]
pub struct LockManager {
    locks: Mutex<HashMap<PageId, Arc<Mutex<TransactionLock>>>>,
    wants: Mutex<HashMap<TransactionId, HashSet<PageId>>>,
}

impl LockManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Blocks until `perm` is granted on `pid` for `tid`, polling with a
    /// short sleep. Fails with `TransactionAborted` when the periodic probe
    /// finds a deadlock involving `tid`.
    pub fn lock_page(
        &self,
        pid: PageId,
        tid: TransactionId,
        perm: Permissions,
    ) -> DbResult<()> {
        let lock = {
            let mut locks = self.locks.lock();
            locks.entry(pid).or_default().clone()
        };
        self.wants.lock().entry(tid).or_default().insert(pid);

        let mut tries: u32 = 0;
        loop {
            if lock.lock().try_acquire(tid, perm) {
                break;
            }
            thread::sleep(LOCK_RETRY_INTERVAL);
            tries += 1;
            if tries % DEADLOCK_CHECK_PERIOD == 0 && self.finds_deadlock(tid) {
                crate::regolith_debug_log!(
                    "[LockManager::lock_page] deadlock: aborting {} waiting on {:?}",
                    tid,
                    pid
                );
                self.clear_want(tid, pid);
                return Err(DbError::TransactionAborted);
            }
        }

        self.clear_want(tid, pid);
        Ok(())
    }

    /// Drops `tid` from the page's holders. No flush, no queue hand-off;
    /// waiters discover the release on their next poll.
    pub fn release_page(&self, pid: PageId, tid: TransactionId) {
        let lock = {
            let locks = self.locks.lock();
            locks.get(&pid).cloned()
        };
        if let Some(lock) = lock {
            lock.lock().release(tid);
        }
    }

    pub fn holds_lock(&self, pid: PageId, tid: TransactionId) -> bool {
        let lock = {
            let locks = self.locks.lock();
            locks.get(&pid).cloned()
        };
        match lock {
            Some(lock) => lock.lock().holds(tid),
            None => false,
        }
    }

    /// Removes `tid` from every page it holds. Idempotent.
    pub fn release_all_locks(&self, tid: TransactionId) {
        let entries: Vec<Arc<Mutex<TransactionLock>>> = {
            let locks = self.locks.lock();
            locks.values().cloned().collect()
        };
        for lock in entries {
            lock.lock().release(tid);
        }
        self.wants.lock().remove(&tid);
    }

    fn clear_want(&self, tid: TransactionId, pid: PageId) {
        let mut wants = self.wants.lock();
        if let Some(set) = wants.get_mut(&tid) {
            set.remove(&pid);
            if set.is_empty() {
                wants.remove(&tid);
            }
        }
    }

    /// Conservative deadlock probe for `tid`: walk the waits-for frontier
    /// derived from (wants, holders) and report a hit as soon as any page
    /// reachable through other waiters is one `tid` itself holds. The
    /// visited set bounds the walk when a cycle excludes `tid`.
    fn finds_deadlock(&self, tid: TransactionId) -> bool {
        let entries: Vec<(PageId, Arc<Mutex<TransactionLock>>)> = {
            let locks = self.locks.lock();
            locks.iter().map(|(pid, l)| (*pid, l.clone())).collect()
        };
        let mut holders: HashMap<PageId, HashSet<TransactionId>> = HashMap::new();
        let mut mine: HashSet<PageId> = HashSet::new();
        for (pid, lock) in &entries {
            let guard = lock.lock();
            if guard.holds(tid) {
                mine.insert(*pid);
            }
            holders.insert(*pid, guard.holders.clone());
        }
        let wants: HashMap<TransactionId, HashSet<PageId>> = self.wants.lock().clone();

        let mut frontier: HashSet<PageId> = wants.get(&tid).cloned().unwrap_or_default();
        let mut visited: HashSet<TransactionId> = HashSet::from([tid]);

        while !frontier.is_empty() {
            let mut owners: HashSet<TransactionId> = HashSet::new();
            for pid in &frontier {
                if let Some(hs) = holders.get(pid) {
                    owners.extend(hs.iter().copied());
                }
            }
            owners.retain(|t| !visited.contains(t));
            if owners.is_empty() {
                break;
            }

            let mut next: HashSet<PageId> = HashSet::new();
            for owner in &owners {
                if let Some(pages) = wants.get(owner) {
                    next.extend(pages.iter().copied());
                }
            }
            if next.iter().any(|p| mine.contains(p)) {
                return true;
            }
            visited.extend(owners);
            frontier = next;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::PageKind;

    fn pid(n: u32) -> PageId {
        PageId::new(1, n, PageKind::Heap)
    }

    #[test]
    fn shared_locks_coexist() {
        let lm = LockManager::new();
        let t1 = TransactionId::new();
        let t2 = TransactionId::new();
        lm.lock_page(pid(0), t1, Permissions::ReadOnly).unwrap();
        lm.lock_page(pid(0), t2, Permissions::ReadOnly).unwrap();
        assert!(lm.holds_lock(pid(0), t1));
        assert!(lm.holds_lock(pid(0), t2));
    }

    #[test]
    fn sole_reader_upgrades() {
        let lm = LockManager::new();
        let t1 = TransactionId::new();
        lm.lock_page(pid(0), t1, Permissions::ReadOnly).unwrap();
        lm.lock_page(pid(0), t1, Permissions::ReadWrite).unwrap();
        assert!(lm.holds_lock(pid(0), t1));
    }

    #[test]
    fn writer_rereads_its_own_page() {
        let lm = LockManager::new();
        let t1 = TransactionId::new();
        lm.lock_page(pid(0), t1, Permissions::ReadWrite).unwrap();
        lm.lock_page(pid(0), t1, Permissions::ReadOnly).unwrap();
        lm.lock_page(pid(0), t1, Permissions::ReadWrite).unwrap();
    }

    #[test]
    fn release_all_is_idempotent() {
        let lm = LockManager::new();
        let t1 = TransactionId::new();
        lm.lock_page(pid(0), t1, Permissions::ReadWrite).unwrap();
        lm.lock_page(pid(1), t1, Permissions::ReadOnly).unwrap();
        lm.release_all_locks(t1);
        lm.release_all_locks(t1);
        assert!(!lm.holds_lock(pid(0), t1));
        assert!(!lm.holds_lock(pid(1), t1));
    }

    #[test]
    fn released_write_lock_is_grantable() {
        let lm = LockManager::new();
        let t1 = TransactionId::new();
        let t2 = TransactionId::new();
        lm.lock_page(pid(0), t1, Permissions::ReadWrite).unwrap();
        lm.release_page(pid(0), t1);
        lm.lock_page(pid(0), t2, Permissions::ReadWrite).unwrap();
        assert!(lm.holds_lock(pid(0), t2));
        assert!(!lm.holds_lock(pid(0), t1));
    }

    #[test]
    fn upgrade_deadlock_aborts_a_waiter() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::{Arc, Barrier};

        let lm = Arc::new(LockManager::new());
        let aborted = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(2));

        let mut handles = Vec::new();
        for _ in 0..2 {
            let lm = lm.clone();
            let aborted = aborted.clone();
            let barrier = barrier.clone();
            handles.push(thread::spawn(move || {
                let tid = TransactionId::new();
                lm.lock_page(pid(0), tid, Permissions::ReadOnly).unwrap();
                barrier.wait();
                match lm.lock_page(pid(0), tid, Permissions::ReadWrite) {
                    Ok(()) => {}
                    Err(DbError::TransactionAborted) => {
                        aborted.fetch_add(1, Ordering::SeqCst);
                        lm.release_all_locks(tid);
                    }
                    Err(e) => panic!("unexpected error: {}", e),
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert!(aborted.load(Ordering::SeqCst) >= 1);
    }
}
