//! The buffer pool: a bounded cache of pages with clock replacement,
//! gated by the lock manager. The pool never evicts a dirty page
//! (NO-STEAL) and flushes a transaction's dirty pages at commit (FORCE).

use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::database::Database;
use crate::errors::{DbError, DbResult};
use crate::lock_manager::{LockManager, Permissions};
use crate::page::{PageHandle, PageId};
use crate::transaction::TransactionId;
use crate::tuple::Tuple;

/// Bytes per page, including the header.
pub const DEFAULT_PAGE_SIZE: usize = 4096;

/// Default page capacity for pools whose caller has no opinion.
pub const DEFAULT_PAGES: usize = 50;

static PAGE_SIZE: AtomicUsize = AtomicUsize::new(DEFAULT_PAGE_SIZE);

pub fn page_size() -> usize {
    PAGE_SIZE.load(Ordering::SeqCst)
}

/// Overrides the process-wide page size. ONLY FOR TESTING.
pub fn set_page_size(size: usize) {
    PAGE_SIZE.store(size, Ordering::SeqCst);
}

/// Restores the default page size. ONLY FOR TESTING.
pub fn reset_page_size() {
    PAGE_SIZE.store(DEFAULT_PAGE_SIZE, Ordering::SeqCst);
}

#[derive(Debug)]
struct ClockSlot {
    pid: PageId,
    referenced: bool,
}

struct PoolState {
    pages: HashMap<PageId, PageHandle>,
    clock: Vec<Option<ClockSlot>>,
    clock_index: usize,
}

impl PoolState {
    fn advance(&mut self) {
        self.clock_index = (self.clock_index + 1) % self.clock.len();
    }

    /// Installs a clock slot for a newly cached page. The hand normally
    /// rests on an empty slot after an eviction or discard; scan forward to
    /// one otherwise so every cached page keeps exactly one slot.
    fn install_clock_slot(&mut self, pid: PageId) {
        for _ in 0..self.clock.len() {
            if self.clock[self.clock_index].is_none() {
                self.clock[self.clock_index] = Some(ClockSlot {
                    pid,
                    referenced: true,
                });
                self.advance();
                return;
            }
            self.advance();
        }
        unreachable!("pool admitted a page with no free clock slot");
    }
}

/// The buffer pool manager.
pub struct BufferPool {
    capacity: usize,
    lock_manager: LockManager,
    state: Mutex<PoolState>,
}

impl BufferPool {
    /// Creates a pool that caches up to `capacity` pages.
    pub fn new(capacity: usize) -> Self {
        let clock = (0..capacity).map(|_| None).collect();
        BufferPool {
            capacity,
            lock_manager: LockManager::new(),
            state: Mutex::new(PoolState {
                pages: HashMap::new(),
                clock,
                clock_index: 0,
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Retrieves the page under the requested permission. Acquires the page
    /// lock first (blocking, possibly aborting on deadlock), then serves
    /// the cached copy or loads it from its DbFile, evicting if the pool is
    /// full.
    pub fn get_page(
        &self,
        db: &Database,
        tid: TransactionId,
        pid: PageId,
        perm: Permissions,
    ) -> DbResult<PageHandle> {
        // Lock acquisition happens before the pool monitor so a blocked
        // waiter never holds up unrelated pool traffic.
        self.lock_manager.lock_page(pid, tid, perm)?;

        let mut state = self.state.lock();
        if let Some(handle) = state.pages.get(&pid) {
            return Ok(handle.clone());
        }

        let file = db.catalog().db_file(pid.table_id)?;
        let page = file.read_page(pid)?;
        if state.pages.len() >= self.capacity {
            self.evict_page(db, &mut state)?;
        }
        let handle: PageHandle = Arc::new(RwLock::new(page));
        state.pages.insert(pid, handle.clone());
        state.install_clock_slot(pid);
        Ok(handle)
    }

    /// Releases the lock on one page immediately, with no flush. Breaking
    /// two-phase locking this way is only sound for pages the caller knows
    /// carry no uncommitted state it depends on.
    pub fn unsafe_release_page(&self, tid: TransactionId, pid: PageId) {
        self.lock_manager.release_page(pid, tid);
    }

    pub fn holds_lock(&self, tid: TransactionId, pid: PageId) -> bool {
        self.lock_manager.holds_lock(pid, tid)
    }

    /// Commits or aborts the transaction: flush-or-restore exactly the
    /// pages it dirtied, write the log outcome record, then release every
    /// lock it holds. Locks are released even when the flush fails.
    pub fn transaction_complete(
        &self,
        db: &Database,
        tid: TransactionId,
        commit: bool,
    ) -> DbResult<()> {
        let result = (|| -> DbResult<()> {
            if commit {
                self.flush_pages(db, tid)?;
                db.log().lock().log_commit(tid)?;
            } else {
                self.restore_pages(db, tid)?;
                db.log().lock().log_abort(tid)?;
            }
            Ok(())
        })();
        self.lock_manager.release_all_locks(tid);
        result
    }

    /// Adds a tuple to the table on behalf of `tid`. Every page the DbFile
    /// dirtied is marked dirty and re-cached, evicting first when the pool
    /// is full and the page is not yet resident.
    pub fn insert_tuple(
        &self,
        db: &Database,
        tid: TransactionId,
        table_id: u32,
        t: Tuple,
    ) -> DbResult<()> {
        let file = db.catalog().db_file(table_id)?;
        let dirtied = file.insert_tuple(db, tid, t)?;
        self.cache_dirtied(db, tid, dirtied)
    }

    /// Removes the tuple named by its record id on behalf of `tid`.
    pub fn delete_tuple(&self, db: &Database, tid: TransactionId, t: &Tuple) -> DbResult<()> {
        let rid = t.record_id().ok_or_else(|| {
            DbError::Db("cannot delete a tuple with no record id".to_string())
        })?;
        let file = db.catalog().db_file(rid.pid.table_id)?;
        let dirtied = file.delete_tuple(db, tid, t)?;
        self.cache_dirtied(db, tid, dirtied)
    }

    fn cache_dirtied(
        &self,
        db: &Database,
        tid: TransactionId,
        dirtied: Vec<PageHandle>,
    ) -> DbResult<()> {
        for handle in dirtied {
            let pid = handle.read().id();
            let mut state = self.state.lock();
            if !state.pages.contains_key(&pid) && state.pages.len() >= self.capacity {
                self.evict_page(db, &mut state)?;
            }
            handle.write().mark_dirty(Some(tid));
            let replaced = state.pages.insert(pid, handle.clone());
            if replaced.is_none() {
                state.install_clock_slot(pid);
            }
        }
        Ok(())
    }

    /// Flushes every dirty page. FOR TESTING; defeats NO-STEAL when a
    /// transaction is still open.
    pub fn flush_all_pages(&self, db: &Database) -> DbResult<()> {
        let entries: Vec<PageHandle> = {
            let state = self.state.lock();
            state.pages.values().cloned().collect()
        };
        for handle in entries {
            self.flush_entry(db, &handle)?;
        }
        Ok(())
    }

    /// Drops the page from the cache and its clock slot without writing.
    /// Used on rollback and by the B+ tree when a freed page is re-used.
    pub fn discard_page(&self, pid: PageId) {
        let mut state = self.state.lock();
        state.pages.remove(&pid);
        for i in 0..state.clock.len() {
            if state.clock[i].as_ref().map(|s| s.pid) == Some(pid) {
                state.clock[i] = None;
                state.clock_index = i;
                break;
            }
        }
    }

    /// Flushes one page if it is cached and dirty.
    pub fn flush_page(&self, db: &Database, pid: PageId) -> DbResult<()> {
        let handle = {
            let state = self.state.lock();
            state.pages.get(&pid).cloned()
        };
        match handle {
            Some(handle) => self.flush_entry(db, &handle),
            None => Ok(()),
        }
    }

    /// Writes every page dirtied by `tid` to disk, logging first.
    pub fn flush_pages(&self, db: &Database, tid: TransactionId) -> DbResult<()> {
        let entries: Vec<PageHandle> = {
            let state = self.state.lock();
            state.pages.values().cloned().collect()
        };
        for handle in entries {
            if handle.read().is_dirty() == Some(tid) {
                self.flush_entry(db, &handle)?;
            }
        }
        Ok(())
    }

    /// Replaces every page dirtied by `tid` with its on-disk image. Sound
    /// only under NO-STEAL: eviction never wrote those pages, so disk still
    /// holds the pre-modification state.
    pub fn restore_pages(&self, db: &Database, tid: TransactionId) -> DbResult<()> {
        let entries: Vec<(PageId, PageHandle)> = {
            let state = self.state.lock();
            state.pages.iter().map(|(p, h)| (*p, h.clone())).collect()
        };
        for (pid, handle) in entries {
            if handle.read().is_dirty() == Some(tid) {
                let file = db.catalog().db_file(pid.table_id)?;
                let fresh = file.read_page(pid)?;
                *handle.write() = fresh;
            }
        }
        Ok(())
    }

    /// Logs the before/after pair, forces the log, writes the page, clears
    /// the dirty flag and refreshes the before-image.
    fn flush_entry(&self, db: &Database, handle: &PageHandle) -> DbResult<()> {
        let (tid, pid, before, after) = {
            let page = handle.read();
            match page.is_dirty() {
                Some(tid) => (tid, page.id(), page.before_image_data(), page.page_data()),
                None => return Ok(()),
            }
        };
        {
            let mut log = db.log().lock();
            log.log_write(tid, pid, &before, &after)?;
            log.force()?;
        }
        let file = db.catalog().db_file(pid.table_id)?;
        {
            let page = handle.read();
            file.write_page(&page)?;
        }
        let mut page = handle.write();
        page.mark_dirty(None);
        page.set_before_image();
        Ok(())
    }

    /// Clock sweep: skip dirty pages (NO-STEAL), clear set reference bits,
    /// evict the first unreferenced clean page. Leaves the hand on the
    /// freed slot. Fails when every resident page is dirty.
    fn evict_page(&self, db: &Database, state: &mut PoolState) -> DbResult<()> {
        let mut seen_dirty: HashSet<PageId> = HashSet::new();
        loop {
            let (pid, referenced) = match &state.clock[state.clock_index] {
                None => return Ok(()),
                Some(slot) => (slot.pid, slot.referenced),
            };
            let dirty = state
                .pages
                .get(&pid)
                .map(|h| h.read().is_dirty().is_some())
                .unwrap_or(false);
            if dirty {
                seen_dirty.insert(pid);
                if state.pages.keys().all(|p| seen_dirty.contains(p)) {
                    return Err(DbError::Db("All dirty pages".to_string()));
                }
                state.advance();
                continue;
            }
            if referenced {
                if let Some(slot) = state.clock[state.clock_index].as_mut() {
                    slot.referenced = false;
                }
                state.advance();
                continue;
            }
            // Clean and unreferenced: flush (a no-op for clean pages) and
            // evict. I/O failures surface as logical errors here.
            if let Some(handle) = state.pages.get(&pid).cloned() {
                self.flush_entry(db, &handle)
                    .map_err(|e| DbError::Db(format!("failed to flush victim page: {}", e)))?;
            }
            state.pages.remove(&pid);
            state.clock[state.clock_index] = None;
            return Ok(());
        }
    }

    #[cfg(test)]
    pub(crate) fn cached_pages(&self) -> Vec<PageId> {
        self.state.lock().pages.keys().copied().collect()
    }

    /// Checks the cache/clock bijection. FOR TESTING.
    pub fn assert_clock_invariant(&self) {
        let state = self.state.lock();
        assert!(state.pages.len() <= self.capacity);
        let slot_pids: Vec<PageId> = state
            .clock
            .iter()
            .flatten()
            .map(|slot| slot.pid)
            .collect();
        assert_eq!(slot_pids.len(), state.pages.len());
        for pid in &slot_pids {
            assert!(state.pages.contains_key(pid));
        }
    }
}
