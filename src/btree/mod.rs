//! The B+ tree index file: a root-pointer page at offset 0, then internal,
//! leaf and header pages. Leaves hold tuples in key order and form a
//! doubly linked list; internal entries carry (key, left child, right
//! child); header-page bitmaps track which page numbers are free for
//! reuse.
//!
//! Structural modifications thread an explicit dirty-page map through the
//! call chains so repeated reads of a page within one logical operation
//! observe its pending in-memory updates.

pub mod page;

use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::buffer_pool::page_size;
use crate::database::Database;
use crate::dbfile::{table_id_for_path, DbFile, DbFileIterator};
use crate::errors::{DbError, DbResult};
use crate::lock_manager::Permissions;
use crate::page::{Page, PageHandle, PageId, PageKind};
use crate::transaction::TransactionId;
use crate::tuple::{Field, IndexPredicate, Op, Tuple, TupleDesc};

use self::page::{
    header_num_slots, BTreeEntry, BTreeHeaderPage, BTreeInternalPage, BTreeLeafPage,
    BTreeRootPtrPage, ROOT_PTR_PAGE_SIZE,
};

type DirtyMap = HashMap<PageId, PageHandle>;

/// A DbFile storing a B+ tree keyed on one field of its tuples.
pub struct BTreeFile {
    file: Mutex<File>,
    path: PathBuf,
    table_id: u32,
    key_field: usize,
    td: TupleDesc,
}

/// Fetches a page, consulting the operation-local dirty map first. Pages
/// fetched with write permission are recorded there, since the caller is
/// about to mutate them.
fn get_page(
    db: &Database,
    tid: TransactionId,
    dirty: &mut DirtyMap,
    pid: PageId,
    perm: Permissions,
) -> DbResult<PageHandle> {
    if let Some(handle) = dirty.get(&pid) {
        return Ok(handle.clone());
    }
    let handle = db.buffer_pool().get_page(db, tid, pid, perm)?;
    if perm == Permissions::ReadWrite {
        dirty.insert(pid, handle.clone());
    }
    Ok(handle)
}

/// Descends from `pid` to the left-most leaf that may contain `field`,
/// read-locking interior pages and taking `perm` on the leaf. A `None`
/// field always descends leftmost, for the full-scan iterator.
fn find_leaf_page(
    db: &Database,
    tid: TransactionId,
    dirty: &mut DirtyMap,
    mut pid: PageId,
    perm: Permissions,
    field: Option<&Field>,
) -> DbResult<PageHandle> {
    while pid.kind != PageKind::BTreeLeaf {
        let handle = get_page(db, tid, dirty, pid, Permissions::ReadOnly)?;
        let entries = {
            let guard = handle.read();
            guard.as_internal()?.entries()
        };
        if entries.is_empty() {
            return Err(DbError::Db(format!(
                "internal page {:?} has no entries",
                pid
            )));
        }
        let mut next = None;
        for (i, e) in entries.iter().enumerate() {
            match field {
                None => {
                    next = Some(e.left_child());
                    break;
                }
                Some(f) => {
                    if f.compare(Op::LessThanOrEq, e.key()) {
                        next = Some(e.left_child());
                        break;
                    }
                    if i == entries.len() - 1 {
                        next = Some(e.right_child());
                    }
                }
            }
        }
        pid = next.expect("non-empty entry list always picks a child");
    }
    get_page(db, tid, dirty, pid, perm)
}

fn parent_id_of(page: &Page) -> DbResult<PageId> {
    match page {
        Page::Leaf(p) => Ok(p.parent_id()),
        Page::Internal(p) => Ok(p.parent_id()),
        other => Err(DbError::Db(format!(
            "page {:?} has no parent pointer",
            other.id()
        ))),
    }
}

fn set_parent_id_of(page: &mut Page, parent: PageId) -> DbResult<()> {
    match page {
        Page::Leaf(p) => p.set_parent_id(parent),
        Page::Internal(p) => p.set_parent_id(parent),
        other => Err(DbError::Db(format!(
            "page {:?} has no parent pointer",
            other.id()
        ))),
    }
}

impl BTreeFile {
    pub fn open<P: AsRef<Path>>(path: P, key_field: usize, td: TupleDesc) -> DbResult<Self> {
        let path_buf = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path_buf)?;
        let table_id = table_id_for_path(&path_buf);
        crate::regolith_debug_log!(
            "[BTreeFile::open] {:?} as table {}, keyed on field {}",
            path_buf,
            table_id,
            key_field
        );
        Ok(BTreeFile {
            file: Mutex::new(file),
            path: path_buf,
            table_id,
            key_field,
            td,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The index of the field this tree is keyed on.
    pub fn key_field(&self) -> usize {
        self.key_field
    }

    fn data_page_offset(page_no: u32) -> u64 {
        ROOT_PTR_PAGE_SIZE as u64 + (page_no as u64 - 1) * page_size() as u64
    }

    /// Reads the root-pointer page, creating the file's initial contents
    /// (root pointer plus one empty leaf) on first use.
    fn get_root_ptr_page(
        &self,
        db: &Database,
        tid: TransactionId,
        dirty: &mut DirtyMap,
    ) -> DbResult<PageHandle> {
        {
            let mut file = self.file.lock();
            if file.metadata()?.len() == 0 {
                file.seek(SeekFrom::Start(0))?;
                file.write_all(&BTreeRootPtrPage::empty_data())?;
                file.write_all(&vec![0u8; page_size()])?;
            }
        }
        get_page(
            db,
            tid,
            dirty,
            PageId::root_ptr(self.table_id),
            Permissions::ReadOnly,
        )
    }

    /// Splits a full leaf, copying the boundary key up into the parent.
    /// Returns the half into which a tuple keyed `field` belongs.
    fn split_leaf_page(
        &self,
        db: &Database,
        tid: TransactionId,
        dirty: &mut DirtyMap,
        page: PageHandle,
        field: &Field,
    ) -> DbResult<PageHandle> {
        let new_page = self.get_empty_page(db, tid, dirty, PageKind::BTreeLeaf)?;
        let (page_id, new_id) = (page.read().id(), new_page.read().id());

        // Move the upper half to the new (right-hand) page.
        let moved: Vec<Tuple> = {
            let guard = page.read();
            let leaf = guard.as_leaf()?;
            leaf.riter().take(leaf.num_tuples() / 2).cloned().collect()
        };
        for t in &moved {
            page.write().as_leaf_mut()?.delete_tuple(t)?;
            new_page.write().as_leaf_mut()?.insert_tuple(t.clone())?;
        }

        // The first key of the right-hand page is copied up.
        let key = {
            let guard = new_page.read();
            let leaf = guard.as_leaf()?;
            let x = leaf
                .iter()
                .next()
                .ok_or_else(|| DbError::Db("split moved no tuples".to_string()))?
                .field(self.key_field)
                .clone();
            x
        };
        let parent_id = page.read().as_leaf()?.parent_id();
        let parent = self.get_parent_with_empty_slots(db, tid, dirty, parent_id, &key)?;
        let entry = BTreeEntry::new(key.clone(), page_id, new_id);
        parent.write().as_internal_mut()?.insert_entry(&entry)?;
        self.update_parent_pointers(db, tid, dirty, &parent)?;

        // Splice the new page into the sibling list.
        let old_right = page.read().as_leaf()?.right_sibling_id();
        if let Some(right_id) = old_right {
            let next = get_page(db, tid, dirty, right_id, Permissions::ReadWrite)?;
            next.write().as_leaf_mut()?.set_left_sibling_id(Some(new_id))?;
        }
        {
            let mut guard = new_page.write();
            let leaf = guard.as_leaf_mut()?;
            leaf.set_right_sibling_id(old_right)?;
            leaf.set_left_sibling_id(Some(page_id))?;
        }
        page.write().as_leaf_mut()?.set_right_sibling_id(Some(new_id))?;

        if field.compare(Op::LessThan, &key) {
            Ok(page)
        } else {
            Ok(new_page)
        }
    }

    /// Splits a full internal page, pushing the boundary key up into the
    /// parent. Returns the half into which an entry keyed `field` belongs.
    fn split_internal_page(
        &self,
        db: &Database,
        tid: TransactionId,
        dirty: &mut DirtyMap,
        page: PageHandle,
        field: &Field,
    ) -> DbResult<PageHandle> {
        let new_page = self.get_empty_page(db, tid, dirty, PageKind::BTreeInternal)?;
        let (page_id, new_id) = (page.read().id(), new_page.read().id());

        let reversed: Vec<BTreeEntry> = {
            let guard = page.read();
            let internal = guard.as_internal()?;
            internal.entries().into_iter().rev().collect()
        };
        let mid = reversed.len() / 2;
        for e in reversed.iter().take(mid) {
            page.write().as_internal_mut()?.delete_key_and_right_child(e)?;
            new_page.write().as_internal_mut()?.insert_entry(e)?;
        }

        // The next entry off the reverse iterator is pushed up: removed
        // from the child and rewritten to point at the two halves.
        let mut pushed = reversed[mid].clone();
        page.write()
            .as_internal_mut()?
            .delete_key_and_right_child(&pushed)?;
        pushed.set_left_child(page_id);
        pushed.set_right_child(new_id);
        pushed.set_record_id(None);

        let parent_id = page.read().as_internal()?.parent_id();
        let parent =
            self.get_parent_with_empty_slots(db, tid, dirty, parent_id, pushed.key())?;
        parent.write().as_internal_mut()?.insert_entry(&pushed)?;
        self.update_parent_pointers(db, tid, dirty, &parent)?;
        self.update_parent_pointers(db, tid, dirty, &new_page)?;

        if field.compare(Op::LessThan, pushed.key()) {
            Ok(page)
        } else {
            Ok(new_page)
        }
    }

    /// Returns a parent page guaranteed to have an empty slot, creating a
    /// new root when the page was the root, and splitting a full parent.
    /// `field` must be the key the eventual insert will use, so the split
    /// hands back the correct half.
    fn get_parent_with_empty_slots(
        &self,
        db: &Database,
        tid: TransactionId,
        dirty: &mut DirtyMap,
        parent_id: PageId,
        field: &Field,
    ) -> DbResult<PageHandle> {
        let parent = if parent_id.kind == PageKind::BTreeRootPtr {
            let parent = self.get_empty_page(db, tid, dirty, PageKind::BTreeInternal)?;
            let new_root_id = parent.read().id();

            let root_ptr = get_page(
                db,
                tid,
                dirty,
                PageId::root_ptr(self.table_id),
                Permissions::ReadWrite,
            )?;
            let prev_root_id = {
                let mut guard = root_ptr.write();
                let rp = guard.as_root_ptr_mut()?;
                let prev = rp.root_id().ok_or_else(|| {
                    DbError::Db("cannot grow a tree with no root".to_string())
                })?;
                rp.set_root_id(Some(new_root_id))?;
                prev
            };
            let prev_root = get_page(db, tid, dirty, prev_root_id, Permissions::ReadWrite)?;
            set_parent_id_of(&mut prev_root.write(), new_root_id)?;
            parent
        } else {
            get_page(db, tid, dirty, parent_id, Permissions::ReadWrite)?
        };

        let full = parent.read().as_internal()?.num_empty_slots() == 0;
        if full {
            self.split_internal_page(db, tid, dirty, parent, field)
        } else {
            Ok(parent)
        }
    }

    /// Points one child's parent pointer at `pid` if it does not already.
    fn update_parent_pointer(
        &self,
        db: &Database,
        tid: TransactionId,
        dirty: &mut DirtyMap,
        pid: PageId,
        child: PageId,
    ) -> DbResult<()> {
        let handle = get_page(db, tid, dirty, child, Permissions::ReadOnly)?;
        let current = parent_id_of(&handle.read())?;
        if current != pid {
            let handle = get_page(db, tid, dirty, child, Permissions::ReadWrite)?;
            set_parent_id_of(&mut handle.write(), pid)?;
        }
        Ok(())
    }

    /// Points every child of the internal page back at it.
    fn update_parent_pointers(
        &self,
        db: &Database,
        tid: TransactionId,
        dirty: &mut DirtyMap,
        page: &PageHandle,
    ) -> DbResult<()> {
        let (pid, children) = {
            let guard = page.read();
            let internal = guard.as_internal()?;
            (internal.id(), internal.child_ids())
        };
        for child in children {
            self.update_parent_pointer(db, tid, dirty, pid, child)?;
        }
        Ok(())
    }

    /// Rebalances a page that fell below minimum occupancy: steal from a
    /// sibling with tuples to spare, else merge. Siblings are found
    /// through the parent so both halves share it.
    fn handle_min_occupancy_page(
        &self,
        db: &Database,
        tid: TransactionId,
        dirty: &mut DirtyMap,
        page: PageHandle,
    ) -> DbResult<()> {
        let (page_id, parent_id) = {
            let guard = page.read();
            (guard.id(), parent_id_of(&guard)?)
        };

        let mut parent = None;
        let mut left_entry = None;
        let mut right_entry = None;
        if parent_id.kind != PageKind::BTreeRootPtr {
            let handle = get_page(db, tid, dirty, parent_id, Permissions::ReadWrite)?;
            let entries = handle.read().as_internal()?.entries();
            for e in entries {
                if e.left_child() == page_id {
                    right_entry = Some(e);
                    break;
                } else if e.right_child() == page_id {
                    left_entry = Some(e);
                }
            }
            parent = Some(handle);
        }

        match page_id.kind {
            PageKind::BTreeLeaf => self.handle_min_occupancy_leaf_page(
                db,
                tid,
                dirty,
                page,
                parent,
                left_entry,
                right_entry,
            ),
            PageKind::BTreeInternal => self.handle_min_occupancy_internal_page(
                db,
                tid,
                dirty,
                page,
                parent,
                left_entry,
                right_entry,
            ),
            _ => Err(DbError::Db(format!(
                "page {:?} does not participate in rebalancing",
                page_id
            ))),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn handle_min_occupancy_leaf_page(
        &self,
        db: &Database,
        tid: TransactionId,
        dirty: &mut DirtyMap,
        page: PageHandle,
        parent: Option<PageHandle>,
        left_entry: Option<BTreeEntry>,
        right_entry: Option<BTreeEntry>,
    ) -> DbResult<()> {
        let max_tuples = page.read().as_leaf()?.max_tuples();
        let max_empty = max_tuples - max_tuples / 2;

        if let Some(entry) = left_entry {
            let sibling = get_page(db, tid, dirty, entry.left_child(), Permissions::ReadWrite)?;
            let parent = parent.expect("a page with a sibling entry has a parent");
            let at_minimum = sibling.read().as_leaf()?.num_empty_slots() >= max_empty;
            if at_minimum {
                self.merge_leaf_pages(db, tid, dirty, sibling, page, parent, entry)
            } else {
                self.steal_from_leaf_page(&page, &sibling, &parent, entry, false)
            }
        } else if let Some(entry) = right_entry {
            let sibling = get_page(db, tid, dirty, entry.right_child(), Permissions::ReadWrite)?;
            let parent = parent.expect("a page with a sibling entry has a parent");
            let at_minimum = sibling.read().as_leaf()?.num_empty_slots() >= max_empty;
            if at_minimum {
                self.merge_leaf_pages(db, tid, dirty, page, sibling, parent, entry)
            } else {
                self.steal_from_leaf_page(&page, &sibling, &parent, entry, true)
            }
        } else {
            // The root: exempt from minimum occupancy.
            Ok(())
        }
    }

    /// Evens out tuples between a leaf and a sibling with room to spare,
    /// updating the parent entry's key to the new boundary.
    fn steal_from_leaf_page(
        &self,
        page: &PageHandle,
        sibling: &PageHandle,
        parent: &PageHandle,
        mut entry: BTreeEntry,
        is_right_sibling: bool,
    ) -> DbResult<()> {
        let moved: Vec<Tuple> = {
            let guard = sibling.read();
            let leaf = guard.as_leaf()?;
            let steal = leaf
                .num_tuples()
                .saturating_sub(page.read().as_leaf()?.num_tuples())
                / 2;
            if is_right_sibling {
                leaf.iter().take(steal).cloned().collect()
            } else {
                leaf.riter().take(steal).cloned().collect()
            }
        };
        if moved.is_empty() {
            return Ok(());
        }
        for t in &moved {
            sibling.write().as_leaf_mut()?.delete_tuple(t)?;
            page.write().as_leaf_mut()?.insert_tuple(t.clone())?;
        }
        let boundary = moved[moved.len() - 1].field(self.key_field).clone();
        entry.set_key(boundary);
        parent.write().as_internal_mut()?.update_entry(&entry)?;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn handle_min_occupancy_internal_page(
        &self,
        db: &Database,
        tid: TransactionId,
        dirty: &mut DirtyMap,
        page: PageHandle,
        parent: Option<PageHandle>,
        left_entry: Option<BTreeEntry>,
        right_entry: Option<BTreeEntry>,
    ) -> DbResult<()> {
        let max_entries = page.read().as_internal()?.max_entries();
        let max_empty = max_entries - max_entries / 2;

        if let Some(entry) = left_entry {
            let sibling = get_page(db, tid, dirty, entry.left_child(), Permissions::ReadWrite)?;
            let parent = parent.expect("a page with a sibling entry has a parent");
            let at_minimum = sibling.read().as_internal()?.num_empty_slots() >= max_empty;
            if at_minimum {
                self.merge_internal_pages(db, tid, dirty, sibling, page, parent, entry)
            } else {
                self.steal_from_left_internal_page(db, tid, dirty, &page, &sibling, &parent, entry)
            }
        } else if let Some(entry) = right_entry {
            let sibling = get_page(db, tid, dirty, entry.right_child(), Permissions::ReadWrite)?;
            let parent = parent.expect("a page with a sibling entry has a parent");
            let at_minimum = sibling.read().as_internal()?.num_empty_slots() >= max_empty;
            if at_minimum {
                self.merge_internal_pages(db, tid, dirty, page, sibling, parent, entry)
            } else {
                self.steal_from_right_internal_page(db, tid, dirty, &page, &sibling, &parent, entry)
            }
        } else {
            Ok(())
        }
    }

    /// Rotates entries in from the left sibling: the parent key is pulled
    /// down as the new center entry and the last stolen key is pushed up
    /// to replace it.
    #[allow(clippy::too_many_arguments)]
    fn steal_from_left_internal_page(
        &self,
        db: &Database,
        tid: TransactionId,
        dirty: &mut DirtyMap,
        page: &PageHandle,
        left_sibling: &PageHandle,
        parent: &PageHandle,
        mut parent_entry: BTreeEntry,
    ) -> DbResult<()> {
        let moved: Vec<BTreeEntry> = {
            let guard = left_sibling.read();
            let sib = guard.as_internal()?;
            let steal = sib
                .num_entries()
                .saturating_sub(page.read().as_internal()?.num_entries())
                / 2;
            sib.entries().into_iter().rev().take(steal).collect()
        };
        if moved.is_empty() {
            return Ok(());
        }

        let first_child = {
            let guard = page.read();
            guard.as_internal()?.entries()[0].left_child()
        };
        let center = BTreeEntry::new(
            parent_entry.key().clone(),
            moved[0].right_child(),
            first_child,
        );
        page.write().as_internal_mut()?.insert_entry(&center)?;

        for e in moved.iter().take(moved.len() - 1) {
            left_sibling
                .write()
                .as_internal_mut()?
                .delete_key_and_right_child(e)?;
            page.write().as_internal_mut()?.insert_entry(e)?;
        }
        let last = &moved[moved.len() - 1];
        left_sibling
            .write()
            .as_internal_mut()?
            .delete_key_and_right_child(last)?;
        parent_entry.set_key(last.key().clone());
        parent.write().as_internal_mut()?.update_entry(&parent_entry)?;

        self.update_parent_pointers(db, tid, dirty, parent)?;
        self.update_parent_pointers(db, tid, dirty, left_sibling)?;
        self.update_parent_pointers(db, tid, dirty, page)?;
        Ok(())
    }

    /// Mirror image of `steal_from_left_internal_page`.
    #[allow(clippy::too_many_arguments)]
    fn steal_from_right_internal_page(
        &self,
        db: &Database,
        tid: TransactionId,
        dirty: &mut DirtyMap,
        page: &PageHandle,
        right_sibling: &PageHandle,
        parent: &PageHandle,
        mut parent_entry: BTreeEntry,
    ) -> DbResult<()> {
        let moved: Vec<BTreeEntry> = {
            let guard = right_sibling.read();
            let sib = guard.as_internal()?;
            let steal = sib
                .num_entries()
                .saturating_sub(page.read().as_internal()?.num_entries())
                / 2;
            sib.entries().into_iter().take(steal).collect()
        };
        if moved.is_empty() {
            return Ok(());
        }

        let last_child = {
            let guard = page.read();
            let entries = guard.as_internal()?.entries();
            entries[entries.len() - 1].right_child()
        };
        let center = BTreeEntry::new(
            parent_entry.key().clone(),
            last_child,
            moved[0].left_child(),
        );
        page.write().as_internal_mut()?.insert_entry(&center)?;

        for e in moved.iter().take(moved.len() - 1) {
            right_sibling
                .write()
                .as_internal_mut()?
                .delete_key_and_left_child(e)?;
            page.write().as_internal_mut()?.insert_entry(e)?;
        }
        let last = &moved[moved.len() - 1];
        right_sibling
            .write()
            .as_internal_mut()?
            .delete_key_and_left_child(last)?;
        parent_entry.set_key(last.key().clone());
        parent.write().as_internal_mut()?.update_entry(&parent_entry)?;

        self.update_parent_pointers(db, tid, dirty, parent)?;
        self.update_parent_pointers(db, tid, dirty, right_sibling)?;
        self.update_parent_pointers(db, tid, dirty, page)?;
        Ok(())
    }

    /// Merges two leaves: every tuple of the right page moves left, the
    /// sibling list is re-spliced, the right page number is freed, and the
    /// separating parent entry is deleted.
    #[allow(clippy::too_many_arguments)]
    fn merge_leaf_pages(
        &self,
        db: &Database,
        tid: TransactionId,
        dirty: &mut DirtyMap,
        left: PageHandle,
        right: PageHandle,
        parent: PageHandle,
        parent_entry: BTreeEntry,
    ) -> DbResult<()> {
        let moved: Vec<Tuple> = right.read().as_leaf()?.iter().cloned().collect();
        for t in &moved {
            right.write().as_leaf_mut()?.delete_tuple(t)?;
            left.write().as_leaf_mut()?.insert_tuple(t.clone())?;
        }

        let (left_id, right_right) = {
            (left.read().id(), right.read().as_leaf()?.right_sibling_id())
        };
        if let Some(rr) = right_right {
            let next = get_page(db, tid, dirty, rr, Permissions::ReadWrite)?;
            next.write().as_leaf_mut()?.set_left_sibling_id(Some(left_id))?;
        }
        left.write().as_leaf_mut()?.set_right_sibling_id(right_right)?;

        let freed = right.read().id().page_no;
        self.set_empty_page(db, tid, dirty, freed)?;
        self.delete_parent_entry(db, tid, dirty, &left, parent, parent_entry)
    }

    /// Merges two internal pages, pulling the separating parent key down
    /// as the center entry between their child chains.
    #[allow(clippy::too_many_arguments)]
    fn merge_internal_pages(
        &self,
        db: &Database,
        tid: TransactionId,
        dirty: &mut DirtyMap,
        left: PageHandle,
        right: PageHandle,
        parent: PageHandle,
        parent_entry: BTreeEntry,
    ) -> DbResult<()> {
        let moved: Vec<BTreeEntry> = right.read().as_internal()?.entries();
        let center = {
            let left_guard = left.read();
            let left_entries = left_guard.as_internal()?.entries();
            BTreeEntry::new(
                parent_entry.key().clone(),
                left_entries[left_entries.len() - 1].right_child(),
                moved[0].left_child(),
            )
        };
        left.write().as_internal_mut()?.insert_entry(&center)?;
        for e in &moved {
            right.write().as_internal_mut()?.delete_key_and_left_child(e)?;
            left.write().as_internal_mut()?.insert_entry(e)?;
        }

        let freed = right.read().id().page_no;
        self.set_empty_page(db, tid, dirty, freed)?;
        self.update_parent_pointers(db, tid, dirty, &left)?;
        self.delete_parent_entry(db, tid, dirty, &left, parent, parent_entry)
    }

    /// Deletes a key and right child from the parent after a merge. A
    /// drained parent must have been the root: the merged child becomes
    /// the new root. A merely under-occupied parent rebalances
    /// recursively.
    fn delete_parent_entry(
        &self,
        db: &Database,
        tid: TransactionId,
        dirty: &mut DirtyMap,
        left_page: &PageHandle,
        parent: PageHandle,
        parent_entry: BTreeEntry,
    ) -> DbResult<()> {
        let (empty_slots, max_entries, parent_id) = {
            let mut guard = parent.write();
            let internal = guard.as_internal_mut()?;
            internal.delete_key_and_right_child(&parent_entry)?;
            (
                internal.num_empty_slots(),
                internal.max_entries(),
                internal.parent_id(),
            )
        };
        let max_empty = max_entries - max_entries / 2;

        if empty_slots == max_entries {
            // The last entry is gone, so the parent was the root; its one
            // remaining child takes over.
            if parent_id.kind != PageKind::BTreeRootPtr {
                return Err(DbError::Db(
                    "attempting to delete a non-root node".to_string(),
                ));
            }
            let root_ptr = get_page(db, tid, dirty, parent_id, Permissions::ReadWrite)?;
            let left_id = left_page.read().id();
            set_parent_id_of(&mut left_page.write(), parent_id)?;
            root_ptr.write().as_root_ptr_mut()?.set_root_id(Some(left_id))?;
            let freed = parent.read().id().page_no;
            self.set_empty_page(db, tid, dirty, freed)?;
        } else if empty_slots > max_empty {
            self.handle_min_occupancy_page(db, tid, dirty, parent)?;
        }
        Ok(())
    }

    /// Finds the first free page number, scanning the header-page chain.
    /// With no free slot anywhere, grows the file by one zeroed page.
    fn get_empty_page_no(
        &self,
        db: &Database,
        tid: TransactionId,
        dirty: &mut DirtyMap,
    ) -> DbResult<u32> {
        let root_ptr = self.get_root_ptr_page(db, tid, dirty)?;
        let mut header_id = root_ptr.read().as_root_ptr()?.header_id();
        let mut header_count: usize = 0;

        while let Some(hid) = header_id {
            let header = get_page(db, tid, dirty, hid, Permissions::ReadOnly)?;
            let slot = header.read().as_header()?.empty_slot();
            if let Some(slot) = slot {
                let header = get_page(db, tid, dirty, hid, Permissions::ReadWrite)?;
                header.write().as_header_mut()?.mark_slot_used(slot, true);
                return Ok((header_count * header_num_slots() + slot) as u32);
            }
            header_id = header.read().as_header()?.next_id();
            header_count += 1;
        }

        // No header page has a free slot; append a fresh page.
        let mut file = self.file.lock();
        let len = file.metadata()?.len();
        file.seek(SeekFrom::End(0))?;
        file.write_all(&vec![0u8; page_size()])?;
        let page_no =
            ((len - ROOT_PTR_PAGE_SIZE as u64) / page_size() as u64) as u32 + 1;
        Ok(page_no)
    }

    /// Produces a zeroed page of the requested kind under a write lock,
    /// reusing a freed page number when one exists. The page is wiped on
    /// disk and dropped from both caches first, so the fetch below parses
    /// a clean image.
    fn get_empty_page(
        &self,
        db: &Database,
        tid: TransactionId,
        dirty: &mut DirtyMap,
        kind: PageKind,
    ) -> DbResult<PageHandle> {
        let page_no = self.get_empty_page_no(db, tid, dirty)?;
        let pid = PageId::new(self.table_id, page_no, kind);

        {
            let mut file = self.file.lock();
            file.seek(SeekFrom::Start(Self::data_page_offset(page_no)))?;
            file.write_all(&vec![0u8; page_size()])?;
        }
        // A reused page number may still be cached under its previous
        // kind; none of those images may reach this offset again.
        for kind in [
            PageKind::BTreeLeaf,
            PageKind::BTreeInternal,
            PageKind::BTreeHeader,
        ] {
            let stale = PageId::new(self.table_id, page_no, kind);
            db.buffer_pool().discard_page(stale);
            dirty.remove(&stale);
        }

        get_page(db, tid, dirty, pid, Permissions::ReadWrite)
    }

    /// Marks a page number free in its header page, creating and chaining
    /// header pages until one covers the slot.
    fn set_empty_page(
        &self,
        db: &Database,
        tid: TransactionId,
        dirty: &mut DirtyMap,
        empty_page_no: u32,
    ) -> DbResult<()> {
        let slots = header_num_slots();
        let target = empty_page_no as usize;

        let root_ptr = self.get_root_ptr_page(db, tid, dirty)?;
        let mut header_id = root_ptr.read().as_root_ptr()?.header_id();

        if header_id.is_none() {
            let root_ptr = get_page(
                db,
                tid,
                dirty,
                PageId::root_ptr(self.table_id),
                Permissions::ReadWrite,
            )?;
            let header = self.get_empty_page(db, tid, dirty, PageKind::BTreeHeader)?;
            let hid = header.read().id();
            header.write().as_header_mut()?.init();
            root_ptr.write().as_root_ptr_mut()?.set_header_id(Some(hid))?;
            header_id = Some(hid);
        }

        // Walk to the header covering the slot, extending the chain when
        // the page number lies past its end.
        let mut prev_id: Option<PageId> = None;
        let mut header_count: usize = 0;
        while let Some(hid) = header_id {
            if target < (header_count + 1) * slots {
                break;
            }
            let header = get_page(db, tid, dirty, hid, Permissions::ReadOnly)?;
            prev_id = Some(hid);
            header_id = header.read().as_header()?.next_id();
            header_count += 1;
        }
        while header_id.is_none() {
            let prev = get_page(
                db,
                tid,
                dirty,
                prev_id.expect("chain extension follows an existing header"),
                Permissions::ReadWrite,
            )?;
            let header = self.get_empty_page(db, tid, dirty, PageKind::BTreeHeader)?;
            let hid = header.read().id();
            {
                let mut guard = header.write();
                let hp = guard.as_header_mut()?;
                hp.init();
                hp.set_prev_id(prev_id);
            }
            prev.write().as_header_mut()?.set_next_id(Some(hid));

            if target < (header_count + 1) * slots {
                header_id = Some(hid);
            } else {
                prev_id = Some(hid);
                header_count += 1;
            }
        }

        let hid = header_id.expect("loop above always lands on a header");
        let header = get_page(db, tid, dirty, hid, Permissions::ReadWrite)?;
        let slot = target - header_count * slots;
        header.write().as_header_mut()?.mark_slot_used(slot, false);
        Ok(())
    }

    /// An iterator over tuples matching the predicate, descending to the
    /// lower bound where the operator allows it.
    pub fn index_iterator(
        &self,
        tid: TransactionId,
        predicate: IndexPredicate,
    ) -> BTreeSearchIterator {
        BTreeSearchIterator::new(tid, self.table_id, self.key_field, predicate)
    }
}

impl DbFile for BTreeFile {
    fn id(&self) -> u32 {
        self.table_id
    }

    fn tuple_desc(&self) -> &TupleDesc {
        &self.td
    }

    fn read_page(&self, pid: PageId) -> DbResult<Page> {
        let mut file = self.file.lock();
        let len = file.metadata()?.len();
        if pid.kind == PageKind::BTreeRootPtr {
            if len < ROOT_PTR_PAGE_SIZE as u64 {
                return Err(DbError::InvalidArgument(
                    "read past end of table".to_string(),
                ));
            }
            let mut data = vec![0u8; ROOT_PTR_PAGE_SIZE];
            file.seek(SeekFrom::Start(0))?;
            read_fully(&mut file, &mut data)?;
            return Ok(Page::RootPtr(BTreeRootPtrPage::new(pid, &data)?));
        }

        let offset = Self::data_page_offset(pid.page_no);
        if offset + page_size() as u64 > len {
            return Err(DbError::InvalidArgument(
                "read past end of table".to_string(),
            ));
        }
        let mut data = vec![0u8; page_size()];
        file.seek(SeekFrom::Start(offset))?;
        read_fully(&mut file, &mut data)?;
        match pid.kind {
            PageKind::BTreeLeaf => Ok(Page::Leaf(BTreeLeafPage::new(
                pid,
                &data,
                self.td.clone(),
                self.key_field,
            )?)),
            PageKind::BTreeInternal => Ok(Page::Internal(BTreeInternalPage::new(
                pid,
                &data,
                self.td.clone(),
                self.key_field,
            )?)),
            PageKind::BTreeHeader => Ok(Page::Header(BTreeHeaderPage::new(pid, &data)?)),
            other => Err(DbError::Db(format!(
                "a B+ tree file cannot serve {:?} pages",
                other
            ))),
        }
    }

    fn write_page(&self, page: &Page) -> DbResult<()> {
        let pid = page.id();
        let mut file = self.file.lock();
        let offset = if pid.kind == PageKind::BTreeRootPtr {
            0
        } else {
            Self::data_page_offset(pid.page_no)
        };
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(&page.page_data())?;
        file.sync_all()?;
        Ok(())
    }

    fn num_pages(&self) -> DbResult<u32> {
        let file = self.file.lock();
        let len = file.metadata()?.len();
        if len < ROOT_PTR_PAGE_SIZE as u64 {
            return Ok(0);
        }
        Ok(((len - ROOT_PTR_PAGE_SIZE as u64) / page_size() as u64) as u32)
    }

    fn insert_tuple(
        &self,
        db: &Database,
        tid: TransactionId,
        t: Tuple,
    ) -> DbResult<Vec<PageHandle>> {
        let mut dirty: DirtyMap = HashMap::new();

        let root_ptr = self.get_root_ptr_page(db, tid, &mut dirty)?;
        let mut root_id = root_ptr.read().as_root_ptr()?.root_id();
        if root_id.is_none() {
            // First insert ever: point the root at the pre-allocated leaf.
            let new_root = PageId::new(self.table_id, self.num_pages()?, PageKind::BTreeLeaf);
            let root_ptr = get_page(
                db,
                tid,
                &mut dirty,
                PageId::root_ptr(self.table_id),
                Permissions::ReadWrite,
            )?;
            root_ptr.write().as_root_ptr_mut()?.set_root_id(Some(new_root))?;
            root_id = Some(new_root);
        }

        let field = t.field(self.key_field).clone();
        let mut leaf = find_leaf_page(
            db,
            tid,
            &mut dirty,
            root_id.expect("root id set above"),
            Permissions::ReadWrite,
            Some(&field),
        )?;
        let full = leaf.read().as_leaf()?.num_empty_slots() == 0;
        if full {
            leaf = self.split_leaf_page(db, tid, &mut dirty, leaf, &field)?;
        }
        leaf.write().as_leaf_mut()?.insert_tuple(t)?;

        Ok(dirty.into_values().collect())
    }

    fn delete_tuple(
        &self,
        db: &Database,
        tid: TransactionId,
        t: &Tuple,
    ) -> DbResult<Vec<PageHandle>> {
        let rid = t.record_id().ok_or_else(|| {
            DbError::Db("cannot delete a tuple with no record id".to_string())
        })?;
        let mut dirty: DirtyMap = HashMap::new();

        let pid = PageId::new(self.table_id, rid.pid.page_no, PageKind::BTreeLeaf);
        let page = get_page(db, tid, &mut dirty, pid, Permissions::ReadWrite)?;
        let (empty_slots, max_tuples) = {
            let mut guard = page.write();
            let leaf = guard.as_leaf_mut()?;
            leaf.delete_tuple(t)?;
            (leaf.num_empty_slots(), leaf.max_tuples())
        };

        let max_empty = max_tuples - max_tuples / 2;
        if empty_slots > max_empty {
            self.handle_min_occupancy_page(db, tid, &mut dirty, page)?;
        }

        Ok(dirty.into_values().collect())
    }

    fn iterator(&self, tid: TransactionId) -> Box<dyn DbFileIterator> {
        Box::new(BTreeFileIterator::new(tid, self.table_id))
    }
}

fn read_fully(file: &mut File, buf: &mut [u8]) -> DbResult<()> {
    file.read_exact(buf).map_err(|e| {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            DbError::InvalidArgument("unable to read a full page".to_string())
        } else {
            DbError::Io(e)
        }
    })
}

/// Loads one leaf's tuples and the id of its right sibling.
fn load_leaf(
    db: &Database,
    tid: TransactionId,
    pid: PageId,
) -> DbResult<(Vec<Tuple>, Option<PageId>)> {
    let handle = db
        .buffer_pool()
        .get_page(db, tid, pid, Permissions::ReadOnly)?;
    let guard = handle.read();
    let leaf = guard.as_leaf()?;
    Ok((leaf.iter().cloned().collect(), leaf.right_sibling_id()))
}

/// Ordered full-file iterator: descends to the leftmost leaf, then walks
/// right-sibling pointers.
pub struct BTreeFileIterator {
    tid: TransactionId,
    table_id: u32,
    current: std::vec::IntoIter<Tuple>,
    next_leaf: Option<PageId>,
    peeked: Option<Tuple>,
    open: bool,
}

impl BTreeFileIterator {
    pub fn new(tid: TransactionId, table_id: u32) -> Self {
        BTreeFileIterator {
            tid,
            table_id,
            current: Vec::new().into_iter(),
            next_leaf: None,
            peeked: None,
            open: false,
        }
    }

    fn read_next(&mut self, db: &Database) -> DbResult<Option<Tuple>> {
        loop {
            if let Some(t) = self.current.next() {
                return Ok(Some(t));
            }
            let Some(pid) = self.next_leaf.take() else {
                return Ok(None);
            };
            let (tuples, right) = load_leaf(db, self.tid, pid)?;
            self.current = tuples.into_iter();
            self.next_leaf = right;
        }
    }
}

impl DbFileIterator for BTreeFileIterator {
    fn open(&mut self, db: &Database) -> DbResult<()> {
        self.current = Vec::new().into_iter();
        self.next_leaf = None;
        self.peeked = None;
        self.open = true;

        if db.catalog().db_file(self.table_id)?.num_pages()? == 0 {
            return Ok(());
        }
        let root_ptr = db.buffer_pool().get_page(
            db,
            self.tid,
            PageId::root_ptr(self.table_id),
            Permissions::ReadOnly,
        )?;
        let root_id = root_ptr.read().as_root_ptr()?.root_id();
        if let Some(root_id) = root_id {
            let mut dirty = HashMap::new();
            let leaf = find_leaf_page(
                db,
                self.tid,
                &mut dirty,
                root_id,
                Permissions::ReadOnly,
                None,
            )?;
            let guard = leaf.read();
            let leaf = guard.as_leaf()?;
            self.current = leaf.iter().cloned().collect::<Vec<_>>().into_iter();
            self.next_leaf = leaf.right_sibling_id();
        }
        Ok(())
    }

    fn has_next(&mut self, db: &Database) -> DbResult<bool> {
        if !self.open {
            return Ok(false);
        }
        if self.peeked.is_none() {
            self.peeked = self.read_next(db)?;
        }
        Ok(self.peeked.is_some())
    }

    fn next(&mut self, db: &Database) -> DbResult<Tuple> {
        if !self.open {
            return Err(DbError::Db("the iterator is not open".to_string()));
        }
        if let Some(t) = self.peeked.take() {
            return Ok(t);
        }
        self.read_next(db)?
            .ok_or_else(|| DbError::Db("no more tuples".to_string()))
    }

    fn rewind(&mut self, db: &Database) -> DbResult<()> {
        self.open(db)
    }

    fn close(&mut self) {
        self.open = false;
        self.current = Vec::new().into_iter();
        self.next_leaf = None;
        self.peeked = None;
    }
}

/// Predicate-driven iterator. EQUALS and the greater-than operators
/// descend straight to the lower bound and short-circuit once keys pass
/// the target; the less-than operators scan from the leftmost leaf and
/// stop at the first mismatch.
pub struct BTreeSearchIterator {
    tid: TransactionId,
    table_id: u32,
    key_field: usize,
    predicate: IndexPredicate,
    current: std::vec::IntoIter<Tuple>,
    next_leaf: Option<PageId>,
    peeked: Option<Tuple>,
    open: bool,
    done: bool,
}

impl BTreeSearchIterator {
    pub fn new(
        tid: TransactionId,
        table_id: u32,
        key_field: usize,
        predicate: IndexPredicate,
    ) -> Self {
        BTreeSearchIterator {
            tid,
            table_id,
            key_field,
            predicate,
            current: Vec::new().into_iter(),
            next_leaf: None,
            peeked: None,
            open: false,
            done: false,
        }
    }

    fn read_next(&mut self, db: &Database) -> DbResult<Option<Tuple>> {
        if self.done {
            return Ok(None);
        }
        loop {
            while let Some(t) = self.current.next() {
                let key = t.field(self.key_field);
                if key.compare(self.predicate.op, &self.predicate.field) {
                    return Ok(Some(t));
                }
                match self.predicate.op {
                    Op::LessThan | Op::LessThanOrEq => {
                        // Keys only grow to the right; the scan is over.
                        self.done = true;
                        return Ok(None);
                    }
                    Op::Equals
                        if key.compare(Op::GreaterThan, &self.predicate.field) =>
                    {
                        self.done = true;
                        return Ok(None);
                    }
                    _ => {}
                }
            }
            let Some(pid) = self.next_leaf.take() else {
                return Ok(None);
            };
            let (tuples, right) = load_leaf(db, self.tid, pid)?;
            self.current = tuples.into_iter();
            self.next_leaf = right;
        }
    }
}

impl DbFileIterator for BTreeSearchIterator {
    fn open(&mut self, db: &Database) -> DbResult<()> {
        self.current = Vec::new().into_iter();
        self.next_leaf = None;
        self.peeked = None;
        self.open = true;
        self.done = false;

        if db.catalog().db_file(self.table_id)?.num_pages()? == 0 {
            return Ok(());
        }
        let root_ptr = db.buffer_pool().get_page(
            db,
            self.tid,
            PageId::root_ptr(self.table_id),
            Permissions::ReadOnly,
        )?;
        let root_id = root_ptr.read().as_root_ptr()?.root_id();
        let Some(root_id) = root_id else {
            return Ok(());
        };

        let bound = match self.predicate.op {
            Op::Equals | Op::GreaterThan | Op::GreaterThanOrEq => Some(&self.predicate.field),
            _ => None,
        };
        let mut dirty = HashMap::new();
        let leaf = find_leaf_page(
            db,
            self.tid,
            &mut dirty,
            root_id,
            Permissions::ReadOnly,
            bound,
        )?;
        let guard = leaf.read();
        let leaf = guard.as_leaf()?;
        self.current = leaf.iter().cloned().collect::<Vec<_>>().into_iter();
        self.next_leaf = leaf.right_sibling_id();
        Ok(())
    }

    fn has_next(&mut self, db: &Database) -> DbResult<bool> {
        if !self.open {
            return Ok(false);
        }
        if self.peeked.is_none() {
            self.peeked = self.read_next(db)?;
        }
        Ok(self.peeked.is_some())
    }

    fn next(&mut self, db: &Database) -> DbResult<Tuple> {
        if !self.open {
            return Err(DbError::Db("the iterator is not open".to_string()));
        }
        if let Some(t) = self.peeked.take() {
            return Ok(t);
        }
        self.read_next(db)?
            .ok_or_else(|| DbError::Db("no more tuples".to_string()))
    }

    fn rewind(&mut self, db: &Database) -> DbResult<()> {
        self.open(db)
    }

    fn close(&mut self) {
        self.open = false;
        self.current = Vec::new().into_iter();
        self.next_leaf = None;
        self.peeked = None;
        self.done = false;
    }
}
