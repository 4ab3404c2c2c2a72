//! Heap files: unordered tuples on a sequence of fixed-size slotted pages
//! stored contiguously in one backing file.

use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::buffer_pool::page_size;
use crate::database::Database;
use crate::dbfile::{table_id_for_path, DbFile, DbFileIterator};
use crate::errors::{DbError, DbResult};
use crate::heap_page::HeapPage;
use crate::lock_manager::Permissions;
use crate::page::{Page, PageHandle, PageId, PageKind};
use crate::transaction::TransactionId;
use crate::tuple::{Tuple, TupleDesc};

/// A DbFile storing tuples in no particular order. Pages are appended as
/// the file grows; inserts take the first empty slot found.
pub struct HeapFile {
    file: Mutex<File>,
    path: PathBuf,
    table_id: u32,
    td: TupleDesc,
}

impl HeapFile {
    pub fn open<P: AsRef<Path>>(path: P, td: TupleDesc) -> DbResult<Self> {
        let path_buf = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path_buf)?;
        let table_id = table_id_for_path(&path_buf);
        crate::regolith_debug_log!(
            "[HeapFile::open] {:?} as table {}",
            path_buf,
            table_id
        );
        Ok(HeapFile {
            file: Mutex::new(file),
            path: path_buf,
            table_id,
            td,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends one zeroed page, returning its page number.
    fn append_empty_page(&self) -> DbResult<u32> {
        let mut file = self.file.lock();
        let len = file.metadata()?.len();
        file.seek(SeekFrom::End(0))?;
        file.write_all(&HeapPage::empty_data())?;
        Ok((len / page_size() as u64) as u32)
    }
}

impl DbFile for HeapFile {
    fn id(&self) -> u32 {
        self.table_id
    }

    fn tuple_desc(&self) -> &TupleDesc {
        &self.td
    }

    fn read_page(&self, pid: PageId) -> DbResult<Page> {
        let page_size = page_size();
        let offset = pid.page_no as u64 * page_size as u64;
        let mut file = self.file.lock();
        if offset >= file.metadata()?.len() {
            return Err(DbError::InvalidArgument(format!(
                "page {:?} does not exist in this file",
                pid
            )));
        }
        let mut data = vec![0u8; page_size];
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(&mut data).map_err(|e| {
            if e.kind() == io::ErrorKind::UnexpectedEof {
                DbError::InvalidArgument(format!("short read of page {:?}", pid))
            } else {
                DbError::Io(e)
            }
        })?;
        Ok(Page::Heap(HeapPage::new(pid, &data, self.td.clone())?))
    }

    fn write_page(&self, page: &Page) -> DbResult<()> {
        let pid = page.id();
        let offset = pid.page_no as u64 * page_size() as u64;
        let mut file = self.file.lock();
        if offset > file.metadata()?.len() {
            return Err(DbError::InvalidArgument(format!(
                "page {:?} lies beyond the end of this file",
                pid
            )));
        }
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(&page.page_data())?;
        file.sync_all()?;
        Ok(())
    }

    fn num_pages(&self) -> DbResult<u32> {
        let file = self.file.lock();
        Ok((file.metadata()?.len() / page_size() as u64) as u32)
    }

    fn insert_tuple(
        &self,
        db: &Database,
        tid: TransactionId,
        t: Tuple,
    ) -> DbResult<Vec<PageHandle>> {
        let mut t = Some(t);
        let num_pages = self.num_pages()?;
        for page_no in 0..num_pages {
            let pid = PageId::new(self.table_id, page_no, PageKind::Heap);
            let handle = db
                .buffer_pool()
                .get_page(db, tid, pid, Permissions::ReadWrite)?;
            let mut guard = handle.write();
            let heap = guard.as_heap_mut()?;
            if heap.num_empty_slots() != 0 {
                heap.insert_tuple(t.take().expect("tuple consumed once"))?;
                heap.set_dirtier(Some(tid));
                drop(guard);
                return Ok(vec![handle]);
            }
        }

        // Every existing page is full; grow the file by one zeroed page and
        // insert through the buffer pool so the new page is cached.
        let new_page_no = self.append_empty_page()?;
        let pid = PageId::new(self.table_id, new_page_no, PageKind::Heap);
        let handle = db
            .buffer_pool()
            .get_page(db, tid, pid, Permissions::ReadWrite)?;
        {
            let mut guard = handle.write();
            let heap = guard.as_heap_mut()?;
            heap.insert_tuple(t.take().expect("tuple consumed once"))?;
            heap.set_dirtier(Some(tid));
        }
        Ok(vec![handle])
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
        let handle = db
            .buffer_pool()
            .get_page(db, tid, rid.pid, Permissions::ReadWrite)?;
        {
            let mut guard = handle.write();
            let heap = guard.as_heap_mut()?;
            heap.delete_tuple(t)?;
            heap.set_dirtier(Some(tid));
        }
        Ok(vec![handle])
    }

    fn iterator(&self, tid: TransactionId) -> Box<dyn DbFileIterator> {
        Box::new(HeapFileIterator::new(tid, self.table_id))
    }
}

/// Walks the file page by page through the buffer pool under READ_ONLY,
/// with a one-tuple lookahead backing `has_next`.
pub struct HeapFileIterator {
    tid: TransactionId,
    table_id: u32,
    num_pages: u32,
    next_page_no: u32,
    current: std::vec::IntoIter<Tuple>,
    peeked: Option<Tuple>,
    open: bool,
}

impl HeapFileIterator {
    pub fn new(tid: TransactionId, table_id: u32) -> Self {
        HeapFileIterator {
            tid,
            table_id,
            num_pages: 0,
            next_page_no: 0,
            current: Vec::new().into_iter(),
            peeked: None,
            open: false,
        }
    }

    fn read_next(&mut self, db: &Database) -> DbResult<Option<Tuple>> {
        loop {
            if let Some(t) = self.current.next() {
                return Ok(Some(t));
            }
            if self.next_page_no >= self.num_pages {
                return Ok(None);
            }
            let pid = PageId::new(self.table_id, self.next_page_no, PageKind::Heap);
            let handle = db
                .buffer_pool()
                .get_page(db, self.tid, pid, Permissions::ReadOnly)?;
            let tuples: Vec<Tuple> = handle.read().as_heap()?.iter().cloned().collect();
            self.current = tuples.into_iter();
            self.next_page_no += 1;
        }
    }
}

impl DbFileIterator for HeapFileIterator {
    fn open(&mut self, db: &Database) -> DbResult<()> {
        self.num_pages = db.catalog().db_file(self.table_id)?.num_pages()?;
        self.next_page_no = 0;
        self.current = Vec::new().into_iter();
        self.peeked = None;
        self.open = true;
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
        self.peeked = None;
    }
}
