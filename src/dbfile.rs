use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::Path;

use crate::database::Database;
use crate::errors::DbResult;
use crate::page::{Page, PageHandle, PageId};
use crate::transaction::TransactionId;
use crate::tuple::{Tuple, TupleDesc};

/// The interface every storage file implements. Heap files and B+ tree
/// files both satisfy it; the buffer pool and catalog speak only this.
pub trait DbFile: Send + Sync {
    /// The table id backing this file, stable across opens.
    fn id(&self) -> u32;

    fn tuple_desc(&self) -> &TupleDesc;

    /// Reads a page image from disk. Called by the buffer pool on a cache
    /// miss, not directly by operators.
    fn read_page(&self, pid: PageId) -> DbResult<Page>;

    /// Writes a page image to disk. Called by the buffer pool on flush.
    fn write_page(&self, page: &Page) -> DbResult<()>;

    fn num_pages(&self) -> DbResult<u32>;

    /// Inserts the tuple, returning every page the operation dirtied. The
    /// buffer pool re-caches and marks each returned page.
    fn insert_tuple(
        &self,
        db: &Database,
        tid: TransactionId,
        t: Tuple,
    ) -> DbResult<Vec<PageHandle>>;

    /// Deletes the tuple located by its record id, returning dirtied pages.
    fn delete_tuple(
        &self,
        db: &Database,
        tid: TransactionId,
        t: &Tuple,
    ) -> DbResult<Vec<PageHandle>>;

    /// A lazy tuple iterator over the whole file under `tid`.
    fn iterator(&self, tid: TransactionId) -> Box<dyn DbFileIterator>;
}

/// The iterator protocol over a DbFile. Page fetches go through the buffer
/// pool with read-only permission, so the context is threaded per call.
pub trait DbFileIterator {
    fn open(&mut self, db: &Database) -> DbResult<()>;

    fn has_next(&mut self, db: &Database) -> DbResult<bool>;

    fn next(&mut self, db: &Database) -> DbResult<Tuple>;

    fn rewind(&mut self, db: &Database) -> DbResult<()>;

    fn close(&mut self);
}

/// Derives a table id from the file's absolute path, so the same file
/// always maps to the same id within a process.
pub fn table_id_for_path(path: &Path) -> u32 {
    let absolute = path
        .canonicalize()
        .unwrap_or_else(|_| path.to_path_buf());
    let mut hasher = DefaultHasher::new();
    absolute.hash(&mut hasher);
    hasher.finish() as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_id_is_stable_per_path() {
        let a = table_id_for_path(Path::new("/tmp/some-table.dat"));
        let b = table_id_for_path(Path::new("/tmp/some-table.dat"));
        let c = table_id_for_path(Path::new("/tmp/other-table.dat"));
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
