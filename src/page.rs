use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::btree::page::{BTreeHeaderPage, BTreeInternalPage, BTreeLeafPage, BTreeRootPtrPage};
use crate::errors::{DbError, DbResult};
use crate::heap_page::HeapPage;
use crate::transaction::TransactionId;

/// The page kinds the engine knows how to read and cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PageKind {
    Heap,
    BTreeRootPtr,
    BTreeInternal,
    BTreeLeaf,
    BTreeHeader,
}

impl PageKind {
    /// The on-disk byte code of this kind, used where a child or root
    /// pointer records the kind of the page it points at.
    pub fn code(self) -> u8 {
        match self {
            PageKind::Heap => 0,
            PageKind::BTreeRootPtr => 1,
            PageKind::BTreeInternal => 2,
            PageKind::BTreeLeaf => 3,
            PageKind::BTreeHeader => 4,
        }
    }

    pub fn from_code(code: u8) -> DbResult<Self> {
        match code {
            0 => Ok(PageKind::Heap),
            1 => Ok(PageKind::BTreeRootPtr),
            2 => Ok(PageKind::BTreeInternal),
            3 => Ok(PageKind::BTreeLeaf),
            4 => Ok(PageKind::BTreeHeader),
            other => Err(DbError::Db(format!("unknown page kind code {}", other))),
        }
    }
}

/// Identifies a page within its file. Equality and hashing cover all
/// fields; the table id is derived from the backing file's absolute path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PageId {
    pub table_id: u32,
    pub page_no: u32,
    pub kind: PageKind,
}

impl PageId {
    pub fn new(table_id: u32, page_no: u32, kind: PageKind) -> Self {
        PageId {
            table_id,
            page_no,
            kind,
        }
    }

    /// The fixed id of a B+ tree file's root-pointer page.
    pub fn root_ptr(table_id: u32) -> Self {
        PageId::new(table_id, 0, PageKind::BTreeRootPtr)
    }
}

/// A page handle: pages are owned by the buffer pool and shared by
/// reference-counted latch, never by raw reference.
pub type PageHandle = Arc<RwLock<Page>>;

/// The in-memory image of a page, tagged by kind. All variants carry the
/// common capability set: identity, serialization, the dirty flag, and a
/// before-image snapshot used by the log on flush.
#[derive(Debug, Clone)]
pub enum Page {
    Heap(HeapPage),
    Leaf(BTreeLeafPage),
    Internal(BTreeInternalPage),
    Header(BTreeHeaderPage),
    RootPtr(BTreeRootPtrPage),
}

macro_rules! dispatch {
    ($self:expr, $p:ident => $e:expr) => {
        match $self {
            Page::Heap($p) => $e,
            Page::Leaf($p) => $e,
            Page::Internal($p) => $e,
            Page::Header($p) => $e,
            Page::RootPtr($p) => $e,
        }
    };
}

impl Page {
    pub fn id(&self) -> PageId {
        dispatch!(self, p => p.id())
    }

    /// Serializes the current contents to their on-disk representation.
    pub fn page_data(&self) -> Vec<u8> {
        dispatch!(self, p => p.serialize())
    }

    /// The transaction that dirtied this page, if any.
    pub fn is_dirty(&self) -> Option<TransactionId> {
        dispatch!(self, p => p.dirtier())
    }

    pub fn mark_dirty(&mut self, dirtier: Option<TransactionId>) {
        dispatch!(self, p => p.set_dirtier(dirtier))
    }

    /// The serialized image of this page as of the last commit (or load).
    pub fn before_image_data(&self) -> Vec<u8> {
        dispatch!(self, p => p.before_image_data().to_vec())
    }

    /// Snapshots the current contents as the new before-image.
    pub fn set_before_image(&mut self) {
        let data = self.page_data();
        dispatch!(self, p => p.set_before_image_data(data))
    }

    pub fn as_heap(&self) -> DbResult<&HeapPage> {
        match self {
            Page::Heap(p) => Ok(p),
            other => Err(kind_mismatch("heap", other)),
        }
    }

    pub fn as_heap_mut(&mut self) -> DbResult<&mut HeapPage> {
        match self {
            Page::Heap(p) => Ok(p),
            other => Err(kind_mismatch("heap", other)),
        }
    }

    pub fn as_leaf(&self) -> DbResult<&BTreeLeafPage> {
        match self {
            Page::Leaf(p) => Ok(p),
            other => Err(kind_mismatch("btree leaf", other)),
        }
    }

    pub fn as_leaf_mut(&mut self) -> DbResult<&mut BTreeLeafPage> {
        match self {
            Page::Leaf(p) => Ok(p),
            other => Err(kind_mismatch("btree leaf", other)),
        }
    }

    pub fn as_internal(&self) -> DbResult<&BTreeInternalPage> {
        match self {
            Page::Internal(p) => Ok(p),
            other => Err(kind_mismatch("btree internal", other)),
        }
    }

    pub fn as_internal_mut(&mut self) -> DbResult<&mut BTreeInternalPage> {
        match self {
            Page::Internal(p) => Ok(p),
            other => Err(kind_mismatch("btree internal", other)),
        }
    }

    pub fn as_header(&self) -> DbResult<&BTreeHeaderPage> {
        match self {
            Page::Header(p) => Ok(p),
            other => Err(kind_mismatch("btree header", other)),
        }
    }

    pub fn as_header_mut(&mut self) -> DbResult<&mut BTreeHeaderPage> {
        match self {
            Page::Header(p) => Ok(p),
            other => Err(kind_mismatch("btree header", other)),
        }
    }

    pub fn as_root_ptr(&self) -> DbResult<&BTreeRootPtrPage> {
        match self {
            Page::RootPtr(p) => Ok(p),
            other => Err(kind_mismatch("btree root pointer", other)),
        }
    }

    pub fn as_root_ptr_mut(&mut self) -> DbResult<&mut BTreeRootPtrPage> {
        match self {
            Page::RootPtr(p) => Ok(p),
            other => Err(kind_mismatch("btree root pointer", other)),
        }
    }
}

fn kind_mismatch(wanted: &str, got: &Page) -> DbError {
    DbError::Db(format!(
        "expected a {} page, found {:?} page {:?}",
        wanted,
        got.id().kind,
        got.id()
    ))
}
