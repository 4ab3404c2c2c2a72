//! On-disk page kinds of the B+ tree file: the root pointer, internal and
//! leaf pages, and the header pages whose bitmaps track free page numbers.

use bytes::{Buf, BufMut, BytesMut};

use crate::buffer_pool::page_size;
use crate::errors::{DbError, DbResult};
use crate::page::{PageId, PageKind};
use crate::transaction::TransactionId;
use crate::tuple::{Field, RecordId, Tuple, TupleDesc, Type};

/// Size of the root-pointer page at file offset 0: root page number, root
/// kind code, header page number.
pub const ROOT_PTR_PAGE_SIZE: usize = 9;

/// Tuples per leaf page: three pointer words up front, then one bit plus
/// `tuple_size` bytes per slot.
pub fn leaf_max_tuples(td: &TupleDesc) -> usize {
    (8 * (page_size() - 12)) / (td.size() * 8 + 1)
}

/// Entries per internal page: parent word and child-kind byte up front,
/// then per entry a key, a child word, and an occupancy bit, plus the one
/// extra child word.
pub fn internal_max_entries(key_type: Type) -> usize {
    (8 * page_size() - 73) / (key_type.len() * 8 + 33)
}

/// Page-number slots per header page.
pub fn header_num_slots() -> usize {
    (page_size() - 8) * 8
}

fn bitmap_len(slots: usize) -> usize {
    (slots + 7) / 8
}

fn bit_get(bitmap: &[u8], i: usize) -> bool {
    bitmap[i / 8] & (1 << (i % 8)) != 0
}

fn bit_set(bitmap: &mut [u8], i: usize, value: bool) {
    if value {
        bitmap[i / 8] |= 1 << (i % 8);
    } else {
        bitmap[i / 8] &= !(1 << (i % 8));
    }
}

/// One internal-page entry: a key and the ids of the children on either
/// side of it. The record id names the key slot the entry was read from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BTreeEntry {
    key: Field,
    left_child: PageId,
    right_child: PageId,
    rid: Option<RecordId>,
}

impl BTreeEntry {
    pub fn new(key: Field, left_child: PageId, right_child: PageId) -> Self {
        BTreeEntry {
            key,
            left_child,
            right_child,
            rid: None,
        }
    }

    pub fn key(&self) -> &Field {
        &self.key
    }

    pub fn set_key(&mut self, key: Field) {
        self.key = key;
    }

    pub fn left_child(&self) -> PageId {
        self.left_child
    }

    pub fn set_left_child(&mut self, pid: PageId) {
        self.left_child = pid;
    }

    pub fn right_child(&self) -> PageId {
        self.right_child
    }

    pub fn set_right_child(&mut self, pid: PageId) {
        self.right_child = pid;
    }

    pub fn record_id(&self) -> Option<RecordId> {
        self.rid
    }

    pub fn set_record_id(&mut self, rid: Option<RecordId>) {
        self.rid = rid;
    }
}

/// The fixed page at file offset 0: names the current root and the head of
/// the header-page list. Page number 0 always refers to this page, so 0
/// doubles as the null page number.
#[derive(Debug, Clone)]
pub struct BTreeRootPtrPage {
    pid: PageId,
    root_no: u32,
    root_kind: PageKind,
    header_no: u32,
    dirtier: Option<TransactionId>,
    old_data: Vec<u8>,
}

impl BTreeRootPtrPage {
    pub fn new(pid: PageId, data: &[u8]) -> DbResult<Self> {
        if data.len() != ROOT_PTR_PAGE_SIZE {
            return Err(DbError::InvalidArgument(format!(
                "root pointer page {:?}: expected {} bytes, got {}",
                pid,
                ROOT_PTR_PAGE_SIZE,
                data.len()
            )));
        }
        let mut buf = data;
        let root_no = buf.get_u32();
        let kind_code = buf.get_u8();
        let root_kind = if root_no == 0 {
            PageKind::BTreeLeaf
        } else {
            PageKind::from_code(kind_code)?
        };
        let header_no = buf.get_u32();
        let mut page = BTreeRootPtrPage {
            pid,
            root_no,
            root_kind,
            header_no,
            dirtier: None,
            old_data: Vec::new(),
        };
        page.old_data = page.serialize();
        Ok(page)
    }

    pub fn empty_data() -> Vec<u8> {
        vec![0u8; ROOT_PTR_PAGE_SIZE]
    }

    pub fn id(&self) -> PageId {
        self.pid
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(ROOT_PTR_PAGE_SIZE);
        buf.put_u32(self.root_no);
        buf.put_u8(self.root_kind.code());
        buf.put_u32(self.header_no);
        buf.to_vec()
    }

    pub fn dirtier(&self) -> Option<TransactionId> {
        self.dirtier
    }

    pub fn set_dirtier(&mut self, dirtier: Option<TransactionId>) {
        self.dirtier = dirtier;
    }

    pub fn before_image_data(&self) -> &[u8] {
        &self.old_data
    }

    pub fn set_before_image_data(&mut self, data: Vec<u8>) {
        self.old_data = data;
    }

    pub fn root_id(&self) -> Option<PageId> {
        if self.root_no == 0 {
            None
        } else {
            Some(PageId::new(self.pid.table_id, self.root_no, self.root_kind))
        }
    }

    pub fn set_root_id(&mut self, root: Option<PageId>) -> DbResult<()> {
        match root {
            None => {
                self.root_no = 0;
                self.root_kind = PageKind::BTreeLeaf;
            }
            Some(pid) => {
                if pid.kind != PageKind::BTreeLeaf && pid.kind != PageKind::BTreeInternal {
                    return Err(DbError::Db(format!(
                        "{:?} cannot be the root of a B+ tree",
                        pid
                    )));
                }
                self.root_no = pid.page_no;
                self.root_kind = pid.kind;
            }
        }
        Ok(())
    }

    pub fn header_id(&self) -> Option<PageId> {
        if self.header_no == 0 {
            None
        } else {
            Some(PageId::new(
                self.pid.table_id,
                self.header_no,
                PageKind::BTreeHeader,
            ))
        }
    }

    pub fn set_header_id(&mut self, header: Option<PageId>) -> DbResult<()> {
        match header {
            None => self.header_no = 0,
            Some(pid) => {
                if pid.kind != PageKind::BTreeHeader {
                    return Err(DbError::Db(format!("{:?} is not a header page", pid)));
                }
                self.header_no = pid.page_no;
            }
        }
        Ok(())
    }
}

/// A header page: a doubly linked list node carrying a bitmap of used page
/// numbers. `init` marks every slot used; freeing a page clears its bit.
#[derive(Debug, Clone)]
pub struct BTreeHeaderPage {
    pid: PageId,
    prev_no: u32,
    next_no: u32,
    bitmap: Vec<u8>,
    dirtier: Option<TransactionId>,
    old_data: Vec<u8>,
}

impl BTreeHeaderPage {
    pub fn new(pid: PageId, data: &[u8]) -> DbResult<Self> {
        if data.len() != page_size() {
            return Err(DbError::InvalidArgument(format!(
                "header page {:?}: expected {} bytes, got {}",
                pid,
                page_size(),
                data.len()
            )));
        }
        let mut buf = data;
        let prev_no = buf.get_u32();
        let next_no = buf.get_u32();
        let bitmap = buf.to_vec();
        let mut page = BTreeHeaderPage {
            pid,
            prev_no,
            next_no,
            bitmap,
            dirtier: None,
            old_data: Vec::new(),
        };
        page.old_data = page.serialize();
        Ok(page)
    }

    pub fn id(&self) -> PageId {
        self.pid
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(page_size());
        buf.put_u32(self.prev_no);
        buf.put_u32(self.next_no);
        buf.put_slice(&self.bitmap);
        buf.to_vec()
    }

    pub fn dirtier(&self) -> Option<TransactionId> {
        self.dirtier
    }

    pub fn set_dirtier(&mut self, dirtier: Option<TransactionId>) {
        self.dirtier = dirtier;
    }

    pub fn before_image_data(&self) -> &[u8] {
        &self.old_data
    }

    pub fn set_before_image_data(&mut self, data: Vec<u8>) {
        self.old_data = data;
    }

    /// Marks every slot used; a fresh header page frees nothing.
    pub fn init(&mut self) {
        for byte in self.bitmap.iter_mut() {
            *byte = 0xff;
        }
    }

    pub fn num_slots(&self) -> usize {
        self.bitmap.len() * 8
    }

    pub fn is_slot_used(&self, i: usize) -> bool {
        bit_get(&self.bitmap, i)
    }

    pub fn mark_slot_used(&mut self, i: usize, used: bool) {
        bit_set(&mut self.bitmap, i, used);
    }

    /// The first free slot, if any.
    pub fn empty_slot(&self) -> Option<usize> {
        (0..self.num_slots()).find(|&i| !self.is_slot_used(i))
    }

    pub fn prev_id(&self) -> Option<PageId> {
        if self.prev_no == 0 {
            None
        } else {
            Some(PageId::new(
                self.pid.table_id,
                self.prev_no,
                PageKind::BTreeHeader,
            ))
        }
    }

    pub fn set_prev_id(&mut self, prev: Option<PageId>) {
        self.prev_no = prev.map(|p| p.page_no).unwrap_or(0);
    }

    pub fn next_id(&self) -> Option<PageId> {
        if self.next_no == 0 {
            None
        } else {
            Some(PageId::new(
                self.pid.table_id,
                self.next_no,
                PageKind::BTreeHeader,
            ))
        }
    }

    pub fn set_next_id(&mut self, next: Option<PageId>) {
        self.next_no = next.map(|p| p.page_no).unwrap_or(0);
    }
}

/// A leaf page: parent and sibling pointers, an occupancy bitmap, and
/// fixed-width tuple slots kept in key order.
#[derive(Debug, Clone)]
pub struct BTreeLeafPage {
    pid: PageId,
    td: TupleDesc,
    key_field: usize,
    parent_no: u32,
    left_no: u32,
    right_no: u32,
    bitmap: Vec<u8>,
    tuples: Vec<Option<Tuple>>,
    slots: usize,
    dirtier: Option<TransactionId>,
    old_data: Vec<u8>,
}

impl BTreeLeafPage {
    pub fn new(pid: PageId, data: &[u8], td: TupleDesc, key_field: usize) -> DbResult<Self> {
        if data.len() != page_size() {
            return Err(DbError::InvalidArgument(format!(
                "leaf page {:?}: expected {} bytes, got {}",
                pid,
                page_size(),
                data.len()
            )));
        }
        let slots = leaf_max_tuples(&td);
        let bitmap_len = bitmap_len(slots);
        let mut buf = &data[..];
        let parent_no = buf.get_u32();
        let left_no = buf.get_u32();
        let right_no = buf.get_u32();
        let bitmap = buf[..bitmap_len].to_vec();
        buf.advance(bitmap_len);

        let tuple_size = td.size();
        let mut tuples = Vec::with_capacity(slots);
        for i in 0..slots {
            let mut slice = &buf[..tuple_size];
            if bit_get(&bitmap, i) {
                let mut t = Tuple::parse(&td, &mut slice)?;
                t.set_record_id(Some(RecordId::new(pid, i)));
                tuples.push(Some(t));
            } else {
                tuples.push(None);
            }
            buf.advance(tuple_size);
        }

        let mut page = BTreeLeafPage {
            pid,
            td,
            key_field,
            parent_no,
            left_no,
            right_no,
            bitmap,
            tuples,
            slots,
            dirtier: None,
            old_data: Vec::new(),
        };
        page.old_data = page.serialize();
        Ok(page)
    }

    pub fn id(&self) -> PageId {
        self.pid
    }

    pub fn serialize(&self) -> Vec<u8> {
        let page_size = page_size();
        let mut buf = BytesMut::with_capacity(page_size);
        buf.put_u32(self.parent_no);
        buf.put_u32(self.left_no);
        buf.put_u32(self.right_no);
        buf.put_slice(&self.bitmap);
        let tuple_size = self.td.size();
        for slot in &self.tuples {
            match slot {
                Some(t) => t.serialize(&mut buf),
                None => buf.put_bytes(0, tuple_size),
            }
        }
        buf.put_bytes(0, page_size - buf.len());
        buf.to_vec()
    }

    pub fn dirtier(&self) -> Option<TransactionId> {
        self.dirtier
    }

    pub fn set_dirtier(&mut self, dirtier: Option<TransactionId>) {
        self.dirtier = dirtier;
    }

    pub fn before_image_data(&self) -> &[u8] {
        &self.old_data
    }

    pub fn set_before_image_data(&mut self, data: Vec<u8>) {
        self.old_data = data;
    }

    pub fn key_field(&self) -> usize {
        self.key_field
    }

    pub fn max_tuples(&self) -> usize {
        self.slots
    }

    pub fn is_slot_used(&self, i: usize) -> bool {
        bit_get(&self.bitmap, i)
    }

    pub fn num_empty_slots(&self) -> usize {
        (0..self.slots).filter(|&i| !self.is_slot_used(i)).count()
    }

    pub fn num_tuples(&self) -> usize {
        self.slots - self.num_empty_slots()
    }

    pub fn parent_id(&self) -> PageId {
        if self.parent_no == 0 {
            PageId::root_ptr(self.pid.table_id)
        } else {
            PageId::new(self.pid.table_id, self.parent_no, PageKind::BTreeInternal)
        }
    }

    pub fn set_parent_id(&mut self, parent: PageId) -> DbResult<()> {
        match parent.kind {
            PageKind::BTreeRootPtr => self.parent_no = 0,
            PageKind::BTreeInternal if parent.table_id == self.pid.table_id => {
                self.parent_no = parent.page_no
            }
            _ => {
                return Err(DbError::Db(format!(
                    "{:?} cannot be the parent of leaf {:?}",
                    parent, self.pid
                )))
            }
        }
        Ok(())
    }

    pub fn left_sibling_id(&self) -> Option<PageId> {
        if self.left_no == 0 {
            None
        } else {
            Some(PageId::new(
                self.pid.table_id,
                self.left_no,
                PageKind::BTreeLeaf,
            ))
        }
    }

    pub fn set_left_sibling_id(&mut self, left: Option<PageId>) -> DbResult<()> {
        if let Some(pid) = left {
            if pid.kind != PageKind::BTreeLeaf || pid.table_id != self.pid.table_id {
                return Err(DbError::Db(format!(
                    "{:?} cannot be a sibling of leaf {:?}",
                    pid, self.pid
                )));
            }
        }
        self.left_no = left.map(|p| p.page_no).unwrap_or(0);
        Ok(())
    }

    pub fn right_sibling_id(&self) -> Option<PageId> {
        if self.right_no == 0 {
            None
        } else {
            Some(PageId::new(
                self.pid.table_id,
                self.right_no,
                PageKind::BTreeLeaf,
            ))
        }
    }

    pub fn set_right_sibling_id(&mut self, right: Option<PageId>) -> DbResult<()> {
        if let Some(pid) = right {
            if pid.kind != PageKind::BTreeLeaf || pid.table_id != self.pid.table_id {
                return Err(DbError::Db(format!(
                    "{:?} cannot be a sibling of leaf {:?}",
                    pid, self.pid
                )));
            }
        }
        self.right_no = right.map(|p| p.page_no).unwrap_or(0);
        Ok(())
    }

    /// Occupied tuples in ascending slot (and therefore key) order.
    pub fn iter(&self) -> impl Iterator<Item = &Tuple> {
        self.tuples.iter().flatten()
    }

    /// Occupied tuples in descending key order.
    pub fn riter(&self) -> impl Iterator<Item = &Tuple> {
        self.tuples.iter().rev().flatten()
    }

    fn key_of(&self, t: &Tuple) -> Field {
        t.field(self.key_field).clone()
    }

    fn move_record(&mut self, from: usize, to: usize) {
        if !self.is_slot_used(to) && self.is_slot_used(from) {
            let mut t = self.tuples[from].take().expect("occupied slot has a tuple");
            t.set_record_id(Some(RecordId::new(self.pid, to)));
            bit_set(&mut self.bitmap, from, false);
            bit_set(&mut self.bitmap, to, true);
            self.tuples[to] = Some(t);
        }
    }

    /// Inserts the tuple, shifting records as needed to keep the page in
    /// key order.
    pub fn insert_tuple(&mut self, mut t: Tuple) -> DbResult<()> {
        if t.tuple_desc() != &self.td {
            return Err(DbError::Db(format!(
                "tuple schema does not match leaf {:?}",
                self.pid
            )));
        }
        let empty_slot = (0..self.slots)
            .find(|&i| !self.is_slot_used(i))
            .ok_or_else(|| {
                DbError::Db(format!("leaf {:?} has no empty slots", self.pid))
            })?;

        // Last slot holding a key less than or equal to the new key.
        let key = self.key_of(&t);
        let mut less_eq: Option<usize> = None;
        for i in 0..self.slots {
            if let Some(existing) = &self.tuples[i] {
                if self
                    .key_of(existing)
                    .compare(crate::tuple::Op::LessThanOrEq, &key)
                {
                    less_eq = Some(i);
                } else {
                    break;
                }
            }
        }

        let good_slot = match less_eq {
            Some(less_eq) if empty_slot < less_eq => {
                for i in empty_slot + 1..=less_eq {
                    self.move_record(i, i - 1);
                }
                less_eq
            }
            _ => {
                let bound = less_eq.map(|i| i as isize).unwrap_or(-1);
                let mut i = empty_slot as isize - 1;
                while i > bound {
                    self.move_record(i as usize, i as usize + 1);
                    i -= 1;
                }
                (bound + 1) as usize
            }
        };

        bit_set(&mut self.bitmap, good_slot, true);
        t.set_record_id(Some(RecordId::new(self.pid, good_slot)));
        self.tuples[good_slot] = Some(t);
        Ok(())
    }

    /// Clears the slot named by the tuple's record id.
    pub fn delete_tuple(&mut self, t: &Tuple) -> DbResult<()> {
        let rid = t.record_id().ok_or_else(|| {
            DbError::Db("cannot delete a tuple with no record id".to_string())
        })?;
        if rid.pid != self.pid {
            return Err(DbError::Db(format!(
                "tuple {:?} is not on leaf {:?}",
                rid, self.pid
            )));
        }
        if rid.tupleno >= self.slots || !self.is_slot_used(rid.tupleno) {
            return Err(DbError::Db(format!(
                "tuple slot {} of leaf {:?} is already empty",
                rid.tupleno, self.pid
            )));
        }
        bit_set(&mut self.bitmap, rid.tupleno, false);
        self.tuples[rid.tupleno] = None;
        Ok(())
    }
}

/// An internal page: a parent pointer, the kind of its children, and up to
/// `max_entries` keys in slots `1..=m` with child pointers in slots
/// `0..=m`. Key slot 0 is unused; the entry at slot `i` separates the
/// children at slots `i-1` (transitively, the previous used slot) and `i`.
#[derive(Debug, Clone)]
pub struct BTreeInternalPage {
    pid: PageId,
    td: TupleDesc,
    key_field: usize,
    parent_no: u32,
    child_kind: Option<PageKind>,
    bitmap: Vec<u8>,
    keys: Vec<Option<Field>>,
    children: Vec<u32>,
    slots: usize,
    dirtier: Option<TransactionId>,
    old_data: Vec<u8>,
}

impl BTreeInternalPage {
    pub fn new(pid: PageId, data: &[u8], td: TupleDesc, key_field: usize) -> DbResult<Self> {
        if data.len() != page_size() {
            return Err(DbError::InvalidArgument(format!(
                "internal page {:?}: expected {} bytes, got {}",
                pid,
                page_size(),
                data.len()
            )));
        }
        let key_type = td.field_type(key_field);
        let slots = internal_max_entries(key_type) + 1;
        let bitmap_len = bitmap_len(slots);

        let mut buf = &data[..];
        let parent_no = buf.get_u32();
        let kind_code = buf.get_u8();
        let child_kind = if kind_code == 0 {
            None
        } else {
            Some(PageKind::from_code(kind_code)?)
        };
        let bitmap = buf[..bitmap_len].to_vec();
        buf.advance(bitmap_len);

        let key_size = key_type.len();
        let mut keys: Vec<Option<Field>> = Vec::with_capacity(slots);
        keys.push(None);
        for i in 1..slots {
            let mut slice = &buf[..key_size];
            if bit_get(&bitmap, i) {
                keys.push(Some(key_type.parse(&mut slice)?));
            } else {
                keys.push(None);
            }
            buf.advance(key_size);
        }
        let mut children = Vec::with_capacity(slots);
        for _ in 0..slots {
            children.push(buf.get_u32());
        }

        let mut page = BTreeInternalPage {
            pid,
            td,
            key_field,
            parent_no,
            child_kind,
            bitmap,
            keys,
            children,
            slots,
            dirtier: None,
            old_data: Vec::new(),
        };
        page.old_data = page.serialize();
        Ok(page)
    }

    pub fn id(&self) -> PageId {
        self.pid
    }

    pub fn serialize(&self) -> Vec<u8> {
        let page_size = page_size();
        let key_size = self.td.field_type(self.key_field).len();
        let mut buf = BytesMut::with_capacity(page_size);
        buf.put_u32(self.parent_no);
        buf.put_u8(self.child_kind.map(|k| k.code()).unwrap_or(0));
        buf.put_slice(&self.bitmap);
        for i in 1..self.slots {
            match &self.keys[i] {
                Some(key) => key.serialize(&mut buf),
                None => buf.put_bytes(0, key_size),
            }
        }
        for child in &self.children {
            buf.put_u32(*child);
        }
        buf.put_bytes(0, page_size - buf.len());
        buf.to_vec()
    }

    pub fn dirtier(&self) -> Option<TransactionId> {
        self.dirtier
    }

    pub fn set_dirtier(&mut self, dirtier: Option<TransactionId>) {
        self.dirtier = dirtier;
    }

    pub fn before_image_data(&self) -> &[u8] {
        &self.old_data
    }

    pub fn set_before_image_data(&mut self, data: Vec<u8>) {
        self.old_data = data;
    }

    pub fn max_entries(&self) -> usize {
        self.slots - 1
    }

    pub fn is_slot_used(&self, i: usize) -> bool {
        bit_get(&self.bitmap, i)
    }

    /// Empty key slots; slot 0 never holds a key and is not counted.
    pub fn num_empty_slots(&self) -> usize {
        (1..self.slots).filter(|&i| !self.is_slot_used(i)).count()
    }

    pub fn num_entries(&self) -> usize {
        self.max_entries() - self.num_empty_slots()
    }

    pub fn parent_id(&self) -> PageId {
        if self.parent_no == 0 {
            PageId::root_ptr(self.pid.table_id)
        } else {
            PageId::new(self.pid.table_id, self.parent_no, PageKind::BTreeInternal)
        }
    }

    pub fn set_parent_id(&mut self, parent: PageId) -> DbResult<()> {
        match parent.kind {
            PageKind::BTreeRootPtr => self.parent_no = 0,
            PageKind::BTreeInternal if parent.table_id == self.pid.table_id => {
                self.parent_no = parent.page_no
            }
            _ => {
                return Err(DbError::Db(format!(
                    "{:?} cannot be the parent of internal page {:?}",
                    parent, self.pid
                )))
            }
        }
        Ok(())
    }

    pub fn child_kind(&self) -> Option<PageKind> {
        self.child_kind
    }

    fn child_id(&self, slot: usize) -> PageId {
        PageId::new(
            self.pid.table_id,
            self.children[slot],
            self.child_kind.expect("occupied page knows its child kind"),
        )
    }

    /// Every entry in ascending key order, with record ids naming their
    /// key slots.
    pub fn entries(&self) -> Vec<BTreeEntry> {
        let mut out = Vec::new();
        if !self.is_slot_used(0) {
            return out;
        }
        let mut prev_slot = 0;
        for i in 1..self.slots {
            if self.is_slot_used(i) {
                let key = self.keys[i].clone().expect("occupied key slot has a key");
                let mut e = BTreeEntry::new(key, self.child_id(prev_slot), self.child_id(i));
                e.set_record_id(Some(RecordId::new(self.pid, i)));
                out.push(e);
                prev_slot = i;
            }
        }
        out
    }

    /// Ids of every child, leftmost first.
    pub fn child_ids(&self) -> Vec<PageId> {
        let mut out = Vec::new();
        for i in 0..self.slots {
            if self.is_slot_used(i) {
                out.push(self.child_id(i));
            }
        }
        out
    }

    fn check_child(&self, child: PageId) -> DbResult<()> {
        if child.table_id != self.pid.table_id {
            return Err(DbError::Db(format!(
                "child {:?} belongs to a different table than {:?}",
                child, self.pid
            )));
        }
        match self.child_kind {
            Some(kind) if kind != child.kind => Err(DbError::Db(format!(
                "child {:?} does not match this page's child kind {:?}",
                child, kind
            ))),
            _ => Ok(()),
        }
    }

    fn move_entry(&mut self, from: usize, to: usize) {
        if !self.is_slot_used(to) && self.is_slot_used(from) {
            self.keys[to] = self.keys[from].take();
            self.children[to] = self.children[from];
            bit_set(&mut self.bitmap, from, false);
            bit_set(&mut self.bitmap, to, true);
        }
    }

    /// Inserts an entry, splicing its children into the existing pointer
    /// chain and shifting entries to keep keys ordered. One of the entry's
    /// children must already be a child of this page (except on the first
    /// insert).
    pub fn insert_entry(&mut self, e: &BTreeEntry) -> DbResult<()> {
        let key_type = self.td.field_type(self.key_field);
        if e.key().field_type() != key_type {
            return Err(DbError::Db(format!(
                "entry key type does not match internal page {:?}",
                self.pid
            )));
        }
        self.check_child(e.left_child())?;
        self.check_child(e.right_child())?;
        if e.left_child().kind != e.right_child().kind {
            return Err(DbError::Db(
                "entry children must be of the same kind".to_string(),
            ));
        }

        // First entry: fill slots 0 and 1 and adopt the child kind.
        if self.num_entries() == 0 {
            self.child_kind = Some(e.left_child().kind);
            self.children[0] = e.left_child().page_no;
            self.children[1] = e.right_child().page_no;
            self.keys[1] = Some(e.key().clone());
            bit_set(&mut self.bitmap, 0, true);
            bit_set(&mut self.bitmap, 1, true);
            return Ok(());
        }

        let empty_slot = (1..self.slots)
            .find(|&i| !self.is_slot_used(i))
            .ok_or_else(|| {
                DbError::Db(format!("internal page {:?} has no empty slots", self.pid))
            })?;

        // Find the child pointer the new entry hangs off of.
        let mut less_eq: Option<usize> = None;
        for i in 0..self.slots {
            if !self.is_slot_used(i) {
                continue;
            }
            if self.children[i] == e.left_child().page_no
                || self.children[i] == e.right_child().page_no
            {
                if i > 0 {
                    let key = self.keys[i].as_ref().expect("occupied key slot has a key");
                    if key.compare(crate::tuple::Op::GreaterThan, e.key()) {
                        return Err(DbError::Db(format!(
                            "attempt to insert invalid entry into {:?}: key ordering violated",
                            self.pid
                        )));
                    }
                }
                less_eq = Some(i);
                if self.children[i] == e.right_child().page_no {
                    self.children[i] = e.left_child().page_no;
                }
            } else if let Some(_found) = less_eq {
                let key = self.keys[i].as_ref().expect("occupied key slot has a key");
                if key.compare(crate::tuple::Op::LessThan, e.key()) {
                    return Err(DbError::Db(format!(
                        "attempt to insert invalid entry into {:?}: key ordering violated",
                        self.pid
                    )));
                }
                break;
            }
        }
        let less_eq = less_eq.ok_or_else(|| {
            DbError::Db(format!(
                "attempt to insert entry with unknown children into {:?}",
                self.pid
            ))
        })?;

        let good_slot = if empty_slot < less_eq {
            for i in empty_slot + 1..=less_eq {
                self.move_entry(i, i - 1);
            }
            less_eq
        } else {
            let mut i = empty_slot - 1;
            while i > less_eq {
                self.move_entry(i, i + 1);
                i -= 1;
            }
            less_eq + 1
        };

        bit_set(&mut self.bitmap, good_slot, true);
        self.keys[good_slot] = Some(e.key().clone());
        self.children[good_slot] = e.right_child().page_no;
        Ok(())
    }

    fn entry_slot(&self, e: &BTreeEntry) -> DbResult<usize> {
        let rid = e.record_id().ok_or_else(|| {
            DbError::Db("entry has no record id; it was never read from a page".to_string())
        })?;
        if rid.pid != self.pid {
            return Err(DbError::Db(format!(
                "entry {:?} is not on internal page {:?}",
                rid, self.pid
            )));
        }
        if rid.tupleno == 0 || rid.tupleno >= self.slots || !self.is_slot_used(rid.tupleno) {
            return Err(DbError::Db(format!(
                "entry slot {} of internal page {:?} is not in use",
                rid.tupleno, self.pid
            )));
        }
        Ok(rid.tupleno)
    }

    /// Rewrites the key and right child of an existing entry in place.
    pub fn update_entry(&mut self, e: &BTreeEntry) -> DbResult<()> {
        let slot = self.entry_slot(e)?;
        self.check_child(e.right_child())?;
        self.keys[slot] = Some(e.key().clone());
        self.children[slot] = e.right_child().page_no;
        Ok(())
    }

    /// Deletes the entry's key and its right child pointer.
    pub fn delete_key_and_right_child(&mut self, e: &BTreeEntry) -> DbResult<()> {
        let slot = self.entry_slot(e)?;
        self.keys[slot] = None;
        bit_set(&mut self.bitmap, slot, false);
        Ok(())
    }

    /// Deletes the entry's key and its left child pointer: the right child
    /// takes over the nearest occupied slot to the left.
    pub fn delete_key_and_left_child(&mut self, e: &BTreeEntry) -> DbResult<()> {
        let slot = self.entry_slot(e)?;
        for i in (0..slot).rev() {
            if self.is_slot_used(i) {
                self.children[i] = self.children[slot];
                break;
            }
        }
        self.keys[slot] = None;
        bit_set(&mut self.bitmap, slot, false);
        Ok(())
    }
}
