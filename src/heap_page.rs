use bytes::{BufMut, BytesMut};

use crate::buffer_pool;
use crate::errors::{DbError, DbResult};
use crate::page::PageId;
use crate::transaction::TransactionId;
use crate::tuple::{RecordId, Tuple, TupleDesc};

/// A slotted heap page: an occupancy bitmap header followed by fixed-width
/// tuple slots. Each slot bit guards one slot; unused slot bytes are zero.
#[derive(Debug, Clone)]
pub struct HeapPage {
    pid: PageId,
    td: TupleDesc,
    header: Vec<u8>,
    tuples: Vec<Option<Tuple>>,
    num_slots: usize,
    dirtier: Option<TransactionId>,
    old_data: Vec<u8>,
}

/// Tuples per page: each slot costs `tuple_size` bytes plus one header bit.
pub fn slots_per_page(td: &TupleDesc) -> usize {
    (buffer_pool::page_size() * 8) / (td.size() * 8 + 1)
}

fn header_len(num_slots: usize) -> usize {
    (num_slots + 7) / 8
}

impl HeapPage {
    pub fn new(pid: PageId, data: &[u8], td: TupleDesc) -> DbResult<Self> {
        let page_size = buffer_pool::page_size();
        if data.len() != page_size {
            return Err(DbError::InvalidArgument(format!(
                "heap page {:?}: expected {} bytes, got {}",
                pid,
                page_size,
                data.len()
            )));
        }
        let num_slots = slots_per_page(&td);
        let header_len = header_len(num_slots);
        let header = data[..header_len].to_vec();

        let mut tuples = Vec::with_capacity(num_slots);
        let tuple_size = td.size();
        for i in 0..num_slots {
            let start = header_len + i * tuple_size;
            let mut slice = &data[start..start + tuple_size];
            if header[i / 8] & (1 << (i % 8)) != 0 {
                let mut t = Tuple::parse(&td, &mut slice)?;
                t.set_record_id(Some(RecordId::new(pid, i)));
                tuples.push(Some(t));
            } else {
                tuples.push(None);
            }
        }

        let mut page = HeapPage {
            pid,
            td,
            header,
            tuples,
            num_slots,
            dirtier: None,
            old_data: Vec::new(),
        };
        page.old_data = page.serialize();
        Ok(page)
    }

    /// A zeroed page image, used when the file grows.
    pub fn empty_data() -> Vec<u8> {
        vec![0u8; buffer_pool::page_size()]
    }

    pub fn id(&self) -> PageId {
        self.pid
    }

    pub fn tuple_desc(&self) -> &TupleDesc {
        &self.td
    }

    pub fn serialize(&self) -> Vec<u8> {
        let page_size = buffer_pool::page_size();
        let mut buf = BytesMut::with_capacity(page_size);
        buf.put_slice(&self.header);
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

    pub fn num_slots(&self) -> usize {
        self.num_slots
    }

    pub fn is_slot_used(&self, i: usize) -> bool {
        self.header[i / 8] & (1 << (i % 8)) != 0
    }

    fn mark_slot_used(&mut self, i: usize, used: bool) {
        if used {
            self.header[i / 8] |= 1 << (i % 8);
        } else {
            self.header[i / 8] &= !(1 << (i % 8));
        }
    }

    pub fn num_empty_slots(&self) -> usize {
        (0..self.num_slots).filter(|&i| !self.is_slot_used(i)).count()
    }

    /// Places the tuple in the first empty slot and stamps its record id.
    pub fn insert_tuple(&mut self, mut t: Tuple) -> DbResult<()> {
        if t.tuple_desc() != &self.td {
            return Err(DbError::Db(format!(
                "tuple schema does not match page {:?}",
                self.pid
            )));
        }
        for i in 0..self.num_slots {
            if !self.is_slot_used(i) {
                t.set_record_id(Some(RecordId::new(self.pid, i)));
                self.mark_slot_used(i, true);
                self.tuples[i] = Some(t);
                return Ok(());
            }
        }
        Err(DbError::Db(format!(
            "heap page {:?} has no empty slots",
            self.pid
        )))
    }

    /// Clears the slot named by the tuple's record id.
    pub fn delete_tuple(&mut self, t: &Tuple) -> DbResult<()> {
        let rid = t.record_id().ok_or_else(|| {
            DbError::Db("cannot delete a tuple with no record id".to_string())
        })?;
        if rid.pid != self.pid {
            return Err(DbError::Db(format!(
                "tuple {:?} is not on page {:?}",
                rid, self.pid
            )));
        }
        if rid.tupleno >= self.num_slots || !self.is_slot_used(rid.tupleno) {
            return Err(DbError::Db(format!(
                "tuple slot {} of page {:?} is already empty",
                rid.tupleno, self.pid
            )));
        }
        self.mark_slot_used(rid.tupleno, false);
        self.tuples[rid.tupleno] = None;
        Ok(())
    }

    /// Occupied tuples in slot order.
    pub fn iter(&self) -> impl Iterator<Item = &Tuple> {
        self.tuples.iter().flatten()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::PageKind;
    use crate::tuple::{Field, Type};

    fn two_int_td() -> TupleDesc {
        TupleDesc::anonymous(vec![Type::Int, Type::Int])
    }

    fn tuple(td: &TupleDesc, a: i32, b: i32) -> Tuple {
        Tuple::new(td.clone(), vec![Field::Int(a), Field::Int(b)])
    }

    #[test]
    fn empty_page_has_all_slots_free() {
        let td = two_int_td();
        let pid = PageId::new(7, 0, PageKind::Heap);
        let page = HeapPage::new(pid, &HeapPage::empty_data(), td.clone()).unwrap();
        assert_eq!(page.num_empty_slots(), page.num_slots());
        assert_eq!(page.iter().count(), 0);
    }

    #[test]
    fn insert_serialize_parse_round_trip() {
        let td = two_int_td();
        let pid = PageId::new(7, 0, PageKind::Heap);
        let mut page = HeapPage::new(pid, &HeapPage::empty_data(), td.clone()).unwrap();
        for i in 0..10 {
            page.insert_tuple(tuple(&td, i, 2 * i)).unwrap();
        }
        assert_eq!(page.num_empty_slots(), page.num_slots() - 10);

        let reparsed = HeapPage::new(pid, &page.serialize(), td.clone()).unwrap();
        let mut seen: Vec<i32> = reparsed
            .iter()
            .map(|t| match t.field(0) {
                Field::Int(v) => *v,
                _ => panic!("unexpected field type"),
            })
            .collect();
        seen.sort_unstable();
        assert_eq!(seen, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn delete_frees_the_slot() {
        let td = two_int_td();
        let pid = PageId::new(7, 0, PageKind::Heap);
        let mut page = HeapPage::new(pid, &HeapPage::empty_data(), td.clone()).unwrap();
        page.insert_tuple(tuple(&td, 1, 2)).unwrap();
        let stored = page.iter().next().unwrap().clone();
        page.delete_tuple(&stored).unwrap();
        assert_eq!(page.num_empty_slots(), page.num_slots());
        assert!(page.delete_tuple(&stored).is_err());
    }
}
