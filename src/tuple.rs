use bytes::{Buf, BufMut, BytesMut};
use std::fmt;

use crate::errors::{DbError, DbResult};
use crate::page::PageId;

/// On-disk width of the payload of a string field, in bytes. A serialized
/// string field is a 4-byte length followed by this many bytes of data,
/// zero-padded.
pub const STRING_LEN: usize = 128;

/// The field types tuples may carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Type {
    Int,
    Str,
}

impl Type {
    /// Number of bytes a field of this type occupies on disk.
    pub fn len(&self) -> usize {
        match self {
            Type::Int => 4,
            Type::Str => STRING_LEN + 4,
        }
    }

    /// Parses one field of this type off the front of `buf`.
    pub fn parse(&self, buf: &mut &[u8]) -> DbResult<Field> {
        if buf.remaining() < self.len() {
            return Err(DbError::InvalidArgument(format!(
                "short read: {} bytes remaining, field needs {}",
                buf.remaining(),
                self.len()
            )));
        }
        match self {
            Type::Int => Ok(Field::Int(buf.get_i32())),
            Type::Str => {
                let len = buf.get_u32() as usize;
                let mut data = vec![0u8; STRING_LEN];
                buf.copy_to_slice(&mut data);
                let len = len.min(STRING_LEN);
                let s = String::from_utf8_lossy(&data[..len]).into_owned();
                Ok(Field::Str(s))
            }
        }
    }
}

/// Comparison operators for predicates over fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Equals,
    GreaterThan,
    GreaterThanOrEq,
    LessThan,
    LessThanOrEq,
    NotEquals,
}

/// A typed field value.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Field {
    Int(i32),
    Str(String),
}

impl Field {
    pub fn field_type(&self) -> Type {
        match self {
            Field::Int(_) => Type::Int,
            Field::Str(_) => Type::Str,
        }
    }

    /// Appends the big-endian encoding of this field to `buf`.
    pub fn serialize(&self, buf: &mut BytesMut) {
        match self {
            Field::Int(v) => buf.put_i32(*v),
            Field::Str(s) => {
                let bytes = s.as_bytes();
                let len = bytes.len().min(STRING_LEN);
                buf.put_u32(len as u32);
                buf.put_slice(&bytes[..len]);
                buf.put_bytes(0, STRING_LEN - len);
            }
        }
    }

    /// Compares `self op other`. Fields of different types are never equal
    /// and never ordered.
    pub fn compare(&self, op: Op, other: &Field) -> bool {
        let ord = match (self, other) {
            (Field::Int(a), Field::Int(b)) => a.cmp(b),
            (Field::Str(a), Field::Str(b)) => a.cmp(b),
            _ => {
                return match op {
                    Op::Equals => false,
                    Op::NotEquals => true,
                    _ => false,
                }
            }
        };
        match op {
            Op::Equals => ord.is_eq(),
            Op::GreaterThan => ord.is_gt(),
            Op::GreaterThanOrEq => ord.is_ge(),
            Op::LessThan => ord.is_lt(),
            Op::LessThanOrEq => ord.is_le(),
            Op::NotEquals => ord.is_ne(),
        }
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Field::Int(v) => write!(f, "{}", v),
            Field::Str(s) => write!(f, "{}", s),
        }
    }
}

/// A predicate pushed into the B+ tree search iterator.
#[derive(Debug, Clone)]
pub struct IndexPredicate {
    pub op: Op,
    pub field: Field,
}

impl IndexPredicate {
    pub fn new(op: Op, field: Field) -> Self {
        IndexPredicate { op, field }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct TdItem {
    field_type: Type,
    name: Option<String>,
}

/// The schema of a tuple: an ordered list of typed, optionally named fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TupleDesc {
    items: Vec<TdItem>,
}

impl TupleDesc {
    pub fn new(types: Vec<Type>, names: Vec<Option<String>>) -> Self {
        let items = types
            .into_iter()
            .zip(names)
            .map(|(field_type, name)| TdItem { field_type, name })
            .collect();
        TupleDesc { items }
    }

    /// A schema with unnamed fields, handy in tests.
    pub fn anonymous(types: Vec<Type>) -> Self {
        let names = vec![None; types.len()];
        Self::new(types, names)
    }

    pub fn num_fields(&self) -> usize {
        self.items.len()
    }

    pub fn field_type(&self, i: usize) -> Type {
        self.items[i].field_type
    }

    pub fn field_name(&self, i: usize) -> Option<&str> {
        self.items[i].name.as_deref()
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.items
            .iter()
            .position(|item| item.name.as_deref() == Some(name))
    }

    /// Size in bytes of one tuple under this schema.
    pub fn size(&self) -> usize {
        self.items.iter().map(|item| item.field_type.len()).sum()
    }
}

/// The location of a tuple: its page and slot number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RecordId {
    pub pid: PageId,
    pub tupleno: usize,
}

impl RecordId {
    pub fn new(pid: PageId, tupleno: usize) -> Self {
        RecordId { pid, tupleno }
    }
}

/// An ordered array of typed fields plus its storage location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tuple {
    td: TupleDesc,
    rid: Option<RecordId>,
    fields: Vec<Field>,
}

impl Tuple {
    pub fn new(td: TupleDesc, fields: Vec<Field>) -> Self {
        assert_eq!(td.num_fields(), fields.len());
        Tuple {
            td,
            rid: None,
            fields,
        }
    }

    pub fn tuple_desc(&self) -> &TupleDesc {
        &self.td
    }

    pub fn field(&self, i: usize) -> &Field {
        &self.fields[i]
    }

    pub fn set_field(&mut self, i: usize, f: Field) {
        self.fields[i] = f;
    }

    pub fn record_id(&self) -> Option<RecordId> {
        self.rid
    }

    pub fn set_record_id(&mut self, rid: Option<RecordId>) {
        self.rid = rid;
    }

    /// Appends the big-endian encoding of all fields to `buf`.
    pub fn serialize(&self, buf: &mut BytesMut) {
        for f in &self.fields {
            f.serialize(buf);
        }
    }

    /// Parses a tuple off the front of `buf` under the given schema.
    pub fn parse(td: &TupleDesc, buf: &mut &[u8]) -> DbResult<Tuple> {
        let mut fields = Vec::with_capacity(td.num_fields());
        for i in 0..td.num_fields() {
            fields.push(td.field_type(i).parse(buf)?);
        }
        Ok(Tuple::new(td.clone(), fields))
    }
}

impl fmt::Display for Tuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for field in &self.fields {
            if !first {
                write!(f, "\t")?;
            }
            write!(f, "{}", field)?;
            first = false;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn int_field_round_trip() {
        let mut buf = BytesMut::new();
        Field::Int(-42).serialize(&mut buf);
        assert_eq!(buf.len(), 4);
        let mut slice = &buf[..];
        let parsed = Type::Int.parse(&mut slice).unwrap();
        assert_eq!(parsed, Field::Int(-42));
    }

    #[test]
    fn string_field_round_trip_and_padding() {
        let mut buf = BytesMut::new();
        Field::Str("hello".to_string()).serialize(&mut buf);
        assert_eq!(buf.len(), STRING_LEN + 4);
        let mut slice = &buf[..];
        let parsed = Type::Str.parse(&mut slice).unwrap();
        assert_eq!(parsed, Field::Str("hello".to_string()));
    }

    #[test]
    fn field_comparisons() {
        let a = Field::Int(1);
        let b = Field::Int(2);
        assert!(a.compare(Op::LessThan, &b));
        assert!(b.compare(Op::GreaterThanOrEq, &b));
        assert!(a.compare(Op::NotEquals, &b));
        assert!(!a.compare(Op::Equals, &Field::Str("1".to_string())));
    }

    #[test]
    fn tuple_desc_size_and_lookup() {
        let td = TupleDesc::new(
            vec![Type::Int, Type::Str],
            vec![Some("id".to_string()), Some("name".to_string())],
        );
        assert_eq!(td.size(), 4 + STRING_LEN + 4);
        assert_eq!(td.index_of("name"), Some(1));
        assert_eq!(td.index_of("missing"), None);
    }

    #[test]
    fn short_read_is_rejected() {
        let data = [0u8; 2];
        let mut slice = &data[..];
        assert!(matches!(
            Type::Int.parse(&mut slice),
            Err(DbError::InvalidArgument(_))
        ));
    }
}
