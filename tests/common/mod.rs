#![allow(dead_code)]

use std::sync::Arc;

use regolith::btree::BTreeFile;
use regolith::heap_file::HeapFile;
use regolith::tuple::{Field, Tuple, TupleDesc, Type};
use regolith::Database;
use tempfile::TempDir;

/// A database context rooted in a scratch directory that lives as long as
/// the test does.
pub struct TestDb {
    pub db: Arc<Database>,
    pub dir: TempDir,
}

pub fn setup(pool_capacity: usize) -> TestDb {
    let dir = TempDir::new().unwrap();
    let db = Database::new(dir.path().join("regolith.log"), pool_capacity).unwrap();
    TestDb {
        db: Arc::new(db),
        dir,
    }
}

impl TestDb {
    /// Registers a heap table backed by `<name>.dat` in the scratch dir.
    pub fn heap_table(&self, name: &str, td: TupleDesc) -> u32 {
        let file = HeapFile::open(self.dir.path().join(format!("{}.dat", name)), td).unwrap();
        let id = regolith::dbfile::DbFile::id(&file);
        self.db.catalog().add_table(Arc::new(file), name, "");
        id
    }

    /// Registers a B+ tree table, returning both the table id and a handle
    /// to the concrete file for direct on-disk inspection.
    pub fn btree_table(&self, name: &str, td: TupleDesc, key_field: usize) -> (u32, Arc<BTreeFile>) {
        let file = Arc::new(
            BTreeFile::open(
                self.dir.path().join(format!("{}.dat", name)),
                key_field,
                td,
            )
            .unwrap(),
        );
        let id = regolith::dbfile::DbFile::id(file.as_ref());
        self.db.catalog().add_table(file.clone(), name, "");
        (id, file)
    }
}

pub fn two_int_td() -> TupleDesc {
    TupleDesc::new(
        vec![Type::Int, Type::Int],
        vec![Some("a".to_string()), Some("b".to_string())],
    )
}

pub fn tuple2(td: &TupleDesc, a: i32, b: i32) -> Tuple {
    Tuple::new(td.clone(), vec![Field::Int(a), Field::Int(b)])
}

pub fn int_of(t: &Tuple, i: usize) -> i32 {
    match t.field(i) {
        Field::Int(v) => *v,
        other => panic!("expected an int field, found {:?}", other),
    }
}
