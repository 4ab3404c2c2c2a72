use criterion::{black_box, criterion_group, criterion_main, Criterion};
use std::sync::Arc;

use regolith::btree::BTreeFile;
use regolith::dbfile::{DbFile, DbFileIterator};
use regolith::heap_file::HeapFile;
use regolith::transaction::Transaction;
use regolith::tuple::{Field, IndexPredicate, Op, Tuple, TupleDesc, Type};
use regolith::Database;
use tempfile::TempDir;

fn two_int_td() -> TupleDesc {
    TupleDesc::anonymous(vec![Type::Int, Type::Int])
}

fn tuple2(td: &TupleDesc, a: i32, b: i32) -> Tuple {
    Tuple::new(td.clone(), vec![Field::Int(a), Field::Int(b)])
}

fn setup_heap(dir: &TempDir, rows: i32) -> (Database, u32) {
    let db = Database::new(dir.path().join("bench.log"), 64).unwrap();
    let td = two_int_td();
    let file = HeapFile::open(dir.path().join("bench_heap.dat"), td.clone()).unwrap();
    let table = file.id();
    db.catalog().add_table(Arc::new(file), "bench_heap", "");

    let tx = Transaction::new();
    for i in 0..rows {
        db.buffer_pool()
            .insert_tuple(&db, tx.id(), table, tuple2(&td, i, i))
            .unwrap();
    }
    tx.commit(&db).unwrap();
    (db, table)
}

fn setup_btree(dir: &TempDir, rows: i32) -> (Database, Arc<BTreeFile>) {
    let db = Database::new(dir.path().join("bench_btree.log"), 64).unwrap();
    let td = two_int_td();
    let file = Arc::new(
        BTreeFile::open(dir.path().join("bench_btree.dat"), 0, td.clone()).unwrap(),
    );
    db.catalog().add_table(file.clone(), "bench_btree", "");
    let table = file.id();

    let tx = Transaction::new();
    for i in 0..rows {
        db.buffer_pool()
            .insert_tuple(&db, tx.id(), table, tuple2(&td, i, i))
            .unwrap();
    }
    tx.commit(&db).unwrap();
    (db, file)
}

fn bench_heap_scan(c: &mut Criterion) {
    let dir = TempDir::new().unwrap();
    let (db, table) = setup_heap(&dir, 5_000);

    c.bench_function("heap_full_scan_5k", |b| {
        b.iter(|| {
            let tx = Transaction::new();
            let mut it = db.catalog().db_file(table).unwrap().iterator(tx.id());
            it.open(&db).unwrap();
            let mut count = 0usize;
            while it.has_next(&db).unwrap() {
                black_box(it.next(&db).unwrap());
                count += 1;
            }
            it.close();
            db.buffer_pool().transaction_complete(&db, tx.id(), true).unwrap();
            count
        })
    });
}

fn bench_btree_lookup(c: &mut Criterion) {
    let dir = TempDir::new().unwrap();
    let (db, file) = setup_btree(&dir, 5_000);

    c.bench_function("btree_point_lookup", |b| {
        let mut key = 0;
        b.iter(|| {
            key = (key + 997) % 5_000;
            let tx = Transaction::new();
            let mut it =
                file.index_iterator(tx.id(), IndexPredicate::new(Op::Equals, Field::Int(key)));
            it.open(&db).unwrap();
            let found = it.has_next(&db).unwrap();
            it.close();
            db.buffer_pool().transaction_complete(&db, tx.id(), true).unwrap();
            black_box(found)
        })
    });
}

criterion_group!(benches, bench_heap_scan, bench_btree_lookup);
criterion_main!(benches);
