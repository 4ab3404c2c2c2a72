mod common;

use common::{int_of, setup, tuple2, two_int_td};
use regolith::dbfile::DbFileIterator;
use regolith::errors::DbError;
use regolith::transaction::Transaction;

#[test]
fn inserted_tuples_come_back_from_the_iterator() {
    let ctx = setup(16);
    let db = &ctx.db;
    let td = two_int_td();
    let table = ctx.heap_table("pairs", td.clone());

    let tx = Transaction::new();
    for i in 0..10 {
        db.buffer_pool()
            .insert_tuple(db, tx.id(), table, tuple2(&td, i, 2 * i))
            .unwrap();
    }
    tx.commit(db).unwrap();

    let reader = Transaction::new();
    let mut it = db.catalog().db_file(table).unwrap().iterator(reader.id());
    it.open(db).unwrap();
    let mut seen = Vec::new();
    while it.has_next(db).unwrap() {
        let t = it.next(db).unwrap();
        assert_eq!(int_of(&t, 1), 2 * int_of(&t, 0));
        seen.push(int_of(&t, 0));
    }
    it.close();
    reader.commit(db).unwrap();

    seen.sort_unstable();
    assert_eq!(seen, (0..10).collect::<Vec<_>>());
}

#[test]
fn inserts_grow_the_file_page_by_page() {
    let ctx = setup(16);
    let db = &ctx.db;
    let td = two_int_td();
    let table = ctx.heap_table("grown", td.clone());

    let tx = Transaction::new();
    for i in 0..2000 {
        db.buffer_pool()
            .insert_tuple(db, tx.id(), table, tuple2(&td, i, i))
            .unwrap();
    }
    tx.commit(db).unwrap();

    let file = db.catalog().db_file(table).unwrap();
    assert!(file.num_pages().unwrap() >= 2);

    let reader = Transaction::new();
    let mut it = file.iterator(reader.id());
    it.open(db).unwrap();
    let mut count = 0;
    while it.has_next(db).unwrap() {
        it.next(db).unwrap();
        count += 1;
    }
    it.close();
    reader.commit(db).unwrap();
    assert_eq!(count, 2000);
}

#[test]
fn deleted_tuples_disappear_and_slots_are_reused() {
    let ctx = setup(16);
    let db = &ctx.db;
    let td = two_int_td();
    let table = ctx.heap_table("condemned", td.clone());

    let tx = Transaction::new();
    for i in 0..20 {
        db.buffer_pool()
            .insert_tuple(db, tx.id(), table, tuple2(&td, i, i))
            .unwrap();
    }
    tx.commit(db).unwrap();

    // Delete the even rows.
    let tx = Transaction::new();
    let file = db.catalog().db_file(table).unwrap();
    let mut it = file.iterator(tx.id());
    it.open(db).unwrap();
    let mut victims = Vec::new();
    while it.has_next(db).unwrap() {
        let t = it.next(db).unwrap();
        if int_of(&t, 0) % 2 == 0 {
            victims.push(t);
        }
    }
    it.close();
    for v in &victims {
        db.buffer_pool().delete_tuple(db, tx.id(), v).unwrap();
    }
    tx.commit(db).unwrap();

    let pages_before = file.num_pages().unwrap();

    // Re-insert; freed slots are found before the file grows.
    let tx = Transaction::new();
    for i in 0..10 {
        db.buffer_pool()
            .insert_tuple(db, tx.id(), table, tuple2(&td, 100 + i, 0))
            .unwrap();
    }
    tx.commit(db).unwrap();
    assert_eq!(file.num_pages().unwrap(), pages_before);

    let reader = Transaction::new();
    let mut it = file.iterator(reader.id());
    it.open(db).unwrap();
    let mut odd = 0;
    let mut reinserted = 0;
    while it.has_next(db).unwrap() {
        let t = it.next(db).unwrap();
        let a = int_of(&t, 0);
        if a >= 100 {
            reinserted += 1;
        } else {
            assert_eq!(a % 2, 1);
            odd += 1;
        }
    }
    it.close();
    reader.commit(db).unwrap();
    assert_eq!(odd, 10);
    assert_eq!(reinserted, 10);
}

#[test]
fn closed_iterator_refuses_next() {
    let ctx = setup(16);
    let db = &ctx.db;
    let td = two_int_td();
    let table = ctx.heap_table("closed", td.clone());

    let tx = Transaction::new();
    db.buffer_pool()
        .insert_tuple(db, tx.id(), table, tuple2(&td, 1, 1))
        .unwrap();
    tx.commit(db).unwrap();

    let reader = Transaction::new();
    let mut it = db.catalog().db_file(table).unwrap().iterator(reader.id());
    assert!(matches!(it.next(db), Err(DbError::Db(_))));
    it.open(db).unwrap();
    assert!(it.has_next(db).unwrap());
    it.close();
    assert!(!it.has_next(db).unwrap());
    assert!(matches!(it.next(db), Err(DbError::Db(_))));
    reader.commit(db).unwrap();
}

#[test]
fn rewind_restarts_the_scan() {
    let ctx = setup(16);
    let db = &ctx.db;
    let td = two_int_td();
    let table = ctx.heap_table("rewound", td.clone());

    let tx = Transaction::new();
    for i in 0..5 {
        db.buffer_pool()
            .insert_tuple(db, tx.id(), table, tuple2(&td, i, i))
            .unwrap();
    }
    tx.commit(db).unwrap();

    let reader = Transaction::new();
    let mut it = db.catalog().db_file(table).unwrap().iterator(reader.id());
    it.open(db).unwrap();
    let mut first = 0;
    while it.has_next(db).unwrap() {
        it.next(db).unwrap();
        first += 1;
    }
    it.rewind(db).unwrap();
    let mut second = 0;
    while it.has_next(db).unwrap() {
        it.next(db).unwrap();
        second += 1;
    }
    it.close();
    reader.commit(db).unwrap();
    assert_eq!(first, 5);
    assert_eq!(second, 5);
}

#[test]
fn schema_file_tables_accept_tuples() {
    use regolith::tuple::{Field, Tuple};

    let ctx = setup(16);
    let db = &ctx.db;
    let schema = ctx.dir.path().join("catalog.schema");
    std::fs::write(&schema, "people (id int pk, name string)\n").unwrap();
    db.catalog().load_schema(&schema).unwrap();

    let table = db.catalog().table_id("people").unwrap();
    let td = db.catalog().tuple_desc(table).unwrap();

    let tx = Transaction::new();
    let t = Tuple::new(
        td.clone(),
        vec![Field::Int(1), Field::Str("ada".to_string())],
    );
    db.buffer_pool().insert_tuple(db, tx.id(), table, t).unwrap();
    tx.commit(db).unwrap();

    let reader = Transaction::new();
    let mut it = db.catalog().db_file(table).unwrap().iterator(reader.id());
    it.open(db).unwrap();
    let t = it.next(db).unwrap();
    assert_eq!(t.field(1), &Field::Str("ada".to_string()));
    it.close();
    reader.commit(db).unwrap();
}
