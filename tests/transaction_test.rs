mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

use common::{int_of, setup, tuple2, two_int_td};
use regolith::dbfile::DbFileIterator;
use regolith::errors::DbError;
use regolith::heap_file::HeapFile;
use regolith::lock_manager::Permissions;
use regolith::page::{PageId, PageKind};
use regolith::transaction::{Transaction, TransactionId};
use regolith::Database;

#[test]
fn aborted_inserts_are_invisible_and_unlocked() {
    let ctx = setup(16);
    let db = &ctx.db;
    let td = two_int_td();
    let table = ctx.heap_table("ghosts", td.clone());

    let tx = Transaction::new();
    db.buffer_pool()
        .insert_tuple(db, tx.id(), table, tuple2(&td, 7, 7))
        .unwrap();

    // The inserting transaction reads its own write.
    let file = db.catalog().db_file(table).unwrap();
    let mut it = file.iterator(tx.id());
    it.open(db).unwrap();
    assert!(it.has_next(db).unwrap());
    assert_eq!(int_of(&it.next(db).unwrap(), 0), 7);
    it.close();

    tx.abort(db).unwrap();

    // A fresh scan sees nothing, and the aborted transaction holds no
    // locks anymore.
    let pid = PageId::new(table, 0, PageKind::Heap);
    assert!(!db.buffer_pool().holds_lock(tx.id(), pid));

    let reader = Transaction::new();
    let mut it = file.iterator(reader.id());
    it.open(db).unwrap();
    assert!(!it.has_next(db).unwrap());
    it.close();
    reader.commit(db).unwrap();
}

#[test]
fn commit_survives_a_reopened_database() {
    let ctx = setup(16);
    let td = two_int_td();
    let data_path = ctx.dir.path().join("durable.dat");
    let log_path = ctx.dir.path().join("regolith.log");

    {
        let db = &ctx.db;
        let file = HeapFile::open(&data_path, td.clone()).unwrap();
        let table = regolith::dbfile::DbFile::id(&file);
        db.catalog().add_table(Arc::new(file), "durable", "");

        let tx = Transaction::new();
        for i in 0..10 {
            db.buffer_pool()
                .insert_tuple(db, tx.id(), table, tuple2(&td, i, i * i))
                .unwrap();
        }
        tx.commit(db).unwrap();
    }

    // A brand-new context over the same files sees every committed tuple.
    let db2 = Database::new(&log_path, 16).unwrap();
    let file = HeapFile::open(&data_path, td).unwrap();
    let table = regolith::dbfile::DbFile::id(&file);
    db2.catalog().add_table(Arc::new(file), "durable", "");

    let reader = Transaction::new();
    let mut it = db2.catalog().db_file(table).unwrap().iterator(reader.id());
    it.open(&db2).unwrap();
    let mut count = 0;
    while it.has_next(&db2).unwrap() {
        it.next(&db2).unwrap();
        count += 1;
    }
    it.close();
    reader.commit(&db2).unwrap();
    assert_eq!(count, 10);
}

#[test]
fn upgrade_deadlock_aborts_one_transaction() {
    let ctx = setup(16);
    let db = ctx.db.clone();
    let td = two_int_td();
    let table = ctx.heap_table("contested", td.clone());

    let seed = Transaction::new();
    db.buffer_pool()
        .insert_tuple(&db, seed.id(), table, tuple2(&td, 0, 0))
        .unwrap();
    seed.commit(&db).unwrap();

    let pid = PageId::new(table, 0, PageKind::Heap);
    let aborted = Arc::new(AtomicUsize::new(0));
    let committed = Arc::new(AtomicUsize::new(0));
    let barrier = Arc::new(Barrier::new(2));

    let mut handles = Vec::new();
    for _ in 0..2 {
        let db = db.clone();
        let aborted = aborted.clone();
        let committed = committed.clone();
        let barrier = barrier.clone();
        handles.push(thread::spawn(move || {
            let tid = TransactionId::new();
            db.buffer_pool()
                .get_page(&db, tid, pid, Permissions::ReadOnly)
                .unwrap();
            barrier.wait();
            match db.buffer_pool().get_page(&db, tid, pid, Permissions::ReadWrite) {
                Ok(_) => {
                    db.buffer_pool().transaction_complete(&db, tid, true).unwrap();
                    committed.fetch_add(1, Ordering::SeqCst);
                }
                Err(DbError::TransactionAborted) => {
                    db.buffer_pool()
                        .transaction_complete(&db, tid, false)
                        .unwrap();
                    aborted.fetch_add(1, Ordering::SeqCst);
                }
                Err(e) => panic!("unexpected error: {}", e),
            }
        }));
    }
    for h in handles {
        h.join().unwrap();
    }

    assert!(aborted.load(Ordering::SeqCst) >= 1);
    assert_eq!(
        aborted.load(Ordering::SeqCst) + committed.load(Ordering::SeqCst),
        2
    );

    // Everyone finished, so the page must be free for a fresh writer.
    let tx = Transaction::new();
    db.buffer_pool()
        .get_page(&db, tx.id(), pid, Permissions::ReadWrite)
        .unwrap();
    tx.commit(&db).unwrap();
}

#[test]
fn readers_share_a_page_and_writers_wait_for_them() {
    let ctx = setup(16);
    let db = ctx.db.clone();
    let td = two_int_td();
    let table = ctx.heap_table("shared", td.clone());

    let seed = Transaction::new();
    db.buffer_pool()
        .insert_tuple(&db, seed.id(), table, tuple2(&td, 0, 0))
        .unwrap();
    seed.commit(&db).unwrap();

    let pid = PageId::new(table, 0, PageKind::Heap);
    let r1 = TransactionId::new();
    let r2 = TransactionId::new();
    db.buffer_pool()
        .get_page(&db, r1, pid, Permissions::ReadOnly)
        .unwrap();
    db.buffer_pool()
        .get_page(&db, r2, pid, Permissions::ReadOnly)
        .unwrap();
    assert!(db.buffer_pool().holds_lock(r1, pid));
    assert!(db.buffer_pool().holds_lock(r2, pid));

    // A writer joins once both readers are gone.
    let writer = {
        let db = db.clone();
        thread::spawn(move || {
            let tid = TransactionId::new();
            db.buffer_pool()
                .get_page(&db, tid, pid, Permissions::ReadWrite)
                .unwrap();
            db.buffer_pool().transaction_complete(&db, tid, true).unwrap();
        })
    };
    thread::sleep(std::time::Duration::from_millis(50));
    db.buffer_pool().transaction_complete(&db, r1, true).unwrap();
    db.buffer_pool().transaction_complete(&db, r2, true).unwrap();
    writer.join().unwrap();
}

#[test]
fn unsafe_release_lets_another_writer_in() {
    let ctx = setup(16);
    let db = &ctx.db;
    let td = two_int_td();
    let table = ctx.heap_table("released", td.clone());

    let seed = Transaction::new();
    db.buffer_pool()
        .insert_tuple(db, seed.id(), table, tuple2(&td, 0, 0))
        .unwrap();
    seed.commit(db).unwrap();

    let pid = PageId::new(table, 0, PageKind::Heap);
    let t1 = TransactionId::new();
    db.buffer_pool()
        .get_page(db, t1, pid, Permissions::ReadWrite)
        .unwrap();
    db.buffer_pool().unsafe_release_page(t1, pid);
    assert!(!db.buffer_pool().holds_lock(t1, pid));

    let t2 = TransactionId::new();
    db.buffer_pool()
        .get_page(db, t2, pid, Permissions::ReadWrite)
        .unwrap();
    db.buffer_pool().transaction_complete(db, t2, true).unwrap();
    db.buffer_pool().transaction_complete(db, t1, true).unwrap();
}
