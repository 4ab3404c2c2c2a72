mod common;

use std::sync::Arc;

use common::{int_of, setup, tuple2, two_int_td, TestDb};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use regolith::btree::BTreeFile;
use regolith::buffer_pool::{reset_page_size, set_page_size};
use regolith::dbfile::{DbFile, DbFileIterator};
use regolith::page::{Page, PageId};
use regolith::transaction::Transaction;
use regolith::tuple::{Field, IndexPredicate, Op, Tuple};
use regolith::Database;
use serial_test::serial;

struct LeafInfo {
    pid: PageId,
    left: Option<PageId>,
    right: Option<PageId>,
    keys: Vec<i32>,
}

fn key_of(t: &Tuple) -> i32 {
    int_of(t, 0)
}

/// Walks the on-disk tree, asserting the structural invariants: parent
/// pointers, per-page occupancy, key ordering within bounds, and a
/// consistent doubly linked leaf chain. Returns the total tuple count.
fn check_tree(file: &Arc<BTreeFile>) -> usize {
    let table = file.id();
    if file.num_pages().unwrap() == 0 {
        return 0;
    }
    let root_ptr = file.read_page(PageId::root_ptr(table)).unwrap();
    let Some(root_id) = root_ptr.as_root_ptr().unwrap().root_id() else {
        return 0;
    };

    let mut leaves = Vec::new();
    check_page(
        file,
        root_id,
        PageId::root_ptr(table),
        true,
        None,
        None,
        &mut leaves,
    );

    assert_eq!(leaves.first().unwrap().left, None);
    assert_eq!(leaves.last().unwrap().right, None);
    for pair in leaves.windows(2) {
        assert_eq!(pair[0].right, Some(pair[1].pid), "broken right-sibling link");
        assert_eq!(pair[1].left, Some(pair[0].pid), "broken left-sibling link");
        if let (Some(a), Some(b)) = (pair[0].keys.last(), pair[1].keys.first()) {
            assert!(a <= b, "keys out of order across the leaf chain");
        }
    }
    leaves.iter().map(|l| l.keys.len()).sum()
}

fn check_page(
    file: &Arc<BTreeFile>,
    pid: PageId,
    parent: PageId,
    is_root: bool,
    lower: Option<i32>,
    upper: Option<i32>,
    leaves: &mut Vec<LeafInfo>,
) {
    match file.read_page(pid).unwrap() {
        Page::Leaf(leaf) => {
            assert_eq!(leaf.parent_id(), parent, "leaf {:?} has a stale parent", pid);
            if !is_root {
                assert!(
                    leaf.num_tuples() >= leaf.max_tuples() / 2,
                    "leaf {:?} is under-occupied: {}/{}",
                    pid,
                    leaf.num_tuples(),
                    leaf.max_tuples()
                );
            }
            let keys: Vec<i32> = leaf.iter().map(key_of).collect();
            for w in keys.windows(2) {
                assert!(w[0] <= w[1], "leaf {:?} keys out of order", pid);
            }
            if let Some(lo) = lower {
                assert!(keys.iter().all(|k| *k >= lo), "leaf {:?} underflows its bound", pid);
            }
            if let Some(hi) = upper {
                assert!(keys.iter().all(|k| *k <= hi), "leaf {:?} overflows its bound", pid);
            }
            leaves.push(LeafInfo {
                pid,
                left: leaf.left_sibling_id(),
                right: leaf.right_sibling_id(),
                keys,
            });
        }
        Page::Internal(internal) => {
            assert_eq!(internal.parent_id(), parent, "internal {:?} has a stale parent", pid);
            if !is_root {
                // A fresh split leaves the left half one entry short of an
                // even share (the boundary entry was pushed up); deletes
                // rebalance it the next time they touch the page.
                assert!(
                    internal.num_entries() + 1 >= internal.max_entries() / 2,
                    "internal {:?} is under-occupied: {}/{}",
                    pid,
                    internal.num_entries(),
                    internal.max_entries()
                );
            }
            let entries = internal.entries();
            assert!(!entries.is_empty(), "internal {:?} has no entries", pid);
            assert_eq!(internal.child_ids().len(), entries.len() + 1);

            let keys: Vec<i32> = entries
                .iter()
                .map(|e| match e.key() {
                    Field::Int(v) => *v,
                    other => panic!("unexpected key type {:?}", other),
                })
                .collect();
            for w in keys.windows(2) {
                assert!(w[0] <= w[1], "internal {:?} keys out of order", pid);
            }

            for (i, e) in entries.iter().enumerate() {
                let lo = if i == 0 { lower } else { Some(keys[i - 1]) };
                check_page(file, e.left_child(), pid, false, lo, Some(keys[i]), leaves);
            }
            let last = entries.len() - 1;
            check_page(
                file,
                entries[last].right_child(),
                pid,
                false,
                Some(keys[last]),
                upper,
                leaves,
            );
        }
        other => panic!("unexpected page kind {:?} inside the tree", other.id()),
    }
}

fn insert_keys(ctx: &TestDb, table: u32, keys: &[i32], batch: usize) {
    let db = &ctx.db;
    let td = two_int_td();
    for chunk in keys.chunks(batch) {
        let tx = Transaction::new();
        for &k in chunk {
            db.buffer_pool()
                .insert_tuple(db, tx.id(), table, tuple2(&td, k, k))
                .unwrap();
        }
        tx.commit(db).unwrap();
    }
}

/// Deletes one tuple per key, locating each through the search iterator so
/// record ids are always current.
fn delete_keys(ctx: &TestDb, file: &Arc<BTreeFile>, keys: &[i32], batch: usize) {
    let db = &ctx.db;
    for chunk in keys.chunks(batch) {
        let tx = Transaction::new();
        for &k in chunk {
            let mut it =
                file.index_iterator(tx.id(), IndexPredicate::new(Op::Equals, Field::Int(k)));
            it.open(db).unwrap();
            assert!(
                it.has_next(db).unwrap(),
                "key {} vanished before deletion",
                k
            );
            let t = it.next(db).unwrap();
            it.close();
            db.buffer_pool().delete_tuple(db, tx.id(), &t).unwrap();
        }
        tx.commit(db).unwrap();
    }
}

fn scan_keys(db: &Database, table: u32) -> Vec<i32> {
    let tx = Transaction::new();
    let mut it = db.catalog().db_file(table).unwrap().iterator(tx.id());
    it.open(db).unwrap();
    let mut keys = Vec::new();
    while it.has_next(db).unwrap() {
        keys.push(key_of(&it.next(db).unwrap()));
    }
    it.close();
    tx.commit(db).unwrap();
    keys
}

#[test]
#[serial]
fn sorted_inserts_keep_the_tree_valid() {
    set_page_size(1024);
    let ctx = setup(64);
    let td = two_int_td();
    let (table, file) = ctx.btree_table("sorted", td, 0);

    let keys: Vec<i32> = (1..=1000).collect();
    for chunk in keys.chunks(100) {
        insert_keys(&ctx, table, chunk, 20);
        check_tree(&file);
    }

    assert_eq!(check_tree(&file), 1000);
    let scanned = scan_keys(&ctx.db, table);
    assert_eq!(scanned, keys);
    reset_page_size();
}

#[test]
#[serial]
fn reverse_deletes_rebalance_down_to_nothing() {
    set_page_size(1024);
    let ctx = setup(64);
    let td = two_int_td();
    let (table, file) = ctx.btree_table("drained", td, 0);

    let keys: Vec<i32> = (0..500).collect();
    insert_keys(&ctx, table, &keys, 50);
    assert_eq!(check_tree(&file), 500);

    let reversed: Vec<i32> = keys.iter().rev().copied().collect();
    for chunk in reversed.chunks(100) {
        delete_keys(&ctx, &file, chunk, 25);
        check_tree(&file);
    }

    assert_eq!(check_tree(&file), 0);
    assert!(scan_keys(&ctx.db, table).is_empty());
    reset_page_size();
}

#[test]
#[serial]
fn freed_pages_are_reused_after_mass_deletion() {
    set_page_size(1024);
    let ctx = setup(64);
    let td = two_int_td();
    let (table, file) = ctx.btree_table("recycled", td, 0);

    let keys: Vec<i32> = (0..500).collect();
    insert_keys(&ctx, table, &keys, 50);
    delete_keys(&ctx, &file, &keys.iter().rev().copied().collect::<Vec<_>>(), 50);

    let pages_after_drain = file.num_pages().unwrap();
    insert_keys(&ctx, table, &keys[..300], 50);
    assert_eq!(
        file.num_pages().unwrap(),
        pages_after_drain,
        "reinsertion should reuse freed pages instead of growing the file"
    );
    check_tree(&file);
    reset_page_size();
}

#[test]
#[serial]
fn search_iterators_honor_their_operators() {
    set_page_size(1024);
    let ctx = setup(64);
    let db = &ctx.db;
    let td = two_int_td();
    let (table, file) = ctx.btree_table("searched", td.clone(), 0);

    let keys: Vec<i32> = (0..200).collect();
    insert_keys(&ctx, table, &keys, 50);
    // Four extra copies of key 57.
    let tx = Transaction::new();
    for _ in 0..4 {
        db.buffer_pool()
            .insert_tuple(db, tx.id(), table, tuple2(&td, 57, -1))
            .unwrap();
    }
    tx.commit(db).unwrap();
    check_tree(&file);

    let collect = |op: Op, key: i32| -> Vec<i32> {
        let tx = Transaction::new();
        let mut it = file.index_iterator(tx.id(), IndexPredicate::new(op, Field::Int(key)));
        it.open(db).unwrap();
        let mut out = Vec::new();
        while it.has_next(db).unwrap() {
            out.push(key_of(&it.next(db).unwrap()));
        }
        it.close();
        tx.commit(db).unwrap();
        out
    };

    assert_eq!(collect(Op::Equals, 57).len(), 5);
    assert_eq!(collect(Op::Equals, 1000), Vec::<i32>::new());
    assert_eq!(collect(Op::GreaterThanOrEq, 195), vec![195, 196, 197, 198, 199]);
    assert_eq!(collect(Op::GreaterThan, 195), vec![196, 197, 198, 199]);
    assert_eq!(collect(Op::LessThanOrEq, 3), vec![0, 1, 2, 3]);
    assert_eq!(collect(Op::LessThan, 0), Vec::<i32>::new());
    reset_page_size();
}

#[test]
#[serial]
fn random_workload_preserves_the_tree() {
    set_page_size(1024);
    let ctx = setup(64);
    let td = two_int_td();
    let (table, file) = ctx.btree_table("soaked", td, 0);

    let mut rng = rand::rngs::StdRng::seed_from_u64(7);
    let mut keys: Vec<i32> = (0..400).collect();
    keys.shuffle(&mut rng);
    insert_keys(&ctx, table, &keys, 50);
    assert_eq!(check_tree(&file), 400);

    keys.shuffle(&mut rng);
    let (doomed, kept) = keys.split_at(200);
    delete_keys(&ctx, &file, doomed, 25);
    assert_eq!(check_tree(&file), 200);

    let mut expected: Vec<i32> = kept.to_vec();
    expected.sort_unstable();
    assert_eq!(scan_keys(&ctx.db, table), expected);
    reset_page_size();
}
