//! Width-aware query behavior across promotions and kernel paths.

use tessera::{ColumnType, Database, DbOptions, VersionId};

fn open_db(name: &str) -> (tempfile::TempDir, Database) {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::open(dir.path().join(name), DbOptions::default()).unwrap();
    (dir, db)
}

#[test]
fn count_is_stable_across_width_promotion() {
    let (_dir, db) = open_db("widths.tsra");
    let mut tx = db.start_write().unwrap();
    let tk = tx.add_table("t").unwrap();
    let n = tx.add_column(tk, "n", ColumnType::Int).unwrap();
    // Fits in two bits per element.
    for v in [0i64, 1, 2, 3, 0, 1, 2, 3] {
        let obj = tx.create_object(tk).unwrap();
        tx.set_int(tk, obj, n, v).unwrap();
    }
    tx.commit().unwrap();

    let r = db.start_read(VersionId::latest()).unwrap();
    assert_eq!(r.query(tk).equal(n, 3).count(&r).unwrap(), 2);
    drop(r);

    // Inserting 200 forces the leaf to a wider representation; the count
    // must not change.
    let mut tx = db.start_write().unwrap();
    let obj = tx.create_object(tk).unwrap();
    tx.set_int(tk, obj, n, 200).unwrap();
    tx.commit().unwrap();

    let r = db.start_read(VersionId::latest()).unwrap();
    assert_eq!(r.query(tk).equal(n, 3).count(&r).unwrap(), 2);
    assert_eq!(r.query(tk).equal(n, 200).count(&r).unwrap(), 1);
}

#[test]
fn byte_width_column_one_of_each_value() {
    let (_dir, db) = open_db("bytes.tsra");
    let mut tx = db.start_write().unwrap();
    let tk = tx.add_table("t").unwrap();
    let x = tx.add_column(tk, "x", ColumnType::Int).unwrap();
    // One of each signed byte value; the leaf packs at width 8, so both the
    // SSE path (aligned middle) and the scalar path (edges) run over it.
    for v in -128i64..=127 {
        let obj = tx.create_object(tk).unwrap();
        tx.set_int(tk, obj, x, v).unwrap();
    }
    tx.commit().unwrap();

    let r = db.start_read(VersionId::latest()).unwrap();
    assert_eq!(r.query(tk).equal(x, 42).count(&r).unwrap(), 1);
    assert_eq!(r.query(tk).equal(x, -77).count(&r).unwrap(), 1);
    assert_eq!(r.query(tk).less(x, 0).count(&r).unwrap(), 128);
    assert_eq!(r.query(tk).greater_equal(x, 100).count(&r).unwrap(), 28);
}

#[test]
fn counts_agree_with_naive_across_widths() {
    let (_dir, db) = open_db("agree.tsra");
    let mut tx = db.start_write().unwrap();
    let tk = tx.add_table("t").unwrap();
    let n = tx.add_column(tk, "n", ColumnType::Int).unwrap();

    // A value distribution that walks the column through several widths.
    let mut values = Vec::new();
    for i in 0..3000i64 {
        let v = match i % 5 {
            0 => i % 2,
            1 => i % 16,
            2 => i % 100,
            3 => -(i % 3000),
            _ => i * 1_000_003,
        };
        values.push(v);
        let obj = tx.create_object(tk).unwrap();
        tx.set_int(tk, obj, n, v).unwrap();
    }
    tx.commit().unwrap();

    let r = db.start_read(VersionId::latest()).unwrap();
    for probe in [0i64, 1, 15, 42, -1500, 2_000_006_000, 7] {
        let engine = r.query(tk).equal(n, probe).count(&r).unwrap();
        let naive = values.iter().filter(|&&v| v == probe).count();
        assert_eq!(engine, naive, "equal {probe}");

        let engine = r.query(tk).less(n, probe).count(&r).unwrap();
        let naive = values.iter().filter(|&&v| v < probe).count();
        assert_eq!(engine, naive, "less {probe}");

        let engine = r.query(tk).greater(n, probe).count(&r).unwrap();
        let naive = values.iter().filter(|&&v| v > probe).count();
        assert_eq!(engine, naive, "greater {probe}");
    }
}

#[test]
fn aggregates_skip_nulls_and_clamp_ranges() {
    let (_dir, db) = open_db("aggnull.tsra");
    let mut tx = db.start_write().unwrap();
    let tk = tx.add_table("t").unwrap();
    let n = tx
        .add_column_with(tk, "n", ColumnType::Int, tessera::keys::attrs::NULLABLE)
        .unwrap();
    for i in 0..10i64 {
        let obj = tx.create_object(tk).unwrap();
        if i % 2 == 0 {
            tx.set_int(tk, obj, n, i).unwrap();
        }
        // Odd rows stay null.
    }
    tx.commit().unwrap();

    let r = db.start_read(VersionId::latest()).unwrap();
    let q = r.query(tk);
    assert_eq!(q.sum(&r, n, 0, usize::MAX, usize::MAX).unwrap(), 20);
    assert_eq!(q.min(&r, n).unwrap(), Some(0));
    assert_eq!(q.max(&r, n).unwrap(), Some(8));
    assert_eq!(q.avg(&r, n).unwrap(), Some(4.0));
    // Range end beyond table size clamps instead of erroring.
    assert_eq!(q.sum(&r, n, 5, 50_000, usize::MAX).unwrap(), 14);
}

#[test]
fn string_predicates_use_dictionary() {
    let (_dir, db) = open_db("strings.tsra");
    let mut tx = db.start_write().unwrap();
    let tk = tx.add_table("t").unwrap();
    let s = tx.add_column(tk, "s", ColumnType::String).unwrap();
    for i in 0..60 {
        let obj = tx.create_object(tk).unwrap();
        let val = match i % 3 {
            0 => "ruby",
            1 => "opal",
            _ => "onyx",
        };
        tx.set_string(tk, obj, s, val).unwrap();
    }
    tx.commit().unwrap();

    let r = db.start_read(VersionId::latest()).unwrap();
    assert_eq!(r.query(tk).equal_string(s, "opal").count(&r).unwrap(), 20);
    // Never interned: nothing can match, and not-equal matches all.
    assert_eq!(r.query(tk).equal_string(s, "agate").count(&r).unwrap(), 0);
    assert_eq!(
        r.query(tk).not_equal_string(s, "agate").count(&r).unwrap(),
        60
    );
}

#[test]
fn link_queries_and_backlinks() {
    let (_dir, db) = open_db("links.tsra");
    let mut tx = db.start_write().unwrap();
    let people = tx.add_table("people").unwrap();
    let dogs = tx.add_table("dogs").unwrap();
    let owner = tx.add_link_column(dogs, "owner", people, false).unwrap();

    let alice = tx.create_object(people).unwrap();
    let bob = tx.create_object(people).unwrap();
    let mut strays = 0;
    for i in 0..10 {
        let dog = tx.create_object(dogs).unwrap();
        match i % 3 {
            0 => tx.set_link(dogs, dog, owner, Some(alice)).unwrap(),
            1 => tx.set_link(dogs, dog, owner, Some(bob)).unwrap(),
            _ => strays += 1,
        }
    }
    tx.commit().unwrap();

    let r = db.start_read(VersionId::latest()).unwrap();
    assert_eq!(
        r.query(dogs).links_to(owner, Some(alice)).count(&r).unwrap(),
        4
    );
    assert_eq!(r.query(dogs).links_to(owner, None).count(&r).unwrap(), strays);
}
