//! Property tests for the codec laws the engine is built on.

use proptest::prelude::*;

use tessera::alloc::{Backing, SlabAlloc, HEADER_SIZE};
use tessera::array::Array;
use tessera::compression::{self, Algorithm, SliceInput};
use tessera::{ColumnType, Database, DbOptions, VersionId};

fn scratch_alloc(dir: &tempfile::TempDir) -> SlabAlloc {
    let mut backing = Backing::attach(dir.path().join("prop.tsra"), None).unwrap();
    backing.grow(HEADER_SIZE as u64).unwrap();
    let mut alloc = SlabAlloc::new(backing);
    alloc.bind(HEADER_SIZE as u64).unwrap();
    alloc
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    /// Width promotion never changes what `get` returns.
    #[test]
    fn array_get_survives_promotions(values in prop::collection::vec(any::<i64>(), 1..200)) {
        let dir = tempfile::tempdir().unwrap();
        let mut alloc = scratch_alloc(&dir);
        let mut array = Array::create(&mut alloc, 0, 0, 8).unwrap();
        for (i, &v) in values.iter().enumerate() {
            array.ensure_fits(&mut alloc, v, 1).unwrap();
            array.push(&mut alloc, v).unwrap();
            // Every earlier element must still read back unchanged.
            for (j, &expect) in values[..=i].iter().enumerate() {
                prop_assert_eq!(array.get(&alloc, j).unwrap(), expect);
            }
        }
    }

    /// decompress(compress(x)) == x, across algorithms and split points.
    #[test]
    fn compression_roundtrip(data in prop::collection::vec(any::<u8>(), 0..20_000),
                             chunk in 1usize..5000) {
        for algo in [Algorithm::None, Algorithm::Deflate] {
            let framed = compression::compress(&data, algo).unwrap();
            let mut input = SliceInput::chunked(&framed, chunk);
            prop_assert_eq!(compression::decompress(&mut input).unwrap(), data.clone());
        }
    }

    /// Block files reassemble and extract at random offsets.
    #[test]
    fn block_file_roundtrip(data in prop::collection::vec(any::<u8>(), 0..100_000)) {
        let packed = compression::compress_block_file(&data, Algorithm::Deflate).unwrap();
        prop_assert_eq!(compression::decompress_block_file(&packed).unwrap(), data);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(12))]

    /// Query counts equal the naive predicate count, regardless of which
    /// kernel the stored width selects.
    #[test]
    fn query_count_matches_naive(values in prop::collection::vec(-300i64..300, 1..400),
                                 probe in -300i64..300) {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(dir.path().join("q.tsra"), DbOptions::default()).unwrap();
        let mut tx = db.start_write().unwrap();
        let tk = tx.add_table("t").unwrap();
        let n = tx.add_column(tk, "n", ColumnType::Int).unwrap();
        for &v in &values {
            let obj = tx.create_object(tk).unwrap();
            tx.set_int(tk, obj, n, v).unwrap();
        }
        tx.commit().unwrap();

        let r = db.start_read(VersionId::latest()).unwrap();
        let eq = r.query(tk).equal(n, probe).count(&r).unwrap();
        prop_assert_eq!(eq, values.iter().filter(|&&v| v == probe).count());
        let lt = r.query(tk).less(n, probe).count(&r).unwrap();
        prop_assert_eq!(lt, values.iter().filter(|&&v| v < probe).count());
        let ge = r.query(tk).greater_equal(n, probe).count(&r).unwrap();
        prop_assert_eq!(ge, values.iter().filter(|&&v| v >= probe).count());
    }

    /// Write a group, close, reopen: identical schema and contents.
    #[test]
    fn reopen_roundtrip(values in prop::collection::vec(any::<i64>(), 1..100)) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("persist.tsra");
        let (tk, n) = {
            let db = Database::open(&path, DbOptions::default()).unwrap();
            let mut tx = db.start_write().unwrap();
            let tk = tx.add_table("t").unwrap();
            let n = tx.add_column(tk, "n", ColumnType::Int).unwrap();
            for &v in &values {
                let obj = tx.create_object(tk).unwrap();
                tx.set_int(tk, obj, n, v).unwrap();
            }
            tx.commit().unwrap();
            (tk, n)
        };
        let db = Database::open(&path, DbOptions::default()).unwrap();
        let r = db.start_read(VersionId::latest()).unwrap();
        prop_assert_eq!(r.table_key("t"), Some(tk));
        let keys = r.object_keys(tk).unwrap();
        prop_assert_eq!(keys.len(), values.len());
        for (key, &expect) in keys.iter().zip(&values) {
            prop_assert_eq!(r.get_int(tk, *key, n).unwrap(), Some(expect));
        }
    }
}
