use std::collections::BTreeMap;

use lmdb_scope::{DatabaseOptions, EnvConfig, Environment};
use proptest::prelude::*;
use tempfile::TempDir;

#[derive(Debug, Clone)]
enum Op {
    Put(Vec<u8>, Vec<u8>),
    Delete(Vec<u8>),
}

fn key_strategy() -> impl Strategy<Value = Vec<u8>> {
    // Small alphabet so deletes hit existing keys; NUL included.
    prop::collection::vec(prop::sample::select(vec![0u8, 1, b'a', b'b', 0xff]), 1..4)
}

fn value_strategy() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 0..64)
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (key_strategy(), value_strategy()).prop_map(|(k, v)| Op::Put(k, v)),
        1 => key_strategy().prop_map(Op::Delete),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn stored_value_reads_back(
        key in prop::collection::vec(any::<u8>(), 1..128),
        value in value_strategy(),
    ) {
        let temp_dir = TempDir::new().unwrap();
        let env = Environment::open(temp_dir.path(), EnvConfig::default()).unwrap();
        let db = env.database("", DatabaseOptions::new()).unwrap();

        db.put(&key, &value).unwrap();
        prop_assert_eq!(db.get(&key).unwrap(), Some(value));
    }

    #[test]
    fn matches_ordered_map(ops in prop::collection::vec(op_strategy(), 1..40)) {
        let temp_dir = TempDir::new().unwrap();
        let env = Environment::open(temp_dir.path(), EnvConfig::default()).unwrap();
        let db = env.database("", DatabaseOptions::new()).unwrap();
        let mut model = BTreeMap::new();

        env.transaction(false, |_| {
            for op in &ops {
                match op {
                    Op::Put(key, value) => {
                        db.put(key, value)?;
                        model.insert(key.clone(), value.clone());
                    }
                    Op::Delete(key) => {
                        let removed = db.delete_if_present(key, None)?;
                        assert_eq!(removed, model.remove(key).is_some());
                    }
                }
            }
            Ok(())
        })
        .unwrap();

        let expected: Vec<(Vec<u8>, Vec<u8>)> = model.into_iter().collect();
        prop_assert_eq!(db.to_vec().unwrap(), expected);
    }

    #[test]
    fn aborted_writes_leave_no_trace(ops in prop::collection::vec(op_strategy(), 1..20)) {
        let temp_dir = TempDir::new().unwrap();
        let env = Environment::open(temp_dir.path(), EnvConfig::default()).unwrap();
        let db = env.database("", DatabaseOptions::new()).unwrap();
        db.put(b"anchor", b"1").unwrap();
        let before = db.to_vec().unwrap();

        let txn = env.begin(false).unwrap();
        for op in &ops {
            match op {
                Op::Put(key, value) => db.put(key, value).unwrap(),
                Op::Delete(key) => {
                    db.delete_if_present(key, None).unwrap();
                }
            }
        }
        txn.abort().unwrap();

        prop_assert_eq!(db.to_vec().unwrap(), before);
    }
}
