use std::sync::mpsc;
use std::thread;

use lmdb_scope::{
    DatabaseOptions, DbFlags, EnvConfig, Environment, Error, ErrorKind, Handle, Resource, WriteFlags,
};
use tempfile::TempDir;

// Common test setup
fn setup_test_env() -> (TempDir, Environment) {
    let temp_dir = TempDir::new().unwrap();
    let env = Environment::open(temp_dir.path(), EnvConfig::new().max_dbs(4)).unwrap();
    (temp_dir, env)
}

#[test]
fn test_basic_put_get_delete() {
    let (_dir, env) = setup_test_env();
    let db = env.database("main", DatabaseOptions::new().create()).unwrap();

    db.put(b"test_key", b"test_value").unwrap();
    assert_eq!(db.get(b"test_key").unwrap(), Some(b"test_value".to_vec()));
    assert!(db.has(b"test_key", None).unwrap());
    assert_eq!(db.get(b"missing").unwrap(), None);

    db.delete(b"test_key", None).unwrap();
    assert_eq!(db.get(b"test_key").unwrap(), None);
    assert!(db.delete(b"test_key", None).unwrap_err().is_not_found());
    assert!(!db.delete_if_present(b"test_key", None).unwrap());
}

#[test]
fn test_cached_handle() {
    let (_dir, env) = setup_test_env();
    let db = env.database("cats", DatabaseOptions::new().create()).unwrap();

    assert_eq!(env.database("cats", DatabaseOptions::new()).unwrap(), db);
    assert_eq!(db.name(), "cats");
    assert!(!db.is_dup_sort());
    assert_eq!(db.environment().unwrap(), env);
}

#[test]
fn test_missing_database_without_create() {
    let (_dir, env) = setup_test_env();
    let err = env.database("nope", DatabaseOptions::new()).unwrap_err();
    assert!(err.is_not_found());
}

#[test]
fn test_binary_keys_and_values() {
    let (_dir, env) = setup_test_env();
    let db = env.database("", DatabaseOptions::new()).unwrap();

    db.put(b"a\0b", b"\0\x01\0").unwrap();
    db.put(b"k", b"").unwrap();
    assert_eq!(db.get(b"a\0b").unwrap(), Some(b"\0\x01\0".to_vec()));
    assert_eq!(db.get(b"k").unwrap(), Some(Vec::new()));
    assert_eq!(db.get(b"a").unwrap(), None);
}

#[test]
fn test_dup_sort_values() {
    let (_dir, env) = setup_test_env();
    let db = env.database("tags", DatabaseOptions::new().create().dup_sort()).unwrap();
    assert!(db.is_dup_sort());
    assert!(db.flags().contains(DbFlags::DUPSORT));

    db.put(b"key", b"b").unwrap();
    db.put(b"key", b"a").unwrap();
    db.put(b"other", b"c").unwrap();
    // Storing an existing pair again adds nothing.
    db.put(b"key", b"a").unwrap();

    assert_eq!(db.cardinality(b"key").unwrap(), 2);
    assert_eq!(db.cardinality(b"missing").unwrap(), 0);
    assert_eq!(db.values(b"key").unwrap(), vec![b"a".to_vec(), b"b".to_vec()]);
    assert_eq!(db.keys().unwrap(), vec![b"key".to_vec(), b"other".to_vec()]);
    assert!(db.has(b"key", Some(b"a")).unwrap());
    assert!(!db.has(b"key", Some(b"z")).unwrap());
    assert_eq!(db.size().unwrap(), 3);

    db.delete(b"key", Some(b"a")).unwrap();
    assert_eq!(db.values(b"key").unwrap(), vec![b"b".to_vec()]);
    assert!(db.delete(b"key", Some(b"a")).unwrap_err().is_not_found());
}

#[test]
fn test_value_match_without_dup_sort() {
    let (_dir, env) = setup_test_env();
    let db = env.database("plain", DatabaseOptions::new().create()).unwrap();
    db.put(b"key", b"value").unwrap();

    assert_eq!(db.cardinality(b"key").unwrap(), 1);
    assert!(db.has(b"key", Some(b"value")).unwrap());
    assert!(!db.has(b"key", Some(b"other")).unwrap());
    assert!(!db.delete_if_present(b"key", Some(b"other")).unwrap());
    assert!(db.delete_if_present(b"key", Some(b"value")).unwrap());
    assert!(db.is_empty().unwrap());
}

#[test]
fn test_iteration_order() {
    let (_dir, env) = setup_test_env();
    let db = env.database("", DatabaseOptions::new()).unwrap();
    for key in [b"c", b"a", b"b"] {
        db.put(key, key).unwrap();
    }

    let records = db.to_vec().unwrap();
    let keys: Vec<&[u8]> = records.iter().map(|(key, _)| key.as_slice()).collect();
    assert_eq!(keys, vec![b"a", b"b", b"c"]);

    let mut seen = 0;
    db.each(|key, value| {
        assert_eq!(key, value);
        seen += 1;
        Ok(())
    })
    .unwrap();
    assert_eq!(seen, 3);
}

#[test]
fn test_callback_error_stops_iteration() {
    let (_dir, env) = setup_test_env();
    let db = env.database("", DatabaseOptions::new()).unwrap();
    db.put(b"a", b"1").unwrap();
    db.put(b"b", b"2").unwrap();

    let mut seen = 0;
    let err = db
        .each_key(|_| {
            seen += 1;
            Err(Error::KeyExist)
        })
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::KeyExist);
    assert_eq!(seen, 1);
}

#[test]
fn test_empty_key_rejected() {
    let (_dir, env) = setup_test_env();
    let db = env.database("", DatabaseOptions::new()).unwrap();
    assert_eq!(db.put(b"", b"value").unwrap_err().kind(), ErrorKind::BadValueSize);
}

#[test]
fn test_write_flags() {
    let (_dir, env) = setup_test_env();
    let db = env.database("", DatabaseOptions::new()).unwrap();

    db.put_with(b"b", b"1", WriteFlags::APPEND).unwrap();
    db.put_with(b"c", b"2", WriteFlags::APPEND).unwrap();
    assert_eq!(db.put_with(b"a", b"3", WriteFlags::APPEND).unwrap_err().kind(), ErrorKind::KeyExist);

    assert_eq!(db.put_with(b"b", b"4", WriteFlags::NOOVERWRITE).unwrap_err().kind(), ErrorKind::KeyExist);
    assert_eq!(db.get(b"b").unwrap(), Some(b"1".to_vec()));

    assert_eq!(db.put_with(b"d", b"5", WriteFlags::RESERVE).unwrap_err().kind(), ErrorKind::Incompatible);
}

#[test]
fn test_clear_and_drop() {
    let (_dir, env) = setup_test_env();
    let db = env.database("scratch", DatabaseOptions::new().create()).unwrap();
    db.put(b"a", b"1").unwrap();

    db.clear().unwrap();
    assert!(db.is_empty().unwrap());
    assert!(db.is_open());

    db.drop_database().unwrap();
    assert!(!db.is_open());
    assert!(env.database("scratch", DatabaseOptions::new()).unwrap_err().is_not_found());
}

#[test]
fn test_close_is_idempotent() {
    let (_dir, env) = setup_test_env();
    let db = env.database("cats", DatabaseOptions::new().create()).unwrap();
    db.put(b"tom", b"grey").unwrap();

    db.close().unwrap();
    db.close().unwrap();
    assert!(matches!(db.get(b"tom"), Err(Error::InvalidHandle(Handle::Database))));

    let reopened = env.database("cats", DatabaseOptions::new()).unwrap();
    assert_ne!(reopened, db);
    assert_eq!(reopened.get(b"tom").unwrap(), Some(b"grey".to_vec()));
}

#[test]
fn test_named_database_limit() {
    let temp_dir = TempDir::new().unwrap();
    let env = Environment::open(temp_dir.path(), EnvConfig::new().max_dbs(1)).unwrap();

    env.database("one", DatabaseOptions::new().create()).unwrap();
    let err = env.database("two", DatabaseOptions::new().create()).unwrap_err();
    assert!(matches!(err, Error::ResourceExhausted(Resource::Databases)));
}

#[test]
fn test_invalid_options() {
    let (_dir, env) = setup_test_env();
    let err = env.database("bad", DatabaseOptions::new().create().dup_fixed()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidConfig);
}

#[test]
fn test_stat() {
    let (_dir, env) = setup_test_env();
    let db = env.database("cats", DatabaseOptions::new().create()).unwrap();
    db.put(b"tom", b"grey").unwrap();

    let stat = db.stat().unwrap();
    assert_eq!(stat.entries, 1);
    assert_eq!(stat.depth, 1);
}

#[test]
fn test_shared_across_threads() {
    let (_dir, env) = setup_test_env();
    let db = env.database("shared", DatabaseOptions::new().create()).unwrap();

    let handles: Vec<_> = (0..4u8)
        .map(|i| {
            let db = db.clone();
            thread::spawn(move || {
                for j in 0..10u8 {
                    db.put(&[i, j], &[j]).unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(db.size().unwrap(), 40);
    assert_eq!(db.get(&[3, 9]).unwrap(), Some(vec![9]));
}

#[test]
fn test_concurrent_open_shares_one_handle() {
    let (_dir, env) = setup_test_env();
    env.database("x", DatabaseOptions::new().create()).unwrap().close().unwrap();

    let (opened_tx, opened_rx) = mpsc::channel();
    let (commit_tx, commit_rx) = mpsc::channel();
    let opener_env = env.clone();
    let opener = thread::spawn(move || -> lmdb_scope::Result<_> {
        let txn = opener_env.begin(true)?;
        let db = txn.open_database("x", DatabaseOptions::new())?;
        opened_tx.send(()).unwrap();
        commit_rx.recv().unwrap();
        txn.commit()?;
        Ok(db)
    });

    opened_rx.recv().unwrap();
    // The other thread's open is not settled until its transaction ends.
    let err = env.database("x", DatabaseOptions::new()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::TransactionState);

    commit_tx.send(()).unwrap();
    let theirs = opener.join().unwrap().unwrap();
    let ours = env.database("x", DatabaseOptions::new()).unwrap();
    assert_eq!(ours, theirs);

    ours.close().unwrap();
    assert!(!theirs.is_open());

    let y = env.database("y", DatabaseOptions::new().create()).unwrap();
    y.put(b"k", b"from-y").unwrap();
    assert!(matches!(theirs.get(b"k"), Err(Error::InvalidHandle(Handle::Database))));
    assert_eq!(env.database("x", DatabaseOptions::new()).unwrap().get(b"k").unwrap(), None);
}

#[test]
fn test_close_while_other_thread_reads() {
    let (_dir, env) = setup_test_env();
    let db = env.database("cats", DatabaseOptions::new().create()).unwrap();
    db.put(b"tom", b"grey").unwrap();

    let (began_tx, began_rx) = mpsc::channel();
    let (done_tx, done_rx) = mpsc::channel();
    let reader_env = env.clone();
    let reader = thread::spawn(move || {
        reader_env.transaction(true, |_| {
            began_tx.send(()).unwrap();
            done_rx.recv().unwrap();
            Ok(())
        })
    });
    began_rx.recv().unwrap();

    db.close().unwrap();
    assert!(matches!(db.get(b"tom"), Err(Error::InvalidHandle(Handle::Database))));

    let reopened = env.database("cats", DatabaseOptions::new()).unwrap();
    assert_ne!(reopened, db);
    assert_eq!(reopened.get(b"tom").unwrap(), Some(b"grey".to_vec()));

    done_tx.send(()).unwrap();
    reader.join().unwrap().unwrap();

    // The handle reopened meanwhile survives the reader finishing.
    assert!(reopened.is_open());
    assert_eq!(reopened.get(b"tom").unwrap(), Some(b"grey".to_vec()));
}
