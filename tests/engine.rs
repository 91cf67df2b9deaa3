use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use burrow::{BurrowError, Db, Options};
use tempfile::tempdir;

const VALUE_SIZE: usize = 16;

fn options() -> Options {
    Options::default()
        .page_size(4096)
        .value_size(VALUE_SIZE)
        .mmap_init_size(1 << 20)
}

fn value(key: u64) -> [u8; VALUE_SIZE] {
    let mut v = [0u8; VALUE_SIZE];
    v[..8].copy_from_slice(&key.to_le_bytes());
    v
}

fn insert_committed(db: &Db, keys: impl Iterator<Item = u64>) {
    let mut tx = db.begin(true).unwrap();
    for key in keys {
        tx.insert(key, &value(key)).unwrap();
    }
    tx.commit().unwrap();
}

fn committed_keys(db: &Db) -> Vec<u64> {
    db.view(|tx| tx.iter().map(|item| item.map(|(k, _)| k)).collect())
        .unwrap()
}

/// Flips the stored checksum of the given meta slot directly on disk. The
/// checksum is the last field of the 32-byte meta record.
fn corrupt_meta_checksum(path: &Path, slot: u64, page_size: u64) {
    let mut bytes = fs::read(path).unwrap();
    let off = (slot * page_size + 28) as usize;
    for b in &mut bytes[off..off + 4] {
        *b ^= 0xff;
    }
    fs::write(path, bytes).unwrap();
}

#[test]
fn empty_database_has_no_rows() {
    let dir = tempdir().unwrap();
    let db = Db::open(dir.path().join("empty.db"), options()).unwrap();
    db.view(|tx| {
        assert!(!tx.exists(0)?);
        assert!(!tx.exists(u64::MAX)?);
        assert!(tx.get(7)?.is_none());
        assert_eq!(tx.iter().count(), 0);
        Ok(())
    })
    .unwrap();
    db.close().unwrap();
}

#[test]
fn insert_commit_get_roundtrip() {
    let dir = tempdir().unwrap();
    let db = Db::open(dir.path().join("roundtrip.db"), options()).unwrap();

    let mut tx = db.begin(true).unwrap();
    for key in 0..100u64 {
        tx.insert(key, &value(key)).unwrap();
    }
    // Uncommitted writes are visible inside the transaction itself.
    assert_eq!(tx.get(42).unwrap(), Some(value(42).to_vec()));
    tx.commit().unwrap();

    db.view(|tx| {
        assert_eq!(tx.get(42)?, Some(value(42).to_vec()));
        assert_eq!(tx.get(100)?, None);
        assert!(tx.exists(0)?);
        Ok(())
    })
    .unwrap();

    let mut tx = db.begin(true).unwrap();
    tx.delete(42).unwrap();
    tx.commit().unwrap();

    db.view(|tx| {
        assert_eq!(tx.get(42)?, None);
        assert!(!tx.exists(42)?);
        Ok(())
    })
    .unwrap();

    let mut tx = db.begin(true).unwrap();
    assert!(matches!(tx.delete(42), Err(BurrowError::KeyNotFound)));
    assert!(matches!(
        tx.insert(41, &value(41)),
        Err(BurrowError::DuplicateKey)
    ));
    tx.rollback().unwrap();
    db.close().unwrap();
}

#[test]
fn splits_and_deletes_keep_order_and_invariants() {
    let dir = tempdir().unwrap();
    let db = Db::open(dir.path().join("heavy.db"), options()).unwrap();
    insert_committed(&db, 0..1000);

    let mut tx = db.begin(true).unwrap();
    for key in (0..1000).filter(|k| k % 2 == 0) {
        tx.delete(key).unwrap();
    }
    tx.check_invariants().unwrap();
    tx.commit().unwrap();

    let keys = committed_keys(&db);
    let expected: Vec<u64> = (0..1000).filter(|k| k % 2 == 1).collect();
    assert_eq!(keys, expected);
    db.view(|tx| tx.check_invariants()).unwrap();
    db.close().unwrap();
}

#[test]
fn rollback_discards_changes() {
    let dir = tempdir().unwrap();
    let db = Db::open(dir.path().join("rollback.db"), options()).unwrap();
    insert_committed(&db, 0..10);

    let mut tx = db.begin(true).unwrap();
    tx.insert(99, &value(99)).unwrap();
    tx.delete(3).unwrap();
    tx.rollback().unwrap();

    db.view(|tx| {
        assert!(!tx.exists(99)?);
        assert!(tx.exists(3)?);
        Ok(())
    })
    .unwrap();

    // Dropping an unfinished transaction rolls back too.
    {
        let mut tx = db.begin(true).unwrap();
        tx.insert(100, &value(100)).unwrap();
    }
    db.view(|tx| {
        assert!(!tx.exists(100)?);
        Ok(())
    })
    .unwrap();
    db.close().unwrap();
}

#[test]
fn readers_cannot_commit_or_mutate() {
    let dir = tempdir().unwrap();
    let db = Db::open(dir.path().join("reader.db"), options()).unwrap();

    let mut tx = db.begin(false).unwrap();
    assert!(matches!(
        tx.insert(1, &value(1)),
        Err(BurrowError::TransactionReadOnly)
    ));
    assert!(matches!(
        tx.delete(1),
        Err(BurrowError::TransactionReadOnly)
    ));
    assert!(matches!(
        tx.commit(),
        Err(BurrowError::TransactionReadOnly)
    ));
    db.close().unwrap();
}

#[test]
fn durability_across_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("durable.db");
    {
        let db = Db::open(&path, options()).unwrap();
        insert_committed(&db, 0..500);
        db.close().unwrap();
    }
    let db = Db::open(&path, options()).unwrap();
    assert_eq!(committed_keys(&db), (0..500).collect::<Vec<_>>());
    db.view(|tx| tx.check_invariants()).unwrap();
    db.close().unwrap();
}

#[test]
fn page_size_option_is_ignored_for_existing_files() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("sized.db");
    {
        let db = Db::open(&path, options().page_size(8192)).unwrap();
        insert_committed(&db, 0..10);
        db.close().unwrap();
    }
    // Reopen asking for a different page size; the meta value wins.
    let db = Db::open(&path, options().page_size(4096)).unwrap();
    assert_eq!(committed_keys(&db), (0..10).collect::<Vec<_>>());
    db.close().unwrap();
}

#[test]
fn reopening_with_a_different_value_size_is_rejected() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("mismatch.db");
    {
        let db = Db::open(&path, options()).unwrap();
        insert_committed(&db, 0..10);
        db.close().unwrap();
    }
    assert!(matches!(
        Db::open(&path, options().value_size(VALUE_SIZE * 2)),
        Err(BurrowError::Invalid(_))
    ));
    // Leaving the record size unspecified adopts the one in the file.
    let db = Db::open(&path, Options::default().mmap_init_size(1 << 20)).unwrap();
    assert_eq!(committed_keys(&db), (0..10).collect::<Vec<_>>());
    db.close().unwrap();
}

#[test]
fn corrupt_newer_meta_falls_back_to_older_copy() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("crash.db");
    {
        let db = Db::open(&path, options()).unwrap();
        insert_committed(&db, 0..20);
        db.close().unwrap();
    }
    // Initialization leaves txid 1 in slot 1; the first commit wrote txid 2
    // into slot 0, so slot 0 is the newer copy.
    corrupt_meta_checksum(&path, 0, 4096);

    let db = Db::open(&path, options()).unwrap();
    db.view(|tx| {
        assert_eq!(tx.txid(), 1);
        tx.check_invariants()
    })
    .unwrap();
    db.close().unwrap();
}

#[test]
fn open_fails_when_both_meta_copies_are_corrupt() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("dead.db");
    {
        let db = Db::open(&path, options()).unwrap();
        insert_committed(&db, 0..5);
        db.close().unwrap();
    }
    corrupt_meta_checksum(&path, 0, 4096);
    corrupt_meta_checksum(&path, 1, 4096);
    assert!(matches!(
        Db::open(&path, options()),
        Err(BurrowError::Corruption(_))
    ));
}

#[test]
fn read_only_mode_refuses_writers() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("ro.db");
    {
        let db = Db::open(&path, options()).unwrap();
        insert_committed(&db, 0..10);
        db.close().unwrap();
    }
    let db = Db::open(&path, options().read_only(true)).unwrap();
    assert!(matches!(
        db.begin(true),
        Err(BurrowError::DatabaseReadOnly)
    ));
    db.view(|tx| {
        assert_eq!(tx.get(3)?, Some(value(3).to_vec()));
        Ok(())
    })
    .unwrap();
    db.close().unwrap();
}

#[test]
fn close_fails_fast_while_transactions_are_open() {
    let dir = tempdir().unwrap();
    let db = Db::open(dir.path().join("busy.db"), options()).unwrap();
    let tx = db.begin(false).unwrap();
    assert!(matches!(db.close(), Err(BurrowError::Invalid(_))));
    drop(tx);
    db.close().unwrap();
    assert!(matches!(db.begin(false), Err(BurrowError::DatabaseNotOpen)));
}

#[test]
fn readers_see_committed_state_while_a_writer_is_active() {
    let dir = tempdir().unwrap();
    let db = Arc::new(Db::open(dir.path().join("mixed.db"), options()).unwrap());
    insert_committed(&db, 0..50);

    let mut writer = db.begin(true).unwrap();
    for key in 50..80u64 {
        writer.insert(key, &value(key)).unwrap();
    }

    thread::scope(|scope| {
        for _ in 0..4 {
            let db = Arc::clone(&db);
            scope.spawn(move || {
                for _ in 0..10 {
                    let keys: Vec<u64> = db
                        .view(|tx| tx.iter().map(|item| item.map(|(k, _)| k)).collect())
                        .unwrap();
                    assert_eq!(keys, (0..50).collect::<Vec<_>>());
                }
            });
        }
    });

    writer.commit().unwrap();
    assert_eq!(committed_keys(&db), (0..80).collect::<Vec<_>>());
    db.close().unwrap();
}

#[test]
fn writers_serialize() {
    let dir = tempdir().unwrap();
    let db = Arc::new(Db::open(dir.path().join("serial.db"), options()).unwrap());

    let mut first = db.begin(true).unwrap();
    first.insert(1, &value(1)).unwrap();

    let entered = Arc::new(AtomicBool::new(false));
    let handle = {
        let db = Arc::clone(&db);
        let entered = Arc::clone(&entered);
        thread::spawn(move || {
            let mut tx = db.begin(true).unwrap();
            entered.store(true, Ordering::SeqCst);
            tx.insert(2, &value(2)).unwrap();
            tx.commit().unwrap();
        })
    };

    thread::sleep(Duration::from_millis(50));
    assert!(
        !entered.load(Ordering::SeqCst),
        "second writer should block until the first finishes"
    );
    first.commit().unwrap();
    handle.join().unwrap();

    assert_eq!(committed_keys(&db), vec![1, 2]);
    db.close().unwrap();
}
