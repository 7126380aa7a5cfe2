use redb::ReadableTable;
use tempfile::tempdir;

use super::keys::*;
use super::*;
use crate::Error;
use crate::SystemError;

fn put(
    store: &Store,
    def: BytesTable,
    key: &[u8],
    value: &[u8],
) {
    let tx = store.begin_write().unwrap();
    {
        let mut table = tx.open_table(def).unwrap();
        table.insert(key, value).unwrap();
    }
    tx.commit().unwrap();
}

fn get(
    store: &Store,
    def: BytesTable,
    key: &[u8],
) -> Option<Vec<u8>> {
    let tx = store.begin_read().unwrap();
    let table = tx.open_table(def).unwrap();
    table.get(key).unwrap().map(|v| v.value().to_vec())
}

fn set_applied(
    store: &Store,
    term: u64,
    index: u64,
) {
    let tx = store.begin_write().unwrap();
    write_applied_index(&tx, AppliedIndex { term, index }).unwrap();
    tx.commit().unwrap();
}

#[test]
fn test_fresh_store_has_zero_applied_index() {
    let dir = tempdir().unwrap();
    let store = Store::open(dir.path()).unwrap();
    assert_eq!(store.applied_index().unwrap(), AppliedIndex::default());
}

#[test]
fn test_applied_index_survives_reopen() {
    let dir = tempdir().unwrap();
    {
        let store = Store::open(dir.path()).unwrap();
        set_applied(&store, 2, 17);
    }
    let store = Store::open(dir.path()).unwrap();
    assert_eq!(store.applied_index().unwrap(), AppliedIndex { term: 2, index: 17 });
}

#[test]
fn test_snapshot_restore_copies_all_tables() {
    let src_dir = tempdir().unwrap();
    let src = Store::open(src_dir.path()).unwrap();
    put(&src, PARTITIONS, b"p1", b"block-1");
    put(&src, COMPACTION_JOBS, b"j1", b"job-1");
    put(&src, REMOVED_BLOCKS, b"r1", b"");
    set_applied(&src, 3, 42);

    let mut buf = Vec::new();
    src.snapshot().unwrap().persist(&mut buf).unwrap();

    let dst_dir = tempdir().unwrap();
    let dst = Store::open(dst_dir.path()).unwrap();
    put(&dst, PARTITIONS, b"stale", b"x");

    let applied = dst.restore(buf.as_slice()).unwrap();
    assert_eq!(applied, AppliedIndex { term: 3, index: 42 });
    assert_eq!(dst.applied_index().unwrap(), applied);
    assert_eq!(get(&dst, PARTITIONS, b"p1"), Some(b"block-1".to_vec()));
    assert_eq!(get(&dst, COMPACTION_JOBS, b"j1"), Some(b"job-1".to_vec()));
    assert_eq!(get(&dst, REMOVED_BLOCKS, b"r1"), Some(Vec::new()));
    assert_eq!(get(&dst, PARTITIONS, b"stale"), None);
}

#[test]
fn test_snapshot_is_frozen_at_creation() {
    let dir = tempdir().unwrap();
    let store = Store::open(dir.path()).unwrap();
    put(&store, PARTITIONS, b"before", b"1");
    set_applied(&store, 1, 1);

    let snapshot = store.snapshot().unwrap();
    // Writers are not blocked by the open snapshot.
    put(&store, PARTITIONS, b"after", b"2");
    set_applied(&store, 1, 2);

    let mut buf = Vec::new();
    snapshot.persist(&mut buf).unwrap();
    assert_eq!(snapshot.applied().index, 1);

    let dst_dir = tempdir().unwrap();
    let dst = Store::open(dst_dir.path()).unwrap();
    dst.restore(buf.as_slice()).unwrap();
    assert_eq!(get(&dst, PARTITIONS, b"before"), Some(b"1".to_vec()));
    assert_eq!(get(&dst, PARTITIONS, b"after"), None);
    assert_eq!(dst.applied_index().unwrap().index, 1);
}

#[test]
fn test_corrupted_snapshot_leaves_live_store_untouched() {
    let src_dir = tempdir().unwrap();
    let src = Store::open(src_dir.path()).unwrap();
    put(&src, PARTITIONS, b"p1", b"block-1");
    let mut buf = Vec::new();
    src.snapshot().unwrap().persist(&mut buf).unwrap();
    let mid = buf.len() / 2;
    buf[mid] ^= 0xff;

    let dst_dir = tempdir().unwrap();
    let dst = Store::open(dst_dir.path()).unwrap();
    put(&dst, PARTITIONS, b"live", b"v");
    set_applied(&dst, 1, 9);

    let err = dst.restore(buf.as_slice()).unwrap_err();
    assert!(matches!(
        err,
        Error::System(SystemError::Storage(StorageError::Snapshot(_)))
    ));
    assert_eq!(get(&dst, PARTITIONS, b"live"), Some(b"v".to_vec()));
    assert_eq!(dst.applied_index().unwrap().index, 9);
    assert!(!dst_dir.path().join(crate::constants::RESTORE_DB_FILE).exists());
}

#[test]
fn test_failed_reopen_after_restore_is_fatal() {
    let dir = tempdir().unwrap();
    let store = Store::open(dir.path()).unwrap();
    set_applied(&store, 1, 7);
    // A directory cannot be opened as a database file.
    let unusable = dir.path().join("unusable");
    std::fs::create_dir(&unusable).unwrap();

    let err = store.reopen_live(&unusable).unwrap_err();
    assert!(err.is_fatal());
    assert_eq!(store.applied_index().unwrap().index, 7);
}

#[test]
fn test_restore_rejects_foreign_stream() {
    let dir = tempdir().unwrap();
    let store = Store::open(dir.path()).unwrap();
    let garbage = vec![7u8; 128];
    assert!(store.restore(garbage.as_slice()).is_err());
    assert!(store.restore(&b"MSNP"[..]).is_err());
}

#[test]
fn test_partition_key_layout() {
    let key = PartitionKey {
        partition: 1_700_000_000_000_000_000,
        shard: 3,
        tenant: "tenant-a".to_string(),
        block_id: "01HX".to_string(),
    };
    let encoded = key.encode();
    assert_eq!(&encoded[..8], &partition_prefix(key.partition));
    assert_eq!(&encoded[8..12], &3u32.to_be_bytes());
    assert_eq!(PartitionKey::decode(&encoded).unwrap(), key);
}

#[test]
fn test_partition_keys_sort_by_time_then_shard() {
    let k = |partition: i64, shard: u32| {
        PartitionKey {
            partition,
            shard,
            tenant: "t".to_string(),
            block_id: "b".to_string(),
        }
        .encode()
    };
    assert!(k(-10, 9) < k(0, 0));
    assert!(k(0, 1) < k(0, 2));
    assert!(k(5, 9) < k(6, 0));
}

#[test]
fn test_job_and_queue_keys_decode() {
    let job = JobKey {
        shard: 1,
        tenant: "t-1".to_string(),
        name: "L0-S1-abc".to_string(),
    };
    assert_eq!(JobKey::decode(&job.encode()).unwrap(), job);

    let queue = BlockQueueKey {
        shard: 4,
        tenant: String::new(),
        level: 2,
    };
    assert_eq!(BlockQueueKey::decode(&queue.encode()).unwrap(), queue);
    assert!(BlockQueueKey::decode(&[0, 0, 0, 4, 0, 9]).is_err());
}

#[test]
fn test_removed_block_key_decode() {
    let key = RemovedBlockKey {
        shard: 2,
        block_id: "01HXBLOCK".to_string(),
        expiry: 1_000,
        tenant: "tenant-b".to_string(),
    };
    assert_eq!(RemovedBlockKey::decode(&key.encode()).unwrap(), key);
}
