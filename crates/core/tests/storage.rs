//! End-to-end storage tests against a live PostgreSQL.

mod common;

use std::time::{Duration, Instant};

use pgjsonb::{
    RecordData, Storage, StorageError, Tid, TransactionMeta, TransactionRecord, TransactionSource, TxPhase,
};
use pretty_assertions::assert_eq;
use tempfile::TempDir;

fn commit(storage: &pgjsonb::StorageInstance, writes: &[(u64, u64, Vec<u8>)]) -> Tid {
    storage.tpc_begin(TransactionMeta::default()).unwrap();
    for (zoid, old_serial, data) in writes {
        assert_eq!(storage.store(*zoid, *old_serial, data).unwrap(), 0);
    }
    storage.tpc_vote().unwrap();
    storage.tpc_finish(|_| {}).unwrap()
}

#[test]
fn simple_write_read_round_trip() {
    let _guard = common::harness_lock();
    let Some(dsn) = common::test_dsn() else { return };
    common::reset_database(&dsn);
    let tmp = TempDir::new().unwrap();
    let storage = Storage::open(common::options(&dsn, tmp.path())).unwrap();

    storage.tpc_begin(TransactionMeta::default()).unwrap();
    storage.store(1, 0, b"x=1").unwrap();
    let touched = storage.tpc_vote().unwrap();
    assert_eq!(touched, vec![1]);

    let mut seen = None;
    let tid = storage.tpc_finish(|t| seen = Some(t)).unwrap();
    assert_eq!(seen, Some(tid));

    let (data, serial) = storage.load(1).unwrap();
    assert_eq!(data, b"x=1");
    assert_eq!(serial, tid);
    assert_eq!(storage.last_transaction().unwrap(), tid);
    assert!(storage.get_size().unwrap() > 0);
}

#[test]
fn tids_are_strictly_monotonic_and_respect_the_floor() {
    let _guard = common::harness_lock();
    let Some(dsn) = common::test_dsn() else { return };
    common::reset_database(&dsn);
    let tmp = TempDir::new().unwrap();
    let storage = Storage::open(common::options(&dsn, tmp.path())).unwrap();

    let t1 = commit(&storage, &[(1, 0, b"v1".to_vec())]);
    let (_, s1) = storage.load(1).unwrap();
    let t2 = commit(&storage, &[(1, s1, b"v2".to_vec())]);
    assert!(t2 > t1);

    let floor = t2 + 1000;
    storage
        .tpc_begin(TransactionMeta {
            tid_floor: floor,
            ..TransactionMeta::default()
        })
        .unwrap();
    let (_, s2) = storage.load(1).unwrap();
    storage.store(1, s2, b"v3").unwrap();
    storage.tpc_vote().unwrap();
    let t3 = storage.tpc_finish(|_| {}).unwrap();
    assert!(t3 > floor);
}

#[test]
fn concurrent_writers_conflict_on_the_same_serial() {
    let _guard = common::harness_lock();
    let Some(dsn) = common::test_dsn() else { return };
    common::reset_database(&dsn);
    let tmp = TempDir::new().unwrap();
    let storage = Storage::open(common::options(&dsn, tmp.path())).unwrap();
    let other = storage.new_instance().unwrap();

    // Both sides start from old_serial 0; the first finish wins.
    let winner_tid = commit(&storage, &[(5, 0, b"winner".to_vec())]);

    other.tpc_begin(TransactionMeta::default()).unwrap();
    other.store(5, 0, b"loser").unwrap();
    match other.tpc_vote() {
        Err(StorageError::Conflict { zoid, expected, actual }) => {
            assert_eq!(zoid, 5);
            assert_eq!(expected, 0);
            assert_eq!(actual, winner_tid);
        }
        other => panic!("expected conflict, got {other:?}"),
    }
    // The failed vote aborted the transaction.
    assert!(matches!(
        other.tpc_abort(),
        Err(StorageError::InvalidState(TxPhase::Idle))
    ));
    // And the instance is usable again.
    let (_, s) = other.load(5).unwrap();
    commit(&other, &[(5, s, b"retry".to_vec())]);
    other.release();
}

#[test]
fn invalidations_reach_other_instances() {
    let _guard = common::harness_lock();
    let Some(dsn) = common::test_dsn() else { return };
    common::reset_database(&dsn);
    let tmp = TempDir::new().unwrap();
    let storage = Storage::open(common::options(&dsn, tmp.path())).unwrap();
    let observer = storage.new_instance().unwrap();

    // First poll is always "start cold".
    assert_eq!(observer.poll_invalidations(), None);

    commit(&storage, &[(3, 0, b"changed".to_vec())]);

    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        if let Some(zoids) = observer.poll_invalidations() {
            if zoids.contains(&3) {
                break;
            }
        }
        assert!(Instant::now() < deadline, "invalidation for zoid 3 never arrived");
        std::thread::sleep(Duration::from_millis(50));
    }
    observer.release();
}

#[test]
fn schema_install_is_idempotent() {
    let _guard = common::harness_lock();
    let Some(dsn) = common::test_dsn() else { return };
    common::reset_database(&dsn);

    let mut client = common::connect(&dsn);
    pgjsonb::schema::install(&mut client, false).unwrap();
    pgjsonb::schema::install(&mut client, false).unwrap();
    pgjsonb::schema::install(&mut client, true).unwrap();
    pgjsonb::schema::install(&mut client, true).unwrap();

    for table in ["transaction_log", "object_state", "blob_state", "object_history"] {
        let exists: bool = client
            .query_one("SELECT to_regclass($1) IS NOT NULL", &[&table])
            .unwrap()
            .get(0);
        assert!(exists, "{table} missing after install");
    }
}

#[test]
fn coordinator_rejects_out_of_phase_calls() {
    let _guard = common::harness_lock();
    let Some(dsn) = common::test_dsn() else { return };
    common::reset_database(&dsn);
    let tmp = TempDir::new().unwrap();
    let storage = Storage::open(common::options(&dsn, tmp.path())).unwrap();

    assert!(matches!(
        storage.store(1, 0, b"x"),
        Err(StorageError::InvalidState(TxPhase::Idle))
    ));
    assert!(matches!(
        storage.tpc_finish(|_| {}),
        Err(StorageError::InvalidState(TxPhase::Idle))
    ));

    storage.tpc_begin(TransactionMeta::default()).unwrap();
    assert!(matches!(
        storage.tpc_begin(TransactionMeta::default()),
        Err(StorageError::InvalidState(TxPhase::Begun))
    ));
    assert!(matches!(
        storage.tpc_finish(|_| {}),
        Err(StorageError::InvalidState(TxPhase::Begun))
    ));
    storage.tpc_abort().unwrap();
}

#[test]
fn read_only_instances_reject_mutation() {
    let _guard = common::harness_lock();
    let Some(dsn) = common::test_dsn() else { return };
    common::reset_database(&dsn);
    let tmp = TempDir::new().unwrap();
    {
        let storage = Storage::open(common::options(&dsn, tmp.path())).unwrap();
        commit(&storage, &[(1, 0, b"data".to_vec())]);
    }

    let storage = Storage::open(common::options(&dsn, tmp.path()).read_only(true)).unwrap();
    assert!(storage.load(1).is_ok());
    assert!(matches!(
        storage.tpc_begin(TransactionMeta::default()),
        Err(StorageError::ReadOnly)
    ));
    assert!(matches!(storage.store(1, 0, b"x"), Err(StorageError::ReadOnly)));
    assert!(matches!(storage.pack(0), Err(StorageError::ReadOnly)));
    assert!(matches!(storage.new_oid(), Err(StorageError::ReadOnly)));
}

#[test]
fn missing_objects_are_key_missing() {
    let _guard = common::harness_lock();
    let Some(dsn) = common::test_dsn() else { return };
    common::reset_database(&dsn);
    let tmp = TempDir::new().unwrap();
    let storage = Storage::open(common::options(&dsn, tmp.path())).unwrap();

    assert!(matches!(
        storage.load(999),
        Err(StorageError::KeyMissing { zoid: 999, tid: None })
    ));
    assert!(matches!(
        storage.load_serial(999, 1),
        Err(StorageError::KeyMissing { zoid: 999, tid: Some(1) })
    ));
}

#[test]
fn history_preserving_serves_old_revisions() {
    let _guard = common::harness_lock();
    let Some(dsn) = common::test_dsn() else { return };
    common::reset_database(&dsn);
    let tmp = TempDir::new().unwrap();
    let storage =
        Storage::open(common::options(&dsn, tmp.path()).history_preserving(true)).unwrap();

    let t1 = commit(&storage, &[(9, 0, b"rev1".to_vec())]);
    let t2 = commit(&storage, &[(9, t1, b"rev2".to_vec())]);
    let t3 = commit(&storage, &[(9, t2, b"rev3".to_vec())]);

    assert_eq!(storage.load_serial(9, t1).unwrap(), b"rev1");
    assert_eq!(storage.load_serial(9, t2).unwrap(), b"rev2");
    assert_eq!(storage.load(9).unwrap(), (b"rev3".to_vec(), t3));

    // load_before walks the revision chain with next-serial links.
    let (data, serial, next) = storage.load_before(9, t2).unwrap().unwrap();
    assert_eq!((data.as_slice(), serial, next), (&b"rev1"[..], t1, Some(t2)));
    let (data, serial, next) = storage.load_before(9, t3 + 1).unwrap().unwrap();
    assert_eq!((data.as_slice(), serial, next), (&b"rev3"[..], t3, None));
    assert_eq!(storage.load_before(9, t1).unwrap(), None);
}

#[test]
fn load_before_without_history_serves_only_the_current_row() {
    let _guard = common::harness_lock();
    let Some(dsn) = common::test_dsn() else { return };
    common::reset_database(&dsn);
    let tmp = TempDir::new().unwrap();
    let storage = Storage::open(common::options(&dsn, tmp.path())).unwrap();

    let t1 = commit(&storage, &[(4, 0, b"only".to_vec())]);
    assert_eq!(
        storage.load_before(4, t1 + 1).unwrap(),
        Some((b"only".to_vec(), t1, None))
    );
    assert_eq!(storage.load_before(4, t1).unwrap(), None);
}

#[test]
fn exhausted_pool_times_out() {
    let _guard = common::harness_lock();
    let Some(dsn) = common::test_dsn() else { return };
    common::reset_database(&dsn);
    let tmp = TempDir::new().unwrap();
    let storage = Storage::open(
        common::options(&dsn, tmp.path())
            .pool_sizes(1, 1)
            .pool_timeout(Duration::from_millis(300)),
    )
    .unwrap();

    // The open transaction holds the only connection.
    storage.tpc_begin(TransactionMeta::default()).unwrap();
    assert!(matches!(storage.load(1), Err(StorageError::PoolExhausted)));
    storage.tpc_abort().unwrap();
}

struct FakeSource(Vec<TransactionRecord>);

impl TransactionSource for FakeSource {
    fn transactions(
        &self,
        _start: Option<Tid>,
        _stop: Option<Tid>,
    ) -> pgjsonb::Result<Vec<TransactionRecord>> {
        Ok(self.0.clone())
    }
}

#[test]
fn copy_transactions_replays_tids_and_skips_duplicates() {
    let _guard = common::harness_lock();
    let Some(dsn) = common::test_dsn() else { return };
    common::reset_database(&dsn);
    let tmp = TempDir::new().unwrap();
    let storage = Storage::open(common::options(&dsn, tmp.path())).unwrap();

    let source = FakeSource(vec![
        TransactionRecord {
            tid: 100,
            username: "migrator".into(),
            description: "initial".into(),
            extension: Vec::new(),
            records: vec![
                RecordData {
                    zoid: 1,
                    data: common::record("Root", &[2], 1),
                    blob: None,
                },
                RecordData {
                    zoid: 2,
                    data: common::record("Attachment", &[], 2),
                    blob: Some(b"blob payload".to_vec()),
                },
            ],
        },
        TransactionRecord {
            tid: 200,
            username: "migrator".into(),
            description: "update".into(),
            extension: Vec::new(),
            records: vec![RecordData {
                zoid: 1,
                data: common::record("Root", &[2], 3),
                blob: None,
            }],
        },
    ]);

    assert_eq!(storage.copy_transactions_from(&source).unwrap(), 2);
    assert_eq!(storage.last_transaction().unwrap(), 200);

    let (data, serial) = storage.load(1).unwrap();
    assert_eq!(data, common::record("Root", &[2], 3));
    assert_eq!(serial, 200);
    assert_eq!(storage.load(2).unwrap().1, 100);

    let blob_path = storage.load_blob(2, 100).unwrap();
    assert_eq!(std::fs::read(blob_path).unwrap(), b"blob payload");

    // Object id allocation stays ahead of what was copied.
    assert!(storage.new_oid().unwrap() > 2);

    // A second run is a no-op: every tid is already present.
    assert_eq!(storage.copy_transactions_from(&source).unwrap(), 0);
}

#[test]
fn iterator_returns_committed_transactions_in_order() {
    let _guard = common::harness_lock();
    let Some(dsn) = common::test_dsn() else { return };
    common::reset_database(&dsn);
    let tmp = TempDir::new().unwrap();
    let storage = Storage::open(common::options(&dsn, tmp.path())).unwrap();

    let t1 = commit(&storage, &[(1, 0, b"a".to_vec())]);
    let (_, s1) = storage.load(1).unwrap();
    let t2 = commit(&storage, &[(1, s1, b"b".to_vec()), (2, 0, b"c".to_vec())]);

    let txns = storage.iterator(None, None).unwrap();
    assert_eq!(txns.iter().map(|t| t.tid).collect::<Vec<_>>(), vec![t1, t2]);
    assert_eq!(txns[1].records.len(), 2);
    assert_eq!(txns[1].records[0].zoid, 1);
    assert_eq!(txns[1].records[0].data, b"b");

    // History-free: t1's overwritten revision of zoid 1 is gone.
    assert_eq!(txns[0].records.len(), 0);

    let bounded = storage.iterator(Some(t2), None).unwrap();
    assert_eq!(bounded.len(), 1);
    assert_eq!(bounded[0].tid, t2);
}
