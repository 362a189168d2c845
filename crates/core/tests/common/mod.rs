//! Harness for the database-backed integration tests.
//!
//! The suites need a PostgreSQL to talk to; set `PGJSONB_TEST_DSN` (e.g.
//! `host=localhost port=5433 user=zodb password=zodb dbname=zodb_test`) to
//! run them. Without it every test skips. Tests in one binary share the
//! database, so each one takes the harness lock and resets the schema.

#![allow(dead_code)]

use std::path::Path;
use std::sync::{Mutex, MutexGuard, OnceLock};
use std::time::Duration;

use pgjsonb::{DecodedRecord, JsonRecordCodec, RecordCodec, StorageOptions};
use postgres::{Client, NoTls};

pub const DSN_ENV: &str = "PGJSONB_TEST_DSN";

pub fn test_dsn() -> Option<String> {
    let dsn = std::env::var(DSN_ENV).ok();
    if dsn.is_none() {
        eprintln!("skipping: set {DSN_ENV} to run database-backed tests");
    }
    dsn
}

/// Serializes the tests of one binary against the shared database.
pub fn harness_lock() -> MutexGuard<'static, ()> {
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    let _ = env_logger::builder().is_test(true).try_init();
    LOCK.get_or_init(|| Mutex::new(()))
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub fn connect(dsn: &str) -> Client {
    Client::connect(dsn, NoTls).expect("connect to test database")
}

/// Drop everything the engine ever creates, so the next `Storage::open`
/// installs from scratch.
pub fn reset_database(dsn: &str) {
    let mut client = connect(dsn);
    client
        .batch_execute(
            "DROP TABLE IF EXISTS blob_state, blob_history, object_state,
                                  object_history, pack_state, transaction_log CASCADE;
             DROP SEQUENCE IF EXISTS zoid_seq",
        )
        .expect("reset test database");
}

pub fn options(dsn: &str, blob_temp_dir: &Path) -> StorageOptions {
    StorageOptions::new(dsn)
        .name("test")
        .blob_temp_dir(blob_temp_dir)
        .pool_timeout(Duration::from_secs(5))
}

/// Canonical record bytes for a small object, with `refs` wired for the
/// packer's reachability walk.
pub fn record(class_name: &str, refs: &[u64], marker: u64) -> Vec<u8> {
    JsonRecordCodec
        .encode(&DecodedRecord {
            class_mod: "app.models".into(),
            class_name: class_name.into(),
            state: serde_json::json!({ "marker": marker }),
            refs: refs.to_vec(),
        })
        .expect("encode test record")
}
