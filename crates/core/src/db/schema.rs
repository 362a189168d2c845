//! Schema install and migration.
//!
//! DDL is only executed when a catalogue probe says the tables are absent;
//! `CREATE TABLE` takes an ACCESS EXCLUSIVE lock, and running it while
//! other instances hold REPEATABLE READ snapshots would stall them.

use log::info;
use postgres::Client;

use crate::error::Result;

pub const SCHEMA_VERSION: u32 = 1;

/// Channel the transaction-log trigger notifies on.
pub const INVALIDATION_CHANNEL: &str = "zodb_invalidations";

const HISTORY_FREE_SCHEMA: &str = "\
-- Transaction metadata
CREATE TABLE IF NOT EXISTS transaction_log (
    tid         BIGINT PRIMARY KEY,
    username    TEXT DEFAULT '',
    description TEXT DEFAULT '',
    extension   BYTEA DEFAULT ''
);

-- Current object state (JSONB)
CREATE TABLE IF NOT EXISTS object_state (
    zoid        BIGINT PRIMARY KEY,
    tid         BIGINT NOT NULL REFERENCES transaction_log(tid),
    class_mod   TEXT NOT NULL,
    class_name  TEXT NOT NULL,
    state       JSONB,
    state_size  INTEGER NOT NULL,
    refs        BIGINT[] NOT NULL DEFAULT '{}'
);

-- Blob storage (tiered: inline bytea or external object-store key)
CREATE TABLE IF NOT EXISTS blob_state (
    zoid        BIGINT NOT NULL,
    tid         BIGINT NOT NULL,
    blob_size   BIGINT NOT NULL,
    data        BYTEA,
    object_store_key TEXT,
    PRIMARY KEY (zoid, tid)
);

-- Object identifier allocation
CREATE SEQUENCE IF NOT EXISTS zoid_seq;

-- Indexes for queryability
CREATE INDEX IF NOT EXISTS idx_object_class
    ON object_state (class_mod, class_name);
CREATE INDEX IF NOT EXISTS idx_object_refs
    ON object_state USING gin (refs);

-- Invalidation trigger
CREATE OR REPLACE FUNCTION notify_commit() RETURNS trigger AS $$
BEGIN
    PERFORM pg_notify('zodb_invalidations', NEW.tid::text);
    RETURN NEW;
END;
$$ LANGUAGE plpgsql;

DROP TRIGGER IF EXISTS trg_notify_commit ON transaction_log;
CREATE TRIGGER trg_notify_commit
    AFTER INSERT ON transaction_log
    FOR EACH ROW EXECUTE FUNCTION notify_commit();
";

// blob_history is gone: blob_state (PK zoid, tid) already keeps every blob
// version. Databases created by older releases may still carry it; the
// drop-history migration removes it.
const HISTORY_PRESERVING_ADDITIONS: &str = "\
CREATE TABLE IF NOT EXISTS object_history (
    zoid        BIGINT NOT NULL,
    tid         BIGINT NOT NULL,
    class_mod   TEXT NOT NULL,
    class_name  TEXT NOT NULL,
    state       JSONB,
    state_size  INTEGER NOT NULL,
    refs        BIGINT[] NOT NULL DEFAULT '{}',
    PRIMARY KEY (zoid, tid)
);

CREATE INDEX IF NOT EXISTS idx_history_tid
    ON object_history (tid);
CREATE INDEX IF NOT EXISTS idx_history_zoid_tid
    ON object_history (zoid, tid DESC);

CREATE TABLE IF NOT EXISTS pack_state (
    zoid        BIGINT PRIMARY KEY,
    tid         BIGINT NOT NULL
);
";

/// Scratch table for the packer; history-free databases create it lazily.
pub(crate) const PACK_STATE_DDL: &str = "\
CREATE TABLE IF NOT EXISTS pack_state (
    zoid        BIGINT PRIMARY KEY,
    tid         BIGINT NOT NULL
)";

/// Lightweight existence probe; `to_regclass` reads the catalogue and takes
/// no table-level lock.
pub(crate) fn table_exists(client: &mut Client, name: &str) -> Result<bool> {
    let row = client.query_one("SELECT to_regclass($1) IS NOT NULL", &[&name])?;
    Ok(row.get(0))
}

/// Install the schema. Idempotent: existing tables skip their DDL batch
/// entirely, so a second run takes no exclusive lock.
pub fn install(client: &mut Client, history_preserving: bool) -> Result<()> {
    if !table_exists(client, "transaction_log")? {
        client.batch_execute(HISTORY_FREE_SCHEMA)?;
        info!("installed core schema v{SCHEMA_VERSION}");
    }
    if history_preserving && !table_exists(client, "object_history")? {
        client.batch_execute(HISTORY_PRESERVING_ADDITIONS)?;
        info!("installed history-preserving additions");
    }
    Ok(())
}

/// Row counts removed by [`drop_history`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DropHistoryReport {
    pub history_rows: u64,
    pub pack_rows: u64,
    pub blob_history_rows: u64,
    pub old_blob_versions: u64,
    pub orphan_transactions: u64,
}

/// Switch a history-preserving database to history-free.
///
/// Drops `object_history`, `pack_state` and the deprecated `blob_history`
/// table, prunes `blob_state` to the latest tid per zoid, and deletes
/// transaction rows no longer referenced by any current object row.
pub fn drop_history(client: &mut Client) -> Result<DropHistoryReport> {
    let mut report = DropHistoryReport::default();
    let mut tx = client.transaction()?;

    report.history_rows = drop_counted(&mut tx, "object_history")?;
    report.pack_rows = drop_counted(&mut tx, "pack_state")?;
    report.blob_history_rows = drop_counted(&mut tx, "blob_history")?;

    report.old_blob_versions = tx.execute(
        "DELETE FROM blob_state b
          WHERE EXISTS (
            SELECT 1 FROM blob_state b2
             WHERE b2.zoid = b.zoid AND b2.tid > b.tid
          )",
        &[],
    )?;

    report.orphan_transactions = tx.execute(
        "DELETE FROM transaction_log t
          WHERE NOT EXISTS (
            SELECT 1 FROM object_state os WHERE os.tid = t.tid
          )",
        &[],
    )?;

    tx.commit()?;
    info!(
        "drop-history: {} history rows, {} pack rows, {} blob-history rows, {} old blob versions, {} orphan transactions",
        report.history_rows,
        report.pack_rows,
        report.blob_history_rows,
        report.old_blob_versions,
        report.orphan_transactions
    );
    Ok(report)
}

fn drop_counted(tx: &mut postgres::Transaction<'_>, table: &str) -> Result<u64> {
    let exists: bool = tx.query_one("SELECT to_regclass($1) IS NOT NULL", &[&table])?.get(0);
    if !exists {
        return Ok(0);
    }
    let count: i64 = tx.query_one(&format!("SELECT count(*) FROM {table}"), &[])?.get(0);
    tx.batch_execute(&format!("DROP TABLE {table} CASCADE"))?;
    Ok(count as u64)
}
