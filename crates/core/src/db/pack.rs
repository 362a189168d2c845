//! Garbage collection.
//!
//! Both modes start with a reachability walk from the root object (zoid 0)
//! over the GIN-indexed `refs` arrays into the `pack_state` scratch table,
//! then delete in bounded batches so no single transaction grows with the
//! size of the garbage. The caller holds the commit advisory lock for the
//! whole pack, which serializes it against committers.

use log::{info, warn};
use postgres::Client;

use crate::db::schema::PACK_STATE_DDL;
use crate::error::Result;
use crate::ostorage::ObjectStore;

/// Root of the reachability graph.
const ROOT_ZOID: i64 = 0;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PackStats {
    pub reachable: u64,
    pub objects_removed: u64,
    pub history_removed: u64,
    pub blobs_removed: u64,
    pub transactions_removed: u64,
}

/// History-free pack: drop unreachable objects, their blobs, and the
/// transactions that no longer own any row.
pub(crate) fn pack_history_free(
    conn: &mut Client,
    store: Option<&dyn ObjectStore>,
    batch: i64,
) -> Result<PackStats> {
    let reachable = mark_reachable(conn)?;
    let mut stats = PackStats {
        reachable,
        ..PackStats::default()
    };

    delete_external_objects(
        conn,
        store,
        "SELECT object_store_key FROM blob_state b
          WHERE b.object_store_key IS NOT NULL
            AND NOT EXISTS (SELECT 1 FROM pack_state p WHERE p.zoid = b.zoid)",
    )?;
    stats.blobs_removed = delete_batched(
        conn,
        "DELETE FROM blob_state
          WHERE ctid IN (
            SELECT ctid FROM blob_state b
             WHERE NOT EXISTS (SELECT 1 FROM pack_state p WHERE p.zoid = b.zoid)
             LIMIT $1)",
        batch,
    )?;
    stats.objects_removed = delete_batched(
        conn,
        "DELETE FROM object_state
          WHERE ctid IN (
            SELECT ctid FROM object_state os
             WHERE NOT EXISTS (SELECT 1 FROM pack_state p WHERE p.zoid = os.zoid)
             LIMIT $1)",
        batch,
    )?;
    stats.transactions_removed = delete_batched(
        conn,
        "DELETE FROM transaction_log
          WHERE ctid IN (
            SELECT ctid FROM transaction_log t
             WHERE NOT EXISTS (SELECT 1 FROM object_state os WHERE os.tid = t.tid)
             LIMIT $1)",
        batch,
    )?;

    conn.execute("DELETE FROM pack_state", &[])?;
    info!(
        "pack: {} reachable, removed {} objects, {} blobs, {} transactions",
        stats.reachable, stats.objects_removed, stats.blobs_removed, stats.transactions_removed
    );
    Ok(stats)
}

/// History-preserving pack: for every reachable object keep the newest
/// revision at or before `pack_time` and everything after it; drop the
/// rest, the history of unreachable objects, orphaned blobs and orphaned
/// transactions.
pub(crate) fn pack_history_preserving(
    conn: &mut Client,
    pack_time: u64,
    store: Option<&dyn ObjectStore>,
    batch: i64,
) -> Result<PackStats> {
    let reachable = mark_reachable(conn)?;
    let mut stats = PackStats {
        reachable,
        ..PackStats::default()
    };

    // Resolve each reachable zoid to the revision that must survive.
    conn.execute(
        "UPDATE pack_state p
            SET tid = COALESCE((
                SELECT MAX(tid) FROM (
                    SELECT tid FROM object_state os
                     WHERE os.zoid = p.zoid AND os.tid <= $1
                    UNION ALL
                    SELECT tid FROM object_history h
                     WHERE h.zoid = p.zoid AND h.tid <= $1
                ) revs), 0)",
        &[&(pack_time as i64)],
    )?;

    stats.history_removed = delete_batched(
        conn,
        "DELETE FROM object_history
          WHERE ctid IN (
            SELECT h.ctid FROM object_history h
              LEFT JOIN pack_state p ON p.zoid = h.zoid
             WHERE p.zoid IS NULL OR h.tid < p.tid
             LIMIT $1)",
        batch,
    )?;

    delete_external_objects(
        conn,
        store,
        "SELECT object_store_key FROM blob_state b
          WHERE b.object_store_key IS NOT NULL
            AND NOT EXISTS (SELECT 1 FROM object_state os
                             WHERE os.zoid = b.zoid AND os.tid = b.tid)
            AND NOT EXISTS (SELECT 1 FROM object_history h
                             WHERE h.zoid = b.zoid AND h.tid = b.tid)",
    )?;
    stats.blobs_removed = delete_batched(
        conn,
        "DELETE FROM blob_state
          WHERE ctid IN (
            SELECT ctid FROM blob_state b
             WHERE NOT EXISTS (SELECT 1 FROM object_state os
                                WHERE os.zoid = b.zoid AND os.tid = b.tid)
               AND NOT EXISTS (SELECT 1 FROM object_history h
                                WHERE h.zoid = b.zoid AND h.tid = b.tid)
             LIMIT $1)",
        batch,
    )?;
    stats.transactions_removed = delete_batched(
        conn,
        "DELETE FROM transaction_log
          WHERE ctid IN (
            SELECT ctid FROM transaction_log t
             WHERE NOT EXISTS (SELECT 1 FROM object_state os WHERE os.tid = t.tid)
               AND NOT EXISTS (SELECT 1 FROM object_history h WHERE h.tid = t.tid)
             LIMIT $1)",
        batch,
    )?;

    conn.execute("DELETE FROM pack_state", &[])?;
    info!(
        "pack(before {pack_time}): {} reachable, removed {} history rows, {} blobs, {} transactions",
        stats.reachable, stats.history_removed, stats.blobs_removed, stats.transactions_removed
    );
    Ok(stats)
}

/// Walk the refs graph from the root into `pack_state`. Returns the number
/// of reachable objects.
fn mark_reachable(conn: &mut Client) -> Result<u64> {
    conn.batch_execute(PACK_STATE_DDL)?;
    conn.execute("DELETE FROM pack_state", &[])?;
    conn.execute(
        "INSERT INTO pack_state (zoid, tid)
         SELECT zoid, tid FROM object_state WHERE zoid = $1
         ON CONFLICT (zoid) DO NOTHING",
        &[&ROOT_ZOID],
    )?;
    loop {
        let grown = conn.execute(
            "INSERT INTO pack_state (zoid, tid)
             SELECT os.zoid, os.tid
               FROM object_state os
              WHERE os.zoid IN (
                     SELECT DISTINCT unnest(o.refs)
                       FROM object_state o
                       JOIN pack_state p ON p.zoid = o.zoid)
                AND NOT EXISTS (SELECT 1 FROM pack_state p2 WHERE p2.zoid = os.zoid)",
            &[],
        )?;
        if grown == 0 {
            break;
        }
    }
    let count: i64 = conn.query_one("SELECT count(*) FROM pack_state", &[])?.get(0);
    Ok(count as u64)
}

/// Remove the external-store objects behind the keys `sql` selects. Rows
/// are deleted afterwards by the caller; a failed external delete only
/// leaks an unreferenced object, so it is logged and skipped.
fn delete_external_objects(conn: &mut Client, store: Option<&dyn ObjectStore>, sql: &str) -> Result<()> {
    let Some(store) = store else { return Ok(()) };
    for row in conn.query(sql, &[])? {
        let key: String = row.get(0);
        if let Err(e) = store.delete(&key) {
            warn!("pack: failed to delete external blob {key}: {e}");
        }
    }
    Ok(())
}

/// Run a `DELETE ... LIMIT $1` repeatedly until it stops biting, one
/// implicit transaction per round, so commits queue behind the pack lock
/// for only a bounded time per statement.
fn delete_batched(conn: &mut Client, sql: &str, batch: i64) -> Result<u64> {
    let mut total = 0;
    loop {
        let n = conn.execute(sql, &[&batch])?;
        total += n;
        if (n as i64) < batch {
            return Ok(total);
        }
    }
}
