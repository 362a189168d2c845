//! Object-state row operations.
//!
//! Everything here runs inside a transaction the caller controls: reads
//! inside an instance's REPEATABLE READ snapshot, writes inside the
//! coordinator's commit transaction.

use postgres::Client;
use serde_json::Value;

use crate::codec::StoredRecord;
use crate::error::{Result, StorageError};

/// One stored revision, as read back from `object_state` or
/// `object_history`.
#[derive(Clone, Debug)]
pub(crate) struct StateRow {
    pub tid: u64,
    pub class_mod: String,
    pub class_name: String,
    pub state: Value,
    pub refs: Vec<u64>,
}

fn state_row(row: &postgres::Row) -> StateRow {
    let refs: Vec<i64> = row.get("refs");
    StateRow {
        tid: row.get::<_, i64>("tid") as u64,
        class_mod: row.get("class_mod"),
        class_name: row.get("class_name"),
        state: row.get("state"),
        refs: refs.into_iter().map(|z| z as u64).collect(),
    }
}

const STATE_COLS: &str = "tid, class_mod, class_name, state, refs";

/// The serial of the current revision, if the object exists.
pub(crate) fn current_serial(conn: &mut Client, zoid: u64) -> Result<Option<u64>> {
    let row = conn.query_opt("SELECT tid FROM object_state WHERE zoid = $1", &[&(zoid as i64)])?;
    Ok(row.map(|r| r.get::<_, i64>(0) as u64))
}

pub(crate) fn load_current(conn: &mut Client, zoid: u64) -> Result<StateRow> {
    conn.query_opt(
        &format!("SELECT {STATE_COLS} FROM object_state WHERE zoid = $1"),
        &[&(zoid as i64)],
    )?
    .map(|r| state_row(&r))
    .ok_or_else(|| StorageError::missing(zoid))
}

/// The revision written exactly at `tid`, from the current table or (in
/// history-preserving mode) from history.
pub(crate) fn load_serial(
    conn: &mut Client,
    zoid: u64,
    tid: u64,
    history_preserving: bool,
) -> Result<StateRow> {
    let current = conn.query_opt(
        &format!("SELECT {STATE_COLS} FROM object_state WHERE zoid = $1 AND tid = $2"),
        &[&(zoid as i64), &(tid as i64)],
    )?;
    if let Some(row) = current {
        return Ok(state_row(&row));
    }
    if history_preserving {
        let row = conn.query_opt(
            &format!("SELECT {STATE_COLS} FROM object_history WHERE zoid = $1 AND tid = $2"),
            &[&(zoid as i64), &(tid as i64)],
        )?;
        if let Some(row) = row {
            return Ok(state_row(&row));
        }
    }
    Err(StorageError::missing_at(zoid, tid))
}

/// The newest revision strictly older than `before`, plus the serial that
/// superseded it (`None` when it is still the current revision).
pub(crate) fn load_before(
    conn: &mut Client,
    zoid: u64,
    before: u64,
    history_preserving: bool,
) -> Result<Option<(StateRow, Option<u64>)>> {
    if !history_preserving {
        // Without history only the current revision can answer, and only
        // when it is old enough.
        let row = conn.query_opt(
            &format!("SELECT {STATE_COLS} FROM object_state WHERE zoid = $1 AND tid < $2"),
            &[&(zoid as i64), &(before as i64)],
        )?;
        return Ok(row.map(|r| (state_row(&r), None)));
    }

    let revisions = format!(
        "SELECT {STATE_COLS} FROM object_state WHERE zoid = $1
          UNION ALL
         SELECT {STATE_COLS} FROM object_history WHERE zoid = $1"
    );
    let row = conn.query_opt(
        &format!("SELECT * FROM ({revisions}) rev WHERE tid < $2 ORDER BY tid DESC LIMIT 1"),
        &[&(zoid as i64), &(before as i64)],
    )?;
    let Some(row) = row else { return Ok(None) };
    let found = state_row(&row);

    let next = conn.query_one(
        &format!("SELECT MIN(tid) FROM ({revisions}) rev WHERE tid > $2"),
        &[&(zoid as i64), &(found.tid as i64)],
    )?;
    let next_serial: Option<i64> = next.get(0);
    Ok(Some((found, next_serial.map(|t| t as u64))))
}

/// Conflict-check and write one buffered store as part of a commit.
///
/// `expected_serial` is what the committer last saw for this object (0 for
/// a brand-new one); `None` skips the check, which only the restore path
/// may do. In history-preserving mode the replaced revision is copied to
/// `object_history` before the upsert.
pub(crate) fn store_current(
    conn: &mut Client,
    zoid: u64,
    expected_serial: Option<u64>,
    record: &StoredRecord,
    tid: u64,
    history_preserving: bool,
) -> Result<()> {
    let actual = current_serial(conn, zoid)?.unwrap_or(0);
    if let Some(expected) = expected_serial {
        if actual != expected {
            return Err(StorageError::Conflict {
                zoid,
                expected,
                actual,
            });
        }
    }

    if history_preserving && actual != 0 {
        conn.execute(
            "INSERT INTO object_history
                    (zoid, tid, class_mod, class_name, state, state_size, refs)
             SELECT zoid, tid, class_mod, class_name, state, state_size, refs
               FROM object_state WHERE zoid = $1",
            &[&(zoid as i64)],
        )?;
    }

    let refs: Vec<i64> = record.refs.iter().map(|&z| z as i64).collect();
    conn.execute(
        "INSERT INTO object_state (zoid, tid, class_mod, class_name, state, state_size, refs)
         VALUES ($1, $2, $3, $4, $5, $6, $7)
         ON CONFLICT (zoid) DO UPDATE
            SET tid = EXCLUDED.tid,
                class_mod = EXCLUDED.class_mod,
                class_name = EXCLUDED.class_name,
                state = EXCLUDED.state,
                state_size = EXCLUDED.state_size,
                refs = EXCLUDED.refs",
        &[
            &(zoid as i64),
            &(tid as i64),
            &record.class_mod,
            &record.class_name,
            &record.state,
            &record.state_size,
            &refs,
        ],
    )?;
    Ok(())
}

/// Every object revision committed exactly at `tid`, for the transaction
/// iterator. In history-preserving mode revisions that were since
/// overwritten are found in history; each zoid appears once either way.
pub(crate) fn records_for_tid(
    conn: &mut Client,
    tid: u64,
    history_preserving: bool,
) -> Result<Vec<(u64, StateRow)>> {
    let sql = if history_preserving {
        format!(
            "SELECT zoid, {STATE_COLS} FROM object_state WHERE tid = $1
             UNION ALL
             SELECT zoid, {STATE_COLS} FROM object_history WHERE tid = $1
             ORDER BY zoid"
        )
    } else {
        format!("SELECT zoid, {STATE_COLS} FROM object_state WHERE tid = $1 ORDER BY zoid")
    };
    let rows = conn.query(&sql, &[&(tid as i64)])?;
    Ok(rows
        .iter()
        .map(|r| (r.get::<_, i64>("zoid") as u64, state_row(r)))
        .collect())
}

/// Write the transaction-log row. The AFTER INSERT trigger queues the
/// invalidation NOTIFY, which the server publishes at COMMIT.
pub(crate) fn insert_transaction(
    conn: &mut Client,
    tid: u64,
    username: &str,
    description: &str,
    extension: &[u8],
) -> Result<()> {
    conn.execute(
        "INSERT INTO transaction_log (tid, username, description, extension)
         VALUES ($1, $2, $3, $4)",
        &[&(tid as i64), &username, &description, &extension],
    )?;
    Ok(())
}
