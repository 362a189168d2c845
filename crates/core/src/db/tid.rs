//! Transaction identifier allocation.
//!
//! One database-wide advisory lock serializes committers (and the packer).
//! The commit path takes the transaction-scoped flavor inside its write
//! transaction, so the lock is released by COMMIT or ROLLBACK with nothing
//! to leak on error paths; the packer takes the session-scoped flavor
//! around its batched transactions. Both flavors contend on the same key.

use postgres::Client;

use crate::error::Result;

/// Advisory lock key shared by every committer against one database.
/// The value spells "pgjsonb!".
pub const COMMIT_LOCK_KEY: i64 = 0x7067_6a73_6f6e_6221;

/// Take the commit lock inside the current transaction; released at
/// COMMIT/ROLLBACK.
pub(crate) fn lock_commit_xact(conn: &mut Client) -> Result<()> {
    conn.execute("SELECT pg_advisory_xact_lock($1)", &[&COMMIT_LOCK_KEY])?;
    Ok(())
}

/// Take the commit lock for the whole session (packer). Pair with
/// [`unlock_session`].
pub(crate) fn lock_session(conn: &mut Client) -> Result<()> {
    conn.execute("SELECT pg_advisory_lock($1)", &[&COMMIT_LOCK_KEY])?;
    Ok(())
}

pub(crate) fn unlock_session(conn: &mut Client) -> Result<()> {
    conn.execute("SELECT pg_advisory_unlock($1)", &[&COMMIT_LOCK_KEY])?;
    Ok(())
}

/// Allocate the next TID: strictly above both the highest committed TID
/// and the wall-clock floor the framework supplies, so TIDs never regress
/// even across clock skew. Call only while holding the commit lock.
pub(crate) fn allocate(conn: &mut Client, lower_bound: u64) -> Result<u64> {
    let row = conn.query_one("SELECT COALESCE(MAX(tid), 0) FROM transaction_log", &[])?;
    let committed: i64 = row.get(0);
    Ok((committed as u64).max(lower_bound) + 1)
}
