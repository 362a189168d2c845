//! Blob row operations and tier selection.

use postgres::Client;

use crate::error::{Result, StorageError};

/// What a blob row holds: exactly one tier is populated.
#[derive(Clone, Debug)]
pub(crate) enum BlobTier {
    Inline(Vec<u8>),
    External(String),
}

/// Pick the tier for a blob of `size` bytes.
pub(crate) fn select_tier(size: u64, inline_threshold: u64) -> TierKind {
    if size <= inline_threshold {
        TierKind::Inline
    } else {
        TierKind::External
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum TierKind {
    Inline,
    External,
}

/// Write one blob row inside the commit transaction. In history-free mode
/// older revisions of the same zoid are pruned so only the latest tid
/// survives.
pub(crate) fn write_row(
    conn: &mut Client,
    zoid: u64,
    tid: u64,
    size: u64,
    tier: &BlobTier,
    history_preserving: bool,
) -> Result<()> {
    let (data, key): (Option<&[u8]>, Option<&str>) = match tier {
        BlobTier::Inline(bytes) => (Some(bytes), None),
        BlobTier::External(key) => (None, Some(key)),
    };
    conn.execute(
        "INSERT INTO blob_state (zoid, tid, blob_size, data, object_store_key)
         VALUES ($1, $2, $3, $4, $5)
         ON CONFLICT (zoid, tid) DO UPDATE
            SET blob_size = EXCLUDED.blob_size,
                data = EXCLUDED.data,
                object_store_key = EXCLUDED.object_store_key",
        &[&(zoid as i64), &(tid as i64), &(size as i64), &data, &key],
    )?;
    if !history_preserving {
        conn.execute(
            "DELETE FROM blob_state WHERE zoid = $1 AND tid <> $2",
            &[&(zoid as i64), &(tid as i64)],
        )?;
    }
    Ok(())
}

pub(crate) fn read_row(conn: &mut Client, zoid: u64, tid: u64) -> Result<(u64, BlobTier)> {
    let row = conn
        .query_opt(
            "SELECT blob_size, data, object_store_key FROM blob_state
              WHERE zoid = $1 AND tid = $2",
            &[&(zoid as i64), &(tid as i64)],
        )?
        .ok_or_else(|| StorageError::missing_at(zoid, tid))?;
    let size = row.get::<_, i64>(0) as u64;
    let data: Option<Vec<u8>> = row.get(1);
    let key: Option<String> = row.get(2);
    match (data, key) {
        (Some(bytes), None) => Ok((size, BlobTier::Inline(bytes))),
        (None, Some(key)) => Ok((size, BlobTier::External(key))),
        _ => Err(StorageError::BadPayload(format!(
            "blob row ({zoid}, {tid}) does not have exactly one tier"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tier_threshold_is_inclusive() {
        const MIB: u64 = 1024 * 1024;
        assert_eq!(select_tier(0, MIB), TierKind::Inline);
        assert_eq!(select_tier(MIB, MIB), TierKind::Inline);
        assert_eq!(select_tier(MIB + 1, MIB), TierKind::External);
    }
}
