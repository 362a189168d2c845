//! The two-phase-commit coordinator.
//!
//! One coordinator per instance, one transaction in flight at a time:
//!
//! ```text
//! Idle -> Begun -> Voted -> Finishing -> Idle
//!           \        \
//!            +--------+--> Aborting -> Idle
//! ```
//!
//! `store`/`store_blob` only buffer; every database statement of a commit
//! happens inside `tpc_vote`, bracketed by an explicit BEGIN from
//! `tpc_begin` and the COMMIT in `tpc_finish`. The commit advisory lock is
//! transaction-scoped, so both COMMIT and ROLLBACK release it.

use std::fs;
use std::path::PathBuf;

use log::error;

use crate::codec::{self, RecordCodec};
use crate::config::StorageOptions;
use crate::db::pool::PooledConn;
use crate::db::{blob, object, tid};
use crate::error::{Result, StorageError};
use crate::blob::InstanceScratch;
use crate::ostorage::{self, ObjectStore};

/// Where an instance's transaction currently stands.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TxPhase {
    Idle,
    Begun,
    Voted,
    Finishing,
    Aborting,
}

/// Framework-supplied transaction metadata.
#[derive(Clone, Debug, Default)]
pub struct TransactionMeta {
    pub user: String,
    pub description: String,
    pub extension: Vec<u8>,
    /// The framework's current notion of "now" in TID units. The allocated
    /// TID is strictly greater than this, so TIDs cannot regress after
    /// clock skew. Zero means "no floor".
    pub tid_floor: u64,
}

struct PendingWrite {
    zoid: u64,
    expected_serial: u64,
    raw: Vec<u8>,
    blob_source: Option<PathBuf>,
}

/// Everything a vote needs from the shared backend and the instance.
pub(crate) struct CommitEnv<'a> {
    pub codec: &'a dyn RecordCodec,
    pub object_store: Option<&'a dyn ObjectStore>,
    pub options: &'a StorageOptions,
    pub scratch: &'a InstanceScratch,
}

pub(crate) struct Coordinator {
    phase: TxPhase,
    conn: Option<PooledConn>,
    meta: TransactionMeta,
    writes: Vec<PendingWrite>,
    tombstoned: Vec<PathBuf>,
    tid: Option<u64>,
    /// Set on the restore path: use this TID verbatim and skip conflict
    /// checks.
    restore_tid: Option<u64>,
}

impl Coordinator {
    pub fn new() -> Self {
        Coordinator {
            phase: TxPhase::Idle,
            conn: None,
            meta: TransactionMeta::default(),
            writes: Vec::new(),
            tombstoned: Vec::new(),
            tid: None,
            restore_tid: None,
        }
    }

    pub fn phase(&self) -> TxPhase {
        self.phase
    }

    fn expect_phase(&self, wanted: TxPhase) -> Result<()> {
        if self.phase == wanted {
            Ok(())
        } else {
            Err(StorageError::InvalidState(self.phase))
        }
    }

    pub fn tpc_begin(&mut self, mut conn: PooledConn, meta: TransactionMeta) -> Result<()> {
        self.expect_phase(TxPhase::Idle)?;
        conn.batch_execute("BEGIN")?;
        conn.mark_in_tx();
        self.conn = Some(conn);
        self.meta = meta;
        self.writes.clear();
        self.tombstoned.clear();
        self.tid = None;
        self.restore_tid = None;
        self.phase = TxPhase::Begun;
        Ok(())
    }

    /// Begin a transaction that replays an already-committed TID
    /// (`copy_transactions_from`).
    pub fn tpc_begin_restore(&mut self, conn: PooledConn, meta: TransactionMeta, tid: u64) -> Result<()> {
        self.tpc_begin(conn, meta)?;
        self.restore_tid = Some(tid);
        Ok(())
    }

    /// Buffer one object write. Returns the provisional serial (always 0;
    /// real serials exist only after the vote).
    pub fn store(&mut self, zoid: u64, expected_serial: u64, raw: Vec<u8>) -> Result<u64> {
        self.expect_phase(TxPhase::Begun)?;
        self.writes.push(PendingWrite {
            zoid,
            expected_serial,
            raw,
            blob_source: None,
        });
        Ok(0)
    }

    /// Buffer one object write together with its blob source file. The file
    /// stays owned by the caller until the vote stages it.
    pub fn store_blob(
        &mut self,
        zoid: u64,
        expected_serial: u64,
        raw: Vec<u8>,
        source: PathBuf,
    ) -> Result<u64> {
        self.expect_phase(TxPhase::Begun)?;
        if !source.exists() {
            return Err(StorageError::BlobSourceMissing(source));
        }
        self.writes.push(PendingWrite {
            zoid,
            expected_serial,
            raw,
            blob_source: Some(source),
        });
        Ok(0)
    }

    /// Run the whole write phase. On success the database transaction is
    /// left open, holding the commit lock, waiting for `tpc_finish`.
    /// Returns the zoids this transaction touches.
    pub fn tpc_vote(&mut self, env: &CommitEnv<'_>) -> Result<Vec<u64>> {
        self.expect_phase(TxPhase::Begun)?;
        match self.vote_inner(env) {
            Ok(touched) => {
                self.phase = TxPhase::Voted;
                Ok(touched)
            }
            Err(e) => {
                self.phase = TxPhase::Aborting;
                self.abort_cleanup();
                Err(e)
            }
        }
    }

    fn vote_inner(&mut self, env: &CommitEnv<'_>) -> Result<Vec<u64>> {
        let conn = self.conn.as_mut().expect("Begun holds a connection");

        tid::lock_commit_xact(conn)?;
        let tid = match self.restore_tid {
            Some(tid) => tid,
            None => tid::allocate(conn, self.meta.tid_floor)?,
        };
        self.tid = Some(tid);

        // The object rows reference the transaction row, so it goes first;
        // its insert trigger queues the NOTIFY the server publishes at
        // COMMIT.
        object::insert_transaction(conn, tid, &self.meta.user, &self.meta.description, &self.meta.extension)?;

        let check_conflicts = self.restore_tid.is_none();
        let mut touched = Vec::with_capacity(self.writes.len());
        for write in &self.writes {
            let stored = codec::encode_for_store(env.codec, &write.raw, env.options.compression_threshold);
            object::store_current(
                conn,
                write.zoid,
                check_conflicts.then_some(write.expected_serial),
                &stored,
                tid,
                env.options.history_preserving,
            )?;
            touched.push(write.zoid);
        }

        for write in &self.writes {
            let Some(source) = &write.blob_source else { continue };
            let bytes = fs::read(source).map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    StorageError::BlobSourceMissing(source.clone())
                } else {
                    e.into()
                }
            })?;
            let size = bytes.len() as u64;
            let tier = match blob::select_tier(size, env.options.inline_blob_threshold) {
                blob::TierKind::Inline => blob::BlobTier::Inline(bytes),
                blob::TierKind::External => {
                    let store = env
                        .object_store
                        .ok_or(StorageError::NoExternalStore { size })?;
                    let key = ostorage::blob_key(write.zoid, tid);
                    store.put(&key, &bytes)?;
                    blob::BlobTier::External(key)
                }
            };
            blob::write_row(conn, write.zoid, tid, size, &tier, env.options.history_preserving)?;
            self.tombstoned.push(env.scratch.entomb(source)?);
        }

        Ok(touched)
    }

    /// Commit. `callback` runs on this thread between the database COMMIT
    /// and the return, while the framework still holds its commit lock.
    pub fn tpc_finish(&mut self, callback: impl FnOnce(u64)) -> Result<u64> {
        self.expect_phase(TxPhase::Voted)?;
        self.phase = TxPhase::Finishing;
        let tid = self.tid.expect("Voted has a tid");

        let committed = self
            .conn
            .as_mut()
            .expect("Voted holds a connection")
            .batch_execute("COMMIT");
        if let Err(e) = committed {
            self.phase = TxPhase::Aborting;
            self.abort_cleanup();
            return Err(e.into());
        }
        if let Some(conn) = self.conn.as_mut() {
            conn.mark_idle();
        }

        // The transaction is durable. Nothing below may fail it.
        for grave in self.tombstoned.drain(..) {
            if let Err(e) = fs::remove_file(&grave) {
                error!("post-commit cleanup of {} failed: {e}", grave.display());
            }
        }
        self.conn = None;
        self.writes.clear();
        self.tid = None;
        self.restore_tid = None;
        self.phase = TxPhase::Idle;

        callback(tid);
        Ok(tid)
    }

    pub fn tpc_abort(&mut self) -> Result<()> {
        match self.phase {
            TxPhase::Begun | TxPhase::Voted => {
                self.phase = TxPhase::Aborting;
                self.abort_cleanup();
                Ok(())
            }
            phase => Err(StorageError::InvalidState(phase)),
        }
    }

    /// Roll back and unlink everything this transaction staged. Best
    /// effort: the rollback itself happens even if file cleanup stumbles.
    fn abort_cleanup(&mut self) {
        if let Some(mut conn) = self.conn.take() {
            match conn.batch_execute("ROLLBACK") {
                Ok(()) => conn.mark_idle(),
                // Leave in_tx set; the pool discards the connection.
                Err(e) => error!("rollback failed: {e}"),
            }
        }
        for write in self.writes.drain(..) {
            if let Some(source) = write.blob_source {
                if source.exists() {
                    if let Err(e) = fs::remove_file(&source) {
                        error!("failed to unlink queued blob {}: {e}", source.display());
                    }
                }
            }
        }
        for grave in self.tombstoned.drain(..) {
            if let Err(e) = fs::remove_file(&grave) {
                error!("failed to unlink staged blob {}: {e}", grave.display());
            }
        }
        self.tid = None;
        self.restore_tid = None;
        self.phase = TxPhase::Idle;
    }
}
