//! The storage backend and its per-thread instances.
//!
//! [`Storage`] is the shared backend: it owns the connection pool, the
//! invalidation listener and the instance registry, and installs the
//! schema when it opens. Every thread of the framework works through its
//! own [`StorageInstance`], which owns a scratch directory, an
//! invalidation queue and a commit coordinator. The storage itself wraps a
//! root instance and derefs to it, so single-threaded callers never need
//! `new_instance`.

use std::collections::HashMap;
use std::fs::{self, File};
use std::ops::Deref;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use log::{info, warn};
use parking_lot::Mutex;

use crate::blob::{self, InstanceScratch};
use crate::codec::{self, JsonRecordCodec, RecordCodec};
use crate::config::StorageOptions;
use crate::coordinator::{CommitEnv, Coordinator, TransactionMeta, TxPhase};
use crate::db::pack::PackStats;
use crate::db::pool::ConnectionPool;
use crate::db::{blob as blob_rows, object, pack, schema, tid};
use crate::error::{Result, StorageError};
use crate::invalidation::{InvalQueue, Listener, Registry};
use crate::ostorage::{FsObjectStore, ObjectStore};

/// 8-byte object identifier.
pub type Zoid = u64;
/// 8-byte transaction identifier.
pub type Tid = u64;

/// Rows deleted per pack statement before yielding the lock's shadow.
const PACK_BATCH: i64 = 1000;

/// One committed transaction as seen by [`StorageInstance::iterator`].
#[derive(Clone, Debug)]
pub struct TransactionRecord {
    pub tid: Tid,
    pub username: String,
    pub description: String,
    pub extension: Vec<u8>,
    pub records: Vec<RecordData>,
}

/// One object revision inside a [`TransactionRecord`].
#[derive(Clone, Debug)]
pub struct RecordData {
    pub zoid: Zoid,
    pub data: Vec<u8>,
    pub blob: Option<Vec<u8>>,
}

/// Anything `copy_transactions_from` can replay: this crate's instances,
/// or an adapter over a foreign backend.
pub trait TransactionSource {
    fn transactions(&self, start: Option<Tid>, stop: Option<Tid>) -> Result<Vec<TransactionRecord>>;
}

pub(crate) struct StorageShared {
    options: StorageOptions,
    pool: ConnectionPool,
    codec: Box<dyn RecordCodec>,
    object_store: Option<Arc<dyn ObjectStore>>,
    registry: Registry,
    listener: Mutex<Option<Listener>>,
    next_instance_id: AtomicU64,
    instances: AtomicUsize,
    closed: AtomicBool,
}

impl StorageShared {
    fn release_instance(&self) {
        let remaining = self.instances.fetch_sub(1, Ordering::SeqCst) - 1;
        if remaining == 0 && self.closed.load(Ordering::SeqCst) {
            self.shutdown();
        }
    }

    fn shutdown(&self) {
        if let Some(mut listener) = self.listener.lock().take() {
            listener.stop();
        }
        self.pool.drain();
        info!("storage {:?} shut down", self.options.name);
    }
}

pub struct Storage {
    shared: Arc<StorageShared>,
    root: Option<StorageInstance>,
}

impl Storage {
    /// Open the storage with the built-in JSON record codec and the
    /// filesystem external store from the options (if any).
    pub fn open(options: StorageOptions) -> Result<Storage> {
        Storage::open_with(options, Box::new(JsonRecordCodec), None)
    }

    /// Open with a custom codec and/or external object store. A store
    /// passed here wins over `options.external_blob_dir`.
    pub fn open_with(
        options: StorageOptions,
        codec: Box<dyn RecordCodec>,
        object_store: Option<Arc<dyn ObjectStore>>,
    ) -> Result<Storage> {
        let pool = ConnectionPool::open(
            &options.dsn,
            options.pool_size,
            options.pool_max_size,
            options.pool_timeout,
        )?;
        if !options.read_only {
            let mut conn = pool.lease()?;
            schema::install(&mut conn, options.history_preserving)?;
        }
        blob::sweep_orphans(&options.blob_temp_dir);

        let object_store = match object_store {
            Some(store) => Some(store),
            None => match &options.external_blob_dir {
                Some(dir) => Some(Arc::new(FsObjectStore::open(dir)?) as Arc<dyn ObjectStore>),
                None => None,
            },
        };

        let registry: Registry = Arc::new(Mutex::new(HashMap::new()));
        let listener = Listener::spawn(options.dsn.clone(), options.history_preserving, registry.clone());

        info!(
            "opened storage {:?} ({})",
            options.name,
            if options.history_preserving { "history-preserving" } else { "history-free" },
        );
        let shared = Arc::new(StorageShared {
            options,
            pool,
            codec,
            object_store,
            registry,
            listener: Mutex::new(Some(listener)),
            next_instance_id: AtomicU64::new(0),
            instances: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        });
        let root = StorageInstance::new(shared.clone())?;
        Ok(Storage {
            shared,
            root: Some(root),
        })
    }

    /// Spawn a per-thread instance sharing this backend.
    pub fn new_instance(&self) -> Result<StorageInstance> {
        StorageInstance::new(self.shared.clone())
    }

    /// Stop accepting instances; once the last one is released the pool is
    /// drained and the listener joined.
    pub fn close(&mut self) {
        if !self.shared.closed.swap(true, Ordering::SeqCst) {
            info!("closing storage {:?}", self.shared.options.name);
        }
        // Dropping the root instance releases it; the shutdown runs when
        // the instance count hits zero.
        self.root.take();
    }
}

impl Deref for Storage {
    type Target = StorageInstance;

    fn deref(&self) -> &StorageInstance {
        self.root.as_ref().expect("storage used after close()")
    }
}

impl Drop for Storage {
    fn drop(&mut self) {
        self.close();
    }
}

pub struct StorageInstance {
    shared: Arc<StorageShared>,
    id: u64,
    queue: Arc<InvalQueue>,
    scratch: InstanceScratch,
    coord: Mutex<Coordinator>,
}

impl StorageInstance {
    fn new(shared: Arc<StorageShared>) -> Result<StorageInstance> {
        if shared.closed.load(Ordering::SeqCst) {
            return Err(StorageError::Closed);
        }
        let id = shared.next_instance_id.fetch_add(1, Ordering::SeqCst);
        let queue = Arc::new(InvalQueue::new());
        shared.registry.lock().insert(id, queue.clone());
        shared.instances.fetch_add(1, Ordering::SeqCst);
        let scratch = InstanceScratch::new(&shared.options.blob_temp_dir);
        Ok(StorageInstance {
            shared,
            id,
            queue,
            scratch,
            coord: Mutex::new(Coordinator::new()),
        })
    }

    fn check_writable(&self) -> Result<()> {
        if self.shared.options.read_only {
            return Err(StorageError::ReadOnly);
        }
        Ok(())
    }

    fn commit_env(&self) -> CommitEnv<'_> {
        CommitEnv {
            codec: self.shared.codec.as_ref(),
            object_store: self.shared.object_store.as_deref(),
            options: &self.shared.options,
            scratch: &self.scratch,
        }
    }

    // ----- reads ---------------------------------------------------------

    /// The current record for `zoid` and the serial it was committed at.
    pub fn load(&self, zoid: Zoid) -> Result<(Vec<u8>, Tid)> {
        let mut conn = self.shared.pool.lease()?;
        let row = conn.read_snapshot(|c| object::load_current(c, zoid))?;
        let data = codec::decode_from_store(
            self.shared.codec.as_ref(),
            &row.class_mod,
            &row.class_name,
            &row.refs,
            &row.state,
        )?;
        Ok((data, row.tid))
    }

    /// The newest revision strictly older than `before`: `(data, serial,
    /// next_serial)`, where `next_serial` is `None` for the current
    /// revision. `Ok(None)` when no old-enough revision survives.
    pub fn load_before(&self, zoid: Zoid, before: Tid) -> Result<Option<(Vec<u8>, Tid, Option<Tid>)>> {
        let hp = self.shared.options.history_preserving;
        let mut conn = self.shared.pool.lease()?;
        let found = conn.read_snapshot(|c| object::load_before(c, zoid, before, hp))?;
        match found {
            None => Ok(None),
            Some((row, next_serial)) => {
                let data = codec::decode_from_store(
                    self.shared.codec.as_ref(),
                    &row.class_mod,
                    &row.class_name,
                    &row.refs,
                    &row.state,
                )?;
                Ok(Some((data, row.tid, next_serial)))
            }
        }
    }

    /// The record committed exactly at `(zoid, tid)`.
    pub fn load_serial(&self, zoid: Zoid, tid: Tid) -> Result<Vec<u8>> {
        let hp = self.shared.options.history_preserving;
        let mut conn = self.shared.pool.lease()?;
        let row = conn.read_snapshot(|c| object::load_serial(c, zoid, tid, hp))?;
        codec::decode_from_store(
            self.shared.codec.as_ref(),
            &row.class_mod,
            &row.class_name,
            &row.refs,
            &row.state,
        )
    }

    // ----- two-phase commit ----------------------------------------------

    pub fn tpc_begin(&self, meta: TransactionMeta) -> Result<()> {
        self.check_writable()?;
        let mut coord = self.coord.lock();
        if coord.phase() != TxPhase::Idle {
            return Err(StorageError::InvalidState(coord.phase()));
        }
        let conn = self.shared.pool.lease()?;
        coord.tpc_begin(conn, meta)
    }

    /// Buffer an object write. Returns the provisional serial (always 0).
    pub fn store(&self, zoid: Zoid, old_serial: Tid, data: &[u8]) -> Result<Tid> {
        self.check_writable()?;
        self.coord.lock().store(zoid, old_serial, data.to_vec())
    }

    /// Buffer an object write plus its blob. The engine takes ownership of
    /// `source`: the vote stages it and the finish (or abort) unlinks it.
    pub fn store_blob(
        &self,
        zoid: Zoid,
        old_serial: Tid,
        data: &[u8],
        source: impl Into<PathBuf>,
    ) -> Result<Tid> {
        self.check_writable()?;
        self.coord
            .lock()
            .store_blob(zoid, old_serial, data.to_vec(), source.into())
    }

    /// Write everything and hold the commit lock. Returns the touched
    /// zoids; any failure aborts the transaction.
    pub fn tpc_vote(&self) -> Result<Vec<Zoid>> {
        let env = self.commit_env();
        self.coord.lock().tpc_vote(&env)
    }

    /// Commit. `callback(tid)` runs after the database commit and before
    /// this returns, on the calling thread.
    pub fn tpc_finish(&self, callback: impl FnOnce(Tid)) -> Result<Tid> {
        self.coord.lock().tpc_finish(callback)
    }

    pub fn tpc_abort(&self) -> Result<()> {
        self.coord.lock().tpc_abort()
    }

    // ----- blobs ----------------------------------------------------------

    /// Materialize the blob committed at `(zoid, tid)` into this instance's
    /// scratch directory and return the (read-only) file path.
    pub fn load_blob(&self, zoid: Zoid, tid: Tid) -> Result<PathBuf> {
        let mut conn = self.shared.pool.lease()?;
        let (_, tier) = conn.read_snapshot(|c| blob_rows::read_row(c, zoid, tid))?;
        let bytes = match tier {
            blob_rows::BlobTier::Inline(bytes) => bytes,
            blob_rows::BlobTier::External(key) => {
                let store = self.shared.object_store.as_deref().ok_or_else(|| {
                    StorageError::ExternalStore(format!("row ({zoid}, {tid}) is external but no store is configured"))
                })?;
                store.get(&key)?
            }
        };
        self.scratch.materialize(zoid, tid, &bytes)
    }

    /// As [`Self::load_blob`], but opened for reading. The backing file
    /// outlives the handle as long as the instance does.
    pub fn open_committed_blob_file(&self, zoid: Zoid, tid: Tid) -> Result<File> {
        let path = self.load_blob(zoid, tid)?;
        Ok(File::open(path)?)
    }

    /// This instance's scratch directory, created on first use.
    pub fn temporary_directory(&self) -> Result<PathBuf> {
        Ok(self.scratch.dir()?.to_path_buf())
    }

    // ----- misc upward API -------------------------------------------------

    /// Allocate a fresh object identifier.
    pub fn new_oid(&self) -> Result<Zoid> {
        self.check_writable()?;
        let mut conn = self.shared.pool.lease()?;
        let row = conn.query_one("SELECT nextval('zoid_seq')", &[])?;
        Ok(row.get::<_, i64>(0) as u64)
    }

    /// Invalidations since the previous poll; `None` means "treat your
    /// cache as cold" (first poll, queue overflow, or listener reconnect).
    pub fn poll_invalidations(&self) -> Option<std::collections::HashSet<Zoid>> {
        self.queue.poll()
    }

    pub fn last_transaction(&self) -> Result<Tid> {
        let mut conn = self.shared.pool.lease()?;
        let row = conn.query_one("SELECT COALESCE(MAX(tid), 0) FROM transaction_log", &[])?;
        Ok(row.get::<_, i64>(0) as u64)
    }

    /// Total uncompressed size of all current object records.
    pub fn get_size(&self) -> Result<u64> {
        let mut conn = self.shared.pool.lease()?;
        let row = conn.query_one("SELECT COALESCE(SUM(state_size), 0)::BIGINT FROM object_state", &[])?;
        Ok(row.get::<_, i64>(0) as u64)
    }

    /// Garbage-collect. In history-free mode `pack_time` is ignored; in
    /// history-preserving mode revisions newer than the newest one at or
    /// before `pack_time` survive for every reachable object.
    pub fn pack(&self, pack_time: Tid) -> Result<PackStats> {
        self.check_writable()?;
        let mut conn = self.shared.pool.lease()?;
        tid::lock_session(&mut conn)?;
        let mut conn = scopeguard::guard(conn, |mut conn| {
            if let Err(e) = tid::unlock_session(&mut conn) {
                warn!("failed to release pack lock: {e}");
            }
        });
        let store = self.shared.object_store.as_deref();
        if self.shared.options.history_preserving {
            pack::pack_history_preserving(&mut conn, pack_time, store, PACK_BATCH)
        } else {
            pack::pack_history_free(&mut conn, store, PACK_BATCH)
        }
    }

    // ----- iteration and migration ----------------------------------------

    /// Committed transactions in `[start, stop]` (both inclusive,
    /// defaulting to everything), in TID order, with record data and blob
    /// payloads.
    pub fn iterator(&self, start: Option<Tid>, stop: Option<Tid>) -> Result<Vec<TransactionRecord>> {
        let hp = self.shared.options.history_preserving;
        let codec = self.shared.codec.as_ref();
        let store = self.shared.object_store.as_deref();
        let mut conn = self.shared.pool.lease()?;
        conn.read_snapshot(|c| {
            let lo = start.unwrap_or(0) as i64;
            let hi = stop.map(|t| t as i64).unwrap_or(i64::MAX);
            let txns = c.query(
                "SELECT tid, username, description, extension FROM transaction_log
                  WHERE tid >= $1 AND tid <= $2 ORDER BY tid",
                &[&lo, &hi],
            )?;
            let mut out = Vec::with_capacity(txns.len());
            for txn in txns {
                let tid = txn.get::<_, i64>(0) as u64;
                let mut records = Vec::new();
                for (zoid, row) in object::records_for_tid(c, tid, hp)? {
                    let data =
                        codec::decode_from_store(codec, &row.class_mod, &row.class_name, &row.refs, &row.state)?;
                    let blob = match blob_rows::read_row(c, zoid, tid) {
                        Ok((_, blob_rows::BlobTier::Inline(bytes))) => Some(bytes),
                        Ok((_, blob_rows::BlobTier::External(key))) => {
                            let store = store.ok_or_else(|| {
                                StorageError::ExternalStore(format!(
                                    "blob ({zoid}, {tid}) is external but no store is configured"
                                ))
                            })?;
                            Some(store.get(&key)?)
                        }
                        Err(StorageError::KeyMissing { .. }) => None,
                        Err(e) => return Err(e),
                    };
                    records.push(RecordData { zoid, data, blob });
                }
                out.push(TransactionRecord {
                    tid,
                    username: txn.get(1),
                    description: txn.get(2),
                    extension: txn.get(3),
                    records,
                });
            }
            Ok(out)
        })
    }

    /// Replay every transaction of `source` with its original TID.
    ///
    /// Transactions whose TID is not above our `last_transaction()` are
    /// skipped with a warning, which makes an interrupted migration
    /// resumable. Returns the number of transactions copied.
    pub fn copy_transactions_from(&self, source: &dyn TransactionSource) -> Result<u64> {
        self.check_writable()?;
        let last = self.last_transaction()?;
        let mut copied = 0u64;
        let mut skipped = 0u64;

        for txn in source.transactions(None, None)? {
            if txn.tid <= last {
                skipped += 1;
                continue;
            }
            let meta = TransactionMeta {
                user: txn.username.clone(),
                description: txn.description.clone(),
                extension: txn.extension.clone(),
                tid_floor: 0,
            };
            let mut coord = self.coord.lock();
            let result: Result<()> = (|| {
                let conn = self.shared.pool.lease()?;
                coord.tpc_begin_restore(conn, meta, txn.tid)?;
                for record in &txn.records {
                    match &record.blob {
                        None => {
                            coord.store(record.zoid, 0, record.data.clone())?;
                        }
                        Some(bytes) => {
                            let staged = self
                                .scratch
                                .dir()?
                                .join(format!("restore-{:016x}-{:016x}.blob", txn.tid, record.zoid));
                            fs::write(&staged, bytes)?;
                            coord.store_blob(record.zoid, 0, record.data.clone(), staged)?;
                        }
                    }
                }
                coord.tpc_vote(&self.commit_env())?;
                coord.tpc_finish(|_| {})?;
                Ok(())
            })();
            if let Err(e) = result {
                if coord.phase() != TxPhase::Idle {
                    let _ = coord.tpc_abort();
                }
                return Err(e);
            }
            copied += 1;
        }
        if skipped > 0 {
            warn!("copy_transactions_from: skipped {skipped} transactions with tid <= {last}");
        }

        // Keep new_oid allocation ahead of everything that just arrived.
        let mut conn = self.shared.pool.lease()?;
        let max_zoid: i64 = conn
            .query_one("SELECT COALESCE(MAX(zoid), 0) FROM object_state", &[])?
            .get(0);
        let current: i64 = conn.query_one("SELECT last_value FROM zoid_seq", &[])?.get(0);
        if max_zoid > current {
            conn.execute("SELECT setval('zoid_seq', $1)", &[&max_zoid])?;
        }

        info!("copied {copied} transactions from source storage");
        Ok(copied)
    }

    /// Release this instance: abort any in-flight transaction, drop the
    /// scratch directory and leave the shared backend. Equivalent to drop.
    pub fn release(self) {}
}

impl TransactionSource for StorageInstance {
    fn transactions(&self, start: Option<Tid>, stop: Option<Tid>) -> Result<Vec<TransactionRecord>> {
        self.iterator(start, stop)
    }
}

impl Drop for StorageInstance {
    fn drop(&mut self) {
        {
            let mut coord = self.coord.lock();
            if matches!(coord.phase(), TxPhase::Begun | TxPhase::Voted) {
                let _ = coord.tpc_abort();
            }
        }
        self.shared.registry.lock().remove(&self.id);
        self.scratch.remove();
        self.shared.release_instance();
    }
}
