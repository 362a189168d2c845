//! A persistent-object storage backend over PostgreSQL.
//!
//! Object records live as JSONB rows, blobs as tiered attachments (inline
//! bytea or an external object store), and commits go through a two-phase
//! coordinator that assigns strictly monotonic transaction identifiers and
//! fans invalidations out to every cooperating instance via
//! LISTEN/NOTIFY. Two schema flavors are supported: history-free (current
//! state only) and history-preserving (point-in-time reads and history
//! packing).
//!
//! ```no_run
//! use pgjsonb::{Storage, StorageOptions, TransactionMeta};
//!
//! let storage = Storage::open(StorageOptions::new("host=localhost dbname=zodb user=zodb"))?;
//! storage.tpc_begin(TransactionMeta::default())?;
//! storage.store(1, 0, br#"{"@cls": ["app", "Root"], "@s": {}}"#)?;
//! storage.tpc_vote()?;
//! let tid = storage.tpc_finish(|_| {})?;
//! let (record, serial) = storage.load(1)?;
//! assert_eq!(serial, tid);
//! # Ok::<(), pgjsonb::StorageError>(())
//! ```

mod blob;
mod codec;
mod compress;
mod config;
mod coordinator;
mod db;
mod error;
mod invalidation;
mod storage;

pub mod ostorage;

pub use crate::codec::{DecodedRecord, JsonRecordCodec, RecordCodec};
pub use crate::config::StorageOptions;
pub use crate::coordinator::{TransactionMeta, TxPhase};
pub use crate::db::pack::PackStats;
pub use crate::db::schema::{self, DropHistoryReport};
pub use crate::error::{Result, StorageError};
pub use crate::storage::{
    RecordData, Storage, StorageInstance, Tid, TransactionRecord, TransactionSource, Zoid,
};
