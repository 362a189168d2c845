use std::env::temp_dir;
use std::path::PathBuf;
use std::time::Duration;

/// [`crate::Storage`] options.
#[derive(Clone, Debug)]
pub struct StorageOptions {
    /// PostgreSQL connection string, e.g.
    /// `host=localhost user=zodb password=zodb dbname=zodb`.
    pub dsn: String,
    /// Human label for this storage, used in log lines.
    ///
    /// Default: `"unnamed"`
    pub name: String,
    /// Keep previous object revisions in `object_history`, enabling
    /// point-in-time reads and history packing.
    ///
    /// Default: `false` (history-free)
    pub history_preserving: bool,
    /// Reject every mutating operation with `ReadOnly`.
    ///
    /// Default: `false`
    pub read_only: bool,
    /// Parent directory for per-instance blob scratch directories.
    ///
    /// Default: the OS temp directory
    pub blob_temp_dir: PathBuf,
    /// Directory backing the filesystem external object store. When `None`
    /// and no store was injected, blobs above [`Self::inline_blob_threshold`]
    /// fail the vote.
    ///
    /// Default: `None`
    pub external_blob_dir: Option<PathBuf>,
    /// Advisory sizing hint for an in-process read cache owned by the layer
    /// above. The engine itself does not cache.
    ///
    /// Default: `None`
    pub cache_local_mb: Option<usize>,
    /// Connections opened eagerly when the storage opens.
    ///
    /// Default: 2
    pub pool_size: usize,
    /// Hard cap on open connections; leases beyond it block.
    ///
    /// Default: 10
    pub pool_max_size: usize,
    /// How long a lease may block before failing with `PoolExhausted`.
    ///
    /// Default: 10 seconds
    pub pool_timeout: Duration,
    /// Blobs at most this many bytes are stored inline in the `data`
    /// column; larger ones go to the external object store.
    ///
    /// Default: 1 MiB
    pub inline_blob_threshold: u64,
    /// Record payloads larger than this are deflate-compressed.
    ///
    /// Default: 8 KiB
    pub compression_threshold: usize,
}

impl StorageOptions {
    pub fn new(dsn: impl Into<String>) -> Self {
        StorageOptions {
            dsn: dsn.into(),
            name: "unnamed".to_owned(),
            history_preserving: false,
            read_only: false,
            blob_temp_dir: temp_dir(),
            external_blob_dir: None,
            cache_local_mb: None,
            pool_size: 2,
            pool_max_size: 10,
            pool_timeout: Duration::from_secs(10),
            inline_blob_threshold: 1024 * 1024,
            compression_threshold: 8 * 1024,
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn history_preserving(mut self, yes: bool) -> Self {
        self.history_preserving = yes;
        self
    }

    pub fn read_only(mut self, yes: bool) -> Self {
        self.read_only = yes;
        self
    }

    pub fn blob_temp_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.blob_temp_dir = dir.into();
        self
    }

    pub fn external_blob_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.external_blob_dir = Some(dir.into());
        self
    }

    pub fn pool_sizes(mut self, min: usize, max: usize) -> Self {
        self.pool_size = min;
        self.pool_max_size = max.max(min.max(1));
        self
    }

    pub fn pool_timeout(mut self, timeout: Duration) -> Self {
        self.pool_timeout = timeout;
        self
    }

    pub fn inline_blob_threshold(mut self, bytes: u64) -> Self {
        self.inline_blob_threshold = bytes;
        self
    }

    pub fn compression_threshold(mut self, bytes: usize) -> Self {
        self.compression_threshold = bytes;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let opts = StorageOptions::new("host=localhost");
        assert_eq!(opts.name, "unnamed");
        assert!(!opts.history_preserving);
        assert!(!opts.read_only);
        assert_eq!(opts.pool_size, 2);
        assert_eq!(opts.pool_max_size, 10);
        assert_eq!(opts.inline_blob_threshold, 1024 * 1024);
        assert_eq!(opts.compression_threshold, 8 * 1024);
    }

    #[test]
    fn pool_max_never_below_min() {
        let opts = StorageOptions::new("x").pool_sizes(8, 4);
        assert_eq!(opts.pool_size, 8);
        assert_eq!(opts.pool_max_size, 8);
    }
}
