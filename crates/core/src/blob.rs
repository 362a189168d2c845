//! Per-instance blob scratch directories.
//!
//! Every instance owns one directory under `blob_temp_dir`, created on
//! first use and removed when the instance is released. Materialized blob
//! files live at its top level; staged source files waiting for commit sit
//! in the `tombstone` subdirectory until `tpc_finish` unlinks them (or
//! `tpc_abort` does). Directory names carry the owning pid so a startup
//! sweep can clear the leavings of crashed processes.

use std::fs::{self, File};
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use log::{debug, warn};
use once_cell::sync::OnceCell;

use crate::error::Result;

pub(crate) const SCRATCH_PREFIX: &str = "pgjsonb-";

/// Process-wide counter so instances of different storages sharing one
/// `blob_temp_dir` never collide.
static SCRATCH_SEQ: AtomicU64 = AtomicU64::new(0);

pub(crate) struct InstanceScratch {
    parent: PathBuf,
    name: String,
    dir: OnceCell<PathBuf>,
    tomb_seq: AtomicU64,
}

impl InstanceScratch {
    pub fn new(parent: &Path) -> Self {
        let seq = SCRATCH_SEQ.fetch_add(1, Ordering::Relaxed);
        InstanceScratch {
            parent: parent.to_path_buf(),
            name: format!("{SCRATCH_PREFIX}{}-{seq}", std::process::id()),
            dir: OnceCell::new(),
            tomb_seq: AtomicU64::new(0),
        }
    }

    /// The scratch directory, created on first use.
    pub fn dir(&self) -> Result<&Path> {
        let path = self.dir.get_or_try_init(|| -> Result<PathBuf> {
            let path = self.parent.join(&self.name);
            fs::create_dir_all(path.join("tombstone"))?;
            Ok(path)
        })?;
        Ok(path.as_path())
    }

    /// Write `bytes` as the read-only materialization of blob revision
    /// `(zoid, tid)`. Idempotent: a previous materialization is reused.
    pub fn materialize(&self, zoid: u64, tid: u64, bytes: &[u8]) -> Result<PathBuf> {
        let path = self.dir()?.join(format!("{zoid:016x}-{tid:016x}.blob"));
        if path.exists() {
            return Ok(path);
        }
        let tmp = path.with_extension("part");
        let mut file = File::create(&tmp)?;
        file.write_all(bytes)?;
        let mut perms = file.metadata()?.permissions();
        perms.set_readonly(true);
        file.set_permissions(perms)?;
        drop(file);
        fs::rename(&tmp, &path)?;
        Ok(path)
    }

    /// Move a voted blob source file into the tombstone area, scheduled for
    /// deletion at finish. Falls back to copy+unlink when the source lives
    /// on another filesystem.
    pub fn entomb(&self, source: &Path) -> Result<PathBuf> {
        let seq = self.tomb_seq.fetch_add(1, Ordering::Relaxed);
        let grave = self.dir()?.join("tombstone").join(format!("{seq:08}"));
        if let Err(e) = fs::rename(source, &grave) {
            debug!("cross-device blob staging for {}: {e}", source.display());
            fs::copy(source, &grave)?;
            fs::remove_file(source)?;
        }
        Ok(grave)
    }

    /// Delete the whole scratch directory. Called on instance release.
    pub fn remove(&self) {
        if let Some(dir) = self.dir.get() {
            if let Err(e) = fs::remove_dir_all(dir) {
                warn!("failed to remove scratch dir {}: {e}", dir.display());
            }
        }
    }
}

/// Remove scratch directories left behind by crashed processes. Runs once
/// when a storage opens; only directories whose embedded pid is no longer
/// alive are touched.
pub(crate) fn sweep_orphans(parent: &Path) {
    let entries = match fs::read_dir(parent) {
        Ok(entries) => entries,
        // Nothing to sweep before the first instance ever ran.
        Err(_) => return,
    };
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        let Some(rest) = name.strip_prefix(SCRATCH_PREFIX) else {
            continue;
        };
        let Some(pid) = rest.split('-').next().and_then(|p| p.parse::<u32>().ok()) else {
            continue;
        };
        if pid_alive(pid) {
            continue;
        }
        let path = entry.path();
        match fs::remove_dir_all(&path) {
            Ok(()) => debug!("swept orphan scratch dir {}", path.display()),
            Err(e) => warn!("failed to sweep {}: {e}", path.display()),
        }
    }
}

#[cfg(target_os = "linux")]
fn pid_alive(pid: u32) -> bool {
    Path::new("/proc").join(pid.to_string()).exists()
}

// Without a portable liveness probe, never treat a foreign pid as dead.
#[cfg(not(target_os = "linux"))]
fn pid_alive(pid: u32) -> bool {
    pid != std::process::id()
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn scratch_dir_is_lazy_and_removable() {
        let parent = TempDir::new().unwrap();
        let scratch = InstanceScratch::new(parent.path());
        assert_eq!(fs::read_dir(parent.path()).unwrap().count(), 0);

        let dir = scratch.dir().unwrap().to_path_buf();
        assert!(dir.join("tombstone").is_dir());

        scratch.remove();
        assert!(!dir.exists());
    }

    #[test]
    fn materialize_is_read_only_and_idempotent() {
        let parent = TempDir::new().unwrap();
        let scratch = InstanceScratch::new(parent.path());
        let path = scratch.materialize(7, 42, b"hello").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"hello");
        assert!(fs::metadata(&path).unwrap().permissions().readonly());
        // Second call does not try to rewrite the read-only file.
        assert_eq!(scratch.materialize(7, 42, b"hello").unwrap(), path);
    }

    #[test]
    fn entomb_moves_the_source() {
        let parent = TempDir::new().unwrap();
        let scratch = InstanceScratch::new(parent.path());
        let source = parent.path().join("upload");
        fs::write(&source, b"blob bytes").unwrap();

        let grave = scratch.entomb(&source).unwrap();
        assert!(!source.exists());
        assert_eq!(fs::read(&grave).unwrap(), b"blob bytes");
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn sweep_removes_dead_pid_dirs_only() {
        let parent = TempDir::new().unwrap();
        // A pid from the far end of the default pid space; walk down until
        // one is genuinely not alive.
        let dead_pid = (3_000_000..4_194_304)
            .rev()
            .find(|p| !Path::new("/proc").join(p.to_string()).exists())
            .unwrap();
        let dead = parent.path().join(format!("{SCRATCH_PREFIX}{dead_pid}-0"));
        let live = parent.path().join(format!("{SCRATCH_PREFIX}{}-0", std::process::id()));
        let unrelated = parent.path().join("somebody-else");
        for d in [&dead, &live, &unrelated] {
            fs::create_dir_all(d).unwrap();
        }

        sweep_orphans(parent.path());
        assert!(!dead.exists());
        assert!(live.exists());
        assert!(unrelated.exists());
    }
}
