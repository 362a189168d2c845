use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{Result, StorageError};
use crate::ostorage::ObjectStore;

/// Filesystem-backed external object store.
///
/// Keys shard naturally into per-object directories (`<zoid>/<tid>`), so a
/// single flat directory never has to hold millions of entries. Writes go
/// through a sibling temp file and a rename, so readers only ever observe
/// complete objects.
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn object_path(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }
}

impl ObjectStore for FsObjectStore {
    fn put(&self, key: &str, bytes: &[u8]) -> Result<()> {
        let path = self.object_path(key);
        let parent = path.parent().expect("object path has a parent");
        fs::create_dir_all(parent)?;
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, bytes)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Vec<u8>> {
        let path = self.object_path(key);
        fs::read(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                StorageError::ExternalStore(format!("object {key} not found"))
            } else {
                e.into()
            }
        })
    }

    fn delete(&self, key: &str) -> Result<()> {
        let path = self.object_path(key);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
