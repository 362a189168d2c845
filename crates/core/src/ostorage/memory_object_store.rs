use std::collections::HashMap;

use parking_lot::Mutex;

use crate::error::{Result, StorageError};
use crate::ostorage::ObjectStore;

/// In-memory external object store, for tests.
#[derive(Default)]
pub struct MemoryObjectStore {
    map: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.map.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.lock().is_empty()
    }
}

impl ObjectStore for MemoryObjectStore {
    fn put(&self, key: &str, bytes: &[u8]) -> Result<()> {
        self.map.lock().insert(key.to_owned(), bytes.to_vec());
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Vec<u8>> {
        self.map
            .lock()
            .get(key)
            .cloned()
            .ok_or_else(|| StorageError::ExternalStore(format!("object {key} not found")))
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.map.lock().remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_get_miss() {
        let store = MemoryObjectStore::new();
        store.put("a/b", b"bytes").unwrap();
        assert_eq!(store.get("a/b").unwrap(), b"bytes");
        assert!(store.get("a/c").is_err());
        store.delete("a/b").unwrap();
        assert!(store.is_empty());
    }
}
