//! In-memory snapshot store.
//!
//! Backs tests and hosts that embed the sync core without a database. Also
//! supports per-document fault injection so isolation between documents'
//! persistence cycles can be exercised.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use uuid::Uuid;

use super::{SnapshotStore, StoreError};

/// HashMap-backed [`SnapshotStore`].
#[derive(Default)]
pub struct MemoryStore {
    snapshots: Mutex<HashMap<Uuid, Vec<u8>>>,
    failing: Mutex<HashSet<Uuid>>,
    writes: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total successful writes across all documents.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    /// Make every write for `document_id` fail until cleared.
    pub fn fail_writes(&self, document_id: Uuid, failing: bool) {
        let mut set = self.failing.lock().unwrap();
        if failing {
            set.insert(document_id);
        } else {
            set.remove(&document_id);
        }
    }

    /// Current stored content for a document, if any.
    pub fn stored(&self, document_id: &Uuid) -> Option<Vec<u8>> {
        self.snapshots.lock().unwrap().get(document_id).cloned()
    }

    /// Number of documents with a stored snapshot.
    pub fn len(&self) -> usize {
        self.snapshots.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.lock().unwrap().is_empty()
    }
}

impl SnapshotStore for MemoryStore {
    fn write_snapshot(&self, document_id: Uuid, content: &[u8]) -> Result<(), StoreError> {
        if self.failing.lock().unwrap().contains(&document_id) {
            return Err(StoreError::Backend(format!(
                "injected write failure for {document_id}"
            )));
        }
        self.snapshots
            .lock()
            .unwrap()
            .insert(document_id, content.to_vec());
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn read_snapshot(&self, document_id: Uuid) -> Result<Vec<u8>, StoreError> {
        self.snapshots
            .lock()
            .unwrap()
            .get(&document_id)
            .cloned()
            .ok_or(StoreError::NotFound(document_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_read_roundtrip() {
        let store = MemoryStore::new();
        let doc = Uuid::new_v4();

        store.write_snapshot(doc, b"content").unwrap();
        assert_eq!(store.read_snapshot(doc).unwrap(), b"content");
    }

    #[test]
    fn test_read_missing_is_not_found() {
        let store = MemoryStore::new();
        assert!(matches!(
            store.read_snapshot(Uuid::new_v4()),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn test_identical_writes_idempotent() {
        let store = MemoryStore::new();
        let doc = Uuid::new_v4();

        store.write_snapshot(doc, b"same").unwrap();
        store.write_snapshot(doc, b"same").unwrap();

        assert_eq!(store.read_snapshot(doc).unwrap(), b"same");
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_newer_write_replaces() {
        let store = MemoryStore::new();
        let doc = Uuid::new_v4();

        store.write_snapshot(doc, b"v1").unwrap();
        store.write_snapshot(doc, b"v2").unwrap();
        assert_eq!(store.read_snapshot(doc).unwrap(), b"v2");
    }

    #[test]
    fn test_fault_injection_scoped_to_document() {
        let store = MemoryStore::new();
        let doc1 = Uuid::new_v4();
        let doc2 = Uuid::new_v4();

        store.fail_writes(doc1, true);
        assert!(store.write_snapshot(doc1, b"x").is_err());
        store.write_snapshot(doc2, b"y").unwrap();

        store.fail_writes(doc1, false);
        store.write_snapshot(doc1, b"x").unwrap();
        assert_eq!(store.write_count(), 2);
    }
}
