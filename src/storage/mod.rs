//! Snapshot persistence collaborator.
//!
//! The sync core never creates or deletes documents — it only reads and
//! writes their content blobs through [`SnapshotStore`]:
//! ```text
//! ┌──────────────┐  write_snapshot   ┌───────────────┐
//! │ Coalescer    │ ────────────────► │ SnapshotStore │
//! │ (debounced)  │                   │               │
//! └──────────────┘                   │ MemoryStore   │
//! ┌──────────────┐  read_snapshot    │ RocksStore    │
//! │ Gateway      │ ────────────────► │  (LZ4)        │
//! │ (join prime) │                   └───────────────┘
//! └──────────────┘
//! ```
//!
//! Writes of identical content must be idempotent: writing the same bytes
//! twice leaves stored state unchanged and must not error.

pub mod memory;
pub mod rocks;

pub use memory::MemoryStore;
pub use rocks::{RocksStore, SnapshotMetadata, StoreConfig};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// What kind of document a snapshot belongs to.
///
/// Carried on stored metadata only; the sync core treats all kinds alike.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DocumentKind {
    Workspace,
    Folder,
    File,
}

/// Storage errors.
#[derive(Debug, Clone)]
pub enum StoreError {
    /// Backend failure (database, injected fault, …)
    Backend(String),
    /// No snapshot stored for the document
    NotFound(Uuid),
    SerializationError(String),
    DeserializationError(String),
    CompressionError(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Backend(e) => write!(f, "backend error: {e}"),
            StoreError::NotFound(id) => write!(f, "no snapshot for document {id}"),
            StoreError::SerializationError(e) => write!(f, "serialization error: {e}"),
            StoreError::DeserializationError(e) => write!(f, "deserialization error: {e}"),
            StoreError::CompressionError(e) => write!(f, "compression error: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

/// External snapshot persistence interface.
///
/// Implementations serialize their own internals; callers may invoke these
/// from any task. The core holds the store behind an `Arc` and shares it
/// between the gateway (read on join) and the coalescer (debounced writes).
pub trait SnapshotStore: Send + Sync + 'static {
    /// Persist the full content blob for a document, replacing any previous
    /// snapshot. Repeated writes of identical content are idempotent.
    fn write_snapshot(&self, document_id: Uuid, content: &[u8]) -> Result<(), StoreError>;

    /// Load the last persisted content blob for a document.
    fn read_snapshot(&self, document_id: Uuid) -> Result<Vec<u8>, StoreError>;
}
