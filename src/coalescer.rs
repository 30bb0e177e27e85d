//! Debounced, coalesced snapshot persistence.
//!
//! Rapid edits to a document must not each hit storage. Per document the
//! coalescer runs a small state machine:
//!
//! ```text
//!            edit                    edit (reset timer,
//!             │                      overwrite content)
//!             ▼                        ┌─────┐
//! ┌──────┐  first  ┌───────┐ ◄─────────┘     │
//! │ Idle │ ──────► │ Dirty │ ────────────────┘
//! └──────┘         └───┬───┘
//!    ▲                 │ timer expires, no further edits
//!    │   write done    ▼
//!    └───────────── ┌────────┐
//!     (ok or fail)  │ Saving │ ── edit while saving: buffer,
//!                   └────────┘    re-arm after the write completes
//! ```
//!
//! This is debounce, not throttle: continuous uninterrupted editing defers
//! persistence indefinitely until a quiet gap occurs. The buffer holds only
//! the most recently observed content — never a queue of history — and at
//! most one write is in flight per document. A failed write is logged and
//! the document returns to Idle; the next edit re-arms a clean cycle. State
//! is keyed by document id, so one document's failures or timers never touch
//! another's.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::storage::SnapshotStore;

/// Quiet period before a dirty document is persisted.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(850);

/// Per-document debounce state. Allocated on the first dirty edit after a
/// quiet period, freed when the cycle completes.
struct PendingSnapshot {
    /// Most recently observed full content; `None` while a write is in
    /// flight and no newer edit has arrived.
    latest_content: Option<Vec<u8>>,
    /// Bumped on every edit; a timer only fires if its armed generation is
    /// still current, so a stale timer that lost the abort race is inert.
    generation: u64,
    timer: Option<JoinHandle<()>>,
    saving: bool,
}

impl PendingSnapshot {
    fn new() -> Self {
        Self {
            latest_content: None,
            generation: 0,
            timer: None,
            saving: false,
        }
    }
}

struct Inner {
    store: Arc<dyn SnapshotStore>,
    debounce: Duration,
    pending: Mutex<HashMap<Uuid, PendingSnapshot>>,
    writes_completed: AtomicU64,
    writes_failed: AtomicU64,
}

/// Debounced snapshot writer, shared by cloning.
#[derive(Clone)]
pub struct SnapshotCoalescer {
    inner: Arc<Inner>,
}

impl SnapshotCoalescer {
    pub fn new(store: Arc<dyn SnapshotStore>, debounce: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                debounce,
                pending: Mutex::new(HashMap::new()),
                writes_completed: AtomicU64::new(0),
                writes_failed: AtomicU64::new(0),
            }),
        }
    }

    /// Coalescer with the reference 850 ms quiet period.
    pub fn with_default_debounce(store: Arc<dyn SnapshotStore>) -> Self {
        Self::new(store, DEFAULT_DEBOUNCE)
    }

    /// Record an edit: buffer `content` as the document's latest full
    /// snapshot and (re)start the quiet-period timer.
    ///
    /// `content` replaces whatever was buffered — the coalescer holds one
    /// blob per document, not a history. While a write is in flight the
    /// edit is buffered and a fresh debounce cycle is armed as soon as that
    /// write completes.
    pub async fn observe_edit(&self, document_id: Uuid, content: Vec<u8>) {
        let mut pending = self.inner.pending.lock().await;
        let entry = pending
            .entry(document_id)
            .or_insert_with(PendingSnapshot::new);

        entry.latest_content = Some(content);
        entry.generation = entry.generation.wrapping_add(1);

        if entry.saving {
            // Re-armed by the in-flight write's completion.
            return;
        }

        if let Some(timer) = entry.timer.take() {
            timer.abort();
        }
        entry.timer = Some(self.spawn_timer(document_id, entry.generation));
    }

    /// Persist a document's buffered content immediately, skipping the rest
    /// of the quiet period. Returns true if a write was performed.
    ///
    /// A document that is Idle, or whose write is already in flight, is left
    /// alone (an in-flight write's completion re-arms any buffered edit).
    pub async fn flush_now(&self, document_id: Uuid) -> bool {
        let content = {
            let mut pending = self.inner.pending.lock().await;
            let Some(entry) = pending.get_mut(&document_id) else {
                return false;
            };
            if entry.saving {
                return false;
            }
            let Some(content) = entry.latest_content.take() else {
                return false;
            };
            if let Some(timer) = entry.timer.take() {
                timer.abort();
            }
            entry.generation = entry.generation.wrapping_add(1);
            entry.saving = true;
            content
        };

        self.write_and_settle(document_id, content).await;
        true
    }

    /// Flush every document with buffered content. Used for orderly stops.
    pub async fn flush_all(&self) {
        for document_id in self.pending_documents().await {
            self.flush_now(document_id).await;
        }
    }

    /// Cancel all pending timers and drop buffered state.
    ///
    /// Releases, does not flush: buffered content that never reached the
    /// store stays unconfirmed. Call [`flush_all`](Self::flush_all) first
    /// for an orderly stop.
    pub async fn shutdown(&self) {
        let mut pending = self.inner.pending.lock().await;
        for (_, entry) in pending.iter_mut() {
            if let Some(timer) = entry.timer.take() {
                timer.abort();
            }
        }
        pending.clear();
    }

    /// Documents whose latest content is not yet confirmed saved — the
    /// "Saving…" indicator surface.
    pub async fn pending_documents(&self) -> Vec<Uuid> {
        let pending = self.inner.pending.lock().await;
        pending
            .iter()
            .filter(|(_, e)| e.latest_content.is_some() || e.saving)
            .map(|(id, _)| *id)
            .collect()
    }

    /// Whether a document has an unconfirmed edit.
    pub async fn is_pending(&self, document_id: &Uuid) -> bool {
        let pending = self.inner.pending.lock().await;
        pending
            .get(document_id)
            .map(|e| e.latest_content.is_some() || e.saving)
            .unwrap_or(false)
    }

    /// Snapshot writes that completed successfully.
    pub fn writes_completed(&self) -> u64 {
        self.inner.writes_completed.load(Ordering::Relaxed)
    }

    /// Snapshot writes that the store rejected.
    pub fn writes_failed(&self) -> u64 {
        self.inner.writes_failed.load(Ordering::Relaxed)
    }

    fn spawn_timer(&self, document_id: Uuid, armed_generation: u64) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(this.inner.debounce).await;
            this.fire(document_id, armed_generation).await;
        })
    }

    /// Timer expiry: move Dirty → Saving and write, unless superseded.
    async fn fire(&self, document_id: Uuid, armed_generation: u64) {
        let content = {
            let mut pending = self.inner.pending.lock().await;
            let Some(entry) = pending.get_mut(&document_id) else {
                return;
            };
            if entry.generation != armed_generation {
                return; // a newer edit re-armed; this timer is stale
            }
            let Some(content) = entry.latest_content.take() else {
                return;
            };
            entry.timer = None;
            entry.saving = true;
            content
        };

        self.write_and_settle(document_id, content).await;
    }

    /// Perform the write, then settle the entry: back to Idle, or a fresh
    /// debounce cycle if edits arrived while the write was in flight.
    async fn write_and_settle(&self, document_id: Uuid, content: Vec<u8>) {
        match self.inner.store.write_snapshot(document_id, &content) {
            Ok(()) => {
                self.inner.writes_completed.fetch_add(1, Ordering::Relaxed);
                log::debug!("persisted snapshot for document {document_id}");
            }
            Err(e) => {
                // No retry: the next edit re-arms a clean cycle.
                self.inner.writes_failed.fetch_add(1, Ordering::Relaxed);
                log::error!("snapshot write failed for document {document_id}: {e}");
            }
        }

        let mut pending = self.inner.pending.lock().await;
        let Some(entry) = pending.get_mut(&document_id) else {
            return; // shut down while writing
        };
        entry.saving = false;

        if entry.latest_content.is_some() {
            entry.timer = Some(self.spawn_timer(document_id, entry.generation));
        } else {
            pending.remove(&document_id);
        }
    }
}
