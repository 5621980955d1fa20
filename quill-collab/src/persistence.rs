//! Bridge between live in-memory documents and durable storage.
//!
//! Flush cadence is decoupled from edit cadence: a per-note timer persists
//! the current snapshot only while the document is dirty, which bounds
//! storage write amplification under high edit frequency and bounds the
//! data-loss window to one flush interval. Flush failures are logged and
//! retried on the next tick — they are never surfaced to the live session.
//!
//! The bridge is also where discrete version records are materialized, both
//! opportunistically during collaboration (throttled by the engine) and
//! deterministically from the explicit save path.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::document::{DocumentFactory, DocumentHandle, MergeableDocument, NoteProjection};
use crate::storage::{NoteStore, StoreError, VersionRecord};

/// Default interval between flush attempts for a dirty document.
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(5);

/// Loads, flushes and versions documents against the durable store.
pub struct PersistenceBridge {
    store: Arc<NoteStore>,
    factory: Arc<dyn DocumentFactory>,
    flush_interval: Duration,
    tasks: Mutex<HashMap<Uuid, JoinHandle<()>>>,
}

impl PersistenceBridge {
    pub fn new(
        store: Arc<NoteStore>,
        factory: Arc<dyn DocumentFactory>,
        flush_interval: Duration,
    ) -> Self {
        Self {
            store,
            factory,
            flush_interval,
            tasks: Mutex::new(HashMap::new()),
        }
    }

    /// Reconstruct a document from the latest durable encoding, or `None`
    /// if the note was never persisted.
    pub fn load(&self, note_id: Uuid) -> Result<Option<Box<dyn MergeableDocument>>, StoreError> {
        match self.store.load_snapshot(note_id) {
            Ok(snapshot) => {
                let doc = self
                    .factory
                    .hydrate(&snapshot)
                    .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
                Ok(Some(doc))
            }
            Err(StoreError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Begin the recurring flush timer for a note. Idempotent: a note that
    /// already has a running timer keeps it.
    pub async fn start_periodic_flush(&self, note_id: Uuid, handle: DocumentHandle) {
        let mut tasks = self.tasks.lock().await;
        if tasks.contains_key(&note_id) {
            return;
        }

        let store = self.store.clone();
        let interval = self.flush_interval;
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if !handle.take_dirty() {
                    continue;
                }
                let snapshot = handle.encode_snapshot().await;
                match store.save_snapshot(note_id, &snapshot) {
                    Ok(meta) => {
                        log::debug!(
                            "Flushed note {note_id}: {} bytes ({} compressed)",
                            meta.snapshot_size,
                            meta.compressed_size
                        );
                    }
                    Err(e) => {
                        // Retried on the next tick.
                        log::warn!("Flush failed for note {note_id}: {e}");
                        handle.mark_dirty();
                    }
                }
            }
        });
        tasks.insert(note_id, task);
        log::debug!("Started periodic flush for note {note_id}");
    }

    /// Stop the recurring flush timer for a note.
    pub async fn stop_periodic_flush(&self, note_id: Uuid) {
        if let Some(task) = self.tasks.lock().await.remove(&note_id) {
            task.abort();
            log::debug!("Stopped periodic flush for note {note_id}");
        }
    }

    /// Stop every flush timer. Used on engine shutdown.
    pub async fn stop_all(&self) {
        let mut tasks = self.tasks.lock().await;
        for (_, task) in tasks.drain() {
            task.abort();
        }
    }

    /// Whether a flush timer is currently running for the note.
    pub async fn has_flush_task(&self, note_id: Uuid) -> bool {
        self.tasks.lock().await.contains_key(&note_id)
    }

    /// Persist the document's current snapshot immediately, clearing the
    /// dirty flag. Used before eviction and on explicit saves.
    pub async fn flush_now(
        &self,
        note_id: Uuid,
        handle: &DocumentHandle,
    ) -> Result<(), StoreError> {
        let snapshot = handle.encode_snapshot().await;
        self.store.save_snapshot(note_id, &snapshot)?;
        handle.take_dirty();
        Ok(())
    }

    /// Materialize a version record from the document's current projection.
    pub async fn create_version(
        &self,
        note_id: Uuid,
        handle: &DocumentHandle,
        author: Uuid,
        reason: &str,
    ) -> Result<VersionRecord, StoreError> {
        let projection = handle.projection().await;
        self.store.append_version(
            note_id,
            projection.title,
            projection.content,
            author,
            reason.to_string(),
        )
    }

    /// Read-only (title, content) projection from durable state, without
    /// joining the room. `None` if the note was never persisted.
    pub fn projection_from_storage(
        &self,
        note_id: Uuid,
    ) -> Result<Option<NoteProjection>, StoreError> {
        match self.load(note_id)? {
            Some(doc) => Ok(Some(doc.projection())),
            None => Ok(None),
        }
    }

    pub fn store(&self) -> &Arc<NoteStore> {
        &self.store
    }
}

/// Bridge over a fresh test store with a fast flush interval.
#[cfg(test)]
pub(crate) fn test_bridge(path: &std::path::Path) -> PersistenceBridge {
    use crate::document::TextDocumentFactory;
    use crate::storage::StoreConfig;

    let store = Arc::new(NoteStore::open(StoreConfig::for_testing(path.join("db"))).unwrap());
    PersistenceBridge::new(store, Arc::new(TextDocumentFactory), Duration::from_millis(30))
}
