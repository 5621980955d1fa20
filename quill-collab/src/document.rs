//! Mergeable document store: one CRDT-replicated document per note.
//!
//! The engine never manipulates document state positionally — every change
//! goes through [`MergeableDocument::apply_fragment`], whose merge is
//! commutative, associative and idempotent. That contract, not locking, is
//! what reconciles concurrent writers: applying the same set of fragments in
//! any order, any number of times, yields the same logical state.
//!
//! [`TextDocument`] is the yrs-backed implementation with two text roots,
//! `"title"` and `"content"`. The trait keeps the algorithm pluggable: the
//! registry, bridge and engine only ever see the trait surface.
//!
//! Reference: Kleppmann — Designing Data-Intensive Applications, Chapter 5
//! (conflict-free replicated data types).

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, GetString, ReadTxn, StateVector, Text, Transact, TransactionMut, Update, WriteTxn};

use crate::persistence::PersistenceBridge;
use crate::storage::StoreError;

/// Outcome of merging one update fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApplyResult {
    /// The fragment decoded and merged cleanly.
    pub accepted: bool,
    /// The merge did not advance the document (duplicate or empty fragment).
    pub no_op: bool,
}

/// The (title, content) projection of a document, used for version records
/// and read-only snapshots.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NoteProjection {
    pub title: String,
    pub content: String,
}

/// Document errors.
#[derive(Debug, Clone)]
pub enum DocumentError {
    /// Fragment did not decode or merge; state is untouched.
    InvalidFragment(String),
    /// Persisted snapshot did not decode into a document.
    CorruptSnapshot(String),
    /// No in-memory document for this note.
    NotOpen(Uuid),
}

impl std::fmt::Display for DocumentError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidFragment(e) => write!(f, "Invalid fragment: {e}"),
            Self::CorruptSnapshot(e) => write!(f, "Corrupt snapshot: {e}"),
            Self::NotOpen(id) => write!(f, "Document not open: {id}"),
        }
    }
}

impl std::error::Error for DocumentError {}

/// The opaque mergeable-document capability.
///
/// Merge must be commutative, associative and idempotent; a fragment must be
/// self-describing enough to merge without the issuer's full state.
pub trait MergeableDocument: Send {
    /// Merge an update fragment. Malformed input fails closed.
    fn apply_fragment(&mut self, fragment: &[u8]) -> Result<ApplyResult, DocumentError>;

    /// Full, self-contained encoding sufficient to reconstruct current state
    /// in a fresh document.
    fn encode_snapshot(&self) -> Vec<u8>;

    /// Current (title, content) projection.
    fn projection(&self) -> NoteProjection;
}

/// Builds documents for the registry and the persistence bridge.
pub trait DocumentFactory: Send + Sync {
    /// A fresh, empty document.
    fn create(&self) -> Box<dyn MergeableDocument>;

    /// A document reconstructed from a persisted snapshot.
    fn hydrate(&self, snapshot: &[u8]) -> Result<Box<dyn MergeableDocument>, DocumentError>;
}

/// yrs-backed note document with `"title"` and `"content"` text roots.
pub struct TextDocument {
    doc: Doc,
}

const TITLE_ROOT: &str = "title";
const CONTENT_ROOT: &str = "content";

impl TextDocument {
    pub fn new() -> Self {
        Self { doc: Doc::new() }
    }

    /// Reconstruct from a snapshot produced by [`MergeableDocument::encode_snapshot`].
    pub fn from_snapshot(snapshot: &[u8]) -> Result<Self, DocumentError> {
        let doc = Self::new();
        let update = Update::decode_v1(snapshot)
            .map_err(|e| DocumentError::CorruptSnapshot(e.to_string()))?;
        {
            let mut txn = doc.doc.transact_mut();
            txn.apply_update(update)
                .map_err(|e| DocumentError::CorruptSnapshot(e.to_string()))?;
        }
        Ok(doc)
    }

    /// Run an edit and return the incremental fragment it produced, encoded
    /// against the pre-edit state vector.
    fn edit<F>(&mut self, f: F) -> Vec<u8>
    where
        F: FnOnce(&mut TransactionMut),
    {
        let before = {
            let txn = self.doc.transact();
            txn.state_vector()
        };
        {
            let mut txn = self.doc.transact_mut();
            f(&mut txn);
        }
        let txn = self.doc.transact();
        txn.encode_state_as_update_v1(&before)
    }

    /// Replace the whole title, returning the fragment.
    pub fn set_title(&mut self, title: &str) -> Vec<u8> {
        let owned = title.to_string();
        self.edit(move |txn| {
            let text = txn.get_or_insert_text(TITLE_ROOT);
            let len = text.len(txn);
            if len > 0 {
                text.remove_range(txn, 0, len);
            }
            text.insert(txn, 0, &owned);
        })
    }

    /// Insert into the content at a character offset, returning the fragment.
    pub fn insert_content(&mut self, index: u32, chunk: &str) -> Vec<u8> {
        let owned = chunk.to_string();
        self.edit(move |txn| {
            let text = txn.get_or_insert_text(CONTENT_ROOT);
            text.insert(txn, index, &owned);
        })
    }

    /// Append to the content, returning the fragment.
    pub fn append_content(&mut self, chunk: &str) -> Vec<u8> {
        let owned = chunk.to_string();
        self.edit(move |txn| {
            let text = txn.get_or_insert_text(CONTENT_ROOT);
            let len = text.len(txn);
            text.insert(txn, len, &owned);
        })
    }

    /// Fragment containing everything the remote state vector is missing.
    pub fn diff_against(&self, remote_state_vector: &[u8]) -> Result<Vec<u8>, DocumentError> {
        let sv = StateVector::decode_v1(remote_state_vector)
            .map_err(|e| DocumentError::InvalidFragment(e.to_string()))?;
        let txn = self.doc.transact();
        Ok(txn.encode_diff_v1(&sv))
    }

    /// Current state vector, encoded.
    pub fn state_vector(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.state_vector().encode_v1()
    }
}

impl Default for TextDocument {
    fn default() -> Self {
        Self::new()
    }
}

impl MergeableDocument for TextDocument {
    fn apply_fragment(&mut self, fragment: &[u8]) -> Result<ApplyResult, DocumentError> {
        let update = Update::decode_v1(fragment)
            .map_err(|e| DocumentError::InvalidFragment(e.to_string()))?;

        let before = {
            let txn = self.doc.transact();
            txn.state_vector().encode_v1()
        };
        {
            let mut txn = self.doc.transact_mut();
            txn.apply_update(update)
                .map_err(|e| DocumentError::InvalidFragment(e.to_string()))?;
        }
        let after = {
            let txn = self.doc.transact();
            txn.state_vector().encode_v1()
        };

        Ok(ApplyResult {
            accepted: true,
            no_op: before == after,
        })
    }

    fn encode_snapshot(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    fn projection(&self) -> NoteProjection {
        let txn = self.doc.transact();
        let title = txn
            .get_text(TITLE_ROOT)
            .map(|t| t.get_string(&txn))
            .unwrap_or_default();
        let content = txn
            .get_text(CONTENT_ROOT)
            .map(|t| t.get_string(&txn))
            .unwrap_or_default();
        NoteProjection { title, content }
    }
}

/// Factory for [`TextDocument`].
pub struct TextDocumentFactory;

impl DocumentFactory for TextDocumentFactory {
    fn create(&self) -> Box<dyn MergeableDocument> {
        Box::new(TextDocument::new())
    }

    fn hydrate(&self, snapshot: &[u8]) -> Result<Box<dyn MergeableDocument>, DocumentError> {
        Ok(Box::new(TextDocument::from_snapshot(snapshot)?))
    }
}

/// Shared handle to one in-memory document.
///
/// The dirty flag is set on every accepted, state-advancing merge and taken
/// by the flush path; a flush failure puts it back so the next tick retries.
#[derive(Clone)]
pub struct DocumentHandle {
    inner: Arc<DocumentCell>,
}

struct DocumentCell {
    doc: Mutex<Box<dyn MergeableDocument>>,
    dirty: AtomicBool,
}

impl DocumentHandle {
    fn new(doc: Box<dyn MergeableDocument>) -> Self {
        Self {
            inner: Arc::new(DocumentCell {
                doc: Mutex::new(doc),
                dirty: AtomicBool::new(false),
            }),
        }
    }

    /// Merge a fragment, marking the document dirty when it advanced.
    pub async fn apply_fragment(&self, fragment: &[u8]) -> Result<ApplyResult, DocumentError> {
        let result = {
            let mut doc = self.inner.doc.lock().await;
            doc.apply_fragment(fragment)?
        };
        if result.accepted && !result.no_op {
            self.inner.dirty.store(true, Ordering::SeqCst);
        }
        Ok(result)
    }

    pub async fn encode_snapshot(&self) -> Vec<u8> {
        self.inner.doc.lock().await.encode_snapshot()
    }

    pub async fn projection(&self) -> NoteProjection {
        self.inner.doc.lock().await.projection()
    }

    pub fn is_dirty(&self) -> bool {
        self.inner.dirty.load(Ordering::SeqCst)
    }

    /// Atomically clear and return the dirty flag.
    pub fn take_dirty(&self) -> bool {
        self.inner.dirty.swap(false, Ordering::SeqCst)
    }

    /// Re-mark dirty, e.g. after a failed flush.
    pub fn mark_dirty(&self) {
        self.inner.dirty.store(true, Ordering::SeqCst);
    }
}

/// Scoped registry of in-memory documents, keyed by note id.
///
/// Owned by the engine instance and passed by reference — per-note state
/// never lives in process-wide globals. Lookup-or-insert happens under one
/// write lock with no await point in between, so concurrent joiners for the
/// same note always receive the same handle.
pub struct DocumentRegistry {
    docs: RwLock<HashMap<Uuid, DocumentHandle>>,
    factory: Arc<dyn DocumentFactory>,
}

impl DocumentRegistry {
    pub fn new(factory: Arc<dyn DocumentFactory>) -> Self {
        Self {
            docs: RwLock::new(HashMap::new()),
            factory,
        }
    }

    /// Return the existing handle for `note_id`, or load one through the
    /// persistence bridge (empty document if never persisted).
    ///
    /// The boolean is true when the document was not previously in memory.
    pub async fn open_or_create(
        &self,
        bridge: &PersistenceBridge,
        note_id: Uuid,
    ) -> Result<(DocumentHandle, bool), StoreError> {
        let mut docs = self.docs.write().await;
        if let Some(handle) = docs.get(&note_id) {
            return Ok((handle.clone(), false));
        }

        let doc = match bridge.load(note_id)? {
            Some(doc) => doc,
            None => self.factory.create(),
        };
        let handle = DocumentHandle::new(doc);
        docs.insert(note_id, handle.clone());
        Ok((handle, true))
    }

    pub async fn get(&self, note_id: Uuid) -> Option<DocumentHandle> {
        self.docs.read().await.get(&note_id).cloned()
    }

    /// Merge a fragment into an open document.
    pub async fn apply_fragment(
        &self,
        note_id: Uuid,
        fragment: &[u8],
    ) -> Result<ApplyResult, DocumentError> {
        let handle = self
            .get(note_id)
            .await
            .ok_or(DocumentError::NotOpen(note_id))?;
        handle.apply_fragment(fragment).await
    }

    pub async fn encode_snapshot(&self, note_id: Uuid) -> Option<Vec<u8>> {
        let handle = self.get(note_id).await?;
        Some(handle.encode_snapshot().await)
    }

    pub async fn projection(&self, note_id: Uuid) -> Option<NoteProjection> {
        let handle = self.get(note_id).await?;
        Some(handle.projection().await)
    }

    /// Evict the in-memory document. The caller guarantees no connections
    /// remain bound to the note.
    pub async fn close(&self, note_id: Uuid) {
        self.docs.write().await.remove(&note_id);
    }

    pub async fn contains(&self, note_id: Uuid) -> bool {
        self.docs.read().await.contains_key(&note_id)
    }

    pub async fn open_count(&self) -> usize {
        self.docs.read().await.len()
    }
}
