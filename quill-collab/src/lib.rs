//! # quill-collab — Real-time note synchronization engine
//!
//! Hosts one mergeable document per note, accepts concurrent update
//! fragments from many connections, guarantees convergence, tracks ephemeral
//! per-user presence, and bridges to durable storage through periodic,
//! non-blocking snapshots and discrete version records.
//!
//! ## Architecture
//!
//! ```text
//! Connection A ──┐                         ┌── AwarenessTracker (presence)
//!                ├── CollabEngine ── Room ──┤
//! Connection B ──┘    (dispatch)      │     └── DocumentRegistry ── yrs Doc
//!                                     │                  │
//!                              BroadcastFabric    PersistenceBridge
//!                              (fan-out + bus)           │
//!                                                   NoteStore (RocksDB)
//!                                                   ├── snapshots (LZ4)
//!                                                   └── versions (append-only)
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — binary wire protocol (bincode-encoded `Command`/`Event`)
//! - [`document`] — mergeable document trait, yrs implementation, registry
//! - [`awareness`] — per-connection presence with LWW-per-connection clocks
//! - [`broadcast`] — room fan-out and the cross-instance bus
//! - [`engine`] — session/room manager and command dispatcher
//! - [`persistence`] — lazy load, periodic flush, version records
//! - [`storage`] — RocksDB-backed durable store
//! - [`collaborators`] — authorization, note lookup and audit clients
//! - [`server`] — WebSocket front end
//! - [`client`] — WebSocket client with offline queue

pub mod awareness;
pub mod broadcast;
pub mod client;
pub mod collaborators;
pub mod document;
pub mod engine;
pub mod persistence;
pub mod protocol;
pub mod server;
pub mod storage;

// Re-exports for convenience
pub use awareness::{AwarenessTracker, CursorRange, PresenceState, PresenceUpdate};
pub use broadcast::{BroadcastFabric, BroadcastGroup, BusFrame, InstanceBus, MemoryBus, RoomManager};
pub use client::{ClientEvent, CollabClient, ConnectionState, OfflineQueue};
pub use collaborators::{
    AccessValidator, AuditEvent, AuditSink, CollaboratorError, HttpAccessValidator, HttpAuditSink,
    HttpNoteDirectory, MemoryAuditSink, MemoryNoteDirectory, NoteDirectory, NoteInfo,
    StaticAccessValidator,
};
pub use document::{
    ApplyResult, DocumentFactory, DocumentHandle, DocumentRegistry, MergeableDocument,
    NoteProjection, TextDocument, TextDocumentFactory,
};
pub use engine::{CollabEngine, Dispatch, EngineConfig, EngineError, JoinOutcome, JoinRequest};
pub use persistence::{PersistenceBridge, DEFAULT_FLUSH_INTERVAL};
pub use protocol::{ActiveUser, Command, Event, JoinBootstrap, ProtocolError};
pub use server::{CollabServer, ServerConfig};
pub use storage::{NoteMetadata, NoteStore, StoreConfig, StoreError, VersionRecord};
