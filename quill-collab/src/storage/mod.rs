//! Durable storage for note documents and their version history.
//!
//! Architecture:
//! ```text
//! ┌──────────────────┐    flush/load     ┌──────────────┐
//! │ PersistenceBridge│ ────────────────► │  NoteStore   │
//! │ (in-memory docs) │                   │  (RocksDB)   │
//! └──────────────────┘                   └──────┬───────┘
//!                                               │ column families
//!                                               ▼
//!                        ┌──────────────────────────────────────┐
//!                        │ CF "snapshots" — latest doc state     │
//!                        │ CF "versions"  — append-only records  │
//!                        │ CF "metadata"  — per-note bookkeeping │
//!                        └──────────────────────────────────────┘
//! ```
//!
//! Snapshots are LZ4-compressed; version records are immutable and keyed by
//! `note_id ++ version_be` so they sort and scan in version order.
//!
//! Reference: Kleppmann — Designing Data-Intensive Applications, Chapter 3

pub mod rocks;

pub use rocks::{NoteMetadata, NoteStore, StoreConfig, StoreError, VersionRecord};
