//! quill-server — WebSocket sync service for collaborative notes.
//!
//! Wires the engine to its production collaborators: the main API for
//! access validation, note lookup and audit, and a RocksDB store for
//! durable snapshots and version history.
//!
//! Configuration is environment-driven:
//!
//! | Variable           | Default                  |
//! |--------------------|--------------------------|
//! | `QUILL_BIND`       | `127.0.0.1:9090`         |
//! | `QUILL_DATA_DIR`   | `quill_data`             |
//! | `QUILL_API_BASE`   | `http://127.0.0.1:3000`  |
//! | `QUILL_API_TOKEN`  | (empty)                  |

use std::sync::Arc;
use std::time::Duration;

use log::info;
use quill_collab::collaborators::{HttpAccessValidator, HttpAuditSink, HttpNoteDirectory};
use quill_collab::document::TextDocumentFactory;
use quill_collab::engine::{CollabEngine, EngineConfig};
use quill_collab::persistence::{PersistenceBridge, DEFAULT_FLUSH_INTERVAL};
use quill_collab::server::{CollabServer, ServerConfig};
use quill_collab::storage::{NoteStore, StoreConfig};

const COLLABORATOR_TIMEOUT: Duration = Duration::from_secs(5);

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let bind_addr = env_or("QUILL_BIND", "127.0.0.1:9090");
    let data_dir = env_or("QUILL_DATA_DIR", "quill_data");
    let api_base = env_or("QUILL_API_BASE", "http://127.0.0.1:3000");
    let api_token = env_or("QUILL_API_TOKEN", "");

    let store = Arc::new(NoteStore::open(StoreConfig {
        path: data_dir.clone().into(),
        ..StoreConfig::default()
    })?);
    let bridge = Arc::new(PersistenceBridge::new(
        store,
        Arc::new(TextDocumentFactory),
        DEFAULT_FLUSH_INTERVAL,
    ));

    let validator = Arc::new(HttpAccessValidator::new(
        api_base.clone(),
        COLLABORATOR_TIMEOUT,
    )?);
    let directory = Arc::new(HttpNoteDirectory::new(api_base.clone(), COLLABORATOR_TIMEOUT)?);
    let audit = Arc::new(HttpAuditSink::new(
        api_base.clone(),
        api_token,
        COLLABORATOR_TIMEOUT,
    )?);

    let engine = CollabEngine::new(EngineConfig::default(), bridge, validator, directory, audit);
    info!(
        "Engine instance {} ready (data dir: {data_dir}, api: {api_base})",
        engine.instance_id()
    );

    let server = CollabServer::new(ServerConfig { bind_addr }, engine);
    server.run().await
}
