//! The session/room manager: binds connections to note rooms and orchestrates
//! every other component.
//!
//! Per connection, per note, the lifecycle is a strict state machine:
//!
//! ```text
//! Unbound ──join──► Authorizing ──validated──► Bound ──leave/disconnect──► Left
//!                        │
//!                        └─ denied / not-found / disconnected ──► Left
//! ```
//!
//! A connection never reaches `Bound` without passing the external access
//! check and the note existence check; both are bounded by a timeout and a
//! timeout reads as denial. The authorization continuation re-checks
//! connection liveness before completing the bind, so a join superseded by a
//! disconnect cannot leave a dangling `Bound` entry.
//!
//! The engine owns the connection → (note, authorization) mapping and the
//! active-connection sets. Documents and presence are only touched through
//! the registry and the tracker. Cross-process divergence is reconciled by
//! the merge contract: fragments relayed over the instance bus are merged
//! into the local replica exactly like local ones.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::time::Instant;
use uuid::Uuid;

use crate::awareness::AwarenessTracker;
use crate::broadcast::{BroadcastFabric, InstanceBus};
use crate::collaborators::{AccessValidator, AuditEvent, AuditSink, NoteDirectory};
use crate::document::{DocumentError, DocumentRegistry, NoteProjection, TextDocumentFactory};
use crate::persistence::PersistenceBridge;
use crate::protocol::{ActiveUser, Command, Event, JoinBootstrap};
use crate::storage::{StoreError, VersionRecord};

/// Engine tunables.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Upper bound on each authorization/lookup call; elapsing reads as
    /// denial.
    pub auth_timeout: Duration,
    /// Minimum spacing between opportunistic version records per note.
    pub version_interval: Duration,
    /// Broadcast channel capacity per room.
    pub broadcast_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            auth_timeout: Duration::from_secs(5),
            version_interval: Duration::from_secs(30),
            broadcast_capacity: 256,
        }
    }
}

/// Engine errors.
#[derive(Debug)]
pub enum EngineError {
    /// Authorization denied the join, or the check timed out.
    AccessDenied,
    /// Note missing from the workspace.
    NotFound,
    /// Malformed update/presence payload; dropped, connection stays bound.
    InvalidFragment(String),
    /// Operation on a note the connection is not bound to.
    NotJoined,
    /// The connection went away while the operation was in flight.
    ConnectionClosed,
    /// Durable store failure.
    Persistence(StoreError),
    /// A collaborator was unreachable or answered garbage.
    Collaborator(String),
}

impl EngineError {
    /// The message surfaced to the connection on the error channel.
    pub fn user_message(&self) -> &'static str {
        match self {
            EngineError::AccessDenied => "Access denied",
            EngineError::NotFound => "Note not found",
            EngineError::InvalidFragment(_) => "Invalid fragment",
            EngineError::NotJoined => "Not joined to note",
            EngineError::ConnectionClosed => "Connection closed",
            EngineError::Persistence(_) => "Internal error",
            EngineError::Collaborator(_) => "Validation failed",
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::AccessDenied => write!(f, "Access denied"),
            EngineError::NotFound => write!(f, "Note not found"),
            EngineError::InvalidFragment(e) => write!(f, "Invalid fragment: {e}"),
            EngineError::NotJoined => write!(f, "Not joined to note"),
            EngineError::ConnectionClosed => write!(f, "Connection closed"),
            EngineError::Persistence(e) => write!(f, "Persistence failure: {e}"),
            EngineError::Collaborator(e) => write!(f, "Collaborator failure: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<StoreError> for EngineError {
    fn from(e: StoreError) -> Self {
        EngineError::Persistence(e)
    }
}

/// Per-connection, per-note binding phase.
#[derive(Debug, Clone, PartialEq, Eq)]
enum ConnectionPhase {
    Authorizing { note_id: Uuid },
    Bound { note_id: Uuid, workspace_id: Uuid },
    Left,
}

/// What the engine knows about one connection.
#[derive(Debug, Clone)]
struct ConnectionEntry {
    user_id: Uuid,
    phase: ConnectionPhase,
}

/// A join request as received from a connection.
#[derive(Debug, Clone)]
pub struct JoinRequest {
    pub note_id: Uuid,
    pub workspace_id: Uuid,
    pub user_id: Uuid,
    pub user_name: String,
    pub credential: String,
}

/// Successful join: the bootstrap to send back plus the room event stream.
pub struct JoinOutcome {
    pub bootstrap: JoinBootstrap,
    pub receiver: broadcast::Receiver<Arc<Vec<u8>>>,
}

/// Result of dispatching one command.
pub enum Dispatch {
    /// A join succeeded; reply with the bootstrap and start draining the
    /// receiver.
    Joined(JoinOutcome),
    /// Nothing to send back.
    None,
}

/// The collaborative document synchronization engine.
pub struct CollabEngine {
    config: EngineConfig,
    documents: DocumentRegistry,
    awareness: AwarenessTracker,
    fabric: BroadcastFabric,
    bridge: Arc<PersistenceBridge>,
    validator: Arc<dyn AccessValidator>,
    directory: Arc<dyn NoteDirectory>,
    audit: Arc<dyn AuditSink>,
    connections: RwLock<HashMap<Uuid, ConnectionEntry>>,
    /// Active-connection set per note. Local connections only; remote
    /// instances' users surface through relayed awareness instead.
    members: RwLock<HashMap<Uuid, HashMap<Uuid, ActiveUser>>>,
    /// Last opportunistic version per note.
    version_marks: Mutex<HashMap<Uuid, Instant>>,
}

impl CollabEngine {
    /// Build a single-instance engine.
    pub fn new(
        config: EngineConfig,
        bridge: Arc<PersistenceBridge>,
        validator: Arc<dyn AccessValidator>,
        directory: Arc<dyn NoteDirectory>,
        audit: Arc<dyn AuditSink>,
    ) -> Arc<Self> {
        let fabric = BroadcastFabric::new(config.broadcast_capacity);
        Self::build(config, fabric, bridge, validator, directory, audit)
    }

    /// Build an engine attached to a shared instance bus for horizontal
    /// scaling.
    pub fn with_bus(
        config: EngineConfig,
        bridge: Arc<PersistenceBridge>,
        validator: Arc<dyn AccessValidator>,
        directory: Arc<dyn NoteDirectory>,
        audit: Arc<dyn AuditSink>,
        bus: Arc<dyn InstanceBus>,
    ) -> Arc<Self> {
        let fabric = BroadcastFabric::with_bus(config.broadcast_capacity, bus);
        Self::build(config, fabric, bridge, validator, directory, audit)
    }

    fn build(
        config: EngineConfig,
        fabric: BroadcastFabric,
        bridge: Arc<PersistenceBridge>,
        validator: Arc<dyn AccessValidator>,
        directory: Arc<dyn NoteDirectory>,
        audit: Arc<dyn AuditSink>,
    ) -> Arc<Self> {
        let engine = Arc::new(Self {
            config,
            documents: DocumentRegistry::new(Arc::new(TextDocumentFactory)),
            awareness: AwarenessTracker::new(),
            fabric,
            bridge,
            validator,
            directory,
            audit,
            connections: RwLock::new(HashMap::new()),
            members: RwLock::new(HashMap::new()),
            version_marks: Mutex::new(HashMap::new()),
        });
        engine.spawn_bus_listener();
        engine
    }

    /// Route one inbound command through the single dispatcher.
    pub async fn handle_command(
        &self,
        connection_id: Uuid,
        command: Command,
    ) -> Result<Dispatch, EngineError> {
        match command {
            Command::Join {
                note_id,
                workspace_id,
                user_id,
                user_name,
                credential,
            } => {
                let outcome = self
                    .join(
                        connection_id,
                        JoinRequest {
                            note_id,
                            workspace_id,
                            user_id,
                            user_name,
                            credential,
                        },
                    )
                    .await?;
                Ok(Dispatch::Joined(outcome))
            }
            Command::Leave { note_id } => {
                self.leave(connection_id, note_id).await?;
                Ok(Dispatch::None)
            }
            Command::UpdateFragment { note_id, payload } => {
                self.update_fragment(connection_id, note_id, &payload).await?;
                Ok(Dispatch::None)
            }
            Command::PresenceFragment { note_id, payload } => {
                self.presence_fragment(connection_id, note_id, &payload)
                    .await?;
                Ok(Dispatch::None)
            }
        }
    }

    /// Bind a connection into a note's room.
    ///
    /// Re-joining the same note while already bound skips authorization and
    /// just re-sends the current bootstrap. Joining a different note
    /// implicitly leaves the previous room first.
    pub async fn join(
        &self,
        connection_id: Uuid,
        request: JoinRequest,
    ) -> Result<JoinOutcome, EngineError> {
        // Phase bookkeeping; detect idempotent re-join and implicit switch.
        // No await happens while the lock is held.
        enum JoinPath {
            Rebootstrap,
            Fresh { previous_note: Option<Uuid> },
        }
        let path = {
            let mut connections = self.connections.write().await;
            match connections.get(&connection_id).map(|e| e.phase.clone()) {
                Some(ConnectionPhase::Bound { note_id, .. }) if note_id == request.note_id => {
                    JoinPath::Rebootstrap
                }
                previous => {
                    connections.insert(
                        connection_id,
                        ConnectionEntry {
                            user_id: request.user_id,
                            phase: ConnectionPhase::Authorizing {
                                note_id: request.note_id,
                            },
                        },
                    );
                    JoinPath::Fresh {
                        previous_note: match previous {
                            Some(ConnectionPhase::Bound { note_id, .. }) => Some(note_id),
                            _ => None,
                        },
                    }
                }
            }
        };
        match path {
            JoinPath::Rebootstrap => {
                return self.rebootstrap(connection_id, request.note_id).await;
            }
            JoinPath::Fresh {
                previous_note: Some(previous),
            } => {
                self.detach(connection_id, previous).await;
            }
            JoinPath::Fresh { .. } => {}
        }

        match self.authorize_and_bind(connection_id, &request).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                // The join attempt is terminal for this binding; the
                // connection itself stays open.
                let mut connections = self.connections.write().await;
                if let Some(entry) = connections.get_mut(&connection_id) {
                    if entry.phase
                        == (ConnectionPhase::Authorizing {
                            note_id: request.note_id,
                        })
                    {
                        entry.phase = ConnectionPhase::Left;
                    }
                }
                Err(e)
            }
        }
    }

    async fn authorize_and_bind(
        &self,
        connection_id: Uuid,
        request: &JoinRequest,
    ) -> Result<JoinOutcome, EngineError> {
        // External access check, bounded: a hung authorizer reads as denial.
        let access = tokio::time::timeout(
            self.config.auth_timeout,
            self.validator.validate_access(
                request.workspace_id,
                request.user_id,
                &request.credential,
            ),
        )
        .await;
        match access {
            Err(_) => {
                log::warn!(
                    "Authorization timed out for user {} in workspace {}",
                    request.user_id,
                    request.workspace_id
                );
                return Err(EngineError::AccessDenied);
            }
            Ok(Err(e)) => {
                log::warn!("Authorization call failed: {e}");
                return Err(EngineError::Collaborator(e.to_string()));
            }
            Ok(Ok(false)) => return Err(EngineError::AccessDenied),
            Ok(Ok(true)) => {}
        }

        // Note must exist inside the requested workspace.
        let note = tokio::time::timeout(
            self.config.auth_timeout,
            self.directory
                .find_note(request.note_id, request.workspace_id, &request.credential),
        )
        .await;
        match note {
            Err(_) => return Err(EngineError::AccessDenied),
            Ok(Err(e)) => {
                log::warn!("Note lookup failed: {e}");
                return Err(EngineError::Collaborator(e.to_string()));
            }
            Ok(Ok(None)) => return Err(EngineError::NotFound),
            Ok(Ok(Some(_))) => {}
        }

        let user = ActiveUser {
            connection_id,
            user_id: request.user_id,
            name: request.user_name.clone(),
        };

        // The connection may have disconnected while we were waiting on the
        // collaborators; never complete the bind for a dead connection.
        {
            let mut connections = self.connections.write().await;
            let entry = connections
                .get_mut(&connection_id)
                .ok_or(EngineError::ConnectionClosed)?;
            if entry.phase
                != (ConnectionPhase::Authorizing {
                    note_id: request.note_id,
                })
            {
                return Err(EngineError::ConnectionClosed);
            }

            let mut members = self.members.write().await;
            members
                .entry(request.note_id)
                .or_default()
                .insert(connection_id, user.clone());
            entry.phase = ConnectionPhase::Bound {
                note_id: request.note_id,
                workspace_id: request.workspace_id,
            };
        }

        // Lazy-load the document and begin flushing it.
        let (handle, created) = match self
            .documents
            .open_or_create(&self.bridge, request.note_id)
            .await
        {
            Ok(loaded) => loaded,
            Err(e) => {
                log::error!("Failed to load note {}: {e}", request.note_id);
                self.detach(connection_id, request.note_id).await;
                return Err(EngineError::Persistence(e));
            }
        };
        if created {
            self.bridge
                .start_periodic_flush(request.note_id, handle.clone())
                .await;
        }

        let snapshot = handle.encode_snapshot().await;
        let awareness = self.awareness.snapshot(request.note_id).await;
        let active_users = self.active_users(request.note_id).await;
        let receiver = self.fabric.subscribe(request.note_id).await;

        self.publish(
            request.note_id,
            &Event::UserJoined {
                note_id: request.note_id,
                user,
            },
        )
        .await;

        log::info!(
            "User {} joined note {} ({} active)",
            request.user_id,
            request.note_id,
            active_users.len()
        );

        Ok(JoinOutcome {
            bootstrap: JoinBootstrap {
                note_id: request.note_id,
                snapshot,
                active_users,
                awareness,
            },
            receiver,
        })
    }

    /// Idempotent re-join: re-send the current room state.
    async fn rebootstrap(
        &self,
        connection_id: Uuid,
        note_id: Uuid,
    ) -> Result<JoinOutcome, EngineError> {
        let handle = self
            .documents
            .get(note_id)
            .await
            .ok_or(EngineError::NotJoined)?;
        let snapshot = handle.encode_snapshot().await;
        let awareness = self.awareness.snapshot(note_id).await;
        let active_users = self.active_users(note_id).await;
        let receiver = self.fabric.subscribe(note_id).await;
        log::debug!("Re-sent bootstrap for connection {connection_id} on note {note_id}");
        Ok(JoinOutcome {
            bootstrap: JoinBootstrap {
                note_id,
                snapshot,
                active_users,
                awareness,
            },
            receiver,
        })
    }

    /// Leave a note's room. A no-op when the connection is not bound to it.
    pub async fn leave(&self, connection_id: Uuid, note_id: Uuid) -> Result<(), EngineError> {
        let bound = {
            let mut connections = self.connections.write().await;
            match connections.get_mut(&connection_id) {
                Some(entry)
                    if matches!(
                        entry.phase,
                        ConnectionPhase::Bound { note_id: bound, .. } if bound == note_id
                    ) =>
                {
                    entry.phase = ConnectionPhase::Left;
                    true
                }
                _ => false,
            }
        };
        if !bound {
            return Ok(());
        }
        self.detach(connection_id, note_id).await;
        Ok(())
    }

    /// Remove a connection from a room and evict the room if it emptied.
    async fn detach(&self, connection_id: Uuid, note_id: Uuid) {
        let (removed, room_empty) = {
            let mut members = self.members.write().await;
            match members.get_mut(&note_id) {
                Some(room) => {
                    let removed = room.remove(&connection_id);
                    let empty = room.is_empty();
                    if empty {
                        members.remove(&note_id);
                    }
                    (removed, empty)
                }
                None => (None, false),
            }
        };
        let Some(user) = removed else {
            return;
        };

        // Tombstone presence so peers converge on "user left".
        if let Some(diff) = self.awareness.clear(note_id, connection_id).await {
            self.publish(
                note_id,
                &Event::PresenceFragment {
                    note_id,
                    connection_id,
                    payload: diff,
                },
            )
            .await;
        }
        self.publish(
            note_id,
            &Event::UserLeft {
                note_id,
                connection_id,
                user_id: user.user_id,
            },
        )
        .await;

        if room_empty {
            self.evict(note_id).await;
        }

        log::info!("User {} left note {note_id}", user.user_id);
    }

    /// Flush and drop all in-memory state for an empty room.
    async fn evict(&self, note_id: Uuid) {
        if let Some(handle) = self.documents.get(note_id).await {
            if let Err(e) = self.bridge.flush_now(note_id, &handle).await {
                // Keep the document and its flush timer alive so the retry
                // loop can still get the data out.
                log::error!("Final flush failed for note {note_id}, deferring eviction: {e}");
                return;
            }
        }
        self.bridge.stop_periodic_flush(note_id).await;
        self.documents.close(note_id).await;
        self.awareness.remove_room(note_id).await;
        self.fabric.drop_room(note_id).await;
        self.version_marks.lock().await.remove(&note_id);
        log::info!("Evicted note {note_id} (room empty)");
    }

    /// Tear down everything a closed connection was bound to.
    pub async fn disconnect(&self, connection_id: Uuid) {
        let bound_note = {
            let connections = self.connections.read().await;
            connections
                .get(&connection_id)
                .and_then(|entry| match entry.phase {
                    ConnectionPhase::Bound { note_id, .. } => Some(note_id),
                    _ => None,
                })
        };
        if let Some(note_id) = bound_note {
            let _ = self.leave(connection_id, note_id).await;
        }
        // Dropping the entry also invalidates any in-flight authorization.
        self.connections.write().await.remove(&connection_id);
    }

    /// Merge an update fragment and fan it out to the room.
    pub async fn update_fragment(
        &self,
        connection_id: Uuid,
        note_id: Uuid,
        payload: &[u8],
    ) -> Result<(), EngineError> {
        let (user_id, workspace_id) = self.bound_identity(connection_id, note_id).await?;

        match self.documents.apply_fragment(note_id, payload).await {
            Ok(_) => {}
            Err(DocumentError::InvalidFragment(e)) => {
                // Dropped without corrupting state; the connection stays
                // bound.
                log::warn!("Dropping malformed fragment for note {note_id}: {e}");
                return Err(EngineError::InvalidFragment(e));
            }
            Err(e) => {
                log::warn!("Fragment rejected for note {note_id}: {e}");
                return Err(EngineError::NotJoined);
            }
        }

        self.publish(
            note_id,
            &Event::UpdateFragment {
                note_id,
                connection_id,
                payload: payload.to_vec(),
            },
        )
        .await;

        self.maybe_create_version(note_id, user_id, workspace_id).await;
        Ok(())
    }

    /// Merge a presence fragment and fan out the resulting diff.
    pub async fn presence_fragment(
        &self,
        connection_id: Uuid,
        note_id: Uuid,
        payload: &[u8],
    ) -> Result<(), EngineError> {
        self.bound_identity(connection_id, note_id).await?;

        let diff = self
            .awareness
            .apply(note_id, connection_id, payload)
            .await
            .map_err(|e| {
                log::warn!("Dropping malformed presence fragment for note {note_id}: {e}");
                EngineError::InvalidFragment(e.to_string())
            })?;

        // A stale fragment lost the per-connection LWW race; nothing to say.
        if let Some(diff) = diff {
            self.publish(
                note_id,
                &Event::PresenceFragment {
                    note_id,
                    connection_id,
                    payload: diff,
                },
            )
            .await;
        }
        Ok(())
    }

    /// The deterministic save path: re-validate, flush, version, audit.
    ///
    /// Works against the live document when the note's room is open, or
    /// against durable state otherwise.
    pub async fn save(
        &self,
        note_id: Uuid,
        workspace_id: Uuid,
        user_id: Uuid,
        credential: &str,
    ) -> Result<VersionRecord, EngineError> {
        let allowed = tokio::time::timeout(
            self.config.auth_timeout,
            self.validator.validate_update(note_id, user_id, credential),
        )
        .await;
        match allowed {
            Err(_) => return Err(EngineError::AccessDenied),
            Ok(Err(e)) => return Err(EngineError::Collaborator(e.to_string())),
            Ok(Ok(false)) => return Err(EngineError::AccessDenied),
            Ok(Ok(true)) => {}
        }

        let record = match self.documents.get(note_id).await {
            Some(handle) => {
                self.bridge.flush_now(note_id, &handle).await?;
                self.bridge
                    .create_version(note_id, &handle, user_id, "Manual save")
                    .await?
            }
            None => match self.bridge.projection_from_storage(note_id)? {
                Some(projection) => self.bridge.store().append_version(
                    note_id,
                    projection.title,
                    projection.content,
                    user_id,
                    "Manual save".to_string(),
                )?,
                None => return Err(EngineError::NotFound),
            },
        };

        self.audit_version(&record, user_id, workspace_id);
        Ok(record)
    }

    /// Read-only (title, content) view without joining the room. Prefers
    /// the live in-memory document, falls back to durable state.
    pub async fn note_snapshot(
        &self,
        note_id: Uuid,
    ) -> Result<Option<NoteProjection>, EngineError> {
        if let Some(projection) = self.documents.projection(note_id).await {
            return Ok(Some(projection));
        }
        Ok(self.bridge.projection_from_storage(note_id)?)
    }

    /// Users currently bound to the note on this instance.
    pub async fn active_users(&self, note_id: Uuid) -> Vec<ActiveUser> {
        let members = self.members.read().await;
        members
            .get(&note_id)
            .map(|room| room.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of connections currently bound to the note.
    pub async fn active_connection_count(&self, note_id: Uuid) -> usize {
        let members = self.members.read().await;
        members.get(&note_id).map(|room| room.len()).unwrap_or(0)
    }

    pub fn bridge(&self) -> &Arc<PersistenceBridge> {
        &self.bridge
    }

    pub fn instance_id(&self) -> Uuid {
        self.fabric.instance_id()
    }

    // ─── Internals ───────────────────────────────────────────────────

    async fn bound_identity(
        &self,
        connection_id: Uuid,
        note_id: Uuid,
    ) -> Result<(Uuid, Uuid), EngineError> {
        let connections = self.connections.read().await;
        match connections.get(&connection_id) {
            Some(entry) => match entry.phase {
                ConnectionPhase::Bound {
                    note_id: bound,
                    workspace_id,
                } if bound == note_id => Ok((entry.user_id, workspace_id)),
                _ => Err(EngineError::NotJoined),
            },
            None => Err(EngineError::NotJoined),
        }
    }

    async fn publish(&self, note_id: Uuid, event: &Event) {
        if let Err(e) = self.fabric.publish(note_id, event).await {
            log::warn!("Broadcast failed for note {note_id}: {e}");
        }
    }

    /// Opportunistic version creation, throttled to one per interval per
    /// note so high edit frequency cannot amplify into version-record spam.
    async fn maybe_create_version(&self, note_id: Uuid, user_id: Uuid, workspace_id: Uuid) {
        let due = {
            let mut marks = self.version_marks.lock().await;
            let now = Instant::now();
            match marks.get_mut(&note_id) {
                Some(last) => {
                    if now.duration_since(*last) >= self.config.version_interval {
                        *last = now;
                        true
                    } else {
                        false
                    }
                }
                None => {
                    marks.insert(note_id, now);
                    // First fragment for the room starts the clock.
                    false
                }
            }
        };
        if !due {
            return;
        }

        let Some(handle) = self.documents.get(note_id).await else {
            return;
        };
        match self
            .bridge
            .create_version(note_id, &handle, user_id, "Auto-saved during collaboration")
            .await
        {
            Ok(record) => self.audit_version(&record, user_id, workspace_id),
            Err(e) => log::warn!("Opportunistic version failed for note {note_id}: {e}"),
        }
    }

    /// Fire-and-forget audit; failures are logged and swallowed.
    fn audit_version(&self, record: &VersionRecord, user_id: Uuid, workspace_id: Uuid) {
        let audit = self.audit.clone();
        let event = AuditEvent {
            action: "note_updated".into(),
            user_id,
            workspace_id,
            resource_id: record.note_id,
            resource_type: "note".into(),
            details: serde_json::json!({
                "title": record.title,
                "version": record.version_number,
            }),
        };
        tokio::spawn(async move {
            if let Err(e) = audit.log_event(event).await {
                log::warn!("Audit sink failed: {e}");
            }
        });
    }

    /// Relay frames published by sibling instances into local state.
    fn spawn_bus_listener(self: &Arc<Self>) {
        let Some(mut receiver) = self.fabric.bus_receiver() else {
            return;
        };
        let own_instance = self.fabric.instance_id();
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                let frame = match receiver.recv().await {
                    Ok(frame) => frame,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        log::warn!("Instance bus lagged by {n} frames");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                if frame.origin_instance == own_instance {
                    continue;
                }
                let Some(engine) = weak.upgrade() else {
                    break;
                };
                engine.handle_bus_frame(frame).await;
            }
        });
    }

    async fn handle_bus_frame(&self, frame: crate::broadcast::BusFrame) {
        let event = match Event::decode(&frame.payload) {
            Ok(event) => event,
            Err(e) => {
                log::warn!("Undecodable bus frame: {e}");
                return;
            }
        };

        match &event {
            Event::UpdateFragment {
                note_id, payload, ..
            } => {
                // Merge into the local replica when the room is open here;
                // commutativity makes the relative order irrelevant.
                if let Some(handle) = self.documents.get(*note_id).await {
                    if let Err(e) = handle.apply_fragment(payload).await {
                        log::warn!("Relayed fragment rejected for note {note_id}: {e}");
                        return;
                    }
                }
                self.fabric.publish_local(*note_id, frame.payload).await;
            }
            Event::PresenceFragment {
                note_id,
                connection_id,
                payload,
            } => {
                match self.awareness.apply(*note_id, *connection_id, payload).await {
                    Ok(Some(_)) => {
                        self.fabric.publish_local(*note_id, frame.payload).await;
                    }
                    Ok(None) => {}
                    Err(e) => log::warn!("Relayed presence rejected for note {note_id}: {e}"),
                }
            }
            Event::UserJoined { note_id, .. } | Event::UserLeft { note_id, .. } => {
                self.fabric.publish_local(*note_id, frame.payload).await;
            }
            Event::JoinAccepted(_) | Event::Error { .. } => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::MemoryBus;
    use crate::collaborators::{
        CollaboratorError, MemoryAuditSink, MemoryNoteDirectory, StaticAccessValidator,
    };
    use crate::document::{MergeableDocument, TextDocument};
    use async_trait::async_trait;

    struct TestBed {
        engine: Arc<CollabEngine>,
        directory: Arc<MemoryNoteDirectory>,
        audit: Arc<MemoryAuditSink>,
        _dir: tempfile::TempDir,
    }

    fn testbed_with(config: EngineConfig, validator: Arc<dyn AccessValidator>) -> TestBed {
        let dir = tempfile::tempdir().unwrap();
        let bridge = Arc::new(crate::persistence::test_bridge(dir.path()));
        let directory = Arc::new(MemoryNoteDirectory::new());
        let audit = Arc::new(MemoryAuditSink::new());
        let engine = CollabEngine::new(
            config,
            bridge,
            validator,
            directory.clone(),
            audit.clone(),
        );
        TestBed {
            engine,
            directory,
            audit,
            _dir: dir,
        }
    }

    fn testbed() -> TestBed {
        testbed_with(
            EngineConfig::default(),
            Arc::new(StaticAccessValidator::allow_all()),
        )
    }

    fn request(note_id: Uuid, workspace_id: Uuid, name: &str) -> JoinRequest {
        JoinRequest {
            note_id,
            workspace_id,
            user_id: Uuid::new_v4(),
            user_name: name.into(),
            credential: "token".into(),
        }
    }

    /// Validator that answers after a delay.
    struct SlowValidator {
        delay: Duration,
        answer: bool,
    }

    #[async_trait]
    impl AccessValidator for SlowValidator {
        async fn validate_access(
            &self,
            _workspace_id: Uuid,
            _user_id: Uuid,
            _credential: &str,
        ) -> Result<bool, CollaboratorError> {
            tokio::time::sleep(self.delay).await;
            Ok(self.answer)
        }

        async fn validate_update(
            &self,
            _note_id: Uuid,
            _user_id: Uuid,
            _credential: &str,
        ) -> Result<bool, CollaboratorError> {
            tokio::time::sleep(self.delay).await;
            Ok(self.answer)
        }
    }

    #[tokio::test]
    async fn test_join_denied_leaves_no_trace() {
        let bed = testbed_with(
            EngineConfig::default(),
            Arc::new(StaticAccessValidator::deny_all()),
        );
        let note = Uuid::new_v4();
        let workspace = Uuid::new_v4();
        bed.directory.insert(note, workspace).await;

        let result = bed
            .engine
            .join(Uuid::new_v4(), request(note, workspace, "Mallory"))
            .await;
        assert!(matches!(result, Err(EngineError::AccessDenied)));
        assert_eq!(bed.engine.active_connection_count(note).await, 0);
    }

    #[tokio::test]
    async fn test_join_unknown_note_is_not_found() {
        let bed = testbed();
        let result = bed
            .engine
            .join(
                Uuid::new_v4(),
                request(Uuid::new_v4(), Uuid::new_v4(), "Alice"),
            )
            .await;
        assert!(matches!(result, Err(EngineError::NotFound)));
    }

    #[tokio::test]
    async fn test_join_bootstrap_reflects_prior_fragments() {
        let bed = testbed();
        let note = Uuid::new_v4();
        let workspace = Uuid::new_v4();
        bed.directory.insert(note, workspace).await;

        let conn_a = Uuid::new_v4();
        bed.engine
            .join(conn_a, request(note, workspace, "Alice"))
            .await
            .unwrap();

        // Alice writes before Bob arrives.
        let mut writer = TextDocument::new();
        for chunk in ["one ", "two ", "three"] {
            let fragment = writer.append_content(chunk);
            bed.engine
                .update_fragment(conn_a, note, &fragment)
                .await
                .unwrap();
        }

        let conn_b = Uuid::new_v4();
        let outcome = bed
            .engine
            .join(conn_b, request(note, workspace, "Bob"))
            .await
            .unwrap();

        let restored = TextDocument::from_snapshot(&outcome.bootstrap.snapshot).unwrap();
        assert_eq!(restored.projection().content, "one two three");
        assert_eq!(outcome.bootstrap.active_users.len(), 2);
        assert_eq!(bed.engine.active_connection_count(note).await, 2);
    }

    #[tokio::test]
    async fn test_rejoin_is_idempotent() {
        let bed = testbed();
        let note = Uuid::new_v4();
        let workspace = Uuid::new_v4();
        bed.directory.insert(note, workspace).await;

        let conn = Uuid::new_v4();
        let req = request(note, workspace, "Alice");
        bed.engine.join(conn, req.clone()).await.unwrap();
        let again = bed.engine.join(conn, req).await.unwrap();

        assert_eq!(again.bootstrap.note_id, note);
        // Still one member, no duplicate binding.
        assert_eq!(bed.engine.active_connection_count(note).await, 1);
    }

    #[tokio::test]
    async fn test_fragment_requires_bound_connection() {
        let bed = testbed();
        let result = bed
            .engine
            .update_fragment(Uuid::new_v4(), Uuid::new_v4(), &[1, 2, 3])
            .await;
        assert!(matches!(result, Err(EngineError::NotJoined)));
    }

    #[tokio::test]
    async fn test_concurrent_fragments_converge_and_broadcast() {
        let bed = testbed();
        let note = Uuid::new_v4();
        let workspace = Uuid::new_v4();
        bed.directory.insert(note, workspace).await;

        let conn_a = Uuid::new_v4();
        let conn_b = Uuid::new_v4();
        let mut out_a = bed
            .engine
            .join(conn_a, request(note, workspace, "Alice"))
            .await
            .unwrap();
        let out_b = bed
            .engine
            .join(conn_b, request(note, workspace, "Bob"))
            .await
            .unwrap();
        drop(out_b.receiver);

        // No shared causal history between the two writers.
        let mut doc_a = TextDocument::new();
        let mut doc_b = TextDocument::new();
        let f1 = doc_a.append_content("from-a ");
        let f2 = doc_b.append_content("from-b");

        bed.engine.update_fragment(conn_a, note, &f1).await.unwrap();
        bed.engine.update_fragment(conn_b, note, &f2).await.unwrap();

        let projection = bed.engine.note_snapshot(note).await.unwrap().unwrap();
        assert!(projection.content.contains("from-a"));
        assert!(projection.content.contains("from-b"));

        // Alice's receiver saw Bob's join and his fragment.
        let mut saw_b_fragment = false;
        while let Ok(bytes) = out_a.receiver.try_recv() {
            if let Ok(Event::UpdateFragment { connection_id, .. }) = Event::decode(&bytes) {
                if connection_id == conn_b {
                    saw_b_fragment = true;
                }
            }
        }
        assert!(saw_b_fragment);
    }

    #[tokio::test]
    async fn test_malformed_fragment_dropped_connection_stays_bound() {
        let bed = testbed();
        let note = Uuid::new_v4();
        let workspace = Uuid::new_v4();
        bed.directory.insert(note, workspace).await;

        let conn = Uuid::new_v4();
        bed.engine
            .join(conn, request(note, workspace, "Alice"))
            .await
            .unwrap();

        let result = bed.engine.update_fragment(conn, note, &[0xDE, 0xAD]).await;
        assert!(matches!(result, Err(EngineError::InvalidFragment(_))));

        // Still bound: a valid fragment goes through afterwards.
        let mut writer = TextDocument::new();
        let fragment = writer.append_content("recovered");
        bed.engine.update_fragment(conn, note, &fragment).await.unwrap();
    }

    #[tokio::test]
    async fn test_leave_evicts_and_flushes() {
        let bed = testbed();
        let note = Uuid::new_v4();
        let workspace = Uuid::new_v4();
        bed.directory.insert(note, workspace).await;

        let conn = Uuid::new_v4();
        bed.engine
            .join(conn, request(note, workspace, "Alice"))
            .await
            .unwrap();

        let mut writer = TextDocument::new();
        let fragment = writer.append_content("durable");
        bed.engine.update_fragment(conn, note, &fragment).await.unwrap();

        bed.engine.leave(conn, note).await.unwrap();
        assert_eq!(bed.engine.active_connection_count(note).await, 0);
        assert!(!bed.engine.bridge().has_flush_task(note).await);

        // Flushed before eviction: a fresh join reloads equivalent content.
        let conn2 = Uuid::new_v4();
        let outcome = bed
            .engine
            .join(conn2, request(note, workspace, "Bob"))
            .await
            .unwrap();
        let restored = TextDocument::from_snapshot(&outcome.bootstrap.snapshot).unwrap();
        assert_eq!(restored.projection().content, "durable");
    }

    #[tokio::test]
    async fn test_disconnect_cleans_up_like_leave() {
        let bed = testbed();
        let note = Uuid::new_v4();
        let workspace = Uuid::new_v4();
        bed.directory.insert(note, workspace).await;

        let conn = Uuid::new_v4();
        bed.engine
            .join(conn, request(note, workspace, "Alice"))
            .await
            .unwrap();
        bed.engine.disconnect(conn).await;

        assert_eq!(bed.engine.active_connection_count(note).await, 0);
        assert!(bed.engine.awareness.is_empty(note).await);
    }

    #[tokio::test]
    async fn test_authorization_timeout_is_denial() {
        let bed = testbed_with(
            EngineConfig {
                auth_timeout: Duration::from_millis(30),
                ..EngineConfig::default()
            },
            Arc::new(SlowValidator {
                delay: Duration::from_millis(500),
                answer: true,
            }),
        );
        let note = Uuid::new_v4();
        let workspace = Uuid::new_v4();
        bed.directory.insert(note, workspace).await;

        let result = bed
            .engine
            .join(Uuid::new_v4(), request(note, workspace, "Alice"))
            .await;
        assert!(matches!(result, Err(EngineError::AccessDenied)));
    }

    #[tokio::test]
    async fn test_disconnect_during_authorization_aborts_bind() {
        let bed = testbed_with(
            EngineConfig::default(),
            Arc::new(SlowValidator {
                delay: Duration::from_millis(120),
                answer: true,
            }),
        );
        let note = Uuid::new_v4();
        let workspace = Uuid::new_v4();
        bed.directory.insert(note, workspace).await;

        let conn = Uuid::new_v4();
        let engine = bed.engine.clone();
        let join = tokio::spawn({
            let engine = engine.clone();
            let req = request(note, workspace, "Alice");
            async move { engine.join(conn, req).await }
        });

        tokio::time::sleep(Duration::from_millis(30)).await;
        engine.disconnect(conn).await;

        let result = join.await.unwrap();
        assert!(matches!(result, Err(EngineError::ConnectionClosed)));
        assert_eq!(engine.active_connection_count(note).await, 0);
    }

    #[tokio::test]
    async fn test_opportunistic_versions_strictly_increasing() {
        let bed = testbed_with(
            EngineConfig {
                version_interval: Duration::ZERO,
                ..EngineConfig::default()
            },
            Arc::new(StaticAccessValidator::allow_all()),
        );
        let note = Uuid::new_v4();
        let workspace = Uuid::new_v4();
        bed.directory.insert(note, workspace).await;

        let conn = Uuid::new_v4();
        bed.engine
            .join(conn, request(note, workspace, "Alice"))
            .await
            .unwrap();

        let mut writer = TextDocument::new();
        for chunk in ["a", "b", "c"] {
            let fragment = writer.append_content(chunk);
            bed.engine.update_fragment(conn, note, &fragment).await.unwrap();
        }

        // First fragment starts the clock; the next two each cut a version.
        let versions = bed.engine.bridge().store().list_versions(note).unwrap();
        assert_eq!(versions.len(), 2);
        assert_eq!(versions[0].version_number, 1);
        assert_eq!(versions[1].version_number, 2);
        assert_eq!(versions[0].reason, "Auto-saved during collaboration");
    }

    #[tokio::test]
    async fn test_save_path_versions_and_audits() {
        let bed = testbed();
        let note = Uuid::new_v4();
        let workspace = Uuid::new_v4();
        bed.directory.insert(note, workspace).await;

        let conn = Uuid::new_v4();
        let req = request(note, workspace, "Alice");
        let user = req.user_id;
        bed.engine.join(conn, req).await.unwrap();

        let mut writer = TextDocument::new();
        let fragment = writer.set_title("Saved note");
        bed.engine.update_fragment(conn, note, &fragment).await.unwrap();

        let v1 = bed.engine.save(note, workspace, user, "token").await.unwrap();
        let v2 = bed.engine.save(note, workspace, user, "token").await.unwrap();
        assert_eq!(v1.version_number, 1);
        assert_eq!(v2.version_number, 2);
        assert_eq!(v1.title, "Saved note");
        assert_eq!(v1.reason, "Manual save");

        // Both records remain independently retrievable.
        let store = bed.engine.bridge().store();
        assert_eq!(store.load_version(note, 1).unwrap(), v1);
        assert_eq!(store.load_version(note, 2).unwrap(), v2);

        // Audit is fire-and-forget; give the spawned task a beat.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let events = bed.audit.recorded();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].action, "note_updated");
        assert_eq!(events[0].resource_id, note);
    }

    #[tokio::test]
    async fn test_save_denied_by_update_check() {
        let bed = testbed_with(
            EngineConfig::default(),
            Arc::new(StaticAccessValidator {
                allow_access: true,
                allow_update: false,
            }),
        );
        let note = Uuid::new_v4();
        let workspace = Uuid::new_v4();
        bed.directory.insert(note, workspace).await;

        let conn = Uuid::new_v4();
        let req = request(note, workspace, "Alice");
        let user = req.user_id;
        bed.engine.join(conn, req).await.unwrap();

        let result = bed.engine.save(note, workspace, user, "token").await;
        assert!(matches!(result, Err(EngineError::AccessDenied)));
        assert!(bed
            .engine
            .bridge()
            .store()
            .list_versions(note)
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_presence_flows_between_connections() {
        let bed = testbed();
        let note = Uuid::new_v4();
        let workspace = Uuid::new_v4();
        bed.directory.insert(note, workspace).await;

        let conn_a = Uuid::new_v4();
        let conn_b = Uuid::new_v4();
        let req_a = request(note, workspace, "Alice");
        let user_a = req_a.user_id;
        let mut out_a = bed.engine.join(conn_a, req_a).await.unwrap();
        bed.engine
            .join(conn_b, request(note, workspace, "Bob"))
            .await
            .unwrap();

        let update = crate::awareness::PresenceUpdate {
            clock: 1,
            state: Some(crate::awareness::PresenceState {
                user_id: user_a,
                name: "Alice".into(),
                cursor: Some(crate::awareness::CursorRange::caret(4)),
            }),
        };
        bed.engine
            .presence_fragment(conn_b, note, &update.encode().unwrap())
            .await
            .unwrap();

        let mut saw_presence = false;
        while let Ok(bytes) = out_a.receiver.try_recv() {
            if let Ok(Event::PresenceFragment { connection_id, .. }) = Event::decode(&bytes) {
                if connection_id == conn_b {
                    saw_presence = true;
                }
            }
        }
        assert!(saw_presence);

        // Late joiner sees Bob's presence in the bootstrap.
        let conn_c = Uuid::new_v4();
        let out_c = bed
            .engine
            .join(conn_c, request(note, workspace, "Carol"))
            .await
            .unwrap();
        assert_eq!(out_c.bootstrap.awareness.len(), 1);
        assert_eq!(out_c.bootstrap.awareness[0].0, conn_b);
    }

    #[tokio::test]
    async fn test_cross_instance_convergence_over_bus() {
        let dir = tempfile::tempdir().unwrap();
        let bus: Arc<dyn InstanceBus> = Arc::new(MemoryBus::new(64));

        // Two engine instances over separate stores, as in a scaled
        // deployment with one store per shard.
        let make = |subdir: &str, bus: Arc<dyn InstanceBus>| {
            let bridge = Arc::new(crate::persistence::test_bridge(&dir.path().join(subdir)));
            let directory = Arc::new(MemoryNoteDirectory::new());
            (
                CollabEngine::with_bus(
                    EngineConfig::default(),
                    bridge,
                    Arc::new(StaticAccessValidator::allow_all()),
                    directory.clone(),
                    Arc::new(MemoryAuditSink::new()),
                    bus,
                ),
                directory,
            )
        };
        let (engine_a, dir_a) = make("a", bus.clone());
        let (engine_b, dir_b) = make("b", bus);

        let note = Uuid::new_v4();
        let workspace = Uuid::new_v4();
        dir_a.insert(note, workspace).await;
        dir_b.insert(note, workspace).await;

        let conn_a = Uuid::new_v4();
        let conn_b = Uuid::new_v4();
        engine_a
            .join(conn_a, request(note, workspace, "Alice"))
            .await
            .unwrap();
        engine_b
            .join(conn_b, request(note, workspace, "Bob"))
            .await
            .unwrap();

        let mut doc_a = TextDocument::new();
        let mut doc_b = TextDocument::new();
        let f1 = doc_a.append_content("alpha ");
        let f2 = doc_b.append_content("beta");
        engine_a.update_fragment(conn_a, note, &f1).await.unwrap();
        engine_b.update_fragment(conn_b, note, &f2).await.unwrap();

        // Let the bus listeners drain.
        tokio::time::sleep(Duration::from_millis(100)).await;

        let pa = engine_a.note_snapshot(note).await.unwrap().unwrap();
        let pb = engine_b.note_snapshot(note).await.unwrap().unwrap();
        assert_eq!(pa, pb);
        assert!(pa.content.contains("alpha"));
        assert!(pa.content.contains("beta"));
    }
}
