//! WebSocket client for the sync server.
//!
//! Provides:
//! - Connection lifecycle (connect, disconnect)
//! - Join handshake and fragment/presence send
//! - An event stream surfacing room traffic to the application
//! - An offline queue: fragments produced while disconnected are replayed
//!   after the next successful join
//!
//! Used by integration tests and embedding applications; the browser client
//! speaks the same wire protocol.

use futures_util::{SinkExt, StreamExt};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, RwLock};
use uuid::Uuid;

use crate::awareness::PresenceUpdate;
use crate::protocol::{ActiveUser, Command, Event, JoinBootstrap, ProtocolError};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events emitted by the client.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// Connection established
    Connected,
    /// Connection lost
    Disconnected,
    /// Join accepted; carries the room bootstrap
    Joined(JoinBootstrap),
    /// A denied or failed operation
    ErrorMessage(String),
    /// A peer's document fragment
    RemoteFragment {
        connection_id: Uuid,
        payload: Vec<u8>,
    },
    /// A peer's presence diff
    RemotePresence {
        connection_id: Uuid,
        payload: Vec<u8>,
    },
    /// A peer entered the room
    PeerJoined(ActiveUser),
    /// A peer left the room
    PeerLeft { connection_id: Uuid, user_id: Uuid },
}

/// Offline queue for fragments produced while disconnected.
///
/// Queued fragments are replayed, in order, once a join is accepted.
pub struct OfflineQueue {
    queue: VecDeque<QueuedFragment>,
    max_size: usize,
}

#[derive(Debug, Clone)]
struct QueuedFragment {
    note_id: Uuid,
    payload: Vec<u8>,
}

impl OfflineQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(max_size.min(1024)),
            max_size,
        }
    }

    /// Queue a fragment for later replay. Returns false when full.
    pub fn enqueue(&mut self, note_id: Uuid, payload: Vec<u8>) -> bool {
        if self.queue.len() >= self.max_size {
            return false;
        }
        self.queue.push_back(QueuedFragment { note_id, payload });
        true
    }

    /// Drain everything queued for one note, in order.
    pub fn drain_for(&mut self, note_id: Uuid) -> Vec<Vec<u8>> {
        let mut drained = Vec::new();
        self.queue.retain(|entry| {
            if entry.note_id == note_id {
                drained.push(entry.payload.clone());
                false
            } else {
                true
            }
        });
        drained
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }

    /// Total bytes queued.
    pub fn total_bytes(&self) -> usize {
        self.queue.iter().map(|entry| entry.payload.len()).sum()
    }
}

/// The sync client.
pub struct CollabClient {
    user_id: Uuid,
    user_name: String,
    credential: String,
    server_url: String,
    state: Arc<RwLock<ConnectionState>>,
    offline_queue: Arc<Mutex<OfflineQueue>>,
    outgoing_tx: Option<mpsc::Sender<Vec<u8>>>,
    event_rx: Option<mpsc::Receiver<ClientEvent>>,
    event_tx: mpsc::Sender<ClientEvent>,
}

impl CollabClient {
    pub fn new(
        user_id: Uuid,
        user_name: impl Into<String>,
        credential: impl Into<String>,
        server_url: impl Into<String>,
    ) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        Self {
            user_id,
            user_name: user_name.into(),
            credential: credential.into(),
            server_url: server_url.into(),
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            offline_queue: Arc::new(Mutex::new(OfflineQueue::new(10_000))),
            outgoing_tx: None,
            event_rx: Some(event_rx),
            event_tx,
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<ClientEvent>> {
        self.event_rx.take()
    }

    /// Connect to the server and spawn the reader/writer tasks.
    pub async fn connect(&mut self) -> Result<(), ProtocolError> {
        *self.state.write().await = ConnectionState::Connecting;

        let (ws_stream, _) = tokio_tungstenite::connect_async(&self.server_url)
            .await
            .map_err(|_| {
                // Leave the caller free to retry.
                ProtocolError::ConnectionClosed
            })?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        // Writer task: forward the outgoing channel to the socket.
        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(256);
        self.outgoing_tx = Some(out_tx.clone());
        tokio::spawn(async move {
            while let Some(data) = out_rx.recv().await {
                if ws_writer
                    .send(tokio_tungstenite::tungstenite::Message::Binary(data.into()))
                    .await
                    .is_err()
                {
                    break;
                }
            }
        });

        *self.state.write().await = ConnectionState::Connected;
        let _ = self.event_tx.send(ClientEvent::Connected).await;

        // Reader task: decode events, replay the offline queue on join.
        let event_tx = self.event_tx.clone();
        let state = self.state.clone();
        let offline_queue = self.offline_queue.clone();
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(tokio_tungstenite::tungstenite::Message::Binary(data)) => {
                        let bytes: Vec<u8> = data.into();
                        let Ok(event) = Event::decode(&bytes) else {
                            log::warn!("Undecodable event from server");
                            continue;
                        };

                        let client_event = match event {
                            Event::JoinAccepted(bootstrap) => {
                                // Replay edits made while offline; the merge
                                // absorbs them wherever the room is now.
                                let queued = {
                                    let mut queue = offline_queue.lock().await;
                                    queue.drain_for(bootstrap.note_id)
                                };
                                if !queued.is_empty() {
                                    log::info!(
                                        "Replaying {} queued fragments for note {}",
                                        queued.len(),
                                        bootstrap.note_id
                                    );
                                }
                                for payload in queued {
                                    let command = Command::UpdateFragment {
                                        note_id: bootstrap.note_id,
                                        payload,
                                    };
                                    if let Ok(encoded) = command.encode() {
                                        let _ = out_tx.send(encoded).await;
                                    }
                                }
                                Some(ClientEvent::Joined(bootstrap))
                            }
                            Event::Error { message } => Some(ClientEvent::ErrorMessage(message)),
                            Event::UpdateFragment {
                                connection_id,
                                payload,
                                ..
                            } => Some(ClientEvent::RemoteFragment {
                                connection_id,
                                payload,
                            }),
                            Event::PresenceFragment {
                                connection_id,
                                payload,
                                ..
                            } => Some(ClientEvent::RemotePresence {
                                connection_id,
                                payload,
                            }),
                            Event::UserJoined { user, .. } => Some(ClientEvent::PeerJoined(user)),
                            Event::UserLeft {
                                connection_id,
                                user_id,
                                ..
                            } => Some(ClientEvent::PeerLeft {
                                connection_id,
                                user_id,
                            }),
                        };
                        if let Some(evt) = client_event {
                            let _ = event_tx.send(evt).await;
                        }
                    }
                    Ok(tokio_tungstenite::tungstenite::Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }

            *state.write().await = ConnectionState::Disconnected;
            let _ = event_tx.send(ClientEvent::Disconnected).await;
        });

        Ok(())
    }

    /// Request to join a note's room.
    pub async fn join(&self, note_id: Uuid, workspace_id: Uuid) -> Result<(), ProtocolError> {
        let command = Command::Join {
            note_id,
            workspace_id,
            user_id: self.user_id,
            user_name: self.user_name.clone(),
            credential: self.credential.clone(),
        };
        self.send_command(&command).await
    }

    /// Leave a note's room.
    pub async fn leave(&self, note_id: Uuid) -> Result<(), ProtocolError> {
        self.send_command(&Command::Leave { note_id }).await
    }

    /// Send a document fragment; queues it for replay when disconnected.
    pub async fn send_fragment(&self, note_id: Uuid, payload: Vec<u8>) -> Result<(), ProtocolError> {
        if *self.state.read().await != ConnectionState::Connected {
            let mut queue = self.offline_queue.lock().await;
            if !queue.enqueue(note_id, payload) {
                return Err(ProtocolError::ConnectionClosed);
            }
            return Ok(());
        }
        self.send_command(&Command::UpdateFragment { note_id, payload })
            .await
    }

    /// Send a presence update. Silently dropped when offline — stale cursors
    /// are worthless on reconnect.
    pub async fn send_presence(
        &self,
        note_id: Uuid,
        update: &PresenceUpdate,
    ) -> Result<(), ProtocolError> {
        if *self.state.read().await != ConnectionState::Connected {
            return Ok(());
        }
        let payload = update
            .encode()
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))?;
        self.send_command(&Command::PresenceFragment { note_id, payload })
            .await
    }

    async fn send_command(&self, command: &Command) -> Result<(), ProtocolError> {
        let encoded = command.encode()?;
        match &self.outgoing_tx {
            Some(tx) => tx
                .send(encoded)
                .await
                .map_err(|_| ProtocolError::ConnectionClosed),
            None => Err(ProtocolError::ConnectionClosed),
        }
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub fn user_id(&self) -> Uuid {
        self.user_id
    }

    pub fn user_name(&self) -> &str {
        &self.user_name
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    pub async fn offline_queue_len(&self) -> usize {
        self.offline_queue.lock().await.len()
    }
}
