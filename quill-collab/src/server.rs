//! WebSocket front end for the sync engine.
//!
//! One accept loop, one task per connection. Each connection task runs a
//! select loop bridging three flows:
//!
//! ```text
//! socket ── Command ──► engine.handle_command()
//! room receiver ── encoded Event ──► socket   (own echoes filtered out)
//! engine errors ── Event::Error ──► socket    (connection stays open)
//! ```
//!
//! All engine mutations for a note happen inside engine handlers; the
//! connection task suspends only at socket and broadcast-channel boundaries,
//! so per-connection command order is preserved end-to-end.

use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::engine::{CollabEngine, Dispatch, EngineError};
use crate::protocol::{Command, Event};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
        }
    }
}

/// The WebSocket sync server.
pub struct CollabServer {
    config: ServerConfig,
    engine: Arc<CollabEngine>,
}

impl CollabServer {
    pub fn new(config: ServerConfig, engine: Arc<CollabEngine>) -> Self {
        Self { config, engine }
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn engine(&self) -> &Arc<CollabEngine> {
        &self.engine
    }

    /// Run the accept loop. Call from an async runtime.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Sync server listening on {}", self.config.bind_addr);

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");
            let engine = self.engine.clone();
            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, engine).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        engine: Arc<CollabEngine>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        let connection_id = Uuid::new_v4();
        log::info!("WebSocket connection {connection_id} established from {addr}");

        // Receiver for the room the connection is currently bound to.
        let mut room_rx: Option<broadcast::Receiver<Arc<Vec<u8>>>> = None;

        loop {
            tokio::select! {
                // Inbound command from the socket.
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            let bytes: Vec<u8> = data.into();
                            let command = match Command::decode(&bytes) {
                                Ok(command) => command,
                                Err(e) => {
                                    log::warn!("Undecodable command from {addr}: {e}");
                                    continue;
                                }
                            };
                            let leaving = matches!(command, Command::Leave { .. });

                            match engine.handle_command(connection_id, command).await {
                                Ok(Dispatch::Joined(outcome)) => {
                                    room_rx = Some(outcome.receiver);
                                    let reply = Event::JoinAccepted(outcome.bootstrap);
                                    ws_sender
                                        .send(Message::Binary(reply.encode()?.into()))
                                        .await?;
                                }
                                Ok(Dispatch::None) => {
                                    if leaving {
                                        room_rx = None;
                                    }
                                }
                                Err(EngineError::InvalidFragment(_)) => {
                                    // Dropped from the merge's perspective;
                                    // already logged for diagnostics.
                                }
                                Err(e) => {
                                    let reply = Event::Error {
                                        message: e.user_message().to_string(),
                                    };
                                    ws_sender
                                        .send(Message::Binary(reply.encode()?.into()))
                                        .await?;
                                }
                            }
                        }

                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                        }

                        Some(Ok(Message::Close(_))) | None => {
                            break;
                        }

                        Some(Err(e)) => {
                            log::error!("WebSocket error from {addr}: {e}");
                            break;
                        }

                        _ => {}
                    }
                }

                // Outbound room traffic.
                msg = async {
                    match room_rx.as_mut() {
                        Some(rx) => rx.recv().await,
                        // Not bound to a room — wait forever.
                        None => std::future::pending().await,
                    }
                } => {
                    match msg {
                        Ok(data) => {
                            // Don't echo the connection's own events back.
                            if let Ok(event) = Event::decode(&data) {
                                if event.origin() == Some(connection_id) {
                                    continue;
                                }
                            }
                            ws_sender
                                .send(Message::Binary(data.to_vec().into()))
                                .await?;
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            log::warn!("Connection {connection_id} lagged by {n} messages");
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            // Room evicted while we were still subscribed.
                            room_rx = None;
                        }
                    }
                }
            }
        }

        engine.disconnect(connection_id).await;
        log::info!("Connection {connection_id} from {addr} closed");
        Ok(())
    }
}
