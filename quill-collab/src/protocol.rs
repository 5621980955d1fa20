//! Binary wire protocol between connections and the sync engine.
//!
//! All traffic is bincode-encoded. A connection sends exactly one inbound
//! message type, [`Command`], and receives exactly one outbound type,
//! [`Event`] — every operation is routed through a single dispatcher instead
//! of per-event handler registration, so handler ordering can never matter.
//!
//! ```text
//! Client ──── Command::{Join, Leave, UpdateFragment, PresenceFragment} ───► Engine
//! Client ◄─── Event::{JoinAccepted, UpdateFragment, PresenceFragment,
//!                     UserJoined, UserLeft, Error} ──────────────────────── Engine
//! ```
//!
//! Fragment payloads stay opaque at this layer: an update fragment is
//! whatever the mergeable document accepts, a presence fragment is an encoded
//! [`PresenceUpdate`](crate::awareness::PresenceUpdate).

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::awareness::PresenceState;

/// Inbound message from a connection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum Command {
    /// Request to enter a note's room.
    Join {
        note_id: Uuid,
        workspace_id: Uuid,
        user_id: Uuid,
        user_name: String,
        /// Opaque credential forwarded to the authorization service.
        credential: String,
    },
    /// Leave a note's room.
    Leave { note_id: Uuid },
    /// Mergeable document delta. Fire-and-forget: no direct response.
    UpdateFragment { note_id: Uuid, payload: Vec<u8> },
    /// Presence delta. Fire-and-forget: no direct response.
    PresenceFragment { note_id: Uuid, payload: Vec<u8> },
}

impl Command {
    /// Serialize to the binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Deserialize from the binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (cmd, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(cmd)
    }

    /// The note this command targets.
    pub fn note_id(&self) -> Uuid {
        match self {
            Command::Join { note_id, .. }
            | Command::Leave { note_id }
            | Command::UpdateFragment { note_id, .. }
            | Command::PresenceFragment { note_id, .. } => *note_id,
        }
    }
}

/// A user currently bound to a note's room.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActiveUser {
    pub connection_id: Uuid,
    pub user_id: Uuid,
    pub name: String,
}

/// Everything a new joiner needs to catch up with the room.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JoinBootstrap {
    pub note_id: Uuid,
    /// Full document snapshot reflecting every merge applied so far.
    pub snapshot: Vec<u8>,
    /// Current active-connection set, resolved to users.
    pub active_users: Vec<ActiveUser>,
    /// Current presence states keyed by connection.
    pub awareness: Vec<(Uuid, PresenceState)>,
}

/// Outbound message to a connection.
///
/// `UpdateFragment`/`PresenceFragment`/`UserJoined`/`UserLeft` are broadcast
/// through a room's fan-out group; the others are sent directly to one
/// connection. Broadcast events carry their origin connection so receivers
/// can skip their own echoes — exclusion happens at the receiver, not in the
/// fan-out channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum Event {
    /// Direct reply to a successful `Join`.
    JoinAccepted(JoinBootstrap),
    /// A peer's document fragment, already merged server-side.
    UpdateFragment {
        note_id: Uuid,
        connection_id: Uuid,
        payload: Vec<u8>,
    },
    /// A peer's presence diff, already merged server-side.
    PresenceFragment {
        note_id: Uuid,
        connection_id: Uuid,
        payload: Vec<u8>,
    },
    /// A peer entered the room.
    UserJoined { note_id: Uuid, user: ActiveUser },
    /// A peer left the room.
    UserLeft {
        note_id: Uuid,
        connection_id: Uuid,
        user_id: Uuid,
    },
    /// A denied or failed operation. Never terminates the connection.
    Error { message: String },
}

impl Event {
    /// Serialize to the binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Deserialize from the binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (event, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(event)
    }

    /// The connection a broadcast event originated from, if any.
    ///
    /// Receivers drop events whose origin matches their own connection id.
    pub fn origin(&self) -> Option<Uuid> {
        match self {
            Event::UpdateFragment { connection_id, .. }
            | Event::PresenceFragment { connection_id, .. }
            | Event::UserLeft { connection_id, .. } => Some(*connection_id),
            Event::UserJoined { user, .. } => Some(user.connection_id),
            Event::JoinAccepted(_) | Event::Error { .. } => None,
        }
    }
}

/// Protocol errors.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
    ConnectionClosed,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            Self::ConnectionClosed => write!(f, "Connection closed"),
        }
    }
}

impl std::error::Error for ProtocolError {}
