//! Fan-out of update/presence events to every connection in a note's room.
//!
//! Uses tokio broadcast channels for O(1) send to all subscribers. Events
//! are encoded once and shared as `Arc<Vec<u8>>`; sender exclusion happens at
//! the receiver by comparing the event's origin connection, so the channel
//! itself stays a plain ordered pipe. Fragments published by one connection
//! are delivered to all peers in publish order — no cross-connection total
//! order is promised, the merge does not need one.
//!
//! [`BroadcastFabric`] adds the cross-process leg: when an [`InstanceBus`] is
//! attached, every room-published event is also framed and republished to
//! sibling engine instances.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::protocol::{Event, ProtocolError};

/// A broadcast group for a single note room.
///
/// All connections bound to the note share one channel; each gets an
/// independent receiver buffering up to `capacity` messages before a lagging
/// receiver starts dropping (backpressure).
pub struct BroadcastGroup {
    sender: broadcast::Sender<Arc<Vec<u8>>>,
    capacity: usize,
    messages_sent: AtomicU64,
}

impl BroadcastGroup {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            capacity,
            messages_sent: AtomicU64::new(0),
        }
    }

    /// Subscribe a connection to this room's events.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Vec<u8>>> {
        self.sender.subscribe()
    }

    /// Publish pre-encoded bytes to every subscriber.
    ///
    /// Returns the number of receivers. Lock-free on the hot path.
    pub fn publish(&self, encoded: Arc<Vec<u8>>) -> usize {
        let count = self.sender.send(encoded).unwrap_or(0);
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    /// Connections currently subscribed.
    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn messages_sent(&self) -> u64 {
        self.messages_sent.load(Ordering::Relaxed)
    }
}

/// Room manager: maps note ids to broadcast groups.
pub struct RoomManager {
    rooms: RwLock<HashMap<Uuid, Arc<BroadcastGroup>>>,
    default_capacity: usize,
}

impl RoomManager {
    pub fn new(default_capacity: usize) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            default_capacity,
        }
    }

    /// Get or create the group for a note.
    pub async fn get_or_create(&self, note_id: Uuid) -> Arc<BroadcastGroup> {
        // Fast path: read lock.
        {
            let rooms = self.rooms.read().await;
            if let Some(room) = rooms.get(&note_id) {
                return room.clone();
            }
        }

        let mut rooms = self.rooms.write().await;
        // Double-check after acquiring the write lock.
        if let Some(room) = rooms.get(&note_id) {
            return room.clone();
        }
        let room = Arc::new(BroadcastGroup::new(self.default_capacity));
        rooms.insert(note_id, room.clone());
        room
    }

    pub async fn get(&self, note_id: Uuid) -> Option<Arc<BroadcastGroup>> {
        self.rooms.read().await.get(&note_id).cloned()
    }

    /// Drop the group for an evicted room.
    pub async fn remove(&self, note_id: Uuid) {
        self.rooms.write().await.remove(&note_id);
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }
}

/// A frame republished across service instances.
#[derive(Debug, Clone)]
pub struct BusFrame {
    /// Engine instance that originated the frame; receivers drop their own.
    pub origin_instance: Uuid,
    /// The encoded [`Event`], byte-identical to the local fan-out payload.
    pub payload: Arc<Vec<u8>>,
}

/// Shared pub/sub bus connecting horizontally scaled engine instances.
///
/// The engine only requires publish/subscribe semantics; anything from an
/// in-process channel to an external broker satisfies it. Divergence between
/// instances is reconciled by the merge contract, not by the bus.
pub trait InstanceBus: Send + Sync {
    fn publish(&self, frame: BusFrame);
    fn subscribe(&self) -> broadcast::Receiver<BusFrame>;
}

/// In-memory bus: wires multiple engine instances within one process.
pub struct MemoryBus {
    sender: broadcast::Sender<BusFrame>,
}

impl MemoryBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }
}

impl InstanceBus for MemoryBus {
    fn publish(&self, frame: BusFrame) {
        let _ = self.sender.send(frame);
    }

    fn subscribe(&self) -> broadcast::Receiver<BusFrame> {
        self.sender.subscribe()
    }
}

/// The broadcast fabric for one engine instance: local room fan-out plus the
/// optional cross-instance bus leg.
pub struct BroadcastFabric {
    rooms: RoomManager,
    bus: Option<Arc<dyn InstanceBus>>,
    instance_id: Uuid,
}

impl BroadcastFabric {
    pub fn new(default_capacity: usize) -> Self {
        Self {
            rooms: RoomManager::new(default_capacity),
            bus: None,
            instance_id: Uuid::new_v4(),
        }
    }

    pub fn with_bus(default_capacity: usize, bus: Arc<dyn InstanceBus>) -> Self {
        Self {
            rooms: RoomManager::new(default_capacity),
            bus: Some(bus),
            instance_id: Uuid::new_v4(),
        }
    }

    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    /// Subscribe a connection to a note's room, creating the room as needed.
    pub async fn subscribe(&self, note_id: Uuid) -> broadcast::Receiver<Arc<Vec<u8>>> {
        self.rooms.get_or_create(note_id).await.subscribe()
    }

    /// Deliver an event to every connection bound to the note's room, across
    /// instances when a bus is attached.
    ///
    /// Sender exclusion rides on [`Event::origin`]: receivers drop events
    /// originating from their own connection.
    pub async fn publish(&self, note_id: Uuid, event: &Event) -> Result<usize, ProtocolError> {
        let encoded = Arc::new(event.encode()?);
        let delivered = self.publish_local(note_id, encoded.clone()).await;
        if let Some(bus) = &self.bus {
            bus.publish(BusFrame {
                origin_instance: self.instance_id,
                payload: encoded,
            });
        }
        Ok(delivered)
    }

    /// Local-only fan-out of pre-encoded bytes. Used when relaying frames
    /// that arrived from the bus, so they are never republished into a loop.
    pub async fn publish_local(&self, note_id: Uuid, encoded: Arc<Vec<u8>>) -> usize {
        match self.rooms.get(note_id).await {
            Some(group) => group.publish(encoded),
            None => 0,
        }
    }

    /// A receiver of frames published by sibling instances, if a bus is
    /// attached.
    pub fn bus_receiver(&self) -> Option<broadcast::Receiver<BusFrame>> {
        self.bus.as_ref().map(|bus| bus.subscribe())
    }

    /// Drop the room's group when the last connection leaves.
    pub async fn drop_room(&self, note_id: Uuid) {
        self.rooms.remove(note_id).await;
    }

    /// Number of rooms with a live fan-out group.
    pub async fn room_count(&self) -> usize {
        self.rooms.room_count().await
    }
}
