//! Ephemeral per-connection presence for a note's room.
//!
//! Presence is last-writer-wins *per connection*: each connection stamps its
//! updates with a monotonically increasing clock, and an update whose clock
//! is not newer than the last one seen for that connection is discarded
//! whole — no per-field merging. Removal is itself a tombstoned update
//! (`state: None`) so peers converge on "user left" even when the leave and
//! a late cursor move race on the wire.
//!
//! The tracker never broadcasts. Every successful apply/clear yields the
//! canonical diff bytes for the caller to fan out.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Cursor/selection inside a note, as flat text offsets.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct CursorRange {
    pub anchor: u32,
    pub head: u32,
}

impl CursorRange {
    pub fn caret(offset: u32) -> Self {
        Self {
            anchor: offset,
            head: offset,
        }
    }

    /// True when nothing is selected.
    pub fn is_collapsed(&self) -> bool {
        self.anchor == self.head
    }
}

/// What one connection exposes to its peers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PresenceState {
    pub user_id: Uuid,
    pub name: String,
    pub cursor: Option<CursorRange>,
}

/// Wire form of a presence fragment.
///
/// `state: None` is the tombstone that removes the sender from the room's
/// presence set.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PresenceUpdate {
    pub clock: u64,
    pub state: Option<PresenceState>,
}

impl PresenceUpdate {
    pub fn encode(&self) -> Result<Vec<u8>, AwarenessError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| AwarenessError::Malformed(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, AwarenessError> {
        let (update, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| AwarenessError::Malformed(e.to_string()))?;
        Ok(update)
    }
}

/// Awareness errors.
#[derive(Debug, Clone)]
pub enum AwarenessError {
    /// Presence fragment did not decode; dropped without touching state.
    Malformed(String),
}

impl std::fmt::Display for AwarenessError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Malformed(e) => write!(f, "Malformed presence fragment: {e}"),
        }
    }
}

impl std::error::Error for AwarenessError {}

/// One connection's entry in a room's presence set.
///
/// The clock survives tombstoning so a stale pre-leave update cannot
/// resurrect a departed connection.
#[derive(Debug, Clone)]
struct PresenceEntry {
    clock: u64,
    state: Option<PresenceState>,
}

/// Tracks presence for every open note room.
///
/// Keyed by note id, then connection id. Buckets are created lazily on the
/// first applied fragment and dropped explicitly when the room is evicted.
pub struct AwarenessTracker {
    rooms: RwLock<HashMap<Uuid, HashMap<Uuid, PresenceEntry>>>,
}

impl AwarenessTracker {
    pub fn new() -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
        }
    }

    /// Merge a presence fragment for `connection_id`.
    ///
    /// Returns the canonical diff to broadcast, or `None` when the fragment
    /// lost the LWW race (stale clock) and nothing changed.
    pub async fn apply(
        &self,
        note_id: Uuid,
        connection_id: Uuid,
        fragment: &[u8],
    ) -> Result<Option<Vec<u8>>, AwarenessError> {
        let update = PresenceUpdate::decode(fragment)?;

        let mut rooms = self.rooms.write().await;
        let room = rooms.entry(note_id).or_default();

        if let Some(entry) = room.get(&connection_id) {
            if update.clock <= entry.clock {
                return Ok(None);
            }
        }

        let diff = update.encode()?;
        room.insert(
            connection_id,
            PresenceEntry {
                clock: update.clock,
                state: update.state,
            },
        );
        Ok(Some(diff))
    }

    /// Tombstone `connection_id`'s presence.
    ///
    /// Idempotent: clearing an absent or already-tombstoned connection yields
    /// nothing to broadcast.
    pub async fn clear(&self, note_id: Uuid, connection_id: Uuid) -> Option<Vec<u8>> {
        let mut rooms = self.rooms.write().await;
        let room = rooms.get_mut(&note_id)?;
        let entry = room.get_mut(&connection_id)?;
        if entry.state.is_none() {
            return None;
        }

        entry.clock += 1;
        entry.state = None;
        PresenceUpdate {
            clock: entry.clock,
            state: None,
        }
        .encode()
        .ok()
    }

    /// Live presence states for bootstrap of a new joiner.
    ///
    /// Tombstoned connections are omitted.
    pub async fn snapshot(&self, note_id: Uuid) -> Vec<(Uuid, PresenceState)> {
        let rooms = self.rooms.read().await;
        let Some(room) = rooms.get(&note_id) else {
            return Vec::new();
        };
        room.iter()
            .filter_map(|(conn, entry)| entry.state.clone().map(|s| (*conn, s)))
            .collect()
    }

    /// True when the note has no live presence.
    pub async fn is_empty(&self, note_id: Uuid) -> bool {
        let rooms = self.rooms.read().await;
        match rooms.get(&note_id) {
            Some(room) => room.values().all(|entry| entry.state.is_none()),
            None => true,
        }
    }

    /// Drop the whole bucket for an evicted room, tombstones included.
    pub async fn remove_room(&self, note_id: Uuid) {
        self.rooms.write().await.remove(&note_id);
    }
}

impl Default for AwarenessTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(name: &str, offset: u32) -> PresenceState {
        PresenceState {
            user_id: Uuid::new_v4(),
            name: name.into(),
            cursor: Some(CursorRange::caret(offset)),
        }
    }

    fn fragment(clock: u64, state: Option<PresenceState>) -> Vec<u8> {
        PresenceUpdate { clock, state }.encode().unwrap()
    }

    #[test]
    fn test_presence_update_roundtrip() {
        let update = PresenceUpdate {
            clock: 7,
            state: Some(state("Alice", 12)),
        };
        let decoded = PresenceUpdate::decode(&update.encode().unwrap()).unwrap();
        assert_eq!(update, decoded);
    }

    #[test]
    fn test_cursor_range() {
        assert!(CursorRange::caret(5).is_collapsed());
        assert!(!CursorRange { anchor: 1, head: 9 }.is_collapsed());
    }

    #[tokio::test]
    async fn test_apply_and_snapshot() {
        let tracker = AwarenessTracker::new();
        let note = Uuid::new_v4();
        let conn = Uuid::new_v4();

        let diff = tracker
            .apply(note, conn, &fragment(1, Some(state("Alice", 3))))
            .await
            .unwrap();
        assert!(diff.is_some());

        let snap = tracker.snapshot(note).await;
        assert_eq!(snap.len(), 1);
        assert_eq!(snap[0].0, conn);
        assert_eq!(snap[0].1.name, "Alice");
    }

    #[tokio::test]
    async fn test_lww_in_arrival_order() {
        let tracker = AwarenessTracker::new();
        let note = Uuid::new_v4();
        let conn = Uuid::new_v4();

        tracker
            .apply(note, conn, &fragment(1, Some(state("Alice", 1))))
            .await
            .unwrap();
        tracker
            .apply(note, conn, &fragment(2, Some(state("Alice", 2))))
            .await
            .unwrap();

        let snap = tracker.snapshot(note).await;
        assert_eq!(snap[0].1.cursor, Some(CursorRange::caret(2)));
    }

    #[tokio::test]
    async fn test_lww_out_of_order_keeps_newer() {
        let tracker = AwarenessTracker::new();
        let note = Uuid::new_v4();
        let conn = Uuid::new_v4();

        // c2 first, then the stale c1: final state must equal the c2 one.
        tracker
            .apply(note, conn, &fragment(2, Some(state("Alice", 2))))
            .await
            .unwrap();
        let stale = tracker
            .apply(note, conn, &fragment(1, Some(state("Alice", 1))))
            .await
            .unwrap();
        assert!(stale.is_none());

        let snap = tracker.snapshot(note).await;
        assert_eq!(snap[0].1.cursor, Some(CursorRange::caret(2)));
    }

    #[tokio::test]
    async fn test_equal_clock_discarded() {
        let tracker = AwarenessTracker::new();
        let note = Uuid::new_v4();
        let conn = Uuid::new_v4();

        tracker
            .apply(note, conn, &fragment(3, Some(state("Alice", 10))))
            .await
            .unwrap();
        let dup = tracker
            .apply(note, conn, &fragment(3, Some(state("Alice", 99))))
            .await
            .unwrap();
        assert!(dup.is_none());

        let snap = tracker.snapshot(note).await;
        assert_eq!(snap[0].1.cursor, Some(CursorRange::caret(10)));
    }

    #[tokio::test]
    async fn test_clear_is_tombstone_and_idempotent() {
        let tracker = AwarenessTracker::new();
        let note = Uuid::new_v4();
        let conn = Uuid::new_v4();

        tracker
            .apply(note, conn, &fragment(1, Some(state("Alice", 0))))
            .await
            .unwrap();

        let first = tracker.clear(note, conn).await;
        assert!(first.is_some());
        let tombstone = PresenceUpdate::decode(&first.unwrap()).unwrap();
        assert!(tombstone.state.is_none());
        assert!(tombstone.clock > 1);

        // Second clear has nothing left to remove.
        assert!(tracker.clear(note, conn).await.is_none());
        assert!(tracker.is_empty(note).await);
    }

    #[tokio::test]
    async fn test_stale_update_cannot_resurrect_tombstone() {
        let tracker = AwarenessTracker::new();
        let note = Uuid::new_v4();
        let conn = Uuid::new_v4();

        tracker
            .apply(note, conn, &fragment(5, Some(state("Alice", 0))))
            .await
            .unwrap();
        tracker.clear(note, conn).await;

        // A cursor move sent before the leave, arriving after it.
        let late = tracker
            .apply(note, conn, &fragment(4, Some(state("Alice", 7))))
            .await
            .unwrap();
        assert!(late.is_none());
        assert!(tracker.is_empty(note).await);
    }

    #[tokio::test]
    async fn test_malformed_fragment_rejected() {
        let tracker = AwarenessTracker::new();
        let note = Uuid::new_v4();
        let result = tracker.apply(note, Uuid::new_v4(), &[0xFF, 0x00, 0x01]).await;
        assert!(result.is_err());
        assert!(tracker.is_empty(note).await);
    }

    #[tokio::test]
    async fn test_remove_room_forgets_everything() {
        let tracker = AwarenessTracker::new();
        let note = Uuid::new_v4();
        let conn = Uuid::new_v4();

        tracker
            .apply(note, conn, &fragment(9, Some(state("Alice", 0))))
            .await
            .unwrap();
        tracker.remove_room(note).await;
        assert!(tracker.snapshot(note).await.is_empty());

        // Fresh room: old clocks no longer apply.
        let applied = tracker
            .apply(note, conn, &fragment(1, Some(state("Alice", 1))))
            .await
            .unwrap();
        assert!(applied.is_some());
    }
}
