//! Per-room participant tracking.
//!
//! Presence is the source of truth for who is in a room and when they were
//! last heard from. The reaper derives evictions from `stale_since`; the
//! session layer touches the entry on every accepted frame.

#![allow(clippy::expect_used, reason = "in-memory store treats a poisoned lock as fatal")]

use std::{
    collections::HashMap,
    sync::Mutex,
    time::Instant,
};

use uuid::Uuid;

use crate::error::StoreError;

/// One connected participant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Participant {
    /// Per-connection identity.
    pub client_id: Uuid,
    /// Display name, already normalized by the session layer.
    pub nickname: String,
    /// Palette color assigned at admission.
    pub color: String,
    /// Last moment a frame arrived from this participant.
    pub last_seen: Instant,
}

/// Per-room participant set with last-seen timestamps.
pub trait PresenceStore: Send + Sync {
    /// Record a participant. Replaces any entry with the same client id.
    fn add(&self, room: &str, participant: Participant) -> Result<(), StoreError>;

    /// Remove a participant, returning the entry if one existed. This is
    /// the linearization point for session teardown: exactly one caller
    /// observes `Some`.
    fn remove(&self, room: &str, client_id: Uuid) -> Result<Option<Participant>, StoreError>;

    /// Refresh a participant's last-seen timestamp.
    fn touch(&self, room: &str, client_id: Uuid, now: Instant) -> Result<(), StoreError>;

    /// Current participants, ordered by client id for deterministic output.
    fn list(&self, room: &str) -> Result<Vec<Participant>, StoreError>;

    /// Participants whose last-seen is strictly before `threshold`.
    fn stale_since(&self, room: &str, threshold: Instant) -> Result<Vec<Uuid>, StoreError>;
}

/// In-memory [`PresenceStore`].
#[derive(Debug, Default)]
pub struct MemoryPresenceStore {
    rooms: Mutex<HashMap<String, HashMap<Uuid, Participant>>>,
}

impl MemoryPresenceStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl PresenceStore for MemoryPresenceStore {
    fn add(&self, room: &str, participant: Participant) -> Result<(), StoreError> {
        let mut rooms = self.rooms.lock().expect("mutex poisoned");
        rooms.entry(room.to_owned()).or_default().insert(participant.client_id, participant);
        Ok(())
    }

    fn remove(&self, room: &str, client_id: Uuid) -> Result<Option<Participant>, StoreError> {
        let mut rooms = self.rooms.lock().expect("mutex poisoned");
        let Some(members) = rooms.get_mut(room) else {
            return Ok(None);
        };
        let removed = members.remove(&client_id);
        if members.is_empty() {
            rooms.remove(room);
        }
        Ok(removed)
    }

    fn touch(&self, room: &str, client_id: Uuid, now: Instant) -> Result<(), StoreError> {
        let mut rooms = self.rooms.lock().expect("mutex poisoned");
        if let Some(participant) = rooms.get_mut(room).and_then(|m| m.get_mut(&client_id)) {
            participant.last_seen = now;
        }
        Ok(())
    }

    fn list(&self, room: &str) -> Result<Vec<Participant>, StoreError> {
        let rooms = self.rooms.lock().expect("mutex poisoned");
        let mut members: Vec<Participant> =
            rooms.get(room).map(|m| m.values().cloned().collect()).unwrap_or_default();
        members.sort_by_key(|p| p.client_id);
        Ok(members)
    }

    fn stale_since(&self, room: &str, threshold: Instant) -> Result<Vec<Uuid>, StoreError> {
        let rooms = self.rooms.lock().expect("mutex poisoned");
        let mut stale: Vec<Uuid> = rooms
            .get(room)
            .map(|members| {
                members
                    .values()
                    .filter(|p| p.last_seen < threshold)
                    .map(|p| p.client_id)
                    .collect()
            })
            .unwrap_or_default();
        stale.sort_unstable();
        Ok(stale)
    }
}
