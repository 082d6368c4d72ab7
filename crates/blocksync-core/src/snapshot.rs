//! Per-room workspace snapshots.
//!
//! The payload is opaque to the core: the last committed serialization
//! wins, there is no history, and writes over the configured cap are
//! rejected at the store.

#![allow(clippy::expect_used, reason = "in-memory store treats a poisoned lock as fatal")]

use std::{
    collections::HashMap,
    sync::Mutex,
    time::Instant,
};

use bytes::Bytes;

use crate::error::StoreError;

/// Per-room opaque blob with last-writer-wins semantics.
pub trait SnapshotStore: Send + Sync {
    /// Store the latest snapshot for a room.
    ///
    /// # Errors
    ///
    /// [`StoreError::PayloadTooLarge`] if `payload` exceeds the cap.
    fn put(&self, room: &str, payload: Bytes, now: Instant) -> Result<(), StoreError>;

    /// Latest snapshot, if any commit stored one.
    fn get(&self, room: &str) -> Result<Option<Bytes>, StoreError>;
}

#[derive(Debug, Clone)]
struct StoredSnapshot {
    payload: Bytes,
    #[allow(dead_code, reason = "kept for operator inspection and future expiry policies")]
    updated_at: Instant,
}

/// In-memory [`SnapshotStore`] with a configurable size cap.
#[derive(Debug)]
pub struct MemorySnapshotStore {
    max_bytes: usize,
    rooms: Mutex<HashMap<String, StoredSnapshot>>,
}

impl MemorySnapshotStore {
    /// Create a store rejecting payloads over `max_bytes`.
    pub fn new(max_bytes: usize) -> Self {
        Self { max_bytes, rooms: Mutex::new(HashMap::new()) }
    }
}

impl SnapshotStore for MemorySnapshotStore {
    fn put(&self, room: &str, payload: Bytes, now: Instant) -> Result<(), StoreError> {
        if payload.len() > self.max_bytes {
            return Err(StoreError::PayloadTooLarge { size: payload.len(), max: self.max_bytes });
        }
        let mut rooms = self.rooms.lock().expect("mutex poisoned");
        rooms.insert(room.to_owned(), StoredSnapshot { payload, updated_at: now });
        Ok(())
    }

    fn get(&self, room: &str) -> Result<Option<Bytes>, StoreError> {
        let rooms = self.rooms.lock().expect("mutex poisoned");
        Ok(rooms.get(room).map(|s| s.payload.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_then_get_round_trips_until_next_put() {
        let store = MemorySnapshotStore::new(1024);
        let now = Instant::now();

        assert_eq!(store.get("r").unwrap(), None);

        store.put("r", Bytes::from_static(b"<x/>"), now).unwrap();
        assert_eq!(store.get("r").unwrap(), Some(Bytes::from_static(b"<x/>")));

        store.put("r", Bytes::from_static(b"<y/>"), now).unwrap();
        assert_eq!(store.get("r").unwrap(), Some(Bytes::from_static(b"<y/>")));
    }

    #[test]
    fn oversize_write_is_rejected_and_previous_value_survives() {
        let store = MemorySnapshotStore::new(4);
        let now = Instant::now();

        store.put("r", Bytes::from_static(b"ok"), now).unwrap();

        let err = store.put("r", Bytes::from_static(b"too large"), now).unwrap_err();
        assert_eq!(err, StoreError::PayloadTooLarge { size: 9, max: 4 });
        assert_eq!(store.get("r").unwrap(), Some(Bytes::from_static(b"ok")));
    }
}
