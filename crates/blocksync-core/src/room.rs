//! Room contexts and the process-wide registry.
//!
//! A [`RoomCtx`] bundles one room's driver (behind the room's single
//! mutex) with its broadcast hub and executes driver effects. The
//! [`RoomRegistry`] constructs contexts lazily and idempotently: concurrent
//! callers for the same id observe the same instance. Room metadata comes
//! from an external record store; if that store is unreachable the caller
//! fails the session's Opening with close code 1011.

#![allow(clippy::expect_used, reason = "registry treats a poisoned room map as fatal")]

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, RwLock},
    time::SystemTime,
};

use crate::{
    config::CoreConfig,
    driver::{RoomDriver, RoomEffect},
    error::StoreError,
    hub::RoomHub,
    lease::{LeaseStore, MemoryLeaseStore},
    presence::{MemoryPresenceStore, PresenceStore},
    snapshot::{MemorySnapshotStore, SnapshotStore},
};

/// Persistent room metadata.
#[derive(Debug, Clone)]
pub struct RoomRecord {
    /// Opaque room identifier.
    pub id: String,
    /// Optional display title.
    pub title: Option<String>,
    /// Participant limit enforced at admission.
    pub max_users: u32,
    /// Creation time of the record.
    pub created_at: SystemTime,
}

/// External keyed record store for room definitions.
///
/// Only invoked at session Opening; everything else the core needs lives in
/// its own stores.
pub trait RoomRecordStore: Send + Sync {
    /// Fetch the room record, creating it on first access.
    fn get_or_create(&self, id: &str) -> Result<RoomRecord, StoreError>;
}

/// In-memory [`RoomRecordStore`].
#[derive(Debug)]
pub struct MemoryRoomRecordStore {
    default_max_users: u32,
    records: Mutex<HashMap<String, RoomRecord>>,
}

impl MemoryRoomRecordStore {
    /// Create a store assigning `default_max_users` to new rooms.
    pub fn new(default_max_users: u32) -> Self {
        Self { default_max_users, records: Mutex::new(HashMap::new()) }
    }
}

impl RoomRecordStore for MemoryRoomRecordStore {
    fn get_or_create(&self, id: &str) -> Result<RoomRecord, StoreError> {
        let mut records = self.records.lock().expect("mutex poisoned");
        let record = records.entry(id.to_owned()).or_insert_with(|| RoomRecord {
            id: id.to_owned(),
            title: None,
            max_users: self.default_max_users,
            created_at: SystemTime::now(),
        });
        Ok(record.clone())
    }
}

/// One live room: driver, hub and metadata.
pub struct RoomCtx {
    record: RoomRecord,
    driver: tokio::sync::Mutex<RoomDriver>,
    hub: RoomHub,
}

impl RoomCtx {
    /// Metadata this room was created with.
    pub fn record(&self) -> &RoomRecord {
        &self.record
    }

    /// The room's broadcast hub.
    pub fn hub(&self) -> &RoomHub {
        &self.hub
    }

    /// Lock the room's driver. Every admission, frame and teardown for the
    /// room runs under this lock; it is the serialization point the hub's
    /// ordering contract relies on.
    pub async fn driver(&self) -> tokio::sync::MutexGuard<'_, RoomDriver> {
        self.driver.lock().await
    }

    /// Execute driver effects against the hub.
    ///
    /// Call while still holding the driver lock so hub acceptance order
    /// matches driver processing order. Only non-blocking queue operations
    /// happen here.
    pub fn apply(&self, effects: &[RoomEffect]) {
        for effect in effects {
            match effect {
                RoomEffect::Send { to, frame } => match frame.encode() {
                    Ok(text) => self.hub.send_to(*to, &Arc::from(text)),
                    Err(err) => {
                        tracing::error!(room = %self.record.id, %err, "frame encoding failed");
                    },
                },
                RoomEffect::Broadcast { frame, exclude } => match frame.encode() {
                    Ok(text) => self.hub.broadcast(&Arc::from(text), *exclude),
                    Err(err) => {
                        tracing::error!(room = %self.record.id, %err, "frame encoding failed");
                    },
                },
                RoomEffect::Detach { client_id } => {
                    self.hub.detach(*client_id);
                },
            }
        }
    }
}

impl std::fmt::Debug for RoomCtx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoomCtx")
            .field("room_id", &self.record.id)
            .field("subscribers", &self.hub.len())
            .finish()
    }
}

/// Maps room id to its lazily constructed [`RoomCtx`].
pub struct RoomRegistry {
    config: CoreConfig,
    records: Arc<dyn RoomRecordStore>,
    leases: Arc<dyn LeaseStore>,
    presence: Arc<dyn PresenceStore>,
    snapshots: Arc<dyn SnapshotStore>,
    rooms: RwLock<HashMap<String, Arc<RoomCtx>>>,
}

impl RoomRegistry {
    /// Registry over in-memory stores.
    pub fn new(config: CoreConfig) -> Self {
        let records = Arc::new(MemoryRoomRecordStore::new(config.max_users_default));
        let snapshots = Arc::new(MemorySnapshotStore::new(config.snapshot_max_bytes));
        Self::with_stores(
            config,
            records,
            Arc::new(MemoryLeaseStore::new()),
            Arc::new(MemoryPresenceStore::new()),
            snapshots,
        )
    }

    /// Registry over caller-provided stores (tests, external backends).
    pub fn with_stores(
        config: CoreConfig,
        records: Arc<dyn RoomRecordStore>,
        leases: Arc<dyn LeaseStore>,
        presence: Arc<dyn PresenceStore>,
        snapshots: Arc<dyn SnapshotStore>,
    ) -> Self {
        Self { config, records, leases, presence, snapshots, rooms: RwLock::new(HashMap::new()) }
    }

    /// Configuration shared by every room.
    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    /// Resolve a room context, constructing it on first access.
    ///
    /// # Errors
    ///
    /// Propagates record-store failures; the caller closes Opening with
    /// code 1011.
    pub fn get_or_create(&self, room_id: &str) -> Result<Arc<RoomCtx>, StoreError> {
        {
            let rooms = self.rooms.read().expect("lock poisoned");
            if let Some(ctx) = rooms.get(room_id) {
                return Ok(Arc::clone(ctx));
            }
        }

        // Resolve metadata outside the write lock; the record store is
        // itself idempotent.
        let record = self.records.get_or_create(room_id)?;

        let mut rooms = self.rooms.write().expect("lock poisoned");
        if let Some(ctx) = rooms.get(room_id) {
            return Ok(Arc::clone(ctx));
        }

        let driver = RoomDriver::new(
            record.id.clone(),
            record.max_users,
            self.config.clone(),
            Arc::clone(&self.leases),
            Arc::clone(&self.presence),
            Arc::clone(&self.snapshots),
        );
        let ctx = Arc::new(RoomCtx {
            record,
            driver: tokio::sync::Mutex::new(driver),
            hub: RoomHub::new(),
        });
        rooms.insert(room_id.to_owned(), Arc::clone(&ctx));
        tracing::info!(room = %room_id, "room context created");
        Ok(ctx)
    }

    /// Snapshot of every live room context, for the reaper sweep.
    pub fn rooms(&self) -> Vec<Arc<RoomCtx>> {
        let rooms = self.rooms.read().expect("lock poisoned");
        rooms.values().map(Arc::clone).collect()
    }
}

impl std::fmt::Debug for RoomRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let count = self.rooms.read().expect("lock poisoned").len();
        f.debug_struct("RoomRegistry").field("rooms", &count).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_or_create_is_idempotent() {
        let registry = RoomRegistry::new(CoreConfig::default());

        let first = registry.get_or_create("R1").unwrap();
        let second = registry.get_or_create("R1").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.rooms().len(), 1);
    }

    #[test]
    fn rooms_inherit_default_capacity() {
        let config = CoreConfig { max_users_default: 3, ..CoreConfig::default() };
        let registry = RoomRegistry::new(config);

        let ctx = registry.get_or_create("R1").unwrap();
        assert_eq!(ctx.record().max_users, 3);
    }

    #[test]
    fn record_store_failure_propagates() {
        #[derive(Debug)]
        struct DownRecordStore;
        impl RoomRecordStore for DownRecordStore {
            fn get_or_create(&self, _id: &str) -> Result<RoomRecord, StoreError> {
                Err(StoreError::Unavailable("record store down".to_owned()))
            }
        }

        let config = CoreConfig::default();
        let registry = RoomRegistry::with_stores(
            config.clone(),
            Arc::new(DownRecordStore),
            Arc::new(MemoryLeaseStore::new()),
            Arc::new(MemoryPresenceStore::new()),
            Arc::new(MemorySnapshotStore::new(config.snapshot_max_bytes)),
        );

        assert!(matches!(
            registry.get_or_create("R1"),
            Err(StoreError::Unavailable(_))
        ));
        assert!(registry.rooms().is_empty());
    }
}
