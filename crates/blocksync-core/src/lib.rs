//! Room coordination core for the blocksync collaboration backend.
//!
//! This crate holds everything that decides *what happens* in a room; the
//! server crate only moves bytes. The design follows an action pattern:
//! the per-room [`driver::RoomDriver`] consumes session events and returns
//! [`driver::RoomEffect`]s, which [`room::RoomCtx::apply`] executes against
//! the broadcast hub. One `tokio::sync::Mutex` per room serializes all of
//! it; there are no cross-room locks.
//!
//! # Components
//!
//! - [`lease`]: TTL'd exclusive block leases with atomic batch acquire
//! - [`presence`]: participant set with last-seen tracking
//! - [`snapshot`]: latest-workspace blob, last-writer-wins
//! - [`hub`]: ordered fan-out over bounded per-session queues
//! - [`driver`]: the room state machine (admission, frames, teardown)
//! - [`room`]: room registry and effect execution
//! - [`chaos`]: fault-injecting store wrappers for tests

#![forbid(unsafe_code)]

pub mod chaos;
pub mod config;
pub mod driver;
pub mod error;
pub mod hub;
pub mod lease;
pub mod presence;
pub mod room;
pub mod snapshot;

pub use config::CoreConfig;
pub use driver::{Admission, RoomDriver, RoomEffect};
pub use error::StoreError;
pub use hub::{EvictNotice, Outbound, RoomHub, SessionHandle};
pub use lease::{AcquireOutcome, BatchOutcome, LeaseConflict, LeaseStore, ReleaseOutcome};
pub use presence::{Participant, PresenceStore};
pub use room::{RoomCtx, RoomRecord, RoomRecordStore, RoomRegistry};
pub use snapshot::SnapshotStore;
