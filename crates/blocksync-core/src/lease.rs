//! Exclusive block leases with TTL semantics.
//!
//! The lease store is the sole authority on edit ownership. Keys are opaque
//! block identifiers scoped to a room; a lease is held while its expiry is
//! in the future. Expired entries are invisible to every read even before
//! they are garbage-collected.
//!
//! # Invariants
//!
//! - At most one active lease per `(room, key)`.
//! - Every lease has a matching entry in its owner's reverse index; the two
//!   sides are updated together under the store lock on every mutation.
//! - Multi-key operations observe a consistent view: `acquire_many` either
//!   installs the whole batch or changes nothing.
//!
//! An external key-value backend would implement the multi-key and
//! owner-gated paths as server-side atomic scripts; the in-memory store
//! gets the same serializability from a single mutex.

#![allow(clippy::expect_used, reason = "in-memory store treats a poisoned lock as fatal")]

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::Mutex,
    time::{Duration, Instant},
};

use uuid::Uuid;

use crate::error::StoreError;

/// Outcome of a single-key acquisition attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcquireOutcome {
    /// The lease was installed for the caller.
    Granted,
    /// An active lease already exists.
    Denied {
        /// Current holder.
        owner: Uuid,
        /// Time until the existing lease expires.
        remaining: Duration,
    },
}

/// One conflicting key in a rejected batch acquisition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseConflict {
    /// The contested block.
    pub key: String,
    /// Holder of the active lease.
    pub owner: Uuid,
    /// Time until that lease expires.
    pub remaining: Duration,
}

/// Outcome of an all-or-nothing batch acquisition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOutcome {
    /// Every key is now held by the caller.
    Granted {
        /// Keys that were not previously held by the caller. Keys the
        /// caller already held were refreshed and are not listed.
        newly_owned: Vec<String>,
    },
    /// At least one key is held by someone else; nothing changed.
    Denied {
        /// Every conflicting key, in request order.
        conflicts: Vec<LeaseConflict>,
    },
}

/// Outcome of an owner-gated release.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// The caller's lease was removed.
    Released,
    /// An active lease exists but belongs to someone else; untouched.
    NotOwner,
    /// No active lease on the key.
    NotHeld,
}

/// Key-to-owner mapping with TTLs, atomic batch acquire and a per-owner
/// index.
pub trait LeaseStore: Send + Sync {
    /// Atomic test-and-set on one key.
    fn acquire(
        &self,
        room: &str,
        key: &str,
        owner: Uuid,
        ttl: Duration,
        now: Instant,
    ) -> Result<AcquireOutcome, StoreError>;

    /// All-or-nothing acquisition across `keys`. Keys already held by
    /// `owner` are refreshed; if any key is held by a different owner the
    /// store is left untouched and every conflict is reported.
    fn acquire_many(
        &self,
        room: &str,
        keys: &[String],
        owner: Uuid,
        ttl: Duration,
        now: Instant,
    ) -> Result<BatchOutcome, StoreError>;

    /// Remove `owner`'s lease on `key`, if it is indeed theirs. An expired
    /// lease reads as not held.
    fn release(
        &self,
        room: &str,
        key: &str,
        owner: Uuid,
        now: Instant,
    ) -> Result<ReleaseOutcome, StoreError>;

    /// Remove every lease `owner` holds in the room, returning the keys
    /// that were still active.
    fn release_all(&self, room: &str, owner: Uuid, now: Instant)
    -> Result<Vec<String>, StoreError>;

    /// Active leases in the room.
    fn snapshot(&self, room: &str, now: Instant) -> Result<BTreeMap<String, Uuid>, StoreError>;

    /// Refresh each listed key owned by `owner`; keys held by others are
    /// left untouched. Idempotent.
    fn extend_by_owner(
        &self,
        room: &str,
        owner: Uuid,
        keys: &[String],
        ttl: Duration,
        now: Instant,
    ) -> Result<(), StoreError>;
}

#[derive(Debug, Clone)]
struct LeaseEntry {
    owner: Uuid,
    expires_at: Instant,
}

#[derive(Debug, Default)]
struct RoomLeases {
    by_key: HashMap<String, LeaseEntry>,
    by_owner: HashMap<Uuid, HashSet<String>>,
}

impl RoomLeases {
    /// Active entry for `key`, dropping it lazily if expired.
    fn live(&mut self, key: &str, now: Instant) -> Option<&LeaseEntry> {
        let expired_owner = match self.by_key.get(key) {
            Some(entry) if entry.expires_at <= now => Some(entry.owner),
            _ => None,
        };
        if let Some(owner) = expired_owner {
            self.by_key.remove(key);
            Self::unindex(&mut self.by_owner, owner, key);
        }
        self.by_key.get(key)
    }

    fn install(&mut self, key: &str, owner: Uuid, expires_at: Instant) {
        self.by_key.insert(key.to_owned(), LeaseEntry { owner, expires_at });
        self.by_owner.entry(owner).or_default().insert(key.to_owned());
    }

    fn unindex(by_owner: &mut HashMap<Uuid, HashSet<String>>, owner: Uuid, key: &str) {
        if let Some(keys) = by_owner.get_mut(&owner) {
            keys.remove(key);
            if keys.is_empty() {
                by_owner.remove(&owner);
            }
        }
    }
}

/// In-memory [`LeaseStore`]. All rooms share one mutex; per-room ordering
/// comes from the room driver, this lock only guarantees that multi-key
/// operations see a consistent view.
#[derive(Debug, Default)]
pub struct MemoryLeaseStore {
    rooms: Mutex<HashMap<String, RoomLeases>>,
}

impl MemoryLeaseStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl LeaseStore for MemoryLeaseStore {
    fn acquire(
        &self,
        room: &str,
        key: &str,
        owner: Uuid,
        ttl: Duration,
        now: Instant,
    ) -> Result<AcquireOutcome, StoreError> {
        let mut rooms = self.rooms.lock().expect("mutex poisoned");
        let leases = rooms.entry(room.to_owned()).or_default();

        if let Some(entry) = leases.live(key, now) {
            return Ok(AcquireOutcome::Denied {
                owner: entry.owner,
                remaining: entry.expires_at.saturating_duration_since(now),
            });
        }

        leases.install(key, owner, now + ttl);
        Ok(AcquireOutcome::Granted)
    }

    fn acquire_many(
        &self,
        room: &str,
        keys: &[String],
        owner: Uuid,
        ttl: Duration,
        now: Instant,
    ) -> Result<BatchOutcome, StoreError> {
        let mut rooms = self.rooms.lock().expect("mutex poisoned");
        let leases = rooms.entry(room.to_owned()).or_default();

        let mut conflicts = Vec::new();
        for key in keys {
            if let Some(entry) = leases.live(key, now)
                && entry.owner != owner
            {
                conflicts.push(LeaseConflict {
                    key: key.clone(),
                    owner: entry.owner,
                    remaining: entry.expires_at.saturating_duration_since(now),
                });
            }
        }
        if !conflicts.is_empty() {
            return Ok(BatchOutcome::Denied { conflicts });
        }

        let expires_at = now + ttl;
        let mut newly_owned = Vec::new();
        for key in keys {
            let refresh = leases.by_key.get(key).is_some_and(|e| e.owner == owner);
            leases.install(key, owner, expires_at);
            if !refresh {
                newly_owned.push(key.clone());
            }
        }
        Ok(BatchOutcome::Granted { newly_owned })
    }

    fn release(
        &self,
        room: &str,
        key: &str,
        owner: Uuid,
        now: Instant,
    ) -> Result<ReleaseOutcome, StoreError> {
        let mut rooms = self.rooms.lock().expect("mutex poisoned");
        let Some(leases) = rooms.get_mut(room) else {
            return Ok(ReleaseOutcome::NotHeld);
        };

        match leases.live(key, now).map(|entry| entry.owner) {
            None => Ok(ReleaseOutcome::NotHeld),
            Some(holder) if holder != owner => Ok(ReleaseOutcome::NotOwner),
            Some(_) => {
                leases.by_key.remove(key);
                RoomLeases::unindex(&mut leases.by_owner, owner, key);
                Ok(ReleaseOutcome::Released)
            },
        }
    }

    fn release_all(
        &self,
        room: &str,
        owner: Uuid,
        now: Instant,
    ) -> Result<Vec<String>, StoreError> {
        let mut rooms = self.rooms.lock().expect("mutex poisoned");
        let Some(leases) = rooms.get_mut(room) else {
            return Ok(Vec::new());
        };

        let Some(keys) = leases.by_owner.remove(&owner) else {
            return Ok(Vec::new());
        };

        // Expired-but-uncollected entries are removed too, but an expired
        // lease is already "not held" to every observer, so only the keys
        // that were still live are reported back.
        let mut released: Vec<String> = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(entry) = leases.by_key.remove(&key)
                && entry.expires_at > now
            {
                released.push(key);
            }
        }
        released.sort_unstable();
        Ok(released)
    }

    fn snapshot(&self, room: &str, now: Instant) -> Result<BTreeMap<String, Uuid>, StoreError> {
        let rooms = self.rooms.lock().expect("mutex poisoned");
        let Some(leases) = rooms.get(room) else {
            return Ok(BTreeMap::new());
        };

        Ok(leases
            .by_key
            .iter()
            .filter(|(_, entry)| entry.expires_at > now)
            .map(|(key, entry)| (key.clone(), entry.owner))
            .collect())
    }

    fn extend_by_owner(
        &self,
        room: &str,
        owner: Uuid,
        keys: &[String],
        ttl: Duration,
        now: Instant,
    ) -> Result<(), StoreError> {
        let mut rooms = self.rooms.lock().expect("mutex poisoned");
        let Some(leases) = rooms.get_mut(room) else {
            return Ok(());
        };

        for key in keys {
            if let Some(entry) = leases.by_key.get_mut(key)
                && entry.owner == owner
                && entry.expires_at > now
            {
                entry.expires_at = now + ttl;
            }
        }
        Ok(())
    }
}
