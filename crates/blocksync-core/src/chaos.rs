//! Fault-injecting store wrappers.
//!
//! Wrap a real store and flip it into failure mode to exercise the
//! transient-store policies: surrogate lock denials, commit rejections and
//! best-effort teardown. Used by driver tests; harmless to ship since
//! nothing constructs these in production paths.

use std::{
    collections::BTreeMap,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

use bytes::Bytes;
use uuid::Uuid;

use crate::{
    error::StoreError,
    lease::{AcquireOutcome, BatchOutcome, LeaseStore, ReleaseOutcome},
    snapshot::SnapshotStore,
};

fn unavailable() -> StoreError {
    StoreError::Unavailable("injected fault".to_owned())
}

/// [`LeaseStore`] wrapper that can be switched into failure mode.
#[derive(Clone)]
pub struct ChaoticLeaseStore {
    inner: Arc<dyn LeaseStore>,
    failing: Arc<AtomicBool>,
}

impl ChaoticLeaseStore {
    /// Wrap `inner`, initially healthy.
    pub fn new(inner: Arc<dyn LeaseStore>) -> Self {
        Self { inner, failing: Arc::new(AtomicBool::new(false)) }
    }

    /// Make every subsequent operation fail (or succeed again).
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.failing.load(Ordering::SeqCst) { Err(unavailable()) } else { Ok(()) }
    }
}

impl LeaseStore for ChaoticLeaseStore {
    fn acquire(
        &self,
        room: &str,
        key: &str,
        owner: Uuid,
        ttl: Duration,
        now: Instant,
    ) -> Result<AcquireOutcome, StoreError> {
        self.check()?;
        self.inner.acquire(room, key, owner, ttl, now)
    }

    fn acquire_many(
        &self,
        room: &str,
        keys: &[String],
        owner: Uuid,
        ttl: Duration,
        now: Instant,
    ) -> Result<BatchOutcome, StoreError> {
        self.check()?;
        self.inner.acquire_many(room, keys, owner, ttl, now)
    }

    fn release(
        &self,
        room: &str,
        key: &str,
        owner: Uuid,
        now: Instant,
    ) -> Result<ReleaseOutcome, StoreError> {
        self.check()?;
        self.inner.release(room, key, owner, now)
    }

    fn release_all(
        &self,
        room: &str,
        owner: Uuid,
        now: Instant,
    ) -> Result<Vec<String>, StoreError> {
        self.check()?;
        self.inner.release_all(room, owner, now)
    }

    fn snapshot(&self, room: &str, now: Instant) -> Result<BTreeMap<String, Uuid>, StoreError> {
        self.check()?;
        self.inner.snapshot(room, now)
    }

    fn extend_by_owner(
        &self,
        room: &str,
        owner: Uuid,
        keys: &[String],
        ttl: Duration,
        now: Instant,
    ) -> Result<(), StoreError> {
        self.check()?;
        self.inner.extend_by_owner(room, owner, keys, ttl, now)
    }
}

/// [`SnapshotStore`] wrapper that can be switched into failure mode.
#[derive(Clone)]
pub struct ChaoticSnapshotStore {
    inner: Arc<dyn SnapshotStore>,
    failing: Arc<AtomicBool>,
}

impl ChaoticSnapshotStore {
    /// Wrap `inner`, initially healthy.
    pub fn new(inner: Arc<dyn SnapshotStore>) -> Self {
        Self { inner, failing: Arc::new(AtomicBool::new(false)) }
    }

    /// Make every subsequent operation fail (or succeed again).
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

impl SnapshotStore for ChaoticSnapshotStore {
    fn put(&self, room: &str, payload: Bytes, now: Instant) -> Result<(), StoreError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(unavailable());
        }
        self.inner.put(room, payload, now)
    }

    fn get(&self, room: &str) -> Result<Option<Bytes>, StoreError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(unavailable());
        }
        self.inner.get(room)
    }
}
