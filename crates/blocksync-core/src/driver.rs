//! Per-room command processor.
//!
//! The driver owns no I/O: it consumes session events and returns effects
//! for the caller to execute against the hub. One driver instance exists
//! per room behind a `tokio::sync::Mutex` (see [`crate::room`]); that lock
//! is the room's serialization point, so effect execution order equals
//! processing order and a `COMMIT_APPLY` for a key is always fanned out
//! after the `LOCK_UPDATE` that granted the responsible lease.
//!
//! Store failure policy (applied here, not in the session glue):
//!
//! - during admission: the error propagates and the session closes 1011
//! - during `LOCK_ACQUIRE`: a surrogate `LOCK_DENIED{owner:"", ttlMs:0}`
//! - during `COMMIT`: `COMMIT_REJECTED`
//! - during close: logged; the remaining teardown steps still run

use std::{
    collections::HashSet,
    sync::Arc,
    time::Instant,
};

use blocksync_proto::{
    ClientFrame, CommitApply, CommitRejected, CommitRequest, InitState, LockAcquireRequest,
    LockDenied, LockUpdate, ServerFrame, UserInfo, UserLeft,
};
use bytes::Bytes;
use uuid::Uuid;

use crate::{
    config::CoreConfig,
    error::StoreError,
    lease::{BatchOutcome, LeaseStore, ReleaseOutcome},
    presence::{Participant, PresenceStore},
    snapshot::SnapshotStore,
};

/// Longest accepted nickname, in bytes after URL decoding.
pub const MAX_NICKNAME_BYTES: usize = 64;

/// Instructions for the effect executor.
#[derive(Debug, Clone, PartialEq)]
pub enum RoomEffect {
    /// Deliver a frame to one session.
    Send {
        /// Target session.
        to: Uuid,
        /// Frame to deliver.
        frame: ServerFrame,
    },
    /// Deliver a frame to every attached session except `exclude`.
    Broadcast {
        /// Frame to fan out.
        frame: ServerFrame,
        /// Session to skip, if any.
        exclude: Option<Uuid>,
    },
    /// Remove the session from the hub's fan-out set.
    Detach {
        /// Session to detach.
        client_id: Uuid,
    },
}

/// Result of an admission attempt.
#[derive(Debug, Clone)]
pub enum Admission {
    /// The participant was added; execute `effects`, then go Live.
    Admitted {
        /// The stored presence entry (nickname normalized, color assigned).
        participant: Participant,
        /// `INIT_STATE` to self plus `USER_JOINED` to the others.
        effects: Vec<RoomEffect>,
    },
    /// The room is at capacity; close 4003 without sending any frame.
    Full,
}

/// Per-room state machine: admission, frame handling, teardown, staleness.
pub struct RoomDriver {
    room_id: String,
    max_users: u32,
    config: CoreConfig,
    leases: Arc<dyn LeaseStore>,
    presence: Arc<dyn PresenceStore>,
    snapshots: Arc<dyn SnapshotStore>,
    join_seq: u64,
}

impl RoomDriver {
    /// Create a driver for one room.
    pub fn new(
        room_id: String,
        max_users: u32,
        config: CoreConfig,
        leases: Arc<dyn LeaseStore>,
        presence: Arc<dyn PresenceStore>,
        snapshots: Arc<dyn SnapshotStore>,
    ) -> Self {
        Self { room_id, max_users, config, leases, presence, snapshots, join_seq: 0 }
    }

    /// Room this driver coordinates.
    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    /// Admit a new participant, or report the room full.
    ///
    /// # Errors
    ///
    /// Propagates store failures; the caller closes the transport with
    /// code 1011 and sends nothing.
    pub fn admit(
        &mut self,
        client_id: Uuid,
        nickname: &str,
        now: Instant,
    ) -> Result<Admission, StoreError> {
        let others = self.presence.list(&self.room_id)?;
        if others.len() as u32 >= self.max_users {
            return Ok(Admission::Full);
        }

        let palette = &self.config.palette;
        let color = palette[self.join_seq as usize % palette.len()].clone();
        self.join_seq += 1;

        let participant = Participant {
            client_id,
            nickname: display_name(nickname, client_id),
            color,
            last_seen: now,
        };

        let locks = self.leases.snapshot(&self.room_id, now)?;
        let workspace_xml = self
            .snapshots
            .get(&self.room_id)?
            .and_then(|bytes| String::from_utf8(bytes.to_vec()).ok());

        self.presence.add(&self.room_id, participant.clone())?;

        let init = ServerFrame::InitState(InitState {
            client_id,
            users: others.iter().map(user_info).collect(),
            locks,
            workspace_xml,
        });
        let joined = ServerFrame::UserJoined(user_info(&participant));

        let effects = vec![
            RoomEffect::Send { to: client_id, frame: init },
            RoomEffect::Broadcast { frame: joined, exclude: Some(client_id) },
        ];
        Ok(Admission::Admitted { participant, effects })
    }

    /// Process one inbound frame from a Live session.
    pub fn handle_frame(
        &mut self,
        client_id: Uuid,
        frame: &ClientFrame,
        now: Instant,
    ) -> Vec<RoomEffect> {
        if let Err(err) = self.presence.touch(&self.room_id, client_id, now) {
            tracing::warn!(room = %self.room_id, client = %client_id, %err, "presence touch failed");
        }

        match frame {
            ClientFrame::Heartbeat => Vec::new(),
            ClientFrame::LockAcquire(req) => self.handle_lock_acquire(client_id, req, now),
            ClientFrame::Commit(req) => self.handle_commit(client_id, req, now),
        }
    }

    fn handle_lock_acquire(
        &mut self,
        client_id: Uuid,
        req: &LockAcquireRequest,
        now: Instant,
    ) -> Vec<RoomEffect> {
        let keys = unique_keys(&req.block_id, &req.also);

        match self.leases.acquire_many(&self.room_id, &keys, client_id, self.config.lease_ttl, now)
        {
            Ok(BatchOutcome::Granted { newly_owned }) => newly_owned
                .into_iter()
                .map(|key| RoomEffect::Broadcast {
                    frame: ServerFrame::LockUpdate(LockUpdate {
                        block_id: key,
                        owner: Some(client_id),
                    }),
                    exclude: None,
                })
                .collect(),

            Ok(BatchOutcome::Denied { conflicts }) => {
                let Some(first) = conflicts.first() else {
                    tracing::warn!(room = %self.room_id, "denied batch with no conflicts");
                    return Vec::new();
                };
                vec![RoomEffect::Send {
                    to: client_id,
                    frame: ServerFrame::LockDenied(LockDenied {
                        block_id: first.key.clone(),
                        owner: first.owner.to_string(),
                        ttl_ms: first.remaining.as_millis() as u64,
                    }),
                }]
            },

            Err(err) => {
                tracing::warn!(room = %self.room_id, client = %client_id, %err, "lease store failed on acquire");
                vec![RoomEffect::Send {
                    to: client_id,
                    frame: ServerFrame::LockDenied(LockDenied {
                        block_id: req.block_id.clone(),
                        owner: String::new(),
                        ttl_ms: 0,
                    }),
                }]
            },
        }
    }

    fn handle_commit(
        &mut self,
        client_id: Uuid,
        req: &CommitRequest,
        now: Instant,
    ) -> Vec<RoomEffect> {
        let rejected = |owner: String| {
            vec![RoomEffect::Send {
                to: client_id,
                frame: ServerFrame::CommitRejected(CommitRejected {
                    block_id: req.block_id.clone(),
                    owner,
                }),
            }]
        };

        let holder = match self.leases.snapshot(&self.room_id, now) {
            Ok(locks) => locks.get(&req.block_id).copied(),
            Err(err) => {
                tracing::warn!(room = %self.room_id, client = %client_id, %err, "lease store failed on commit");
                return rejected(String::new());
            },
        };
        if let Some(owner) = holder
            && owner != client_id
        {
            return rejected(owner.to_string());
        }

        let mut workspace_xml = None;
        if let Some(xml) = &req.workspace_xml {
            match self.snapshots.put(&self.room_id, Bytes::from(xml.clone().into_bytes()), now) {
                Ok(()) => workspace_xml = Some(xml.clone()),
                Err(StoreError::PayloadTooLarge { size, max }) => {
                    // The commit itself stands; only the snapshot is refused.
                    tracing::warn!(
                        room = %self.room_id,
                        client = %client_id,
                        size,
                        max,
                        "oversize workspace snapshot dropped"
                    );
                },
                Err(err) => {
                    tracing::warn!(room = %self.room_id, client = %client_id, %err, "snapshot store failed on commit");
                    return rejected(String::new());
                },
            }
        }

        let mut effects = vec![RoomEffect::Broadcast {
            frame: ServerFrame::CommitApply(CommitApply {
                block_id: req.block_id.clone(),
                events: req.events.clone(),
                by: client_id,
                workspace_xml,
            }),
            exclude: None,
        }];

        if req.release_lock {
            for key in unique_keys(&req.block_id, &req.also) {
                match self.leases.release(&self.room_id, &key, client_id, now) {
                    Ok(ReleaseOutcome::Released) => effects.push(RoomEffect::Broadcast {
                        frame: ServerFrame::LockUpdate(LockUpdate { block_id: key, owner: None }),
                        exclude: None,
                    }),
                    Ok(ReleaseOutcome::NotOwner | ReleaseOutcome::NotHeld) => {},
                    Err(err) => {
                        tracing::warn!(room = %self.room_id, client = %client_id, %err, "lease release failed after commit");
                    },
                }
            }
        }

        effects
    }

    /// The Closing procedure. Idempotent: a second call for the same client
    /// finds no leases and no presence entry and produces no effects, so a
    /// session close racing the reaper releases leases and announces
    /// `USER_LEFT` at most once.
    pub fn close(&mut self, client_id: Uuid, now: Instant) -> Vec<RoomEffect> {
        let released = match self.leases.release_all(&self.room_id, client_id, now) {
            Ok(released) => released,
            Err(err) => {
                tracing::warn!(room = %self.room_id, client = %client_id, %err, "lease release failed on close");
                Vec::new()
            },
        };

        // Leases are gone before the presence entry goes; observers never
        // see a present participant with dangling ownership.
        let removed = match self.presence.remove(&self.room_id, client_id) {
            Ok(removed) => removed,
            Err(err) => {
                tracing::warn!(room = %self.room_id, client = %client_id, %err, "presence remove failed on close");
                None
            },
        };

        if released.is_empty() && removed.is_none() {
            return Vec::new();
        }

        let mut effects: Vec<RoomEffect> = released
            .into_iter()
            .map(|key| RoomEffect::Broadcast {
                frame: ServerFrame::LockUpdate(LockUpdate { block_id: key, owner: None }),
                exclude: Some(client_id),
            })
            .collect();

        effects.push(RoomEffect::Detach { client_id });

        if removed.is_some() {
            effects.push(RoomEffect::Broadcast {
                frame: ServerFrame::UserLeft(UserLeft { client_id }),
                exclude: Some(client_id),
            });
        }

        effects
    }

    /// Participants whose last-seen predates the configured user TTL.
    pub fn stale(&self, now: Instant) -> Vec<Uuid> {
        let Some(threshold) = now.checked_sub(self.config.user_ttl) else {
            return Vec::new();
        };
        match self.presence.stale_since(&self.room_id, threshold) {
            Ok(stale) => stale,
            Err(err) => {
                tracing::warn!(room = %self.room_id, %err, "presence scan failed");
                Vec::new()
            },
        }
    }
}

impl std::fmt::Debug for RoomDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoomDriver")
            .field("room_id", &self.room_id)
            .field("max_users", &self.max_users)
            .field("join_seq", &self.join_seq)
            .finish()
    }
}

fn user_info(participant: &Participant) -> UserInfo {
    UserInfo {
        client_id: participant.client_id,
        nickname: participant.nickname.clone(),
        color: participant.color.clone(),
    }
}

/// `{block_id} ∪ also`, deduplicated, request order preserved.
fn unique_keys(block_id: &str, also: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut keys = Vec::with_capacity(1 + also.len());
    for key in std::iter::once(block_id).chain(also.iter().map(String::as_str)) {
        if seen.insert(key.to_owned()) {
            keys.push(key.to_owned());
        }
    }
    keys
}

/// Normalize a raw nickname: bound to [`MAX_NICKNAME_BYTES`] on a char
/// boundary; an absent or blank name becomes `User####` derived from the
/// client id.
fn display_name(raw: &str, client_id: Uuid) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        let bytes = client_id.as_bytes();
        let n = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) % 10_000;
        return format!("User{n:04}");
    }

    if trimmed.len() <= MAX_NICKNAME_BYTES {
        return trimmed.to_owned();
    }
    let mut end = MAX_NICKNAME_BYTES;
    while !trimmed.is_char_boundary(end) {
        end -= 1;
    }
    trimmed[..end].to_owned()
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{
        lease::MemoryLeaseStore,
        presence::MemoryPresenceStore,
        snapshot::MemorySnapshotStore,
    };

    fn driver_with(max_users: u32) -> RoomDriver {
        let config = CoreConfig::default();
        RoomDriver::new(
            "ROOM".to_owned(),
            max_users,
            config.clone(),
            Arc::new(MemoryLeaseStore::new()),
            Arc::new(MemoryPresenceStore::new()),
            Arc::new(MemorySnapshotStore::new(config.snapshot_max_bytes)),
        )
    }

    fn driver() -> RoomDriver {
        driver_with(10)
    }

    fn admit(driver: &mut RoomDriver, nickname: &str, now: Instant) -> Uuid {
        let client_id = Uuid::new_v4();
        match driver.admit(client_id, nickname, now).unwrap() {
            Admission::Admitted { .. } => client_id,
            Admission::Full => panic!("room unexpectedly full"),
        }
    }

    fn lock_acquire(block_id: &str, also: &[&str]) -> ClientFrame {
        ClientFrame::LockAcquire(LockAcquireRequest {
            block_id: block_id.to_owned(),
            also: also.iter().map(|s| (*s).to_owned()).collect(),
        })
    }

    fn commit(block_id: &str, release_lock: bool, xml: Option<&str>) -> ClientFrame {
        ClientFrame::Commit(CommitRequest {
            block_id: block_id.to_owned(),
            events: vec![serde_json::json!({"kind": "move"})],
            workspace_xml: xml.map(str::to_owned),
            release_lock,
            also: vec![],
        })
    }

    #[test]
    fn admission_sends_init_then_announces_join() {
        let mut driver = driver();
        let now = Instant::now();

        let alice = Uuid::new_v4();
        let Admission::Admitted { participant, effects } =
            driver.admit(alice, "alice", now).unwrap()
        else {
            panic!("expected admission");
        };
        assert_eq!(participant.nickname, "alice");

        let RoomEffect::Send { to, frame: ServerFrame::InitState(init) } = &effects[0] else {
            panic!("first effect must be INIT_STATE to self");
        };
        assert_eq!(*to, alice);
        assert_eq!(init.client_id, alice);
        assert!(init.users.is_empty());
        assert!(init.locks.is_empty());
        assert!(init.workspace_xml.is_none());

        let RoomEffect::Broadcast { frame: ServerFrame::UserJoined(joined), exclude } =
            &effects[1]
        else {
            panic!("second effect must announce the join");
        };
        assert_eq!(joined.client_id, alice);
        assert_eq!(*exclude, Some(alice));
    }

    #[test]
    fn init_state_excludes_self_but_lists_earlier_users_and_locks() {
        let mut driver = driver();
        let now = Instant::now();

        let alice = admit(&mut driver, "alice", now);
        driver.handle_frame(alice, &lock_acquire("b1", &[]), now);

        let bob = Uuid::new_v4();
        let Admission::Admitted { effects, .. } = driver.admit(bob, "bob", now).unwrap() else {
            panic!("expected admission");
        };
        let RoomEffect::Send { frame: ServerFrame::InitState(init), .. } = &effects[0] else {
            panic!("expected INIT_STATE");
        };
        assert_eq!(init.users.len(), 1);
        assert_eq!(init.users[0].client_id, alice);
        assert_eq!(init.locks.get("b1"), Some(&alice));
    }

    #[test]
    fn colors_follow_palette_in_join_order() {
        let mut driver = driver();
        let now = Instant::now();
        let palette = CoreConfig::default().palette;

        for expected in palette.iter().chain(palette.iter()).take(palette.len() + 1) {
            let client_id = Uuid::new_v4();
            let Admission::Admitted { participant, .. } =
                driver.admit(client_id, "user", now).unwrap()
            else {
                panic!("expected admission");
            };
            assert_eq!(&participant.color, expected);
            // Free the slot so capacity never interferes.
            driver.close(client_id, now);
        }
    }

    #[test]
    fn full_room_rejects_admission_without_effects() {
        let mut driver = driver_with(2);
        let now = Instant::now();

        admit(&mut driver, "a", now);
        admit(&mut driver, "b", now);

        let outcome = driver.admit(Uuid::new_v4(), "c", now).unwrap();
        assert!(matches!(outcome, Admission::Full));
        assert_eq!(driver.stale(now).len(), 0);
    }

    #[test]
    fn blank_nickname_gets_deterministic_placeholder() {
        let mut driver = driver();
        let now = Instant::now();
        let client_id = Uuid::new_v4();

        let Admission::Admitted { participant, .. } =
            driver.admit(client_id, "  ", now).unwrap()
        else {
            panic!("expected admission");
        };
        assert!(participant.nickname.starts_with("User"));
        assert_eq!(participant.nickname.len(), 8);
    }

    #[test]
    fn long_nicknames_are_bounded_on_a_char_boundary() {
        let long = "é".repeat(40); // 80 bytes
        let bounded = display_name(&long, Uuid::new_v4());
        assert!(bounded.len() <= MAX_NICKNAME_BYTES);
        assert_eq!(bounded, "é".repeat(32));
    }

    #[test]
    fn solo_acquire_then_commit_with_release() {
        let mut driver = driver();
        let now = Instant::now();
        let alice = admit(&mut driver, "alice", now);

        let effects = driver.handle_frame(alice, &lock_acquire("b1", &[]), now);
        assert_eq!(effects.len(), 1);
        let RoomEffect::Broadcast { frame: ServerFrame::LockUpdate(update), exclude: None } =
            &effects[0]
        else {
            panic!("expected LOCK_UPDATE broadcast");
        };
        assert_eq!(update.block_id, "b1");
        assert_eq!(update.owner, Some(alice));

        let effects = driver.handle_frame(alice, &commit("b1", true, Some("<x/>")), now);
        assert_eq!(effects.len(), 2);
        let RoomEffect::Broadcast { frame: ServerFrame::CommitApply(apply), exclude: None } =
            &effects[0]
        else {
            panic!("COMMIT_APPLY must come first");
        };
        assert_eq!(apply.by, alice);
        assert_eq!(apply.workspace_xml.as_deref(), Some("<x/>"));

        let RoomEffect::Broadcast { frame: ServerFrame::LockUpdate(update), .. } = &effects[1]
        else {
            panic!("release LOCK_UPDATE must follow");
        };
        assert_eq!(update.owner, None);
    }

    #[test]
    fn contended_acquire_is_denied_privately_with_remaining_ttl() {
        let mut driver = driver();
        let now = Instant::now();
        let alice = admit(&mut driver, "alice", now);
        let bob = admit(&mut driver, "bob", now);

        driver.handle_frame(alice, &lock_acquire("b1", &[]), now);

        let later = now + Duration::from_secs(4);
        let effects = driver.handle_frame(bob, &lock_acquire("b1", &[]), later);
        assert_eq!(effects.len(), 1);
        let RoomEffect::Send { to, frame: ServerFrame::LockDenied(denied) } = &effects[0] else {
            panic!("expected private LOCK_DENIED");
        };
        assert_eq!(*to, bob);
        assert_eq!(denied.block_id, "b1");
        assert_eq!(denied.owner, alice.to_string());
        assert_eq!(denied.ttl_ms, 6_000);
    }

    #[test]
    fn group_acquire_with_one_conflict_changes_nothing() {
        let mut driver = driver();
        let now = Instant::now();
        let alice = admit(&mut driver, "alice", now);
        let bob = admit(&mut driver, "bob", now);

        driver.handle_frame(alice, &lock_acquire("b1", &[]), now);

        let effects = driver.handle_frame(bob, &lock_acquire("b2", &["b1", "b3"]), now);
        assert_eq!(effects.len(), 1);
        let RoomEffect::Send { frame: ServerFrame::LockDenied(denied), .. } = &effects[0] else {
            panic!("expected LOCK_DENIED");
        };
        assert_eq!(denied.block_id, "b1");

        // Neither b2 nor b3 got a broadcast, and re-acquiring them works.
        let effects = driver.handle_frame(alice, &lock_acquire("b2", &["b3"]), now);
        assert_eq!(effects.len(), 2);
    }

    #[test]
    fn commit_without_lease_applies_and_commit_on_foreign_lease_rejects() {
        let mut driver = driver();
        let now = Instant::now();
        let alice = admit(&mut driver, "alice", now);
        let bob = admit(&mut driver, "bob", now);

        // No lease on the block: the commit is accepted.
        let effects = driver.handle_frame(bob, &commit("free", false, None), now);
        assert!(matches!(
            effects[0],
            RoomEffect::Broadcast { frame: ServerFrame::CommitApply(_), exclude: None }
        ));

        // Alice owns b1: bob's commit is rejected privately.
        driver.handle_frame(alice, &lock_acquire("b1", &[]), now);
        let effects = driver.handle_frame(bob, &commit("b1", false, None), now);
        assert_eq!(effects.len(), 1);
        let RoomEffect::Send { to, frame: ServerFrame::CommitRejected(rejected) } = &effects[0]
        else {
            panic!("expected COMMIT_REJECTED");
        };
        assert_eq!(*to, bob);
        assert_eq!(rejected.owner, alice.to_string());
    }

    #[test]
    fn close_releases_leases_then_detaches_then_announces() {
        let mut driver = driver();
        let now = Instant::now();
        let alice = admit(&mut driver, "alice", now);
        driver.handle_frame(alice, &lock_acquire("b1", &["b2"]), now);

        let effects = driver.close(alice, now);
        assert_eq!(effects.len(), 4);
        for effect in &effects[..2] {
            let RoomEffect::Broadcast { frame: ServerFrame::LockUpdate(update), .. } = effect
            else {
                panic!("lease releases must come first");
            };
            assert_eq!(update.owner, None);
        }
        assert_eq!(effects[2], RoomEffect::Detach { client_id: alice });
        assert!(matches!(
            &effects[3],
            RoomEffect::Broadcast { frame: ServerFrame::UserLeft(left), .. }
                if left.client_id == alice
        ));

        // Second close is a no-op.
        assert!(driver.close(alice, now).is_empty());
    }

    #[test]
    fn stale_scan_respects_heartbeats() {
        let config = CoreConfig::default();
        let mut driver = driver();
        let now = Instant::now();
        let alice = admit(&mut driver, "alice", now);
        let bob = admit(&mut driver, "bob", now);

        let later = now + config.user_ttl / 2;
        driver.handle_frame(bob, &ClientFrame::Heartbeat, later);

        let past_ttl = now + config.user_ttl + Duration::from_secs(1);
        assert_eq!(driver.stale(past_ttl), vec![alice]);
        let all_stale = now + config.user_ttl * 2;
        let mut expected = vec![alice, bob];
        expected.sort_unstable();
        assert_eq!(driver.stale(all_stale), expected);
    }

    #[test]
    fn oversize_snapshot_is_dropped_but_commit_applies() {
        let config = CoreConfig::default();
        let mut driver = RoomDriver::new(
            "ROOM".to_owned(),
            10,
            config,
            Arc::new(MemoryLeaseStore::new()),
            Arc::new(MemoryPresenceStore::new()),
            Arc::new(MemorySnapshotStore::new(8)),
        );
        let now = Instant::now();
        let alice = admit(&mut driver, "alice", now);

        let big = "x".repeat(64);
        let effects = driver.handle_frame(alice, &commit("b1", false, Some(&big)), now);
        assert_eq!(effects.len(), 1);
        let RoomEffect::Broadcast { frame: ServerFrame::CommitApply(apply), .. } = &effects[0]
        else {
            panic!("expected COMMIT_APPLY");
        };
        assert!(apply.workspace_xml.is_none(), "oversize xml must not be fanned out");
    }
}
