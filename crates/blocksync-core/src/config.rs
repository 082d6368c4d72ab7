//! Runtime configuration for the coordination core.

use std::time::Duration;

/// Exclusive lease lifetime granted on `LOCK_ACQUIRE`.
pub const DEFAULT_LEASE_TTL: Duration = Duration::from_millis(10_000);

/// Presence staleness threshold; participants silent longer than this are
/// reaped.
pub const DEFAULT_USER_TTL: Duration = Duration::from_millis(30_000);

/// Reaper wake-up interval (a third of the lease TTL).
pub const DEFAULT_REAPER_INTERVAL: Duration = Duration::from_millis(3_000);

/// Bound on each session's outbound frame queue.
pub const DEFAULT_OUTBOUND_QUEUE: usize = 256;

/// Cap on stored workspace snapshots.
pub const DEFAULT_SNAPSHOT_MAX_BYTES: usize = 1024 * 1024;

/// Default participant limit for newly created rooms.
pub const DEFAULT_MAX_USERS: u32 = 10;

/// Built-in participant color palette.
pub const DEFAULT_PALETTE: [&str; 4] = ["#e74c3c", "#3498db", "#2ecc71", "#f1c40f"];

/// Resolved configuration shared by every room.
#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// Lease lifetime for granted blocks.
    pub lease_ttl: Duration,
    /// Presence staleness threshold used by the reaper.
    pub user_ttl: Duration,
    /// Interval between reaper sweeps.
    pub reaper_interval: Duration,
    /// Per-session outbound queue bound; overflow evicts the session.
    pub outbound_queue: usize,
    /// Maximum accepted workspace snapshot size in bytes.
    pub snapshot_max_bytes: usize,
    /// Colors assigned to participants in join order.
    pub palette: Vec<String>,
    /// `max_users` assigned to rooms created without explicit metadata.
    pub max_users_default: u32,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            lease_ttl: DEFAULT_LEASE_TTL,
            user_ttl: DEFAULT_USER_TTL,
            reaper_interval: DEFAULT_REAPER_INTERVAL,
            outbound_queue: DEFAULT_OUTBOUND_QUEUE,
            snapshot_max_bytes: DEFAULT_SNAPSHOT_MAX_BYTES,
            palette: DEFAULT_PALETTE.iter().map(|c| (*c).to_owned()).collect(),
            max_users_default: DEFAULT_MAX_USERS,
        }
    }
}
