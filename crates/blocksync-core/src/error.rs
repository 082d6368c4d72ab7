//! Store error types.
//!
//! Every backing store (lease, presence, snapshot, room records) reports
//! failures through [`StoreError`]. The session layer maps the variants to
//! wire behavior: `Unavailable` is the transient kind that turns into a
//! surrogate denial or rejection frame, `PayloadTooLarge` gates snapshot
//! writes only.

/// Errors from the room backing stores.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// The backing store could not be reached; the operation may succeed if
    /// retried later. Callers surface this per request and do not retry
    /// within the request.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// A write exceeded the configured size cap and was rejected.
    #[error("payload of {size} bytes exceeds the {max} byte cap")]
    PayloadTooLarge {
        /// Size of the rejected payload.
        size: usize,
        /// Configured cap.
        max: usize,
    },
}
