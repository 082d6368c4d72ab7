//! Blocksync wire protocol.
//!
//! Frames are JSON objects with a string tag `t` and an object `payload`.
//! The tag alone selects the payload type, so payloads never carry a
//! discriminator of their own. Parsing is strict about shape but tolerant
//! about vocabulary: a frame whose tag is unknown decodes to "no frame" and
//! is ignored by the session, while a known tag with a malformed payload is
//! a protocol violation.
//!
//! # Invariants
//!
//! - Each frame variant maps to exactly one tag (enforced by match
//!   exhaustiveness in `ClientFrame::parse` and the serde attributes on
//!   [`ServerFrame`]).
//! - Encoding a [`ServerFrame`] and decoding the result yields an
//!   equivalent value.

#![forbid(unsafe_code)]

mod frame;

pub use frame::{
    ClientFrame, CommitApply, CommitRejected, CommitRequest, InitState, LockAcquireRequest,
    LockDenied, LockUpdate, ProtoError, ServerFrame, UserInfo, UserLeft,
};

/// WebSocket close codes used by the session layer.
///
/// The 1xxx codes are standard; 4003 is the application-defined capacity
/// rejection sent before any frame when a room is full.
pub mod close {
    /// Normal closure (client-initiated close or synthesized disconnect).
    pub const NORMAL: u16 = 1000;
    /// Protocol violation: malformed frame or non-text message.
    pub const PROTOCOL: u16 = 1002;
    /// Internal error: backing store unreachable or invariant violation.
    pub const INTERNAL: u16 = 1011;
    /// Backpressure eviction: the session's outbound queue overflowed.
    pub const TRY_AGAIN: u16 = 1013;
    /// Room at capacity; sent without any preceding frames.
    pub const ROOM_FULL: u16 = 4003;
}
