//! Frame definitions and the parsing boundary.
//!
//! Inbound text is parsed in two steps: the envelope (`t` + `payload`) is
//! inspected first, then the payload is decoded against the struct the tag
//! selects. Unknown tags are reported as `Ok(None)` so the session can skip
//! them without tearing the connection down; everything else that fails is
//! a [`ProtoError`] and closes the session with code 1002.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Errors raised at the protocol boundary.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtoError {
    /// The message body was not valid JSON.
    #[error("invalid JSON frame: {0}")]
    InvalidJson(String),

    /// The envelope is missing a string `t` tag.
    #[error("frame has no string tag")]
    MissingTag,

    /// A known tag carried a payload that does not match its schema.
    #[error("malformed {tag} payload: {reason}")]
    BadPayload {
        /// Tag of the offending frame.
        tag: String,
        /// Decoder diagnostic.
        reason: String,
    },

    /// A server frame failed to serialize.
    #[error("frame encoding failed: {0}")]
    Encode(String),
}

/// `LOCK_ACQUIRE` payload: request exclusive leases on one or more blocks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockAcquireRequest {
    /// Primary block to lease.
    pub block_id: String,
    /// Additional blocks acquired atomically with `block_id`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub also: Vec<String>,
}

/// `COMMIT` payload: publish an edit on a block the sender may modify.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitRequest {
    /// Block the edit applies to.
    pub block_id: String,
    /// Opaque client events; the server never interprets them.
    #[serde(default)]
    pub events: Vec<Value>,
    /// Full workspace serialization, authoritative for the room snapshot.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace_xml: Option<String>,
    /// Release the sender's lease(s) after applying.
    #[serde(default)]
    pub release_lock: bool,
    /// Additional blocks covered by `release_lock`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub also: Vec<String>,
}

/// Frames a client may send.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientFrame {
    /// Lease acquisition request.
    LockAcquire(LockAcquireRequest),
    /// Edit commit.
    Commit(CommitRequest),
    /// Liveness signal; refreshes the sender's presence entry.
    Heartbeat,
}

impl ClientFrame {
    /// Tag for [`ClientFrame::LockAcquire`].
    pub const LOCK_ACQUIRE: &'static str = "LOCK_ACQUIRE";
    /// Tag for [`ClientFrame::Commit`].
    pub const COMMIT: &'static str = "COMMIT";
    /// Tag for [`ClientFrame::Heartbeat`].
    pub const HEARTBEAT: &'static str = "HEARTBEAT";

    /// Parse one inbound text message.
    ///
    /// Returns `Ok(None)` for a well-formed envelope whose tag this server
    /// does not understand; such frames are ignored silently.
    ///
    /// # Errors
    ///
    /// - [`ProtoError::InvalidJson`] if the text is not JSON
    /// - [`ProtoError::MissingTag`] if the envelope has no string `t`
    /// - [`ProtoError::BadPayload`] if a known tag's payload fails to decode
    pub fn parse(text: &str) -> Result<Option<Self>, ProtoError> {
        let envelope: Value =
            serde_json::from_str(text).map_err(|e| ProtoError::InvalidJson(e.to_string()))?;

        let Some(tag) = envelope.get("t").and_then(Value::as_str) else {
            return Err(ProtoError::MissingTag);
        };

        // HEARTBEAT carries an empty payload; treat an absent one the same.
        let payload = envelope
            .get("payload")
            .cloned()
            .unwrap_or_else(|| Value::Object(serde_json::Map::new()));

        let bad = |reason: serde_json::Error| ProtoError::BadPayload {
            tag: tag.to_owned(),
            reason: reason.to_string(),
        };

        let frame = match tag {
            Self::LOCK_ACQUIRE => {
                Self::LockAcquire(serde_json::from_value(payload).map_err(bad)?)
            },
            Self::COMMIT => Self::Commit(serde_json::from_value(payload).map_err(bad)?),
            Self::HEARTBEAT => Self::Heartbeat,
            _ => return Ok(None),
        };

        Ok(Some(frame))
    }

    /// Encode this frame as a wire message (client side and tests).
    pub fn encode(&self) -> Result<String, ProtoError> {
        let (tag, payload) = match self {
            Self::LockAcquire(inner) => (Self::LOCK_ACQUIRE, serde_json::to_value(inner)),
            Self::Commit(inner) => (Self::COMMIT, serde_json::to_value(inner)),
            Self::Heartbeat => (Self::HEARTBEAT, Ok(Value::Object(serde_json::Map::new()))),
        };
        let payload = payload.map_err(|e| ProtoError::Encode(e.to_string()))?;
        serde_json::to_string(&serde_json::json!({ "t": tag, "payload": payload }))
            .map_err(|e| ProtoError::Encode(e.to_string()))
    }
}

/// One participant as presented to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserInfo {
    /// Per-connection identity.
    pub client_id: Uuid,
    /// Display name (raw, bounded upstream).
    pub nickname: String,
    /// Palette color assigned at admission.
    pub color: String,
}

/// `INIT_STATE` payload: the admitted session's view of the room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitState {
    /// Identity minted for this connection.
    pub client_id: Uuid,
    /// Other participants currently present.
    pub users: Vec<UserInfo>,
    /// Active leases: block id to owning client.
    pub locks: BTreeMap<String, Uuid>,
    /// Latest workspace snapshot, if any commit stored one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace_xml: Option<String>,
}

/// `USER_LEFT` payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserLeft {
    /// Participant that left the room.
    pub client_id: Uuid,
}

/// `LOCK_UPDATE` payload. `owner: null` announces a release.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockUpdate {
    /// Block whose lease changed.
    pub block_id: String,
    /// New owner, or `None` when the lease was released.
    pub owner: Option<Uuid>,
}

/// `LOCK_DENIED` payload, sent only to the requester.
///
/// `owner` is a string rather than a [`Uuid`] because a transient store
/// failure is surfaced as a surrogate denial with an empty owner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockDenied {
    /// First conflicting block of the rejected batch.
    pub block_id: String,
    /// Holder of the conflicting lease, or `""` on store failure.
    pub owner: String,
    /// Remaining lease lifetime in milliseconds (0 on store failure).
    pub ttl_ms: u64,
}

/// `COMMIT_APPLY` payload, broadcast to every subscriber including the
/// committer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitApply {
    /// Block the edit applies to.
    pub block_id: String,
    /// Opaque events, forwarded verbatim.
    pub events: Vec<Value>,
    /// Committing client; receivers dedupe their own echo by this field.
    pub by: Uuid,
    /// Snapshot accompanying the commit, when present and within the cap.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace_xml: Option<String>,
}

/// `COMMIT_REJECTED` payload, sent only to the committer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitRejected {
    /// Block the rejected commit targeted.
    pub block_id: String,
    /// Current lease holder, or `""` when the store was unreachable.
    pub owner: String,
}

/// Frames the server sends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "t", content = "payload")]
pub enum ServerFrame {
    /// Initial room view for a newly admitted session.
    #[serde(rename = "INIT_STATE")]
    InitState(InitState),
    /// A participant joined.
    #[serde(rename = "USER_JOINED")]
    UserJoined(UserInfo),
    /// A participant left.
    #[serde(rename = "USER_LEFT")]
    UserLeft(UserLeft),
    /// A lease was granted or released.
    #[serde(rename = "LOCK_UPDATE")]
    LockUpdate(LockUpdate),
    /// A lease request was denied.
    #[serde(rename = "LOCK_DENIED")]
    LockDenied(LockDenied),
    /// An accepted commit, fanned out in hub order.
    #[serde(rename = "COMMIT_APPLY")]
    CommitApply(CommitApply),
    /// A commit was rejected for lack of ownership.
    #[serde(rename = "COMMIT_REJECTED")]
    CommitRejected(CommitRejected),
}

impl ServerFrame {
    /// Encode to the wire representation.
    ///
    /// # Errors
    ///
    /// [`ProtoError::Encode`] if serialization fails; with these types that
    /// indicates a bug rather than bad input.
    pub fn encode(&self) -> Result<String, ProtoError> {
        serde_json::to_string(self).map_err(|e| ProtoError::Encode(e.to_string()))
    }

    /// Decode a server frame (client side and tests).
    pub fn decode(text: &str) -> Result<Self, ProtoError> {
        serde_json::from_str(text).map_err(|e| ProtoError::InvalidJson(e.to_string()))
    }
}
