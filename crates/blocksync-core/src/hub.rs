//! Per-room broadcast hub.
//!
//! Each attached session owns a bounded outbound queue drained by its
//! writer task. Enqueueing under the hub lock is "acceptance": every
//! subscriber's queue receives frames in the same order, so each surviving
//! subscriber observes a prefix of the accepted sequence. A subscriber
//! whose queue is full cannot be skipped without breaking that contract,
//! so it is detached and evicted with close code 1013 instead.
//!
//! Network sends never happen under the lock; they live in the per-session
//! writer tasks.

#![allow(clippy::expect_used, reason = "hub treats a poisoned subscriber map as fatal")]

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, OnceLock},
};

use blocksync_proto::close;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Items flowing through a session's outbound queue.
#[derive(Debug, Clone)]
pub enum Outbound {
    /// An encoded frame to deliver as a text message.
    Text(Arc<str>),
    /// Flush everything queued so far, then close the transport.
    Close {
        /// WebSocket close code.
        code: u16,
        /// Human-readable close reason.
        reason: String,
    },
}

/// Why a session was evicted by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EvictNotice {
    /// Close code to put on the wire.
    pub code: u16,
    /// Reason string for the close frame.
    pub reason: &'static str,
}

/// Handle to one attached session: its outbound queue plus an eviction
/// signal the server fires for backpressure and reaping.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    client_id: Uuid,
    tx: mpsc::Sender<Outbound>,
    evict: CancellationToken,
    notice: Arc<OnceLock<EvictNotice>>,
}

impl SessionHandle {
    /// Create a handle around a session's queue sender.
    pub fn new(client_id: Uuid, tx: mpsc::Sender<Outbound>) -> Self {
        Self {
            client_id,
            tx,
            evict: CancellationToken::new(),
            notice: Arc::new(OnceLock::new()),
        }
    }

    /// Identity of the session this handle feeds.
    pub fn client_id(&self) -> Uuid {
        self.client_id
    }

    /// Fire the eviction signal. The first notice wins; later calls are
    /// no-ops, which keeps reaper and backpressure racing safely.
    pub fn evict(&self, code: u16, reason: &'static str) {
        let _ = self.notice.set(EvictNotice { code, reason });
        self.evict.cancel();
    }

    /// Wait until the server evicts this session.
    pub async fn evicted(&self) -> EvictNotice {
        self.evict.cancelled().await;
        self.notice
            .get()
            .copied()
            .unwrap_or(EvictNotice { code: close::NORMAL, reason: "closed" })
    }

    fn try_enqueue(&self, item: Outbound) -> Result<(), mpsc::error::TrySendError<Outbound>> {
        self.tx.try_send(item)
    }
}

/// Per-room set of attached sessions with ordered fan-out.
#[derive(Debug, Default)]
pub struct RoomHub {
    subscribers: Mutex<HashMap<Uuid, SessionHandle>>,
}

impl RoomHub {
    /// Create an empty hub.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a session to the fan-out set.
    pub fn attach(&self, handle: SessionHandle) {
        let mut subscribers = self.subscribers.lock().expect("mutex poisoned");
        subscribers.insert(handle.client_id(), handle);
    }

    /// Remove a session, returning its handle if it was attached.
    pub fn detach(&self, client_id: Uuid) -> Option<SessionHandle> {
        let mut subscribers = self.subscribers.lock().expect("mutex poisoned");
        subscribers.remove(&client_id)
    }

    /// Handle for an attached session.
    pub fn get(&self, client_id: Uuid) -> Option<SessionHandle> {
        let subscribers = self.subscribers.lock().expect("mutex poisoned");
        subscribers.get(&client_id).cloned()
    }

    /// Number of attached sessions.
    pub fn len(&self) -> usize {
        self.subscribers.lock().expect("mutex poisoned").len()
    }

    /// Whether no session is attached.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Enqueue a frame to one session.
    pub fn send_to(&self, client_id: Uuid, text: &Arc<str>) {
        let mut subscribers = self.subscribers.lock().expect("mutex poisoned");
        let Some(handle) = subscribers.get(&client_id) else {
            return;
        };
        if let Err(err) = handle.try_enqueue(Outbound::Text(Arc::clone(text))) {
            Self::drop_subscriber(&mut subscribers, client_id, &err);
        }
    }

    /// Enqueue a frame to every attached session except `exclude`.
    pub fn broadcast(&self, text: &Arc<str>, exclude: Option<Uuid>) {
        let mut subscribers = self.subscribers.lock().expect("mutex poisoned");

        let mut dropped = Vec::new();
        for (client_id, handle) in subscribers.iter() {
            if Some(*client_id) == exclude {
                continue;
            }
            if let Err(err) = handle.try_enqueue(Outbound::Text(Arc::clone(text))) {
                dropped.push((*client_id, err));
            }
        }

        for (client_id, err) in dropped {
            Self::drop_subscriber(&mut subscribers, client_id, &err);
        }
    }

    fn drop_subscriber(
        subscribers: &mut HashMap<Uuid, SessionHandle>,
        client_id: Uuid,
        err: &mpsc::error::TrySendError<Outbound>,
    ) {
        if let Some(handle) = subscribers.remove(&client_id) {
            match err {
                mpsc::error::TrySendError::Full(_) => {
                    tracing::warn!(client = %client_id, "subscriber queue overflow, evicting");
                    handle.evict(close::TRY_AGAIN, "outbound queue overflow");
                },
                mpsc::error::TrySendError::Closed(_) => {
                    // Session already tearing down; nothing to signal.
                },
            }
        }
    }
}
