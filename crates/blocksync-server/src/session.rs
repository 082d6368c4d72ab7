//! One WebSocket session: Opening → Admitted → Live → Closing → Closed.
//!
//! The reader half of the socket drives the room driver; the writer half
//! drains the session's bounded outbound queue. Every termination cause —
//! client close, transport error, protocol violation, backpressure
//! eviction, reaper eviction — funnels into exactly one pass through the
//! driver's Closing procedure, which is idempotent under the room lock.

use std::{sync::Arc, time::Instant};

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use blocksync_core::{Admission, EvictNotice, Outbound, RoomCtx, SessionHandle};
use blocksync_proto::{ClientFrame, close};
use futures_util::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::AppState;

/// Drive one connection from upgrade to transport close.
pub(crate) async fn run(socket: WebSocket, state: AppState, room_id: String, nickname: String) {
    let registry = state.registry();

    // Opening: resolve the room; a dead record store fails the session
    // before it ever joins anything.
    let ctx = match registry.get_or_create(&room_id) {
        Ok(ctx) => ctx,
        Err(err) => {
            tracing::error!(room = %room_id, %err, "room resolution failed");
            close_now(socket, close::INTERNAL, "room store unavailable").await;
            return;
        },
    };

    let client_id = Uuid::new_v4();
    let (tx, rx) = mpsc::channel(registry.config().outbound_queue);
    let handle = SessionHandle::new(client_id, tx.clone());

    // Admission runs under the room lock; attaching before effect
    // execution makes INIT_STATE the first frame on this session's queue
    // and a consistent cut of room state.
    let admitted = {
        let mut driver = ctx.driver().await;
        match driver.admit(client_id, &nickname, Instant::now()) {
            Ok(Admission::Admitted { participant, effects }) => {
                ctx.hub().attach(handle.clone());
                ctx.apply(&effects);
                Some(participant)
            },
            Ok(Admission::Full) => None,
            Err(err) => {
                tracing::error!(room = %room_id, client = %client_id, %err, "admission failed");
                close_now(socket, close::INTERNAL, "store unavailable").await;
                return;
            },
        }
    };
    let Some(participant) = admitted else {
        tracing::debug!(room = %room_id, "join rejected, room full");
        close_now(socket, close::ROOM_FULL, "room full").await;
        return;
    };
    tracing::info!(
        room = %room_id,
        client = %client_id,
        nickname = %participant.nickname,
        "participant joined"
    );

    let (sink, stream) = socket.split();
    let writer = tokio::spawn(write_outbound(rx, sink));

    let cause = read_loop(stream, &ctx, &handle, client_id).await;

    // Closing. Runs for every cause; the driver makes it at-most-once
    // against a racing reaper.
    {
        let mut driver = ctx.driver().await;
        let effects = driver.close(client_id, Instant::now());
        ctx.apply(&effects);
    }

    // Flush whatever is still queued, then put the close frame on the wire.
    let _ = tx
        .send(Outbound::Close { code: cause.code, reason: cause.reason.to_owned() })
        .await;
    drop(tx);
    let _ = writer.await;

    tracing::info!(room = %room_id, client = %client_id, code = cause.code, "session closed");
}

/// Process inbound messages until something ends the session, returning
/// the close cause.
async fn read_loop(
    mut stream: SplitStream<WebSocket>,
    ctx: &Arc<RoomCtx>,
    handle: &SessionHandle,
    client_id: Uuid,
) -> EvictNotice {
    loop {
        tokio::select! {
            notice = handle.evicted() => return notice,

            msg = stream.next() => match msg {
                Some(Ok(Message::Text(text))) => match ClientFrame::parse(&text) {
                    Ok(Some(frame)) => {
                        // Effects are applied while the room lock is still
                        // held: hub acceptance order must equal driver
                        // processing order.
                        let mut driver = ctx.driver().await;
                        let effects = driver.handle_frame(client_id, &frame, Instant::now());
                        ctx.apply(&effects);
                        drop(driver);
                    },
                    Ok(None) => {
                        tracing::debug!(client = %client_id, "ignoring unknown frame tag");
                    },
                    Err(err) => {
                        tracing::warn!(client = %client_id, %err, "protocol violation");
                        return EvictNotice { code: close::PROTOCOL, reason: "malformed frame" };
                    },
                },
                Some(Ok(Message::Binary(_))) => {
                    return EvictNotice { code: close::PROTOCOL, reason: "binary frames unsupported" };
                },
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => {},
                Some(Ok(Message::Close(_))) => {
                    return EvictNotice { code: close::NORMAL, reason: "client closed" };
                },
                Some(Err(err)) => {
                    tracing::debug!(client = %client_id, %err, "transport error");
                    return EvictNotice { code: close::NORMAL, reason: "transport error" };
                },
                None => {
                    return EvictNotice { code: close::NORMAL, reason: "stream ended" };
                },
            },
        }
    }
}

/// Drain the outbound queue into the socket. A `Close` item flushes the
/// queue prefix before the close frame, preserving per-subscriber order.
async fn write_outbound(mut rx: mpsc::Receiver<Outbound>, mut sink: SplitSink<WebSocket, Message>) {
    while let Some(item) = rx.recv().await {
        match item {
            Outbound::Text(text) => {
                if sink.send(Message::Text(text.to_string())).await.is_err() {
                    break;
                }
            },
            Outbound::Close { code, reason } => {
                let _ = sink
                    .send(Message::Close(Some(CloseFrame { code, reason: reason.into() })))
                    .await;
                break;
            },
        }
    }
}

/// Close a socket that never reached Live (capacity, store failure).
async fn close_now(mut socket: WebSocket, code: u16, reason: &'static str) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame { code, reason: reason.into() })))
        .await;
}
