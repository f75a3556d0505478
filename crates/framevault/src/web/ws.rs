//! WebSocket handler: feeds producer messages into a room session.
//!
//! Text and binary messages both carry one JSON protocol message. Replies
//! (state changes, finalized recordings, errors) go back as text.

use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::gateway::RoomSession;
use crate::protocol::ServerMessage;

const MIN_TICK: Duration = Duration::from_millis(10);

/// Handle a single producer connection.
///
/// Messages are processed one at a time in arrival order. The session is
/// closed when the socket ends or `shutdown` fires, which finalizes any
/// active recording.
pub async fn handle_ws(
    socket: WebSocket,
    mut session: RoomSession,
    tick: Duration,
    shutdown: CancellationToken,
) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let room = session.room().id.clone();
    let mut ticker = tokio::time::interval(tick.max(MIN_TICK));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let replies = tokio::select! {
            _ = shutdown.cancelled() => {
                info!(%room, "Closing producer connection for shutdown");
                break;
            }
            _ = ticker.tick() => session.tick().await,
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => session.handle_raw(text.as_bytes()).await,
                    Some(Ok(Message::Binary(data))) => session.handle_raw(&data).await,
                    Some(Ok(Message::Ping(data))) => {
                        if ws_tx.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                        continue;
                    }
                    Some(Ok(Message::Pong(_))) => continue,
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        debug!(%room, error = %e, "WebSocket receive error");
                        break;
                    }
                }
            }
        };

        if send_replies(&mut ws_tx, &replies).await.is_err() {
            break;
        }
    }

    let finalized = session.close().await;
    debug!(%room, finalized = finalized.is_some(), "WebSocket producer disconnected");
}

async fn send_replies(
    ws_tx: &mut SplitSink<WebSocket, Message>,
    replies: &[ServerMessage],
) -> Result<(), axum::Error> {
    for reply in replies {
        match reply.to_json() {
            Ok(json) => ws_tx.send(Message::Text(json.into())).await?,
            Err(e) => warn!(error = %e, "Failed to encode reply"),
        }
    }
    Ok(())
}
