//! WebSocket subscription lifecycle: snapshot, live stream, client frames.

use axum::extract::ws::{CloseFrame, Message, WebSocket, close_code};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use tracing::{debug, error, info, warn};

use statewire_core::error::SyncError;
use statewire_core::protocol::ClientFrame;
use statewire_core::transport::EventSource;

use crate::channel::Subscription;
use crate::events::{decode_client_frame, encode_event};
use crate::state::SessionEntry;

/// Close reason sent when a subscriber falls behind its buffer watermark.
pub const OVERFLOW_CLOSE_REASON: &str = "overflow";

/// Close reason sent once the session has finished and its channel drained.
pub const SESSION_CLOSED_REASON: &str = "session closed";

async fn close_with(
    ws_tx: &mut SplitSink<WebSocket, Message>,
    code: u16,
    reason: &'static str,
) {
    let frame = CloseFrame {
        code,
        reason: reason.into(),
    };
    let _ = ws_tx.send(Message::Close(Some(frame))).await;
}

/// Handle one client frame. Returns false when the connection should end.
async fn handle_client_frame(subscription: &mut Subscription, text: &str) -> bool {
    match decode_client_frame(text) {
        Ok(ClientFrame::Override(command)) => {
            debug!(
                subscriber = %subscription.id(),
                field = %command.target_field,
                override_id = %command.id,
                "Override received"
            );
            match subscription.send_override(command).await {
                Ok(()) => true,
                Err(e) => {
                    warn!(subscriber = %subscription.id(), %e, "Override not forwarded");
                    !matches!(e, SyncError::SessionClosed(_))
                }
            }
        }
        Ok(ClientFrame::Resync) => match subscription.resync().await {
            Ok(()) => true,
            Err(e) => {
                error!(subscriber = %subscription.id(), %e, "Resync failed");
                false
            }
        },
        Err(e) => {
            warn!(subscriber = %subscription.id(), %e, "Invalid frame received");
            true
        }
    }
}

/// Serve one WebSocket subscriber of `entry`'s session.
pub async fn handle_ws_connection(entry: SessionEntry, ws: WebSocket) {
    let mut subscription = entry.channel.subscribe();
    let sub_id = subscription.id().to_string();
    let session_id = entry.channel.session_id().clone();
    info!(session = %session_id, subscriber = %sub_id, "WebSocket subscriber connected");

    let (mut ws_tx, mut ws_rx) = ws.split();

    loop {
        tokio::select! {
            event = subscription.next_event() => match event {
                Ok(Some(event)) => {
                    let Some(text) = encode_event(&event) else { continue };
                    if ws_tx.send(Message::Text(text.into())).await.is_err() {
                        debug!(subscriber = %sub_id, "Client went away mid-send");
                        break;
                    }
                }
                Ok(None) => {
                    close_with(&mut ws_tx, close_code::NORMAL, SESSION_CLOSED_REASON).await;
                    break;
                }
                Err(SyncError::ChannelOverflow { watermark, .. }) => {
                    warn!(session = %session_id, subscriber = %sub_id, watermark, "Closing overflowed subscriber");
                    close_with(&mut ws_tx, close_code::AGAIN, OVERFLOW_CLOSE_REASON).await;
                    break;
                }
                Err(e) => {
                    error!(subscriber = %sub_id, %e, "Subscription failed");
                    close_with(&mut ws_tx, close_code::ERROR, "internal error").await;
                    break;
                }
            },
            msg = ws_rx.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    if !handle_client_frame(&mut subscription, text.as_str()).await {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | None => {
                    debug!(subscriber = %sub_id, "Client requested close");
                    break;
                }
                Some(Err(e)) => {
                    warn!(subscriber = %sub_id, %e, "WebSocket error");
                    break;
                }
                // Axum answers pings itself
                Some(Ok(_)) => {}
            },
        }
    }

    drop(subscription);
    info!(session = %session_id, subscriber = %sub_id, "WebSocket subscriber disconnected");
}
