use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use futures::{SinkExt, StreamExt};
use pubsub::{ChannelSubscriber, TransportSignal};
use serde::Deserialize;
use shared::{
    domain::UserId,
    error::ApiError,
    protocol::{room_id_from_channel, ChannelStatus, TransportFrame},
};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::{app_state::AppState, http::reject};

#[derive(Debug, Deserialize)]
pub(crate) struct WsQuery {
    user_id: i64,
    channel: String,
}

pub(crate) async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(q): Query<WsQuery>,
) -> Response {
    let user_id = UserId(q.user_id);
    let Some(room_id) = room_id_from_channel(&q.channel) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(ApiError::validation("unknown channel")),
        )
            .into_response();
    };
    if let Err(err) = server_api::authorize_room_channel(&state.api, user_id, room_id).await {
        return reject(err).into_response();
    }

    ws.on_upgrade(move |socket| ws_connection(state, socket, user_id, q.channel))
}

/// Bridges one broker subscription onto one socket. Frames that do not fit
/// the per-socket buffer are dropped; the client catches up by polling.
async fn ws_connection(state: Arc<AppState>, socket: WebSocket, user_id: UserId, channel: String) {
    let (mut sender, mut receiver) = socket.split();

    let subscription = match state.broker.subscribe(&channel).await {
        Ok(subscription) => subscription,
        Err(error) => {
            warn!(%channel, user_id = user_id.0, %error, "ws: broker subscribe failed");
            let frame = TransportFrame::Status {
                channel: channel.clone(),
                status: ChannelStatus::ChannelError,
            };
            if let Ok(text) = serde_json::to_string(&frame) {
                let _ = sender.send(Message::Text(text)).await;
            }
            let _ = sender.send(Message::Close(None)).await;
            return;
        }
    };
    let (_guard, mut signals) = subscription.into_parts();
    info!(%channel, user_id = user_id.0, "ws: channel attached");

    let (frames_tx, mut frames_rx) = mpsc::channel::<String>(state.transport_capacity.max(1));

    let forward_channel = channel.clone();
    let forward_task = tokio::spawn(async move {
        while let Some(signal) = signals.recv().await {
            let frame = match signal {
                TransportSignal::Event(event) => TransportFrame::Event(event),
                TransportSignal::Status(status) => TransportFrame::Status {
                    channel: forward_channel.clone(),
                    status,
                },
            };
            let text = match serde_json::to_string(&frame) {
                Ok(v) => v,
                Err(_) => continue,
            };
            match frames_tx.try_send(text) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(channel = %forward_channel, "ws: subscriber lagging, dropping frame");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => break,
            }
        }
    });

    let send_task = tokio::spawn(async move {
        while let Some(text) = frames_rx.recv().await {
            if sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        let _ = sender.send(Message::Close(None)).await;
    });

    while let Some(Ok(msg)) = receiver.next().await {
        if matches!(msg, Message::Close(_)) {
            break;
        }
    }

    forward_task.abort();
    send_task.abort();
    debug!(%channel, user_id = user_id.0, "ws: channel detached");
}
