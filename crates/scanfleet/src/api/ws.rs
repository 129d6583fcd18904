use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::ApiResult;
use crate::{
    notify::{Envelope, Subscription, TaskEvent},
    AppState,
};

/// Live channel for one task. The subscription is taken before the upgrade
/// so an unknown task is a plain 404.
pub async fn task_socket(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(task_id): Path<i64>,
) -> ApiResult<Response> {
    let subscription = state.orchestrator.subscribe(task_id).await?;
    Ok(ws.on_upgrade(move |socket| handle_socket(socket, state, subscription)))
}

async fn handle_socket(socket: WebSocket, state: AppState, subscription: Subscription) {
    let Subscription {
        id: subscriber,
        task_id,
        receiver: mut events,
    } = subscription;
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (reply_tx, mut replies) = mpsc::channel::<Envelope>(16);

    let forward = tokio::spawn(async move {
        loop {
            let envelope = tokio::select! {
                Some(envelope) = events.recv() => envelope,
                Some(envelope) = replies.recv() => envelope,
                else => break,
            };
            let text = match serde_json::to_string(&envelope) {
                Ok(text) => text,
                Err(e) => {
                    warn!(task_id, error = %e, "unserializable event dropped");
                    continue;
                }
            };
            if ws_sender.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    while let Some(msg) = ws_receiver.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                let reply = match text.as_str().trim() {
                    "ping" => Ok(TaskEvent::Pong),
                    "status" => state.orchestrator.status_event(task_id).await,
                    "logs" => state.orchestrator.logs_event(task_id).await,
                    other => {
                        debug!(task_id, token = other, "unknown control token");
                        continue;
                    }
                };
                let event = reply.unwrap_or_else(|e| TaskEvent::Error {
                    message: e.public_message(),
                });
                if reply_tx.send(event.into()).await.is_err() {
                    break;
                }
            }
            Ok(Message::Close(_)) => break,
            Err(e) => {
                debug!(task_id, error = %e, "websocket receive failed");
                break;
            }
            _ => {}
        }
    }

    forward.abort();
    state.orchestrator.unsubscribe(task_id, subscriber).await;
    debug!(task_id, %subscriber, "websocket closed");
}
