//! Websocket transport: one axum connection per session.
//!
//! A read task forwards parsed `ClientMessage`s into the document's Hub; a
//! write task drains the session's bounded outbound channel onto the socket.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::CollabError;
use crate::hub::Hub;
use crate::protocol::{ClientMessage, ServerMessage};
use crate::state::AppState;

pub async fn ws_handler(
    State(state): State<Arc<AppState>>,
    Path((document_id, user_id)): Path<(Uuid, Uuid)>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, document_id, user_id))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>, document_id: Uuid, user_id: Uuid) {
    let (mut sender, mut receiver) = socket.split();

    let hub = state.registry.get_or_create(document_id).await;
    let session = state.sessions.open(document_id, user_id);
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<ServerMessage>(state.config.outbound_queue_capacity);

    let joined = match hub.join(session.clone(), outbound_tx.clone()).await {
        Ok(joined) => joined,
        Err(err) => {
            tracing::warn!(%document_id, %user_id, error = %err, "join rejected");
            return;
        }
    };

    let connected = ServerMessage::Connected {
        document_id,
        session_id: session.session_id,
        current_version: joined.current_version,
        snapshot_text: Some(joined.snapshot_text),
        active_users: joined.active_users,
    };
    if send_json(&mut sender, &connected).await.is_err() {
        hub.leave(session.session_id);
        return;
    }

    let write_task = tokio::spawn(async move {
        while let Some(msg) = outbound_rx.recv().await {
            if send_json(&mut sender, &msg).await.is_err() {
                break;
            }
        }
    });

    let read_hub = hub.clone();
    let read_state = Arc::clone(&state);
    let session_id = session.session_id;
    let read_outbound = outbound_tx.clone();
    let read_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            let text = match msg {
                Message::Text(text) => text,
                Message::Close(_) => break,
                _ => continue,
            };

            let parsed: ClientMessage = match serde_json::from_str(&text) {
                Ok(parsed) => parsed,
                Err(_) => continue,
            };

            dispatch(&read_hub, &read_state, &read_outbound, session_id, user_id, parsed).await;
        }

        read_hub.leave(session_id);
        read_state.sessions.close(session_id);
    });

    let _ = tokio::join!(write_task, read_task);
}

async fn dispatch(
    hub: &Hub,
    state: &Arc<AppState>,
    outbound: &mpsc::Sender<ServerMessage>,
    session_id: Uuid,
    user_id: Uuid,
    msg: ClientMessage,
) {
    state.sessions.touch(session_id);

    match msg {
        ClientMessage::Operation { op, base_version } => {
            if let Err(err) = hub.submit(user_id, op, base_version).await {
                send_error(outbound, err.into());
            }
        }
        ClientMessage::Batch { base_version, ops } => match hub.submit_batch(user_id, ops, base_version).await {
            Ok(outcome) => {
                let _ = outbound.try_send(ServerMessage::BatchResult {
                    batch_id: outcome.batch_id,
                    accepted: outcome.accepted,
                    rejected: outcome.rejected,
                    final_version: outcome.final_version,
                });
            }
            Err(err) => send_error(outbound, err.into()),
        },
        ClientMessage::Cursor {
            position,
            selection_start,
            selection_end,
        } => {
            state
                .sessions
                .update_cursor(session_id, position, selection_start, selection_end);
            hub.update_presence(session_id, position, selection_start, selection_end);
        }
        ClientMessage::SyncRequest { known_version } => match hub.sync(known_version).await {
            Ok(outcome) => {
                let _ = outbound.try_send(ServerMessage::SyncResponse {
                    current_version: outcome.current_version,
                    operations_since: outcome.operations_since,
                    active_users: outcome.active_users,
                });
            }
            Err(err) => send_error(outbound, err.into()),
        },
        ClientMessage::Ping => {
            let _ = outbound.try_send(ServerMessage::Pong);
        }
    }
}

fn send_error(outbound: &mpsc::Sender<ServerMessage>, err: CollabError) {
    let code = err.code();
    let _ = outbound.try_send(ServerMessage::error(code, err.to_string()));
}

async fn send_json(
    sender: &mut futures::stream::SplitSink<WebSocket, Message>,
    msg: &ServerMessage,
) -> Result<(), axum::Error> {
    let text = serde_json::to_string(msg).unwrap_or_default();
    sender.send(Message::Text(text)).await
}
