use axum::extract::{
    State,
    ws::{self, WebSocket, WebSocketUpgrade},
};
use axum::response::IntoResponse;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use crate::engine::messages::{
    ClientToServerMessage, ServerToClientMessage, client_message_from_ws_text,
};
use crate::session_actor::SessionHandle;
use crate::state::AppState;

const CLIENT_BUFFER_SIZE: usize = 32;

pub async fn ws_handler(
    ws_upgrade: WebSocketUpgrade,
    State(app_state): State<AppState>,
) -> impl IntoResponse {
    tracing::info!("WebSocket: Connection attempt to /ws endpoint");
    ws_upgrade.on_upgrade(move |socket| handle_socket(socket, app_state))
}

async fn reject_and_close(
    ws_sender: &mut SplitSink<WebSocket, ws::Message>,
    response: ServerToClientMessage,
) {
    if let Ok(ws_msg) = response.to_ws_text() {
        let _ = ws_sender.send(ws_msg).await;
    }
    let _ = ws_sender.close().await;
}

/// One connection is one tab. The first message must be `OpenQuiz`; after
/// that every text frame goes to the tab's session actor.
pub async fn handle_socket(socket: WebSocket, app_state: AppState) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (actor_to_client_tx, mut actor_to_client_rx) =
        mpsc::channel::<ServerToClientMessage>(CLIENT_BUFFER_SIZE);

    let session_handle = match ws_receiver.next().await {
        Some(Ok(ws::Message::Text(text_msg))) => match client_message_from_ws_text(&text_msg) {
            Ok(ClientToServerMessage::OpenQuiz {
                quiz_id,
                browser_id,
            }) => {
                tracing::info!(
                    quiz.id = %quiz_id,
                    browser.scope = %browser_id,
                    "WebSocket: Tab opening quiz"
                );
                match SessionHandle::open(
                    quiz_id,
                    &browser_id,
                    app_state.services.clone(),
                    actor_to_client_tx,
                )
                .await
                {
                    Ok(handle) => handle,
                    Err(rejection) => {
                        tracing::info!(
                            quiz.id = %quiz_id,
                            rejection = rejection.code(),
                            "WebSocket: Quiz could not be opened. Closing"
                        );
                        reject_and_close(
                            &mut ws_sender,
                            ServerToClientMessage::rejected(&rejection),
                        )
                        .await;
                        return;
                    }
                }
            }
            Ok(other_msg) => {
                tracing::warn!(
                    message = ?other_msg,
                    "WebSocket: Initial message was not OpenQuiz. Closing"
                );
                reject_and_close(
                    &mut ws_sender,
                    ServerToClientMessage::SystemError {
                        message: "Invalid initial message type. Expected OpenQuiz.".to_string(),
                    },
                )
                .await;
                return;
            }
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    raw = %text_msg,
                    "WebSocket: Failed to deserialize initial message. Closing"
                );
                reject_and_close(
                    &mut ws_sender,
                    ServerToClientMessage::SystemError {
                        message: format!("Invalid initial connection message format: {e}"),
                    },
                )
                .await;
                return;
            }
        },
        Some(Ok(other_type_msg)) => {
            tracing::warn!(message = ?other_type_msg, "WebSocket: Non-text initial message. Closing");
            reject_and_close(
                &mut ws_sender,
                ServerToClientMessage::SystemError {
                    message: "Initial message must be a text JSON message (OpenQuiz).".to_string(),
                },
            )
            .await;
            return;
        }
        Some(Err(e)) => {
            tracing::warn!(error = %e, "WebSocket: Error receiving initial message. Closing");
            let _ = ws_sender.close().await;
            return;
        }
        None => {
            tracing::info!("WebSocket: Client disconnected before sending initial message");
            return;
        }
    };

    let quiz_id = session_handle.quiz_id;

    // Ends when the actor stops, which drops the only sender.
    let mut send_task = tokio::spawn(async move {
        while let Some(message) = actor_to_client_rx.recv().await {
            let ws_msg = match message.to_ws_text() {
                Ok(ws_msg) => ws_msg,
                Err(e) => {
                    tracing::error!(quiz.id = %quiz_id, error = %e, "Failed to serialize message for client");
                    continue;
                }
            };
            if ws_sender.send(ws_msg).await.is_err() {
                tracing::info!(quiz.id = %quiz_id, "WS send error, client likely disconnected");
                break;
            }
        }
        tracing::debug!(quiz.id = %quiz_id, "Send task from actor to WS client terminating");
        let _ = ws_sender.close().await;
    });

    let recv_handle = session_handle.clone();
    let mut recv_task = tokio::spawn(async move {
        loop {
            match ws_receiver.next().await {
                Some(Ok(ws::Message::Text(text_msg))) => {
                    tracing::debug!(quiz.id = %quiz_id, text = %text_msg, "Received text from WS");
                    if let Err(e) = recv_handle.forward_client_event(text_msg.to_string()).await {
                        tracing::debug!(quiz.id = %quiz_id, error = %e, "Session actor gone, stopping receive");
                        break;
                    }
                }
                Some(Ok(ws::Message::Close(_))) => {
                    tracing::info!(quiz.id = %quiz_id, "WebSocket closed by client");
                    break;
                }
                Some(Ok(_)) => {
                    tracing::trace!(quiz.id = %quiz_id, "Ignoring non-text frame");
                }
                Some(Err(e)) => {
                    tracing::warn!(quiz.id = %quiz_id, error = %e, "WebSocket error (recv)");
                    break;
                }
                None => {
                    tracing::info!(quiz.id = %quiz_id, "WebSocket connection closed");
                    break;
                }
            }
        }
    });

    tokio::select! {
        _ = (&mut send_task) => {
            tracing::debug!(quiz.id = %quiz_id, "Send task finished, aborting recv task");
            recv_task.abort();
        },
        _ = (&mut recv_task) => {
            tracing::debug!(quiz.id = %quiz_id, "Recv task finished, aborting send task");
            send_task.abort();
        },
    }

    // Closing the tab releases the quiz lock with the actor.
    session_handle.client_disconnected().await;
    tracing::info!(quiz.id = %quiz_id, "WebSocket: Tab disconnected");
}
