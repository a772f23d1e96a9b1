//! `/api/ws`: a WebSocket feed of lifecycle events (§11).
//!
//! The client may send `{"type": "subscribe", "channels": [...]}` to narrow
//! the feed to a set of event kinds (an empty or absent list means
//! "everything"), or `{"type": "ping"}` to keep the connection alive
//! through idle proxies. The server never expects the client to ack an
//! event push.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use serde::Deserialize;
use serde_json::json;

use crate::state::AppState;

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientFrame {
    Subscribe {
        #[serde(default)]
        channels: Vec<String>,
    },
    Ping,
}

pub async fn ws_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: AppState) {
    let mut subscription = state.engine.events.subscribe();
    let mut event_filter: Vec<String> = Vec::new();

    loop {
        tokio::select! {
            event = subscription.receiver.recv() => {
                let Some(event) = event else { break };
                if !event_filter.is_empty() && !event_filter.contains(&event.kind) {
                    continue;
                }
                let Ok(payload) = serde_json::to_string(&event) else { continue };
                if socket.send(Message::Text(payload.into())).await.is_err() {
                    break;
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ClientFrame>(&text) {
                            Ok(ClientFrame::Subscribe { channels }) => {
                                event_filter = channels;
                                let ack = json!({"type": "subscribed", "channels": event_filter});
                                if socket.send(Message::Text(ack.to_string().into())).await.is_err() {
                                    break;
                                }
                            }
                            Ok(ClientFrame::Ping) => {
                                let pong = json!({"type": "pong"});
                                if socket.send(Message::Text(pong.to_string().into())).await.is_err() {
                                    break;
                                }
                            }
                            Err(e) => {
                                tracing::debug!(error = %e, "ignoring malformed websocket frame");
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::debug!(error = %e, "websocket receive error");
                        break;
                    }
                }
            }
        }
    }
}
