use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tracing::debug;

use crate::protocol::{ClientMessage, Envelope, ServerMessage};
use crate::state::ApiState;

/// WebSocket `GET /ws`, the live observer endpoint.
pub(crate) async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<ApiState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_observer(socket, state))
}

/// One connected observer: snapshot on connect, then incremental updates,
/// heartbeats, and replies to point-to-point requests. Any failed write
/// drops the observer; disconnection is never an error and reconnection is
/// the observer's responsibility.
async fn handle_observer(socket: WebSocket, state: Arc<ApiState>) {
    let (mut sink, mut incoming) = socket.split();
    let (observer_id, queue) = state.hub.subscribe();
    let mut heartbeat = tokio::time::interval(state.heartbeat);
    // The connect-time snapshot is the first liveness signal; skip the
    // interval's immediate tick.
    heartbeat.tick().await;

    // Every observer starts from the full current state and applies
    // team updates incrementally from there.
    let snapshot = state.teams.snapshot().await;
    if send(&mut sink, ServerMessage::FullState(snapshot)).await.is_err() {
        state.hub.unsubscribe(observer_id);
        return;
    }

    loop {
        tokio::select! {
            update = queue.recv_async() => match update {
                Ok(message) => {
                    if send(&mut sink, message).await.is_err() {
                        break;
                    }
                }
                Err(_) => break,
            },
            _ = heartbeat.tick() => {
                let message = ServerMessage::Heartbeat {
                    observers: state.hub.observer_count(),
                };
                if send(&mut sink, message).await.is_err() {
                    break;
                }
            }
            frame = incoming.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    if handle_request(&text, &state, &mut sink).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(_)) => break,
                // Ping/pong and binary frames are ignored.
                _ => {}
            },
        }
    }

    state.hub.unsubscribe(observer_id);
    debug!(observer = %observer_id, "observer disconnected");
}

/// Answer one observer request. Malformed requests get an error envelope
/// back on the same connection; store failures do too. Only transport
/// errors propagate, which drops the observer.
async fn handle_request(
    text: &str,
    state: &Arc<ApiState>,
    sink: &mut SplitSink<WebSocket, Message>,
) -> Result<(), axum::Error> {
    let request = match serde_json::from_str::<ClientMessage>(text) {
        Ok(request) => request,
        Err(e) => {
            return send(
                sink,
                ServerMessage::Error {
                    message: format!("unrecognized request: {e}"),
                },
            )
            .await;
        }
    };

    let reply = match request {
        ClientMessage::SwitchTeam { team } => {
            let mut snapshot = state.teams.snapshot().await;
            if snapshot.teams.iter().any(|t| t.name == team) {
                snapshot.active_team = Some(team);
                ServerMessage::FullState(snapshot)
            } else {
                ServerMessage::Error {
                    message: format!("unknown team: {team}"),
                }
            }
        }
        ClientMessage::GetHistory => match state.store.list_sessions().await {
            Ok(rows) => ServerMessage::HistoryIndex(rows),
            Err(e) => ServerMessage::Error {
                message: e.to_string(),
            },
        },
        ClientMessage::GetSession { id } => match state.store.fetch_session(id).await {
            Ok(Some(detail)) => ServerMessage::SessionDetail(Box::new(detail)),
            Ok(None) => ServerMessage::Error {
                message: format!("session {id} not found"),
            },
            Err(e) => ServerMessage::Error {
                message: e.to_string(),
            },
        },
    };
    send(sink, reply).await
}

async fn send(
    sink: &mut SplitSink<WebSocket, Message>,
    message: ServerMessage,
) -> Result<(), axum::Error> {
    let json = serde_json::to_string(&Envelope::now(message)).unwrap_or_default();
    sink.send(Message::Text(json.into())).await
}
