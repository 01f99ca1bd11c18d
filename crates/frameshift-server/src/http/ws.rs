//! Long-lived push channel: one WebSocket per client, fed from the event bus.

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::Response;
use futures::{SinkExt, StreamExt};

use super::AppState;

/// `GET /api/ws`.
pub async fn upgrade(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| client_loop(socket, state))
}

/// Forward bus events to the client until either side goes away. Delivery is
/// best-effort: a send failure drops the subscription.
async fn client_loop(socket: WebSocket, state: AppState) {
    let (mut sink, mut stream) = socket.split();
    let mut sub = state.bus.subscribe();
    loop {
        tokio::select! {
            event = sub.rx.recv() => {
                let Some(event) = event else { break };
                let Ok(text) = serde_json::to_string(&event) else { continue };
                if sink.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            incoming = stream.next() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    // Clients only listen; drain pings and stray frames.
                    Some(Ok(_)) => {}
                }
            }
        }
    }
    state.bus.unsubscribe(sub.id);
    tracing::debug!("push client disconnected");
}
