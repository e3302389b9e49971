use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;

use vmq_api::{ErrorKind, Event, SessionCodec};
use vmq_engine::Session;

use super::AppState;

// ═══════════════════════════════════════════════════════════════
//  WebSocket: /ws
// ═══════════════════════════════════════════════════════════════

pub(crate) async fn handle_ws(
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| ws_connection(socket, state))
}

// ═══════════════════════════════════════════════════════════════
//  Connection handler
// ═══════════════════════════════════════════════════════════════

/// One task per connection. The session is dropped when the loop ends,
/// which leaves its groups and returns its leases.
async fn ws_connection(mut socket: WebSocket, state: AppState) {
    let mut session = Session::open(state.broker.clone());
    let codec = state.codec.as_ref();

    'conn: loop {
        let events = tokio::select! {
            biased;

            _ = state.shutdown.cancelled() => {
                let _ = socket.send(Message::Close(None)).await;
                break;
            }

            msg = socket.recv() => {
                let msg = match msg {
                    Some(Ok(msg)) => msg,
                    Some(Err(e)) => {
                        tracing::debug!(member = session.member(), error = %e, "websocket read failed");
                        break;
                    }
                    None => break,
                };

                let decoded = match &msg {
                    Message::Text(text) => codec.decode(text.as_str().as_bytes()),
                    Message::Binary(bytes) => codec.decode(bytes),
                    Message::Close(_) => break,
                    _ => continue,
                };

                match decoded {
                    Ok(op) => session.handle(op),
                    Err(e) => {
                        tracing::warn!(member = session.member(), error = %e, "malformed frame, closing session");
                        let event = Event::Error {
                            kind: ErrorKind::InvalidRequest,
                            message: e.to_string(),
                        };
                        let _ = send(&mut socket, codec, &event).await;
                        let _ = socket.send(Message::Close(None)).await;
                        break;
                    }
                }
            }

            _ = session.ready() => session.poll(),
        };

        for event in &events {
            if !send(&mut socket, codec, event).await {
                break 'conn;
            }
        }
    }
}

/// Returns false once the socket is gone.
async fn send(socket: &mut WebSocket, codec: &dyn SessionCodec, event: &Event) -> bool {
    let frame = match codec.encode(event) {
        Ok(frame) => frame,
        Err(e) => {
            tracing::error!(error = %e, "failed to encode event");
            return true;
        }
    };
    let msg = match String::from_utf8(frame) {
        Ok(text) => Message::Text(text.into()),
        Err(e) => Message::Binary(e.into_bytes().into()),
    };
    socket.send(msg).await.is_ok()
}
