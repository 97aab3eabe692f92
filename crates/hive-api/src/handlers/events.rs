//! WebSocket activity stream.
//!
//! Each socket is authenticated once, its visible agent set computed once,
//! and every broadcast delta filtered against that allowlist before it is
//! forwarded. A subscriber never sees a row for an agent outside its set.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use hive_coord::EVENTS_CHANNEL;
use hive_ledger::ActivityEvent;
use hive_types::AgentName;
use tracing::{debug, warn};

use crate::auth::Caller;
use crate::error::ApiError;
use crate::{visible_agents, AppState};

/// Whether a delta may be delivered to a subscriber with this allowlist.
pub fn allowed(event: &ActivityEvent, allowlist: &[AgentName]) -> bool {
    allowlist.contains(&event.agent)
}

pub async fn subscribe(
    State(state): State<AppState>,
    Caller(caller): Caller,
    ws: WebSocketUpgrade,
) -> Result<impl IntoResponse, ApiError> {
    // Allowlist computed once per socket; later grants need a reconnect.
    let allowlist = visible_agents(&state, &caller).await?;
    let receiver = state.coord.subscribe(EVENTS_CHANNEL).await?;
    debug!(caller = %caller.holder_label(), agents = allowlist.len(), "events subscriber");
    Ok(ws.on_upgrade(move |socket| pump(socket, receiver, allowlist)))
}

async fn pump(
    mut socket: WebSocket,
    mut receiver: tokio::sync::broadcast::Receiver<String>,
    allowlist: Vec<AgentName>,
) {
    loop {
        tokio::select! {
            received = receiver.recv() => {
                match received {
                    Ok(payload) => {
                        let event: ActivityEvent = match serde_json::from_str(&payload) {
                            Ok(event) => event,
                            Err(e) => {
                                warn!("dropping malformed activity event: {e}");
                                continue;
                            }
                        };
                        if !allowed(&event, &allowlist) {
                            continue;
                        }
                        if socket.send(Message::Text(payload)).await.is_err() {
                            break;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "events subscriber lagged");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
            inbound = socket.recv() => {
                match inbound {
                    // Clients only ever send pings or close frames.
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
        }
    }
}
