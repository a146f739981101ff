use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::debug;

use crate::app::AppState;
use crate::events::Event;
use handoff_models::Identity;

#[derive(Debug, Default, Deserialize)]
pub struct StreamQuery {
    /// Comma-separated event types; `transfer.*` matches a whole family.
    pub events: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum ClientMessage {
    #[serde(rename = "ping")]
    Ping,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type")]
enum ServerMessage {
    #[serde(rename = "event")]
    Event(Event),
    #[serde(rename = "pong")]
    Pong,
    #[serde(rename = "error")]
    Error { code: String, message: String },
}

/// Which events one connection receives.
struct Subscription {
    organization_id: String,
    patterns: Vec<String>,
}

impl Subscription {
    fn new(organization_id: &str, events: Option<&str>) -> Self {
        let patterns = events
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(str::to_string)
            .collect();
        Self {
            organization_id: organization_id.to_string(),
            patterns,
        }
    }

    fn matches(&self, event: &Event) -> bool {
        event.organization_id == self.organization_id
            && (self.patterns.is_empty()
                || self.patterns.iter().any(|p| pattern_matches(p, &event.event_type)))
    }
}

fn pattern_matches(pattern: &str, event_type: &str) -> bool {
    match pattern.strip_suffix(".*") {
        Some(prefix) => event_type
            .strip_prefix(prefix)
            .is_some_and(|rest| rest.len() > 1 && rest.starts_with('.')),
        None => pattern == event_type,
    }
}

/// Live transfer events for the caller's organization over a WebSocket.
pub async fn stream_events(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    identity: Identity,
    Query(query): Query<StreamQuery>,
) -> impl IntoResponse {
    // Subscribe before the handshake completes so nothing published after
    // the client sees the upgrade is missed.
    let events = state.event_bus.subscribe();
    let subscription = Subscription::new(identity.organization_id(), query.events.as_deref());
    ws.on_upgrade(move |socket| run_session(socket, events, subscription))
}

async fn run_session(
    mut socket: WebSocket,
    mut events: broadcast::Receiver<Event>,
    subscription: Subscription,
) {
    let mut keepalive = tokio::time::interval(Duration::from_secs(30));
    // First tick completes immediately.
    keepalive.tick().await;

    loop {
        tokio::select! {
            _ = keepalive.tick() => {
                if socket.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }

            received = events.recv() => {
                match received {
                    Ok(event) if subscription.matches(&event) => {
                        if send_msg(&mut socket, &ServerMessage::Event(event)).await.is_err() {
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        let _ = send_msg(&mut socket, &ServerMessage::Error {
                            code: "events_lagged".to_string(),
                            message: format!("Missed {n} events"),
                        }).await;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }

            msg = socket.recv() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if let Ok(ClientMessage::Ping) = serde_json::from_str(&text) {
                            if send_msg(&mut socket, &ServerMessage::Pong).await.is_err() {
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(error = %e, "event stream closed");
                        break;
                    }
                }
            }
        }
    }
}

async fn send_msg(socket: &mut WebSocket, msg: &ServerMessage) -> Result<(), ()> {
    let json = serde_json::to_string(msg).map_err(|_| ())?;
    socket.send(Message::Text(json)).await.map_err(|_| ())
}
