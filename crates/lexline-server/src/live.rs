use std::collections::HashMap;
use std::sync::Mutex;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::Response;
use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use lexline_contracts::{Actor, ClientEvent, ServerEvent};
use serde::Deserialize;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use crate::error::ApiError;
use crate::AppState;

/// Event plus the connection that caused it. Forward tasks drop messages
/// whose origin is their own actor, so presence and typing events are not
/// echoed back to the sender. State-change events carry no origin and
/// reach everyone in the channel.
#[derive(Debug, Clone)]
pub struct ChannelMessage {
    pub origin: Option<String>,
    pub event: ServerEvent,
}

/// One broadcast channel per consultation id. Publishing while the store
/// lock is held gives every subscriber the same event order as the store
/// commits.
#[derive(Default)]
pub struct ChannelRegistry {
    channels: Mutex<HashMap<String, broadcast::Sender<ChannelMessage>>>,
}

impl ChannelRegistry {
    pub fn subscribe(&self, consultation_id: &str) -> broadcast::Receiver<ChannelMessage> {
        let mut channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        channels
            .entry(consultation_id.to_string())
            .or_insert_with(|| broadcast::channel(256).0)
            .subscribe()
    }

    pub fn publish(&self, consultation_id: &str, origin: Option<String>, event: ServerEvent) {
        let channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(sender) = channels.get(consultation_id) {
            // A send error just means nobody is listening right now.
            let _ = sender.send(ChannelMessage { origin, event });
        }
    }

    /// Drops the sender once a consultation reaches a terminal state.
    /// Subscribers still drain buffered events before their receiver
    /// reports closed.
    pub fn remove(&self, consultation_id: &str) {
        let mut channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        channels.remove(consultation_id);
    }
}

/// Process-local bookkeeping for an IN_PROGRESS session. Deadlines are
/// recorded but never scheduled; a restart loses this map while the
/// persisted consultation state stays intact.
#[derive(Debug, Clone)]
pub struct LiveSession {
    pub consultation_id: String,
    pub started_at: DateTime<Utc>,
    pub max_end_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
}

#[derive(Default)]
pub struct LiveSessionRegistry {
    sessions: Mutex<HashMap<String, LiveSession>>,
}

impl LiveSessionRegistry {
    pub fn start(&self, consultation_id: &str, now: DateTime<Utc>, max_duration_minutes: i64) {
        let session = LiveSession {
            consultation_id: consultation_id.to_string(),
            started_at: now,
            max_end_at: lexline_kernel::max_end_time(now, max_duration_minutes),
            last_activity_at: now,
        };
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        sessions.insert(consultation_id.to_string(), session);
    }

    pub fn touch(&self, consultation_id: &str, now: DateTime<Utc>) {
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(session) = sessions.get_mut(consultation_id) {
            session.last_activity_at = now;
        }
    }

    pub fn remove(&self, consultation_id: &str) -> Option<LiveSession> {
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        sessions.remove(consultation_id)
    }

    pub fn get(&self, consultation_id: &str) -> Option<LiveSession> {
        let sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        sessions.get(consultation_id).cloned()
    }
}

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    #[serde(default)]
    token: Option<String>,
}

/// Live-channel upgrade. Authentication is the only failure that refuses
/// the socket; everything after the handshake surfaces as `error` events.
pub async fn ws_handler(
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    let token = query.token.ok_or(ApiError::AuthenticationRequired)?;
    let actor = state.authenticate(&token).await?;
    Ok(ws.on_upgrade(move |socket| handle_socket(state, actor, socket)))
}

async fn handle_socket(state: AppState, actor: Actor, socket: WebSocket) {
    let (mut sink, mut stream) = socket.split();

    // Single writer task; everything this connection should see funnels
    // through one mpsc queue.
    let (tx, mut rx) = mpsc::channel::<ServerEvent>(64);
    let writer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let Ok(text) = serde_json::to_string(&event) else {
                continue;
            };
            if sink.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    tracing::info!(user_id = %actor.id, "live channel connected");
    let mut joined: HashMap<String, JoinHandle<()>> = HashMap::new();

    while let Some(frame) = stream.next().await {
        let Ok(message) = frame else {
            break;
        };
        let text = match message {
            Message::Text(text) => text.to_string(),
            Message::Close(_) => break,
            _ => continue,
        };
        let event: ClientEvent = match serde_json::from_str(&text) {
            Ok(v) => v,
            Err(e) => {
                let _ = tx
                    .send(ServerEvent::Error {
                        message: format!("unrecognized event: {e}"),
                    })
                    .await;
                continue;
            }
        };
        if let Err(err) = dispatch(&state, &actor, &tx, &mut joined, event).await {
            let _ = tx
                .send(ServerEvent::Error {
                    message: err.to_string(),
                })
                .await;
        }
    }

    for (consultation_id, task) in joined.drain() {
        task.abort();
        state.channels.publish(
            &consultation_id,
            Some(actor.id.clone()),
            ServerEvent::UserLeft {
                user_id: actor.id.clone(),
                email: actor.email.clone(),
            },
        );
    }
    writer.abort();
    tracing::info!(user_id = %actor.id, "live channel disconnected");
}

async fn dispatch(
    state: &AppState,
    actor: &Actor,
    tx: &mpsc::Sender<ServerEvent>,
    joined: &mut HashMap<String, JoinHandle<()>>,
    event: ClientEvent,
) -> Result<(), ApiError> {
    match event {
        ClientEvent::JoinConsultation { consultation_id } => {
            state.check_join(actor, &consultation_id).await?;
            if !joined.contains_key(&consultation_id) {
                let receiver = state.channels.subscribe(&consultation_id);
                let task = spawn_forward(receiver, tx.clone(), actor.id.clone());
                joined.insert(consultation_id.clone(), task);
            }
            let _ = tx
                .send(ServerEvent::JoinedConsultation {
                    consultation_id: consultation_id.clone(),
                })
                .await;
            state.channels.publish(
                &consultation_id,
                Some(actor.id.clone()),
                ServerEvent::UserJoined {
                    user_id: actor.id.clone(),
                    email: actor.email.clone(),
                    role: actor.role,
                },
            );
            Ok(())
        }
        ClientEvent::AcceptConsultation { consultation_id } => {
            state.accept_consultation(actor, &consultation_id, true).await?;
            Ok(())
        }
        ClientEvent::RejectConsultation {
            consultation_id,
            reason,
        } => {
            state
                .reject_consultation(actor, &consultation_id, reason)
                .await?;
            Ok(())
        }
        ClientEvent::SendMessage {
            consultation_id,
            text,
            content,
            attachments,
        } => {
            let body = text.or(content).unwrap_or_default();
            let message = state
                .send_message(actor, &consultation_id, &body, attachments)
                .await?;
            let _ = tx
                .send(ServerEvent::MessageDelivered {
                    message_id: message.id,
                    delivered_at: message.delivered_at,
                })
                .await;
            Ok(())
        }
        ClientEvent::EndConsultation { consultation_id } => {
            state
                .end_consultation(actor, &consultation_id, "ended_by_participant")
                .await?;
            Ok(())
        }
        ClientEvent::Typing { consultation_id } => {
            require_joined(joined, &consultation_id)?;
            state.channels.publish(
                &consultation_id,
                Some(actor.id.clone()),
                ServerEvent::UserTyping {
                    user_id: actor.id.clone(),
                    email: actor.email.clone(),
                },
            );
            Ok(())
        }
        ClientEvent::StoppedTyping { consultation_id } => {
            require_joined(joined, &consultation_id)?;
            state.channels.publish(
                &consultation_id,
                Some(actor.id.clone()),
                ServerEvent::UserStoppedTyping {
                    user_id: actor.id.clone(),
                    email: actor.email.clone(),
                },
            );
            Ok(())
        }
        ClientEvent::LeaveConsultation { consultation_id } => {
            if let Some(task) = joined.remove(&consultation_id) {
                task.abort();
                state.channels.publish(
                    &consultation_id,
                    Some(actor.id.clone()),
                    ServerEvent::UserLeft {
                        user_id: actor.id.clone(),
                        email: actor.email.clone(),
                    },
                );
            }
            Ok(())
        }
    }
}

fn require_joined(
    joined: &HashMap<String, JoinHandle<()>>,
    consultation_id: &str,
) -> Result<(), ApiError> {
    if joined.contains_key(consultation_id) {
        Ok(())
    } else {
        Err(ApiError::Validation(
            "join the consultation before signalling".to_string(),
        ))
    }
}

fn spawn_forward(
    mut receiver: broadcast::Receiver<ChannelMessage>,
    tx: mpsc::Sender<ServerEvent>,
    self_id: String,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match receiver.recv().await {
                Ok(message) => {
                    if message.origin.as_deref() == Some(self_id.as_str()) {
                        continue;
                    }
                    if tx.send(message.event).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}
