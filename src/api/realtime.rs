//! Realtime websocket: `GET /realtime/v1/websocket?apikey=..&token=..`.

use std::collections::HashMap;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::Response,
};
use futures_util::{stream::SplitSink, SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use super::AppState;
use crate::auth::resolve_session;
use crate::db::schema::{self, ReadAccess};
use crate::errors::AppError;
use crate::models::{AuthUser, Chat};
use crate::realtime::{ChangeEvent, ClientFrame, ServerFrame, Subscription};

#[derive(Debug, Deserialize)]
pub struct SocketParams {
    #[serde(default)]
    token: Option<String>,
}

/// Upgrade to a websocket. The session is resolved once, before the upgrade.
pub async fn websocket(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(params): Query<SocketParams>,
) -> Result<Response, AppError> {
    let user = resolve_session(&state, params.token.as_deref()).await?;
    Ok(ws.on_upgrade(move |socket| handle_socket(socket, state, user)))
}

async fn handle_socket(socket: WebSocket, state: AppState, user: Option<AuthUser>) {
    let (mut sender, mut receiver) = socket.split();
    let mut events = state.hub.subscribe();
    let mut subscriptions: HashMap<String, Subscription> = HashMap::new();
    let who = user.as_ref().map_or("anonymous", |u| u.id.as_str()).to_string();

    info!("Realtime connection opened ({})", who);

    loop {
        tokio::select! {
            incoming = receiver.next() => {
                let message = match incoming {
                    Some(Ok(message)) => message,
                    Some(Err(e)) => {
                        debug!("Realtime receive failed: {}", e);
                        break;
                    }
                    None => break,
                };
                match message {
                    Message::Text(text) => {
                        let reply = handle_frame(text.as_str(), user.as_ref(), &mut subscriptions);
                        if let Some(frame) = reply {
                            if send_frame(&mut sender, &frame).await.is_err() {
                                break;
                            }
                        }
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
            event = events.recv() => {
                let event = match event {
                    Ok(event) => event,
                    Err(RecvError::Lagged(n)) => {
                        warn!("Realtime receiver lagged by {} events", n);
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                };

                let topics: Vec<String> = subscriptions
                    .values()
                    .filter(|s| s.matches(&event))
                    .map(|s| s.topic.clone())
                    .collect();
                if topics.is_empty() || !visible(&state, &event, user.as_ref()).await {
                    continue;
                }

                let mut closed = false;
                for topic in topics {
                    let frame = ServerFrame::Insert {
                        topic,
                        table: event.table.clone(),
                        record: event.record.clone(),
                    };
                    if send_frame(&mut sender, &frame).await.is_err() {
                        closed = true;
                        break;
                    }
                }
                if closed {
                    break;
                }
            }
        }
    }

    info!("Realtime connection closed ({})", who);
}

/// Apply one client frame. Unsubscribe has no reply.
fn handle_frame(
    text: &str,
    user: Option<&AuthUser>,
    subscriptions: &mut HashMap<String, Subscription>,
) -> Option<ServerFrame> {
    let frame: ClientFrame = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(e) => {
            return Some(ServerFrame::Error {
                message: format!("Malformed frame: {}", e),
            })
        }
    };

    match frame {
        ClientFrame::Subscribe {
            topic,
            table,
            filter,
        } => {
            let Some(descriptor) = schema::table(&table) else {
                return Some(ServerFrame::Error {
                    message: format!("Unknown table {}", table),
                });
            };
            if descriptor.requires_session() && user.is_none() {
                return Some(ServerFrame::Error {
                    message: format!("Sign in to subscribe to {}", table),
                });
            }
            match Subscription::new(topic.clone(), table, filter.as_deref()) {
                Ok(subscription) => {
                    subscriptions.insert(topic.clone(), subscription);
                    Some(ServerFrame::Subscribed { topic })
                }
                Err(e) => Some(ServerFrame::Error { message: e.message() }),
            }
        }
        ClientFrame::Unsubscribe { topic } => {
            subscriptions.remove(&topic);
            None
        }
    }
}

/// Rows reach the users the table's read rule allows, as on the REST side.
async fn visible(state: &AppState, event: &ChangeEvent, user: Option<&AuthUser>) -> bool {
    let Some(table) = schema::table(&event.table) else {
        return false;
    };
    let field = |name: &str| event.record.get(name).and_then(Value::as_str);

    if !table.requires_session() {
        return true;
    }
    let Some(user) = user else {
        return false;
    };

    match table.read_access {
        ReadAccess::Public => true,
        ReadAccess::Owner => table.owner_column.and_then(field) == Some(user.id.as_str()),
        ReadAccess::Parties(columns) => columns
            .iter()
            .any(|column| field(column) == Some(user.id.as_str())),
        ReadAccess::ChatMembers => {
            let Some(chat_id) = field("chat_id") else {
                return false;
            };
            match state.repo.fetch_by_id::<Chat>(&schema::CHATS, chat_id).await {
                Ok(Some(chat)) => chat.buyer_id == user.id || chat.seller_id == user.id,
                Ok(None) => false,
                Err(e) => {
                    warn!("Chat lookup for realtime delivery failed: {}", e);
                    false
                }
            }
        }
    }
}

async fn send_frame(
    sender: &mut SplitSink<WebSocket, Message>,
    frame: &ServerFrame,
) -> Result<(), axum::Error> {
    let text = match serde_json::to_string(frame) {
        Ok(text) => text,
        Err(e) => {
            warn!("Realtime frame could not be encoded: {}", e);
            return Ok(());
        }
    };
    sender.send(Message::Text(text.into())).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn user() -> AuthUser {
        AuthUser {
            id: "u1".to_string(),
            email: "u1@campus.edu".to_string(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_subscribe_and_unsubscribe() {
        let mut subs = HashMap::new();
        let reply = handle_frame(
            r#"{"type":"subscribe","topic":"inbox","table":"notifications","filter":"user_id=eq.u1"}"#,
            Some(&user()),
            &mut subs,
        );
        assert_eq!(
            reply,
            Some(ServerFrame::Subscribed {
                topic: "inbox".to_string()
            })
        );
        assert!(subs.contains_key("inbox"));

        let reply = handle_frame(r#"{"type":"unsubscribe","topic":"inbox"}"#, None, &mut subs);
        assert!(reply.is_none());
        assert!(subs.is_empty());
    }

    #[test]
    fn test_rejected_frames() {
        let mut subs = HashMap::new();
        let private = handle_frame(
            r#"{"type":"subscribe","topic":"t","table":"notifications"}"#,
            None,
            &mut subs,
        );
        assert!(matches!(private, Some(ServerFrame::Error { .. })));

        let unknown = handle_frame(
            r#"{"type":"subscribe","topic":"t","table":"auth_users"}"#,
            Some(&user()),
            &mut subs,
        );
        assert!(matches!(unknown, Some(ServerFrame::Error { .. })));

        let garbage = handle_frame("not json", Some(&user()), &mut subs);
        assert!(matches!(garbage, Some(ServerFrame::Error { .. })));
        assert!(subs.is_empty());
    }
}
