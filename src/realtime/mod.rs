//! Realtime wire frames and the backend's change hub.
//!
//! Clients subscribe to inserts on a table, optionally narrowed by one row
//! filter in the same `column=op.value` form the REST surface accepts.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

use crate::errors::AppError;
use crate::query::Filter;

/// Frames sent by the client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Subscribe {
        topic: String,
        table: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        filter: Option<String>,
    },
    Unsubscribe {
        topic: String,
    },
}

/// Frames sent by the server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Subscribed {
        topic: String,
    },
    Insert {
        topic: String,
        table: String,
        record: Value,
    },
    Error {
        message: String,
    },
}

/// A row that was just inserted.
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    pub table: String,
    pub record: Value,
}

/// One topic on a connection.
#[derive(Debug, Clone)]
pub struct Subscription {
    pub topic: String,
    pub table: String,
    pub filter: Option<Filter>,
}

impl Subscription {
    pub fn new(topic: String, table: String, filter: Option<&str>) -> Result<Self, AppError> {
        let filter = filter
            .filter(|f| !f.trim().is_empty())
            .map(Filter::parse_expr)
            .transpose()?;
        Ok(Self {
            topic,
            table,
            filter,
        })
    }

    pub fn matches(&self, event: &ChangeEvent) -> bool {
        self.table == event.table
            && self
                .filter
                .as_ref()
                .map_or(true, |f| f.matches(&event.record))
    }
}

/// Fans inserted rows out to every open realtime connection.
#[derive(Clone)]
pub struct RealtimeHub {
    sender: broadcast::Sender<ChangeEvent>,
}

impl RealtimeHub {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an insert. Returns the number of live receivers.
    pub fn publish(&self, table: &str, record: Value) -> usize {
        let event = ChangeEvent {
            table: table.to_string(),
            record,
        };
        // No receivers just means nobody is listening
        self.sender.send(event).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.sender.subscribe()
    }
}

impl Default for RealtimeHub {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_frames_are_tagged() {
        let frame = ClientFrame::Subscribe {
            topic: "inbox".to_string(),
            table: "messages".to_string(),
            filter: Some("chat_id=in.(a,b)".to_string()),
        };
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value["type"], "subscribe");
        assert_eq!(value["table"], "messages");

        let parsed: ServerFrame =
            serde_json::from_str(r#"{"type":"subscribed","topic":"inbox"}"#).unwrap();
        assert_eq!(
            parsed,
            ServerFrame::Subscribed {
                topic: "inbox".to_string()
            }
        );
    }

    #[test]
    fn test_subscription_matching() {
        let sub = Subscription::new(
            "t".to_string(),
            "messages".to_string(),
            Some("chat_id=in.(a,b)"),
        )
        .unwrap();
        let hit = ChangeEvent {
            table: "messages".to_string(),
            record: json!({"chat_id": "b"}),
        };
        let miss = ChangeEvent {
            table: "messages".to_string(),
            record: json!({"chat_id": "c"}),
        };
        let other_table = ChangeEvent {
            table: "notifications".to_string(),
            record: json!({"chat_id": "a"}),
        };
        assert!(sub.matches(&hit));
        assert!(!sub.matches(&miss));
        assert!(!sub.matches(&other_table));
    }

    #[tokio::test]
    async fn test_hub_delivers_to_subscribers() {
        let hub = RealtimeHub::default();
        assert_eq!(hub.publish("messages", json!({})), 0);

        let mut rx = hub.subscribe();
        assert_eq!(hub.publish("messages", json!({"id": "1"})), 1);
        let event = rx.recv().await.unwrap();
        assert_eq!(event.table, "messages");
        assert_eq!(event.record["id"], "1");
    }
}
