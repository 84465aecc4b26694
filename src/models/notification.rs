//! In-app notifications and push registration.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What a notification is about.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NotificationType {
    Message,
    Order,
    Review,
    Verification,
    System,
    #[serde(other)]
    Other,
}

impl NotificationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationType::Message => "message",
            NotificationType::Order => "order",
            NotificationType::Review => "review",
            NotificationType::Verification => "verification",
            NotificationType::System => "system",
            NotificationType::Other => "other",
        }
    }
}

/// A row in the `notifications` table.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Notification {
    pub id: String,
    pub user_id: String,
    pub title: String,
    pub body: String,
    pub notification_type: NotificationType,
    #[serde(default)]
    pub data: Option<serde_json::Value>,
    #[serde(default)]
    pub is_read: bool,
    pub created_at: DateTime<Utc>,
}

/// A device token registered for push delivery.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PushToken {
    pub id: String,
    pub user_id: String,
    pub token: String,
    pub platform: String,
    pub created_at: DateTime<Utc>,
}

/// Payload delivered by the platform push service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PushPayload {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub data: serde_json::Value,
}
