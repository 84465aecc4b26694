//! Chat and message models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A conversation between a buyer and a seller about one product.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Chat {
    pub id: String,
    pub buyer_id: String,
    pub seller_id: String,
    pub product_id: String,
    #[serde(default)]
    pub last_message: Option<String>,
    #[serde(default)]
    pub last_message_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Chat list row returned by `get_user_chats`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatSummary {
    pub id: String,
    pub buyer_id: String,
    pub seller_id: String,
    pub product_id: String,
    #[serde(default)]
    pub last_message: Option<String>,
    #[serde(default)]
    pub last_message_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub unread_count: i64,
    pub other_user_id: String,
    #[serde(default)]
    pub other_user_name: Option<String>,
    #[serde(default)]
    pub other_user_avatar: Option<String>,
    #[serde(default)]
    pub product_title: Option<String>,
    #[serde(default)]
    pub product_price: Option<f64>,
    #[serde(default)]
    pub product_image: Option<String>,
}

/// Kind of message content.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    #[default]
    Text,
    Image,
    Offer,
}

/// A row in the `messages` table.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub id: String,
    pub chat_id: String,
    pub sender_id: String,
    pub content: String,
    #[serde(default)]
    pub message_type: MessageType,
    #[serde(default)]
    pub is_read: bool,
    pub created_at: DateTime<Utc>,
}

/// Insert payload for a message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewMessage {
    pub chat_id: String,
    pub sender_id: String,
    pub content: String,
    pub message_type: MessageType,
}
