//! Chats and messages for the signed-in user.

use std::cmp::Ordering;
use std::sync::Arc;

use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::broadcast;

use super::backend::BackendClient;
use super::cache::KvCache;
use super::inbox::{Inbox, InboxEvent, InboxSource};
use crate::errors::AppError;
use crate::models::{Chat, ChatSummary, Message, MessageType, NewMessage};
use crate::query::{Direction, Filter};

#[derive(Serialize)]
struct UserChatsArgs<'a> {
    user_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    chat_id_filter: Option<&'a str>,
}

/// Chat list as an inbox: one item per chat, keyed by chat id.
pub struct ChatSource;

impl InboxSource for ChatSource {
    type Item = ChatSummary;

    fn table(&self) -> &'static str {
        "messages"
    }

    fn cache_key(&self, user_id: &str) -> String {
        format!("unread_messages:{}", user_id)
    }

    fn item_key(&self, item: &ChatSummary) -> String {
        item.id.clone()
    }

    fn unread_of(&self, item: &ChatSummary) -> i64 {
        item.unread_count
    }

    fn clear_unread(&self, item: &mut ChatSummary) {
        item.unread_count = 0;
    }

    /// Unfiltered. The backend only delivers messages of chats the user is
    /// a member of, so chats opened after subscribing are covered too.
    fn realtime_filter(&self, _user_id: &str) -> Option<Filter> {
        None
    }

    fn key_for_record(&self, record: &Value) -> Option<String> {
        record
            .get("chat_id")
            .and_then(Value::as_str)
            .map(String::from)
    }

    fn sort(&self, items: &mut [ChatSummary]) {
        items.sort_by(compare_chats);
    }

    async fn fetch_items(
        &self,
        backend: &BackendClient,
        user_id: &str,
    ) -> Result<Vec<ChatSummary>, AppError> {
        let args = UserChatsArgs {
            user_id,
            chat_id_filter: None,
        };
        backend.rpc("get_user_chats", &args).await
    }

    async fn fetch_one(
        &self,
        backend: &BackendClient,
        user_id: &str,
        key: &str,
    ) -> Result<Option<ChatSummary>, AppError> {
        let args = UserChatsArgs {
            user_id,
            chat_id_filter: Some(key),
        };
        let chats: Vec<ChatSummary> = backend.rpc("get_user_chats", &args).await?;
        Ok(chats.into_iter().next())
    }

    async fn fetch_unread_count(
        &self,
        backend: &BackendClient,
        user_id: &str,
    ) -> Result<i64, AppError> {
        backend
            .rpc("get_unread_message_count", &json!({ "user_id": user_id }))
            .await
    }
}

/// Most recent activity first; chats without messages last.
fn compare_chats(a: &ChatSummary, b: &ChatSummary) -> Ordering {
    let by_last = match (a.last_message_at, b.last_message_at) {
        (Some(x), Some(y)) => y.cmp(&x),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    };
    by_last
        .then_with(|| b.created_at.cmp(&a.created_at))
        .then_with(|| a.id.cmp(&b.id))
}

pub struct Messaging {
    inbox: Inbox<ChatSource>,
}

impl Messaging {
    pub fn new(backend: BackendClient, cache: Arc<KvCache>) -> Self {
        Self {
            inbox: Inbox::new(ChatSource, backend, cache),
        }
    }

    fn backend(&self) -> &BackendClient {
        self.inbox.backend()
    }

    /// The user's chats, freshest first. Replaces the local list.
    pub async fn fetch_chats(&self) -> Result<Vec<ChatSummary>, AppError> {
        self.inbox.refresh().await
    }

    /// Local copy of the chat list.
    pub async fn chats(&self) -> Vec<ChatSummary> {
        self.inbox.items().await
    }

    /// Messages of one chat, oldest first.
    pub async fn fetch_messages(&self, chat_id: &str) -> Result<Vec<Message>, AppError> {
        self.backend()
            .from("messages")
            .eq("chat_id", chat_id)
            .order("created_at", Direction::Asc)
            .fetch()
            .await
    }

    pub async fn send_message(
        &self,
        chat_id: &str,
        content: &str,
        message_type: MessageType,
    ) -> Result<Message, AppError> {
        let user = self.backend().require_user().await?;
        let content = content.trim();
        if content.is_empty() {
            return Err(AppError::Validation("Message cannot be empty".to_string()));
        }

        let message = NewMessage {
            chat_id: chat_id.to_string(),
            sender_id: user.id,
            content: content.to_string(),
            message_type,
        };
        let rows: Vec<Message> = self.backend().from("messages").insert(&message).await?;
        let sent = rows
            .into_iter()
            .next()
            .ok_or_else(|| AppError::Internal("Insert returned no message".to_string()))?;

        self.inbox
            .update_local(chat_id, |chat| {
                chat.last_message = Some(sent.content.clone());
                chat.last_message_at = Some(sent.created_at);
            })
            .await;
        Ok(sent)
    }

    /// Mark the other party's messages in a chat as read. Returns how many
    /// were marked; the unread total drops by exactly that many.
    pub async fn mark_chat_read(&self, chat_id: &str) -> Result<i64, AppError> {
        let user = self.backend().require_user().await?;
        let marked: i64 = self
            .backend()
            .rpc(
                "mark_messages_as_read",
                &json!({ "chat_id": chat_id, "user_id": user.id }),
            )
            .await?;

        let keys = [chat_id.to_string()];
        self.inbox.mark_read(Some(&keys[..]), marked).await;
        tracing::debug!("Marked {} message(s) read in {}", marked, chat_id);
        Ok(marked)
    }

    /// The buyer's chat with a seller about a product, created on first use.
    pub async fn get_or_create_chat(
        &self,
        seller_id: &str,
        product_id: &str,
    ) -> Result<Chat, AppError> {
        let user = self.backend().require_user().await?;
        if user.id == seller_id {
            return Err(AppError::Validation(
                "You cannot start a chat with yourself".to_string(),
            ));
        }
        self.backend()
            .rpc(
                "get_or_create_chat",
                &json!({
                    "buyer_id": user.id,
                    "seller_id": seller_id,
                    "product_id": product_id,
                }),
            )
            .await
    }

    pub async fn unread_count(&self) -> i64 {
        self.inbox.unread_count().await
    }

    pub async fn cached_unread_count(&self) -> i64 {
        self.inbox.cached_unread_count().await
    }

    pub async fn subscribe(&self) -> Result<(), AppError> {
        self.inbox.subscribe().await
    }

    pub async fn unsubscribe(&self) {
        self.inbox.unsubscribe().await;
    }

    pub fn is_subscribed(&self) -> bool {
        self.inbox.is_subscribed()
    }

    pub fn events(&self) -> broadcast::Receiver<InboxEvent<ChatSummary>> {
        self.inbox.events()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    fn chat(id: &str, created: i64, last: Option<i64>) -> ChatSummary {
        ChatSummary {
            id: id.to_string(),
            buyer_id: "b".to_string(),
            seller_id: "s".to_string(),
            product_id: "p".to_string(),
            last_message: None,
            last_message_at: last.map(|t| Utc.timestamp_opt(t, 0).unwrap()),
            created_at: Utc.timestamp_opt(created, 0).unwrap(),
            unread_count: 0,
            other_user_id: "s".to_string(),
            other_user_name: None,
            other_user_avatar: None,
            product_title: None,
            product_price: None,
            product_image: None,
        }
    }

    #[test]
    fn test_chat_order_nulls_last() {
        let mut chats = vec![
            chat("quiet-old", 10, None),
            chat("active-old", 1, Some(100)),
            chat("quiet-new", 20, None),
            chat("active-new", 2, Some(200)),
        ];
        ChatSource.sort(&mut chats);
        let ids: Vec<&str> = chats.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, ["active-new", "active-old", "quiet-new", "quiet-old"]);
    }

    #[test]
    fn test_chat_order_is_total() {
        let mut a = vec![chat("b", 5, Some(50)), chat("a", 5, Some(50))];
        let mut b = vec![chat("a", 5, Some(50)), chat("b", 5, Some(50))];
        ChatSource.sort(&mut a);
        ChatSource.sort(&mut b);
        assert_eq!(a, b);
    }

    #[test]
    fn test_realtime_covers_every_member_chat() {
        assert!(ChatSource.realtime_filter("u1").is_none());
        assert_eq!(
            ChatSource.key_for_record(&json!({"id": "m1", "chat_id": "c2"})),
            Some("c2".to_string())
        );
    }
}
