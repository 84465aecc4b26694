//! In-app notifications and push token registration.

use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::broadcast;

use super::backend::{BackendClient, ConflictMode};
use super::cache::KvCache;
use super::inbox::{Inbox, InboxEvent, InboxSource};
use crate::errors::AppError;
use crate::models::{Notification, PushToken};
use crate::query::{Direction, Filter, Operator};

pub const DEFAULT_NOTIFICATION_LIMIT: i64 = 50;

/// Notifications as an inbox: one item per notification row.
pub struct NotificationSource {
    limit: i64,
}

impl NotificationSource {
    async fn fetch(
        &self,
        backend: &BackendClient,
        user_id: &str,
        limit: i64,
    ) -> Result<Vec<Notification>, AppError> {
        backend
            .from("notifications")
            .eq("user_id", user_id)
            .order("created_at", Direction::Desc)
            .limit(limit)
            .fetch()
            .await
    }
}

impl InboxSource for NotificationSource {
    type Item = Notification;

    fn table(&self) -> &'static str {
        "notifications"
    }

    fn cache_key(&self, user_id: &str) -> String {
        format!("unread_notifications:{}", user_id)
    }

    fn item_key(&self, item: &Notification) -> String {
        item.id.clone()
    }

    fn unread_of(&self, item: &Notification) -> i64 {
        i64::from(!item.is_read)
    }

    fn clear_unread(&self, item: &mut Notification) {
        item.is_read = true;
    }

    fn realtime_filter(&self, user_id: &str) -> Option<Filter> {
        Some(Filter::new("user_id", Operator::Eq, user_id))
    }

    fn capacity(&self) -> Option<usize> {
        usize::try_from(self.limit).ok()
    }

    fn key_for_record(&self, record: &Value) -> Option<String> {
        record.get("id").and_then(Value::as_str).map(String::from)
    }

    fn sort(&self, items: &mut [Notification]) {
        items.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.id.cmp(&a.id)));
    }

    async fn fetch_items(
        &self,
        backend: &BackendClient,
        user_id: &str,
    ) -> Result<Vec<Notification>, AppError> {
        self.fetch(backend, user_id, self.limit).await
    }

    async fn fetch_one(
        &self,
        backend: &BackendClient,
        user_id: &str,
        key: &str,
    ) -> Result<Option<Notification>, AppError> {
        backend
            .from("notifications")
            .eq("user_id", user_id)
            .eq("id", key)
            .fetch_optional()
            .await
    }

    async fn fetch_unread_count(
        &self,
        backend: &BackendClient,
        user_id: &str,
    ) -> Result<i64, AppError> {
        backend
            .rpc(
                "get_unread_notification_count",
                &json!({ "user_id": user_id }),
            )
            .await
    }
}

pub struct Notifications {
    inbox: Inbox<NotificationSource>,
}

impl Notifications {
    pub fn new(backend: BackendClient, cache: Arc<KvCache>) -> Self {
        let source = NotificationSource {
            limit: DEFAULT_NOTIFICATION_LIMIT,
        };
        Self {
            inbox: Inbox::new(source, backend, cache),
        }
    }

    fn backend(&self) -> &BackendClient {
        self.inbox.backend()
    }

    /// Newest first. Without a limit the default page is fetched and
    /// becomes the local list.
    pub async fn fetch_notifications(&self, limit: Option<i64>) -> Result<Vec<Notification>, AppError> {
        match limit {
            None => self.inbox.refresh().await,
            Some(limit) => {
                let user = self.backend().require_user().await?;
                self.inbox
                    .source()
                    .fetch(self.backend(), &user.id, limit.max(1))
                    .await
            }
        }
    }

    pub async fn notifications(&self) -> Vec<Notification> {
        self.inbox.items().await
    }

    pub async fn unread_count(&self) -> i64 {
        self.inbox.unread_count().await
    }

    pub async fn cached_unread_count(&self) -> i64 {
        self.inbox.cached_unread_count().await
    }

    /// Mark the given notifications read. Returns how many changed.
    pub async fn mark_as_read(&self, ids: &[String]) -> Result<i64, AppError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let user = self.backend().require_user().await?;
        let marked: i64 = self
            .backend()
            .rpc(
                "mark_notifications_as_read",
                &json!({ "user_id": user.id, "notification_ids": ids }),
            )
            .await?;
        self.inbox.mark_read(Some(ids), marked).await;
        Ok(marked)
    }

    pub async fn mark_all_as_read(&self) -> Result<i64, AppError> {
        let user = self.backend().require_user().await?;
        let marked: i64 = self
            .backend()
            .rpc("mark_notifications_as_read", &json!({ "user_id": user.id }))
            .await?;
        self.inbox.mark_read(None, marked).await;
        Ok(marked)
    }

    /// Register this device for push. Re-registering a token moves it to
    /// the current user.
    pub async fn register_push_token(&self, token: &str, platform: &str) -> Result<PushToken, AppError> {
        let user = self.backend().require_user().await?;
        let token = token.trim();
        if token.is_empty() {
            return Err(AppError::Validation("Push token is empty".to_string()));
        }

        let rows: Vec<PushToken> = self
            .backend()
            .from("push_tokens")
            .upsert(
                &json!({ "user_id": user.id, "token": token, "platform": platform }),
                &["token"],
                ConflictMode::MergeDuplicates,
            )
            .await?;
        tracing::info!("Registered {} push token", platform);
        rows.into_iter()
            .next()
            .ok_or_else(|| AppError::Internal("Upsert returned no push token".to_string()))
    }

    pub async fn unregister_push_token(&self, token: &str) -> Result<(), AppError> {
        self.backend().require_user().await?;
        let _: Vec<PushToken> = self
            .backend()
            .from("push_tokens")
            .eq("token", token)
            .delete()
            .await?;
        Ok(())
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

    pub fn events(&self) -> broadcast::Receiver<InboxEvent<Notification>> {
        self.inbox.events()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NotificationType;
    use chrono::{TimeZone, Utc};

    fn notification(id: &str, at: i64, is_read: bool) -> Notification {
        Notification {
            id: id.to_string(),
            user_id: "u1".to_string(),
            title: "t".to_string(),
            body: "b".to_string(),
            notification_type: NotificationType::System,
            data: None,
            is_read,
            created_at: Utc.timestamp_opt(at, 0).unwrap(),
        }
    }

    #[test]
    fn test_unread_contribution() {
        let source = NotificationSource { limit: 10 };
        let mut n = notification("n1", 1, false);
        assert_eq!(source.unread_of(&n), 1);
        source.clear_unread(&mut n);
        assert_eq!(source.unread_of(&n), 0);
    }

    #[test]
    fn test_newest_first() {
        let source = NotificationSource { limit: 10 };
        let mut items = vec![
            notification("old", 1, false),
            notification("new", 3, true),
            notification("mid", 2, false),
        ];
        source.sort(&mut items);
        let ids: Vec<&str> = items.iter().map(|n| n.id.as_str()).collect();
        assert_eq!(ids, ["new", "mid", "old"]);
    }

    #[test]
    fn test_filter_targets_user() {
        let source = NotificationSource { limit: 10 };
        let filter = source.realtime_filter("u1").unwrap();
        assert_eq!(filter.to_string(), "user_id=eq.u1");
    }
}
