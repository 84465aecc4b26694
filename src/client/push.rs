//! Map push payloads to in-app destinations.

use serde_json::Value;

use crate::models::{Notification, NotificationType, PushPayload};

/// Where a tapped notification should take the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Chat { chat_id: String },
    Order { order_id: String },
    Product { product_id: String },
    Profile { user_id: String },
    Notifications,
}

impl Route {
    pub fn path(&self) -> String {
        match self {
            Route::Chat { chat_id } => format!("/chats/{}", chat_id),
            Route::Order { order_id } => format!("/orders/{}", order_id),
            Route::Product { product_id } => format!("/products/{}", product_id),
            Route::Profile { user_id } => format!("/users/{}", user_id),
            Route::Notifications => "/notifications".to_string(),
        }
    }
}

pub struct PushRouter;

impl PushRouter {
    /// The payload's declared type picks the route; without one, the first
    /// id present does. Anything unusable lands on the notification list.
    pub fn route(payload: &PushPayload) -> Route {
        let data = &payload.data;
        let kind = text(data, "notification_type").or_else(|| text(data, "type"));

        let routed = match kind.as_deref() {
            Some("message") => chat(data),
            Some("order") => order(data),
            Some("review") => product(data).or_else(|| profile(data)),
            Some("verification") => profile(data),
            Some(_) => None,
            None => chat(data)
                .or_else(|| order(data))
                .or_else(|| product(data))
                .or_else(|| profile(data)),
        };
        routed.unwrap_or(Route::Notifications)
    }

    /// Route for an in-app notification row.
    pub fn route_notification(notification: &Notification) -> Route {
        let mut data = notification.data.clone().unwrap_or(Value::Null);
        if let Value::Object(map) = &mut data {
            map.entry("notification_type").or_insert_with(|| {
                Value::String(notification.notification_type.as_str().to_string())
            });
        } else {
            data = serde_json::json!({
                "notification_type": notification.notification_type.as_str()
            });
        }
        if notification.notification_type == NotificationType::Verification {
            if let Value::Object(map) = &mut data {
                map.entry("user_id")
                    .or_insert_with(|| Value::String(notification.user_id.clone()));
            }
        }

        Self::route(&PushPayload {
            title: Some(notification.title.clone()),
            body: Some(notification.body.clone()),
            data,
        })
    }
}

fn text(data: &Value, key: &str) -> Option<String> {
    match data.get(key)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn chat(data: &Value) -> Option<Route> {
    text(data, "chat_id").map(|chat_id| Route::Chat { chat_id })
}

fn order(data: &Value) -> Option<Route> {
    text(data, "order_id").map(|order_id| Route::Order { order_id })
}

fn product(data: &Value) -> Option<Route> {
    text(data, "product_id").map(|product_id| Route::Product { product_id })
}

fn profile(data: &Value) -> Option<Route> {
    text(data, "user_id").map(|user_id| Route::Profile { user_id })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    fn payload(data: Value) -> PushPayload {
        PushPayload {
            title: None,
            body: None,
            data,
        }
    }

    #[test]
    fn test_declared_type_wins() {
        let route = PushRouter::route(&payload(json!({
            "type": "order",
            "order_id": "o1",
            "chat_id": "c1",
        })));
        assert_eq!(
            route,
            Route::Order {
                order_id: "o1".to_string()
            }
        );
        assert_eq!(route.path(), "/orders/o1");
    }

    #[test]
    fn test_untyped_payload_uses_first_id() {
        let route = PushRouter::route(&payload(json!({"product_id": "p1", "user_id": "u1"})));
        assert_eq!(
            route,
            Route::Product {
                product_id: "p1".to_string()
            }
        );
    }

    #[test]
    fn test_fallback_to_notifications() {
        assert_eq!(PushRouter::route(&payload(Value::Null)), Route::Notifications);
        assert_eq!(
            PushRouter::route(&payload(json!({"notification_type": "message"}))),
            Route::Notifications
        );
        assert_eq!(
            PushRouter::route(&payload(json!({"notification_type": "system", "chat_id": "c"}))),
            Route::Notifications
        );
    }

    #[test]
    fn test_route_notification_row() {
        let notification = Notification {
            id: "n1".to_string(),
            user_id: "u1".to_string(),
            title: "New message".to_string(),
            body: "hi".to_string(),
            notification_type: NotificationType::Message,
            data: Some(json!({"chat_id": "c9"})),
            is_read: false,
            created_at: Utc::now(),
        };
        assert_eq!(PushRouter::route_notification(&notification).path(), "/chats/c9");

        let verification = Notification {
            notification_type: NotificationType::Verification,
            data: None,
            ..notification
        };
        assert_eq!(
            PushRouter::route_notification(&verification),
            Route::Profile {
                user_id: "u1".to_string()
            }
        );
    }
}
