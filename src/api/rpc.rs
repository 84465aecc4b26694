//! Stored procedure endpoint: `POST /rest/v1/rpc/{name}`.

use axum::{
    extract::{Path, State},
    Json,
};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;

use super::AppState;
use crate::auth::MaybeUser;
use crate::db::schema;
use crate::errors::{log_ignored, AppError};
use crate::models::{AuthUser, OrderStatus, SearchParams};

#[derive(Debug, Deserialize)]
struct LimitArgs {
    #[serde(default = "default_limit")]
    limit_count: i64,
}

fn default_limit() -> i64 {
    10
}

#[derive(Debug, Deserialize)]
struct ProductArgs {
    product_id: String,
}

#[derive(Debug, Deserialize)]
struct UserArgs {
    user_id: String,
}

#[derive(Debug, Deserialize)]
struct UserChatsArgs {
    user_id: String,
    #[serde(default)]
    chat_id_filter: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatArgs {
    #[serde(default)]
    buyer_id: Option<String>,
    seller_id: String,
    product_id: String,
}

#[derive(Debug, Deserialize)]
struct MarkMessagesArgs {
    chat_id: String,
    user_id: String,
}

#[derive(Debug, Deserialize)]
struct MarkNotificationsArgs {
    user_id: String,
    #[serde(default)]
    notification_ids: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct OrderStatusArgs {
    order_id: String,
    new_status: OrderStatus,
}

fn args<T: DeserializeOwned>(value: Value) -> Result<T, AppError> {
    serde_json::from_value(value)
        .map_err(|e| AppError::BadRequest(format!("Invalid procedure arguments: {}", e)))
}

fn signed_in(user: Option<AuthUser>) -> Result<AuthUser, AppError> {
    user.ok_or_else(|| AppError::Unauthorized("Sign in required".to_string()))
}

/// Callers may only ask about themselves.
fn signed_in_as(user: Option<AuthUser>, claimed: &str) -> Result<AuthUser, AppError> {
    let user = signed_in(user)?;
    if user.id != claimed {
        return Err(AppError::Unauthorized(
            "user_id does not match the session".to_string(),
        ));
    }
    Ok(user)
}

/// POST /rest/v1/rpc/{name} - Call a stored procedure.
pub async fn call(
    State(state): State<AppState>,
    Path(name): Path<String>,
    MaybeUser(user): MaybeUser,
    Json(body): Json<Value>,
) -> Result<Json<Value>, AppError> {
    let repo = &state.repo;

    let result = match name.as_str() {
        "search_products" => {
            let params: SearchParams = args(body)?;
            serde_json::to_value(repo.search_products(&params, &state.search).await?)?
        }
        "get_trending_products" => {
            let a: LimitArgs = args(body)?;
            serde_json::to_value(repo.trending_products(a.limit_count).await?)?
        }
        "get_flash_deals" => {
            let a: LimitArgs = args(body)?;
            serde_json::to_value(repo.flash_deals(a.limit_count).await?)?
        }
        "increment_view_count" => {
            let a: ProductArgs = args(body)?;
            Value::from(repo.increment_view_count(&a.product_id).await?)
        }
        "get_user_profile" => {
            let a: UserArgs = args(body)?;
            serde_json::to_value(repo.user_profile(&a.user_id).await?)?
        }
        "get_user_chats" => {
            let a: UserChatsArgs = args(body)?;
            signed_in_as(user, &a.user_id)?;
            let chats = repo.user_chats(&a.user_id, a.chat_id_filter.as_deref()).await?;
            serde_json::to_value(chats)?
        }
        "get_or_create_chat" => {
            let a: ChatArgs = args(body)?;
            let me = match &a.buyer_id {
                Some(buyer) => signed_in_as(user, buyer)?,
                None => signed_in(user)?,
            };
            let (chat, created) = repo
                .get_or_create_chat(&me.id, &a.seller_id, &a.product_id)
                .await?;
            let chat = serde_json::to_value(chat)?;
            if created {
                state.hub.publish(schema::CHATS.name, chat.clone());
            }
            chat
        }
        "get_unread_message_count" => {
            let a: UserArgs = args(body)?;
            signed_in_as(user, &a.user_id)?;
            Value::from(repo.unread_message_count(&a.user_id).await?)
        }
        "mark_messages_as_read" => {
            let a: MarkMessagesArgs = args(body)?;
            signed_in_as(user, &a.user_id)?;
            Value::from(repo.mark_messages_as_read(&a.chat_id, &a.user_id).await?)
        }
        "get_unread_notification_count" => {
            let a: UserArgs = args(body)?;
            signed_in_as(user, &a.user_id)?;
            Value::from(repo.unread_notification_count(&a.user_id).await?)
        }
        "mark_notifications_as_read" => {
            let a: MarkNotificationsArgs = args(body)?;
            signed_in_as(user, &a.user_id)?;
            let marked = repo
                .mark_notifications_as_read(&a.user_id, a.notification_ids.as_deref())
                .await?;
            Value::from(marked)
        }
        "update_order_status" => {
            let a: OrderStatusArgs = args(body)?;
            let me = signed_in(user)?;
            let order = repo.update_order_status(&a.order_id, a.new_status, &me.id).await?;
            if let Some(notification) = log_ignored(
                "Order status notification",
                repo.fan_out_order_status(&order, &me.id).await,
            ) {
                state.hub.publish(schema::NOTIFICATIONS.name, notification);
            }
            serde_json::to_value(order)?
        }
        other => {
            return Err(AppError::NotFound(format!("Unknown procedure {}", other)));
        }
    };

    Ok(Json(result))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    fn user(id: &str) -> AuthUser {
        AuthUser {
            id: id.to_string(),
            email: format!("{}@campus.edu", id),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_signed_in_as() {
        assert!(signed_in_as(Some(user("a")), "a").is_ok());
        assert!(matches!(
            signed_in_as(Some(user("a")), "b"),
            Err(AppError::Unauthorized(_))
        ));
        assert!(matches!(signed_in_as(None, "a"), Err(AppError::Unauthorized(_))));
    }

    #[test]
    fn test_argument_decoding() {
        let a: LimitArgs = args(json!({})).unwrap();
        assert_eq!(a.limit_count, 10);
        let a: OrderStatusArgs = args(json!({"order_id": "o", "new_status": "shipped"})).unwrap();
        assert_eq!(a.new_status, OrderStatus::Shipped);
        assert!(matches!(
            args::<OrderStatusArgs>(json!({"order_id": "o", "new_status": "lost"})),
            Err(AppError::BadRequest(_))
        ));
    }
}
