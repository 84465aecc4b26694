//! Stored procedures served under `/rest/v1/rpc/{name}`, plus the
//! notification fan-out that follows inserts.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use super::schema::{Column, CHATS, NOTIFICATIONS, ORDERS, PRODUCTS, USERS};
use super::{bind_values, column_list, now_timestamp, row_to_json, BindValue, Conflict, Repository};
use crate::errors::AppError;
use crate::models::{
    Chat, ChatSummary, NotificationType, Order, OrderStatus, Product, SearchParams, SortBy, User,
    UserProfile,
};
use crate::query::{Filter, Operator, RowQuery};
use crate::search::ProductIndex;

/// Upper bound on index hits considered before SQL filtering.
const SEARCH_CANDIDATES: usize = 500;
const MAX_PAGE: i64 = 100;
const PREVIEW_CHARS: usize = 100;

impl Repository {
    /// Full-text search with filters, sorting and pagination.
    pub async fn search_products(
        &self,
        params: &SearchParams,
        index: &ProductIndex,
    ) -> Result<Vec<Product>, AppError> {
        if let (Some(min), Some(max)) = (params.min_price, params.max_price) {
            if min > max {
                return Err(AppError::Validation(
                    "min_price cannot exceed max_price".to_string(),
                ));
            }
        }

        let text = params.search_query.trim();
        let scores: Option<HashMap<String, f32>> = if text.is_empty() {
            None
        } else {
            let hits = index.search(text, SEARCH_CANDIDATES)?;
            Some(hits.into_iter().map(|h| (h.product_id, h.score)).collect())
        };
        if scores.as_ref().is_some_and(HashMap::is_empty) {
            return Ok(Vec::new());
        }

        let columns: Vec<&Column> = PRODUCTS.columns.iter().collect();
        let mut sql = format!(
            "SELECT {} FROM products WHERE status = 'active'",
            column_list(&columns)
        );
        let mut binds = Vec::new();
        if let Some(category) = &params.category_filter {
            sql.push_str(" AND category = ?");
            binds.push(BindValue::Text(category.clone()));
        }
        if let Some(min) = params.min_price {
            sql.push_str(" AND price >= ?");
            binds.push(BindValue::Real(min));
        }
        if let Some(max) = params.max_price {
            sql.push_str(" AND price <= ?");
            binds.push(BindValue::Real(max));
        }
        if let Some(condition) = params.condition_filter {
            sql.push_str(" AND condition = ?");
            binds.push(BindValue::Text(condition.as_str().to_string()));
        }
        if let Some(scores) = &scores {
            sql.push_str(&format!(
                " AND id IN ({})",
                vec!["?"; scores.len()].join(", ")
            ));
            binds.extend(scores.keys().cloned().map(BindValue::Text));
        }

        let rows = bind_values(sqlx::query(&sql), &binds)
            .fetch_all(self.pool())
            .await?;
        let mut products = decode_products(&rows)?;

        let score = |p: &Product| {
            scores
                .as_ref()
                .and_then(|s| s.get(&p.id).copied())
                .unwrap_or(0.0)
        };
        match params.sort_by {
            SortBy::Relevance => products.sort_by(|a, b| {
                score(b)
                    .total_cmp(&score(a))
                    .then_with(|| b.created_at.cmp(&a.created_at))
            }),
            SortBy::PriceAsc => products.sort_by(|a, b| a.price.total_cmp(&b.price)),
            SortBy::PriceDesc => products.sort_by(|a, b| b.price.total_cmp(&a.price)),
            SortBy::Newest => products.sort_by(|a, b| b.created_at.cmp(&a.created_at)),
            SortBy::Popular => products.sort_by(|a, b| {
                b.popularity()
                    .cmp(&a.popularity())
                    .then_with(|| b.created_at.cmp(&a.created_at))
            }),
        }

        let limit = params.limit_count.clamp(1, MAX_PAGE) as usize;
        let offset = params.offset_count.max(0) as usize;
        Ok(products.into_iter().skip(offset).take(limit).collect())
    }

    /// Active products by views plus twice the saves.
    pub async fn trending_products(&self, limit: i64) -> Result<Vec<Product>, AppError> {
        let columns: Vec<&Column> = PRODUCTS.columns.iter().collect();
        let sql = format!(
            r#"
            SELECT {} FROM products
            WHERE status = 'active'
            ORDER BY (view_count + 2 * save_count) DESC, created_at DESC, rowid
            LIMIT ?
            "#,
            column_list(&columns)
        );
        let rows = sqlx::query(&sql)
            .bind(limit.clamp(1, MAX_PAGE))
            .fetch_all(self.pool())
            .await?;
        decode_products(&rows)
    }

    /// Active flash deals that have not ended, soonest ending first.
    pub async fn flash_deals(&self, limit: i64) -> Result<Vec<Product>, AppError> {
        let columns: Vec<&Column> = PRODUCTS.columns.iter().collect();
        let sql = format!(
            r#"
            SELECT {} FROM products
            WHERE status = 'active'
              AND is_flash_deal = 1
              AND (flash_deal_ends_at IS NULL OR flash_deal_ends_at > ?)
            ORDER BY flash_deal_ends_at ASC NULLS LAST, created_at DESC, rowid
            LIMIT ?
            "#,
            column_list(&columns)
        );
        let rows = sqlx::query(&sql)
            .bind(now_timestamp())
            .bind(limit.clamp(1, MAX_PAGE))
            .fetch_all(self.pool())
            .await?;
        decode_products(&rows)
    }

    /// Bump the view counter and return the new value.
    pub async fn increment_view_count(&self, product_id: &str) -> Result<i64, AppError> {
        let row = sqlx::query(
            "UPDATE products SET view_count = view_count + 1 WHERE id = ? RETURNING view_count",
        )
        .bind(product_id)
        .fetch_optional(self.pool())
        .await?;

        match row {
            Some(row) => Ok(row.try_get("view_count")?),
            None => Err(AppError::NotFound(format!("Product {} not found", product_id))),
        }
    }

    /// Profile with listing and review statistics.
    pub async fn user_profile(&self, user_id: &str) -> Result<UserProfile, AppError> {
        let user: User = self
            .fetch_by_id(&USERS, user_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("User {} not found", user_id)))?;

        let listings = sqlx::query(
            r#"
            SELECT COUNT(*) AS products_count,
                   COALESCE(SUM(status = 'active'), 0) AS active_listings,
                   COALESCE(SUM(status = 'sold'), 0) AS sold_count
            FROM products WHERE seller_id = ?
            "#,
        )
        .bind(user_id)
        .fetch_one(self.pool())
        .await?;

        let reviews = sqlx::query(
            r#"
            SELECT COUNT(*) AS reviews_count, AVG(rating) AS average_rating
            FROM product_reviews WHERE seller_id = ?
            "#,
        )
        .bind(user_id)
        .fetch_one(self.pool())
        .await?;

        Ok(UserProfile {
            user,
            products_count: listings.try_get("products_count")?,
            active_listings: listings.try_get("active_listings")?,
            sold_count: listings.try_get("sold_count")?,
            reviews_count: reviews.try_get("reviews_count")?,
            average_rating: reviews.try_get("average_rating")?,
        })
    }

    /// Chat list for a member, most recent activity first.
    pub async fn user_chats(
        &self,
        user_id: &str,
        chat_id: Option<&str>,
    ) -> Result<Vec<ChatSummary>, AppError> {
        let rows = sqlx::query(
            r#"
            SELECT c.id, c.buyer_id, c.seller_id, c.product_id,
                   c.last_message, c.last_message_at, c.created_at,
                   (SELECT COUNT(*) FROM messages m
                    WHERE m.chat_id = c.id AND m.sender_id <> ? AND m.is_read = 0) AS unread_count,
                   CASE WHEN c.buyer_id = ? THEN c.seller_id ELSE c.buyer_id END AS other_user_id,
                   u.full_name AS other_user_name,
                   u.avatar_url AS other_user_avatar,
                   p.title AS product_title,
                   p.price AS product_price,
                   json_extract(p.images, '$[0]') AS product_image
            FROM chats c
            LEFT JOIN users u
                ON u.id = CASE WHEN c.buyer_id = ? THEN c.seller_id ELSE c.buyer_id END
            LEFT JOIN products p ON p.id = c.product_id
            WHERE (c.buyer_id = ? OR c.seller_id = ?)
              AND (? IS NULL OR c.id = ?)
            ORDER BY c.last_message_at DESC NULLS LAST, c.created_at DESC, c.id
            "#,
        )
        .bind(user_id)
        .bind(user_id)
        .bind(user_id)
        .bind(user_id)
        .bind(user_id)
        .bind(chat_id)
        .bind(chat_id)
        .fetch_all(self.pool())
        .await?;

        rows.iter()
            .map(|row| {
                Ok(ChatSummary {
                    id: row.try_get("id")?,
                    buyer_id: row.try_get("buyer_id")?,
                    seller_id: row.try_get("seller_id")?,
                    product_id: row.try_get("product_id")?,
                    last_message: row.try_get("last_message")?,
                    last_message_at: row.try_get::<Option<DateTime<Utc>>, _>("last_message_at")?,
                    created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
                    unread_count: row.try_get("unread_count")?,
                    other_user_id: row.try_get("other_user_id")?,
                    other_user_name: row.try_get("other_user_name")?,
                    other_user_avatar: row.try_get("other_user_avatar")?,
                    product_title: row.try_get("product_title")?,
                    product_price: row.try_get("product_price")?,
                    product_image: row.try_get("product_image")?,
                })
            })
            .collect()
    }

    /// The chat for (buyer, seller, product), and whether it was just created.
    pub async fn get_or_create_chat(
        &self,
        buyer_id: &str,
        seller_id: &str,
        product_id: &str,
    ) -> Result<(Chat, bool), AppError> {
        if buyer_id == seller_id {
            return Err(AppError::Validation(
                "You cannot start a chat with yourself".to_string(),
            ));
        }

        let owner: Option<String> = sqlx::query_scalar("SELECT seller_id FROM products WHERE id = ?")
            .bind(product_id)
            .fetch_optional(self.pool())
            .await?;
        match owner {
            None => return Err(AppError::NotFound(format!("Product {} not found", product_id))),
            Some(owner) if owner != seller_id => {
                return Err(AppError::Validation(
                    "Seller does not own this product".to_string(),
                ))
            }
            Some(_) => {}
        }

        let created = sqlx::query(
            r#"
            INSERT INTO chats (id, buyer_id, seller_id, product_id, created_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT (buyer_id, seller_id, product_id) DO NOTHING
            "#,
        )
        .bind(uuid::Uuid::new_v4().to_string())
        .bind(buyer_id)
        .bind(seller_id)
        .bind(product_id)
        .bind(now_timestamp())
        .execute(self.pool())
        .await?
        .rows_affected()
            > 0;

        let query = RowQuery {
            filters: vec![
                Filter::new("buyer_id", Operator::Eq, buyer_id),
                Filter::new("seller_id", Operator::Eq, seller_id),
                Filter::new("product_id", Operator::Eq, product_id),
            ],
            limit: Some(1),
            ..RowQuery::default()
        };
        let chat = self
            .select_as::<Chat>(&CHATS, &query)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| AppError::Internal("Chat vanished after insert".to_string()))?;

        if created {
            tracing::info!("Created chat {} for product {}", chat.id, product_id);
        }
        Ok((chat, created))
    }

    /// Messages sent to the user that are still unread, across all chats.
    pub async fn unread_message_count(&self, user_id: &str) -> Result<i64, AppError> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM messages m
            JOIN chats c ON c.id = m.chat_id
            WHERE (c.buyer_id = ? OR c.seller_id = ?)
              AND m.sender_id <> ?
              AND m.is_read = 0
            "#,
        )
        .bind(user_id)
        .bind(user_id)
        .bind(user_id)
        .fetch_one(self.pool())
        .await?;
        Ok(count)
    }

    /// Mark the other party's messages in a chat as read. Returns rows marked.
    pub async fn mark_messages_as_read(&self, chat_id: &str, user_id: &str) -> Result<i64, AppError> {
        let chat: Chat = self
            .fetch_by_id(&CHATS, chat_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Chat {} not found", chat_id)))?;
        if chat.buyer_id != user_id && chat.seller_id != user_id {
            return Err(AppError::Unauthorized("Not a member of this chat".to_string()));
        }

        let result = sqlx::query(
            "UPDATE messages SET is_read = 1 WHERE chat_id = ? AND sender_id <> ? AND is_read = 0",
        )
        .bind(chat_id)
        .bind(user_id)
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected() as i64)
    }

    pub async fn unread_notification_count(&self, user_id: &str) -> Result<i64, AppError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM notifications WHERE user_id = ? AND is_read = 0",
        )
        .bind(user_id)
        .fetch_one(self.pool())
        .await?;
        Ok(count)
    }

    /// Mark the given notifications (or all of them) as read. Returns rows marked.
    pub async fn mark_notifications_as_read(
        &self,
        user_id: &str,
        ids: Option<&[String]>,
    ) -> Result<i64, AppError> {
        let mut sql =
            "UPDATE notifications SET is_read = 1 WHERE user_id = ? AND is_read = 0".to_string();
        let mut binds = vec![BindValue::Text(user_id.to_string())];
        if let Some(ids) = ids {
            if ids.is_empty() {
                return Ok(0);
            }
            sql.push_str(&format!(" AND id IN ({})", vec!["?"; ids.len()].join(", ")));
            binds.extend(ids.iter().cloned().map(BindValue::Text));
        }

        let result = bind_values(sqlx::query(&sql), &binds)
            .execute(self.pool())
            .await?;
        Ok(result.rows_affected() as i64)
    }

    /// Move an order along its lifecycle and update the product to match.
    pub async fn update_order_status(
        &self,
        order_id: &str,
        next: OrderStatus,
        actor_id: &str,
    ) -> Result<Order, AppError> {
        let order: Order = self
            .fetch_by_id(&ORDERS, order_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Order {} not found", order_id)))?;

        let permitted = match next {
            OrderStatus::Cancelled => actor_id == order.buyer_id || actor_id == order.seller_id,
            _ => actor_id == order.seller_id,
        };
        if !permitted {
            return Err(AppError::Unauthorized(format!(
                "Not allowed to mark this order {}",
                next.as_str()
            )));
        }
        if !order.status.can_transition_to(next) {
            return Err(AppError::Validation(format!(
                "Cannot move order from {} to {}",
                order.status.as_str(),
                next.as_str()
            )));
        }

        let now = now_timestamp();
        let mut tx = self.pool().begin().await?;

        let updated = sqlx::query(
            "UPDATE orders SET status = ?, updated_at = ? WHERE id = ? AND status = ?",
        )
        .bind(next.as_str())
        .bind(&now)
        .bind(order_id)
        .bind(order.status.as_str())
        .execute(&mut *tx)
        .await?;
        if updated.rows_affected() == 0 {
            return Err(AppError::Conflict(
                "Order status changed concurrently".to_string(),
            ));
        }

        let product_update = match next {
            OrderStatus::Confirmed => Some(("reserved", "active")),
            OrderStatus::Delivered => Some(("sold", "reserved")),
            OrderStatus::Cancelled => Some(("active", "reserved")),
            _ => None,
        };
        if let Some((status, from)) = product_update {
            sqlx::query("UPDATE products SET status = ?, updated_at = ? WHERE id = ? AND status = ?")
                .bind(status)
                .bind(&now)
                .bind(&order.product_id)
                .bind(from)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;

        tracing::info!(
            "Order {} moved from {} to {}",
            order_id,
            order.status.as_str(),
            next.as_str()
        );

        self.fetch_by_id(&ORDERS, order_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Order {} not found", order_id)))
    }

    /// Notifications owed for a freshly inserted row. Returns the inserted notifications.
    pub async fn fan_out_insert(&self, table: &str, record: &Value) -> Result<Vec<Value>, AppError> {
        let field = |name: &str| record.get(name).and_then(Value::as_str).map(str::to_string);

        match table {
            "messages" => {
                let (Some(chat_id), Some(sender_id), Some(message_id)) =
                    (field("chat_id"), field("sender_id"), field("id"))
                else {
                    return Ok(Vec::new());
                };
                let Some(chat) = self.fetch_by_id::<Chat>(&CHATS, &chat_id).await? else {
                    return Ok(Vec::new());
                };
                let recipient = if chat.buyer_id == sender_id {
                    chat.seller_id
                } else {
                    chat.buyer_id
                };
                let sender = self.display_name(&sender_id).await?;
                let preview: String = field("content")
                    .unwrap_or_default()
                    .chars()
                    .take(PREVIEW_CHARS)
                    .collect();
                let notification = self
                    .notify(
                        &recipient,
                        NotificationType::Message,
                        format!("New message from {}", sender),
                        preview,
                        json!({ "chat_id": chat_id, "message_id": message_id }),
                    )
                    .await?;
                Ok(vec![notification])
            }
            "orders" => {
                let (Some(order_id), Some(buyer_id), Some(seller_id), Some(product_id)) = (
                    field("id"),
                    field("buyer_id"),
                    field("seller_id"),
                    field("product_id"),
                ) else {
                    return Ok(Vec::new());
                };
                let buyer = self.display_name(&buyer_id).await?;
                let title = self.product_title(&product_id).await?;
                let notification = self
                    .notify(
                        &seller_id,
                        NotificationType::Order,
                        "New order".to_string(),
                        format!("{} ordered {}", buyer, title),
                        json!({ "order_id": order_id, "product_id": product_id }),
                    )
                    .await?;
                Ok(vec![notification])
            }
            "product_reviews" => {
                let (Some(review_id), Some(reviewer_id), Some(seller_id), Some(product_id)) = (
                    field("id"),
                    field("reviewer_id"),
                    field("seller_id"),
                    field("product_id"),
                ) else {
                    return Ok(Vec::new());
                };
                let rating = record.get("rating").and_then(Value::as_i64).unwrap_or(0);
                let reviewer = self.display_name(&reviewer_id).await?;
                let title = self.product_title(&product_id).await?;
                let notification = self
                    .notify(
                        &seller_id,
                        NotificationType::Review,
                        "New review".to_string(),
                        format!("{} rated {} {} out of 5", reviewer, title, rating),
                        json!({ "review_id": review_id, "product_id": product_id }),
                    )
                    .await?;
                Ok(vec![notification])
            }
            _ => Ok(Vec::new()),
        }
    }

    /// Tell the other party about an order status change.
    pub async fn fan_out_order_status(&self, order: &Order, actor_id: &str) -> Result<Value, AppError> {
        let recipient = if actor_id == order.seller_id {
            &order.buyer_id
        } else {
            &order.seller_id
        };
        let title = self.product_title(&order.product_id).await?;
        self.notify(
            recipient,
            NotificationType::Order,
            format!("Order {}", order.status.as_str()),
            format!("Your order for {} is now {}", title, order.status.as_str()),
            json!({ "order_id": order.id, "status": order.status.as_str() }),
        )
        .await
    }

    async fn notify(
        &self,
        user_id: &str,
        kind: NotificationType,
        title: String,
        body: String,
        data: Value,
    ) -> Result<Value, AppError> {
        let mut row = Map::new();
        row.insert("user_id".to_string(), Value::String(user_id.to_string()));
        row.insert("title".to_string(), Value::String(title));
        row.insert("body".to_string(), Value::String(body));
        row.insert(
            "notification_type".to_string(),
            Value::String(kind.as_str().to_string()),
        );
        row.insert("data".to_string(), data);

        self.insert_rows(&NOTIFICATIONS, vec![row], Conflict::Error, None)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| AppError::Internal("Notification insert returned nothing".to_string()))
    }

    async fn display_name(&self, user_id: &str) -> Result<String, AppError> {
        let name: Option<String> = sqlx::query_scalar("SELECT full_name FROM users WHERE id = ?")
            .bind(user_id)
            .fetch_optional(self.pool())
            .await?;
        Ok(name.unwrap_or_else(|| "Someone".to_string()))
    }

    async fn product_title(&self, product_id: &str) -> Result<String, AppError> {
        let title: Option<String> = sqlx::query_scalar("SELECT title FROM products WHERE id = ?")
            .bind(product_id)
            .fetch_optional(self.pool())
            .await?;
        Ok(title.unwrap_or_else(|| "a listing".to_string()))
    }
}

fn decode_products(rows: &[SqliteRow]) -> Result<Vec<Product>, AppError> {
    let columns: Vec<&Column> = PRODUCTS.columns.iter().collect();
    rows.iter()
        .map(|row| Ok(serde_json::from_value(row_to_json(row, &columns)?)?))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_database;
    use crate::db::schema::{MESSAGES, PRODUCT_REVIEWS};
    use crate::models::SignUpMetadata;
    use tempfile::TempDir;

    struct Fixture {
        repo: Repository,
        index: ProductIndex,
        _dir: TempDir,
    }

    async fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let pool = init_database(&dir.path().join("test.sqlite")).await.unwrap();
        let index = ProductIndex::open(&dir.path().join("index")).unwrap();
        Fixture {
            repo: Repository::new(pool),
            index,
            _dir: dir,
        }
    }

    async fn account(repo: &Repository, name: &str) -> String {
        let metadata = SignUpMetadata {
            full_name: name.to_string(),
            ..SignUpMetadata::default()
        };
        repo.create_account(&format!("{}@campus.edu", name.to_lowercase()), "hash", &metadata)
            .await
            .unwrap()
            .id
    }

    async fn listing(repo: &Repository, seller: &str, title: &str, price: f64) -> Product {
        let row = json!({
            "seller_id": seller,
            "title": title,
            "description": "",
            "price": price,
            "category": "books",
            "condition": "good"
        });
        let inserted = repo
            .insert_rows(&PRODUCTS, vec![row.as_object().unwrap().clone()], Conflict::Error, None)
            .await
            .unwrap();
        serde_json::from_value(inserted[0].clone()).unwrap()
    }

    async fn message(repo: &Repository, chat_id: &str, sender: &str, content: &str) -> Value {
        let row = json!({"chat_id": chat_id, "sender_id": sender, "content": content});
        repo.insert_rows(&MESSAGES, vec![row.as_object().unwrap().clone()], Conflict::Error, None)
            .await
            .unwrap()
            .remove(0)
    }

    #[tokio::test]
    async fn test_chat_is_unique_per_triple() {
        let f = fixture().await;
        let seller = account(&f.repo, "Sam").await;
        let buyer = account(&f.repo, "Bea").await;
        let product = listing(&f.repo, &seller, "Bike", 50.0).await;

        let (first, created) = f.repo.get_or_create_chat(&buyer, &seller, &product.id).await.unwrap();
        assert!(created);
        let (second, created) = f.repo.get_or_create_chat(&buyer, &seller, &product.id).await.unwrap();
        assert!(!created);
        assert_eq!(first.id, second.id);

        let err = f.repo.get_or_create_chat(&seller, &seller, &product.id).await.unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[tokio::test]
    async fn test_unread_counts_and_mark_read() {
        let f = fixture().await;
        let seller = account(&f.repo, "Sam").await;
        let buyer = account(&f.repo, "Bea").await;
        let product = listing(&f.repo, &seller, "Bike", 50.0).await;
        let (chat, _) = f.repo.get_or_create_chat(&buyer, &seller, &product.id).await.unwrap();

        message(&f.repo, &chat.id, &buyer, "Is it available?").await;
        message(&f.repo, &chat.id, &buyer, "Hello?").await;
        message(&f.repo, &chat.id, &seller, "Yes").await;

        assert_eq!(f.repo.unread_message_count(&seller).await.unwrap(), 2);
        assert_eq!(f.repo.unread_message_count(&buyer).await.unwrap(), 1);

        let chats = f.repo.user_chats(&seller, None).await.unwrap();
        assert_eq!(chats.len(), 1);
        assert_eq!(chats[0].unread_count, 2);
        assert_eq!(chats[0].other_user_id, buyer);
        assert_eq!(chats[0].other_user_name.as_deref(), Some("Bea"));
        assert_eq!(chats[0].last_message.as_deref(), Some("Yes"));

        assert_eq!(f.repo.mark_messages_as_read(&chat.id, &seller).await.unwrap(), 2);
        assert_eq!(f.repo.mark_messages_as_read(&chat.id, &seller).await.unwrap(), 0);
        assert_eq!(f.repo.unread_message_count(&seller).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_chat_list_orders_by_activity_nulls_last() {
        let f = fixture().await;
        let seller = account(&f.repo, "Sam").await;
        let buyer = account(&f.repo, "Bea").await;
        let quiet = listing(&f.repo, &seller, "Lamp", 5.0).await;
        let busy = listing(&f.repo, &seller, "Desk", 40.0).await;

        let (quiet_chat, _) = f.repo.get_or_create_chat(&buyer, &seller, &quiet.id).await.unwrap();
        let (busy_chat, _) = f.repo.get_or_create_chat(&buyer, &seller, &busy.id).await.unwrap();
        message(&f.repo, &busy_chat.id, &buyer, "Still for sale?").await;

        let chats = f.repo.user_chats(&buyer, None).await.unwrap();
        let ids: Vec<&str> = chats.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec![busy_chat.id.as_str(), quiet_chat.id.as_str()]);

        let only = f.repo.user_chats(&buyer, Some(&quiet_chat.id)).await.unwrap();
        assert_eq!(only.len(), 1);
        assert_eq!(only[0].id, quiet_chat.id);
    }

    #[tokio::test]
    async fn test_order_lifecycle_moves_product() {
        let f = fixture().await;
        let seller = account(&f.repo, "Sam").await;
        let buyer = account(&f.repo, "Bea").await;
        let product = listing(&f.repo, &seller, "Bike", 50.0).await;

        let row = json!({
            "buyer_id": buyer, "seller_id": seller, "product_id": product.id,
            "quantity": 1, "total_amount": 50.0
        });
        let order: Order = serde_json::from_value(
            f.repo
                .insert_rows(&ORDERS, vec![row.as_object().unwrap().clone()], Conflict::Error, None)
                .await
                .unwrap()
                .remove(0),
        )
        .unwrap();
        assert_eq!(order.status, OrderStatus::Pending);

        let err = f
            .repo
            .update_order_status(&order.id, OrderStatus::Confirmed, &buyer)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Unauthorized(_)));

        let err = f
            .repo
            .update_order_status(&order.id, OrderStatus::Shipped, &seller)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));

        let confirmed = f
            .repo
            .update_order_status(&order.id, OrderStatus::Confirmed, &seller)
            .await
            .unwrap();
        assert_eq!(confirmed.status, OrderStatus::Confirmed);
        let reserved: Product = f.repo.fetch_by_id(&PRODUCTS, &product.id).await.unwrap().unwrap();
        assert_eq!(reserved.status.as_str(), "reserved");

        f.repo
            .update_order_status(&order.id, OrderStatus::Cancelled, &buyer)
            .await
            .unwrap();
        let active: Product = f.repo.fetch_by_id(&PRODUCTS, &product.id).await.unwrap().unwrap();
        assert_eq!(active.status.as_str(), "active");
    }

    #[tokio::test]
    async fn test_search_filters_and_sorts() {
        let f = fixture().await;
        let seller = account(&f.repo, "Sam").await;
        let cheap = listing(&f.repo, &seller, "Physics textbook", 15.0).await;
        let pricey = listing(&f.repo, &seller, "Chemistry textbook", 60.0).await;
        listing(&f.repo, &seller, "Desk chair", 25.0).await;

        let all: Vec<Product> = f.repo.select_as(&PRODUCTS, &RowQuery::default()).await.unwrap();
        f.index.rebuild(&all).await.unwrap();

        let mut params = SearchParams::new("textbook");
        params.sort_by = SortBy::PriceAsc;
        let found = f.repo.search_products(&params, &f.index).await.unwrap();
        let ids: Vec<&str> = found.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec![cheap.id.as_str(), pricey.id.as_str()]);

        params.max_price = Some(20.0);
        let found = f.repo.search_products(&params, &f.index).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, cheap.id);

        params.min_price = Some(30.0);
        assert!(matches!(
            f.repo.search_products(&params, &f.index).await,
            Err(AppError::Validation(_))
        ));

        let none = f
            .repo
            .search_products(&SearchParams::new("skateboard"), &f.index)
            .await
            .unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn test_trending_and_profile_stats() {
        let f = fixture().await;
        let seller = account(&f.repo, "Sam").await;
        let reviewer = account(&f.repo, "Rae").await;
        let a = listing(&f.repo, &seller, "Kettle", 10.0).await;
        let b = listing(&f.repo, &seller, "Toaster", 12.0).await;

        f.repo.increment_view_count(&b.id).await.unwrap();
        assert_eq!(f.repo.increment_view_count(&b.id).await.unwrap(), 2);
        assert!(matches!(
            f.repo.increment_view_count("missing").await,
            Err(AppError::NotFound(_))
        ));

        let trending = f.repo.trending_products(10).await.unwrap();
        assert_eq!(trending[0].id, b.id);
        assert_eq!(trending[1].id, a.id);

        let review = json!({"product_id": a.id, "reviewer_id": reviewer, "seller_id": seller, "rating": 4});
        let inserted = f
            .repo
            .insert_rows(&PRODUCT_REVIEWS, vec![review.as_object().unwrap().clone()], Conflict::Error, None)
            .await
            .unwrap();
        let notes = f.repo.fan_out_insert("product_reviews", &inserted[0]).await.unwrap();
        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0]["user_id"], json!(seller));

        let profile = f.repo.user_profile(&seller).await.unwrap();
        assert_eq!(profile.products_count, 2);
        assert_eq!(profile.active_listings, 2);
        assert_eq!(profile.reviews_count, 1);
        assert_eq!(profile.average_rating, Some(4.0));
        assert_eq!(profile.user.rating, 4.0);
    }

    #[tokio::test]
    async fn test_message_fan_out_targets_recipient() {
        let f = fixture().await;
        let seller = account(&f.repo, "Sam").await;
        let buyer = account(&f.repo, "Bea").await;
        let product = listing(&f.repo, &seller, "Bike", 50.0).await;
        let (chat, _) = f.repo.get_or_create_chat(&buyer, &seller, &product.id).await.unwrap();

        let record = message(&f.repo, &chat.id, &buyer, "Hi").await;
        let notes = f.repo.fan_out_insert("messages", &record).await.unwrap();
        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0]["user_id"], json!(seller));
        assert_eq!(notes[0]["title"], "New message from Bea");
        assert_eq!(notes[0]["data"]["chat_id"], json!(chat.id));

        assert_eq!(f.repo.unread_notification_count(&seller).await.unwrap(), 1);
        let none: Vec<String> = Vec::new();
        assert_eq!(f.repo.mark_notifications_as_read(&seller, Some(none.as_slice())).await.unwrap(), 0);
        assert_eq!(f.repo.mark_notifications_as_read(&seller, None).await.unwrap(), 1);
        assert_eq!(f.repo.unread_notification_count(&seller).await.unwrap(), 0);
    }
}
