use serde_json::json;

use super::{single, Database};
use crate::errors::AppError;
use crate::models::{NewOrder, NewReview, Order, OrderStatus, Review};
use crate::query::Direction;

impl Database {
    // Orders

    /// Place an order. It always starts out pending.
    pub async fn create_order(&self, order: &NewOrder) -> Result<Order, AppError> {
        if order.quantity < 1 {
            return Err(AppError::Validation("Quantity must be at least 1".to_string()));
        }
        if !order.total_amount.is_finite() || order.total_amount < 0.0 {
            return Err(AppError::Validation("Total must be zero or more".to_string()));
        }
        let me = self.backend.require_user().await?;
        if me.id == order.seller_id {
            return Err(AppError::Validation(
                "You cannot order your own listing".to_string(),
            ));
        }

        let rows = self.backend.from("orders").insert(order).await?;
        let created: Order = single(rows, "Order")?;
        tracing::info!("Placed order {} for product {}", created.id, created.product_id);
        Ok(created)
    }

    pub async fn get_order(&self, order_id: &str) -> Result<Option<Order>, AppError> {
        self.backend
            .from("orders")
            .eq("id", order_id)
            .fetch_optional()
            .await
    }

    /// Orders the signed-in user placed, newest first.
    pub async fn buyer_orders(&self) -> Result<Vec<Order>, AppError> {
        let me = self.backend.require_user().await?;
        self.backend
            .from("orders")
            .eq("buyer_id", &me.id)
            .order("created_at", Direction::Desc)
            .fetch()
            .await
    }

    /// Orders for the signed-in user's listings, newest first.
    pub async fn seller_orders(&self) -> Result<Vec<Order>, AppError> {
        let me = self.backend.require_user().await?;
        self.backend
            .from("orders")
            .eq("seller_id", &me.id)
            .order("created_at", Direction::Desc)
            .fetch()
            .await
    }

    /// Move an order along its lifecycle. The backend checks who may do it.
    pub async fn update_order_status(
        &self,
        order_id: &str,
        status: OrderStatus,
    ) -> Result<Order, AppError> {
        self.backend.require_user().await?;
        self.backend
            .rpc(
                "update_order_status",
                &json!({ "order_id": order_id, "new_status": status }),
            )
            .await
    }

    pub async fn cancel_order(&self, order_id: &str) -> Result<Order, AppError> {
        self.update_order_status(order_id, OrderStatus::Cancelled)
            .await
    }

    // Reviews

    pub async fn product_reviews(&self, product_id: &str) -> Result<Vec<Review>, AppError> {
        self.backend
            .from("product_reviews")
            .eq("product_id", product_id)
            .order("created_at", Direction::Desc)
            .fetch()
            .await
    }

    pub async fn seller_reviews(&self, seller_id: &str) -> Result<Vec<Review>, AppError> {
        self.backend
            .from("product_reviews")
            .eq("seller_id", seller_id)
            .order("created_at", Direction::Desc)
            .fetch()
            .await
    }

    pub async fn create_review(&self, review: &NewReview) -> Result<Review, AppError> {
        if !(1..=5).contains(&review.rating) {
            return Err(AppError::Validation(
                "Rating must be between 1 and 5".to_string(),
            ));
        }
        self.backend.require_user().await?;
        let rows = self.backend.from("product_reviews").insert(review).await?;
        single(rows, "Review")
    }
}
