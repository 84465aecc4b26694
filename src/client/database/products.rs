use std::collections::HashMap;

use serde_json::json;

use super::{require_text, single, Database};
use crate::client::backend::ConflictMode;
use crate::client::optimistic::Optimistic;
use crate::errors::{log_ignored, AppError};
use crate::models::{
    HomeFeed, NewProduct, Product, ProductFilter, ProductStatus, ProductUpdate, SavedProduct,
    SearchParams,
};
use crate::query::Direction;

const DEFAULT_PAGE_SIZE: i64 = 20;
const HOME_LIST_SIZE: i64 = 10;

impl Database {
    /// Listings matching a filter, newest first. Only active listings unless
    /// the filter asks for the rest.
    pub async fn list_products(&self, filter: &ProductFilter) -> Result<Vec<Product>, AppError> {
        let mut query = self.backend.from("products");
        if !filter.include_unavailable {
            query = query.eq("status", ProductStatus::Active.as_str());
        }
        if let Some(category) = &filter.category {
            query = query.eq("category", category);
        }
        if let Some(seller_id) = &filter.seller_id {
            query = query.eq("seller_id", seller_id);
        }
        if let Some(condition) = filter.condition {
            query = query.eq("condition", condition.as_str());
        }
        if let Some(min) = filter.min_price {
            query = query.gte("price", min);
        }
        if let Some(max) = filter.max_price {
            query = query.lte("price", max);
        }

        query
            .order("created_at", Direction::Desc)
            .limit(filter.limit.unwrap_or(DEFAULT_PAGE_SIZE))
            .offset(filter.offset.unwrap_or(0))
            .fetch()
            .await
    }

    pub async fn get_product(&self, product_id: &str) -> Result<Option<Product>, AppError> {
        self.backend
            .from("products")
            .eq("id", product_id)
            .fetch_optional()
            .await
    }

    pub async fn create_product(&self, product: &NewProduct) -> Result<Product, AppError> {
        require_text(&product.title, "Title")?;
        require_text(&product.category, "Category")?;
        if !product.price.is_finite() || product.price < 0.0 {
            return Err(AppError::Validation("Price must be zero or more".to_string()));
        }
        self.backend.require_user().await?;

        let rows = self.backend.from("products").insert(product).await?;
        let created: Product = single(rows, "Product")?;
        tracing::info!("Listed product {}", created.id);
        Ok(created)
    }

    pub async fn update_product(
        &self,
        product_id: &str,
        update: &ProductUpdate,
    ) -> Result<Product, AppError> {
        if update.price.is_some_and(|p| !p.is_finite() || p < 0.0) {
            return Err(AppError::Validation("Price must be zero or more".to_string()));
        }
        self.backend.require_user().await?;
        let rows = self
            .backend
            .from("products")
            .eq("id", product_id)
            .update(update)
            .await?;
        single(rows, "Product")
    }

    pub async fn delete_product(&self, product_id: &str) -> Result<(), AppError> {
        self.backend.require_user().await?;
        let deleted: Vec<Product> = self
            .backend
            .from("products")
            .eq("id", product_id)
            .delete()
            .await?;
        if deleted.is_empty() {
            return Err(AppError::NotFound(format!("Product {} not found", product_id)));
        }
        Ok(())
    }

    /// Every listing of a seller, including reserved and sold ones.
    pub async fn seller_products(&self, seller_id: &str) -> Result<Vec<Product>, AppError> {
        self.backend
            .from("products")
            .eq("seller_id", seller_id)
            .order("created_at", Direction::Desc)
            .fetch()
            .await
    }

    pub async fn search_products(&self, params: &SearchParams) -> Result<Vec<Product>, AppError> {
        self.backend.rpc("search_products", params).await
    }

    pub async fn trending_products(&self, limit: i64) -> Result<Vec<Product>, AppError> {
        self.backend
            .rpc("get_trending_products", &json!({ "limit_count": limit }))
            .await
    }

    pub async fn flash_deals(&self, limit: i64) -> Result<Vec<Product>, AppError> {
        self.backend
            .rpc("get_flash_deals", &json!({ "limit_count": limit }))
            .await
    }

    pub async fn featured_products(&self, limit: i64) -> Result<Vec<Product>, AppError> {
        self.backend
            .from("products")
            .eq("status", ProductStatus::Active.as_str())
            .eq("is_featured", true)
            .order("created_at", Direction::Desc)
            .limit(limit)
            .fetch()
            .await
    }

    async fn recent_products(&self, limit: i64) -> Result<Vec<Product>, AppError> {
        self.list_products(&ProductFilter {
            limit: Some(limit),
            ..Default::default()
        })
        .await
    }

    /// Count a product view. Failures are logged and ignored.
    pub async fn increment_view_count(&self, product_id: &str) {
        log_ignored(
            "View count",
            self.backend
                .rpc::<_, i64>("increment_view_count", &json!({ "product_id": product_id }))
                .await,
        );
    }

    /// The four home screen lists, fetched concurrently.
    pub async fn load_home_feed(&self) -> Result<HomeFeed, AppError> {
        let (featured, trending, flash_deals, recent) = tokio::join!(
            self.featured_products(HOME_LIST_SIZE),
            self.trending_products(HOME_LIST_SIZE),
            self.flash_deals(HOME_LIST_SIZE),
            self.recent_products(DEFAULT_PAGE_SIZE),
        );
        Ok(HomeFeed {
            featured: featured?,
            trending: trending?,
            flash_deals: flash_deals?,
            recent: recent?,
        })
    }

    // Saved products

    pub async fn is_saved(&self, product_id: &str) -> Result<bool, AppError> {
        let me = self.backend.require_user().await?;
        let row: Option<SavedProduct> = self
            .backend
            .from("saved_products")
            .eq("user_id", &me.id)
            .eq("product_id", product_id)
            .fetch_optional()
            .await?;
        Ok(row.is_some())
    }

    /// Save a product. Saving it again changes nothing.
    pub async fn save_product(&self, product_id: &str) -> Result<(), AppError> {
        let me = self.backend.require_user().await?;
        let _: Vec<SavedProduct> = self
            .backend
            .from("saved_products")
            .upsert(
                &json!({ "user_id": me.id, "product_id": product_id }),
                &["user_id", "product_id"],
                ConflictMode::IgnoreDuplicates,
            )
            .await?;
        Ok(())
    }

    /// Remove a saved product. Nothing happens when it was not saved.
    pub async fn unsave_product(&self, product_id: &str) -> Result<(), AppError> {
        let me = self.backend.require_user().await?;
        let _: Vec<SavedProduct> = self
            .backend
            .from("saved_products")
            .eq("user_id", &me.id)
            .eq("product_id", product_id)
            .delete()
            .await?;
        Ok(())
    }

    /// Flip the saved flag. The new value shows at once through
    /// [`Database::saved_flag`] and is rolled back if the server refuses.
    pub async fn toggle_saved(&self, product_id: &str) -> Result<bool, AppError> {
        let current = match self.saved_flag(product_id).await {
            Some(saved) => saved,
            None => self.is_saved(product_id).await?,
        };
        let wanted = !current;

        self.saved
            .write()
            .await
            .entry(product_id.to_string())
            .or_insert_with(|| Optimistic::new(current))
            .apply(wanted);

        let result = if wanted {
            self.save_product(product_id).await
        } else {
            self.unsave_product(product_id).await
        };

        let mut saved = self.saved.write().await;
        if let Some(flag) = saved.get_mut(product_id) {
            match &result {
                Ok(()) => flag.confirm(),
                Err(_) => flag.rollback(),
            }
        }
        result.map(|_| wanted)
    }

    /// Locally known saved flag, including an unconfirmed toggle.
    pub async fn saved_flag(&self, product_id: &str) -> Option<bool> {
        self.saved
            .read()
            .await
            .get(product_id)
            .map(|flag| *flag.current())
    }

    /// Saved listings, most recently saved first.
    pub async fn saved_products(&self) -> Result<Vec<Product>, AppError> {
        let me = self.backend.require_user().await?;
        let saved: Vec<SavedProduct> = self
            .backend
            .from("saved_products")
            .eq("user_id", &me.id)
            .order("created_at", Direction::Desc)
            .fetch()
            .await?;
        if saved.is_empty() {
            return Ok(Vec::new());
        }

        let products: Vec<Product> = self
            .backend
            .from("products")
            .is_in("id", saved.iter().map(|s| s.product_id.as_str()))
            .fetch()
            .await?;
        let mut by_id: HashMap<String, Product> =
            products.into_iter().map(|p| (p.id.clone(), p)).collect();

        Ok(saved
            .iter()
            .filter_map(|s| by_id.remove(&s.product_id))
            .collect())
    }
}
